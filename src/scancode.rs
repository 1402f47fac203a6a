//! Renders a link as a QR code PNG.

use image::{DynamicImage, GrayImage, Luma};
use qrcode::{Color, EcLevel, QrCode};

use crate::constants::{SCAN_CODE_MODULE_PX, SCAN_CODE_QUIET_ZONE};
use crate::error::MobsmithError;
use crate::frame::encode_png;

const DARK: Luma<u8> = Luma([0]);
const LIGHT: Luma<u8> = Luma([255]);

/// Encodes `url` as a black-on-white QR code at the lowest error correction level,
/// picking the smallest version that fits.
pub fn encode_as_scan_code(url: &str) -> Result<Vec<u8>, MobsmithError> {
    let code = QrCode::with_error_correction_level(url.as_bytes(), EcLevel::L)
        .map_err(|err| MobsmithError::EncodingFailed(err.to_string()))?;

    let modules = u32::try_from(code.width())
        .map_err(|err| MobsmithError::EncodingFailed(err.to_string()))?;
    let colors = code.to_colors();
    let side = (modules + 2 * SCAN_CODE_QUIET_ZONE) * SCAN_CODE_MODULE_PX;

    let image = GrayImage::from_fn(side, side, |x, y| {
        let column = (x / SCAN_CODE_MODULE_PX).checked_sub(SCAN_CODE_QUIET_ZONE);
        let row = (y / SCAN_CODE_MODULE_PX).checked_sub(SCAN_CODE_QUIET_ZONE);
        match (column, row) {
            (Some(column), Some(row)) if column < modules && row < modules => {
                match colors.get((row * modules + column) as usize) {
                    Some(Color::Dark) => DARK,
                    _ => LIGHT,
                }
            }
            _ => LIGHT,
        }
    });

    encode_png(&DynamicImage::ImageLuma8(image))
        .map_err(|err| MobsmithError::EncodingFailed(err.to_string()))
}
