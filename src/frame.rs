//! Composites a generated character into a decorative frame.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, RgbaImage};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::MobsmithError;

/// Size of the transparent opening the subject is stretched into.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
pub struct HoleGeometry {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

/// Sidecar `<name>.json` next to a frame PNG.
#[derive(Debug, Default, Deserialize)]
struct FrameMetadata {
    #[serde(default)]
    hole: Option<HoleGeometry>,
}

/// A frame PNG plus the geometry declared for it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FrameAsset {
    /// PNG with an alpha channel
    pub path: PathBuf,
    /// Centered opening; without one the frame is stretched over the whole subject
    pub hole: Option<HoleGeometry>,
}

impl FrameAsset {
    /// A frame without hole metadata.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            hole: None,
        }
    }

    /// Declares the centered opening of this frame.
    pub fn with_hole(mut self, width: u32, height: u32) -> Self {
        self.hole = Some(HoleGeometry { width, height });
        self
    }
}

/// Resolves frame names against a directory of `<name>.png` files.
#[derive(Clone, Debug)]
pub struct FrameLibrary {
    dir: PathBuf,
}

impl FrameLibrary {
    /// Library rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Finds the frame called `name`, reading its optional sidecar metadata.
    ///
    /// Only the metadata is read here; the PNG itself is opened when compositing, so a
    /// missing PNG still resolves and is handled by [`apply_frame`].
    pub fn resolve(&self, name: &str) -> Result<FrameAsset, MobsmithError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(MobsmithError::FrameUnavailable(format!(
                "invalid frame name '{name}'"
            )));
        }

        let path = self.dir.join(format!("{name}.png"));
        let sidecar = self.dir.join(format!("{name}.json"));
        let metadata = match std::fs::read(&sidecar) {
            Ok(raw) => serde_json::from_slice::<FrameMetadata>(&raw).map_err(|err| {
                MobsmithError::FrameUnavailable(format!(
                    "bad frame metadata {}: {err}",
                    sidecar.display()
                ))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => FrameMetadata::default(),
            Err(err) => {
                return Err(MobsmithError::FrameUnavailable(format!(
                    "can't read {}: {err}",
                    sidecar.display()
                )));
            }
        };

        Ok(FrameAsset {
            path,
            hole: metadata.hole,
        })
    }
}

/// Encodes an image as PNG.
pub(crate) fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut output = Vec::new();
    image.write_to(&mut Cursor::new(&mut output), ImageFormat::Png)?;
    Ok(output)
}

fn load_frame(path: &Path) -> Result<RgbaImage, MobsmithError> {
    let reader = image::ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|err| {
            MobsmithError::FrameUnavailable(format!("can't open {}: {err}", path.display()))
        })?;
    let frame = reader.decode().map_err(|err| {
        MobsmithError::FrameUnavailable(format!("can't decode {}: {err}", path.display()))
    })?;
    Ok(frame.to_rgba8())
}

/// Stretches the frame over the subject, no offset.
fn composite_over(subject: &RgbaImage, frame: &RgbaImage) -> RgbaImage {
    let (width, height) = subject.dimensions();
    let mut output = subject.clone();
    if frame.dimensions() == (width, height) {
        imageops::overlay(&mut output, frame, 0, 0);
    } else {
        let resized = imageops::resize(frame, width, height, FilterType::Lanczos3);
        imageops::overlay(&mut output, &resized, 0, 0);
    }
    output
}

/// Stretches the subject into the hole, centers it on a frame-sized canvas and puts the
/// frame on top.
fn composite_into_hole(
    subject: &RgbaImage,
    frame: &RgbaImage,
    hole: HoleGeometry,
) -> Result<RgbaImage, MobsmithError> {
    let (frame_width, frame_height) = frame.dimensions();
    if hole.width == 0
        || hole.height == 0
        || hole.width > frame_width
        || hole.height > frame_height
    {
        return Err(MobsmithError::FrameUnavailable(format!(
            "hole {}x{} doesn't fit a {}x{} frame",
            hole.width, hole.height, frame_width, frame_height
        )));
    }

    // aspect ratio is deliberately not kept
    let resized = imageops::resize(subject, hole.width, hole.height, FilterType::Lanczos3);
    let mut canvas = RgbaImage::new(frame_width, frame_height);
    let x = (frame_width - hole.width) / 2;
    let y = (frame_height - hole.height) / 2;
    imageops::overlay(&mut canvas, &resized, i64::from(x), i64::from(y));
    imageops::overlay(&mut canvas, frame, 0, 0);
    Ok(canvas)
}

/// Composites `image` with `frame`, surfacing why it couldn't.
pub fn try_apply_frame(image: &[u8], frame: &FrameAsset) -> Result<Vec<u8>, MobsmithError> {
    let subject = image::load_from_memory(image)
        .map_err(|err| MobsmithError::FrameUnavailable(format!("can't decode subject: {err}")))?
        .to_rgba8();
    let frame_image = load_frame(&frame.path)?;

    let composed = match frame.hole {
        Some(hole) => composite_into_hole(&subject, &frame_image, hole)?,
        None => composite_over(&subject, &frame_image),
    };

    let flattened = DynamicImage::ImageRgba8(composed).to_rgb8();
    encode_png(&DynamicImage::ImageRgb8(flattened))
        .map_err(|err| MobsmithError::FrameUnavailable(format!("can't encode result: {err}")))
}

/// Composites `image` with `frame` and returns an opaque PNG.
///
/// Any problem with the frame is logged and the subject comes back unchanged.
pub fn apply_frame(image: &[u8], frame: &FrameAsset) -> Vec<u8> {
    match try_apply_frame(image, frame) {
        Ok(composed) => {
            debug!("Applied frame {}", frame.path.display());
            composed
        }
        Err(err) => {
            warn!("Skipping frame: {}", err);
            image.to_vec()
        }
    }
}
