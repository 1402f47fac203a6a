//! Shared constants/defaults for things
//!

use std::path::PathBuf;
use std::sync::LazyLock;

/// The default place we look for frame assets
pub static FRAMES_DIR: LazyLock<PathBuf> = LazyLock::new(|| PathBuf::from("./frames"));

/// Resolution requested from the image generation service.
pub const GENERATED_IMAGE_SIZE: &str = "1024x1024";

/// Per-call timeout for outbound HTTP requests, in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

/// Number of times a failed outbound call is retried.
pub const DEFAULT_HTTP_MAX_RETRIES: u32 = 3;

/// First retry delay, doubled for each following attempt.
pub const RETRY_BASE_DELAY_MS: u64 = 500;

/// Lifetime of a signed blob URL, in seconds.
pub const DEFAULT_SIGNED_URL_EXPIRY_SECS: u64 = 60 * 60;

/// API version used for Azure AI inference chat calls when none is configured.
pub const DEFAULT_CHAT_API_VERSION: &str = "2024-05-01-preview";

/// Azure Blob Storage REST version, also used as the SAS `sv`.
pub const AZURE_STORAGE_API_VERSION: &str = "2021-08-06";

/// Pixels per QR module.
pub const SCAN_CODE_MODULE_PX: u32 = 10;

/// Quiet zone around the QR symbol, in modules.
pub const SCAN_CODE_QUIET_ZONE: u32 = 4;

/// Largest photo accepted by the HTTP API.
pub const MAX_PHOTO_BYTES: usize = 10 * 1024 * 1024;

/// Cache-Control for unsigned blobs. Keys are never reused so the bytes never change.
pub const BLOB_CACHE_CONTROL_PUBLIC: &str = "public, max-age=31536000, immutable";

/// Cache-Control for signed blobs.
pub const BLOB_CACHE_CONTROL_PRIVATE: &str = "private, max-age=300";
