//! Publishing artifacts to an object store.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{info, instrument, warn};
use url::Url;

use crate::error::MobsmithError;
use crate::prompt::Style;

pub mod azure;
pub mod local;

pub use azure::AzureBlobStore;
pub use local::LocalBlobStore;

#[allow(clippy::unwrap_used)]
static CONTAINER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9](?:[a-z0-9]|-[a-z0-9]){2,62}$").unwrap());

#[allow(clippy::unwrap_used)]
static BLOB_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,200}\.[a-z]{2,4}$").unwrap());

/// Azure-compatible container names: lowercase, digits and single dashes, 3-63 chars.
pub fn validate_container_name(name: &str) -> Result<(), MobsmithError> {
    if CONTAINER_NAME.is_match(name) {
        Ok(())
    } else {
        Err(MobsmithError::BadRequest(format!(
            "invalid container name '{name}'"
        )))
    }
}

/// Flat `name.ext` keys only, nothing that could walk out of a container.
pub fn validate_blob_key(key: &str) -> Result<(), MobsmithError> {
    if BLOB_KEY.is_match(key) {
        Ok(())
    } else {
        Err(MobsmithError::BadRequest(format!("invalid blob key '{key}'")))
    }
}

/// When a URL signed now with `expiry` stops working.
///
/// Fails with `Configuration` when the deadline can't be represented.
pub fn signed_url_deadline(expiry: Duration) -> Result<DateTime<Utc>, MobsmithError> {
    chrono::Duration::from_std(expiry)
        .ok()
        .and_then(|expiry| Utc::now().checked_add_signed(expiry))
        .ok_or_else(|| {
            MobsmithError::Configuration(format!(
                "signed URL expiry of {}s is out of range",
                expiry.as_secs()
            ))
        })
}

/// Key-addressed binary storage returning retrievable URLs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Creates the container if it doesn't exist yet.
    async fn ensure_container(&self, container: &str) -> Result<(), MobsmithError>;

    /// Stores `bytes` under `key`, replacing anything already there.
    async fn upload_bytes(
        &self,
        container: &str,
        key: &str,
        bytes: &[u8],
    ) -> Result<(), MobsmithError>;

    /// URL for a blob. With `signed_expiry` the URL is signed and stops working after
    /// that long, if the store has signing configured; otherwise it is plain.
    fn url(
        &self,
        container: &str,
        key: &str,
        signed_expiry: Option<Duration>,
    ) -> Result<Url, MobsmithError>;

    /// Removes a blob. Missing blobs are not an error.
    async fn delete_blob(&self, container: &str, key: &str) -> Result<(), MobsmithError>;
}

/// A blob that has been uploaded and the link handed out for it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublishedArtifact {
    /// Container the blob lives in
    pub container: String,
    /// Unique key, `{prefix}_{hex}.png`
    pub key: String,
    /// Where to fetch it, possibly signed and time-limited
    pub url: Url,
}

/// Fresh key with 128 random bits.
pub fn generate_key(prefix: &str) -> String {
    let random: [u8; 16] = rand::random();
    format!("{prefix}_{}.png", hex::encode(random))
}

/// Uploads artifacts into per-style containers.
#[derive(Clone)]
pub struct Publisher {
    store: Arc<dyn BlobStore>,
    signed_expiry: Option<Duration>,
}

impl Publisher {
    /// Publishes through `store` with plain URLs.
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            signed_expiry: None,
        }
    }

    /// Hands out signed URLs valid for `expiry`.
    pub fn with_signed_urls(mut self, expiry: Duration) -> Self {
        self.signed_expiry = Some(expiry);
        self
    }

    /// Uploads `bytes` under a fresh key in the style's container.
    #[instrument(skip_all, fields(style = %style))]
    pub async fn publish(
        &self,
        bytes: &[u8],
        style: Style,
    ) -> Result<PublishedArtifact, MobsmithError> {
        let container = style.container();
        let key = generate_key(style.key_prefix());
        // nothing is uploaded unless a link can be handed out for it
        let url = self.store.url(container, &key, self.signed_expiry)?;

        self.store.ensure_container(container).await?;
        self.store.upload_bytes(container, &key, bytes).await?;
        info!("Published {}/{} ({} bytes)", container, key, bytes.len());

        Ok(PublishedArtifact {
            container: container.to_string(),
            key,
            url,
        })
    }

    /// Best-effort removal of an artifact whose request failed afterwards.
    pub async fn retract(&self, artifact: &PublishedArtifact) {
        if let Err(err) = self
            .store
            .delete_blob(&artifact.container, &artifact.key)
            .await
        {
            warn!(
                "Failed to retract {}/{}: {}",
                artifact.container, artifact.key, err
            );
        }
    }
}
