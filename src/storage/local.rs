//! Filesystem-backed blob store, served by the `/blobs` route.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;
use url::Url;

use super::{BlobStore, signed_url_deadline, validate_blob_key, validate_container_name};
use crate::error::MobsmithError;

type HmacSha256 = Hmac<Sha256>;

/// Query parameter carrying the unix expiry of a signed URL.
pub const EXPIRY_PARAM: &str = "se";
/// Query parameter carrying the hex HMAC of a signed URL.
pub const SIGNATURE_PARAM: &str = "sig";

/// Stores blobs as `<root>/<container>/<key>`.
#[derive(Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    public_url: Url,
    signing_key: Option<Vec<u8>>,
}

impl std::fmt::Debug for LocalBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBlobStore")
            .field("root", &self.root)
            .field("public_url", &self.public_url.as_str())
            .field("signing", &self.signing_key.is_some())
            .finish()
    }
}

impl LocalBlobStore {
    /// Store rooted at `root`, reachable under `public_url`.
    pub fn new(root: impl Into<PathBuf>, mut public_url: Url) -> Self {
        if !public_url.path().ends_with('/') {
            let path = format!("{}/", public_url.path());
            public_url.set_path(&path);
        }
        Self {
            root: root.into(),
            public_url,
            signing_key: None,
        }
    }

    /// Enables signed URLs.
    pub fn with_signing_key(mut self, key: impl AsRef<[u8]>) -> Self {
        self.signing_key = Some(key.as_ref().to_vec());
        self
    }

    /// Whether URLs can be signed, and therefore must be verified when served.
    pub fn signs_urls(&self) -> bool {
        self.signing_key.is_some()
    }

    /// On-disk location of a blob, after validating both names.
    pub fn blob_path(&self, container: &str, key: &str) -> Result<PathBuf, MobsmithError> {
        validate_container_name(container)?;
        validate_blob_key(key)?;
        Ok(self.root.join(container).join(key))
    }

    fn mac(&self, container: &str, key: &str, expiry: i64) -> Result<HmacSha256, MobsmithError> {
        let secret = self
            .signing_key
            .as_deref()
            .ok_or_else(|| MobsmithError::Configuration("no signing key configured".into()))?;
        let mut mac = HmacSha256::new_from_slice(secret)
            .map_err(|err| MobsmithError::Configuration(format!("signing key: {err}")))?;
        mac.update(format!("{container}/{key}\n{expiry}").as_bytes());
        Ok(mac)
    }

    /// Hex HMAC-SHA256 over `container/key\nexpiry`.
    pub fn sign(&self, container: &str, key: &str, expiry: i64) -> Result<String, MobsmithError> {
        Ok(hex::encode(
            self.mac(container, key, expiry)?.finalize().into_bytes(),
        ))
    }

    /// Checks a served request against the signature scheme.
    ///
    /// Without a signing key every request passes.
    pub fn verify(
        &self,
        container: &str,
        key: &str,
        expiry: Option<i64>,
        signature: Option<&str>,
        now: i64,
    ) -> Result<(), MobsmithError> {
        if !self.signs_urls() {
            return Ok(());
        }
        let (Some(expiry), Some(signature)) = (expiry, signature) else {
            return Err(MobsmithError::Forbidden);
        };
        if expiry < now {
            debug!("Signature for {}/{} expired at {}", container, key, expiry);
            return Err(MobsmithError::Forbidden);
        }
        let provided = hex::decode(signature).map_err(|_| MobsmithError::Forbidden)?;
        self.mac(container, key, expiry)?
            .verify_slice(&provided)
            .map_err(|_| MobsmithError::Forbidden)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn ensure_container(&self, container: &str) -> Result<(), MobsmithError> {
        validate_container_name(container)?;
        tokio::fs::create_dir_all(self.root.join(container))
            .await
            .map_err(|err| MobsmithError::PublishFailed(format!("create {container}: {err}")))
    }

    async fn upload_bytes(
        &self,
        container: &str,
        key: &str,
        bytes: &[u8],
    ) -> Result<(), MobsmithError> {
        let path = self.blob_path(container, key)?;
        // readers never see a half-written blob
        let partial = path.with_extension("partial");
        tokio::fs::write(&partial, bytes)
            .await
            .map_err(|err| MobsmithError::PublishFailed(format!("write {key}: {err}")))?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|err| MobsmithError::PublishFailed(format!("rename {key}: {err}")))?;
        debug!("Wrote {}", path.display());
        Ok(())
    }

    fn url(
        &self,
        container: &str,
        key: &str,
        signed_expiry: Option<Duration>,
    ) -> Result<Url, MobsmithError> {
        validate_container_name(container)?;
        validate_blob_key(key)?;
        let mut url = self.public_url.join(&format!("blobs/{container}/{key}"))?;
        match signed_expiry {
            Some(expiry) if self.signs_urls() => {
                let expires_at = signed_url_deadline(expiry)?.timestamp();
                let signature = self.sign(container, key, expires_at)?;
                url.query_pairs_mut()
                    .append_pair(EXPIRY_PARAM, &expires_at.to_string())
                    .append_pair(SIGNATURE_PARAM, &signature);
            }
            Some(_) => debug!("No signing key configured, handing out a plain URL"),
            None => {}
        }
        Ok(url)
    }

    async fn delete_blob(&self, container: &str, key: &str) -> Result<(), MobsmithError> {
        let path = self.blob_path(container, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(MobsmithError::InternalServerError(err.to_string())),
        }
    }
}
