use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::{
    CACHE_CONTROL, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use axum::http::response::Builder;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use chrono::Utc;
use httpdate::{fmt_http_date, parse_http_date};
use serde::Deserialize;
use tracing::debug;

use super::AppState;
use crate::constants::{BLOB_CACHE_CONTROL_PRIVATE, BLOB_CACHE_CONTROL_PUBLIC};
use crate::error::MobsmithError;

/// Signature parameters of a local-store URL.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct SignatureQuery {
    se: Option<i64>,
    sig: Option<String>,
}

/// Cache headers derived from blob metadata.
#[derive(Clone, Debug)]
pub(crate) struct BlobCacheHeaders {
    cache_control: &'static str,
    etag: Option<HeaderValue>,
    last_modified: Option<HeaderValue>,
    modified_at: Option<SystemTime>,
}

impl BlobCacheHeaders {
    /// Signed blobs must not end up in shared caches.
    pub(crate) fn from_metadata(metadata: &std::fs::Metadata, signed: bool) -> Self {
        let modified = metadata.modified().ok();
        let etag = build_etag(metadata.len(), modified);
        // HTTP dates only carry whole seconds
        let modified_at = modified
            .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
            .map(|since_epoch| UNIX_EPOCH + Duration::from_secs(since_epoch.as_secs()));
        let last_modified =
            modified_at.and_then(|modified| HeaderValue::from_str(&fmt_http_date(modified)).ok());
        Self {
            cache_control: if signed {
                BLOB_CACHE_CONTROL_PRIVATE
            } else {
                BLOB_CACHE_CONTROL_PUBLIC
            },
            etag,
            last_modified,
            modified_at,
        }
    }
}

fn apply_cache_headers(mut builder: Builder, cache: &BlobCacheHeaders) -> Builder {
    builder = builder.header(CACHE_CONTROL, cache.cache_control);
    if let Some(etag) = &cache.etag {
        builder = builder.header(ETAG, etag.clone());
    }
    if let Some(last_modified) = &cache.last_modified {
        builder = builder.header(LAST_MODIFIED, last_modified.clone());
    }
    builder
}

/// Returns true when the request matches a not-modified response.
fn is_not_modified(headers: &HeaderMap, cache: &BlobCacheHeaders) -> bool {
    if let Some(if_none_match) = headers.get(IF_NONE_MATCH) {
        if let Ok(value) = if_none_match.to_str() {
            let value = value.trim();
            if value == "*" {
                return true;
            }
            if let Some(etag) = cache.etag.as_ref().and_then(|value| value.to_str().ok())
                && value.split(',').any(|candidate| candidate.trim() == etag)
            {
                return true;
            }
        }
        return false;
    }

    if let (Some(if_modified_since), Some(modified_at)) =
        (headers.get(IF_MODIFIED_SINCE), cache.modified_at)
        && let Ok(value) = if_modified_since.to_str()
        && let Ok(since) = parse_http_date(value)
        && modified_at <= since
    {
        return true;
    }

    false
}

fn build_etag(size: u64, modified_at: Option<SystemTime>) -> Option<HeaderValue> {
    let suffix = match modified_at {
        Some(modified) => modified
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_nanos().to_string())
            .unwrap_or_else(|_| "0".to_string()),
        None => "0".to_string(),
    };
    HeaderValue::from_str(&format!("W/\"{size}-{suffix}\"")).ok()
}

/// `GET /blobs/{container}/{key}` for the local store.
pub(crate) async fn get_blob_handler(
    State(state): State<AppState>,
    Path((container, key)): Path<(String, String)>,
    Query(query): Query<SignatureQuery>,
    headers: HeaderMap,
) -> Result<Response, MobsmithError> {
    let store = state
        .local_store
        .as_ref()
        .ok_or_else(|| MobsmithError::NotFound("no local blob store".into()))?;
    let path = store.blob_path(&container, &key)?;
    store.verify(
        &container,
        &key,
        query.se,
        query.sig.as_deref(),
        Utc::now().timestamp(),
    )?;

    let metadata = match tokio::fs::metadata(&path).await {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Err(MobsmithError::NotFound(format!("{container}/{key}"))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(MobsmithError::NotFound(format!("{container}/{key}")));
        }
        Err(err) => return Err(err.into()),
    };
    let cache = BlobCacheHeaders::from_metadata(&metadata, store.signs_urls());

    if is_not_modified(&headers, &cache) {
        debug!("{}/{} not modified", container, key);
        return apply_cache_headers(Response::builder().status(StatusCode::NOT_MODIFIED), &cache)
            .body(Body::empty())
            .map_err(MobsmithError::from);
    }

    let bytes = tokio::fs::read(&path).await?;
    apply_cache_headers(Response::builder().status(StatusCode::OK), &cache)
        .header(CONTENT_TYPE, "image/png")
        .body(Body::from(bytes))
        .map_err(MobsmithError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_at(modified_at: SystemTime) -> BlobCacheHeaders {
        BlobCacheHeaders {
            cache_control: BLOB_CACHE_CONTROL_PUBLIC,
            etag: build_etag(10, Some(modified_at)),
            last_modified: HeaderValue::from_str(&fmt_http_date(modified_at)).ok(),
            modified_at: Some(modified_at),
        }
    }

    #[test]
    fn etag_match_is_not_modified() {
        let cache = cache_at(SystemTime::now());
        let mut headers = HeaderMap::new();
        headers.insert(IF_NONE_MATCH, cache.etag.clone().expect("etag"));
        assert!(is_not_modified(&headers, &cache));

        headers.insert(IF_NONE_MATCH, HeaderValue::from_static("W/\"other\""));
        assert!(!is_not_modified(&headers, &cache));
    }

    #[test]
    fn if_modified_since_compares_dates() {
        let modified = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let cache = cache_at(modified);
        let mut headers = HeaderMap::new();
        headers.insert(
            IF_MODIFIED_SINCE,
            HeaderValue::from_str(&fmt_http_date(modified + Duration::from_secs(60)))
                .expect("header"),
        );
        assert!(is_not_modified(&headers, &cache));

        headers.insert(
            IF_MODIFIED_SINCE,
            HeaderValue::from_str(&fmt_http_date(modified - Duration::from_secs(60)))
                .expect("header"),
        );
        assert!(!is_not_modified(&headers, &cache));
    }

    #[test]
    fn echoed_last_modified_is_not_modified() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        file.as_file()
            .set_modified(UNIX_EPOCH + Duration::from_millis(1_700_000_000_500))
            .expect("set mtime");
        let metadata = std::fs::metadata(file.path()).expect("metadata");
        let cache = BlobCacheHeaders::from_metadata(&metadata, false);

        let mut headers = HeaderMap::new();
        headers.insert(
            IF_MODIFIED_SINCE,
            cache.last_modified.clone().expect("last modified"),
        );
        assert!(is_not_modified(&headers, &cache));
    }
}
