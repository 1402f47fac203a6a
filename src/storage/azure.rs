//! Azure Blob Storage over its REST API, authorised with Shared Key.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use sha2::Sha256;
use tracing::{debug, error};
use url::Url;

use super::{BlobStore, signed_url_deadline, validate_blob_key, validate_container_name};
use crate::constants::AZURE_STORAGE_API_VERSION;
use crate::error::MobsmithError;
use crate::http::{HttpSettings, body_snippet, send_with_retries};

type HmacSha256 = Hmac<Sha256>;

/// Parsed `AZURE_STORAGE_CONNECTION_STRING`.
#[derive(Clone)]
pub struct AzureConnection {
    /// Storage account name
    pub account_name: String,
    account_key: Vec<u8>,
    /// Blob service root, always ending in `/`
    pub blob_endpoint: Url,
}

impl std::fmt::Debug for AzureConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureConnection")
            .field("account_name", &self.account_name)
            .field("account_key", &"<redacted>")
            .field("blob_endpoint", &self.blob_endpoint.as_str())
            .finish()
    }
}

impl FromStr for AzureConnection {
    type Err = MobsmithError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts: HashMap<&str, &str> = value
            .split(';')
            .filter_map(|part| part.trim().split_once('='))
            .collect();

        let missing: Vec<&str> = ["AccountName", "AccountKey"]
            .into_iter()
            .filter(|name| parts.get(name).is_none_or(|v| v.is_empty()))
            .collect();
        if !missing.is_empty() {
            return Err(MobsmithError::Configuration(format!(
                "storage connection string is missing {}",
                missing.join(", ")
            )));
        }
        let account_name = parts.get("AccountName").copied().unwrap_or_default();
        let account_key = general_purpose::STANDARD
            .decode(parts.get("AccountKey").copied().unwrap_or_default())
            .map_err(|err| {
                MobsmithError::Configuration(format!("AccountKey is not base64: {err}"))
            })?;

        let endpoint = match parts.get("BlobEndpoint") {
            Some(endpoint) => endpoint.to_string(),
            None => {
                let protocol = parts
                    .get("DefaultEndpointsProtocol")
                    .copied()
                    .unwrap_or("https");
                let suffix = parts
                    .get("EndpointSuffix")
                    .copied()
                    .unwrap_or("core.windows.net");
                format!("{protocol}://{account_name}.blob.{suffix}")
            }
        };
        let mut blob_endpoint = Url::parse(&endpoint)?;
        if !blob_endpoint.path().ends_with('/') {
            let path = format!("{}/", blob_endpoint.path());
            blob_endpoint.set_path(&path);
        }

        Ok(Self {
            account_name: account_name.to_string(),
            account_key,
            blob_endpoint,
        })
    }
}

impl AzureConnection {
    fn hmac_base64(&self, message: &str) -> Result<String, MobsmithError> {
        let mut mac = HmacSha256::new_from_slice(&self.account_key)
            .map_err(|err| MobsmithError::Configuration(format!("AccountKey: {err}")))?;
        mac.update(message.as_bytes());
        Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    fn resource_url(&self, container: &str, key: Option<&str>) -> Result<Url, MobsmithError> {
        let path = match key {
            Some(key) => format!("{container}/{key}"),
            None => container.to_string(),
        };
        Ok(self.blob_endpoint.join(&path)?)
    }

    /// `/account/path` followed by sorted `\nname:value` query parameters.
    fn canonicalized_resource(&self, url: &Url) -> String {
        let mut resource = format!("/{}{}", self.account_name, url.path());
        let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in url.query_pairs() {
            params
                .entry(name.to_ascii_lowercase())
                .or_default()
                .push(value.into_owned());
        }
        for (name, mut values) in params {
            values.sort();
            resource.push_str(&format!("\n{name}:{}", values.join(",")));
        }
        resource
    }

    /// String-to-sign for Shared Key, storage versions 2015-02-21 and later.
    fn string_to_sign(
        &self,
        method: &Method,
        url: &Url,
        content_length: usize,
        content_type: &str,
        ms_headers: &BTreeMap<&str, String>,
    ) -> String {
        let length = if content_length == 0 {
            String::new()
        } else {
            content_length.to_string()
        };
        let canonical_headers: String = ms_headers
            .iter()
            .map(|(name, value)| format!("{name}:{}\n", value.trim()))
            .collect();
        format!(
            "{method}\n\n\n{length}\n\n{content_type}\n\n\n\n\n\n\n{canonical_headers}{}",
            self.canonicalized_resource(url)
        )
    }

    /// Read-only service SAS for one blob.
    fn sas_url(
        &self,
        container: &str,
        key: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Url, MobsmithError> {
        let mut url = self.resource_url(container, Some(key))?;
        let expiry = expires_at.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let protocol = if url.scheme() == "https" {
            "https"
        } else {
            "https,http"
        };
        let canonical = format!("/blob/{}/{container}/{key}", self.account_name);
        // sp, st, se, resource, si, sip, spr, sv, sr, snapshot, ses, rscc, rscd, rsce, rscl, rsct
        let string_to_sign = [
            "r",
            "",
            expiry.as_str(),
            canonical.as_str(),
            "",
            "",
            protocol,
            AZURE_STORAGE_API_VERSION,
            "b",
            "",
            "",
            "",
            "",
            "",
            "",
            "",
        ]
        .join("\n");
        let signature = self.hmac_base64(&string_to_sign)?;
        url.query_pairs_mut()
            .append_pair("sp", "r")
            .append_pair("se", &expiry)
            .append_pair("spr", protocol)
            .append_pair("sv", AZURE_STORAGE_API_VERSION)
            .append_pair("sr", "b")
            .append_pair("sig", &signature);
        Ok(url)
    }
}

/// Blob store backed by an Azure storage account.
#[derive(Clone, Debug)]
pub struct AzureBlobStore {
    client: reqwest::Client,
    connection: AzureConnection,
    max_retries: u32,
}

impl AzureBlobStore {
    /// Store for the account in `connection`.
    pub fn new(connection: AzureConnection, settings: &HttpSettings) -> Result<Self, MobsmithError> {
        Ok(Self {
            client: settings.build_client()?,
            connection,
            max_retries: settings.max_retries,
        })
    }

    /// Store from a raw connection string.
    pub fn from_connection_string(
        connection_string: &str,
        settings: &HttpSettings,
    ) -> Result<Self, MobsmithError> {
        Self::new(connection_string.parse()?, settings)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Vec<u8>,
        content_type: &str,
        extra_headers: &[(&'static str, &str)],
    ) -> Result<(StatusCode, Vec<u8>), String> {
        let mut ms_headers: BTreeMap<&str, String> = BTreeMap::new();
        ms_headers.insert("x-ms-date", httpdate::fmt_http_date(SystemTime::now()));
        ms_headers.insert("x-ms-version", AZURE_STORAGE_API_VERSION.to_string());
        for (name, value) in extra_headers {
            ms_headers.insert(*name, value.to_string());
        }

        let string_to_sign =
            self.connection
                .string_to_sign(&method, &url, body.len(), content_type, &ms_headers);
        let signature = self
            .connection
            .hmac_base64(&string_to_sign)
            .map_err(|err| err.to_string())?;

        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .header(
                "Authorization",
                format!("SharedKey {}:{signature}", self.connection.account_name),
            )
            .header("Content-Length", body.len());
        if !content_type.is_empty() {
            request = request.header("Content-Type", content_type);
        }
        for (name, value) in &ms_headers {
            request = request.header(*name, value);
        }

        let response = send_with_retries(request.body(body), self.max_retries)
            .await
            .map_err(|err| format!("{method} {url} failed: {err}"))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| format!("reading {method} {url} response: {err}"))?;
        Ok((status, bytes.to_vec()))
    }
}

#[async_trait]
impl BlobStore for AzureBlobStore {
    async fn ensure_container(&self, container: &str) -> Result<(), MobsmithError> {
        validate_container_name(container)?;
        let mut url = self.connection.resource_url(container, None)?;
        url.query_pairs_mut().append_pair("restype", "container");

        let (status, body) = self
            .send(Method::PUT, url, Vec::new(), "", &[])
            .await
            .map_err(MobsmithError::PublishFailed)?;
        match status {
            StatusCode::CREATED => {
                debug!("Created container {}", container);
                Ok(())
            }
            StatusCode::CONFLICT => Ok(()),
            other => {
                error!("Container {} creation failed: {}", container, other);
                Err(MobsmithError::PublishFailed(format!(
                    "creating container {container} returned {other}: {}",
                    body_snippet(&body)
                )))
            }
        }
    }

    async fn upload_bytes(
        &self,
        container: &str,
        key: &str,
        bytes: &[u8],
    ) -> Result<(), MobsmithError> {
        validate_container_name(container)?;
        validate_blob_key(key)?;
        let url = self.connection.resource_url(container, Some(key))?;
        let (status, body) = self
            .send(
                Method::PUT,
                url,
                bytes.to_vec(),
                "image/png",
                &[("x-ms-blob-type", "BlockBlob")],
            )
            .await
            .map_err(MobsmithError::PublishFailed)?;
        if status.is_success() {
            Ok(())
        } else {
            Err(MobsmithError::PublishFailed(format!(
                "uploading {container}/{key} returned {status}: {}",
                body_snippet(&body)
            )))
        }
    }

    fn url(
        &self,
        container: &str,
        key: &str,
        signed_expiry: Option<Duration>,
    ) -> Result<Url, MobsmithError> {
        validate_container_name(container)?;
        validate_blob_key(key)?;
        match signed_expiry {
            Some(expiry) => self
                .connection
                .sas_url(container, key, signed_url_deadline(expiry)?),
            None => self.connection.resource_url(container, Some(key)),
        }
    }

    async fn delete_blob(&self, container: &str, key: &str) -> Result<(), MobsmithError> {
        validate_container_name(container)?;
        validate_blob_key(key)?;
        let url = self.connection.resource_url(container, Some(key))?;
        let (status, body) = self
            .send(Method::DELETE, url, Vec::new(), "", &[])
            .await
            .map_err(MobsmithError::InternalServerError)?;
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(MobsmithError::InternalServerError(format!(
                "deleting {container}/{key} returned {status}: {}",
                body_snippet(&body)
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::HeaderMap;
    use axum::routing::put;
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};

    // "secret-key" in base64
    const CONNECTION: &str = "DefaultEndpointsProtocol=https;AccountName=mobsmith;AccountKey=c2VjcmV0LWtleQ==;EndpointSuffix=core.windows.net";

    #[test]
    fn connection_string_parses() {
        let connection: AzureConnection = CONNECTION.parse().expect("parse");
        assert_eq!(connection.account_name, "mobsmith");
        assert_eq!(
            connection.blob_endpoint.as_str(),
            "https://mobsmith.blob.core.windows.net/"
        );
        assert_eq!(connection.account_key, b"secret-key");
        assert!(!format!("{connection:?}").contains("c2VjcmV0"));
    }

    #[test]
    fn explicit_blob_endpoint_wins() {
        let connection: AzureConnection = "AccountName=devstoreaccount1;AccountKey=c2VjcmV0LWtleQ==;BlobEndpoint=http://127.0.0.1:10000/devstoreaccount1"
            .parse()
            .expect("parse");
        assert_eq!(
            connection.blob_endpoint.as_str(),
            "http://127.0.0.1:10000/devstoreaccount1/"
        );
        let url = connection
            .resource_url("images", Some("funko_ab.png"))
            .expect("url");
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:10000/devstoreaccount1/images/funko_ab.png"
        );
    }

    #[test]
    fn missing_account_fields_are_named() {
        let err = "DefaultEndpointsProtocol=https"
            .parse::<AzureConnection>()
            .expect_err("incomplete");
        let message = err.to_string();
        assert!(message.contains("AccountName"));
        assert!(message.contains("AccountKey"));
    }

    #[test]
    fn shared_key_string_to_sign_layout() {
        let connection: AzureConnection = CONNECTION.parse().expect("parse");
        let mut url = connection.resource_url("images", None).expect("url");
        url.query_pairs_mut().append_pair("restype", "container");
        let mut headers = BTreeMap::new();
        headers.insert("x-ms-date", "Fri, 16 Oct 2026 10:00:00 GMT".to_string());
        headers.insert("x-ms-version", AZURE_STORAGE_API_VERSION.to_string());

        let string_to_sign = connection.string_to_sign(&Method::PUT, &url, 0, "", &headers);
        assert_eq!(
            string_to_sign,
            format!(
                "PUT\n\n\n\n\n\n\n\n\n\n\n\nx-ms-date:Fri, 16 Oct 2026 10:00:00 GMT\nx-ms-version:{AZURE_STORAGE_API_VERSION}\n/mobsmith/images\nrestype:container"
            )
        );

        let blob_url = connection
            .resource_url("images", Some("funko_ab.png"))
            .expect("url");
        let string_to_sign =
            connection.string_to_sign(&Method::PUT, &blob_url, 42, "image/png", &headers);
        assert!(string_to_sign.starts_with("PUT\n\n\n42\n\nimage/png\n"));
        assert!(string_to_sign.ends_with("/mobsmith/images/funko_ab.png"));
    }

    #[test]
    fn sas_url_carries_read_only_grant() {
        let connection: AzureConnection = CONNECTION.parse().expect("parse");
        let expires_at = Utc
            .with_ymd_and_hms(2026, 10, 16, 11, 0, 0)
            .single()
            .expect("valid date");
        let url = connection
            .sas_url("minecraft", "minecraft_ab.png", expires_at)
            .expect("sas");
        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(params.get("sp").map(String::as_str), Some("r"));
        assert_eq!(params.get("sr").map(String::as_str), Some("b"));
        assert_eq!(params.get("spr").map(String::as_str), Some("https"));
        assert_eq!(
            params.get("se").map(String::as_str),
            Some("2026-10-16T11:00:00Z")
        );
        assert!(params.contains_key("sig"));
        assert!(
            url.as_str()
                .starts_with("https://mobsmith.blob.core.windows.net/minecraft/minecraft_ab.png?")
        );

        let again = connection
            .sas_url("minecraft", "minecraft_ab.png", expires_at)
            .expect("sas");
        assert_eq!(url, again);
    }

    /// Storage account where containers already exist and blob writes fail.
    async fn busy_account() -> (AzureBlobStore, Arc<Mutex<Vec<String>>>) {
        let authorizations = Arc::new(Mutex::new(Vec::new()));
        let seen = authorizations.clone();
        let record = move |headers: &HeaderMap| {
            let value = headers
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();
            seen.lock().expect("lock").push(value);
        };
        let on_container = record.clone();
        let on_upload = record.clone();
        let on_delete = record;
        let app = Router::new()
            .route(
                "/devstoreaccount1/{container}",
                put(move |headers: HeaderMap| async move {
                    on_container(&headers);
                    StatusCode::CONFLICT
                }),
            )
            .route(
                "/devstoreaccount1/{container}/{key}",
                put(move |headers: HeaderMap| async move {
                    on_upload(&headers);
                    (StatusCode::INTERNAL_SERVER_ERROR, "ServerBusy")
                })
                .delete(move |headers: HeaderMap| async move {
                    on_delete(&headers);
                    StatusCode::NOT_FOUND
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        let settings = HttpSettings {
            max_retries: 0,
            ..HttpSettings::default()
        };
        let store = AzureBlobStore::from_connection_string(
            &format!(
                "AccountName=devstoreaccount1;AccountKey=c2VjcmV0LWtleQ==;BlobEndpoint=http://{addr}/devstoreaccount1"
            ),
            &settings,
        )
        .expect("store");
        (store, authorizations)
    }

    #[tokio::test]
    async fn existing_container_is_fine() {
        let (store, authorizations) = busy_account().await;
        store.ensure_container("images").await.expect("409 is ok");

        let authorizations = authorizations.lock().expect("lock");
        assert_eq!(authorizations.len(), 1);
        assert!(authorizations[0].starts_with("SharedKey devstoreaccount1:"));
    }

    #[tokio::test]
    async fn failed_upload_is_publish_failed() {
        let (store, _) = busy_account().await;
        let err = store
            .upload_bytes("images", "funko_ab.png", b"png")
            .await
            .expect_err("500 should fail");
        let MobsmithError::PublishFailed(message) = err else {
            panic!("expected PublishFailed, got {err:?}");
        };
        assert!(message.contains("500"), "{message}");
        assert!(message.contains("ServerBusy"), "{message}");
    }

    #[tokio::test]
    async fn deleting_a_missing_blob_is_fine() {
        let (store, authorizations) = busy_account().await;
        store
            .delete_blob("images", "funko_ab.png")
            .await
            .expect("404 is ok");
        assert_eq!(authorizations.lock().expect("lock").len(), 1);
    }

    #[test]
    fn unrepresentable_sas_expiry_is_a_configuration_error() {
        let store = AzureBlobStore::from_connection_string(CONNECTION, &HttpSettings::default())
            .expect("store");
        let err = store
            .url(
                "images",
                "funko_ab.png",
                Some(Duration::from_secs(10_000_000_000_000)),
            )
            .expect_err("expiry out of range");
        assert!(matches!(err, MobsmithError::Configuration(_)));
    }
}
