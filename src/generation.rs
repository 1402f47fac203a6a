//! Text-to-image generation client.

use std::io::Cursor;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};
use url::Url;

use crate::config::{ApiType, ModelConfig};
use crate::constants::GENERATED_IMAGE_SIZE;
use crate::error::MobsmithError;
use crate::frame::encode_png;
use crate::http::{HttpSettings, body_snippet, send_with_retries};

/// Anything that can turn a prompt into PNG bytes.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Generates exactly one image for `prompt`.
    async fn generate_image(&self, prompt: &str) -> Result<Vec<u8>, MobsmithError>;
}

/// Request body for the images/generations endpoint
#[derive(Serialize, Debug)]
struct ImagesGenerateRequest<'a> {
    // OpenAI wants the model in the body, Azure has it in the path.
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    prompt: &'a str,
    n: u8,
    size: &'a str,
    response_format: &'a str,
}

#[derive(Deserialize, Debug)]
struct ImagesGenerateResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Deserialize, Debug)]
struct ImageData {
    b64_json: Option<String>,
    url: Option<String>,
    revised_prompt: Option<String>,
}

/// Calls an Azure OpenAI or OpenAI images deployment.
#[derive(Clone, Debug)]
pub struct GenerationClient {
    client: reqwest::Client,
    config: ModelConfig,
    max_retries: u32,
}

impl GenerationClient {
    /// Client for the model in `config`.
    pub fn new(config: ModelConfig, settings: &HttpSettings) -> Result<Self, MobsmithError> {
        Ok(Self {
            client: settings.build_client()?,
            config,
            max_retries: settings.max_retries,
        })
    }

    /// Where generation requests are sent.
    pub fn endpoint_url(&self) -> Result<Url, MobsmithError> {
        let base = Url::parse(&format!("{}/", self.config.endpoint.trim_end_matches('/')))?;
        match self.config.api_type {
            ApiType::Azure => {
                let api_version = self.config.api_version.as_deref().ok_or_else(|| {
                    MobsmithError::Configuration(format!(
                        "model '{}' has no API version",
                        self.config.model_id
                    ))
                })?;
                let mut url = base.join(&format!(
                    "openai/deployments/{}/images/generations",
                    self.config.deployment_name
                ))?;
                url.query_pairs_mut().append_pair("api-version", api_version);
                Ok(url)
            }
            ApiType::OpenAi => Ok(base.join("v1/images/generations")?),
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, MobsmithError> {
        let resp = send_with_retries(self.client.get(url), self.max_retries)
            .await
            .map_err(|err| {
                MobsmithError::GenerationFailed(format!("Failed to download image URL: {err}"))
            })?;
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(|err| {
            MobsmithError::GenerationFailed(format!("Failed to read downloaded image bytes: {err}"))
        })?;
        if !status.is_success() {
            return Err(MobsmithError::GenerationFailed(format!(
                "Image download error {status}"
            )));
        }
        Ok(bytes.to_vec())
    }
}

/// Makes sure what came back is an image, re-encoding anything that isn't already PNG.
pub(crate) fn normalize_to_png(bytes: Vec<u8>) -> Result<Vec<u8>, MobsmithError> {
    let reader = image::ImageReader::new(Cursor::new(&bytes))
        .with_guessed_format()
        .map_err(|err| MobsmithError::GenerationFailed(format!("unreadable image: {err}")))?;
    let format = reader.format();
    if format == Some(image::ImageFormat::Png) {
        return Ok(bytes);
    }
    let image = reader
        .decode()
        .map_err(|err| MobsmithError::GenerationFailed(format!("not an image: {err}")))?;
    debug!("Re-encoding {:?} image as PNG", format);
    encode_png(&image).map_err(|err| MobsmithError::GenerationFailed(err.to_string()))
}

#[async_trait]
impl ImageGenerator for GenerationClient {
    #[instrument(skip_all, fields(model = %self.config.model_id))]
    async fn generate_image(&self, prompt: &str) -> Result<Vec<u8>, MobsmithError> {
        let url = self.endpoint_url()?;
        let req_body = ImagesGenerateRequest {
            model: match self.config.api_type {
                ApiType::OpenAi => Some(self.config.deployment_name.as_str()),
                ApiType::Azure => None,
            },
            prompt,
            n: 1,
            size: GENERATED_IMAGE_SIZE,
            response_format: "url",
        };

        let request = self.client.post(url).json(&req_body);
        let request = match self.config.api_type {
            ApiType::Azure => request.header("api-key", &self.config.api_key),
            ApiType::OpenAi => request.bearer_auth(&self.config.api_key),
        };

        let resp = send_with_retries(request, self.max_retries)
            .await
            .map_err(|err| {
                MobsmithError::GenerationFailed(format!("Request to images API failed: {err}"))
            })?;
        let status = resp.status();
        let resp_bytes = resp.bytes().await.map_err(|err| {
            MobsmithError::GenerationFailed(format!("Failed reading images API body: {err}"))
        })?;
        if !status.is_success() {
            error!("Images API error {}: {}", status, body_snippet(&resp_bytes));
            return Err(MobsmithError::GenerationFailed(format!(
                "Images API error {status}: {}",
                body_snippet(&resp_bytes)
            )));
        }

        let parsed: ImagesGenerateResponse = serde_json::from_slice(&resp_bytes).map_err(|err| {
            MobsmithError::GenerationFailed(format!("Failed to parse images API JSON: {err}"))
        })?;
        let first = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| MobsmithError::GenerationFailed("No image data returned".into()))?;

        if let Some(revised_prompt) = first.revised_prompt {
            debug!("Revised prompt from the service: {revised_prompt}");
        }

        let bytes = if let Some(url) = first.url {
            self.download(&url).await?
        } else if let Some(b64_json) = first.b64_json {
            general_purpose::STANDARD.decode(b64_json).map_err(|err| {
                MobsmithError::GenerationFailed(format!("Failed to base64-decode image: {err}"))
            })?
        } else {
            return Err(MobsmithError::GenerationFailed(
                "Image response missing url and b64_json fields".into(),
            ));
        };

        let png = normalize_to_png(bytes)?;
        info!("Generated image ({} bytes)", png.len());
        Ok(png)
    }
}
