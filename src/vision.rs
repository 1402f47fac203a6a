//! Describes a face photo with a vision chat model.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, error, instrument};
use url::Url;

use crate::config::{ApiType, ModelConfig};
use crate::constants::DEFAULT_CHAT_API_VERSION;
use crate::error::MobsmithError;
use crate::http::{HttpSettings, body_snippet, send_with_retries};

const SYSTEM_INSTRUCTION: &str = "Analyze the provided photo of a person and extract:

- Gender (e.g., boy, girl, man, woman, etc.)
- Approximate age
- Facial features (e.g., eye color, shape of eyes, nose, mouth, etc.)
- Hair (e.g., color, length, style, etc.)
- Skin tone
- Any distinguishing marks (e.g., scars, birthmarks, tattoos, etc.)
- Accessories (e.g., glasses, earrings, etc.)

Your answer must be ONLY a single and concise comma separated list of features without additional explanation.

If you don't find some of the features omit them in the answer: Don't say something like 'no visible marks'.";

const USER_INSTRUCTION: &str = "Analyze this facial image";

/// Anything that can turn a face photo into a feature list.
#[async_trait]
pub trait FaceDescriber: Send + Sync {
    /// Describes the person in `image` (JPEG or PNG bytes).
    async fn describe_face(&self, image: &[u8]) -> Result<String, MobsmithError>;
}

#[derive(Deserialize, Debug)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ChatMessage,
}

#[derive(Deserialize, Debug)]
struct ChatMessage {
    content: Option<String>,
}

/// `data:` URL for the photo, PNG when it sniffs as PNG and JPEG otherwise.
pub(crate) fn image_data_url(image: &[u8]) -> String {
    let mime = match image::guess_format(image) {
        Ok(image::ImageFormat::Png) => "image/png",
        _ => "image/jpeg",
    };
    format!(
        "data:{mime};base64,{}",
        general_purpose::STANDARD.encode(image)
    )
}

/// Calls a chat-completions deployment with an inline image.
#[derive(Clone, Debug)]
pub struct VisionClient {
    client: reqwest::Client,
    config: ModelConfig,
    max_retries: u32,
}

impl VisionClient {
    /// Client for the model in `config`.
    pub fn new(config: ModelConfig, settings: &HttpSettings) -> Result<Self, MobsmithError> {
        Ok(Self {
            client: settings.build_client()?,
            config,
            max_retries: settings.max_retries,
        })
    }

    /// Where chat requests are sent.
    pub fn endpoint_url(&self) -> Result<Url, MobsmithError> {
        let base = Url::parse(&format!("{}/", self.config.endpoint.trim_end_matches('/')))?;
        match self.config.api_type {
            ApiType::Azure => {
                let mut url = base.join("chat/completions")?;
                url.query_pairs_mut().append_pair(
                    "api-version",
                    self.config
                        .api_version
                        .as_deref()
                        .unwrap_or(DEFAULT_CHAT_API_VERSION),
                );
                Ok(url)
            }
            ApiType::OpenAi => Ok(base.join("v1/chat/completions")?),
        }
    }

    fn request_body(&self, image: &[u8]) -> Value {
        json!({
            "model": self.config.deployment_name,
            "messages": [
                {"role": "system", "content": SYSTEM_INSTRUCTION},
                {"role": "user", "content": [
                    {"type": "text", "text": USER_INSTRUCTION},
                    {"type": "image_url", "image_url": {"url": image_data_url(image)}},
                ]},
            ],
            "temperature": 0.7,
            "max_tokens": 200,
            "top_p": 1.0,
        })
    }
}

#[async_trait]
impl FaceDescriber for VisionClient {
    #[instrument(skip_all, fields(model = %self.config.model_id, bytes = image.len()))]
    async fn describe_face(&self, image: &[u8]) -> Result<String, MobsmithError> {
        let request = self
            .client
            .post(self.endpoint_url()?)
            .json(&self.request_body(image));
        let request = match self.config.api_type {
            ApiType::Azure => request.header("api-key", &self.config.api_key),
            ApiType::OpenAi => request.bearer_auth(&self.config.api_key),
        };

        let resp = send_with_retries(request, self.max_retries)
            .await
            .map_err(|err| {
                MobsmithError::DescriptionFailed(format!("Request to chat API failed: {err}"))
            })?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(|err| {
            MobsmithError::DescriptionFailed(format!("Failed reading chat API body: {err}"))
        })?;
        if !status.is_success() {
            error!("Chat API error {}: {}", status, body_snippet(&body));
            return Err(MobsmithError::DescriptionFailed(format!(
                "Chat API error {status}: {}",
                body_snippet(&body)
            )));
        }

        let completion: ChatCompletion = serde_json::from_slice(&body).map_err(|err| {
            MobsmithError::DescriptionFailed(format!("Failed to parse chat API JSON: {err}"))
        })?;
        let choice = completion.choices.into_iter().next().ok_or_else(|| {
            MobsmithError::DescriptionFailed("Chat API returned no choices".into())
        })?;
        let description = choice
            .message
            .content
            .map(|content| content.trim().to_string())
            .unwrap_or_default();
        debug!("Description: {description}");
        Ok(description)
    }
}
