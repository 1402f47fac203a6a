//! Config handling

use std::fmt;
use std::str::FromStr;

use tracing::log::LevelFilter;

use crate::error::MobsmithError;

/// Sets up logging based on the debug flag
pub fn setup_logging(debug: bool) -> Result<(), Box<std::io::Error>> {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut logger = simple_logger::SimpleLogger::new().with_level(level);
    if !debug {
        logger = logger
            .with_module_level("tracing", LevelFilter::Warn)
            .with_module_level("rustls", LevelFilter::Info)
            .with_module_level("hyper_util", LevelFilter::Info)
            .with_module_level("reqwest", LevelFilter::Info)
            .with_module_level("h2", LevelFilter::Info);
    }
    logger.init().map_err(|err| {
        eprintln!("Failed to initialize logger: {}", err);
        Box::new(std::io::Error::other(err))
    })
}

/// Which wire dialect a model endpoint speaks.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ApiType {
    /// Azure OpenAI / Azure AI inference, `api-key` header and `api-version` query.
    #[default]
    Azure,
    /// Plain OpenAI, bearer auth and the deployment sent as `model`.
    OpenAi,
}

impl FromStr for ApiType {
    type Err = MobsmithError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "azure" | "azure_ad" | "azure_openai" => Ok(ApiType::Azure),
            "openai" | "open_ai" => Ok(ApiType::OpenAi),
            other => Err(MobsmithError::Configuration(format!(
                "unknown API type '{other}', expected 'azure' or 'openai'"
            ))),
        }
    }
}

/// What a registered model id is used for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModelKind {
    /// Text-to-image generation
    ImageGeneration,
    /// Chat completions with image input
    ChatVision,
}

/// model id, environment prefix, kind
const MODEL_TABLE: &[(&str, &str, ModelKind)] = &[
    ("dalle", "AZURE_DALLE", ModelKind::ImageGeneration),
    ("gpt4o_1", "AZURE_GPT4O_1", ModelKind::ChatVision),
    ("mistral", "AZURE_MISTRAL", ModelKind::ChatVision),
];

/// Names of the environment variables holding one model's settings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModelEnvKeys {
    /// Service base URL
    pub endpoint: String,
    /// Credential
    pub api_key: String,
    /// `api-version` query value
    pub api_version: String,
    /// Deployment (Azure) or model (OpenAI) name
    pub deployment_name: String,
    /// `azure` or `openai`
    pub api_type: String,
}

impl ModelEnvKeys {
    fn with_prefix(prefix: &str) -> Self {
        Self {
            endpoint: format!("{prefix}_ENDPOINT"),
            api_key: format!("{prefix}_API_KEY"),
            api_version: format!("{prefix}_API_VERSION"),
            deployment_name: format!("{prefix}_DEPLOYMENT_NAME"),
            api_type: format!("{prefix}_API_TYPE"),
        }
    }

    /// Variables that must be set for a model of this kind.
    fn required(&self, kind: ModelKind) -> Vec<&str> {
        match kind {
            ModelKind::ImageGeneration => vec![
                self.endpoint.as_str(),
                self.api_key.as_str(),
                self.api_version.as_str(),
                self.deployment_name.as_str(),
                self.api_type.as_str(),
            ],
            ModelKind::ChatVision => vec![
                self.endpoint.as_str(),
                self.api_key.as_str(),
                self.deployment_name.as_str(),
            ],
        }
    }
}

/// Looks up the environment keys for a model id.
pub fn env_variable_keys(model_id: &str) -> Result<(ModelEnvKeys, ModelKind), MobsmithError> {
    MODEL_TABLE
        .iter()
        .find(|(id, _, _)| *id == model_id)
        .map(|(_, prefix, kind)| (ModelEnvKeys::with_prefix(prefix), *kind))
        .ok_or_else(|| {
            let known: Vec<&str> = MODEL_TABLE.iter().map(|(id, _, _)| *id).collect();
            MobsmithError::Configuration(format!(
                "unknown model id '{model_id}', known ids: {}",
                known.join(", ")
            ))
        })
}

/// Endpoint and credentials for one model, validated on construction.
#[derive(Clone)]
pub struct ModelConfig {
    /// Id from the model table
    pub model_id: String,
    /// What the model is registered for
    pub kind: ModelKind,
    /// Base URL of the service
    pub endpoint: String,
    /// Credential
    pub api_key: String,
    /// `api-version` query value
    pub api_version: Option<String>,
    /// Deployment or model name
    pub deployment_name: String,
    /// Wire dialect
    pub api_type: ApiType,
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("model_id", &self.model_id)
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .field("api_version", &self.api_version)
            .field("deployment_name", &self.deployment_name)
            .field("api_type", &self.api_type)
            .finish()
    }
}

impl ModelConfig {
    /// Reads the model's settings from the process environment.
    pub fn from_env(model_id: &str) -> Result<Self, MobsmithError> {
        Self::from_lookup(model_id, |key| std::env::var(key).ok())
    }

    /// Reads the model's settings through `lookup`, failing with every missing key named.
    pub fn from_lookup<F>(model_id: &str, lookup: F) -> Result<Self, MobsmithError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (keys, kind) = env_variable_keys(model_id)?;
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let missing: Vec<&str> = keys
            .required(kind)
            .into_iter()
            .filter(|key| get(*key).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(MobsmithError::Configuration(format!(
                "Missing environment variables for model '{model_id}': {}",
                missing.join(", ")
            )));
        }

        let api_type = match get(&keys.api_type) {
            Some(value) => value.parse()?,
            None => ApiType::default(),
        };

        Ok(Self {
            model_id: model_id.to_string(),
            kind,
            endpoint: get(&keys.endpoint).unwrap_or_default(),
            api_key: get(&keys.api_key).unwrap_or_default(),
            api_version: get(&keys.api_version),
            deployment_name: get(&keys.deployment_name).unwrap_or_default(),
            api_type,
        })
    }
}
