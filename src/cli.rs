//! CLI parser
use clap::{Args, Parser, Subcommand};
use std::num::NonZeroU16;
use std::path::PathBuf;

use crate::constants::{
    DEFAULT_HTTP_MAX_RETRIES, DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_SIGNED_URL_EXPIRY_SECS, FRAMES_DIR,
};
use crate::prompt::{Biome, Style};

#[derive(Parser, Debug)]
#[command(version, about = "Turns a description or a photo into a published character image")]
/// CLI Options
pub struct CliOptions {
    #[clap(long, help = "Enable debug logging", env = "MOBSMITH_DEBUG", global = true)]
    /// Enable debug logging. Env: MOBSMITH_DEBUG
    pub debug: bool,

    #[command(flatten)]
    /// Settings every command shares
    pub shared: SharedOptions,

    #[command(subcommand)]
    /// What to do
    pub command: Command,
}

/// Models, storage and transport settings.
#[derive(Args, Debug, Clone)]
pub struct SharedOptions {
    #[clap(
        long,
        default_value_os_t = FRAMES_DIR.clone(),
        env = "MOBSMITH_FRAMES_DIR",
        global = true
    )]
    /// Directory holding `<name>.png` frames and optional `<name>.json` metadata.
    /// Env: MOBSMITH_FRAMES_DIR
    pub frames_dir: PathBuf,

    #[clap(long, default_value = "dalle", env = "MOBSMITH_GENERATION_MODEL", global = true)]
    /// Model id used for image generation. Env: MOBSMITH_GENERATION_MODEL
    pub generation_model: String,

    #[clap(long, default_value = "mistral", env = "MOBSMITH_VISION_MODEL", global = true)]
    /// Model id used to describe photos. Env: MOBSMITH_VISION_MODEL
    pub vision_model: String,

    #[clap(long, env = "AZURE_STORAGE_CONNECTION_STRING", hide_env_values = true, global = true)]
    /// Publish to Azure Blob Storage instead of the local store.
    /// Env: AZURE_STORAGE_CONNECTION_STRING
    pub azure_connection_string: Option<String>,

    #[clap(long, default_value = "./blobs", env = "MOBSMITH_STORAGE_DIR", global = true)]
    /// Local store directory. Env: MOBSMITH_STORAGE_DIR
    pub storage_dir: PathBuf,

    #[clap(
        long,
        default_value = "http://127.0.0.1:9000/",
        env = "MOBSMITH_PUBLIC_URL",
        global = true
    )]
    /// Base URL local-store links are built on, normally where `serve` listens.
    /// Env: MOBSMITH_PUBLIC_URL
    pub public_url: url::Url,

    #[clap(long, env = "MOBSMITH_SIGNING_KEY", hide_env_values = true, global = true)]
    /// Secret for signing local-store URLs. Env: MOBSMITH_SIGNING_KEY
    pub signing_key: Option<String>,

    #[clap(long, env = "MOBSMITH_SIGN_URLS", global = true)]
    /// Hand out signed, expiring URLs. Env: MOBSMITH_SIGN_URLS
    pub sign_urls: bool,

    #[clap(
        long,
        default_value_t = DEFAULT_SIGNED_URL_EXPIRY_SECS,
        env = "MOBSMITH_SIGNED_URL_EXPIRY_SECS",
        global = true
    )]
    /// Lifetime of signed URLs in seconds. Env: MOBSMITH_SIGNED_URL_EXPIRY_SECS
    pub signed_url_expiry_secs: u64,

    #[clap(
        long,
        default_value_t = DEFAULT_HTTP_TIMEOUT_SECS,
        env = "MOBSMITH_HTTP_TIMEOUT_SECS",
        global = true
    )]
    /// Per-call timeout for model and storage requests. Env: MOBSMITH_HTTP_TIMEOUT_SECS
    pub http_timeout_secs: u64,

    #[clap(
        long,
        default_value_t = DEFAULT_HTTP_MAX_RETRIES,
        env = "MOBSMITH_HTTP_MAX_RETRIES",
        global = true
    )]
    /// Retries for connection errors, 429 and 5xx. Env: MOBSMITH_HTTP_MAX_RETRIES
    pub http_max_retries: u32,
}

/// Look of the character.
#[derive(Args, Debug, Clone)]
pub struct StyleOptions {
    #[clap(long, value_enum, default_value_t = Style::Minecraft)]
    /// Character style
    pub style: Style,
    #[clap(long, value_enum, default_value_t = Biome::Forest)]
    /// Scene for Minecraft characters
    pub biome: Biome,
    #[clap(long)]
    /// Frame name from the frames directory
    pub frame: Option<String>,
    #[clap(long, default_value = ".")]
    /// Where `character.png` and `scan_code.png` are written
    pub out: PathBuf,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Generate a character from a text description
    Generate {
        #[clap(long, short)]
        /// What the character looks like
        description: String,
        #[command(flatten)]
        /// Style options
        style: StyleOptions,
    },
    /// Print the vision model's description of a photo
    Describe {
        #[clap(long)]
        /// JPEG or PNG photo of a face
        photo: PathBuf,
    },
    /// Generate a character from a photo
    Photo {
        #[clap(long)]
        /// JPEG or PNG photo of a face
        photo: PathBuf,
        #[command(flatten)]
        /// Style options
        style: StyleOptions,
    },
    /// Run the HTTP API and local blob host
    Serve {
        #[clap(long, short, default_value = "9000", env = "MOBSMITH_PORT")]
        /// http listener, defaults to `9000`.
        /// Env: MOBSMITH_PORT
        port: NonZeroU16,
        #[clap(
            long,
            short,
            default_value = "127.0.0.1",
            env = "MOBSMITH_LISTEN_ADDRESS"
        )]
        /// Listen address, defaults to `127.0.0.1`.
        /// Env: MOBSMITH_LISTEN_ADDRESS
        listen_address: String,
    },
}
