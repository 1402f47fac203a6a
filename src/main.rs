use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use mobsmith::cli::{CliOptions, Command, SharedOptions, StyleOptions};
use mobsmith::config::{ModelConfig, setup_logging};
use mobsmith::frame::FrameLibrary;
use mobsmith::generation::GenerationClient;
use mobsmith::http::HttpSettings;
use mobsmith::prompt::StyleParameters;
use mobsmith::storage::{
    AzureBlobStore, BlobStore, LocalBlobStore, Publisher, signed_url_deadline,
};
use mobsmith::vision::{FaceDescriber, VisionClient};
use mobsmith::web::AppState;
use mobsmith::workflow::{CharacterRequest, CharacterResult, CharacterSource, Stage, Workflow};
use tracing::{error, info, warn};

fn http_settings(shared: &SharedOptions) -> HttpSettings {
    HttpSettings {
        timeout: Duration::from_secs(shared.http_timeout_secs),
        max_retries: shared.http_max_retries,
    }
}

/// Local store for `serve` and as the fallback when Azure isn't configured.
fn local_store(shared: &SharedOptions) -> LocalBlobStore {
    let store = LocalBlobStore::new(&shared.storage_dir, shared.public_url.clone());
    match &shared.signing_key {
        Some(key) => store.with_signing_key(key),
        None => store,
    }
}

fn publisher(shared: &SharedOptions, settings: &HttpSettings) -> anyhow::Result<Publisher> {
    let expiry = Duration::from_secs(shared.signed_url_expiry_secs);
    if shared.sign_urls {
        signed_url_deadline(expiry).context("Invalid MOBSMITH_SIGNED_URL_EXPIRY_SECS")?;
    }
    let store: Arc<dyn BlobStore> = match &shared.azure_connection_string {
        Some(connection_string) => Arc::new(
            AzureBlobStore::from_connection_string(connection_string, settings)
                .context("Invalid AZURE_STORAGE_CONNECTION_STRING")?,
        ),
        None => Arc::new(local_store(shared)),
    };
    let publisher = Publisher::new(store);
    Ok(if shared.sign_urls {
        publisher.with_signed_urls(expiry)
    } else {
        publisher
    })
}

fn describer(shared: &SharedOptions, settings: &HttpSettings) -> anyhow::Result<VisionClient> {
    let config = ModelConfig::from_env(&shared.vision_model)
        .context("Vision model is not configured")?;
    Ok(VisionClient::new(config, settings)?)
}

fn workflow(shared: &SharedOptions, with_vision: bool) -> anyhow::Result<Workflow> {
    let settings = http_settings(shared);
    let generation = ModelConfig::from_env(&shared.generation_model)
        .context("Image generation model is not configured")?;
    let workflow = Workflow::new(
        Arc::new(GenerationClient::new(generation, &settings)?),
        publisher(shared, &settings)?,
        FrameLibrary::new(&shared.frames_dir),
    );
    Ok(if with_vision {
        workflow.with_describer(Arc::new(describer(shared, &settings)?))
    } else {
        workflow
    })
}

fn style_parameters(style: &StyleOptions) -> StyleParameters {
    StyleParameters {
        style: style.style,
        biome: style.biome,
        frame: style.frame.clone(),
    }
}

fn print_stage(stage: Stage) {
    info!("{}", stage);
}

fn write_outputs(out: &Path, result: &CharacterResult) -> anyhow::Result<()> {
    std::fs::create_dir_all(out)
        .with_context(|| format!("Failed to create {}", out.display()))?;
    for (name, bytes) in [
        ("character.png", &result.image),
        ("scan_code.png", &result.scan_code),
    ] {
        let path = out.join(name);
        std::fs::write(&path, bytes)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Wrote {}", path.display());
    }
    Ok(())
}

async fn create_character(
    shared: &SharedOptions,
    source: CharacterSource,
    style: &StyleOptions,
) -> anyhow::Result<()> {
    let with_vision = matches!(source, CharacterSource::Photo(_));
    let workflow = workflow(shared, with_vision)?;
    let request = CharacterRequest {
        source,
        params: style_parameters(style),
    };
    let result = workflow.run(request, Some(&print_stage)).await?;
    write_outputs(&style.out, &result)?;
    if with_vision {
        println!("Description: {}", result.description);
    }
    println!("{}", result.artifact.url);
    Ok(())
}

async fn run(cli: CliOptions) -> anyhow::Result<()> {
    let shared = &cli.shared;
    match &cli.command {
        Command::Generate { description, style } => {
            create_character(shared, CharacterSource::Description(description.clone()), style)
                .await
        }
        Command::Photo { photo, style } => {
            let bytes = std::fs::read(photo)
                .with_context(|| format!("Failed to read {}", photo.display()))?;
            create_character(shared, CharacterSource::Photo(bytes), style).await
        }
        Command::Describe { photo } => {
            let bytes = std::fs::read(photo)
                .with_context(|| format!("Failed to read {}", photo.display()))?;
            let description = describer(shared, &http_settings(shared))?
                .describe_face(&bytes)
                .await?;
            println!("{description}");
            Ok(())
        }
        Command::Serve {
            port,
            listen_address,
        } => {
            let workflow = match describer(shared, &http_settings(shared)) {
                Ok(describer) => workflow(shared, false)?.with_describer(Arc::new(describer)),
                Err(err) => {
                    warn!("Photo uploads are disabled: {:#}", err);
                    workflow(shared, false)?
                }
            };
            let local = shared
                .azure_connection_string
                .is_none()
                .then(|| local_store(shared));
            mobsmith::web::setup_server(listen_address, *port, AppState::new(workflow, local))
                .await
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    if let Err(err) = dotenvy::dotenv()
        && !err.not_found()
    {
        eprintln!("Failed to load .env: {err}");
    }

    let cli = CliOptions::parse();

    if let Err(err) = setup_logging(cli.debug) {
        eprintln!("Failed to set up logging: {err}");
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}
