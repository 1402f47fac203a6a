//! HTTP front end for the character workflow.

use std::num::NonZeroU16;
use std::sync::Arc;

use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::constants::MAX_PHOTO_BYTES;
use crate::error::MobsmithError;
use crate::prompt::{Biome, Style, StyleParameters};
use crate::storage::LocalBlobStore;
use crate::workflow::{CharacterRequest, CharacterResult, CharacterSource, Workflow};

mod blobs;

/// Shared by every handler.
#[derive(Clone)]
pub struct AppState {
    workflow: Arc<Workflow>,
    local_store: Option<Arc<LocalBlobStore>>,
}

impl AppState {
    /// State serving `workflow`, plus `/blobs` when artifacts live in a local store.
    pub fn new(workflow: Workflow, local_store: Option<LocalBlobStore>) -> Self {
        Self {
            workflow: Arc::new(workflow),
            local_store: local_store.map(Arc::new),
        }
    }
}

/// Body of `POST /api/characters`.
#[derive(Debug, Deserialize)]
pub struct CreateCharacter {
    /// Free-text description
    #[serde(default)]
    pub description: String,
    /// Style, biome and frame
    #[serde(flatten)]
    pub params: StyleParameters,
}

/// What both character endpoints return.
#[derive(Debug, Deserialize, Serialize)]
pub struct CharacterResponse {
    /// Description the prompt was built from
    pub description: String,
    /// Blob key of the published image
    pub key: String,
    /// Where the image can be fetched
    pub url: String,
    /// Base64 PNG of the final image
    pub image_png: String,
    /// Base64 PNG of the scan code
    pub scan_code_png: String,
}

impl From<CharacterResult> for CharacterResponse {
    fn from(result: CharacterResult) -> Self {
        Self {
            description: result.description,
            key: result.artifact.key,
            url: result.artifact.url.to_string(),
            image_png: general_purpose::STANDARD.encode(result.image),
            scan_code_png: general_purpose::STANDARD.encode(result.scan_code),
        }
    }
}

async fn create_character_handler(
    State(state): State<AppState>,
    Json(body): Json<CreateCharacter>,
) -> Result<Json<CharacterResponse>, MobsmithError> {
    let request = CharacterRequest {
        source: CharacterSource::Description(body.description),
        params: body.params,
    };
    let result = state.workflow.run(request, None).await?;
    Ok(Json(result.into()))
}

fn multipart_error(err: MultipartError) -> MobsmithError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        MobsmithError::PayloadTooLarge(err.body_text())
    } else {
        MobsmithError::BadRequest(err.body_text())
    }
}

async fn field_text(field: Field<'_>) -> Result<String, MobsmithError> {
    field.text().await.map_err(multipart_error)
}

fn parse_choice<T: ValueEnum>(field: &str, value: &str) -> Result<T, MobsmithError> {
    T::from_str(value.trim(), true)
        .map_err(|_| MobsmithError::BadRequest(format!("invalid {field} '{value}'")))
}

async fn create_from_photo_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<CharacterResponse>, MobsmithError> {
    if !state.workflow.accepts_photos() {
        return Err(MobsmithError::Configuration(
            "no vision model configured".into(),
        ));
    }
    let mut photo = None;
    let mut params = StyleParameters::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(multipart_error)?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("photo") => {
                let bytes = field.bytes().await.map_err(multipart_error)?;
                photo = Some(bytes.to_vec());
            }
            Some("style") => {
                params.style = parse_choice::<Style>("style", &field_text(field).await?)?;
            }
            Some("biome") => {
                params.biome = parse_choice::<Biome>("biome", &field_text(field).await?)?;
            }
            Some("frame") => {
                let frame = field_text(field).await?;
                params.frame = (!frame.trim().is_empty()).then(|| frame.trim().to_string());
            }
            _ => {}
        }
    }

    let photo = photo
        .filter(|photo| !photo.is_empty())
        .ok_or_else(|| MobsmithError::BadRequest("missing photo".into()))?;
    let request = CharacterRequest {
        source: CharacterSource::Photo(photo),
        params,
    };
    let result = state.workflow.run(request, None).await?;
    Ok(Json(result.into()))
}

async fn healthz_handler() -> &'static str {
    "ok"
}

/// All routes, ready for state.
pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/api/characters", post(create_character_handler))
        .route(
            "/api/characters/photo",
            post(create_from_photo_handler).layer(DefaultBodyLimit::max(MAX_PHOTO_BYTES)),
        )
        .route("/blobs/{container}/{key}", get(blobs::get_blob_handler))
        .route("/healthz", get(healthz_handler))
        .layer(TraceLayer::new_for_http())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", err);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl-C, shutting down");
}

/// Serves the API until Ctrl-C.
pub async fn setup_server(
    listen_addr: &str,
    port: NonZeroU16,
    state: AppState,
) -> Result<(), anyhow::Error> {
    let app = create_router().with_state(state);

    let addr = format!("{}:{}", listen_addr, port);
    info!("Starting server on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
