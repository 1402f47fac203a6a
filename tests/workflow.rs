//! End-to-end runs against in-process fake model services and the local blob host.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use image::{DynamicImage, Rgba, RgbaImage};
use mobsmith::config::{ApiType, ModelConfig, ModelKind};
use mobsmith::error::MobsmithError;
use mobsmith::frame::FrameLibrary;
use mobsmith::generation::GenerationClient;
use mobsmith::http::HttpSettings;
use mobsmith::prompt::{Style, StyleParameters};
use mobsmith::storage::{BlobStore, LocalBlobStore, Publisher};
use mobsmith::vision::VisionClient;
use mobsmith::web::{AppState, create_router};
use mobsmith::workflow::{CharacterRequest, CharacterSource, Stage, Workflow};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use url::Url;

fn no_retries() -> HttpSettings {
    HttpSettings {
        max_retries: 0,
        ..Default::default()
    }
}

fn png(width: u32, height: u32, color: Rgba<u8>) -> Vec<u8> {
    let mut out = std::io::Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, color))
        .write_to(&mut out, image::ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

fn decode_scan_code(png: &[u8]) -> String {
    let image = image::load_from_memory(png).expect("decode png").to_luma8();
    let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(
        image.width() as usize,
        image.height() as usize,
        |x, y| image.get_pixel(x as u32, y as u32)[0],
    );
    let grids = prepared.detect_grids();
    assert_eq!(grids.len(), 1, "expected exactly one QR code");
    grids[0].decode().expect("decode grid").1
}

async fn spawn(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

/// Fake images API: records prompts and serves `image` from its own `/image.png`.
#[derive(Clone, Default)]
struct FakeImages {
    prompts: Arc<Mutex<Vec<String>>>,
}

impl FakeImages {
    async fn start(&self, image: Vec<u8>) -> String {
        let prompts = self.prompts.clone();
        let app = Router::new()
            .route(
                "/openai/deployments/dall-e-3/images/generations",
                post(move |headers: HeaderMap, body: axum::Json<Value>| {
                    let prompts = prompts.clone();
                    async move {
                        prompts
                            .lock()
                            .expect("lock")
                            .push(body["prompt"].as_str().unwrap_or_default().to_string());
                        let host = headers
                            .get("host")
                            .and_then(|value| value.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        axum::Json(json!({
                            "created": 0,
                            "data": [{"url": format!("http://{host}/image.png")}]
                        }))
                    }
                }),
            )
            .route(
                "/image.png",
                get(move || {
                    let image = image.clone();
                    async move { image }
                }),
            );
        spawn(app).await
    }
}

fn generation_client(endpoint: &str) -> GenerationClient {
    GenerationClient::new(
        ModelConfig {
            model_id: "dalle".into(),
            kind: ModelKind::ImageGeneration,
            endpoint: endpoint.into(),
            api_key: "generation-key".into(),
            api_version: Some("2024-02-01".into()),
            deployment_name: "dall-e-3".into(),
            api_type: ApiType::Azure,
        },
        &no_retries(),
    )
    .expect("generation client")
}

/// Starts the blob host and returns the workflow publishing into it.
async fn local_workflow(
    generator: GenerationClient,
    storage: &Path,
    frames: &Path,
) -> Workflow {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let store = LocalBlobStore::new(
        storage,
        Url::parse(&format!("http://{addr}/")).expect("url"),
    );
    let workflow = Workflow::new(
        Arc::new(generator),
        Publisher::new(Arc::new(store.clone())),
        FrameLibrary::new(frames),
    );
    let app = create_router().with_state(AppState::new(workflow.clone(), Some(store)));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    workflow
}

#[tokio::test]
async fn description_is_published_and_scannable() {
    let storage = tempfile::tempdir().expect("tempdir");
    let frames = tempfile::tempdir().expect("tempdir");
    let fake = FakeImages::default();
    let endpoint = fake.start(png(16, 16, Rgba([30, 160, 60, 255]))).await;
    let workflow =
        local_workflow(generation_client(&endpoint), storage.path(), frames.path()).await;

    let stages = Mutex::new(Vec::new());
    let record = |stage: Stage| stages.lock().expect("lock").push(stage);
    let result = workflow
        .run(
            CharacterRequest {
                source: CharacterSource::Description(
                    "a zombie warrior with diamond armor".into(),
                ),
                params: StyleParameters::new(Style::Minecraft),
            },
            Some(&record),
        )
        .await
        .expect("run");

    assert_eq!(stages.lock().expect("lock").last(), Some(&Stage::Done));
    assert_eq!(
        image::guess_format(&result.image).expect("format"),
        image::ImageFormat::Png
    );
    assert!(
        fake.prompts.lock().expect("lock")[0].contains("a zombie warrior with diamond armor")
    );

    let fetched = reqwest::get(result.artifact.url.clone())
        .await
        .expect("fetch")
        .bytes()
        .await
        .expect("body");
    assert_eq!(fetched.as_ref(), result.image.as_slice());
    assert_eq!(
        decode_scan_code(&result.scan_code),
        result.artifact.url.as_str()
    );
}

/// Counts uploads without storing anything.
#[derive(Default)]
struct CountingStore {
    uploads: AtomicUsize,
}

#[async_trait]
impl BlobStore for CountingStore {
    async fn ensure_container(&self, _container: &str) -> Result<(), MobsmithError> {
        Ok(())
    }

    async fn upload_bytes(
        &self,
        _container: &str,
        _key: &str,
        _bytes: &[u8],
    ) -> Result<(), MobsmithError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn url(
        &self,
        container: &str,
        key: &str,
        _signed_expiry: Option<Duration>,
    ) -> Result<Url, MobsmithError> {
        Ok(Url::parse(&format!("https://blobs.test/{container}/{key}"))?)
    }

    async fn delete_blob(&self, _container: &str, _key: &str) -> Result<(), MobsmithError> {
        Ok(())
    }
}

#[tokio::test]
async fn generation_error_fails_without_uploading() {
    let endpoint = spawn(Router::new().route(
        "/openai/deployments/dall-e-3/images/generations",
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "model overloaded") }),
    ))
    .await;
    let store = Arc::new(CountingStore::default());
    let workflow = Workflow::new(
        Arc::new(generation_client(&endpoint)),
        Publisher::new(store.clone()),
        FrameLibrary::new("./no-frames-here"),
    );

    let stages = Mutex::new(Vec::new());
    let record = |stage: Stage| stages.lock().expect("lock").push(stage);
    let err = workflow
        .run(
            CharacterRequest {
                source: CharacterSource::Description("a creeper".into()),
                params: StyleParameters::new(Style::Minecraft),
            },
            Some(&record),
        )
        .await
        .expect_err("generation should fail");

    assert!(matches!(err, MobsmithError::GenerationFailed(_)));
    assert_eq!(stages.lock().expect("lock").last(), Some(&Stage::Failed));
    assert_eq!(store.uploads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn absent_frame_leaves_the_image_untouched() {
    let storage = tempfile::tempdir().expect("tempdir");
    let frames = tempfile::tempdir().expect("tempdir");
    let subject = png(12, 12, Rgba([200, 40, 40, 255]));
    let endpoint = FakeImages::default().start(subject.clone()).await;
    let workflow =
        local_workflow(generation_client(&endpoint), storage.path(), frames.path()).await;

    let mut params = StyleParameters::new(Style::Funko);
    params.frame = Some("golden".into());
    let result = workflow
        .run(
            CharacterRequest {
                source: CharacterSource::Description("a knight".into()),
                params,
            },
            None,
        )
        .await
        .expect("run");

    assert_eq!(result.image, subject);
    assert_eq!(result.artifact.container, "images");
}

#[tokio::test]
async fn frame_with_hole_is_composited() {
    let storage = tempfile::tempdir().expect("tempdir");
    let frames = tempfile::tempdir().expect("tempdir");

    // opaque border with a transparent 10x10 window in the middle
    let mut frame = RgbaImage::from_pixel(20, 20, Rgba([250, 200, 0, 255]));
    for x in 5..15 {
        for y in 5..15 {
            frame.put_pixel(x, y, Rgba([0, 0, 0, 0]));
        }
    }
    DynamicImage::ImageRgba8(frame)
        .save(frames.path().join("golden.png"))
        .expect("save frame");
    std::fs::write(
        frames.path().join("golden.json"),
        r#"{"hole": {"width": 10, "height": 10}}"#,
    )
    .expect("sidecar");

    let subject = png(40, 40, Rgba([0, 0, 255, 255]));
    let endpoint = FakeImages::default().start(subject.clone()).await;
    let workflow =
        local_workflow(generation_client(&endpoint), storage.path(), frames.path()).await;

    let mut params = StyleParameters::new(Style::Minecraft);
    params.frame = Some("golden".into());
    let result = workflow
        .run(
            CharacterRequest {
                source: CharacterSource::Description("a miner".into()),
                params,
            },
            None,
        )
        .await
        .expect("run");

    let framed = image::load_from_memory(&result.image)
        .expect("decode")
        .to_rgb8();
    assert_eq!(framed.dimensions(), (20, 20));
    assert_eq!(framed.get_pixel(0, 0).0, [250, 200, 0]);
    assert_eq!(framed.get_pixel(10, 10).0, [0, 0, 255]);
}

#[tokio::test]
async fn empty_vision_description_still_generates() {
    let vision = spawn(Router::new().route(
        "/chat/completions",
        post(|| async {
            axum::Json(json!({
                "choices": [{"index": 0, "message": {"role": "assistant", "content": ""}}]
            }))
        }),
    ))
    .await;
    let storage = tempfile::tempdir().expect("tempdir");
    let frames = tempfile::tempdir().expect("tempdir");
    let fake = FakeImages::default();
    let endpoint = fake.start(png(8, 8, Rgba([90, 90, 90, 255]))).await;

    let describer = VisionClient::new(
        ModelConfig {
            model_id: "mistral".into(),
            kind: ModelKind::ChatVision,
            endpoint: vision,
            api_key: "vision-key".into(),
            api_version: None,
            deployment_name: "mistral-small".into(),
            api_type: ApiType::Azure,
        },
        &no_retries(),
    )
    .expect("vision client");
    let workflow = local_workflow(generation_client(&endpoint), storage.path(), frames.path())
        .await
        .with_describer(Arc::new(describer));

    let stages = Mutex::new(Vec::new());
    let record = |stage: Stage| stages.lock().expect("lock").push(stage);
    let result = workflow
        .run(
            CharacterRequest {
                source: CharacterSource::Photo(png(4, 4, Rgba([255, 220, 180, 255]))),
                params: StyleParameters::new(Style::Minecraft),
            },
            Some(&record),
        )
        .await
        .expect("run");

    assert_eq!(result.description, "");
    let prompts = fake.prompts.lock().expect("lock");
    assert_eq!(prompts.len(), 1);
    assert!(!prompts[0].contains("based on this description"));
    assert_eq!(
        *stages.lock().expect("lock"),
        vec![
            Stage::Idle,
            Stage::Describing,
            Stage::Generating,
            Stage::Publishing,
            Stage::Encoding,
            Stage::Done
        ]
    );
}
