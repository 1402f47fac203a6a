//! Runs one character request from input to published link and scan code.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::error::MobsmithError;
use crate::frame::{FrameLibrary, apply_frame};
use crate::generation::ImageGenerator;
use crate::prompt::{StyleParameters, build_prompt};
use crate::scancode::encode_as_scan_code;
use crate::storage::{PublishedArtifact, Publisher};
use crate::vision::FaceDescriber;

/// Where a request currently is.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Nothing started yet
    Idle,
    /// Asking the vision model about the photo
    Describing,
    /// Waiting on the image generator
    Generating,
    /// Putting the frame on
    Compositing,
    /// Uploading the image
    Publishing,
    /// Rendering the scan code
    Encoding,
    /// Finished
    Done,
    /// Stopped on an error
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Describing => "describing",
            Stage::Generating => "generating",
            Stage::Compositing => "compositing",
            Stage::Publishing => "publishing",
            Stage::Encoding => "encoding",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What the character is based on.
#[derive(Clone, Debug)]
pub enum CharacterSource {
    /// Free text, used as-is
    Description(String),
    /// Photo bytes to describe first
    Photo(Vec<u8>),
}

/// One unit of work.
#[derive(Clone, Debug)]
pub struct CharacterRequest {
    /// Text or photo input
    pub source: CharacterSource,
    /// Style, biome and frame
    pub params: StyleParameters,
}

/// Everything a finished request produced.
#[derive(Clone, Debug)]
pub struct CharacterResult {
    /// Description the prompt was built from
    pub description: String,
    /// Final PNG, framed if a frame was usable
    pub image: Vec<u8>,
    /// Where the image was published
    pub artifact: PublishedArtifact,
    /// PNG scan code pointing at the artifact URL
    pub scan_code: Vec<u8>,
}

/// Callback told about each stage as it starts.
pub type ProgressFn<'a> = &'a (dyn Fn(Stage) + Send + Sync);

/// The services a request runs through.
#[derive(Clone)]
pub struct Workflow {
    describer: Option<Arc<dyn FaceDescriber>>,
    generator: Arc<dyn ImageGenerator>,
    publisher: Publisher,
    frames: FrameLibrary,
}

impl Workflow {
    /// Text-only workflow.
    pub fn new(
        generator: Arc<dyn ImageGenerator>,
        publisher: Publisher,
        frames: FrameLibrary,
    ) -> Self {
        Self {
            describer: None,
            generator,
            publisher,
            frames,
        }
    }

    /// Enables photo requests.
    pub fn with_describer(mut self, describer: Arc<dyn FaceDescriber>) -> Self {
        self.describer = Some(describer);
        self
    }

    /// Whether photo requests can be served.
    pub fn accepts_photos(&self) -> bool {
        self.describer.is_some()
    }

    /// Runs `request` to completion, reporting stages to `on_progress`.
    #[instrument(skip_all, fields(style = %request.params.style))]
    pub async fn run(
        &self,
        request: CharacterRequest,
        on_progress: Option<ProgressFn<'_>>,
    ) -> Result<CharacterResult, MobsmithError> {
        let report = |stage: Stage| {
            debug!("Stage: {stage}");
            if let Some(callback) = on_progress {
                callback(stage);
            }
        };

        report(Stage::Idle);
        match self.run_stages(request, &report).await {
            Ok(result) => {
                report(Stage::Done);
                info!("Character published at {}", result.artifact.url);
                Ok(result)
            }
            Err(err) => {
                report(Stage::Failed);
                error!("Character request failed: {err}");
                Err(err)
            }
        }
    }

    async fn run_stages(
        &self,
        request: CharacterRequest,
        report: &(dyn Fn(Stage) + Send + Sync),
    ) -> Result<CharacterResult, MobsmithError> {
        let CharacterRequest { source, params } = request;

        let description = match source {
            CharacterSource::Description(text) => text,
            CharacterSource::Photo(photo) => {
                let describer = self.describer.as_ref().ok_or_else(|| {
                    MobsmithError::Configuration("no vision model configured".into())
                })?;
                report(Stage::Describing);
                describer.describe_face(&photo).await?
            }
        };

        report(Stage::Generating);
        let prompt = build_prompt(&description, &params);
        let mut image = self.generator.generate_image(&prompt).await?;

        if let Some(name) = params.frame.as_deref() {
            report(Stage::Compositing);
            match self.frames.resolve(name) {
                Ok(frame) => image = apply_frame(&image, &frame),
                Err(err) => warn!("Skipping frame '{name}': {err}"),
            }
        }

        report(Stage::Publishing);
        let artifact = self.publisher.publish(&image, params.style).await?;

        report(Stage::Encoding);
        let scan_code = match encode_as_scan_code(artifact.url.as_str()) {
            Ok(scan_code) => scan_code,
            Err(err) => {
                self.publisher.retract(&artifact).await;
                return Err(err);
            }
        };

        Ok(CharacterResult {
            description,
            image,
            artifact,
            scan_code,
        })
    }
}
