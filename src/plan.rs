//! Builds the immutable [`TranscodePlan`] for one job and serializes plan locks.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::config::EncodeSettings;
use crate::error::PipelineResult;
use crate::executor::engine_args;
use crate::media::{MediaAsset, MediaProbe, Resolution};
use crate::overlay::{OverlayDirective, OverlayRenderer};
use crate::request::{AudioPolicy, TranscodeRequest};
use crate::workspace::Workspace;

const OUTPUT_FILE: &str = "reel.mp4";

/// One step of the plan. Duration-bearing steps read
/// [`TranscodePlan::effective_duration`] rather than carrying their own copy.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanStage {
    Trim,
    ScaleCrop { resolution: Resolution },
    Overlay(OverlayDirective),
    Audio { policy: AudioPolicy },
    Encode(EncodeSettings),
}

impl PlanStage {
    pub fn name(&self) -> &'static str {
        match self {
            PlanStage::Trim => "trim",
            PlanStage::ScaleCrop { .. } => "scale_crop",
            PlanStage::Overlay(_) => "overlay",
            PlanStage::Audio { .. } => "audio",
            PlanStage::Encode(_) => "encode",
        }
    }

    fn describe(&self) -> String {
        match self {
            PlanStage::Trim => "trim".into(),
            PlanStage::ScaleCrop { resolution } => format!("scale_crop {resolution}"),
            PlanStage::Overlay(OverlayDirective::DrawText(draw)) => {
                format!("drawtext {} {:?} {}px", draw.slot, draw.text, draw.font_size)
            }
            PlanStage::Overlay(OverlayDirective::Image { slot, path }) => {
                format!("image {slot} {}", path.display())
            }
            PlanStage::Audio { policy } => format!("audio {}", policy.as_str()),
            PlanStage::Encode(settings) => format!("encode {settings:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanInputs {
    pub video: PathBuf,
    pub audio: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputTarget {
    pub path: PathBuf,
    pub overwrite: bool,
}

/// Everything the executor needs for one engine invocation. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodePlan {
    job_id: String,
    inputs: PlanInputs,
    stages: Vec<PlanStage>,
    effective_duration: f64,
    resolution: Resolution,
    output: OutputTarget,
}

impl TranscodePlan {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn inputs(&self) -> &PlanInputs {
        &self.inputs
    }

    pub fn stages(&self) -> &[PlanStage] {
        &self.stages
    }

    pub fn effective_duration(&self) -> f64 {
        self.effective_duration
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn output(&self) -> &OutputTarget {
        &self.output
    }

    pub fn overlays(&self) -> impl Iterator<Item = &OverlayDirective> {
        self.stages.iter().filter_map(|stage| match stage {
            PlanStage::Overlay(directive) => Some(directive),
            _ => None,
        })
    }

    pub fn overlay_count(&self) -> usize {
        self.overlays().count()
    }

    /// Overlay PNGs, in the order they are fed to the engine after video and music.
    pub fn overlay_images(&self) -> impl Iterator<Item = &Path> {
        self.overlays().filter_map(|directive| match directive {
            OverlayDirective::Image { path, .. } => Some(path.as_path()),
            OverlayDirective::DrawText(_) => None,
        })
    }

    /// The audio policy actually applied, after any degradation.
    pub fn audio_policy(&self) -> AudioPolicy {
        self.stages
            .iter()
            .find_map(|stage| match stage {
                PlanStage::Audio { policy } => Some(*policy),
                _ => None,
            })
            .unwrap_or(AudioPolicy::Replace)
    }

    pub fn encode_settings(&self) -> Option<&EncodeSettings> {
        self.stages.iter().find_map(|stage| match stage {
            PlanStage::Encode(settings) => Some(settings),
            _ => None,
        })
    }

    /// SHA-256 over the rendered engine arguments.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for arg in engine_args(self) {
            hasher.update(arg.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }
}

pub struct PlanBuilder<'a> {
    renderer: &'a OverlayRenderer,
    encode: &'a EncodeSettings,
    probe: &'a dyn MediaProbe,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(
        renderer: &'a OverlayRenderer,
        encode: &'a EncodeSettings,
        probe: &'a dyn MediaProbe,
    ) -> Self {
        Self {
            renderer,
            encode,
            probe,
        }
    }

    #[instrument(skip_all, fields(job_id = workspace.job_id()))]
    pub fn build(
        &self,
        request: &TranscodeRequest,
        video: &MediaAsset,
        audio: &MediaAsset,
        workspace: &Workspace,
    ) -> PipelineResult<TranscodePlan> {
        let video_duration = video.duration(self.probe)?;
        let audio_duration = audio.duration(self.probe)?;
        let effective_duration = video_duration
            .min(audio_duration)
            .min(request.max_duration);

        let resolution = Resolution::parse(&request.resolution)?;

        let mut stages = vec![PlanStage::Trim, PlanStage::ScaleCrop { resolution }];
        for spec in &request.overlays {
            stages.push(PlanStage::Overlay(
                self.renderer.render(spec, resolution, workspace)?,
            ));
        }

        let policy = match request.audio_policy {
            AudioPolicy::Mix if !video.has_audio(self.probe)? => {
                warn!(
                    video = %video.path().display(),
                    "Video has no audio stream; mixing degraded to replace"
                );
                AudioPolicy::Replace
            }
            policy => policy,
        };
        stages.push(PlanStage::Audio { policy });
        stages.push(PlanStage::Encode(self.encode.clone()));

        let output = OutputTarget {
            path: workspace.reserve(OUTPUT_FILE)?,
            overwrite: false,
        };

        debug!(
            video_s = video_duration,
            audio_s = audio_duration,
            effective_s = effective_duration,
            %resolution,
            overlays = request.overlays.len(),
            audio_policy = policy.as_str(),
            "Plan built"
        );

        Ok(TranscodePlan {
            job_id: workspace.job_id().to_string(),
            inputs: PlanInputs {
                video: video.path().to_path_buf(),
                audio: audio.path().to_path_buf(),
            },
            stages,
            effective_duration,
            resolution,
            output,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct PlanLock {
    pub job_id: String,
    pub generated_at: DateTime<Utc>,
    pub fingerprint: String,
    pub effective_duration: f64,
    pub resolution: String,
    pub audio_policy: AudioPolicy,
    pub inputs: PlanInputs,
    pub output: OutputTarget,
    pub stages: Vec<StageLock>,
    pub engine_args: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StageLock {
    pub name: String,
    pub params_hash: String,
}

impl PlanLock {
    pub fn from_plan(plan: &TranscodePlan) -> Self {
        Self {
            job_id: plan.job_id().to_string(),
            generated_at: Utc::now(),
            fingerprint: plan.fingerprint(),
            effective_duration: plan.effective_duration(),
            resolution: plan.resolution().to_string(),
            audio_policy: plan.audio_policy(),
            inputs: plan.inputs().clone(),
            output: plan.output().clone(),
            stages: plan
                .stages()
                .iter()
                .map(|stage| StageLock {
                    name: stage.name().to_string(),
                    params_hash: hash_stage(stage),
                })
                .collect(),
            engine_args: engine_args(plan),
        }
    }
}

pub fn write_lock(plan: &TranscodePlan, path: &Path) -> Result<()> {
    let lock = PlanLock::from_plan(plan);
    let file = File::create(path)
        .with_context(|| format!("Failed to create plan lock: {}", path.display()))?;
    serde_yaml::to_writer(file, &lock)
        .with_context(|| format!("Failed to write plan lock: {}", path.display()))?;
    Ok(())
}

fn hash_stage(stage: &PlanStage) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stage.name().as_bytes());
    hasher.update(stage.describe().as_bytes());
    format!("{:x}", hasher.finalize())
}
