use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::RequestDefaults;
use crate::error::{PipelineError, PipelineResult};
use crate::overlay::{Color, OverlaySlot, OverlaySpec};
use crate::validation::validate_request;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioPolicy {
    /// The music track is the only output audio.
    Replace,
    /// Original video audio and music, equal weight.
    Mix,
}

impl AudioPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioPolicy::Replace => "replace",
            AudioPolicy::Mix => "mix",
        }
    }
}

/// A job request as it arrives on the wire.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    #[serde(default)]
    pub video_id: Option<String>,
    #[serde(default)]
    pub music_id: Option<String>,
    #[serde(default)]
    pub overlays: OverlaySet,
    #[serde(default)]
    pub max_duration: Option<f64>,
    #[serde(default)]
    pub aspect_ratio: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub audio_policy: Option<AudioPolicy>,
}

impl JobRequest {
    /// Loads a request from a `.json` file, or YAML for any other extension.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read request file: {}", path.display()))?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let request = if is_json {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse request JSON: {}", path.display()))?
        } else {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse request YAML: {}", path.display()))?
        };
        Ok(request)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OverlaySet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top: Option<OverlayRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center: Option<OverlayRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bottom: Option<OverlayRequest>,
}

impl OverlaySet {
    pub fn get(&self, slot: OverlaySlot) -> Option<&OverlayRequest> {
        match slot {
            OverlaySlot::Top => self.top.as_ref(),
            OverlaySlot::Center => self.center.as_ref(),
            OverlaySlot::Bottom => self.bottom.as_ref(),
        }
    }

    /// Slots that carry non-blank text, in compositing order.
    pub fn active(&self) -> impl Iterator<Item = (OverlaySlot, &OverlayRequest)> {
        OverlaySlot::ALL.into_iter().filter_map(|slot| {
            self.get(slot)
                .filter(|overlay| overlay.is_active())
                .map(|overlay| (slot, overlay))
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayRequest {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub font_size: Option<u32>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub background_color: Option<String>,
}

impl OverlayRequest {
    pub fn is_active(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
    }
}

/// Validated, normalized job input. Only built through [`TranscodeRequest::from_request`].
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeRequest {
    pub video_id: String,
    pub music_id: String,
    pub max_duration: f64,
    /// `WIDTHxHEIGHT`, parsed by the plan builder.
    pub resolution: String,
    pub audio_policy: AudioPolicy,
    /// Active overlays in compositing order.
    pub overlays: Vec<OverlaySpec>,
}

impl TranscodeRequest {
    pub fn from_request(request: &JobRequest, defaults: &RequestDefaults) -> PipelineResult<Self> {
        let report = validate_request(request);
        if !report.is_ok() {
            return Err(PipelineError::Validation(report.errors));
        }

        let mut overlays = Vec::new();
        for (slot, overlay) in request.overlays.active() {
            let mut spec = OverlaySpec::new(slot, overlay.text.as_deref().unwrap_or_default().trim());
            if let Some(size) = overlay.font_size {
                spec.font_size = size;
            }
            if let Some(color) = &overlay.color {
                spec.color = parse_color(slot, "color", color)?;
            }
            if let Some(color) = &overlay.background_color {
                spec.background = parse_color(slot, "backgroundColor", color)?;
            }
            overlays.push(spec);
        }

        let resolution = match (&request.resolution, &request.aspect_ratio) {
            (Some(resolution), _) => resolution.trim().to_string(),
            (None, Some(ratio)) => crate::media::Resolution::from_aspect_ratio(ratio)
                .map(|r| r.to_string())
                .unwrap_or_else(|| defaults.resolution.clone()),
            (None, None) => defaults.resolution.clone(),
        };

        Ok(Self {
            video_id: request.video_id.as_deref().unwrap_or_default().trim().to_string(),
            music_id: request.music_id.as_deref().unwrap_or_default().trim().to_string(),
            max_duration: request.max_duration.unwrap_or(defaults.max_duration),
            resolution,
            audio_policy: request.audio_policy.unwrap_or(defaults.audio_policy),
            overlays,
        })
    }
}

fn parse_color(slot: OverlaySlot, field: &str, value: &str) -> PipelineResult<Color> {
    value
        .parse()
        .map_err(|err| PipelineError::validation(format!("overlays.{slot}.{field}: {err}")))
}

/// The response body for a finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobResponse {
    #[serde(rename_all = "camelCase")]
    Success {
        video_url: String,
        duration: f64,
        job_id: String,
        audio_replaced: bool,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
}
