use serde::Serialize;

use crate::media::Resolution;
use crate::overlay::{Color, OverlaySlot};
use crate::request::JobRequest;

/// Asset ids that clients send when they have no asset. Treated as missing.
const PLACEHOLDER_IDS: &[&str] = &["null", "undefined", "none", "placeholder"];

const MAX_FONT_SIZE: u32 = 400;
const LARGE_FONT_SIZE: u32 = 160;
const LONG_TEXT_CHARS: usize = 280;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_request(request: &JobRequest) -> ValidationReport {
    let mut report = ValidationReport::default();

    validate_asset_id(&mut report, "videoId", request.video_id.as_deref());
    validate_asset_id(&mut report, "musicId", request.music_id.as_deref());

    if let Some(max_duration) = request.max_duration
        && !(max_duration.is_finite() && max_duration > 0.0)
    {
        report
            .errors
            .push(format!("maxDuration must be a positive number, got {max_duration}"));
    }

    if let Some(resolution) = &request.resolution
        && resolution.trim().is_empty()
    {
        report.errors.push("resolution cannot be empty".into());
    }

    if let Some(ratio) = &request.aspect_ratio {
        match Resolution::from_aspect_ratio(ratio) {
            None if request.resolution.is_none() => report.errors.push(format!(
                "aspectRatio '{ratio}' is not a supported W:H ratio"
            )),
            None => report
                .warnings
                .push(format!("aspectRatio '{ratio}' ignored; resolution takes precedence")),
            Some(_) => {
                if let Some(Ok(resolution)) = request.resolution.as_deref().map(Resolution::parse)
                    && !resolution.matches_aspect_ratio(ratio)
                {
                    report.warnings.push(format!(
                        "resolution {resolution} does not match aspectRatio {ratio}; using resolution"
                    ));
                }
            }
        }
    }

    for slot in OverlaySlot::ALL {
        report.merge(validate_overlay(request, slot));
    }

    report
}

fn validate_asset_id(report: &mut ValidationReport, field: &str, value: Option<&str>) {
    let Some(value) = value.map(str::trim) else {
        report.errors.push(format!("{field} is required"));
        return;
    };
    if value.is_empty() {
        report.errors.push(format!("{field} cannot be empty"));
    } else if PLACEHOLDER_IDS
        .iter()
        .any(|placeholder| value.eq_ignore_ascii_case(placeholder))
    {
        report
            .errors
            .push(format!("{field} '{value}' is a placeholder, not an asset id"));
    }
}

fn validate_overlay(request: &JobRequest, slot: OverlaySlot) -> ValidationReport {
    let mut report = ValidationReport::default();
    let Some(overlay) = request.overlays.get(slot) else {
        return report;
    };

    if !overlay.is_active() {
        if overlay.font_size.is_some() || overlay.color.is_some() || overlay.background_color.is_some() {
            report
                .warnings
                .push(format!("overlays.{slot} has no text and will be skipped"));
        }
        return report;
    }

    if let Some(size) = overlay.font_size {
        if size == 0 || size > MAX_FONT_SIZE {
            report.errors.push(format!(
                "overlays.{slot}.fontSize must be between 1 and {MAX_FONT_SIZE}, got {size}"
            ));
        } else if size > LARGE_FONT_SIZE {
            report
                .warnings
                .push(format!("overlays.{slot}.fontSize {size} may not fit the frame"));
        }
    }

    for (field, value) in [
        ("color", overlay.color.as_deref()),
        ("backgroundColor", overlay.background_color.as_deref()),
    ] {
        if let Some(value) = value
            && let Err(err) = value.parse::<Color>()
        {
            report.errors.push(format!("overlays.{slot}.{field}: {err}"));
        }
    }

    let chars = overlay.text.as_deref().map_or(0, |t| t.chars().count());
    if chars > LONG_TEXT_CHARS {
        report.warnings.push(format!(
            "overlays.{slot}.text is {chars} characters; long text may overflow the frame"
        ));
    }

    report
}
