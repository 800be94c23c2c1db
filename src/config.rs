use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::request::AudioPolicy;

/// Service-wide, read-only configuration. Shared between concurrent jobs.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub paths: PathsConfig,
    pub engine: EngineConfig,
    pub encode: EncodeSettings,
    pub overlay: OverlayConfig,
    pub defaults: RequestDefaults,
    pub workspace: WorkspaceConfig,
}

impl ServiceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: ServiceConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config YAML: {}", path.display()))?;
        config.check()?;
        Ok(config)
    }

    /// Applies `REEL_FORGE_*` overrides. `lookup` is usually `std::env::var(..).ok()`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("REEL_FORGE_FFMPEG") {
            self.engine.ffmpeg = PathBuf::from(value);
        }
        if let Some(value) = lookup("REEL_FORGE_FFPROBE") {
            self.engine.ffprobe = PathBuf::from(value);
        }
        if let Some(value) = lookup("REEL_FORGE_WORKSPACE") {
            self.paths.workspace_root = PathBuf::from(value);
        }
        if let Some(value) = lookup("REEL_FORGE_LIBRARY") {
            self.paths.library_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("REEL_FORGE_OUTPUT_DIR") {
            self.paths.output_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("REEL_FORGE_PUBLIC_URL") {
            self.paths.public_base_url = Some(value);
        }
        if let Some(value) = lookup("REEL_FORGE_OVERLAY_MODE") {
            self.overlay.mode = OverlayMode::from_str(&value, true)
                .map_err(|_| anyhow::anyhow!("Unknown overlay mode '{value}'"))?;
        }
        self.check()
    }

    fn check(&self) -> Result<()> {
        if self.engine.encode_timeout_secs == 0 {
            bail!("engine.encode_timeout_secs must be positive");
        }
        if self.engine.probe_timeout_secs == 0 {
            bail!("engine.probe_timeout_secs must be positive");
        }
        if self.overlay.wrap_width == 0 {
            bail!("overlay.wrap_width must be positive");
        }
        if self.overlay.reference_height == 0 {
            bail!("overlay.reference_height must be positive");
        }
        if !(self.defaults.max_duration.is_finite() && self.defaults.max_duration > 0.0) {
            bail!("defaults.max_duration must be a positive number");
        }
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    pub workspace_root: PathBuf,
    pub library_dir: PathBuf,
    pub output_dir: PathBuf,
    pub public_base_url: Option<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("reel-forge");
        Self {
            workspace_root: base.join("work"),
            library_dir: PathBuf::from("./media"),
            output_dir: base.join("outputs"),
            public_base_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub encode_timeout_secs: u64,
    pub probe_timeout_secs: u64,
}

impl EngineConfig {
    pub fn encode_timeout(&self) -> Duration {
        Duration::from_secs(self.encode_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            encode_timeout_secs: 300,
            probe_timeout_secs: 30,
        }
    }
}

/// Output codec policy. Never derived from the inputs.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EncodeSettings {
    pub video_codec: String,
    pub preset: String,
    pub crf: u8,
    pub pixel_format: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub audio_channels: u8,
    pub faststart: bool,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            video_codec: "libx264".into(),
            preset: "medium".into(),
            crf: 23,
            pixel_format: "yuv420p".into(),
            audio_codec: "aac".into(),
            audio_bitrate: "128k".into(),
            audio_channels: 2,
            faststart: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OverlayMode {
    /// Text is drawn by the engine's drawtext filter.
    Directive,
    /// Text is rasterized to a PNG and composited.
    Asset,
}

impl Default for OverlayMode {
    fn default() -> Self {
        OverlayMode::Directive
    }
}

/// What directive mode does when `font_path` cannot be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FontFallback {
    /// Rasterize the overlay with the built-in face and composite it as an image.
    #[default]
    Asset,
    /// Emit drawtext without `fontfile`. Needs an engine built with fontconfig.
    EngineDefault,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub mode: OverlayMode,
    pub font_path: PathBuf,
    pub font_fallback: FontFallback,
    /// Center each wrapped drawtext line (`text_align`, ffmpeg 6.1 and later).
    pub center_lines: bool,
    pub wrap_width: usize,
    pub padding: u32,
    pub stroke_width: u32,
    pub top_margin: u32,
    pub bottom_margin: u32,
    /// Frame height the margins are expressed at.
    pub reference_height: u32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            mode: OverlayMode::Directive,
            font_path: PathBuf::from("/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf"),
            font_fallback: FontFallback::Asset,
            center_lines: true,
            wrap_width: 30,
            padding: 20,
            stroke_width: 2,
            top_margin: 80,
            bottom_margin: 100,
            reference_height: 1920,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RequestDefaults {
    pub max_duration: f64,
    pub resolution: String,
    pub audio_policy: AudioPolicy,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            max_duration: 60.0,
            resolution: "1080x1920".into(),
            audio_policy: AudioPolicy::Replace,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Leftover job directories older than this are removed on start-up.
    pub stale_after_secs: u64,
}

impl WorkspaceConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 3600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let yaml = "engine:\n  encode_timeout_secs: 12\noverlay:\n  mode: asset\n";
        let config: ServiceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.engine.encode_timeout(), Duration::from_secs(12));
        assert_eq!(config.engine.probe_timeout_secs, 30);
        assert_eq!(config.overlay.mode, OverlayMode::Asset);
        assert_eq!(config.encode.crf, 23);
        assert_eq!(config.defaults.resolution, "1080x1920");
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("REEL_FORGE_FFMPEG", "/opt/ffmpeg"),
            ("REEL_FORGE_OVERLAY_MODE", "asset"),
        ]
        .into_iter()
        .collect();
        let mut config = ServiceConfig::default();
        config
            .apply_env_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.engine.ffmpeg, PathBuf::from("/opt/ffmpeg"));
        assert_eq!(config.overlay.mode, OverlayMode::Asset);
    }

    #[test]
    fn unknown_overlay_mode_is_rejected() {
        let mut config = ServiceConfig::default();
        let result = config.apply_env_overrides(|key| {
            (key == "REEL_FORGE_OVERLAY_MODE").then(|| "sideways".to_string())
        });
        assert!(result.is_err());
    }
}
