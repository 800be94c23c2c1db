use std::fmt;
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use serde::Serialize;

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Image,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Image => "image",
        }
    }
}

/// Read-only duration queries against a media file.
pub trait MediaProbe: Send + Sync {
    fn probe_duration(&self, path: &Path) -> PipelineResult<f64>;

    fn has_audio(&self, path: &Path) -> PipelineResult<bool>;
}

/// A local file inside a job workspace. Probed metadata is cached on first use.
#[derive(Debug)]
pub struct MediaAsset {
    path: PathBuf,
    kind: MediaKind,
    duration: OnceCell<f64>,
    has_audio: OnceCell<bool>,
}

impl MediaAsset {
    pub fn new(path: impl Into<PathBuf>, kind: MediaKind) -> Self {
        Self {
            path: path.into(),
            kind,
            duration: OnceCell::new(),
            has_audio: OnceCell::new(),
        }
    }

    /// Asset whose duration is already known, e.g. an encoder output.
    pub fn with_duration(path: impl Into<PathBuf>, kind: MediaKind, seconds: f64) -> Self {
        let asset = Self::new(path, kind);
        let _ = asset.duration.set(seconds);
        asset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn cached_duration(&self) -> Option<f64> {
        self.duration.get().copied()
    }

    pub fn duration(&self, probe: &dyn MediaProbe) -> PipelineResult<f64> {
        self.duration
            .get_or_try_init(|| probe.probe_duration(&self.path))
            .copied()
    }

    pub fn has_audio(&self, probe: &dyn MediaProbe) -> PipelineResult<bool> {
        self.has_audio
            .get_or_try_init(|| probe.has_audio(&self.path))
            .copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const SHORT_EDGE: u32 = 1080;
    /// Largest accepted width or height.
    pub const MAX_DIMENSION: u32 = 8192;

    /// Parses `WIDTHxHEIGHT`. Both sides must be positive and even (yuv420p output).
    pub fn parse(input: &str) -> PipelineResult<Self> {
        let trimmed = input.trim();
        let (w, h) = trimmed
            .split_once(['x', 'X'])
            .ok_or_else(|| PipelineError::invalid_resolution(input, "expected WIDTHxHEIGHT"))?;
        let width = parse_dimension(input, w)?;
        let height = parse_dimension(input, h)?;
        Self::new(width, height).map_err(|reason| PipelineError::invalid_resolution(input, reason))
    }

    pub fn new(width: u32, height: u32) -> Result<Self, String> {
        if width == 0 || height == 0 {
            return Err("width and height must be positive".into());
        }
        if width % 2 != 0 || height % 2 != 0 {
            return Err("width and height must be even".into());
        }
        if width > Self::MAX_DIMENSION || height > Self::MAX_DIMENSION {
            return Err(format!(
                "width and height must not exceed {}",
                Self::MAX_DIMENSION
            ));
        }
        Ok(Self { width, height })
    }

    /// Resolution for an aspect ratio such as `9:16`, short edge fixed at 1080.
    pub fn from_aspect_ratio(ratio: &str) -> Option<Self> {
        let (a, b) = ratio.trim().split_once(':')?;
        let a: u32 = a.trim().parse().ok()?;
        let b: u32 = b.trim().parse().ok()?;
        let (wide, tall) = (u64::from(a), u64::from(b));
        if a == 0 || b == 0 || wide > tall * 4 || tall > wide * 4 {
            return None;
        }
        let long = |num: u32, den: u32| -> u32 {
            let exact = f64::from(Self::SHORT_EDGE) * f64::from(num) / f64::from(den);
            let rounded = exact.round() as u32;
            rounded + rounded % 2
        };
        let (width, height) = if a <= b {
            (Self::SHORT_EDGE, long(b, a))
        } else {
            (long(a, b), Self::SHORT_EDGE)
        };
        Self::new(width, height).ok()
    }

    pub fn matches_aspect_ratio(&self, ratio: &str) -> bool {
        match Self::from_aspect_ratio(ratio) {
            Some(expected) => {
                let lhs = u64::from(self.width) * u64::from(expected.height);
                let rhs = u64::from(self.height) * u64::from(expected.width);
                lhs.abs_diff(rhs) * 100 <= rhs
            }
            None => false,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

fn parse_dimension(input: &str, part: &str) -> PipelineResult<u32> {
    part.trim()
        .parse::<u32>()
        .map_err(|_| PipelineError::invalid_resolution(input, format!("'{part}' is not a number")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn parses_resolution() {
        assert_eq!(
            Resolution::parse("1080x1920").unwrap(),
            Resolution {
                width: 1080,
                height: 1920
            }
        );
        assert_eq!(Resolution::parse(" 720X1280 ").unwrap().to_string(), "720x1280");
    }

    #[test]
    fn rejects_bad_resolutions() {
        for bad in ["", "1080", "0x1920", "1081x1920", "abcx100", "-2x4"] {
            let err = Resolution::parse(bad).unwrap_err();
            assert_eq!(err.kind(), "invalid_resolution", "input {bad:?}");
        }
    }

    #[test]
    fn caps_each_side() {
        assert!(Resolution::parse("8192x8192").is_ok());
        for bad in ["8194x1920", "1080x8194", "4294967294x4294967294"] {
            let err = Resolution::parse(bad).unwrap_err();
            assert_eq!(err.kind(), "invalid_resolution", "input {bad:?}");
        }
    }

    #[test]
    fn aspect_ratio_resolutions() {
        assert_eq!(Resolution::from_aspect_ratio("9:16").unwrap().to_string(), "1080x1920");
        assert_eq!(Resolution::from_aspect_ratio("16:9").unwrap().to_string(), "1920x1080");
        assert_eq!(Resolution::from_aspect_ratio("1:1").unwrap().to_string(), "1080x1080");
        assert_eq!(Resolution::from_aspect_ratio("4:5").unwrap().to_string(), "1080x1350");
        assert!(Resolution::from_aspect_ratio("0:1").is_none());
        assert!(Resolution::from_aspect_ratio("wide").is_none());
        assert!(Resolution::from_aspect_ratio("1:2000000000").is_none());
        assert!(Resolution::from_aspect_ratio("4294967295:4294967295").is_some());
        assert!(Resolution::parse("720x1280").unwrap().matches_aspect_ratio("9:16"));
        assert!(!Resolution::parse("1920x1080").unwrap().matches_aspect_ratio("9:16"));
    }

    struct CountingProbe(AtomicUsize);

    impl MediaProbe for CountingProbe {
        fn probe_duration(&self, _path: &Path) -> PipelineResult<f64> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(12.5)
        }

        fn has_audio(&self, _path: &Path) -> PipelineResult<bool> {
            Ok(true)
        }
    }

    #[test]
    fn duration_is_probed_once() {
        let probe = CountingProbe(AtomicUsize::new(0));
        let asset = MediaAsset::new("/tmp/clip.mp4", MediaKind::Video);
        assert_eq!(asset.cached_duration(), None);
        assert_eq!(asset.duration(&probe).unwrap(), 12.5);
        assert_eq!(asset.duration(&probe).unwrap(), 12.5);
        assert_eq!(probe.0.load(Ordering::SeqCst), 1);
        assert_eq!(asset.cached_duration(), Some(12.5));
    }
}
