//! Text overlays: slot defaults, anchoring, wrapping and the two rendering modes.

pub mod color;
pub mod font;
pub mod raster;

use std::fmt;
use std::path::PathBuf;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{FontFallback, OverlayConfig, OverlayMode};
use crate::error::PipelineResult;
use crate::media::Resolution;
use crate::workspace::Workspace;

pub use color::Color;
pub use font::FontFace;

/// Named overlay positions, in compositing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlaySlot {
    Top,
    Center,
    Bottom,
}

impl OverlaySlot {
    pub const ALL: [OverlaySlot; 3] = [OverlaySlot::Top, OverlaySlot::Center, OverlaySlot::Bottom];

    pub fn as_str(&self) -> &'static str {
        match self {
            OverlaySlot::Top => "top",
            OverlaySlot::Center => "center",
            OverlaySlot::Bottom => "bottom",
        }
    }

    pub fn default_font_size(&self) -> u32 {
        match self {
            OverlaySlot::Top => 26,
            OverlaySlot::Center => 44,
            OverlaySlot::Bottom => 22,
        }
    }

    pub fn default_background(&self) -> Color {
        match self {
            OverlaySlot::Top | OverlaySlot::Bottom => Color::shade(0.5),
            OverlaySlot::Center => Color::shade(0.65),
        }
    }
}

impl fmt::Display for OverlaySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One active overlay. Slots without text never become an `OverlaySpec`.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlaySpec {
    pub slot: OverlaySlot,
    pub text: String,
    pub font_size: u32,
    pub color: Color,
    pub background: Color,
}

impl OverlaySpec {
    pub fn new(slot: OverlaySlot, text: impl Into<String>) -> Self {
        Self {
            slot,
            text: text.into(),
            font_size: slot.default_font_size(),
            color: Color::WHITE,
            background: slot.default_background(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Top,
    Center,
    Bottom,
}

impl Anchor {
    /// Unknown names anchor to the center.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "top" => Anchor::Top,
            "bottom" => Anchor::Bottom,
            _ => Anchor::Center,
        }
    }

    /// Top-left corner of a `block` of text on `canvas`.
    pub fn place(&self, canvas: Resolution, block: (u32, u32), margins: Margins) -> (i32, i32) {
        let (block_w, block_h) = (block.0 as i32, block.1 as i32);
        let (width, height) = (canvas.width as i32, canvas.height as i32);
        let x = (width - block_w) / 2;
        let y = match self {
            Anchor::Top => margins.top as i32,
            Anchor::Center => (height - block_h) / 2,
            Anchor::Bottom => height - block_h - margins.bottom as i32,
        };
        (x, y)
    }

    /// The same rule as [`Anchor::place`], as drawtext position expressions.
    pub fn expressions(&self, margins: Margins) -> (String, String) {
        let x = "(w-text_w)/2".to_string();
        let y = match self {
            Anchor::Top => margins.top.to_string(),
            Anchor::Center => "(h-text_h)/2".to_string(),
            Anchor::Bottom => format!("h-text_h-{}", margins.bottom),
        };
        (x, y)
    }
}

impl From<OverlaySlot> for Anchor {
    fn from(slot: OverlaySlot) -> Self {
        Anchor::from_name(slot.as_str())
    }
}

/// Vertical margins in output pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Margins {
    pub top: u32,
    pub bottom: u32,
}

impl Margins {
    /// Scales the configured margins from the reference height to `height`.
    pub fn for_height(config: &OverlayConfig, height: u32) -> Self {
        let scale = |margin: u32| -> u32 {
            let scaled = u64::from(margin) * u64::from(height) + u64::from(config.reference_height) / 2;
            (scaled / u64::from(config.reference_height)) as u32
        };
        Self {
            top: scale(config.top_margin),
            bottom: scale(config.bottom_margin),
        }
    }
}

/// Greedy word wrap at `width` characters. Explicit newlines start a new paragraph
/// and words longer than `width` are split.
pub fn wrap_text(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = Vec::new();
    for paragraph in text.lines() {
        let mut current = String::new();
        let mut current_len = 0usize;
        for word in paragraph.split_whitespace() {
            let mut word: Vec<char> = word.chars().collect();
            while word.len() > width {
                if current_len > 0 {
                    lines.push(std::mem::take(&mut current));
                    current_len = 0;
                }
                lines.push(word.drain(..width).collect());
            }
            if word.is_empty() {
                continue;
            }
            let needed = if current_len == 0 { word.len() } else { current_len + 1 + word.len() };
            if needed > width {
                lines.push(std::mem::take(&mut current));
                current_len = 0;
            }
            if current_len > 0 {
                current.push(' ');
                current_len += 1;
            }
            current.extend(word.iter());
            current_len += word.len();
        }
        if current_len > 0 {
            lines.push(current);
        }
    }
    lines
}

/// Text drawn directly by the engine's `drawtext` filter.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawText {
    pub slot: OverlaySlot,
    /// Wrapped text, lines joined by `\n`.
    pub text: String,
    pub font_file: Option<PathBuf>,
    pub font_size: u32,
    pub fill: Color,
    pub box_color: Color,
    pub box_padding: u32,
    pub stroke_width: u32,
    pub stroke_color: Color,
    pub x: String,
    pub y: String,
    /// Center each line inside the block instead of aligning left.
    pub center_lines: bool,
}

/// What the plan composites for one active slot.
#[derive(Debug, Clone, PartialEq)]
pub enum OverlayDirective {
    DrawText(DrawText),
    /// A full-frame transparent PNG inside the job workspace.
    Image { slot: OverlaySlot, path: PathBuf },
}

impl OverlayDirective {
    pub fn slot(&self) -> OverlaySlot {
        match self {
            OverlayDirective::DrawText(draw) => draw.slot,
            OverlayDirective::Image { slot, .. } => *slot,
        }
    }
}

/// Turns overlay specs into composite directives. Holds only read-only state, so one
/// renderer can serve concurrent jobs.
#[derive(Debug)]
pub struct OverlayRenderer {
    config: OverlayConfig,
    face: OnceCell<FontFace>,
}

impl OverlayRenderer {
    pub fn new(config: OverlayConfig) -> Self {
        Self {
            config,
            face: OnceCell::new(),
        }
    }

    pub fn mode(&self) -> OverlayMode {
        self.config.mode
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    pub(crate) fn face(&self) -> &FontFace {
        self.face
            .get_or_init(|| FontFace::resolve(&self.config.font_path))
    }

    /// Mode actually used for the next overlay. Directive mode without a loadable
    /// font switches to asset mode unless the engine default face is allowed.
    pub fn effective_mode(&self) -> OverlayMode {
        match self.config.mode {
            OverlayMode::Directive
                if self.face().is_builtin() && self.config.font_fallback == FontFallback::Asset =>
            {
                OverlayMode::Asset
            }
            mode => mode,
        }
    }

    /// Renders `spec` in the effective mode. Asset mode writes one PNG into the
    /// workspace, registered before it is written.
    pub fn render(
        &self,
        spec: &OverlaySpec,
        canvas: Resolution,
        workspace: &Workspace,
    ) -> PipelineResult<OverlayDirective> {
        match self.effective_mode() {
            OverlayMode::Directive => Ok(OverlayDirective::DrawText(self.draw_text(spec, canvas))),
            OverlayMode::Asset => {
                if self.config.mode == OverlayMode::Directive {
                    debug!(slot = %spec.slot, "No usable font for drawtext; rasterizing overlay");
                }
                let path = workspace.reserve(&format!("overlay-{}.png", spec.slot))?;
                let image = raster::rasterize(self, spec, canvas);
                raster::write_png(&image, &path)?;
                debug!(slot = %spec.slot, path = %path.display(), "Overlay asset written");
                Ok(OverlayDirective::Image {
                    slot: spec.slot,
                    path,
                })
            }
        }
    }

    pub fn draw_text(&self, spec: &OverlaySpec, canvas: Resolution) -> DrawText {
        let margins = Margins::for_height(&self.config, canvas.height);
        let (x, y) = Anchor::from(spec.slot).expressions(margins);
        let font_file = (!self.face().is_builtin()).then(|| self.config.font_path.clone());
        let lines = wrap_text(&spec.text, self.config.wrap_width);
        DrawText {
            slot: spec.slot,
            center_lines: self.config.center_lines && lines.len() > 1,
            text: lines.join("\n"),
            font_file,
            font_size: spec.font_size,
            fill: spec.color,
            box_color: spec.background,
            box_padding: self.config.padding,
            stroke_width: self.config.stroke_width,
            stroke_color: Color::BLACK,
            x,
            y,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_at_word_boundaries() {
        let lines = wrap_text("Subscribe for daily reminders and beautiful recitations", 30);
        assert_eq!(lines, vec!["Subscribe for daily reminders", "and beautiful recitations"]);
        assert!(lines.iter().all(|l| l.chars().count() <= 30));
    }

    #[test]
    fn wraps_long_words_and_keeps_paragraphs() {
        let lines = wrap_text("abcdefghij\nxy z", 4);
        assert_eq!(lines, vec!["abcd", "efgh", "ij", "xy z"]);
        assert!(wrap_text("   ", 30).is_empty());
    }

    #[test]
    fn unknown_anchor_names_center() {
        assert_eq!(Anchor::from_name("left"), Anchor::Center);
        assert_eq!(Anchor::from_name(""), Anchor::Center);
        assert_eq!(Anchor::from_name("Bottom"), Anchor::Bottom);
    }

    #[test]
    fn placement_rules() {
        let canvas = Resolution { width: 1080, height: 1920 };
        let margins = Margins { top: 80, bottom: 100 };
        assert_eq!(Anchor::Top.place(canvas, (200, 40), margins), (440, 80));
        assert_eq!(Anchor::Center.place(canvas, (200, 40), margins), (440, 940));
        assert_eq!(Anchor::Bottom.place(canvas, (200, 40), margins), (440, 1780));
        assert_eq!(
            Anchor::Bottom.expressions(margins),
            ("(w-text_w)/2".to_string(), "h-text_h-100".to_string())
        );
    }

    #[test]
    fn margins_scale_with_height() {
        let config = OverlayConfig::default();
        assert_eq!(Margins::for_height(&config, 1920), Margins { top: 80, bottom: 100 });
        assert_eq!(Margins::for_height(&config, 960), Margins { top: 40, bottom: 50 });
    }

    #[test]
    fn slot_defaults() {
        let spec = OverlaySpec::new(OverlaySlot::Bottom, "Subscribe");
        assert_eq!(spec.font_size, 22);
        assert_eq!(spec.color, Color::WHITE);
        assert_eq!(OverlaySpec::new(OverlaySlot::Center, "x").font_size, 44);
        assert_eq!(OverlaySpec::new(OverlaySlot::Top, "x").font_size, 26);
    }
}
