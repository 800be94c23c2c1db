use std::io::Cursor;
use std::path::Path;

use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, Rgba, RgbaImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;

use super::{Anchor, Margins, OverlayRenderer, OverlaySpec, wrap_text};
use crate::error::{PipelineError, PipelineResult};
use crate::media::Resolution;

const STROKE: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// Draws `spec` onto a transparent canvas the size of the output frame: a padded
/// background box behind the wrapped block, then each line stroked and filled.
pub fn rasterize(renderer: &OverlayRenderer, spec: &OverlaySpec, canvas: Resolution) -> RgbaImage {
    let config = renderer.config();
    let face = renderer.face();
    let mut image = RgbaImage::new(canvas.width, canvas.height);

    let lines = wrap_text(&spec.text, config.wrap_width);
    if lines.is_empty() {
        return image;
    }

    let size = spec.font_size;
    let line_height = face.line_height(size);
    let widths: Vec<u32> = lines.iter().map(|line| face.measure(size, line).0).collect();
    let block_w = widths.iter().copied().max().unwrap_or(0);
    let block_h = line_height * lines.len() as u32;

    let margins = Margins::for_height(config, canvas.height);
    let (x, y) = Anchor::from(spec.slot).place(canvas, (block_w, block_h), margins);

    let pad = config.padding as i32;
    let box_w = block_w + 2 * config.padding;
    let box_h = block_h + 2 * config.padding;
    if box_w > 0 && box_h > 0 {
        draw_filled_rect_mut(
            &mut image,
            Rect::at(x - pad, y - pad).of_size(box_w, box_h),
            spec.background.to_rgba(),
        );
    }

    let stroke = config.stroke_width as i32;
    let fill = spec.color.to_rgba();
    for (index, (line, width)) in lines.iter().zip(&widths).enumerate() {
        let line_x = x + (block_w - width) as i32 / 2;
        let line_y = y + (index as u32 * line_height) as i32;
        for dy in -stroke..=stroke {
            for dx in -stroke..=stroke {
                if dx != 0 || dy != 0 {
                    face.draw(&mut image, STROKE, line_x + dx, line_y + dy, size, line);
                }
            }
        }
        face.draw(&mut image, fill, line_x, line_y, size, line);
    }

    image
}

pub fn write_png(image: &RgbaImage, path: &Path) -> PipelineResult<()> {
    let io_error = |source: std::io::Error| PipelineError::Workspace {
        path: path.to_path_buf(),
        source,
    };
    let mut cursor = Cursor::new(Vec::new());
    PngEncoder::new(&mut cursor)
        .write_image(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgba8,
        )
        .map_err(|err| io_error(std::io::Error::other(err)))?;
    std::fs::write(path, cursor.into_inner()).map_err(io_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverlayConfig;
    use crate::overlay::{Color, OverlaySlot};

    fn builtin_renderer() -> OverlayRenderer {
        OverlayRenderer::new(OverlayConfig {
            font_path: "/nonexistent/font.ttf".into(),
            ..OverlayConfig::default()
        })
    }

    #[test]
    fn bottom_overlay_box_sits_above_bottom_margin() {
        let renderer = builtin_renderer();
        let canvas = Resolution { width: 1080, height: 1920 };
        let mut spec = OverlaySpec::new(OverlaySlot::Bottom, "Subscribe");
        spec.background = Color::rgba(10, 20, 30, 200);
        let image = rasterize(&renderer, &spec, canvas);

        assert_eq!(image.dimensions(), (1080, 1920));
        // Corners of the frame stay transparent.
        assert_eq!(image.get_pixel(0, 0).0[3], 0);
        assert_eq!(image.get_pixel(1079, 1919).0[3], 0);

        // Builtin face at 22px: scale 2, line height 18, block 9 chars wide.
        let block_w = (9 * 6 - 1) * 2;
        let x = (1080 - block_w as i32) / 2;
        let y = 1920 - 18 - 100;
        let box_left = (x - 20) as u32;
        let box_top = (y - 20) as u32;
        assert_eq!(image.get_pixel(box_left, box_top).0, [10, 20, 30, 200]);
        assert_eq!(image.get_pixel(box_left - 1, box_top).0[3], 0);
        // Nothing is drawn below the padded box.
        assert_eq!(image.get_pixel(540, (y + 18 + 21) as u32).0[3], 0);
    }

    #[test]
    fn empty_text_renders_nothing() {
        let renderer = builtin_renderer();
        let canvas = Resolution { width: 64, height: 64 };
        let image = rasterize(&renderer, &OverlaySpec::new(OverlaySlot::Top, "  "), canvas);
        assert!(image.pixels().all(|p| p.0[3] == 0));
    }
}
