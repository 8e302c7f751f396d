// SPDX-License-Identifier: MIT
use image::RgbImage;
use ratatui::buffer::Buffer;
use ratatui::layout::Rect;
use ratatui::style::Color;
use ratatui::widgets::{Paragraph, Widget};

use crate::pipeline::frame::DisplayTransform;
use crate::tui::theme::{Theme, UPPER_HALF};

/// Draws a raw frame with its display transform applied, two image rows per
/// terminal cell (upper half in the foreground colour, lower half in the
/// background).
struct FrameView<'a> {
    image: &'a RgbImage,
    transform: DisplayTransform,
}

/// Largest `(columns, rows)` that fits `cols` x `rows` cells while keeping the
/// aspect ratio of a `width` x `height` image. Each row holds two pixels.
#[must_use]
pub fn fit_cells(width: u32, height: u32, cols: u16, rows: u16) -> (u16, u16) {
    if width == 0 || height == 0 || cols == 0 || rows == 0 {
        return (0, 0);
    }
    let pixel_rows = u64::from(rows) * 2;
    // compare width/height against cols/pixel_rows without floats
    if u64::from(cols) * u64::from(height) > pixel_rows * u64::from(width) {
        let w = pixel_rows * u64::from(width) / u64::from(height);
        (u16::try_from(w).unwrap_or(cols).max(1), rows)
    } else {
        let h = u64::from(cols) * u64::from(height) / u64::from(width);
        (cols, u16::try_from(h / 2).unwrap_or(rows).max(1))
    }
}

impl Widget for FrameView<'_> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let (src_w, src_h) = self.image.dimensions();
        let (out_w, out_h) = self.transform.output_dimensions(src_w, src_h);
        let (cols, rows) = fit_cells(out_w, out_h, area.width, area.height);
        if cols == 0 || rows == 0 {
            return;
        }

        let x_offset = area.x + (area.width - cols) / 2;
        let y_offset = area.y + (area.height - rows) / 2;
        let pixel_rows = u32::from(rows) * 2;

        let sample = |x: u32, y: u32| {
            let (sx, sy) = self.transform.source_coords(
                x.min(out_w - 1),
                y.min(out_h - 1),
                src_w,
                src_h,
            );
            let p = self.image.get_pixel(sx.min(src_w - 1), sy.min(src_h - 1));
            Color::Rgb(p[0], p[1], p[2])
        };

        for ty in 0..rows {
            for tx in 0..cols {
                let x = u32::from(tx) * out_w / u32::from(cols);
                let y_top = u32::from(ty) * 2 * out_h / pixel_rows;
                let y_bottom = (u32::from(ty) * 2 + 1) * out_h / pixel_rows;

                if let Some(cell) = buf.cell_mut((x_offset + tx, y_offset + ty)) {
                    cell.set_char(UPPER_HALF)
                        .set_fg(sample(x, y_top))
                        .set_bg(sample(x, y_bottom));
                }
            }
        }
    }
}

pub fn render(
    frame: &mut ratatui::Frame,
    area: Rect,
    image: Option<(&RgbImage, DisplayTransform)>,
    placeholder: &str,
    theme: &Theme,
) {
    if area.height < 1 || area.width < 2 {
        return;
    }

    match image {
        Some((image, transform)) if image.width() > 0 && image.height() > 0 => {
            frame.render_widget(FrameView { image, transform }, area);
        }
        _ => {
            let paragraph = Paragraph::new(placeholder).style(theme.title);
            frame.render_widget(paragraph, area);
        }
    }
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;
    use crate::pipeline::frame::Rotation;

    #[test]
    fn fit_keeps_aspect_ratio() {
        // 16:9 into 80x24 cells = 80x48 pixels: width-limited
        assert_eq!(fit_cells(160, 90, 80, 24), (80, 22));
        // tall image: height-limited
        assert_eq!(fit_cells(90, 160, 80, 24), (27, 24));
        assert_eq!(fit_cells(0, 10, 80, 24), (0, 0));
    }

    #[test]
    fn draws_transformed_pixels() {
        // 2x2 sensor frame, red top-left
        let mut image = RgbImage::new(2, 2);
        image.put_pixel(0, 0, Rgb([255, 0, 0]));
        let area = Rect::new(0, 0, 2, 1);

        let mut buf = Buffer::empty(area);
        FrameView {
            image: &image,
            transform: DisplayTransform::default(),
        }
        .render(area, &mut buf);
        assert_eq!(buf[(0, 0)].fg, Color::Rgb(255, 0, 0));
        assert_eq!(buf[(1, 0)].fg, Color::Rgb(0, 0, 0));

        // rotated 90 clockwise: red moves to the top-right
        let mut buf = Buffer::empty(area);
        FrameView {
            image: &image,
            transform: DisplayTransform::for_capture(Rotation::Deg90, false),
        }
        .render(area, &mut buf);
        assert_eq!(buf[(0, 0)].fg, Color::Rgb(0, 0, 0));
        assert_eq!(buf[(1, 0)].fg, Color::Rgb(255, 0, 0));
        assert_eq!(buf[(1, 0)].symbol(), "\u{2580}");
    }
}
