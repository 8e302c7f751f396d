// SPDX-License-Identifier: MIT
use ratatui::buffer::Buffer;
use ratatui::layout::Rect;
use ratatui::text::{Line, Span};
use ratatui::widgets::{Paragraph, Widget};

use crate::clock::ns_to_secs_f64;
use crate::pipeline::session::SessionSnapshot;
use crate::tui::theme::{BLOCK_FULL, BLOCK_LIGHT, HEAD_MARKER, Theme};

/// Column of `ts_ns` on a `width`-cell bar spanning `[oldest, latest]`.
#[must_use]
pub fn column_for(ts_ns: u64, oldest: u64, latest: u64, width: u16) -> u16 {
    if width == 0 {
        return 0;
    }
    let last = u64::from(width - 1);
    let span = latest.saturating_sub(oldest);
    if span == 0 {
        return 0;
    }
    let offset = ts_ns.clamp(oldest, latest) - oldest;
    #[allow(clippy::cast_possible_truncation)]
    let column = (u128::from(offset) * u128::from(last) / u128::from(span)) as u16;
    column
}

/// Buffer contents over time: aired frames solid, frames still inside the
/// delay window shaded, the read head marked above.
struct TimelineWidget<'a> {
    snapshot: &'a SessionSnapshot,
    theme: &'a Theme,
}

impl Widget for TimelineWidget<'_> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let Some((oldest, latest)) = self.snapshot.buffer_bounds else {
            return;
        };
        if area.height < 3 || area.width < 2 {
            return;
        }

        let head_y = area.y;
        let bar_y = area.y + 1;
        let label_y = area.y + 2;
        let aired_edge = latest.saturating_sub(self.snapshot.delay_ns);
        let edge_col = if aired_edge < oldest {
            None
        } else {
            Some(column_for(aired_edge, oldest, latest, area.width))
        };

        for col in 0..area.width {
            let aired = edge_col.is_some_and(|edge| col <= edge);
            let (ch, style) = if aired {
                (BLOCK_FULL, self.theme.timeline_buffer)
            } else {
                (BLOCK_LIGHT, self.theme.timeline_unaired)
            };
            buf[(area.x + col, bar_y)].set_char(ch).set_style(style);
        }

        if let Some(shown) = self.snapshot.displayed_ns {
            let col = column_for(shown, oldest, latest, area.width);
            buf[(area.x + col, head_y)]
                .set_char(HEAD_MARKER)
                .set_style(self.theme.timeline_head);
        }

        let left = format!("-{:.0}s", ns_to_secs_f64(latest - oldest));
        let labels = Line::from(vec![
            Span::raw(format!(
                "{left:<width$}",
                width = usize::from(area.width).saturating_sub(3)
            )),
            Span::raw("now"),
        ]);
        Paragraph::new(labels).render(Rect::new(area.x, label_y, area.width, 1), buf);
    }
}

pub fn render(frame: &mut ratatui::Frame, area: Rect, snapshot: &SessionSnapshot, theme: &Theme) {
    if area.height < 1 || area.width < 2 {
        return;
    }
    if snapshot.buffer_bounds.is_none() {
        frame.render_widget(Paragraph::new("Waiting for frames..."), area);
        return;
    }
    frame.render_widget(TimelineWidget { snapshot, theme }, area);
}
