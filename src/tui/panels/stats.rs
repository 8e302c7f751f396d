// SPDX-License-Identifier: MIT
use num_format::{Locale, ToFormattedString};
use ratatui::layout::Rect;
use ratatui::text::Line;
use ratatui::widgets::Paragraph;

use crate::clock::ns_to_secs_f64;
use crate::pipeline::session::SessionSnapshot;
use crate::tui::theme::Theme;

pub struct BufferStats<'a> {
    pub snapshot: &'a SessionSnapshot,
    pub buffer_capacity_ns: u64,
    pub frames_ingested: u64,
    pub playback_ticks: u64,
    pub zoom: f32,
    pub exports_running: usize,
}

pub fn render(frame: &mut ratatui::Frame, area: Rect, stats: &BufferStats<'_>, theme: &Theme) {
    if area.height < 2 || area.width < 10 {
        return;
    }

    let snapshot = stats.snapshot;
    let span_ns = snapshot
        .buffer_bounds
        .map_or(0, |(oldest, latest)| latest - oldest);
    let lag = snapshot
        .displayed_ns
        .map_or_else(|| "-".to_string(), |ts| {
            format!("{:.2} s", ns_to_secs_f64(snapshot.now_ns.saturating_sub(ts)))
        });

    let mut lines = vec![
        Line::from(format!(
            "Buffered:   {} frames ({:.1} s of {:.0} s)",
            snapshot.buffered_frames.to_formatted_string(&Locale::en),
            ns_to_secs_f64(span_ns),
            ns_to_secs_f64(stats.buffer_capacity_ns),
        )),
        Line::from(format!(
            "Evicted:    {}",
            snapshot.evicted_frames.to_formatted_string(&Locale::en)
        )),
        Line::from(format!(
            "Captured:   {}",
            stats.frames_ingested.to_formatted_string(&Locale::en)
        )),
        Line::from(format!(
            "Ticks:      {}",
            stats.playback_ticks.to_formatted_string(&Locale::en)
        )),
        Line::from(format!("Lag:        {lag}")),
        Line::from(format!("Zoom:       {:.1}x", stats.zoom)),
    ];
    if stats.exports_running > 0 {
        lines.push(Line::styled(
            format!("Exporting:  {} clip(s)", stats.exports_running),
            theme.state_buffering,
        ));
    }

    frame.render_widget(Paragraph::new(lines), area);
}
