// SPDX-License-Identifier: MIT
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Gauge, Paragraph};

use super::theme::Theme;
use crate::clip::reader::ClipPlayer;
use crate::clock::NANOS_PER_SECOND;

fn format_time(offset_ns: u64) -> String {
    let total_seconds = offset_ns / NANOS_PER_SECOND;
    let tenths = offset_ns % NANOS_PER_SECOND / (NANOS_PER_SECOND / 10);
    let minutes = total_seconds / 60;
    let seconds = total_seconds % 60;
    format!("{minutes:02}:{seconds:02}.{tenths}")
}

fn bar_block(theme: &Theme) -> Block<'static> {
    Block::default()
        .title(" Playback ")
        .borders(Borders::ALL)
        .border_style(theme.border_normal)
        .title_style(theme.title)
}

fn key_help(keys: &[(&'static str, &'static str)], theme: &Theme) -> Line<'static> {
    let spans: Vec<Span<'static>> = keys
        .iter()
        .flat_map(|&(key, what)| {
            [
                Span::styled(key, theme.title),
                Span::raw(format!(" {what}  ")),
            ]
        })
        .collect();
    Line::from(spans)
}

/// Clip replay bar: progress gauge plus key help.
pub fn render_clip(
    frame: &mut ratatui::Frame,
    area: Rect,
    player: &ClipPlayer,
    theme: &Theme,
) {
    if area.height < 4 || area.width < 20 {
        return;
    }

    let block = bar_block(theme);
    let inner = block.inner(area);
    frame.render_widget(block, area);

    if inner.height < 2 || inner.width < 10 {
        return;
    }

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1), Constraint::Length(1)])
        .split(inner);

    let status_icon = if player.is_paused() {
        "\u{23F8}"
    } else if player.is_finished() {
        "\u{23F9}"
    } else {
        "\u{25B6}"
    };
    let offset_ns = player.current_frame().map_or(0, |f| f.offset_ns);
    let gauge_label = format!(
        " {status_icon} {:.2}x  {}  [{}/{}]",
        player.speed(),
        format_time(offset_ns),
        player.current_index() + 1,
        player.total_frames()
    );
    let gauge = Gauge::default()
        .ratio(player.progress_fraction().clamp(0.0, 1.0))
        .label(gauge_label)
        .gauge_style(theme.border_selected);
    frame.render_widget(gauge, rows[0]);

    let help = key_help(
        &[
            ("[Space]", "Pause"),
            ("[\u{2190}/\u{2192}]", "Step"),
            ("[[/]]", "Speed"),
            ("[Home/End]", "Jump"),
            ("[q]", "Quit"),
        ],
        theme,
    );
    frame.render_widget(Paragraph::new(help), rows[1]);
}

/// Live session bar: last status message plus key help.
pub fn render_live(frame: &mut ratatui::Frame, area: Rect, message: &str, theme: &Theme) {
    if area.height < 4 || area.width < 20 {
        return;
    }

    let block = bar_block(theme);
    let inner = block.inner(area);
    frame.render_widget(block, area);

    if inner.height < 2 || inner.width < 10 {
        return;
    }

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1), Constraint::Length(1)])
        .split(inner);

    frame.render_widget(Paragraph::new(message.to_string()), rows[0]);
    let help = key_help(
        &[
            ("[Space]", "Pause"),
            ("[\u{2190}/\u{2192}]", "Step"),
            ("[[/]]", "\u{b1}1s"),
            ("[Home/End]", "Oldest/Live"),
            ("[e]", "Export"),
            ("[+/-]", "Zoom"),
            ("[q]", "Quit"),
        ],
        theme,
    );
    frame.render_widget(Paragraph::new(help), rows[1]);
}
