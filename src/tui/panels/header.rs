// SPDX-License-Identifier: MIT
use ratatui::layout::Rect;
use ratatui::text::{Line, Span};
use ratatui::widgets::Paragraph;

use crate::clip::format::ClipMetadata;
use crate::clock::ns_to_secs_f64;
use crate::config::CameraFacing;
use crate::pipeline::session::{SessionSnapshot, SessionState};
use crate::tui::theme::Theme;

pub enum HeaderInfo<'a> {
    Live {
        snapshot: &'a SessionSnapshot,
        camera: CameraFacing,
    },
    Play {
        metadata: &'a ClipMetadata,
        name: &'a str,
    },
}

/// Short state label, e.g. `BUFFERING 3s` or `PAUSED @ 12.4s`.
#[must_use]
pub fn state_label(snapshot: &SessionSnapshot) -> String {
    match snapshot.state {
        SessionState::Buffering => {
            let secs = snapshot.countdown_ns.div_ceil(1_000_000_000);
            format!("BUFFERING {secs}s")
        }
        SessionState::Paused => snapshot.paused_at_ns.map_or_else(
            || "PAUSED".to_string(),
            |ts| format!("PAUSED @ {:.1}s", ns_to_secs_f64(ts)),
        ),
        other => other.to_string().to_uppercase(),
    }
}

pub fn render(frame: &mut ratatui::Frame, area: Rect, info: &HeaderInfo<'_>, theme: &Theme) {
    if area.height == 0 || area.width == 0 {
        return;
    }

    let version = env!("CARGO_PKG_VERSION");

    let spans = match info {
        HeaderInfo::Live { snapshot, camera } => {
            let mut spans = vec![
                Span::styled(
                    format!(
                        "delaycam v{version} | LIVE | delay {}s | {camera} camera | ",
                        snapshot.delay_ns / 1_000_000_000
                    ),
                    theme.status_bar,
                ),
                Span::styled(state_label(snapshot), theme.state(snapshot.state)),
            ];
            if snapshot.stalled {
                spans.push(Span::styled(" | CAMERA STALLED", theme.warning));
            }
            if let Some(reason) = &snapshot.failure {
                spans.push(Span::styled(format!(" | {reason}"), theme.warning));
            }
            spans
        }
        HeaderInfo::Play { metadata, name } => vec![Span::styled(
            format!(
                "delaycam v{version} | CLIP {name} | {} camera | {}x{} @ {} fps | rotated {}\u{b0}{}",
                if metadata.front_facing { "front" } else { "back" },
                metadata.width,
                metadata.height,
                metadata.capture_fps,
                metadata.orientation.rotation_degrees,
                if metadata.orientation.mirrored {
                    ", mirrored"
                } else {
                    ""
                },
            ),
            theme.status_bar,
        )],
    };

    frame.render_widget(Paragraph::new(Line::from(spans)).style(theme.status_bar), area);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(state: SessionState) -> SessionSnapshot {
        SessionSnapshot {
            state,
            delay_ns: 7_000_000_000,
            countdown_ns: 2_400_000_000,
            paused_at_ns: Some(12_400_000_000),
            displayed_ns: None,
            stalled: false,
            failure: None,
            buffer_bounds: None,
            buffered_frames: 0,
            evicted_frames: 0,
            now_ns: 0,
        }
    }

    #[test]
    fn labels() {
        assert_eq!(state_label(&snapshot(SessionState::Buffering)), "BUFFERING 3s");
        assert_eq!(state_label(&snapshot(SessionState::Paused)), "PAUSED @ 12.4s");
        assert_eq!(state_label(&snapshot(SessionState::Playing)), "PLAYING");
        assert_eq!(state_label(&snapshot(SessionState::Stopped)), "STOPPED");
    }
}
