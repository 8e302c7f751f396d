// SPDX-License-Identifier: MIT
use ratatui::style::{Color, Modifier, Style};

use crate::pipeline::session::SessionState;

pub struct Theme {
    pub state_idle: Style,
    pub state_buffering: Style,
    pub state_playing: Style,
    pub state_paused: Style,
    pub state_stopped: Style,
    pub warning: Style,
    pub timeline_buffer: Style,
    pub timeline_unaired: Style,
    pub timeline_head: Style,
    pub border_normal: Style,
    pub border_selected: Style,
    pub title: Style,
    pub status_bar: Style,
}

impl Theme {
    #[must_use]
    pub fn state(&self, state: SessionState) -> Style {
        match state {
            SessionState::Idle => self.state_idle,
            SessionState::Buffering => self.state_buffering,
            SessionState::Playing => self.state_playing,
            SessionState::Paused => self.state_paused,
            SessionState::Stopped => self.state_stopped,
        }
    }
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            state_idle: Style::default().fg(Color::Gray),
            state_buffering: Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
            state_playing: Style::default()
                .fg(Color::Green)
                .add_modifier(Modifier::BOLD),
            state_paused: Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
            state_stopped: Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
            warning: Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
            timeline_buffer: Style::default().fg(Color::Blue),
            timeline_unaired: Style::default().fg(Color::DarkGray),
            timeline_head: Style::default()
                .fg(Color::White)
                .add_modifier(Modifier::BOLD),
            border_normal: Style::default().fg(Color::White),
            border_selected: Style::default().fg(Color::Cyan),
            title: Style::default()
                .fg(Color::White)
                .add_modifier(Modifier::BOLD),
            status_bar: Style::default().fg(Color::Black).bg(Color::White),
        }
    }
}

pub const BLOCK_FULL: char = '\u{2588}';
pub const BLOCK_LIGHT: char = '\u{2591}';
pub const UPPER_HALF: char = '\u{2580}';
pub const HEAD_MARKER: char = '\u{25BC}';
