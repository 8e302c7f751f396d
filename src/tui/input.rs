// SPDX-License-Identifier: MIT
use crossterm::event::KeyCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Delayed playback of a running session.
    Live,
    /// Replay of an exported clip.
    Play,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Quit,
    TogglePause,
    StepForward,
    StepBackward,
    ScrubForward,
    ScrubBackward,
    SpeedUp,
    SpeedDown,
    JumpOldest,
    JumpLatest,
    Export,
    ZoomIn,
    ZoomOut,
    None,
}

#[must_use]
pub fn handle_key(key: KeyCode, mode: Mode) -> Action {
    let live = mode == Mode::Live;
    match key {
        KeyCode::Char('q') | KeyCode::Esc => Action::Quit,
        KeyCode::Char(' ') => Action::TogglePause,
        KeyCode::Right => Action::StepForward,
        KeyCode::Left => Action::StepBackward,
        KeyCode::Home => Action::JumpOldest,
        KeyCode::End => Action::JumpLatest,
        KeyCode::Char(']') if live => Action::ScrubForward,
        KeyCode::Char('[') if live => Action::ScrubBackward,
        KeyCode::Char(']') => Action::SpeedUp,
        KeyCode::Char('[') => Action::SpeedDown,
        KeyCode::Char('e') if live => Action::Export,
        KeyCode::Char('+' | '=') if live => Action::ZoomIn,
        KeyCode::Char('-' | '_') if live => Action::ZoomOut,
        _ => Action::None,
    }
}
