// SPDX-License-Identifier: MIT
use image::RgbImage;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::widgets::{Block, Borders};

use super::input::{Action, Mode};
use super::panels::stats::BufferStats;
use super::panels::{header, stats, timeline, viewport};
use super::playback_bar;
use super::theme::Theme;
use crate::clip::format::ClipFrame;
use crate::clip::reader::ClipPlayer;
use crate::clock::ns_to_secs_f64;
use crate::config::CameraFacing;
use crate::pipeline::driver::DisplayedFrame;
use crate::pipeline::frame::DisplayTransform;
use crate::pipeline::session::SessionSnapshot;
use crate::pipeline::source::{MAX_ZOOM, MIN_ZOOM};

const PLAYBACK_BAR_HEIGHT: u16 = 4;
const TIMELINE_HEIGHT: u16 = 5;
const STATS_WIDTH: u16 = 40;
const ZOOM_STEP: f32 = 0.5;

pub struct LiveView {
    pub snapshot: SessionSnapshot,
    pub camera: CameraFacing,
    pub buffer_capacity_ns: u64,
    pub frames_ingested: u64,
    pub playback_ticks: u64,
    pub exports_running: usize,
    pub frame: Option<DisplayedFrame>,
}

pub struct ClipView {
    pub name: String,
    pub player: ClipPlayer,
    image: Option<RgbImage>,
    shown_index: usize,
}

impl ClipView {
    /// Reloads the image after the player moved.
    fn refresh(&mut self) {
        let index = self.player.current_index();
        if self.image.is_some() && index == self.shown_index {
            return;
        }
        self.image = self.player.current_frame().and_then(ClipFrame::to_image);
        self.shown_index = index;
    }
}

pub struct App {
    pub mode: Mode,
    pub should_quit: bool,
    pub theme: Theme,
    pub status_message: String,
    zoom: f32,
    live: Option<LiveView>,
    clip: Option<ClipView>,
}

impl App {
    #[must_use]
    pub fn live(snapshot: SessionSnapshot, camera: CameraFacing, buffer_capacity_ns: u64) -> Self {
        Self {
            mode: Mode::Live,
            should_quit: false,
            theme: Theme::default(),
            status_message: String::from("Buffering..."),
            zoom: MIN_ZOOM,
            live: Some(LiveView {
                snapshot,
                camera,
                buffer_capacity_ns,
                frames_ingested: 0,
                playback_ticks: 0,
                exports_running: 0,
                frame: None,
            }),
            clip: None,
        }
    }

    #[must_use]
    pub fn play(name: String, player: ClipPlayer) -> Self {
        let mut clip = ClipView {
            name,
            player,
            image: None,
            shown_index: 0,
        };
        clip.refresh();
        Self {
            mode: Mode::Play,
            should_quit: false,
            theme: Theme::default(),
            status_message: String::new(),
            zoom: MIN_ZOOM,
            live: None,
            clip: Some(clip),
        }
    }

    #[must_use]
    pub fn zoom(&self) -> f32 {
        self.zoom
    }

    pub fn live_view_mut(&mut self) -> Option<&mut LiveView> {
        self.live.as_mut()
    }

    #[must_use]
    pub fn clip_player(&self) -> Option<&ClipPlayer> {
        self.clip.as_ref().map(|c| &c.player)
    }

    /// Lets the clip player emit its next frame if one is due.
    pub fn advance_clip(&mut self) {
        if let Some(clip) = self.clip.as_mut()
            && clip.player.next_frame().is_some()
        {
            clip.refresh();
        }
    }

    /// Applies the parts of an action that only touch view state. Session
    /// commands are issued by the caller.
    pub fn handle_action(&mut self, action: &Action) {
        match *action {
            Action::Quit => self.should_quit = true,
            Action::ZoomIn => self.zoom = (self.zoom + ZOOM_STEP).min(MAX_ZOOM),
            Action::ZoomOut => self.zoom = (self.zoom - ZOOM_STEP).max(MIN_ZOOM),
            _ => {}
        }

        let Some(clip) = self.clip.as_mut() else {
            return;
        };
        let player = &mut clip.player;
        match *action {
            Action::TogglePause => player.toggle_pause(),
            Action::StepForward => player.step(1),
            Action::StepBackward => player.step(-1),
            Action::SpeedUp => player.speed_up(),
            Action::SpeedDown => player.speed_down(),
            Action::JumpOldest => player.seek_to(0),
            Action::JumpLatest => player.seek_end(),
            _ => {}
        }
        clip.refresh();
    }

    pub fn render(&self, frame: &mut ratatui::Frame) {
        let outer = frame.area();
        if outer.height < 2 || outer.width < 5 {
            return;
        }

        if let Some(live) = &self.live {
            self.render_live(frame, outer, live);
        } else if let Some(clip) = &self.clip {
            self.render_clip(frame, outer, clip);
        }
    }

    fn render_live(&self, frame: &mut ratatui::Frame, outer: Rect, live: &LiveView) {
        let vertical = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(1),
                Constraint::Min(3),
                Constraint::Length(TIMELINE_HEIGHT),
                Constraint::Length(PLAYBACK_BAR_HEIGHT),
            ])
            .split(outer);

        header::render(
            frame,
            vertical[0],
            &header::HeaderInfo::Live {
                snapshot: &live.snapshot,
                camera: live.camera,
            },
            &self.theme,
        );

        let body = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Min(10), Constraint::Length(STATS_WIDTH)])
            .split(vertical[1]);

        let title = match live.frame.as_ref().map(|f| f.info) {
            Some(info) if info.held => format!(
                " Delayed view ({:.1}s behind, held) ",
                ns_to_secs_f64(info.lag_ns())
            ),
            Some(info) => format!(" Delayed view ({:.1}s behind) ", ns_to_secs_f64(info.lag_ns())),
            None => " Delayed view ".to_string(),
        };
        let view_inner = self.panel(frame, body[0], &title);
        let image = live
            .frame
            .as_ref()
            .map(|f| (f.payload.as_ref(), f.transform));
        viewport::render(frame, view_inner, image, "Waiting for camera...", &self.theme);

        let stats_inner = self.panel(frame, body[1], " Buffer ");
        stats::render(
            frame,
            stats_inner,
            &BufferStats {
                snapshot: &live.snapshot,
                buffer_capacity_ns: live.buffer_capacity_ns,
                frames_ingested: live.frames_ingested,
                playback_ticks: live.playback_ticks,
                zoom: self.zoom,
                exports_running: live.exports_running,
            },
            &self.theme,
        );

        let timeline_inner = self.panel(frame, vertical[2], " Timeline ");
        timeline::render(frame, timeline_inner, &live.snapshot, &self.theme);

        playback_bar::render_live(frame, vertical[3], &self.status_message, &self.theme);
    }

    fn render_clip(&self, frame: &mut ratatui::Frame, outer: Rect, clip: &ClipView) {
        let vertical = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(1),
                Constraint::Min(3),
                Constraint::Length(PLAYBACK_BAR_HEIGHT),
            ])
            .split(outer);

        header::render(
            frame,
            vertical[0],
            &header::HeaderInfo::Play {
                metadata: clip.player.metadata(),
                name: &clip.name,
            },
            &self.theme,
        );

        let view_inner = self.panel(frame, vertical[1], " Clip ");
        // clip frames are stored upright
        let image = clip
            .image
            .as_ref()
            .map(|image| (image, DisplayTransform::default()));
        viewport::render(frame, view_inner, image, "Empty clip", &self.theme);

        playback_bar::render_clip(frame, vertical[2], &clip.player, &self.theme);
    }

    fn panel(&self, frame: &mut ratatui::Frame, area: Rect, title: &str) -> Rect {
        let block = Block::default()
            .title(title)
            .borders(Borders::ALL)
            .border_style(self.theme.border_normal)
            .title_style(self.theme.title);
        let inner = block.inner(area);
        frame.render_widget(block, area);
        inner
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::SystemTime;

    use ratatui::Terminal;
    use ratatui::backend::TestBackend;

    use super::*;
    use crate::clip::format::{ClipMetadata, Orientation};
    use crate::clip::reader::ClipReader;
    use crate::clip::writer::ClipWriter;
    use crate::pipeline::frame::Rotation;
    use crate::pipeline::session::SessionState;

    fn snapshot() -> SessionSnapshot {
        SessionSnapshot {
            state: SessionState::Buffering,
            delay_ns: 7_000_000_000,
            countdown_ns: 4_000_000_000,
            paused_at_ns: None,
            displayed_ns: None,
            stalled: false,
            failure: None,
            buffer_bounds: None,
            buffered_frames: 0,
            evicted_frames: 0,
            now_ns: 3_000_000_000,
        }
    }

    fn metadata() -> ClipMetadata {
        ClipMetadata {
            capture_fps: 30,
            orientation: Orientation::default(),
            source_rotation: Rotation::Deg0,
            front_facing: false,
            width: 4,
            height: 4,
            range_start_ns: 0,
            range_end_ns: 1_000_000_000,
            created: SystemTime::UNIX_EPOCH,
        }
    }

    /// Writes a clip of solid frames whose red channel is the frame index.
    fn player(name: &str, frames: u8) -> (ClipPlayer, PathBuf) {
        let dir = std::env::temp_dir().join(format!("delaycam_app_{name}_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("clip.dlyc");
        let mut writer = ClipWriter::create(&path, &metadata()).unwrap();
        for i in 0..frames {
            let image = RgbImage::from_pixel(4, 4, image::Rgb([i, 9, 9]));
            writer
                .write_frame(&ClipFrame::from_image(u64::from(i) * 33_333_333, image))
                .unwrap();
        }
        writer.finish().unwrap();
        (ClipPlayer::new(ClipReader::open(&path).unwrap()), dir)
    }

    fn shown_red(app: &App) -> u8 {
        app.clip.as_ref().unwrap().image.as_ref().unwrap().get_pixel(0, 0)[0]
    }

    #[test]
    fn zoom_steps_are_clamped() {
        let mut app = App::live(snapshot(), CameraFacing::Back, 60_000_000_000);
        app.handle_action(&Action::ZoomOut);
        assert!((app.zoom() - MIN_ZOOM).abs() < f32::EPSILON);
        for _ in 0..40 {
            app.handle_action(&Action::ZoomIn);
        }
        assert!((app.zoom() - MAX_ZOOM).abs() < f32::EPSILON);
    }

    #[test]
    fn clip_transport_drives_the_player() {
        let (player, dir) = player("transport", 10);
        let mut app = App::play("clip".into(), player);
        assert_eq!(shown_red(&app), 0);

        app.handle_action(&Action::JumpLatest);
        assert_eq!(app.clip_player().unwrap().current_index(), 9);
        assert_eq!(shown_red(&app), 9);

        app.handle_action(&Action::StepBackward);
        let player = app.clip_player().unwrap();
        assert_eq!(player.current_index(), 8);
        assert!(player.is_paused());
        assert_eq!(shown_red(&app), 8);

        app.handle_action(&Action::SpeedUp);
        assert!((app.clip_player().unwrap().speed() - 2.0).abs() < f64::EPSILON);

        app.handle_action(&Action::JumpOldest);
        assert_eq!(shown_red(&app), 0);

        app.handle_action(&Action::Quit);
        assert!(app.should_quit);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn paused_clip_does_not_advance() {
        let (player, dir) = player("paused", 3);
        let mut app = App::play("clip".into(), player);
        app.handle_action(&Action::TogglePause);
        std::thread::sleep(std::time::Duration::from_millis(50));
        app.advance_clip();
        assert_eq!(app.clip_player().unwrap().current_index(), 0);

        app.handle_action(&Action::TogglePause);
        std::thread::sleep(std::time::Duration::from_millis(50));
        app.advance_clip();
        assert_eq!(app.clip_player().unwrap().current_index(), 1);
        assert_eq!(shown_red(&app), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn renders_live_and_clip_layouts() {
        let backend = TestBackend::new(100, 30);
        let mut terminal = Terminal::new(backend).unwrap();

        let app = App::live(snapshot(), CameraFacing::Front, 60_000_000_000);
        terminal.draw(|f| app.render(f)).unwrap();
        let text: String = terminal
            .backend()
            .buffer()
            .content()
            .iter()
            .map(ratatui::buffer::Cell::symbol)
            .collect();
        assert!(text.contains("BUFFERING 4s"));
        assert!(text.contains("Waiting for camera..."));

        let (player, dir) = player("render", 1);
        let app = App::play("clip".into(), player);
        terminal.draw(|f| app.render(f)).unwrap();
        let text: String = terminal
            .backend()
            .buffer()
            .content()
            .iter()
            .map(ratatui::buffer::Cell::symbol)
            .collect();
        assert!(text.contains("CLIP clip"));
        assert!(text.contains("[1/1]"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
