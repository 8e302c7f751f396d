// SPDX-License-Identifier: MIT
#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]

mod clip;
mod clock;
mod config;
mod error;
mod pipeline;
mod tui;

use std::fs::File;
use std::io::{self, Stdout, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use crossterm::event::{self, Event, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::clip::format::CLIP_EXTENSION;
use crate::clip::reader::{ClipPlayer, ClipReader};
use crate::clock::{Clock, MonotonicClock, NANOS_PER_SECOND, ns_to_secs_f64};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::pipeline::driver::{LatestFrameSink, StatsSink};
use crate::pipeline::export::{ExportJob, ExportSummary};
use crate::pipeline::session::{Session, SessionEvent, SessionState};
use crate::pipeline::source::{ClipSource, FrameSource, TestPatternSource};
use crate::tui::app::App;
use crate::tui::input::{Action, handle_key};

const EVENT_POLL_TIMEOUT: Duration = Duration::from_millis(16);
const HEADLESS_POLL_INTERVAL: Duration = Duration::from_millis(100);
const HEADLESS_STATUS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "delaycam", about = "delaycam: delayed camera playback")]
struct Cli {
    /// Write logs to this file (RUST_LOG sets the level, default warn)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct SessionArgs {
    /// Playback delay in seconds: 5, 7 or 10
    #[arg(short, long, default_value = "7")]
    delay: u64,
    /// Seconds of history to keep (60-300)
    #[arg(short, long, default_value = "60")]
    buffer: u64,
    /// Use the front-facing camera (mirrored on display)
    #[arg(long)]
    front: bool,
    /// Capture frame rate (only 30 is supported)
    #[arg(long, default_value = "30")]
    fps: u32,
    /// Sensor mounting angle in degrees, clockwise
    #[arg(long, default_value = "0")]
    rotation: u32,
    /// Test pattern width in pixels
    #[arg(long, default_value = "128")]
    width: u32,
    /// Test pattern height in pixels
    #[arg(long, default_value = "72")]
    height: u32,
    /// Loop an exported clip instead of the test pattern
    #[arg(long)]
    source: Option<PathBuf>,
    /// Make the test pattern camera fail after this many frames
    #[arg(long)]
    fail_after: Option<u64>,
}

impl SessionArgs {
    fn config(&self) -> Result<SessionConfig> {
        SessionConfig::new(self.delay, self.buffer, self.front, self.rotation)
            .and_then(|config| config.with_capture_fps(self.fps))
            .context("invalid session settings")
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive delayed playback
    Live {
        #[command(flatten)]
        session: SessionArgs,
        /// Directory for clips exported with `e`
        #[arg(long, default_value = ".")]
        export_dir: PathBuf,
        /// Length of exported clips in seconds
        #[arg(long, default_value = "10")]
        export_seconds: u64,
    },
    /// Run a session without TUI (headless)
    Record {
        #[command(flatten)]
        session: SessionArgs,
        #[arg(long, default_value = "15")]
        duration: u64,
        /// Export the last `--export-seconds` here when done
        #[arg(short, long)]
        export: Option<PathBuf>,
        #[arg(long, default_value = "10")]
        export_seconds: u64,
    },
    /// Replay an exported clip
    Play { path: PathBuf },
    /// Dump per-frame clip statistics to CSV
    Dump {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Write one clip frame as PNG
    Snapshot {
        input: PathBuf,
        #[arg(long, default_value = "0")]
        index: usize,
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let interactive = matches!(cli.command, Commands::Live { .. } | Commands::Play { .. });
    init_logging(cli.log_file.as_deref(), interactive)?;

    match cli.command {
        Commands::Live {
            session,
            export_dir,
            export_seconds,
        } => cmd_live(&session, &export_dir, export_seconds),
        Commands::Record {
            session,
            duration,
            export,
            export_seconds,
        } => cmd_record(&session, duration, export, export_seconds),
        Commands::Play { path } => cmd_play(&path),
        Commands::Dump { input, output } => cmd_dump(&input, &output),
        Commands::Snapshot {
            input,
            index,
            output,
        } => cmd_snapshot(&input, index, &output),
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// The TUI owns the terminal, so interactive runs log to `--log-file` or
/// nowhere; headless runs default to stderr.
fn init_logging(log_file: Option<&Path>, interactive: bool) -> Result<()> {
    let writer = match (log_file, interactive) {
        (Some(path), _) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create log file: {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        (None, true) => BoxMakeWriter::new(io::sink),
        (None, false) => BoxMakeWriter::new(io::stderr),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(writer)
        .with_ansi(log_file.is_none() && !interactive)
        .with_thread_names(true)
        .init();
    Ok(())
}

// ---------------------------------------------------------------------------
// Signal handling
// ---------------------------------------------------------------------------

fn install_signal_handler() -> Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))
        .context("failed to register SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
        .context("failed to register SIGTERM handler")?;
    Ok(shutdown)
}

// ---------------------------------------------------------------------------
// Terminal setup / teardown
// ---------------------------------------------------------------------------

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode().context("failed to enable raw mode")?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, EnterAlternateScreen)
        .context("failed to enter alternate screen")?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend).context("failed to create terminal")
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
    disable_raw_mode().context("failed to disable raw mode")?;
    crossterm::execute!(terminal.backend_mut(), LeaveAlternateScreen)
        .context("failed to leave alternate screen")?;
    terminal.show_cursor().context("failed to show cursor")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared: session startup
// ---------------------------------------------------------------------------

fn build_source(
    args: &SessionArgs,
    config: &SessionConfig,
    clock: &Arc<dyn Clock>,
) -> Result<Box<dyn FrameSource>> {
    match &args.source {
        Some(path) => {
            let reader = ClipReader::open(path)?;
            Ok(Box::new(ClipSource::new(Arc::clone(clock), reader)?))
        }
        None => {
            let mut source =
                TestPatternSource::new(Arc::clone(clock), config, args.width, args.height);
            if let Some(frames) = args.fail_after {
                source = source.with_failure_after(frames);
            }
            Ok(Box::new(source))
        }
    }
}

fn default_clip_path(dir: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("DELAY_%Y%m%d_%H%M%S");
    dir.join(format!("{stamp}.{CLIP_EXTENSION}"))
}

fn describe_event(event: &SessionEvent) -> String {
    let (at_ns, text) = match event {
        SessionEvent::StateChanged { from, to, at_ns } => {
            let text = match to {
                SessionState::Buffering => "Buffering...".to_string(),
                SessionState::Playing if *from == SessionState::Paused => "Back to live".to_string(),
                SessionState::Playing => "Delayed playback running".to_string(),
                SessionState::Paused => "Paused".to_string(),
                SessionState::Stopped => "Session stopped".to_string(),
                SessionState::Idle => "Idle".to_string(),
            };
            (*at_ns, text)
        }
        SessionEvent::IngestStalled {
            at_ns,
            last_frame_ns,
        } => {
            let text = match last_frame_ns {
                Some(last) => format!(
                    "Camera stalled {:.1}s ago, holding the last frame",
                    ns_to_secs_f64(at_ns.saturating_sub(*last))
                ),
                None => "Camera has not delivered a frame yet".to_string(),
            };
            (*at_ns, text)
        }
        SessionEvent::IngestRecovered { at_ns } => (*at_ns, "Camera recovered".to_string()),
        SessionEvent::CaptureFailed { at_ns, reason } => {
            (*at_ns, format!("Capture failed: {reason}"))
        }
    };
    format!("[{:.1}s] {text}", ns_to_secs_f64(at_ns))
}

// ---------------------------------------------------------------------------
// Live subcommand
// ---------------------------------------------------------------------------

fn cmd_live(args: &SessionArgs, export_dir: &Path, export_seconds: u64) -> Result<()> {
    let shutdown = install_signal_handler()?;
    let config = args.config()?;
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let source = build_source(args, &config, &clock)?;
    let sink = Arc::new(LatestFrameSink::default());

    let mut session = Session::start(config.clone(), clock, source, sink.clone())?;
    let events = session.take_events();
    let mut app = App::live(
        session.snapshot(),
        config.camera_facing,
        config.buffer_duration_ns(),
    );
    let mut exports: Vec<ExportJob> = Vec::new();

    let mut terminal = setup_terminal()?;
    let mut ctx = LiveLoop {
        shutdown: &shutdown,
        session: &session,
        events: events.as_ref(),
        sink: &sink,
        exports: &mut exports,
        export_dir,
        export_seconds,
    };
    let result = ctx.run(&mut app, &mut terminal);

    session.stop();
    restore_terminal(&mut terminal)?;

    for job in exports {
        let path = job.path().to_path_buf();
        match job.join() {
            Ok(summary) => eprintln!("{}", describe_export(&summary)),
            Err(e) => eprintln!("Export to {} failed: {e}", path.display()),
        }
    }
    if let Some(error) = session.failure() {
        return Err(error.into());
    }
    result
}

struct LiveLoop<'a> {
    shutdown: &'a AtomicBool,
    session: &'a Session,
    events: Option<&'a Receiver<SessionEvent>>,
    sink: &'a LatestFrameSink,
    exports: &'a mut Vec<ExportJob>,
    export_dir: &'a Path,
    export_seconds: u64,
}

impl LiveLoop<'_> {
    fn run(
        &mut self,
        app: &mut App,
        terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    ) -> Result<()> {
        loop {
            if self.shutdown.load(Ordering::Relaxed) || app.should_quit {
                break;
            }

            if event::poll(EVENT_POLL_TIMEOUT).context("failed to poll events")?
                && let Event::Key(key) = event::read().context("failed to read event")?
                && key.kind == KeyEventKind::Press
            {
                let action = handle_key(key.code, app.mode);
                app.handle_action(&action);
                if let Some(message) = self.apply(&action, app) {
                    app.status_message = message;
                }
            }

            if let Some(events) = self.events {
                while let Ok(event) = events.try_recv() {
                    app.status_message = describe_event(&event);
                }
            }
            self.poll_exports(app);

            let snapshot = self.session.snapshot();
            let frames_ingested = self.session.frames_ingested();
            let playback_ticks = self.session.playback_ticks();
            let exports_running = self.exports.len();
            if let Some(view) = app.live_view_mut() {
                view.snapshot = snapshot;
                view.frames_ingested = frames_ingested;
                view.playback_ticks = playback_ticks;
                view.exports_running = exports_running;
                view.frame = self.sink.latest();
            }

            terminal
                .draw(|f| app.render(f))
                .context("failed to draw frame")?;
        }
        Ok(())
    }

    /// Issues the session command for `action`. Returns a status line.
    fn apply(&mut self, action: &Action, app: &App) -> Option<String> {
        let session = self.session;
        let result = match *action {
            Action::TogglePause => session.toggle_pause().map(|state| match state {
                SessionState::Paused => "Paused".to_string(),
                _ => "Back to live".to_string(),
            }),
            Action::StepForward => step(session, 1),
            Action::StepBackward => step(session, -1),
            Action::ScrubForward => scrub_by(session, 1),
            Action::ScrubBackward => scrub_by(session, -1),
            Action::JumpOldest => ensure_paused(session)
                .and_then(|()| session.scrub_to(0))
                .map(|ts| format!("Oldest frame @ {:.1}s", ns_to_secs_f64(ts))),
            Action::JumpLatest => match session.state() {
                SessionState::Paused => session.resume().map(|()| "Back to live".to_string()),
                _ => Ok("Already live".to_string()),
            },
            Action::ZoomIn | Action::ZoomOut => {
                session.set_zoom(app.zoom());
                Ok(format!("Zoom {:.1}x", app.zoom()))
            }
            Action::Export => return Some(self.start_export()),
            Action::Quit | Action::SpeedUp | Action::SpeedDown | Action::None => return None,
        };
        Some(result.unwrap_or_else(|e| e.to_string()))
    }

    fn start_export(&mut self) -> String {
        let path = default_clip_path(self.export_dir);
        match self.session.export_recent(self.export_seconds, path.clone()) {
            Ok(job) => {
                let span = ns_to_secs_f64(job.range().duration_ns());
                self.exports.push(job);
                format!("Exporting {span:.1}s to {}...", path.display())
            }
            Err(e) => {
                error!(error = %e, "export rejected");
                format!("Export failed: {e}")
            }
        }
    }

    fn poll_exports(&mut self, app: &mut App) {
        for job in self.exports.iter_mut() {
            let path = job.path().display().to_string();
            match job.poll() {
                Some(Ok(summary)) => app.status_message = describe_export(&summary),
                Some(Err(e)) => app.status_message = format!("Export to {path} failed: {e}"),
                None => {}
            }
        }
        self.exports.retain(|job| !job.is_finished());
    }
}

fn ensure_paused(session: &Session) -> Result<(), SessionError> {
    if session.state() == SessionState::Playing {
        session.pause()?;
    }
    Ok(())
}

fn step(session: &Session, delta: i64) -> Result<String, SessionError> {
    ensure_paused(session)?;
    let ts = session.step(delta)?;
    Ok(format!("Frame @ {:.2}s", ns_to_secs_f64(ts)))
}

fn scrub_by(session: &Session, seconds: i64) -> Result<String, SessionError> {
    ensure_paused(session)?;
    let from = session.snapshot().paused_at_ns.unwrap_or(0);
    let by = seconds.unsigned_abs() * NANOS_PER_SECOND;
    let target = if seconds.is_negative() {
        from.saturating_sub(by)
    } else {
        from.saturating_add(by)
    };
    let ts = session.scrub_to(target)?;
    Ok(format!("Frame @ {:.2}s", ns_to_secs_f64(ts)))
}

// ---------------------------------------------------------------------------
// Record (headless) subcommand
// ---------------------------------------------------------------------------

fn cmd_record(
    args: &SessionArgs,
    duration_secs: u64,
    export: Option<PathBuf>,
    export_seconds: u64,
) -> Result<()> {
    let shutdown = install_signal_handler()?;
    let config = args.config()?;
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let source = build_source(args, &config, &clock)?;
    let sink = Arc::new(StatsSink::new(config.delay_ns()));

    let mut session = Session::start(config.clone(), clock, source, sink.clone())?;
    let events = session.take_events();

    eprintln!(
        "Running {} delay session ({} camera) for {duration_secs}s ...",
        config.delay, config.camera_facing
    );

    let max_duration = Duration::from_secs(duration_secs);
    let start = Instant::now();
    let mut last_status = Instant::now();

    loop {
        if shutdown.load(Ordering::Relaxed) {
            eprintln!("\nInterrupted.");
            break;
        }
        if session.state() == SessionState::Stopped {
            eprintln!("\nSession stopped.");
            break;
        }
        if start.elapsed() >= max_duration {
            eprintln!("\nDuration limit reached.");
            break;
        }

        std::thread::sleep(HEADLESS_POLL_INTERVAL);

        if let Some(events) = &events {
            while let Ok(event) = events.try_recv() {
                eprintln!("  {}", describe_event(&event));
            }
        }

        if last_status.elapsed() >= HEADLESS_STATUS_INTERVAL {
            print_session_status(start.elapsed(), &session);
            last_status = Instant::now();
        }
    }

    session.stop();
    let stats = sink.stats();
    eprintln!(
        "Finished: {} frames captured, {} ticks ({} delayed, {} held), worst delay error {:.1} ms",
        session.frames_ingested(),
        stats.rendered,
        stats.playing,
        stats.held,
        ns_to_secs_f64(stats.max_delay_error_ns) * 1_000.0,
    );

    if let Some(path) = export {
        let summary = session
            .exporter()
            .export(session.recent_range(export_seconds)?, &path)?;
        eprintln!("{}", describe_export(&summary));
    }

    if let Some(error) = session.failure() {
        return Err(error.into());
    }
    Ok(())
}

fn describe_export(summary: &ExportSummary) -> String {
    let mirrored = if summary.orientation.mirror { ", mirrored" } else { "" };
    format!(
        "Exported {} frames ({:.1}s, {}x{}, rotated {}\u{b0}{mirrored}) to {}",
        summary.frames,
        ns_to_secs_f64(summary.range.duration_ns()),
        summary.width,
        summary.height,
        summary.orientation.rotation.degrees(),
        summary.path.display()
    )
}

fn print_session_status(elapsed: Duration, session: &Session) {
    let snapshot = session.snapshot();
    let span = snapshot
        .buffer_bounds
        .map_or(0, |(oldest, latest)| latest - oldest);
    eprintln!(
        "  [{}s] {} | {} frames buffered ({:.1}s) | {} evicted",
        elapsed.as_secs(),
        snapshot.state,
        snapshot.buffered_frames,
        ns_to_secs_f64(span),
        snapshot.evicted_frames,
    );
    info!(state = %snapshot.state, buffered = snapshot.buffered_frames, "status");
}

// ---------------------------------------------------------------------------
// Play subcommand
// ---------------------------------------------------------------------------

fn cmd_play(path: &Path) -> Result<()> {
    let shutdown = install_signal_handler()?;
    let reader = ClipReader::open(path)?;
    if reader.frame_count() == 0 {
        bail!("{} has no frames", path.display());
    }
    let name = path
        .file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());

    let mut app = App::play(name, ClipPlayer::new(reader));

    let mut terminal = setup_terminal()?;
    let result = run_play_loop(&shutdown, &mut app, &mut terminal);
    restore_terminal(&mut terminal)?;
    if let Some(player) = app.clip_player() {
        eprintln!(
            "Stopped at frame {} of {}",
            player.current_index() + 1,
            player.total_frames()
        );
    }
    result
}

fn run_play_loop(
    shutdown: &Arc<AtomicBool>,
    app: &mut App,
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::Relaxed) || app.should_quit {
            break;
        }

        if event::poll(EVENT_POLL_TIMEOUT).context("failed to poll events")?
            && let Event::Key(key) = event::read().context("failed to read event")?
            && key.kind == KeyEventKind::Press
        {
            let action = handle_key(key.code, app.mode);
            app.handle_action(&action);
        }

        app.advance_clip();

        terminal
            .draw(|f| app.render(f))
            .context("failed to draw frame")?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Dump subcommand
// ---------------------------------------------------------------------------

fn cmd_dump(input: &Path, output: &Path) -> Result<()> {
    let reader = ClipReader::open(input)?;
    let total = reader.frame_count();

    let mut out = File::create(output)
        .with_context(|| format!("failed to create {}", output.display()))?;

    write_csv_header(&mut out)?;
    for (i, frame) in reader.frames().iter().enumerate() {
        writeln!(
            out,
            "{i},{},{},{},{:.3}",
            frame.offset_ns,
            frame.width,
            frame.height,
            frame.mean_luma()
        )
        .context("failed to write CSV row")?;
    }

    eprintln!(
        "Dumped {total} frames from {} to {}",
        input.display(),
        output.display()
    );
    Ok(())
}

fn write_csv_header(out: &mut impl Write) -> Result<()> {
    writeln!(out, "frame,offset_ns,width,height,mean_luma").context("failed to write CSV header")
}

// ---------------------------------------------------------------------------
// Snapshot subcommand
// ---------------------------------------------------------------------------

fn cmd_snapshot(input: &Path, index: usize, output: &Path) -> Result<()> {
    let reader = ClipReader::open(input)?;
    let Some(frame) = reader.frame_at(index) else {
        bail!(
            "frame {index} out of range ({} has {} frames)",
            input.display(),
            reader.frame_count()
        );
    };
    let image = frame
        .to_image()
        .with_context(|| format!("frame {index} has a corrupt pixel buffer"))?;
    image
        .save(output)
        .with_context(|| format!("failed to write {}", output.display()))?;

    eprintln!(
        "Wrote frame {index} ({}x{}) to {}",
        image.width(),
        image.height(),
        output.display()
    );
    Ok(())
}
