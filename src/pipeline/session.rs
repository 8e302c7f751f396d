// SPDX-License-Identifier: MIT
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::{Clock, secs_to_ns};
use crate::config::{CameraFacing, SessionConfig};
use crate::error::{CaptureError, ExportError, SessionError};
use crate::pipeline::driver::{DisplaySink, DriverHandle, PlaybackDriver};
use crate::pipeline::export::{ClipExporter, ClipRange, ExportJob};
use crate::pipeline::frame::FrameRecord;
use crate::pipeline::ingest::{CaptureIngest, IngestWorker, SourceCommand};
use crate::pipeline::scheduler::{DelayScheduler, Selection};
use crate::pipeline::source::FrameSource;
use crate::pipeline::store::FrameStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Buffering,
    Playing,
    Paused,
    Stopped,
}

impl SessionState {
    /// Ingest is expected to be delivering frames.
    #[must_use]
    pub fn is_running(self) -> bool {
        matches!(self, Self::Buffering | Self::Playing | Self::Paused)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Buffering => "buffering",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Per-session configuration echo plus live state. Owned by the state
/// machine; nothing else keeps session-lifetime state.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub delay_ns: u64,
    pub state: SessionState,
    pub paused_at_ns: Option<u64>,
    pub session_start_ns: Option<u64>,
    #[allow(dead_code)]
    pub camera_facing: CameraFacing,
    #[allow(dead_code)]
    pub capture_fps: u32,
    pub frame_interval_ns: u64,
    pub stall_threshold_ns: u64,
    pub buffering_watchdog_ns: u64,
    pub stalled: bool,
    pub failure: Option<CaptureError>,
}

impl SessionContext {
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            delay_ns: config.delay_ns(),
            state: SessionState::Idle,
            paused_at_ns: None,
            session_start_ns: None,
            camera_facing: config.camera_facing,
            capture_fps: config.capture_fps,
            frame_interval_ns: config.frame_interval_ns(),
            stall_threshold_ns: config.stall_threshold_ns,
            buffering_watchdog_ns: config.buffering_watchdog_ns(),
            stalled: false,
            failure: None,
        }
    }
}

/// Notifications, delivered in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
        at_ns: u64,
    },
    IngestStalled {
        at_ns: u64,
        last_frame_ns: Option<u64>,
    },
    IngestRecovered {
        at_ns: u64,
    },
    CaptureFailed {
        at_ns: u64,
        reason: String,
    },
}

/// Point-in-time view of the session for status displays.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub delay_ns: u64,
    pub countdown_ns: u64,
    pub paused_at_ns: Option<u64>,
    pub displayed_ns: Option<u64>,
    pub stalled: bool,
    pub failure: Option<SessionError>,
    pub buffer_bounds: Option<(u64, u64)>,
    pub buffered_frames: usize,
    pub evicted_frames: u64,
    pub now_ns: u64,
}

pub struct TickOutcome {
    pub state: SessionState,
    pub selection: Selection,
}

struct MachineInner {
    ctx: SessionContext,
    scheduler: DelayScheduler,
}

/// Session lifecycle: `Idle -> Buffering -> Playing <-> Paused -> Stopped`.
///
/// All methods take the current time explicitly; the caller owns the clock.
/// Every transition is published on the event channel while the context lock
/// is held, so observers see transitions in the order they happened.
pub struct SessionMachine {
    store: Arc<FrameStore>,
    inner: Mutex<MachineInner>,
    events: Sender<SessionEvent>,
}

impl SessionMachine {
    #[must_use]
    pub fn new(config: &SessionConfig, store: Arc<FrameStore>) -> (Self, Receiver<SessionEvent>) {
        let (events, receiver) = mpsc::channel();
        let machine = Self {
            store,
            inner: Mutex::new(MachineInner {
                ctx: SessionContext::new(config),
                scheduler: DelayScheduler::new(config.delay_ns()),
            }),
            events,
        };
        (machine, receiver)
    }

    fn lock(&self) -> MutexGuard<'_, MachineInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: SessionEvent) {
        // observers are optional
        let _ = self.events.send(event);
    }

    fn transition(&self, inner: &mut MachineInner, to: SessionState, now_ns: u64) {
        let from = inner.ctx.state;
        if from == to {
            return;
        }
        inner.ctx.state = to;
        info!(%from, %to, at_ns = now_ns, "session state changed");
        self.publish(SessionEvent::StateChanged {
            from,
            to,
            at_ns: now_ns,
        });
    }

    #[must_use]
    pub fn store(&self) -> &Arc<FrameStore> {
        &self.store
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.lock().ctx.state
    }

    #[must_use]
    pub fn context(&self) -> SessionContext {
        self.lock().ctx.clone()
    }

    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the session is idle.
    pub fn start(&self, now_ns: u64) -> Result<(), SessionError> {
        let mut inner = self.lock();
        if inner.ctx.state != SessionState::Idle {
            return Err(SessionError::InvalidTransition {
                from: inner.ctx.state,
                action: "start",
            });
        }
        inner.ctx.session_start_ns = Some(now_ns);
        self.transition(&mut inner, SessionState::Buffering, now_ns);
        Ok(())
    }

    /// One playback step: applies automatic transitions, runs the watchdog
    /// and picks the frame to display.
    pub fn tick(&self, now_ns: u64) -> TickOutcome {
        let mut guard = self.lock();
        let inner = &mut *guard;

        if inner.ctx.state == SessionState::Buffering && self.buffering_complete(&inner.ctx, now_ns)
        {
            self.transition(inner, SessionState::Playing, now_ns);
        }
        if inner.ctx.state.is_running() {
            self.run_watchdog(&mut inner.ctx, now_ns);
        }

        let selection = inner.scheduler.select(&inner.ctx, &self.store, now_ns);
        TickOutcome {
            state: inner.ctx.state,
            selection,
        }
    }

    fn buffering_complete(&self, ctx: &SessionContext, now_ns: u64) -> bool {
        let Some(start) = ctx.session_start_ns else {
            return false;
        };
        let waited = now_ns.saturating_sub(start) >= ctx.delay_ns;
        // one frame of slack: N frames at 30 fps span (N - 1) intervals
        let history = !self.store.is_empty()
            && self.store.span_ns() + ctx.frame_interval_ns >= ctx.delay_ns;
        waited && history
    }

    fn run_watchdog(&self, ctx: &mut SessionContext, now_ns: u64) {
        let start = ctx.session_start_ns.unwrap_or(now_ns);
        let latest = self.store.latest_timestamp();
        let fresh = latest.map_or(now_ns.saturating_sub(start) <= ctx.stall_threshold_ns, |l| {
            now_ns.saturating_sub(l) <= ctx.stall_threshold_ns
        });
        let buffering_overdue = ctx.state == SessionState::Buffering
            && now_ns.saturating_sub(start) >= ctx.buffering_watchdog_ns;
        let stalled = !fresh || buffering_overdue;

        if stalled && !ctx.stalled {
            warn!(at_ns = now_ns, last_frame_ns = ?latest, state = %ctx.state, "ingest stalled");
            self.publish(SessionEvent::IngestStalled {
                at_ns: now_ns,
                last_frame_ns: latest,
            });
        } else if !stalled && ctx.stalled {
            info!(at_ns = now_ns, "ingest recovered");
            self.publish(SessionEvent::IngestRecovered { at_ns: now_ns });
        }
        ctx.stalled = stalled;
    }

    /// Freezes the display on the frame currently shown. Returns its
    /// timestamp.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless playing.
    pub fn pause(&self, now_ns: u64) -> Result<u64, SessionError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.ctx.state != SessionState::Playing {
            return Err(SessionError::InvalidTransition {
                from: inner.ctx.state,
                action: "pause",
            });
        }

        let live_target = now_ns.saturating_sub(inner.ctx.delay_ns);
        let paused_at = inner
            .scheduler
            .last_delivered()
            .map(|f| f.timestamp_ns)
            .or_else(|| self.store.frame_near(live_target).ok().map(|f| f.timestamp_ns))
            .unwrap_or(live_target);

        inner.ctx.paused_at_ns = Some(paused_at);
        self.transition(inner, SessionState::Paused, now_ns);
        Ok(paused_at)
    }

    /// Back to live delayed playback. The read head re-anchors to
    /// `now - delay`; the paused interval is not replayed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless paused.
    pub fn resume(&self, now_ns: u64) -> Result<(), SessionError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.ctx.state != SessionState::Paused {
            return Err(SessionError::InvalidTransition {
                from: inner.ctx.state,
                action: "resume",
            });
        }
        inner.ctx.paused_at_ns = None;
        self.transition(inner, SessionState::Playing, now_ns);
        Ok(())
    }

    /// Moves the paused view to `target_ns`, clamped into
    /// `[oldest, latest - delay]`. Returns the timestamp now on screen.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless paused and `ScrubUnavailable` if
    /// the buffer holds no delayed frames.
    pub fn scrub_to(&self, target_ns: u64) -> Result<u64, SessionError> {
        self.move_paused_view("scrub", |scheduler, store, _| {
            scheduler.resolve_scrub(store, target_ns)
        })
    }

    /// Steps the paused view by `delta` frames.
    ///
    /// # Errors
    ///
    /// Same as [`Self::scrub_to`].
    pub fn step(&self, delta: i64) -> Result<u64, SessionError> {
        self.move_paused_view("step", |scheduler, store, paused_at| {
            scheduler.resolve_step(store, paused_at, delta)
        })
    }

    fn move_paused_view<F>(&self, action: &'static str, resolve: F) -> Result<u64, SessionError>
    where
        F: FnOnce(&DelayScheduler, &FrameStore, u64) -> Option<FrameRecord>,
    {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let (SessionState::Paused, Some(paused_at)) = (inner.ctx.state, inner.ctx.paused_at_ns)
        else {
            return Err(SessionError::InvalidTransition {
                from: inner.ctx.state,
                action,
            });
        };

        let frame = resolve(&inner.scheduler, &self.store, paused_at)
            .ok_or(SessionError::ScrubUnavailable)?;
        let timestamp = frame.timestamp_ns;
        inner.ctx.paused_at_ns = Some(timestamp);
        inner.scheduler.set_delivered(frame);
        Ok(timestamp)
    }

    /// Ends the session. Safe from any state; returns `false` if it was
    /// already stopped.
    pub fn stop(&self, now_ns: u64) -> bool {
        let mut guard = self.lock();
        if guard.ctx.state == SessionState::Stopped {
            return false;
        }
        guard.ctx.paused_at_ns = None;
        self.transition(&mut guard, SessionState::Stopped, now_ns);
        true
    }

    /// Fatal capture error: report it and stop. Not retried.
    pub fn fail(&self, now_ns: u64, error: &CaptureError) {
        let mut guard = self.lock();
        guard.ctx.failure = Some(error.clone());
        self.publish(SessionEvent::CaptureFailed {
            at_ns: now_ns,
            reason: error.to_string(),
        });
        guard.ctx.paused_at_ns = None;
        self.transition(&mut guard, SessionState::Stopped, now_ns);
    }

    #[must_use]
    pub fn snapshot(&self, now_ns: u64) -> SessionSnapshot {
        let inner = self.lock();
        let ctx = &inner.ctx;
        let countdown_ns = match (ctx.state, ctx.session_start_ns) {
            (SessionState::Buffering, Some(start)) => {
                inner.scheduler.countdown_ns(start, now_ns)
            }
            _ => 0,
        };
        SessionSnapshot {
            state: ctx.state,
            delay_ns: ctx.delay_ns,
            countdown_ns,
            paused_at_ns: ctx.paused_at_ns,
            displayed_ns: inner.scheduler.last_delivered().map(|f| f.timestamp_ns),
            stalled: ctx.stalled,
            failure: ctx.failure.clone().map(SessionError::from),
            buffer_bounds: self.store.bounds(),
            buffered_frames: self.store.len(),
            evicted_frames: self.store.evicted_total(),
            now_ns,
        }
    }
}

/// A running delayed-playback session: capture thread, playback thread and
/// the shared frame store between them.
pub struct Session {
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    machine: Arc<SessionMachine>,
    ingest: IngestWorker,
    driver: DriverHandle,
    events: Option<Receiver<SessionEvent>>,
    frames_ingested: Arc<AtomicU64>,
}

impl Session {
    /// Starts capture and playback. The session begins in `Buffering`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured camera cannot be selected or a
    /// worker thread cannot be spawned.
    pub fn start(
        config: SessionConfig,
        clock: Arc<dyn Clock>,
        mut source: Box<dyn FrameSource>,
        sink: Arc<dyn DisplaySink>,
    ) -> anyhow::Result<Self> {
        source.select_camera(config.camera_facing)?;
        let store = Arc::new(FrameStore::new(config.buffer_duration_ns()));
        let (machine, events) = SessionMachine::new(&config, Arc::clone(&store));
        let machine = Arc::new(machine);
        machine.start(clock.now_ns())?;

        info!(
            delay = %config.delay,
            buffer_secs = config.buffer_duration_secs,
            camera = %config.camera_facing,
            "session starting"
        );

        let ingest = CaptureIngest::new(store);
        let frames_ingested = ingest.counter();
        let failing_machine = Arc::clone(&machine);
        let failing_clock = Arc::clone(&clock);
        let ingest = IngestWorker::spawn(source, ingest, move |e| {
            failing_machine.fail(failing_clock.now_ns(), &e);
        })?;

        let driver = PlaybackDriver::new(Arc::clone(&machine), sink, Arc::clone(&clock))
            .spawn(config.frame_interval_ns())?;

        Ok(Self {
            config,
            clock,
            machine,
            ingest,
            driver,
            events: Some(events),
            frames_ingested,
        })
    }

    /// Hands out the event receiver. Only the first caller gets it.
    pub fn take_events(&mut self) -> Option<Receiver<SessionEvent>> {
        self.events.take()
    }

    #[must_use]
    pub fn store(&self) -> &Arc<FrameStore> {
        self.machine.store()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.machine.snapshot(self.clock.now_ns())
    }

    #[must_use]
    pub fn frames_ingested(&self) -> u64 {
        self.frames_ingested.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn playback_ticks(&self) -> u64 {
        self.driver.ticks()
    }

    /// The fatal capture error that stopped the session, if any.
    #[must_use]
    pub fn failure(&self) -> Option<SessionError> {
        self.machine.context().failure.map(SessionError::from)
    }

    /// # Errors
    ///
    /// See [`SessionMachine::pause`].
    pub fn pause(&self) -> Result<u64, SessionError> {
        self.driver.pause()
    }

    /// # Errors
    ///
    /// See [`SessionMachine::resume`].
    pub fn resume(&self) -> Result<(), SessionError> {
        self.driver.resume()
    }

    /// Pauses when playing and resumes when paused.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` in any other state.
    pub fn toggle_pause(&self) -> Result<SessionState, SessionError> {
        match self.state() {
            SessionState::Paused => self.resume().map(|()| SessionState::Playing),
            _ => self.pause().map(|_| SessionState::Paused),
        }
    }

    /// # Errors
    ///
    /// See [`SessionMachine::scrub_to`].
    pub fn scrub_to(&self, target_ns: u64) -> Result<u64, SessionError> {
        self.machine.scrub_to(target_ns)
    }

    /// # Errors
    ///
    /// See [`SessionMachine::step`].
    pub fn step(&self, delta: i64) -> Result<u64, SessionError> {
        self.machine.step(delta)
    }

    pub fn set_zoom(&self, level: f32) {
        self.ingest.send(SourceCommand::SetZoom(level));
    }

    /// Exporter reading this session's buffer. It holds its own handle on
    /// the store, so it keeps working after [`Session::stop`].
    #[must_use]
    pub fn exporter(&self) -> ClipExporter {
        ClipExporter::new(Arc::clone(self.store()), self.config.capture_fps)
    }

    /// The `seconds` leading up to the frame on screen (or the newest frame
    /// if nothing has been shown yet), clamped to the buffer.
    ///
    /// # Errors
    ///
    /// Returns `RangeOutOfBuffer` if nothing has been captured.
    pub fn recent_range(&self, seconds: u64) -> Result<ClipRange, ExportError> {
        let snapshot = self.snapshot();
        let Some((oldest, latest)) = snapshot.buffer_bounds else {
            return Err(ExportError::RangeOutOfBuffer {
                start_ns: 0,
                end_ns: 0,
                bounds: None,
            });
        };
        let end = snapshot.displayed_ns.unwrap_or(latest).clamp(oldest, latest);
        let start = end.saturating_sub(secs_to_ns(seconds)).max(oldest);
        ClipRange::new(start, end)
    }

    /// Exports `range` to `path` on a background thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is invalid right now or the export
    /// thread cannot be spawned.
    pub fn export(&self, range: ClipRange, path: PathBuf) -> Result<ExportJob, ExportError> {
        self.exporter().spawn(range, path)
    }

    /// [`Session::export`] of [`Session::recent_range`].
    ///
    /// # Errors
    ///
    /// See [`Session::recent_range`] and [`Session::export`].
    pub fn export_recent(&self, seconds: u64, path: PathBuf) -> Result<ExportJob, ExportError> {
        self.export(self.recent_range(seconds)?, path)
    }

    /// Stops capture and playback. Safe to call repeatedly and from any
    /// state; in-flight exports keep their own handle on the store and run
    /// to completion.
    pub fn stop(&mut self) {
        self.machine.stop(self.clock.now_ns());
        self.ingest.shutdown();
        self.driver.stop();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::TryRecvError;
    use std::time::Duration;

    use image::RgbImage;

    use super::*;
    use crate::clock::ManualClock;
    use crate::pipeline::frame::Rotation;

    const SEC: u64 = 1_000_000_000;
    const FRAME: u64 = SEC / 30;

    fn machine(delay_secs: u64) -> (SessionMachine, Receiver<SessionEvent>) {
        let config = SessionConfig::new(delay_secs, 60, false, 0).unwrap();
        let store = Arc::new(FrameStore::new(config.buffer_duration_ns()));
        SessionMachine::new(&config, store)
    }

    fn add_frame(machine: &SessionMachine, ts: u64) {
        machine
            .store()
            .append(FrameRecord {
                timestamp_ns: ts,
                payload: Arc::new(RgbImage::new(1, 1)),
                rotation: Rotation::Deg0,
                is_front_facing: false,
            })
            .unwrap();
    }

    /// Captures and ticks in lockstep at 30 Hz for frames `from..to`.
    fn run_frames(machine: &SessionMachine, from: u64, to: u64) -> Vec<TickOutcome> {
        (from..to)
            .map(|i| {
                add_frame(machine, i * FRAME);
                machine.tick(i * FRAME)
            })
            .collect()
    }

    fn drain(events: &Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        loop {
            match events.try_recv() {
                Ok(e) => out.push(e),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return out,
            }
        }
    }

    fn state_changes(events: &[SessionEvent]) -> Vec<(SessionState, SessionState)> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged { from, to, .. } => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn start_moves_idle_to_buffering_once() {
        let (m, events) = machine(7);
        assert_eq!(m.state(), SessionState::Idle);
        m.start(0).unwrap();
        assert_eq!(m.state(), SessionState::Buffering);
        assert!(matches!(
            m.start(1),
            Err(SessionError::InvalidTransition {
                from: SessionState::Buffering,
                action: "start"
            })
        ));
        assert_eq!(
            state_changes(&drain(&events)),
            vec![(SessionState::Idle, SessionState::Buffering)]
        );
    }

    #[test]
    fn ten_second_scenario() {
        let (m, events) = machine(7);
        m.start(0).unwrap();

        let outcomes = run_frames(&m, 0, 300);

        assert_eq!(m.store().len(), 300);
        let span = m.store().span_ns();
        assert!(span > 9 * SEC && span <= 10 * SEC);

        let buffering = outcomes
            .iter()
            .filter(|o| o.state == SessionState::Buffering)
            .count();
        let playing: Vec<(u64, &TickOutcome)> = outcomes
            .iter()
            .enumerate()
            .filter(|(_, o)| o.state == SessionState::Playing)
            .map(|(i, o)| (i as u64 * FRAME, o))
            .collect();

        // ~7 s of buffering then ~3 s of playback at 30 Hz
        assert!((209..=211).contains(&buffering), "buffering ticks {buffering}");
        assert!((89..=91).contains(&playing.len()), "playing ticks {}", playing.len());

        for (now, outcome) in playing {
            let shown = outcome.selection.frame().unwrap().timestamp_ns;
            let target = now - 7 * SEC;
            assert!(shown <= target);
            assert!(target - shown <= FRAME, "lag off by {}ns", target - shown);
        }

        assert_eq!(
            state_changes(&drain(&events)),
            vec![
                (SessionState::Idle, SessionState::Buffering),
                (SessionState::Buffering, SessionState::Playing),
            ]
        );
    }

    #[test]
    fn buffering_waits_for_history_not_just_time() {
        let (m, _events) = machine(5);
        m.start(0).unwrap();
        // only one second of frames, then the camera goes quiet
        run_frames(&m, 0, 30);
        let outcome = m.tick(6 * SEC);
        assert_eq!(outcome.state, SessionState::Buffering);
    }

    #[test]
    fn buffering_watchdog_reports_stall_and_recovery() {
        let (m, events) = machine(5);
        m.start(0).unwrap();
        add_frame(&m, 0);
        m.tick(0);

        m.tick(11 * SEC);
        assert!(m.context().stalled);
        let stalled = drain(&events);
        assert!(stalled.iter().any(|e| matches!(
            e,
            SessionEvent::IngestStalled {
                last_frame_ns: Some(0),
                ..
            }
        )));
        // still alive
        assert_eq!(m.state(), SessionState::Buffering);

        // frames come back and fill the delay window
        for i in 0..=160 {
            add_frame(&m, 11 * SEC + i * FRAME);
        }
        let outcome = m.tick(11 * SEC + 160 * FRAME);
        assert_eq!(outcome.state, SessionState::Playing);
        let after = drain(&events);
        assert!(after.contains(&SessionEvent::IngestRecovered {
            at_ns: 11 * SEC + 160 * FRAME
        }));
    }

    #[test]
    fn playing_stall_holds_last_frame_and_warns_once() {
        let (m, events) = machine(5);
        m.start(0).unwrap();
        run_frames(&m, 0, 200);
        drain(&events);

        let last_shown = m.tick(200 * FRAME).selection.frame().unwrap().timestamp_ns;
        // ingest stops; the read head keeps moving and catches up
        let mut held = Vec::new();
        for i in 0..300 {
            let outcome = m.tick(200 * FRAME + i * FRAME);
            held.push(outcome.selection.frame().unwrap().timestamp_ns);
        }
        assert_eq!(m.state(), SessionState::Playing);
        assert!(held.iter().all(|&ts| ts >= last_shown));
        assert_eq!(*held.last().unwrap(), 199 * FRAME);

        let stalls = drain(&events)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::IngestStalled { .. }))
            .count();
        assert_eq!(stalls, 1);
    }

    #[test]
    fn pause_freezes_output() {
        let (m, _events) = machine(7);
        m.start(0).unwrap();
        run_frames(&m, 0, 250);
        let shown = m.tick(250 * FRAME).selection.frame().unwrap().timestamp_ns;

        let paused_at = m.pause(250 * FRAME).unwrap();
        assert_eq!(paused_at, shown);

        let frames: Vec<u64> = run_frames(&m, 251, 300)
            .iter()
            .map(|o| o.selection.frame().unwrap().timestamp_ns)
            .collect();
        assert!(frames.iter().all(|&ts| ts == shown));
        assert_eq!(m.state(), SessionState::Paused);
    }

    #[test]
    fn resume_reanchors_to_live() {
        let (m, _events) = machine(7);
        m.start(0).unwrap();
        run_frames(&m, 0, 240);
        m.pause(240 * FRAME).unwrap();
        run_frames(&m, 240, 400);

        let now = 400 * FRAME;
        m.resume(now).unwrap();
        add_frame(&m, now);
        let shown = m.tick(now).selection.frame().unwrap().timestamp_ns;
        let target = now - 7 * SEC;
        assert!(target - shown <= FRAME);
    }

    #[test]
    fn pause_and_resume_only_from_valid_states() {
        let (m, _events) = machine(7);
        m.start(0).unwrap();
        assert!(matches!(
            m.pause(0),
            Err(SessionError::InvalidTransition {
                from: SessionState::Buffering,
                ..
            })
        ));
        assert!(m.resume(0).is_err());
        assert!(m.scrub_to(0).is_err());
        assert!(m.step(1).is_err());
    }

    #[test]
    fn scrub_and_step_while_paused() {
        let (m, _events) = machine(7);
        m.start(0).unwrap();
        run_frames(&m, 0, 300);
        m.pause(300 * FRAME).unwrap();

        assert_eq!(m.scrub_to(30 * FRAME).unwrap(), 30 * FRAME);
        assert_eq!(m.tick(301 * FRAME).selection.frame().unwrap().timestamp_ns, 30 * FRAME);

        assert_eq!(m.step(2).unwrap(), 32 * FRAME);
        assert_eq!(m.step(-40).unwrap(), 0);

        // past the aired edge is clamped to latest - delay
        let edge = m.scrub_to(u64::MAX).unwrap();
        assert!(edge <= 299 * FRAME - 7 * SEC);
        assert!(299 * FRAME - 7 * SEC - edge < FRAME);
    }

    #[test]
    fn stop_is_terminal_and_idempotent() {
        let (m, events) = machine(7);
        m.start(0).unwrap();
        run_frames(&m, 0, 250);
        m.pause(250 * FRAME).unwrap();

        assert!(m.stop(251 * FRAME));
        assert!(!m.stop(252 * FRAME));
        assert_eq!(m.state(), SessionState::Stopped);
        assert!(m.resume(253 * FRAME).is_err());
        assert_eq!(m.tick(254 * FRAME).state, SessionState::Stopped);
        // buffer is still there for a last export
        assert_eq!(m.store().len(), 250);

        assert_eq!(
            state_changes(&drain(&events)),
            vec![
                (SessionState::Idle, SessionState::Buffering),
                (SessionState::Buffering, SessionState::Playing),
                (SessionState::Playing, SessionState::Paused),
                (SessionState::Paused, SessionState::Stopped),
            ]
        );
    }

    #[test]
    fn capture_failure_forces_stop() {
        let (m, events) = machine(7);
        m.start(0).unwrap();
        run_frames(&m, 0, 10);
        m.fail(10 * FRAME, &CaptureError::Hardware("usb reset".into()));

        assert_eq!(m.state(), SessionState::Stopped);
        assert_eq!(
            m.context().failure,
            Some(CaptureError::Hardware("usb reset".into()))
        );
        assert!(matches!(
            m.snapshot(11 * FRAME).failure,
            Some(SessionError::CaptureHardwareFailure(CaptureError::Hardware(_)))
        ));
        let events = drain(&events);
        let failed = events
            .iter()
            .position(|e| matches!(e, SessionEvent::CaptureFailed { .. }))
            .unwrap();
        let stopped = events
            .iter()
            .position(|e| {
                matches!(
                    e,
                    SessionEvent::StateChanged {
                        to: SessionState::Stopped,
                        ..
                    }
                )
            })
            .unwrap();
        assert!(failed < stopped);
    }

    #[test]
    fn snapshot_reports_countdown_while_buffering() {
        let (m, _events) = machine(7);
        m.start(SEC).unwrap();
        let snap = m.snapshot(3 * SEC);
        assert_eq!(snap.state, SessionState::Buffering);
        assert_eq!(snap.countdown_ns, 5 * SEC);
        assert_eq!(snap.delay_ns, 7 * SEC);
    }

    /// Full threaded session against the real clock, kept short.
    #[test]
    fn threaded_session_runs_and_stops_cleanly() {
        use crate::clock::MonotonicClock;
        use crate::pipeline::driver::LatestFrameSink;
        use crate::pipeline::source::TestPatternSource;

        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
        let config = SessionConfig::new(5, 60, true, 90).unwrap();
        let source = TestPatternSource::new(Arc::clone(&clock), &config, 16, 9);
        let sink = Arc::new(LatestFrameSink::default());
        let mut session =
            Session::start(config, clock, Box::new(source), sink.clone()).unwrap();
        let events = session.take_events().unwrap();
        assert!(session.take_events().is_none());

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(session.state(), SessionState::Buffering);
        assert!(session.frames_ingested() > 0);
        assert!(session.playback_ticks() > 0);
        let shown = sink.latest().unwrap();
        assert!(shown.transform.mirror);
        assert_eq!(shown.transform.rotation, Rotation::Deg90);

        session.stop();
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
        let changes = state_changes(&drain(&events));
        assert_eq!(
            changes.last(),
            Some(&(SessionState::Buffering, SessionState::Stopped))
        );
    }

    #[test]
    fn threaded_session_stops_on_hardware_failure() {
        use crate::pipeline::driver::LatestFrameSink;
        use crate::pipeline::source::TestPatternSource;

        let clock = Arc::new(ManualClock::new(0));
        let config = SessionConfig::default();
        let source = TestPatternSource::new(clock.clone(), &config, 8, 8)
            .unpaced()
            .with_failure_after(3);
        let mut session = Session::start(
            config,
            clock,
            Box::new(source),
            Arc::new(LatestFrameSink::default()),
        )
        .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while session.state() != SessionState::Stopped {
            assert!(std::time::Instant::now() < deadline, "session never stopped");
            std::thread::sleep(Duration::from_millis(5));
        }
        match session.failure() {
            Some(SessionError::CaptureHardwareFailure(CaptureError::Hardware(reason))) => {
                assert!(reason.contains("sensor stopped responding"));
            }
            other => panic!("expected a hardware failure, got {other:?}"),
        }
        // buffer left inspectable
        assert!(!session.store().is_empty());
        session.stop();
    }

    #[test]
    fn stop_lets_a_running_export_finish() {
        use crate::clip::reader::ClipReader;
        use crate::clip::writer::partial_path;
        use crate::clock::MonotonicClock;
        use crate::pipeline::driver::LatestFrameSink;
        use crate::pipeline::source::TestPatternSource;

        let dir = std::env::temp_dir().join(format!("delaycam_session_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("during_stop.dlyc");
        let after = dir.join("after_stop.dlyc");

        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
        let config = SessionConfig::default();
        let source = TestPatternSource::new(Arc::clone(&clock), &config, 64, 48);
        let mut session = Session::start(
            config,
            clock,
            Box::new(source),
            Arc::new(LatestFrameSink::default()),
        )
        .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while session.frames_ingested() < 10 {
            assert!(std::time::Instant::now() < deadline, "no frames captured");
            std::thread::sleep(Duration::from_millis(10));
        }

        let (oldest, latest) = session.store().bounds().unwrap();
        let job = session
            .export(ClipRange::new(oldest, latest).unwrap(), path.clone())
            .unwrap();
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);

        let summary = job.join().unwrap();
        assert!(summary.frames >= 10);
        assert!(path.exists());
        assert!(!partial_path(&path).exists());
        let reader = ClipReader::open(&path).unwrap();
        assert_eq!(reader.frame_count() as u64, summary.frames);

        // the buffer stays exportable once the session is down
        let (oldest, latest) = session.store().bounds().unwrap();
        let recent = session.recent_range(60).unwrap();
        assert!(oldest <= recent.start_ns && recent.end_ns <= latest);
        let late = session
            .exporter()
            .export(ClipRange::new(oldest, latest).unwrap(), &after)
            .unwrap();
        assert!(late.frames >= summary.frames);
        assert!(after.exists());

        std::fs::remove_dir_all(&dir).ok();
    }
}
