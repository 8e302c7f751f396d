// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::SessionError;
use crate::pipeline::frame::{DisplayTransform, FramePayload};
use crate::pipeline::session::{SessionMachine, SessionState};

/// Per-tick details handed to the sink alongside the pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickInfo {
    pub tick_ns: u64,
    pub frame_ns: u64,
    pub state: SessionState,
    /// The store could not serve this tick; the previous frame is repeated.
    pub held: bool,
}

impl TickInfo {
    /// How far behind real time the shown frame is.
    #[must_use]
    pub fn lag_ns(&self) -> u64 {
        self.tick_ns.saturating_sub(self.frame_ns)
    }
}

/// Display surface. Called from the playback thread once per tick.
pub trait DisplaySink: Send + Sync {
    fn render_frame(&self, payload: &FramePayload, transform: DisplayTransform, info: TickInfo);
}

#[derive(Debug, Clone)]
pub struct DisplayedFrame {
    pub payload: FramePayload,
    pub transform: DisplayTransform,
    pub info: TickInfo,
}

/// Keeps only the most recent frame, for a UI that redraws at its own pace.
#[derive(Default)]
pub struct LatestFrameSink {
    slot: Mutex<Option<DisplayedFrame>>,
}

impl LatestFrameSink {
    #[must_use]
    pub fn latest(&self) -> Option<DisplayedFrame> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DisplaySink for LatestFrameSink {
    fn render_frame(&self, payload: &FramePayload, transform: DisplayTransform, info: TickInfo) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(DisplayedFrame {
            payload: Arc::clone(payload),
            transform,
            info,
        });
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub rendered: u64,
    pub held: u64,
    pub playing: u64,
    /// Worst distance between the shown frame's lag and the configured delay
    /// while playing.
    pub max_delay_error_ns: u64,
}

/// Counts what was shown without keeping pixels; used by headless runs.
pub struct StatsSink {
    delay_ns: u64,
    stats: Mutex<PlaybackStats>,
}

impl StatsSink {
    #[must_use]
    pub fn new(delay_ns: u64) -> Self {
        Self {
            delay_ns,
            stats: Mutex::new(PlaybackStats::default()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> PlaybackStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DisplaySink for StatsSink {
    fn render_frame(&self, _payload: &FramePayload, _transform: DisplayTransform, info: TickInfo) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.rendered += 1;
        if info.held {
            stats.held += 1;
        }
        if info.state == SessionState::Playing && !info.held {
            stats.playing += 1;
            let error = info.lag_ns().abs_diff(self.delay_ns);
            stats.max_delay_error_ns = stats.max_delay_error_ns.max(error);
        }
    }
}

/// Pulls the scheduled frame every tick and hands it to the sink.
pub struct PlaybackDriver {
    machine: Arc<SessionMachine>,
    sink: Arc<dyn DisplaySink>,
    clock: Arc<dyn Clock>,
}

impl PlaybackDriver {
    #[must_use]
    pub fn new(
        machine: Arc<SessionMachine>,
        sink: Arc<dyn DisplaySink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            machine,
            sink,
            clock,
        }
    }

    /// Runs one tick at the current clock time and returns the state the
    /// session is in afterwards.
    pub fn tick(&self) -> SessionState {
        let now = self.clock.now_ns();
        let outcome = self.machine.tick(now);
        if let Some(frame) = outcome.selection.frame() {
            self.sink.render_frame(
                &frame.payload,
                frame.transform(),
                TickInfo {
                    tick_ns: now,
                    frame_ns: frame.timestamp_ns,
                    state: outcome.state,
                    held: outcome.selection.is_held(),
                },
            );
        }
        outcome.state
    }

    /// # Errors
    ///
    /// See [`SessionMachine::pause`].
    #[allow(dead_code)]
    pub fn pause(&self) -> Result<u64, SessionError> {
        self.machine.pause(self.clock.now_ns())
    }

    /// # Errors
    ///
    /// See [`SessionMachine::resume`].
    #[allow(dead_code)]
    pub fn resume(&self) -> Result<(), SessionError> {
        self.machine.resume(self.clock.now_ns())
    }

    /// Ticks on a `playback-driver` thread every `interval_ns`, against
    /// absolute deadlines, until the session stops or the handle is stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(self, interval_ns: u64) -> anyhow::Result<DriverHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let ticks = Arc::new(AtomicU64::new(0));
        let shutdown_clone = Arc::clone(&shutdown);
        let ticks_clone = Arc::clone(&ticks);
        let machine = Arc::clone(&self.machine);
        let clock = Arc::clone(&self.clock);
        let interval = Duration::from_nanos(interval_ns.max(1));

        let handle = thread::Builder::new()
            .name("playback-driver".into())
            .spawn(move || {
                debug!(interval_ms = interval.as_millis(), "playback started");
                let mut deadline = Instant::now();
                while !shutdown_clone.load(Ordering::Relaxed) {
                    let state = self.tick();
                    ticks_clone.fetch_add(1, Ordering::Relaxed);
                    if state == SessionState::Stopped {
                        break;
                    }

                    deadline += interval;
                    let now = Instant::now();
                    match deadline.checked_duration_since(now) {
                        Some(remaining) => thread::sleep(remaining),
                        // fell behind: skip missed ticks rather than burst
                        None => deadline = now,
                    }
                }
                info!(
                    ticks = ticks_clone.load(Ordering::Relaxed),
                    "playback stopped"
                );
            })
            .map_err(|e| anyhow::anyhow!("failed to spawn playback-driver thread: {e}"))?;

        Ok(DriverHandle {
            machine,
            clock,
            shutdown,
            ticks,
            handle: Some(handle),
        })
    }
}

/// Control side of a running [`PlaybackDriver`].
pub struct DriverHandle {
    machine: Arc<SessionMachine>,
    clock: Arc<dyn Clock>,
    shutdown: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DriverHandle {
    /// # Errors
    ///
    /// See [`SessionMachine::pause`].
    pub fn pause(&self) -> Result<u64, SessionError> {
        self.machine.pause(self.clock.now_ns())
    }

    /// # Errors
    ///
    /// See [`SessionMachine::resume`].
    pub fn resume(&self) -> Result<(), SessionError> {
        self.machine.resume(self.clock.now_ns())
    }

    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Halts ticking and waits for the thread. Idempotent.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
