// SPDX-License-Identifier: MIT
use tracing::trace;

use crate::pipeline::frame::FrameRecord;
use crate::pipeline::session::{SessionContext, SessionState};
use crate::pipeline::store::FrameStore;

/// What a playback tick should show.
#[derive(Debug, Clone)]
pub enum Selection {
    /// Looked up in the store for this tick.
    Fresh(FrameRecord),
    /// The store could not serve the target; the previous frame stays up.
    Held(FrameRecord),
    /// Nothing has been shown yet.
    Nothing,
}

impl Selection {
    #[must_use]
    pub fn frame(&self) -> Option<&FrameRecord> {
        match self {
            Self::Fresh(f) | Self::Held(f) => Some(f),
            Self::Nothing => None,
        }
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Held(_))
    }
}

/// Decides which buffered frame is on screen at a given instant.
///
/// Every decision is a function of the session state, the store and `now`;
/// the only memory is the last delivered frame, kept so that an underrun
/// repeats it instead of blanking the display.
pub struct DelayScheduler {
    delay_ns: u64,
    last_delivered: Option<FrameRecord>,
}

impl DelayScheduler {
    #[must_use]
    pub fn new(delay_ns: u64) -> Self {
        Self {
            delay_ns,
            last_delivered: None,
        }
    }

    #[must_use]
    pub fn last_delivered(&self) -> Option<&FrameRecord> {
        self.last_delivered.as_ref()
    }

    /// Read time the display should show at `now`.
    #[must_use]
    pub fn target_for(&self, ctx: &SessionContext, store: &FrameStore, now_ns: u64) -> Option<u64> {
        match ctx.state {
            SessionState::Idle | SessionState::Stopped => None,
            SessionState::Buffering => store.oldest_timestamp(),
            SessionState::Playing => Some(now_ns.saturating_sub(self.delay_ns)),
            SessionState::Paused => ctx.paused_at_ns,
        }
    }

    pub fn select(&mut self, ctx: &SessionContext, store: &FrameStore, now_ns: u64) -> Selection {
        let Some(target) = self.target_for(ctx, store, now_ns) else {
            return self.hold();
        };

        match store.frame_near(target) {
            Ok(frame) => {
                self.last_delivered = Some(frame.clone());
                Selection::Fresh(frame)
            }
            Err(e) => {
                trace!(error = %e, "holding previous frame");
                self.hold()
            }
        }
    }

    fn hold(&self) -> Selection {
        self.last_delivered
            .clone()
            .map_or(Selection::Nothing, Selection::Held)
    }

    /// Time left before delayed playback can begin. Derived from the clock
    /// alone so it cannot drift from the scheduler.
    #[must_use]
    pub fn countdown_ns(&self, session_start_ns: u64, now_ns: u64) -> u64 {
        self.delay_ns
            .saturating_sub(now_ns.saturating_sub(session_start_ns))
    }

    /// Window a paused view may be scrubbed across:
    /// `[oldest, latest - delay]`. Anything later has not been "aired" yet.
    #[must_use]
    pub fn scrub_bounds(&self, store: &FrameStore) -> Option<(u64, u64)> {
        let (oldest, latest) = store.bounds()?;
        let newest_allowed = latest.checked_sub(self.delay_ns)?;
        (newest_allowed >= oldest).then_some((oldest, newest_allowed))
    }

    /// Clamps a scrub request into [`Self::scrub_bounds`] and resolves it to
    /// the frame that would be shown there.
    #[must_use]
    pub fn resolve_scrub(&self, store: &FrameStore, requested_ns: u64) -> Option<FrameRecord> {
        let (low, high) = self.scrub_bounds(store)?;
        store.frame_near(requested_ns.clamp(low, high)).ok()
    }

    /// Frame `delta` frames away from `from_ns`, kept inside the scrub
    /// window.
    #[must_use]
    pub fn resolve_step(&self, store: &FrameStore, from_ns: u64, delta: i64) -> Option<FrameRecord> {
        let (_, high) = self.scrub_bounds(store)?;
        let frame = store.frame_offset(from_ns, delta)?;
        if frame.timestamp_ns > high {
            return store.frame_near(high).ok();
        }
        Some(frame)
    }

    /// Forces the displayed frame, used when pausing so the frozen frame is
    /// exactly what was on screen.
    pub fn set_delivered(&mut self, frame: FrameRecord) {
        self.last_delivered = Some(frame);
    }
}
