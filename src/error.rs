// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use crate::pipeline::session::SessionState;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The requested timestamp is not covered by the buffer. Expected during
    /// warm-up and ingest stalls; the scheduler absorbs it.
    #[error("buffer underrun: no frame for t={target_ns}ns (buffer holds {bounds:?})")]
    BufferUnderrun {
        target_ns: u64,
        bounds: Option<(u64, u64)>,
    },

    #[error("non-monotonic timestamp {got_ns}ns after {previous_ns}ns")]
    NonMonotonicTimestamp { previous_ns: u64, got_ns: u64 },

    #[error("frame #{seq} was evicted before it could be read")]
    RangeEvicted { seq: u64 },

    #[error("range [{start_ns}, {end_ns}] is outside the buffer {bounds:?}")]
    RangeOutsideBuffer {
        start_ns: u64,
        end_ns: u64,
        bounds: Option<(u64, u64)>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("invalid clip range: start {start_ns}ns is after end {end_ns}ns")]
    InvalidRange { start_ns: u64, end_ns: u64 },

    #[error("clip range [{start_ns}, {end_ns}] is outside the buffer {bounds:?}")]
    RangeOutOfBuffer {
        start_ns: u64,
        end_ns: u64,
        bounds: Option<(u64, u64)>,
    },

    #[error("frames were evicted while the clip was being exported")]
    RangeEvictedDuringExport,

    #[error("clip range [{start_ns}, {end_ns}] contains no frames")]
    EmptyRange { start_ns: u64, end_ns: u64 },

    #[error("failed to write clip {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode clip: {0}")]
    Encode(#[from] anyhow::Error),

    #[error("export thread panicked")]
    WorkerPanicked,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    /// Fatal: the camera hardware reported an error.
    #[error("camera hardware failure: {0}")]
    Hardware(String),

    #[error("frame source disconnected")]
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("cannot {action} while {from}")]
    InvalidTransition {
        from: SessionState,
        action: &'static str,
    },

    /// Fatal. The session has stopped; the buffer is left for a final export.
    #[error("session stopped: {0}")]
    CaptureHardwareFailure(#[from] CaptureError),

    #[error("scrubbing needs at least one delayed frame in the buffer")]
    ScrubUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unsupported delay {0}s (expected 5, 7 or 10)")]
    UnsupportedDelay(u64),

    #[error("buffer duration {0}s is outside 60..=300")]
    BufferDurationOutOfRange(u64),

    #[error("unsupported capture rate {0} fps (only 30 is supported)")]
    UnsupportedFrameRate(u32),

    #[error("unsupported rotation {0} (expected 0, 90, 180 or 270)")]
    UnsupportedRotation(u32),
}
