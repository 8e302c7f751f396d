// SPDX-License-Identifier: MIT
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::clock::{NANOS_PER_SECOND, secs_to_ns};
use crate::error::ConfigError;
use crate::pipeline::frame::Rotation;

pub const CAPTURE_FPS: u32 = 30;
pub const MIN_BUFFER_SECS: u64 = 60;
pub const MAX_BUFFER_SECS: u64 = 300;
pub const DEFAULT_BUFFER_SECS: u64 = MIN_BUFFER_SECS;

/// Latest frame older than this while running means the source has stalled.
pub const DEFAULT_STALL_THRESHOLD_NS: u64 = NANOS_PER_SECOND;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DelaySetting {
    Five,
    Seven,
    Ten,
}

impl DelaySetting {
    /// # Errors
    ///
    /// Returns an error unless `secs` is 5, 7 or 10.
    pub fn from_secs(secs: u64) -> Result<Self, ConfigError> {
        match secs {
            5 => Ok(Self::Five),
            7 => Ok(Self::Seven),
            10 => Ok(Self::Ten),
            other => Err(ConfigError::UnsupportedDelay(other)),
        }
    }

    #[must_use]
    pub fn secs(self) -> u64 {
        match self {
            Self::Five => 5,
            Self::Seven => 7,
            Self::Ten => 10,
        }
    }

    #[must_use]
    pub fn as_ns(self) -> u64 {
        secs_to_ns(self.secs())
    }
}

impl fmt::Display for DelaySetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.secs())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraFacing {
    Front,
    Back,
}

impl CameraFacing {
    #[must_use]
    pub fn is_front(self) -> bool {
        self == Self::Front
    }
}

impl fmt::Display for CameraFacing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Front => write!(f, "front"),
            Self::Back => write!(f, "back"),
        }
    }
}

/// Read-only inputs for one session. Changing any of them means starting a
/// new session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub delay: DelaySetting,
    pub buffer_duration_secs: u64,
    pub camera_facing: CameraFacing,
    pub capture_fps: u32,
    pub rotation: Rotation,
    pub stall_threshold_ns: u64,
}

impl SessionConfig {
    /// Validates raw settings into a session configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the delay is not 5/7/10 s, the buffer duration is
    /// outside 60..=300 s, or the rotation is not a multiple of 90.
    pub fn new(
        delay_secs: u64,
        buffer_duration_secs: u64,
        use_front_camera: bool,
        rotation_degrees: u32,
    ) -> Result<Self, ConfigError> {
        let delay = DelaySetting::from_secs(delay_secs)?;
        if !(MIN_BUFFER_SECS..=MAX_BUFFER_SECS).contains(&buffer_duration_secs) {
            return Err(ConfigError::BufferDurationOutOfRange(buffer_duration_secs));
        }
        let rotation = Rotation::from_degrees(rotation_degrees)
            .ok_or(ConfigError::UnsupportedRotation(rotation_degrees))?;

        Ok(Self {
            delay,
            buffer_duration_secs,
            camera_facing: if use_front_camera {
                CameraFacing::Front
            } else {
                CameraFacing::Back
            },
            capture_fps: CAPTURE_FPS,
            rotation,
            stall_threshold_ns: DEFAULT_STALL_THRESHOLD_NS,
        })
    }

    /// # Errors
    ///
    /// Returns an error for any frame rate other than 30.
    pub fn with_capture_fps(mut self, fps: u32) -> Result<Self, ConfigError> {
        if fps != CAPTURE_FPS {
            return Err(ConfigError::UnsupportedFrameRate(fps));
        }
        self.capture_fps = fps;
        Ok(self)
    }

    #[must_use]
    pub fn delay_ns(&self) -> u64 {
        self.delay.as_ns()
    }

    #[must_use]
    pub fn buffer_duration_ns(&self) -> u64 {
        secs_to_ns(self.buffer_duration_secs)
    }

    #[must_use]
    pub fn frame_interval_ns(&self) -> u64 {
        NANOS_PER_SECOND / u64::from(self.capture_fps)
    }

    /// Buffering that lasts this long is reported as a stalled ingest.
    #[must_use]
    pub fn buffering_watchdog_ns(&self) -> u64 {
        self.delay_ns() * 2
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            delay: DelaySetting::Seven,
            buffer_duration_secs: DEFAULT_BUFFER_SECS,
            camera_facing: CameraFacing::Back,
            capture_fps: CAPTURE_FPS,
            rotation: Rotation::Deg0,
            stall_threshold_ns: DEFAULT_STALL_THRESHOLD_NS,
        }
    }
}
