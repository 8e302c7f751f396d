// SPDX-License-Identifier: MIT
use std::fmt;
use std::sync::Arc;

use image::{RgbImage, imageops};
use serde::{Deserialize, Serialize};

/// Pixel data of one captured frame. Shared, never mutated after capture.
pub type FramePayload = Arc<RgbImage>;

/// Physical sensor orientation at capture, clockwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    #[must_use]
    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees {
            0 => Some(Self::Deg0),
            90 => Some(Self::Deg90),
            180 => Some(Self::Deg180),
            270 => Some(Self::Deg270),
            _ => None,
        }
    }

    #[must_use]
    pub fn degrees(self) -> u32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    #[must_use]
    pub fn swaps_dimensions(self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\u{b0}", self.degrees())
    }
}

/// One captured sample as held by the frame store.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub timestamp_ns: u64,
    pub payload: FramePayload,
    pub rotation: Rotation,
    pub is_front_facing: bool,
}

impl FrameRecord {
    #[must_use]
    pub fn transform(&self) -> DisplayTransform {
        DisplayTransform::for_capture(self.rotation, self.is_front_facing)
    }
}

/// Orientation correction that turns a raw sensor frame into what the user
/// saw: rotate clockwise by the sensor angle, then, for front cameras,
/// mirror about the rotated bounding box (translate by the rendered width
/// and scale X by -1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DisplayTransform {
    pub rotation: Rotation,
    pub mirror: bool,
}

impl DisplayTransform {
    #[must_use]
    pub fn for_capture(rotation: Rotation, is_front_facing: bool) -> Self {
        Self {
            rotation,
            mirror: is_front_facing,
        }
    }

    #[must_use]
    pub fn is_identity(self) -> bool {
        self.rotation == Rotation::Deg0 && !self.mirror
    }

    /// Size of the transformed image for a `width` x `height` source.
    #[must_use]
    pub fn output_dimensions(self, width: u32, height: u32) -> (u32, u32) {
        if self.rotation.swaps_dimensions() {
            (height, width)
        } else {
            (width, height)
        }
    }

    /// Maps a pixel of the transformed image back to the raw source pixel.
    ///
    /// Lets renderers sample the raw frame directly instead of
    /// materialising the corrected image.
    #[must_use]
    pub fn source_coords(self, x: u32, y: u32, width: u32, height: u32) -> (u32, u32) {
        let (out_w, _) = self.output_dimensions(width, height);
        let x = if self.mirror {
            out_w.saturating_sub(1).saturating_sub(x)
        } else {
            x
        };
        match self.rotation {
            Rotation::Deg0 => (x, y),
            Rotation::Deg90 => (y, height.saturating_sub(1).saturating_sub(x)),
            Rotation::Deg180 => (
                width.saturating_sub(1).saturating_sub(x),
                height.saturating_sub(1).saturating_sub(y),
            ),
            Rotation::Deg270 => (width.saturating_sub(1).saturating_sub(y), x),
        }
    }

    #[must_use]
    pub fn apply(self, source: &RgbImage) -> RgbImage {
        if self.is_identity() {
            return source.clone();
        }
        let mut rotated = match self.rotation {
            Rotation::Deg0 => source.clone(),
            Rotation::Deg90 => imageops::rotate90(source),
            Rotation::Deg180 => imageops::rotate180(source),
            Rotation::Deg270 => imageops::rotate270(source),
        };
        if self.mirror {
            imageops::flip_horizontal_in_place(&mut rotated);
        }
        rotated
    }
}
