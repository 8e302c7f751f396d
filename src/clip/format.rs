// SPDX-License-Identifier: MIT
use std::time::SystemTime;

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::pipeline::frame::{DisplayTransform, Rotation};

pub const MAGIC: [u8; 4] = *b"DLYC";
pub const FORMAT_VERSION: u8 = 1;
pub const EOF_MARKER: [u8; 4] = *b"DEOF";

pub const CLIP_EXTENSION: &str = "dlyc";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClipHeader {
    pub magic: [u8; 4],
    pub format_version: u8,
    pub metadata: ClipMetadata,
}

/// Orientation tag written with every clip. Frames are stored already
/// corrected, so a player shows them as-is; the tag records what correction
/// was applied.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Orientation {
    pub rotation_degrees: u32,
    pub mirrored: bool,
}

impl From<DisplayTransform> for Orientation {
    fn from(transform: DisplayTransform) -> Self {
        Self {
            rotation_degrees: transform.rotation.degrees(),
            mirrored: transform.mirror,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClipMetadata {
    pub capture_fps: u32,
    pub orientation: Orientation,
    pub source_rotation: Rotation,
    pub front_facing: bool,
    /// Dimensions of the stored (corrected) frames.
    pub width: u32,
    pub height: u32,
    /// Capture times of the requested range on the session clock.
    pub range_start_ns: u64,
    pub range_end_ns: u64,
    pub created: SystemTime,
}

impl ClipMetadata {
    #[allow(dead_code)]
    #[must_use]
    pub fn duration_ns(&self) -> u64 {
        self.range_end_ns.saturating_sub(self.range_start_ns)
    }
}

/// One RGB8 frame; `offset_ns` is relative to the clip's first frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClipFrame {
    pub offset_ns: u64,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl ClipFrame {
    #[must_use]
    pub fn from_image(offset_ns: u64, image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            offset_ns,
            width,
            height,
            pixels: image.into_raw(),
        }
    }

    /// `None` if the pixel buffer does not match the stated dimensions.
    #[must_use]
    pub fn to_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.pixels.clone())
    }

    /// Average brightness, 0-255 (Rec. 601 weights).
    #[must_use]
    pub fn mean_luma(&self) -> f64 {
        let pixel_count = self.pixels.len() / 3;
        if pixel_count == 0 {
            return 0.0;
        }
        let sum: f64 = self
            .pixels
            .chunks_exact(3)
            .map(|p| 0.299 * f64::from(p[0]) + 0.587 * f64::from(p[1]) + 0.114 * f64::from(p[2]))
            .sum();
        #[allow(clippy::cast_precision_loss)]
        let count = pixel_count as f64;
        sum / count
    }
}
