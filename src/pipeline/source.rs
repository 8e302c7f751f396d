// SPDX-License-Identifier: MIT
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use image::{Rgb, RgbImage, imageops};

use crate::clip::reader::ClipReader;
use crate::clock::{Clock, NANOS_PER_SECOND};
use crate::config::{CameraFacing, SessionConfig};
use crate::error::CaptureError;
use crate::pipeline::frame::{FramePayload, Rotation};

pub const MIN_ZOOM: f32 = 1.0;
pub const MAX_ZOOM: f32 = 8.0;

/// A frame as delivered by the camera, before the ingest stamps it.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub payload: FramePayload,
    pub timestamp_ns: u64,
    pub rotation: Rotation,
    pub is_front_facing: bool,
}

/// Contract with the camera device. Timestamps must come from the session
/// clock handed to the source at construction.
pub trait FrameSource: Send {
    /// # Errors
    ///
    /// Returns an error if the device cannot start streaming.
    fn start(&mut self) -> Result<(), CaptureError>;

    fn stop(&mut self);

    /// Blocks for at most about one frame interval. `Ok(None)` means no
    /// frame arrived in that time, which is how a stall looks from here.
    ///
    /// # Errors
    ///
    /// Returns an error if the device failed; the session treats hardware
    /// errors as fatal.
    fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError>;

    /// # Errors
    ///
    /// Returns an error if the requested camera does not exist.
    fn select_camera(&mut self, _facing: CameraFacing) -> Result<(), CaptureError> {
        Ok(())
    }

    fn set_zoom(&mut self, _level: f32) {}

    fn describe(&self) -> String;
}

/// Sleeps to absolute deadlines so that frame delivery does not drift.
struct FramePacer {
    interval: Duration,
    next_deadline: Option<Instant>,
}

impl FramePacer {
    fn new(fps: u32) -> Self {
        Self {
            interval: Duration::from_nanos(NANOS_PER_SECOND / u64::from(fps.max(1))),
            next_deadline: None,
        }
    }

    fn wait(&mut self) {
        let now = Instant::now();
        let deadline = self.next_deadline.unwrap_or(now);
        if let Some(remaining) = deadline.checked_duration_since(now) {
            thread::sleep(remaining);
        }
        // after a long hiccup, restart the cadence instead of bursting
        let next = deadline + self.interval;
        self.next_deadline = Some(if next < now { now + self.interval } else { next });
    }

    fn reset(&mut self) {
        self.next_deadline = None;
    }
}

/// Synthetic camera: an upright scene with a sweeping bar and a per-second
/// colour block, handed out in the sensor's mounting orientation so the
/// display transform has something real to undo.
pub struct TestPatternSource {
    clock: Arc<dyn Clock>,
    width: u32,
    height: u32,
    rotation: Rotation,
    facing: CameraFacing,
    zoom: f32,
    pacer: Option<FramePacer>,
    frame_index: u64,
    fail_after: Option<u64>,
    running: bool,
}

impl TestPatternSource {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, config: &SessionConfig, width: u32, height: u32) -> Self {
        Self {
            clock,
            width: width.max(2),
            height: height.max(2),
            rotation: config.rotation,
            facing: config.camera_facing,
            zoom: MIN_ZOOM,
            pacer: Some(FramePacer::new(config.capture_fps)),
            frame_index: 0,
            fail_after: None,
            running: false,
        }
    }

    /// Delivers frames as fast as they are asked for.
    #[cfg(test)]
    #[must_use]
    pub fn unpaced(mut self) -> Self {
        self.pacer = None;
        self
    }

    /// Simulates the camera hardware dying after `frames` frames.
    #[must_use]
    pub fn with_failure_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    fn render_scene(&self, timestamp_ns: u64) -> RgbImage {
        let (w, h) = (self.width, self.height);
        let secs = timestamp_ns / NANOS_PER_SECOND;
        #[allow(clippy::cast_precision_loss)]
        let phase = (timestamp_ns % (2 * NANOS_PER_SECOND)) as f32 / (2 * NANOS_PER_SECOND) as f32;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let bar_x = (phase * w as f32) as u32;
        let bar_w = (w / 16).max(1);
        let tint: u8 = if self.facing.is_front() { 90 } else { 30 };
        let block = Self::second_colour(secs);
        let marker = (w.min(h) / 6).max(1);
        let zoom = self.zoom;

        RgbImage::from_fn(w, h, |x, y| {
            if x < marker && y < marker {
                // top-left marker makes orientation mistakes visible
                return Rgb([255, 0, 0]);
            }
            if x + marker * 2 >= w && y + marker * 2 >= h {
                return block;
            }
            if x >= bar_x && x < bar_x + bar_w {
                return Rgb([255, 255, 255]);
            }
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
            let checker = (((x as f32 * zoom) as u32 / 8) + ((y as f32 * zoom) as u32 / 8)) % 2;
            #[allow(clippy::cast_possible_truncation)]
            let shade = (y * 200 / h) as u8;
            if checker == 0 {
                Rgb([tint, shade / 2, shade])
            } else {
                Rgb([tint / 2, shade / 3, shade / 2])
            }
        })
    }

    fn second_colour(secs: u64) -> Rgb<u8> {
        const PALETTE: [[u8; 3]; 6] = [
            [255, 200, 0],
            [0, 200, 255],
            [0, 255, 120],
            [255, 0, 200],
            [120, 120, 255],
            [255, 255, 255],
        ];
        #[allow(clippy::cast_possible_truncation)]
        let index = (secs % PALETTE.len() as u64) as usize;
        Rgb(PALETTE[index])
    }

    /// Undoes the display rotation so the frame looks like it came off a
    /// sensor mounted at `self.rotation`.
    fn to_sensor_orientation(&self, scene: &RgbImage) -> RgbImage {
        match self.rotation {
            Rotation::Deg0 => scene.clone(),
            Rotation::Deg90 => imageops::rotate270(scene),
            Rotation::Deg180 => imageops::rotate180(scene),
            Rotation::Deg270 => imageops::rotate90(scene),
        }
    }
}

impl FrameSource for TestPatternSource {
    fn start(&mut self) -> Result<(), CaptureError> {
        self.running = true;
        if let Some(pacer) = self.pacer.as_mut() {
            pacer.reset();
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError> {
        if !self.running {
            return Err(CaptureError::Disconnected);
        }
        if let Some(limit) = self.fail_after
            && self.frame_index >= limit
        {
            return Err(CaptureError::Hardware(format!(
                "sensor stopped responding after {limit} frames"
            )));
        }
        if let Some(pacer) = self.pacer.as_mut() {
            pacer.wait();
        }

        let timestamp_ns = self.clock.now_ns();
        let scene = self.render_scene(timestamp_ns);
        self.frame_index += 1;

        Ok(Some(RawFrame {
            payload: Arc::new(self.to_sensor_orientation(&scene)),
            timestamp_ns,
            rotation: self.rotation,
            is_front_facing: self.facing.is_front(),
        }))
    }

    fn select_camera(&mut self, facing: CameraFacing) -> Result<(), CaptureError> {
        self.facing = facing;
        Ok(())
    }

    fn set_zoom(&mut self, level: f32) {
        self.zoom = level.clamp(MIN_ZOOM, MAX_ZOOM);
    }

    fn describe(&self) -> String {
        format!(
            "test pattern {}x{} ({} camera, {})",
            self.width, self.height, self.facing, self.rotation
        )
    }
}

/// Plays an exported clip back as if it were a live camera, looping at the
/// clip's frame rate. Clip frames are already upright, so no rotation is
/// reported.
pub struct ClipSource {
    clock: Arc<dyn Clock>,
    reader: ClipReader,
    pacer: FramePacer,
    index: usize,
    running: bool,
}

impl ClipSource {
    /// # Errors
    ///
    /// Returns an error if the clip has no frames.
    pub fn new(clock: Arc<dyn Clock>, reader: ClipReader) -> anyhow::Result<Self> {
        if reader.frame_count() == 0 {
            anyhow::bail!("clip has no frames to play");
        }
        let fps = reader.metadata().capture_fps;
        Ok(Self {
            clock,
            reader,
            pacer: FramePacer::new(fps),
            index: 0,
            running: false,
        })
    }
}

impl FrameSource for ClipSource {
    fn start(&mut self) -> Result<(), CaptureError> {
        self.running = true;
        self.pacer.reset();
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError> {
        if !self.running {
            return Err(CaptureError::Disconnected);
        }
        let Some(frame) = self.reader.frame_at(self.index) else {
            return Err(CaptureError::Disconnected);
        };
        let Some(image) = frame.to_image() else {
            return Err(CaptureError::Hardware(format!(
                "clip frame {} has a corrupt pixel buffer",
                self.index
            )));
        };
        self.pacer.wait();
        self.index = (self.index + 1) % self.reader.frame_count();

        Ok(Some(RawFrame {
            payload: Arc::new(image),
            timestamp_ns: self.clock.now_ns(),
            rotation: Rotation::Deg0,
            is_front_facing: false,
        }))
    }

    fn describe(&self) -> String {
        format!(
            "clip playback ({} frames, looping)",
            self.reader.frame_count()
        )
    }
}
