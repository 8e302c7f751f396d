// SPDX-License-Identifier: MIT
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result, bail};

use super::format::{ClipFrame, ClipHeader, ClipMetadata, EOF_MARKER, FORMAT_VERSION, MAGIC};

/// Replay speeds selectable with the speed keys.
pub const SPEED_STEPS: [f64; 5] = [0.25, 0.5, 1.0, 2.0, 4.0];
const DEFAULT_SPEED_INDEX: usize = 2; // 1.0x

pub struct ClipReader {
    metadata: ClipMetadata,
    frames: Vec<ClipFrame>,
}

impl ClipReader {
    /// Opens a clip, validates the header, and reads all frames.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, the header is invalid,
    /// or frame data is corrupted.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open clip: {}", path.display()))?;
        let buf_reader = BufReader::new(file);
        let mut decoder =
            zstd::Decoder::new(buf_reader).context("failed to create zstd decoder")?;

        let header: ClipHeader = read_record(&mut decoder)
            .and_then(|data| postcard::from_bytes(&data).context("failed to deserialize clip header"))
            .context("failed to read clip header")?;

        if header.magic != MAGIC {
            bail!("{} is not a clip (bad magic bytes)", path.display());
        }
        if header.format_version != FORMAT_VERSION {
            bail!(
                "unsupported clip format version {} (expected {FORMAT_VERSION})",
                header.format_version
            );
        }

        let frames = Self::read_all_frames(&mut decoder)?;

        Ok(Self {
            metadata: header.metadata,
            frames,
        })
    }

    #[must_use]
    pub fn metadata(&self) -> &ClipMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn frame_at(&self, index: usize) -> Option<&ClipFrame> {
        self.frames.get(index)
    }

    #[must_use]
    pub fn frames(&self) -> &[ClipFrame] {
        &self.frames
    }

    fn read_all_frames(reader: &mut impl Read) -> Result<Vec<ClipFrame>> {
        let mut frames = Vec::new();
        let mut len_buf = [0u8; 4];

        loop {
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    bail!("clip is truncated after {} frames", frames.len())
                }
                Err(e) => return Err(e).context("failed to read frame length"),
            }

            if len_buf == EOF_MARKER {
                break;
            }

            let len = u32::from_le_bytes(len_buf) as usize;
            let mut data = vec![0u8; len];
            reader
                .read_exact(&mut data)
                .context("failed to read frame data")?;

            let frame: ClipFrame =
                postcard::from_bytes(&data).context("failed to deserialize frame")?;
            frames.push(frame);
        }

        Ok(frames)
    }
}

fn read_record(reader: &mut impl Read) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .context("failed to read record length")?;
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .context("failed to read record data")?;
    Ok(data)
}

/// Paced playback of a loaded clip with pause, frame stepping and speed
/// control.
pub struct ClipPlayer {
    reader: ClipReader,
    current_index: usize,
    speed_index: usize,
    last_emitted: Instant,
    paused: bool,
}

impl ClipPlayer {
    #[must_use]
    pub fn new(reader: ClipReader) -> Self {
        Self {
            reader,
            current_index: 0,
            speed_index: DEFAULT_SPEED_INDEX,
            last_emitted: Instant::now(),
            paused: false,
        }
    }

    #[must_use]
    pub fn metadata(&self) -> &ClipMetadata {
        self.reader.metadata()
    }

    /// Advances to the next frame once its capture spacing, scaled by the
    /// playback speed, has elapsed. `None` while paused, between frames, or
    /// at the end of the clip.
    pub fn next_frame(&mut self) -> Option<&ClipFrame> {
        if self.paused {
            return None;
        }

        let next = self.reader.frame_at(self.current_index + 1)?;
        let current = self.reader.frame_at(self.current_index)?;
        let spacing_ns = next.offset_ns.saturating_sub(current.offset_ns);
        #[allow(clippy::cast_precision_loss)]
        let required_ns = spacing_ns as f64 / self.speed();
        let elapsed_ns = self.last_emitted.elapsed().as_nanos();

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        if elapsed_ns < required_ns as u128 {
            return None;
        }

        self.current_index += 1;
        self.last_emitted = Instant::now();
        self.reader.frame_at(self.current_index)
    }

    /// Frame currently on screen.
    #[must_use]
    pub fn current_frame(&self) -> Option<&ClipFrame> {
        self.reader.frame_at(self.current_index)
    }

    #[must_use]
    pub fn speed(&self) -> f64 {
        SPEED_STEPS[self.speed_index]
    }

    pub fn speed_up(&mut self) {
        self.speed_index = (self.speed_index + 1).min(SPEED_STEPS.len() - 1);
    }

    pub fn speed_down(&mut self) {
        self.speed_index = self.speed_index.saturating_sub(1);
    }

    pub fn toggle_pause(&mut self) {
        self.paused = !self.paused;
        if !self.paused {
            self.last_emitted = Instant::now();
        }
    }

    /// Moves `delta` frames, clamped to the clip. Pauses playback.
    pub fn step(&mut self, delta: i64) {
        self.paused = true;
        let target = if delta.is_negative() {
            self.current_index
                .saturating_sub(usize::try_from(delta.unsigned_abs()).unwrap_or(usize::MAX))
        } else {
            self.current_index
                .saturating_add(usize::try_from(delta).unwrap_or(usize::MAX))
        };
        self.seek_to(target);
    }

    /// Jumps to `index`, clamped to the last frame. Keeps the pause state.
    pub fn seek_to(&mut self, index: usize) {
        self.current_index = index.min(self.reader.frame_count().saturating_sub(1));
        self.last_emitted = Instant::now();
    }

    pub fn seek_end(&mut self) {
        self.seek_to(usize::MAX);
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    #[must_use]
    pub fn current_index(&self) -> usize {
        self.current_index
    }

    #[must_use]
    pub fn total_frames(&self) -> usize {
        self.reader.frame_count()
    }

    /// True once the last frame is on screen.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.current_index + 1 >= self.reader.frame_count()
    }

    /// Position in the clip, 0.0 at the first frame and 1.0 at the last.
    #[must_use]
    pub fn progress_fraction(&self) -> f64 {
        let total = self.reader.frame_count();
        if total <= 1 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let fraction = self.current_index as f64 / (total - 1) as f64;
        fraction
    }
}
