// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Instant, SystemTime};

use tracing::{info, warn};

use crate::clip::format::{ClipFrame, ClipMetadata};
use crate::clip::writer::ClipWriter;
use crate::error::{ExportError, StoreError};
use crate::pipeline::frame::DisplayTransform;
use crate::pipeline::store::{FrameRange, FrameStore};

/// Closed interval of capture times, `start_ns <= end_ns`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipRange {
    pub start_ns: u64,
    pub end_ns: u64,
}

impl ClipRange {
    /// # Errors
    ///
    /// Returns `InvalidRange` if `start_ns > end_ns`.
    pub fn new(start_ns: u64, end_ns: u64) -> Result<Self, ExportError> {
        if start_ns > end_ns {
            return Err(ExportError::InvalidRange { start_ns, end_ns });
        }
        Ok(Self { start_ns, end_ns })
    }

    #[must_use]
    pub fn duration_ns(&self) -> u64 {
        self.end_ns - self.start_ns
    }
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub range: ClipRange,
    pub frames: u64,
    pub orientation: DisplayTransform,
    pub width: u32,
    pub height: u32,
}

/// Writes a buffered time range to a clip file with orientation already
/// applied. Reads the store lazily and never blocks ingest for longer than a
/// single frame lookup.
#[derive(Clone)]
pub struct ClipExporter {
    store: Arc<FrameStore>,
    capture_fps: u32,
}

impl ClipExporter {
    #[must_use]
    pub fn new(store: Arc<FrameStore>, capture_fps: u32) -> Self {
        Self { store, capture_fps }
    }

    /// Checks that `range` lies inside what the store holds right now and
    /// pins where reading starts. Anything evicted after this point fails
    /// the export instead of shortening it.
    ///
    /// # Errors
    ///
    /// Returns `RangeOutOfBuffer` if either end is outside the buffer.
    pub fn validate(&self, range: ClipRange) -> Result<FrameRange, ExportError> {
        self.store
            .range(range.start_ns, range.end_ns)
            .map_err(map_store_error)
    }

    /// Exports synchronously. On any failure the partial output is removed.
    ///
    /// # Errors
    ///
    /// Returns `RangeOutOfBuffer` or `EmptyRange` if the range cannot be
    /// served, `RangeEvictedDuringExport` if ingest overtook the export, and
    /// `Encode` for file and encoding failures.
    pub fn export(&self, range: ClipRange, path: &Path) -> Result<ExportSummary, ExportError> {
        let frames = self.validate(range)?;
        self.write_clip(range, frames, path)
    }

    fn write_clip(
        &self,
        range: ClipRange,
        mut frames: FrameRange,
        path: &Path,
    ) -> Result<ExportSummary, ExportError> {
        let started = Instant::now();
        let empty = || ExportError::EmptyRange {
            start_ns: range.start_ns,
            end_ns: range.end_ns,
        };
        if frames.is_empty() {
            return Err(empty());
        }

        let first = match frames.next() {
            None => return Err(empty()),
            Some(Err(e)) => return Err(map_store_error(e)),
            Some(Ok(frame)) => frame,
        };

        let orientation = first.transform();
        let (width, height) = orientation.output_dimensions(first.payload.width(), first.payload.height());
        let metadata = ClipMetadata {
            capture_fps: self.capture_fps,
            orientation: orientation.into(),
            source_rotation: first.rotation,
            front_facing: first.is_front_facing,
            width,
            height,
            range_start_ns: range.start_ns,
            range_end_ns: range.end_ns,
            created: SystemTime::now(),
        };

        let mut writer = ClipWriter::create(path, &metadata)?;
        let base_ns = first.timestamp_ns;

        // the header came from the first frame; write the body from the top
        frames.restart();
        let written = frames.try_for_each(|frame| {
            let frame = frame.map_err(map_store_error)?;
            let corrected = frame.transform().apply(&frame.payload);
            writer
                .write_frame(&ClipFrame::from_image(frame.timestamp_ns - base_ns, corrected))
                .map_err(ExportError::from)
        });

        if let Err(e) = written {
            warn!(path = %path.display(), error = %e, "export failed");
            writer.abort();
            return Err(e);
        }

        let frame_count = writer.finish()?;
        info!(
            path = %path.display(),
            frames = frame_count,
            span_ms = range.duration_ns() / 1_000_000,
            elapsed_ms = started.elapsed().as_millis(),
            "clip exported"
        );

        Ok(ExportSummary {
            path: path.to_path_buf(),
            range,
            frames: frame_count,
            orientation,
            width,
            height,
        })
    }

    /// Runs the export on a `clip-export` thread.
    ///
    /// # Errors
    ///
    /// Returns the validation error straight away if the range is already
    /// outside the buffer, or `Io` if the thread cannot be spawned. The read
    /// position is pinned here, before the thread starts.
    pub fn spawn(self, range: ClipRange, path: PathBuf) -> Result<ExportJob, ExportError> {
        let frames = self.validate(range)?;
        let thread_path = path.clone();
        let handle = thread::Builder::new()
            .name("clip-export".into())
            .spawn(move || self.write_clip(range, frames, &thread_path))
            .map_err(|source| ExportError::Io {
                path: path.clone(),
                source,
            })?;

        Ok(ExportJob {
            path,
            range,
            handle: Some(handle),
        })
    }
}

fn map_store_error(error: StoreError) -> ExportError {
    match error {
        StoreError::RangeEvicted { .. } => ExportError::RangeEvictedDuringExport,
        StoreError::RangeOutsideBuffer {
            start_ns,
            end_ns,
            bounds,
        } => ExportError::RangeOutOfBuffer {
            start_ns,
            end_ns,
            bounds,
        },
        other => ExportError::Encode(other.into()),
    }
}

/// A clip export running in the background.
pub struct ExportJob {
    path: PathBuf,
    range: ClipRange,
    handle: Option<thread::JoinHandle<Result<ExportSummary, ExportError>>>,
}

impl ExportJob {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn range(&self) -> ClipRange {
        self.range
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(thread::JoinHandle::is_finished)
    }

    /// Non-blocking: the result once the export is done, `None` before that
    /// and after the result has been taken.
    pub fn poll(&mut self) -> Option<Result<ExportSummary, ExportError>> {
        if !self.handle.as_ref()?.is_finished() {
            return None;
        }
        self.handle.take().map(join_export)
    }

    /// Waits for the export.
    ///
    /// # Errors
    ///
    /// Returns the export's own error, or `WorkerPanicked`.
    pub fn join(mut self) -> Result<ExportSummary, ExportError> {
        self.handle
            .take()
            .map_or(Err(ExportError::WorkerPanicked), join_export)
    }
}

fn join_export(
    handle: thread::JoinHandle<Result<ExportSummary, ExportError>>,
) -> Result<ExportSummary, ExportError> {
    handle.join().unwrap_or(Err(ExportError::WorkerPanicked))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use image::{Rgb, RgbImage};

    use super::*;
    use crate::clip::reader::ClipReader;
    use crate::clip::writer::partial_path;
    use crate::pipeline::frame::{FrameRecord, Rotation};

    const SEC: u64 = 1_000_000_000;
    const FRAME: u64 = SEC / 30;

    fn test_dir(name: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("delaycam_export_{name}_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// 4x2 sensor frame with a red marker at the top-left pixel.
    fn marked_payload() -> Arc<RgbImage> {
        let mut image = RgbImage::new(4, 2);
        image.put_pixel(0, 0, Rgb([255, 0, 0]));
        Arc::new(image)
    }

    fn store_with(
        frames: u64,
        buffer_ns: u64,
        rotation: Rotation,
        front: bool,
    ) -> Arc<FrameStore> {
        let store = Arc::new(FrameStore::new(buffer_ns));
        for i in 0..frames {
            store
                .append(FrameRecord {
                    timestamp_ns: i * FRAME,
                    payload: marked_payload(),
                    rotation,
                    is_front_facing: front,
                })
                .unwrap();
        }
        store
    }

    #[test]
    fn range_must_be_ordered() {
        assert!(matches!(
            ClipRange::new(10, 5),
            Err(ExportError::InvalidRange {
                start_ns: 10,
                end_ns: 5
            })
        ));
        assert_eq!(ClipRange::new(5, 5).unwrap().duration_ns(), 0);
    }

    #[test]
    fn exports_front_camera_clip_corrected() {
        let dir = test_dir("front");
        let path = dir.join("front.dlyc");
        let store = store_with(120, 60 * SEC, Rotation::Deg90, true);
        let exporter = ClipExporter::new(Arc::clone(&store), 30);

        let summary = exporter
            .export(ClipRange::new(SEC, 3 * SEC).unwrap(), &path)
            .unwrap();
        // frames 31..=90 lie in [1 s, 3 s]
        assert_eq!(summary.frames, 60);
        assert_eq!((summary.width, summary.height), (2, 4));
        assert!(!partial_path(&path).exists());

        let reader = ClipReader::open(&path).unwrap();
        let meta = reader.metadata();
        assert_eq!(meta.orientation.rotation_degrees, 90);
        assert!(meta.orientation.mirrored);
        assert_eq!(meta.capture_fps, 30);
        assert_eq!((meta.range_start_ns, meta.range_end_ns), (SEC, 3 * SEC));
        assert_eq!(reader.frame_count(), 60);
        assert_eq!(reader.frame_at(0).unwrap().offset_ns, 0);
        assert_eq!(reader.frame_at(59).unwrap().offset_ns, 59 * FRAME);

        // rotate 90 then mirror is a transpose: the marker stays at (0, 0)
        let image = reader.frame_at(0).unwrap().to_image().unwrap();
        assert_eq!(image.dimensions(), (2, 4));
        assert_eq!(image.get_pixel(0, 0), &Rgb([255, 0, 0]));
        assert_eq!(image.get_pixel(1, 0), &Rgb([0, 0, 0]));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn back_camera_rotation_moves_the_marker() {
        let dir = test_dir("back");
        let path = dir.join("back.dlyc");
        let store = store_with(30, 60 * SEC, Rotation::Deg90, false);
        ClipExporter::new(store, 30)
            .export(ClipRange::new(0, 10 * FRAME).unwrap(), &path)
            .unwrap();

        let image = ClipReader::open(&path)
            .unwrap()
            .frame_at(0)
            .unwrap()
            .to_image()
            .unwrap();
        // clockwise: top-left goes to top-right
        assert_eq!(image.get_pixel(1, 0), &Rgb([255, 0, 0]));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn range_starting_before_the_buffer_fails() {
        let dir = test_dir("before");
        let path = dir.join("before.dlyc");
        let store = store_with(120, 60 * SEC, Rotation::Deg0, false);
        // evict the first second by appending well past it
        store
            .append(FrameRecord {
                timestamp_ns: 61 * SEC,
                payload: marked_payload(),
                rotation: Rotation::Deg0,
                is_front_facing: false,
            })
            .unwrap();
        let exporter = ClipExporter::new(Arc::clone(&store), 30);

        let result = exporter.export(ClipRange::new(0, 62 * SEC).unwrap(), &path);
        assert!(matches!(result, Err(ExportError::RangeOutOfBuffer { .. })));
        assert!(!path.exists());
        assert!(!partial_path(&path).exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn gap_without_frames_is_empty() {
        let dir = test_dir("empty");
        let path = dir.join("empty.dlyc");
        let store = Arc::new(FrameStore::new(60 * SEC));
        for ts in [0, 10 * SEC] {
            store
                .append(FrameRecord {
                    timestamp_ns: ts,
                    payload: marked_payload(),
                    rotation: Rotation::Deg0,
                    is_front_facing: false,
                })
                .unwrap();
        }
        let result =
            ClipExporter::new(store, 30).export(ClipRange::new(2 * SEC, 3 * SEC).unwrap(), &path);
        assert!(matches!(result, Err(ExportError::EmptyRange { .. })));
        assert!(!partial_path(&path).exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    fn big_frame(timestamp_ns: u64) -> FrameRecord {
        FrameRecord {
            timestamp_ns,
            payload: Arc::new(RgbImage::new(320, 240)),
            rotation: Rotation::Deg90,
            is_front_facing: false,
        }
    }

    #[test]
    fn eviction_before_the_first_read_fails_and_cleans_up() {
        let dir = test_dir("evicted_first");
        let path = dir.join("evicted.dlyc");
        let store = store_with(30, SEC, Rotation::Deg0, false);
        let exporter = ClipExporter::new(Arc::clone(&store), 30);
        let range = ClipRange::new(0, 29 * FRAME).unwrap();

        let frames = exporter.validate(range).unwrap();
        // ingest pushes frame 0 out of the window before the export reads it
        store
            .append(FrameRecord {
                timestamp_ns: SEC + FRAME / 2,
                payload: marked_payload(),
                rotation: Rotation::Deg0,
                is_front_facing: false,
            })
            .unwrap();

        let result = exporter.write_clip(range, frames, &path);
        assert!(
            matches!(result, Err(ExportError::RangeEvictedDuringExport)),
            "got {result:?}"
        );
        assert!(!path.exists());
        assert!(!partial_path(&path).exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn export_racing_ingest_never_truncates() {
        let dir = test_dir("race");
        let path = dir.join("race.dlyc");
        let store = Arc::new(FrameStore::new(5 * SEC));
        for i in 0..150 {
            store.append(big_frame(i * FRAME)).unwrap();
        }
        let exporter = ClipExporter::new(Arc::clone(&store), 30);
        let range = ClipRange::new(0, 149 * FRAME).unwrap();
        let job = exporter.spawn(range, path.clone()).unwrap();

        // ingest evicts one frame per append while the export runs
        let running = Arc::new(AtomicBool::new(true));
        let feeder = {
            let store = Arc::clone(&store);
            let running = Arc::clone(&running);
            thread::spawn(move || {
                let mut ts = 150 * FRAME;
                while running.load(Ordering::Relaxed) && ts < 400 * FRAME {
                    store.append(big_frame(ts)).unwrap();
                    ts += FRAME;
                    thread::yield_now();
                }
            })
        };

        let result = job.join();
        running.store(false, Ordering::Relaxed);
        feeder.join().unwrap();

        match result {
            Ok(summary) => {
                assert_eq!(summary.frames, 150);
                assert_eq!(ClipReader::open(&path).unwrap().frame_count(), 150);
            }
            Err(ExportError::RangeEvictedDuringExport) => {
                assert!(!path.exists());
                assert!(!partial_path(&path).exists());
            }
            Err(other) => panic!("unexpected export error: {other}"),
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn background_job_reports_through_poll() {
        let dir = test_dir("poll");
        let path = dir.join("poll.dlyc");
        let store = store_with(60, 60 * SEC, Rotation::Deg0, false);
        let mut job = ClipExporter::new(store, 30)
            .spawn(ClipRange::new(0, SEC).unwrap(), path.clone())
            .unwrap();
        assert_eq!(job.path(), path.as_path());

        let deadline = Instant::now() + std::time::Duration::from_secs(10);
        let summary = loop {
            if let Some(result) = job.poll() {
                break result.unwrap();
            }
            assert!(Instant::now() < deadline, "export never finished");
            thread::sleep(std::time::Duration::from_millis(5));
        };
        assert_eq!(summary.frames, 31);
        assert!(job.poll().is_none());
        assert!(job.is_finished());
        std::fs::remove_dir_all(&dir).ok();
    }
}
