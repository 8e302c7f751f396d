// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::StoreError;
use crate::pipeline::frame::FrameRecord;

struct StoreInner {
    frames: VecDeque<FrameRecord>,
    /// Sequence number of `frames[0]`. Frame `i` has sequence
    /// `first_seq + i`; the counter only grows, even across evictions.
    first_seq: u64,
}

impl StoreInner {
    fn bounds(&self) -> Option<(u64, u64)> {
        Some((
            self.frames.front()?.timestamp_ns,
            self.frames.back()?.timestamp_ns,
        ))
    }

    /// Sequence number of the first frame in `[start_ns, end_ns]`.
    fn first_seq_in(&self, start_ns: u64, end_ns: u64) -> Option<u64> {
        let index = self.frames.partition_point(|f| f.timestamp_ns < start_ns);
        self.frames
            .get(index)
            .filter(|f| f.timestamp_ns <= end_ns)
            .map(|_| self.first_seq + index as u64)
    }

    /// Index of the latest frame with `timestamp <= target`.
    fn index_at_or_before(&self, target_ns: u64) -> Option<usize> {
        self.frames
            .partition_point(|f| f.timestamp_ns <= target_ns)
            .checked_sub(1)
    }
}

/// Bounded, time-ordered buffer of recent frames.
///
/// One writer (the capture ingest) appends; any number of readers look up
/// frames concurrently. Readers get cloned records whose payload is
/// reference counted, so eviction never pulls pixels out from under them.
pub struct FrameStore {
    max_duration_ns: u64,
    inner: RwLock<StoreInner>,
}

impl FrameStore {
    #[must_use]
    pub fn new(max_duration_ns: u64) -> Self {
        Self {
            max_duration_ns,
            inner: RwLock::new(StoreInner {
                frames: VecDeque::new(),
                first_seq: 0,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a frame and evicts everything older than
    /// `record.timestamp - max_duration`. Returns how many frames were
    /// evicted.
    ///
    /// # Errors
    ///
    /// Returns `NonMonotonicTimestamp` if the frame is not strictly newer
    /// than the latest stored frame.
    pub fn append(&self, record: FrameRecord) -> Result<usize, StoreError> {
        let mut inner = self.write();

        if let Some(last) = inner.frames.back()
            && record.timestamp_ns <= last.timestamp_ns
        {
            return Err(StoreError::NonMonotonicTimestamp {
                previous_ns: last.timestamp_ns,
                got_ns: record.timestamp_ns,
            });
        }

        let cutoff = record.timestamp_ns.saturating_sub(self.max_duration_ns);
        inner.frames.push_back(record);

        let mut evicted = 0;
        while inner
            .frames
            .front()
            .is_some_and(|oldest| oldest.timestamp_ns < cutoff)
        {
            inner.frames.pop_front();
            inner.first_seq += 1;
            evicted += 1;
        }

        Ok(evicted)
    }

    /// Returns the frame shown at `target_ns`: the latest frame captured at
    /// or before it.
    ///
    /// # Errors
    ///
    /// Returns `BufferUnderrun` if the store is empty or the target lies
    /// outside `[oldest, latest]`.
    pub fn frame_near(&self, target_ns: u64) -> Result<FrameRecord, StoreError> {
        let inner = self.read();
        let underrun = || StoreError::BufferUnderrun {
            target_ns,
            bounds: inner.bounds(),
        };

        let (oldest, latest) = inner.bounds().ok_or_else(underrun)?;
        if target_ns < oldest || target_ns > latest {
            return Err(underrun());
        }

        let index = inner.index_at_or_before(target_ns).ok_or_else(underrun)?;
        Ok(inner.frames[index].clone())
    }

    /// Steps `delta` frames away from the frame shown at `from_ns`, clamped
    /// to the stored range. `None` if the store is empty.
    #[must_use]
    pub fn frame_offset(&self, from_ns: u64, delta: i64) -> Option<FrameRecord> {
        let inner = self.read();
        let last = inner.frames.len().checked_sub(1)?;
        let base = inner.index_at_or_before(from_ns).unwrap_or(0);

        let target = if delta.is_negative() {
            base.saturating_sub(usize::try_from(delta.unsigned_abs()).unwrap_or(usize::MAX))
        } else {
            base.saturating_add(usize::try_from(delta).unwrap_or(usize::MAX))
                .min(last)
        };
        inner.frames.get(target).cloned()
    }

    /// Lazily iterates the frames with timestamps in `[start_ns, end_ns]`.
    ///
    /// The bounds check and the position of the first frame are taken under
    /// one lock. After that the iterator re-reads the store on every step, so
    /// it never holds the lock between frames, and a frame evicted before it
    /// was read comes back as `RangeEvicted` instead of being skipped.
    ///
    /// # Errors
    ///
    /// Returns `RangeOutsideBuffer` if either end lies outside
    /// `[oldest, latest]`.
    pub fn range(self: &Arc<Self>, start_ns: u64, end_ns: u64) -> Result<FrameRange, StoreError> {
        let inner = self.read();
        let bounds = inner.bounds();
        match bounds {
            Some((oldest, latest)) if start_ns >= oldest && end_ns <= latest => {
                let first_seq = inner.first_seq_in(start_ns, end_ns);
                Ok(FrameRange {
                    store: Arc::clone(self),
                    end_ns,
                    first_seq,
                    next_seq: first_seq,
                })
            }
            _ => Err(StoreError::RangeOutsideBuffer {
                start_ns,
                end_ns,
                bounds,
            }),
        }
    }

    #[must_use]
    pub fn oldest_timestamp(&self) -> Option<u64> {
        self.read().frames.front().map(|f| f.timestamp_ns)
    }

    #[must_use]
    pub fn latest_timestamp(&self) -> Option<u64> {
        self.read().frames.back().map(|f| f.timestamp_ns)
    }

    /// `(oldest, latest)` read under a single lock.
    #[must_use]
    pub fn bounds(&self) -> Option<(u64, u64)> {
        self.read().bounds()
    }

    #[must_use]
    pub fn span_ns(&self) -> u64 {
        self.bounds().map_or(0, |(oldest, latest)| latest - oldest)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().frames.is_empty()
    }

    /// Frames evicted since the store was created.
    #[must_use]
    pub fn evicted_total(&self) -> u64 {
        self.read().first_seq
    }

    fn frame_by_seq(&self, seq: u64) -> Result<Option<FrameRecord>, StoreError> {
        let inner = self.read();
        if seq < inner.first_seq {
            return Err(StoreError::RangeEvicted { seq });
        }
        let index = usize::try_from(seq - inner.first_seq).unwrap_or(usize::MAX);
        Ok(inner.frames.get(index).cloned())
    }
}

/// Finite, restartable iterator over a time range of a [`FrameStore`].
/// Holds its own handle on the store, so it can be moved to another thread.
pub struct FrameRange {
    store: Arc<FrameStore>,
    end_ns: u64,
    first_seq: Option<u64>,
    next_seq: Option<u64>,
}

impl FrameRange {
    /// No stored frame fell inside the range when it was created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.first_seq.is_none()
    }

    /// Rewinds to the first frame of the range. Frames evicted since are
    /// reported as `RangeEvicted` when reached.
    pub fn restart(&mut self) {
        self.next_seq = self.first_seq;
    }
}

impl Iterator for FrameRange {
    type Item = Result<FrameRecord, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let seq = self.next_seq?;
        match self.store.frame_by_seq(seq) {
            Ok(Some(frame)) if frame.timestamp_ns <= self.end_ns => {
                self.next_seq = Some(seq + 1);
                Some(Ok(frame))
            }
            Ok(_) => {
                self.next_seq = None;
                None
            }
            Err(e) => {
                self.next_seq = None;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use image::RgbImage;

    use super::*;
    use crate::pipeline::frame::Rotation;

    const SEC: u64 = 1_000_000_000;
    const FRAME: u64 = SEC / 30;

    fn frame(timestamp_ns: u64) -> FrameRecord {
        FrameRecord {
            timestamp_ns,
            payload: Arc::new(RgbImage::new(2, 2)),
            rotation: Rotation::Deg0,
            is_front_facing: false,
        }
    }

    fn filled(max_secs: u64, count: u64) -> Arc<FrameStore> {
        let store = Arc::new(FrameStore::new(max_secs * SEC));
        for i in 0..count {
            store.append(frame(i * FRAME)).unwrap();
        }
        store
    }

    #[test]
    fn empty_store_underruns() {
        let store = FrameStore::new(60 * SEC);
        assert!(store.is_empty());
        assert_eq!(store.bounds(), None);
        assert_eq!(
            store.frame_near(0).unwrap_err(),
            StoreError::BufferUnderrun {
                target_ns: 0,
                bounds: None
            }
        );
    }

    #[test]
    fn rejects_non_increasing_timestamps() {
        let store = FrameStore::new(60 * SEC);
        store.append(frame(100)).unwrap();
        assert_eq!(
            store.append(frame(100)).unwrap_err(),
            StoreError::NonMonotonicTimestamp {
                previous_ns: 100,
                got_ns: 100
            }
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn eviction_keeps_exactly_the_window() {
        let store = FrameStore::new(2 * SEC);
        for i in 0..200u64 {
            let ts = i * FRAME;
            store.append(frame(ts)).unwrap();

            let (oldest, latest) = store.bounds().unwrap();
            assert_eq!(latest, ts);
            let cutoff = ts.saturating_sub(2 * SEC);
            assert!(oldest >= cutoff);
            // the frame right before the oldest one must be past the cutoff
            if oldest > 0 {
                assert!(oldest - FRAME < cutoff);
            }
            let expected = (0..=i).filter(|j| j * FRAME >= cutoff).count();
            assert_eq!(store.len(), expected);
        }
        assert_eq!(store.evicted_total() + store.len() as u64, 200);
    }

    #[test]
    fn frame_near_prefers_the_earlier_frame() {
        let store = filled(60, 10);
        assert_eq!(store.frame_near(3 * FRAME).unwrap().timestamp_ns, 3 * FRAME);
        assert_eq!(
            store.frame_near(3 * FRAME + FRAME - 1).unwrap().timestamp_ns,
            3 * FRAME
        );
        assert_eq!(store.frame_near(9 * FRAME).unwrap().timestamp_ns, 9 * FRAME);
    }

    #[test]
    fn frame_near_outside_the_window_underruns() {
        let store = FrameStore::new(60 * SEC);
        store.append(frame(SEC)).unwrap();
        store.append(frame(2 * SEC)).unwrap();
        assert!(matches!(
            store.frame_near(SEC - 1),
            Err(StoreError::BufferUnderrun { .. })
        ));
        assert!(matches!(
            store.frame_near(2 * SEC + 1),
            Err(StoreError::BufferUnderrun { .. })
        ));
    }

    #[test]
    fn range_yields_inclusive_bounds_and_restarts() {
        let store = filled(60, 30);
        let mut range = store.range(5 * FRAME, 9 * FRAME).unwrap();
        assert!(!range.is_empty());
        let first: Vec<u64> = range.by_ref().map(|f| f.unwrap().timestamp_ns).collect();
        assert_eq!(first, (5..=9).map(|i| i * FRAME).collect::<Vec<_>>());
        assert!(range.next().is_none());

        range.restart();
        assert_eq!(range.count(), 5);
    }

    #[test]
    fn range_reports_eviction_of_unread_frames() {
        let store = filled(1, 30);
        let mut range = store.range(0, 29 * FRAME).unwrap();
        assert_eq!(range.next().unwrap().unwrap().timestamp_ns, 0);

        // push the window far enough that frames 1.. are gone
        store.append(frame(10 * SEC)).unwrap();

        assert!(matches!(
            range.next(),
            Some(Err(StoreError::RangeEvicted { seq: 1 }))
        ));
        assert!(range.next().is_none());
    }

    #[test]
    fn range_rejects_ranges_outside_the_buffer() {
        let store = filled(60, 30);
        assert!(matches!(
            store.range(0, 30 * FRAME),
            Err(StoreError::RangeOutsideBuffer {
                start_ns: 0,
                end_ns,
                bounds: Some((0, latest)),
            }) if end_ns == 30 * FRAME && latest == 29 * FRAME
        ));
        assert!(matches!(
            Arc::new(FrameStore::new(SEC)).range(0, 0),
            Err(StoreError::RangeOutsideBuffer { bounds: None, .. })
        ));

        let gap = store.range(3 * FRAME + 1, 3 * FRAME + 2).unwrap();
        assert!(gap.is_empty());
        assert_eq!(gap.count(), 0);
    }

    #[test]
    fn pinned_range_reports_frames_evicted_before_the_first_read() {
        let store = filled(1, 30);
        let mut range = store.range(0, 29 * FRAME).unwrap();

        // the oldest frame goes before anything was read
        store.append(frame(SEC + FRAME / 2)).unwrap();
        assert_eq!(store.oldest_timestamp(), Some(FRAME));

        assert!(matches!(
            range.next(),
            Some(Err(StoreError::RangeEvicted { seq: 0 }))
        ));
        assert!(range.next().is_none());

        // a range asked for now is rejected instead of starting one frame later
        assert!(matches!(
            store.range(0, 29 * FRAME),
            Err(StoreError::RangeOutsideBuffer { .. })
        ));
    }

    #[test]
    fn held_records_survive_eviction() {
        let store = FrameStore::new(SEC);
        store.append(frame(0)).unwrap();
        let held = store.frame_near(0).unwrap();
        store.append(frame(5 * SEC)).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(held.payload.width(), 2);
        assert_eq!(Arc::strong_count(&held.payload), 1);
    }

    #[test]
    fn frame_offset_clamps_to_stored_range() {
        let store = filled(60, 10);
        assert_eq!(
            store.frame_offset(4 * FRAME, 1).unwrap().timestamp_ns,
            5 * FRAME
        );
        assert_eq!(
            store.frame_offset(4 * FRAME, -2).unwrap().timestamp_ns,
            2 * FRAME
        );
        assert_eq!(store.frame_offset(4 * FRAME, -100).unwrap().timestamp_ns, 0);
        assert_eq!(
            store.frame_offset(4 * FRAME, 100).unwrap().timestamp_ns,
            9 * FRAME
        );
        assert!(FrameStore::new(SEC).frame_offset(0, 1).is_none());
    }

    #[test]
    fn concurrent_readers_never_see_gaps() {
        let store = Arc::new(FrameStore::new(SEC));
        let writer_store = Arc::clone(&store);
        let writer = thread::spawn(move || {
            for i in 0..3_000u64 {
                writer_store.append(frame(i * FRAME)).unwrap();
            }
        });

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..500 {
                        if let Some((oldest, latest)) = store.bounds() {
                            assert!(latest - oldest <= SEC);
                            let expected = (latest - oldest) / FRAME + 1;
                            // the writer may have moved the window since bounds()
                            let Ok(range) = store.range(oldest, latest) else {
                                continue;
                            };
                            let seen = range
                                .take_while(Result::is_ok)
                                .count() as u64;
                            assert!(seen <= expected);
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(store.latest_timestamp(), Some(2_999 * FRAME));
    }
}
