// SPDX-License-Identifier: MIT
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use tracing::{debug, error, info, warn};

use crate::error::{CaptureError, StoreError};
use crate::pipeline::frame::{FramePayload, FrameRecord, Rotation};
use crate::pipeline::source::{FrameSource, RawFrame};
use crate::pipeline::store::FrameStore;

/// Turns delivered camera frames into stored records.
///
/// Capture times are forced strictly increasing; a source that repeats or
/// rewinds a timestamp gets it bumped by a nanosecond past the previous
/// frame. Stalls are left visible: nothing is synthesised to fill a gap.
pub struct CaptureIngest {
    store: Arc<FrameStore>,
    last_timestamp_ns: Option<u64>,
    frames_ingested: Arc<AtomicU64>,
}

impl CaptureIngest {
    #[must_use]
    pub fn new(store: Arc<FrameStore>) -> Self {
        Self {
            store,
            last_timestamp_ns: None,
            frames_ingested: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter of frames written so far, readable from other threads.
    #[must_use]
    pub fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.frames_ingested)
    }

    /// Stamps and stores one frame, returning the capture time it was given.
    ///
    /// # Errors
    ///
    /// Propagates store rejections; with stamping in place these do not
    /// happen for a single ingest stream.
    pub fn on_frame(
        &mut self,
        payload: FramePayload,
        timestamp_ns: u64,
        rotation: Rotation,
        is_front_facing: bool,
    ) -> Result<u64, StoreError> {
        let stamped = match self.last_timestamp_ns {
            Some(last) if timestamp_ns <= last => {
                warn!(got_ns = timestamp_ns, previous_ns = last, "out-of-order frame re-stamped");
                last + 1
            }
            _ => timestamp_ns,
        };

        let evicted = self.store.append(FrameRecord {
            timestamp_ns: stamped,
            payload,
            rotation,
            is_front_facing,
        })?;
        if evicted > 0 {
            debug!(evicted, "evicted frames past the buffer window");
        }

        self.last_timestamp_ns = Some(stamped);
        self.frames_ingested.fetch_add(1, Ordering::Relaxed);
        Ok(stamped)
    }

    /// # Errors
    ///
    /// See [`CaptureIngest::on_frame`].
    pub fn ingest(&mut self, raw: RawFrame) -> Result<u64, StoreError> {
        self.on_frame(
            raw.payload,
            raw.timestamp_ns,
            raw.rotation,
            raw.is_front_facing,
        )
    }
}

/// Control messages applied to the source between frames.
#[derive(Debug, Clone, Copy)]
pub enum SourceCommand {
    SetZoom(f32),
}

/// Owns the thread that pulls frames out of the source and into the store.
pub struct IngestWorker {
    shutdown: Arc<AtomicBool>,
    commands: Sender<SourceCommand>,
    handle: Option<thread::JoinHandle<()>>,
}

impl IngestWorker {
    /// Starts the source on a dedicated `capture-ingest` thread.
    ///
    /// `on_failure` runs at most once, on the ingest thread, if the source
    /// fails to start or reports an error while streaming.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn<F>(
        mut source: Box<dyn FrameSource>,
        mut ingest: CaptureIngest,
        on_failure: F,
    ) -> anyhow::Result<Self>
    where
        F: FnOnce(CaptureError) + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (commands, command_rx) = mpsc::channel();
        let shutdown_clone = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("capture-ingest".into())
            .spawn(move || {
                info!(source = %source.describe(), "capture started");
                let result =
                    run_ingest_loop(source.as_mut(), &mut ingest, &command_rx, &shutdown_clone);
                source.stop();
                match result {
                    Ok(()) => info!("capture stopped"),
                    Err(e) => {
                        error!(error = %e, "capture failed");
                        on_failure(e);
                    }
                }
            })
            .map_err(|e| anyhow::anyhow!("failed to spawn capture-ingest thread: {e}"))?;

        Ok(Self {
            shutdown,
            commands,
            handle: Some(handle),
        })
    }

    pub fn send(&self, command: SourceCommand) {
        // the thread may already be gone after a capture failure
        let _ = self.commands.send(command);
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for IngestWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_ingest_loop(
    source: &mut dyn FrameSource,
    ingest: &mut CaptureIngest,
    commands: &Receiver<SourceCommand>,
    shutdown: &AtomicBool,
) -> Result<(), CaptureError> {
    source.start()?;

    while !shutdown.load(Ordering::Relaxed) {
        while let Ok(command) = commands.try_recv() {
            match command {
                SourceCommand::SetZoom(level) => source.set_zoom(level),
            }
        }

        match source.next_frame() {
            Ok(Some(raw)) => {
                if let Err(e) = ingest.ingest(raw) {
                    warn!(error = %e, "dropped frame");
                }
            }
            Ok(None) => {}
            Err(_) if shutdown.load(Ordering::Relaxed) => break,
            Err(e) => return Err(e),
        }
    }

    Ok(())
}
