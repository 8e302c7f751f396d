// SPDX-License-Identifier: MIT
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use super::format::{ClipFrame, ClipHeader, ClipMetadata, EOF_MARKER, FORMAT_VERSION, MAGIC};

/// Writes a clip to `<path>.partial` and moves it into place on
/// [`ClipWriter::finish`], so a reader never sees a half-written clip under
/// the final name.
pub struct ClipWriter {
    encoder: zstd::Encoder<'static, BufWriter<File>>,
    partial_path: PathBuf,
    final_path: PathBuf,
    frames_written: u64,
}

/// Sibling path used while a clip is being written.
#[must_use]
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".partial");
    PathBuf::from(name)
}

impl ClipWriter {
    /// Creates the partial file and writes the clip header.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or the header cannot be
    /// written. A partial file that was already created is removed.
    pub fn create(path: &Path, metadata: &ClipMetadata) -> Result<Self> {
        let partial = partial_path(path);
        let file = File::create(&partial)
            .with_context(|| format!("failed to create clip file: {}", partial.display()))?;
        let encoder = remove_on_error(&partial, start_stream(file, metadata))?;

        Ok(Self {
            encoder,
            partial_path: partial,
            final_path: path.to_path_buf(),
            frames_written: 0,
        })
    }

    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn write_frame(&mut self, frame: &ClipFrame) -> Result<()> {
        let serialized = postcard::to_stdvec(frame).context("failed to serialize frame")?;
        write_record(&mut self.encoder, &serialized).context("failed to write frame")?;
        self.frames_written += 1;
        Ok(())
    }

    /// Writes the EOF marker, flushes and renames the partial file to its
    /// final name. Returns the number of frames written.
    ///
    /// # Errors
    ///
    /// Returns an error if writing, flushing or renaming fails; the partial
    /// file is removed in that case.
    pub fn finish(self) -> Result<u64> {
        let Self {
            encoder,
            partial_path,
            final_path,
            frames_written,
        } = self;

        let result = finish_stream(encoder).and_then(|()| {
            fs::rename(&partial_path, &final_path)
                .with_context(|| format!("failed to move {} into place", final_path.display()))
        });
        remove_on_error(&partial_path, result)?;

        debug!(path = %final_path.display(), frames = frames_written, "clip finished");
        Ok(frames_written)
    }

    /// Drops the partial file.
    pub fn abort(self) {
        let Self { encoder, partial_path, .. } = self;
        drop(encoder);
        if let Err(e) = fs::remove_file(&partial_path) {
            debug!(path = %partial_path.display(), error = %e, "could not remove partial clip");
        }
    }
}

fn start_stream(
    file: File,
    metadata: &ClipMetadata,
) -> Result<zstd::Encoder<'static, BufWriter<File>>> {
    let mut encoder =
        zstd::Encoder::new(BufWriter::new(file), 3).context("failed to create zstd encoder")?;
    let header = ClipHeader {
        magic: MAGIC,
        format_version: FORMAT_VERSION,
        metadata: metadata.clone(),
    };
    let serialized = postcard::to_stdvec(&header).context("failed to serialize clip header")?;
    write_record(&mut encoder, &serialized).context("failed to write clip header")?;
    Ok(encoder)
}

/// Deletes the partial file when `result` is an error.
fn remove_on_error<T>(partial: &Path, result: Result<T>) -> Result<T> {
    if result.is_err()
        && let Err(e) = fs::remove_file(partial)
    {
        debug!(path = %partial.display(), error = %e, "could not remove partial clip");
    }
    result
}

fn finish_stream(mut encoder: zstd::Encoder<'static, BufWriter<File>>) -> Result<()> {
    encoder
        .write_all(&EOF_MARKER)
        .context("failed to write EOF marker")?;
    let mut buf_writer = encoder.finish().context("failed to finish zstd encoder")?;
    buf_writer.flush().context("failed to flush clip file")?;
    buf_writer
        .get_ref()
        .sync_all()
        .context("failed to sync clip file")
}

fn write_record(writer: &mut impl Write, data: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(data)
}
