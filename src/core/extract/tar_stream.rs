//! TAR-family and single-stream decompression.
//!
//! Runs on a blocking thread. The decompressor is rebuilt per pass (tar
//! readers cannot seek), so the accurate-progress pre-scan costs one extra
//! decode of the archive.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::core::buffer_pool::BufferPool;
use crate::errors::{RuntimeError, RuntimeResult};

use super::{safe_join, ArchiveFormat, ExtractOptions, ExtractOutcome, ExtractProgress};

/// Reader wrapper counting compressed bytes consumed from the source file.
///
/// Drives progress when no uncompressed total is known.
struct CountingReader<R> {
    inner: R,
    consumed: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

fn open_decoder(
    source: &Path,
    format: ArchiveFormat,
    consumed: Arc<AtomicU64>,
) -> RuntimeResult<Box<dyn Read>> {
    let file = File::open(source)?;
    let counting = CountingReader {
        inner: BufReader::new(file),
        consumed,
    };
    let reader: Box<dyn Read> = match format {
        ArchiveFormat::TarGz | ArchiveFormat::Gz => Box::new(GzDecoder::new(counting)),
        ArchiveFormat::TarBz2 | ArchiveFormat::Bz2 => Box::new(BzDecoder::new(counting)),
        ArchiveFormat::Tar => Box::new(counting),
        ArchiveFormat::Zip => {
            return Err(RuntimeError::Extraction(
                "zip is not a streaming format".to_string(),
            ))
        }
    };
    Ok(reader)
}

/// Sum of entry sizes, used for accurate progress totals.
fn scan_total(source: &Path, format: ArchiveFormat) -> RuntimeResult<u64> {
    let reader = open_decoder(source, format, Arc::new(AtomicU64::new(0)))?;
    let mut archive = tar::Archive::new(reader);
    let mut total = 0u64;
    for entry in archive
        .entries()
        .map_err(|e| RuntimeError::Extraction(format!("tar scan: {e}")))?
    {
        let entry = entry.map_err(|e| RuntimeError::Extraction(format!("tar scan: {e}")))?;
        if entry.header().entry_type().is_file() {
            total += entry.size();
        }
    }
    Ok(total)
}

/// Extract a TAR stream (plain or gz/bz2-compressed) into `dest`.
pub(super) fn extract_tar(
    source: &Path,
    dest: &Path,
    format: ArchiveFormat,
    options: &ExtractOptions,
    pool: &BufferPool,
    progress: &ExtractProgress,
    cancel: &CancellationToken,
) -> RuntimeResult<ExtractOutcome> {
    let compressed_total = fs::metadata(source)?.len();
    let accurate_total = if options.accurate_progress {
        let total = scan_total(source, format)?;
        debug!(total, "Pre-scanned tar archive for accurate progress");
        Some(total)
    } else {
        None
    };

    let consumed = Arc::new(AtomicU64::new(0));
    let reader = open_decoder(source, format, Arc::clone(&consumed))?;
    let mut archive = tar::Archive::new(reader);

    let mut files_written = 0usize;
    let mut bytes_written = 0u64;
    let mut buffer = pool.acquire();

    progress(0.0);
    for entry in archive
        .entries()
        .map_err(|e| RuntimeError::Extraction(format!("tar open: {e}")))?
    {
        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }

        let mut entry = entry.map_err(|e| RuntimeError::Extraction(format!("tar entry: {e}")))?;
        let header_type = entry.header().entry_type();
        if !header_type.is_file() {
            trace!("Skipping non-file tar entry");
            continue;
        }

        let name = entry
            .path()
            .map_err(|e| RuntimeError::Extraction(format!("tar entry name: {e}")))?
            .into_owned();
        let out_path = safe_join(dest, &name)?;
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&out_path)?;
        if options.pre_allocate {
            out.set_len(entry.size())?;
        }

        loop {
            if cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }
            let n = entry
                .read(&mut buffer[..])
                .map_err(|e| RuntimeError::Extraction(format!("tar read: {e}")))?;
            if n == 0 {
                break;
            }
            out.write_all(&buffer[..n])?;
            bytes_written += n as u64;

            match accurate_total {
                Some(total) if total > 0 => {
                    progress((bytes_written as f64 / total as f64) as f32)
                }
                _ if compressed_total > 0 => {
                    let consumed_now = consumed.load(Ordering::Relaxed);
                    progress((consumed_now as f64 / compressed_total as f64).min(1.0) as f32)
                }
                _ => {}
            }
        }
        files_written += 1;
    }
    progress(1.0);

    Ok(ExtractOutcome {
        files_written,
        bytes_written,
    })
}

/// Decompress a bare `.gz` / `.bz2` stream into a single file named after
/// the source without its final extension.
pub(super) fn extract_single(
    source: &Path,
    dest: &Path,
    format: ArchiveFormat,
    _options: &ExtractOptions,
    pool: &BufferPool,
    progress: &ExtractProgress,
    cancel: &CancellationToken,
) -> RuntimeResult<ExtractOutcome> {
    let stem = source
        .file_stem()
        .ok_or_else(|| RuntimeError::Precondition(format!("no stem in {source:?}")))?;
    let out_path = dest.join(stem);

    let compressed_total = fs::metadata(source)?.len();
    let consumed = Arc::new(AtomicU64::new(0));
    let mut reader = open_decoder(source, format, Arc::clone(&consumed))?;

    let mut out = File::create(&out_path)?;
    let mut buffer = pool.acquire();
    let mut bytes_written = 0u64;

    progress(0.0);
    loop {
        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        let n = reader
            .read(&mut buffer[..])
            .map_err(|e| RuntimeError::Extraction(format!("decode: {e}")))?;
        if n == 0 {
            break;
        }
        out.write_all(&buffer[..n])?;
        bytes_written += n as u64;
        if compressed_total > 0 {
            let consumed_now = consumed.load(Ordering::Relaxed);
            progress((consumed_now as f64 / compressed_total as f64).min(1.0) as f32);
        }
    }
    progress(1.0);

    Ok(ExtractOutcome {
        files_written: 1,
        bytes_written,
    })
}
