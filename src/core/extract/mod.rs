//! Streaming archive extraction into a model directory.
//!
//! One entry point, [`extract`], dispatches on the archive's file-name
//! suffix (longest suffix first) and streams entries into the destination
//! with traversal-safe paths, pooled buffers and throttled progress.
//! Decompression is CPU-bound and runs on a blocking thread; cancellation is
//! observed between entries and between read chunks.

mod tar_stream;
mod zip_archive;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::buffer_pool::BufferPool;
use crate::core::paths::normalize;
use crate::errors::{RuntimeError, RuntimeResult};

/// Extraction tuning knobs.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Copy buffer size per worker.
    pub buffer_size: usize,
    /// Worker count for ZIP archives; TAR streams are inherently serial.
    pub max_parallelism: usize,
    /// Pre-size output files before writing.
    pub pre_allocate: bool,
    /// Pre-scan TAR archives so progress is measured in uncompressed bytes.
    pub accurate_progress: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            buffer_size: 1024 * 1024,
            max_parallelism: 2,
            pre_allocate: true,
            accurate_progress: false,
        }
    }
}

/// Result of a successful extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractOutcome {
    pub files_written: usize,
    pub bytes_written: u64,
}

/// Archive container formats recognised by suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    TarBz2,
    Tar,
    Zip,
    Gz,
    Bz2,
}

/// Map a file name to its archive format, longest suffix first.
pub fn detect_format(name: &str) -> Option<ArchiveFormat> {
    let lower = name.to_ascii_lowercase();
    // Longest-suffix-first so `.tar.gz` wins over `.gz`.
    const TABLE: &[(&str, ArchiveFormat)] = &[
        (".tar.gz", ArchiveFormat::TarGz),
        (".tar.bz2", ArchiveFormat::TarBz2),
        (".tbz2", ArchiveFormat::TarBz2),
        (".tgz", ArchiveFormat::TarGz),
        (".tb2", ArchiveFormat::TarBz2),
        (".tar", ArchiveFormat::Tar),
        (".zip", ArchiveFormat::Zip),
        (".gz", ArchiveFormat::Gz),
        (".bz2", ArchiveFormat::Bz2),
    ];
    let mut best: Option<(usize, ArchiveFormat)> = None;
    for (suffix, format) in TABLE {
        if lower.ends_with(suffix) {
            match best {
                Some((len, _)) if len >= suffix.len() => {}
                _ => best = Some((suffix.len(), *format)),
            }
        }
    }
    best.map(|(_, format)| format)
}

/// Join an archive entry name onto the destination, rejecting any entry
/// whose normalised path escapes it.
pub fn safe_join(destination: &Path, entry_name: &Path) -> RuntimeResult<PathBuf> {
    if entry_name.is_absolute()
        || entry_name
            .components()
            .any(|c| matches!(c, Component::Prefix(_) | Component::RootDir))
    {
        return Err(RuntimeError::Security(format!(
            "absolute entry path {}",
            entry_name.display()
        )));
    }

    let joined = normalize(&destination.join(entry_name));
    if joined.starts_with(normalize(destination)) {
        Ok(joined)
    } else {
        Err(RuntimeError::Security(format!(
            "entry {} escapes destination",
            entry_name.display()
        )))
    }
}

pub type ExtractProgress = Arc<dyn Fn(f32) + Send + Sync>;

/// Extract `source_archive` into `destination_dir`.
///
/// Progress runs over `[0, 1]`; for TAR streams it is measured against the
/// compressed size unless `accurate_progress` pre-scans for the uncompressed
/// total. Single-stream `.gz`/`.bz2` inputs produce one file named after the
/// source minus its final extension.
pub async fn extract(
    source_archive: &Path,
    destination_dir: &Path,
    options: ExtractOptions,
    progress: ExtractProgress,
    cancel: &CancellationToken,
) -> RuntimeResult<ExtractOutcome> {
    let name = source_archive
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            RuntimeError::Precondition(format!("invalid archive path {source_archive:?}"))
        })?;

    let format = detect_format(name)
        .ok_or_else(|| RuntimeError::UnsupportedFormat(name.to_string()))?;

    if !source_archive.exists() {
        return Err(RuntimeError::NotFound(source_archive.to_path_buf()));
    }
    tokio::fs::create_dir_all(destination_dir).await?;

    debug!(
        archive = %source_archive.display(),
        dest = %destination_dir.display(),
        ?format,
        "Starting extraction"
    );

    let source = source_archive.to_path_buf();
    let dest = destination_dir.to_path_buf();
    let cancel = cancel.clone();
    let pool = BufferPool::new(options.buffer_size);

    let outcome = tokio::task::spawn_blocking(move || match format {
        ArchiveFormat::TarGz | ArchiveFormat::TarBz2 | ArchiveFormat::Tar => {
            tar_stream::extract_tar(&source, &dest, format, &options, &pool, &progress, &cancel)
        }
        ArchiveFormat::Zip => {
            zip_archive::extract_zip(&source, &dest, &options, &pool, &progress, &cancel)
        }
        ArchiveFormat::Gz | ArchiveFormat::Bz2 => {
            tar_stream::extract_single(&source, &dest, format, &options, &pool, &progress, &cancel)
        }
    })
    .await
    .map_err(|e| RuntimeError::Extraction(format!("extraction task failed: {e}")))??;

    info!(
        archive = %source_archive.display(),
        files = outcome.files_written,
        bytes = outcome.bytes_written,
        "Extraction complete"
    );
    Ok(outcome)
}
