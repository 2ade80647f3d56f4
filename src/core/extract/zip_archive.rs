//! ZIP extraction with bounded worker parallelism.
//!
//! Entries are partitioned round-robin across up to `max_parallelism`
//! workers. Each worker opens its own handle on the archive, so central
//! directory access never needs cross-worker locking; written bytes are
//! aggregated through an atomic counter and progress is throttled to one
//! update per 100 ms.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use zip::ZipArchive;

use crate::core::buffer_pool::BufferPool;
use crate::errors::{RuntimeError, RuntimeResult};

use super::{safe_join, ExtractOptions, ExtractOutcome, ExtractProgress};

const PROGRESS_INTERVAL_MS: u64 = 100;

struct Plan {
    index: usize,
    out_path: PathBuf,
    size: u64,
    is_dir: bool,
}

pub(super) fn extract_zip(
    source: &Path,
    dest: &Path,
    options: &ExtractOptions,
    pool: &BufferPool,
    progress: &ExtractProgress,
    cancel: &CancellationToken,
) -> RuntimeResult<ExtractOutcome> {
    let file = File::open(source)?;
    let mut archive =
        ZipArchive::new(file).map_err(|e| RuntimeError::Extraction(format!("zip open: {e}")))?;

    // Resolve every output path up front so a traversal entry aborts the
    // whole extraction before any file is written.
    let mut plans = Vec::with_capacity(archive.len());
    let mut total_bytes = 0u64;
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|e| RuntimeError::Extraction(format!("zip entry {index}: {e}")))?;
        let name = entry
            .enclosed_name()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| RuntimeError::Security(format!("zip entry {}", entry.name())))?;
        let out_path = safe_join(dest, &name)?;
        let is_dir = entry.is_dir();
        if !is_dir {
            total_bytes += entry.size();
        }
        plans.push(Plan {
            index,
            out_path,
            size: entry.size(),
            is_dir,
        });
    }
    drop(archive);

    for plan in plans.iter().filter(|p| p.is_dir) {
        fs::create_dir_all(&plan.out_path)?;
    }

    let file_plans: Vec<&Plan> = plans.iter().filter(|p| !p.is_dir).collect();
    let workers = options.max_parallelism.max(1).min(file_plans.len().max(1));
    debug!(entries = file_plans.len(), workers, "Extracting zip archive");

    let written = AtomicU64::new(0);
    let last_emit = AtomicU64::new(0);
    let started = Instant::now();

    let emit = |force: bool| {
        let elapsed = started.elapsed().as_millis() as u64;
        let previous = last_emit.load(Ordering::Relaxed);
        if force || elapsed.saturating_sub(previous) >= PROGRESS_INTERVAL_MS {
            if last_emit
                .compare_exchange(previous, elapsed, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
                || force
            {
                let done = written.load(Ordering::Relaxed);
                if total_bytes > 0 {
                    progress((done as f64 / total_bytes as f64).min(1.0) as f32);
                }
            }
        }
    };

    let files_written = file_plans.len();
    std::thread::scope(|scope| -> RuntimeResult<()> {
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let batch: Vec<&Plan> = file_plans
                .iter()
                .skip(worker_id)
                .step_by(workers)
                .copied()
                .collect();
            let written = &written;
            let emit = &emit;
            let pool = pool.clone();
            let source = source.to_path_buf();
            let cancel = cancel.clone();
            let pre_allocate = options.pre_allocate;

            handles.push(scope.spawn(move || -> RuntimeResult<()> {
                // Exclusive handle per worker.
                let file = File::open(&source)?;
                let mut archive = ZipArchive::new(file)
                    .map_err(|e| RuntimeError::Extraction(format!("zip reopen: {e}")))?;
                let mut buffer = pool.acquire();

                for plan in batch {
                    if cancel.is_cancelled() {
                        return Err(RuntimeError::Cancelled);
                    }
                    if let Some(parent) = plan.out_path.parent() {
                        fs::create_dir_all(parent)?;
                    }

                    let mut entry = archive
                        .by_index(plan.index)
                        .map_err(|e| RuntimeError::Extraction(format!("zip read: {e}")))?;
                    let mut out = OpenOptions::new()
                        .create(true)
                        .write(true)
                        .truncate(true)
                        .open(&plan.out_path)?;
                    if pre_allocate {
                        out.set_len(plan.size)?;
                    }

                    loop {
                        if cancel.is_cancelled() {
                            return Err(RuntimeError::Cancelled);
                        }
                        let n = entry
                            .read(&mut buffer[..])
                            .map_err(|e| RuntimeError::Extraction(format!("zip body: {e}")))?;
                        if n == 0 {
                            break;
                        }
                        out.write_all(&buffer[..n])?;
                        written.fetch_add(n as u64, Ordering::Relaxed);
                        emit(false);
                    }
                }
                Ok(())
            }));
        }

        let mut first_error = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(_) => {
                    if first_error.is_none() {
                        first_error =
                            Some(RuntimeError::Extraction("zip worker panicked".to_string()));
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    })?;

    emit(true);
    progress(1.0);

    Ok(ExtractOutcome {
        files_written,
        bytes_written: written.load(Ordering::Relaxed),
    })
}

#[cfg(test)]
mod tests {
    use super::super::{extract, ExtractOptions};
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;
    use zip::write::FileOptions;

    fn build_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, body) in entries {
            writer
                .start_file(*name, FileOptions::default())
                .unwrap();
            writer.write_all(body).unwrap();
        }
        writer.finish().unwrap();
    }

    #[tokio::test]
    async fn test_zip_round_trip_parallel() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("bundle.zip");
        let entries: Vec<(String, Vec<u8>)> = (0..10)
            .map(|i| (format!("files/f{i}.bin"), vec![i as u8; 4096]))
            .collect();
        let borrowed: Vec<(&str, &[u8])> = entries
            .iter()
            .map(|(n, b)| (n.as_str(), b.as_slice()))
            .collect();
        build_zip(&archive, &borrowed);

        let dest = dir.path().join("out");
        let outcome = extract(
            &archive,
            &dest,
            ExtractOptions {
                max_parallelism: 4,
                ..Default::default()
            },
            Arc::new(|_| {}),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.files_written, 10);
        assert_eq!(outcome.bytes_written, 10 * 4096);
        for i in 0..10 {
            let body = std::fs::read(dest.join(format!("files/f{i}.bin"))).unwrap();
            assert_eq!(body, vec![i as u8; 4096]);
        }
    }

    #[tokio::test]
    async fn test_zip_traversal_rejected_before_writing() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        build_zip(
            &archive,
            &[
                ("ok.txt", b"fine".as_slice()),
                ("../outside.txt", b"bad".as_slice()),
            ],
        );

        let dest = dir.path().join("out");
        let result = extract(
            &archive,
            &dest,
            ExtractOptions::default(),
            Arc::new(|_| {}),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(RuntimeError::Security(_))));
        // No partial output: the traversal aborts before any file is written.
        assert!(!dest.join("ok.txt").exists());
        assert!(!dir.path().join("outside.txt").exists());
    }

    #[tokio::test]
    async fn test_zip_single_worker() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("one.zip");
        build_zip(&archive, &[("a.txt", b"alpha".as_slice())]);

        let outcome = extract(
            &archive,
            &dir.path().join("out"),
            ExtractOptions {
                max_parallelism: 1,
                ..Default::default()
            },
            Arc::new(|_| {}),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.files_written, 1);
    }
}
