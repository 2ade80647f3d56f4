//! File integrity verification with a sidecar hash cache.
//!
//! Hashing a multi-gigabyte model on every startup is wasteful, so each
//! verified file `F` gets a sibling `F.sha256` recording the file's
//! last-write timestamp and digest. The cache is honoured only while the
//! sidecar is at least as new as the file and the recorded timestamp still
//! matches.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::buffer_pool::BufferPool;
use crate::errors::{RuntimeError, RuntimeResult};

/// Hash read granularity; cancellation is observed between blocks.
pub const HASH_BLOCK_SIZE: usize = 64 * 1024;

/// Sidecar suffix appended to the verified file's name.
pub const HASH_CACHE_SUFFIX: &str = "sha256";

/// Outcome of a single file verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// File exists and (when a hash was expected) the digest matched.
    Success { digest: Option<String> },
    /// A valid sidecar supplied the digest without reading the file body.
    CacheHit { digest: String },
    /// The computed digest differs from the expected one.
    HashMismatch { expected: String, actual: String },
    FileNotFound,
    IsDirectory,
    Error(String),
}

impl VerifyOutcome {
    /// Whether this outcome counts as a pass for acquisition purposes.
    pub fn is_valid(&self) -> bool {
        matches!(
            self,
            VerifyOutcome::Success { .. } | VerifyOutcome::CacheHit { .. }
        )
    }
}

/// Compute the SHA-256 of a file, reporting progress in `[0, 1]`.
///
/// Reads in [`HASH_BLOCK_SIZE`] blocks from a pooled buffer and checks the
/// cancellation token between reads. Empty files yield the digest of empty
/// input.
pub async fn compute_sha256(
    path: &Path,
    pool: &BufferPool,
    progress: impl Fn(f32),
    cancel: &CancellationToken,
) -> RuntimeResult<String> {
    let metadata = fs::metadata(path)
        .await
        .map_err(|_| RuntimeError::NotFound(path.to_path_buf()))?;
    if metadata.is_dir() {
        return Err(RuntimeError::Precondition(format!(
            "{} is a directory",
            path.display()
        )));
    }

    let total = metadata.len();
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = pool.acquire();
    let mut read_total: u64 = 0;

    progress(0.0);
    loop {
        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        let n = file.read(&mut buffer[..]).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        read_total += n as u64;
        if total > 0 {
            progress((read_total as f64 / total as f64) as f32);
        }
    }
    progress(1.0);

    Ok(format!("{:x}", hasher.finalize()))
}

/// Verify a file against an optional expected SHA-256.
///
/// Without an expected hash this is an existence check. With one, the sidecar
/// cache is consulted first; a miss computes the digest, persists the sidecar
/// and compares case-insensitively.
pub async fn verify_file(
    path: &Path,
    expected_hash: Option<&str>,
    pool: &BufferPool,
    progress: impl Fn(f32),
    cancel: &CancellationToken,
) -> RuntimeResult<VerifyOutcome> {
    let metadata = match fs::metadata(path).await {
        Ok(m) => m,
        Err(_) => return Ok(VerifyOutcome::FileNotFound),
    };

    let expected = match expected_hash.filter(|h| !h.trim().is_empty()) {
        Some(h) => h,
        None => {
            // Presence is all that was asked for.
            progress(1.0);
            return Ok(VerifyOutcome::Success { digest: None });
        }
    };

    if metadata.is_dir() {
        return Ok(VerifyOutcome::IsDirectory);
    }

    let file_mtime = match metadata.modified() {
        Ok(t) => t,
        Err(e) => return Ok(VerifyOutcome::Error(format!("no mtime: {e}"))),
    };

    if let Some(cached) = consult_cache(path, file_mtime).await {
        debug!("Hash cache hit for {}", path.display());
        progress(1.0);
        if cached.eq_ignore_ascii_case(expected) {
            return Ok(VerifyOutcome::CacheHit { digest: cached });
        }
        return Ok(VerifyOutcome::HashMismatch {
            expected: expected.to_ascii_lowercase(),
            actual: cached,
        });
    }

    let actual = match compute_sha256(path, pool, progress, cancel).await {
        Ok(digest) => digest,
        Err(RuntimeError::Cancelled) => return Err(RuntimeError::Cancelled),
        Err(e) => return Ok(VerifyOutcome::Error(e.to_string())),
    };

    if let Err(e) = persist_cache(path, file_mtime, &actual).await {
        warn!("Failed to write hash cache for {}: {}", path.display(), e);
    }

    if actual.eq_ignore_ascii_case(expected) {
        Ok(VerifyOutcome::Success {
            digest: Some(actual),
        })
    } else {
        Ok(VerifyOutcome::HashMismatch {
            expected: expected.to_ascii_lowercase(),
            actual,
        })
    }
}

/// Sidecar path for a verified file.
pub fn cache_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(HASH_CACHE_SUFFIX);
    path.with_file_name(name)
}

/// Read the sidecar and return the cached digest when still valid.
///
/// A sidecar older than the file, or recording a different mtime, is stale
/// and removed.
async fn consult_cache(path: &Path, file_mtime: SystemTime) -> Option<String> {
    let sidecar = cache_path(path);
    let sidecar_meta = fs::metadata(&sidecar).await.ok()?;

    let fresh = sidecar_meta
        .modified()
        .map(|sidecar_mtime| sidecar_mtime >= file_mtime)
        .unwrap_or(false);

    if fresh {
        if let Some(digest) = read_cache(&sidecar, file_mtime).await {
            return Some(digest);
        }
    }

    debug!("Invalidating stale hash cache {}", sidecar.display());
    let _ = fs::remove_file(&sidecar).await;
    None
}

async fn read_cache(sidecar: &Path, file_mtime: SystemTime) -> Option<String> {
    let content = fs::read_to_string(sidecar).await.ok()?;
    let mut lines = content.lines();
    let recorded = lines.next()?.trim();
    let digest = lines.next()?.trim();

    let recorded_time: DateTime<Utc> = recorded.parse().ok()?;
    let file_time: DateTime<Utc> = file_mtime.into();
    if recorded_time != file_time {
        return None;
    }

    if digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(digest.to_ascii_lowercase())
    } else {
        None
    }
}

async fn persist_cache(path: &Path, file_mtime: SystemTime, digest: &str) -> RuntimeResult<()> {
    let stamp: DateTime<Utc> = file_mtime.into();
    let body = format!(
        "{}\n{}\n",
        stamp.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        digest.to_ascii_lowercase()
    );
    fs::write(cache_path(path), body).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn pool() -> BufferPool {
        BufferPool::new(HASH_BLOCK_SIZE)
    }

    #[tokio::test]
    async fn test_empty_file_hashes_to_empty_digest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();

        let digest = compute_sha256(&path, &pool(), |_| {}, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(digest, EMPTY_SHA256);
    }

    #[tokio::test]
    async fn test_progress_monotone_to_one() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, vec![0xAB; HASH_BLOCK_SIZE * 3 + 17]).unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        compute_sha256(&path, &pool(), move |p| sink.lock().push(p), &CancellationToken::new())
            .await
            .unwrap();

        let values = seen.lock().clone();
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*values.last().unwrap(), 1.0);
    }

    #[tokio::test]
    async fn test_cancellation_observed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, vec![1u8; 1024]).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = compute_sha256(&path, &pool(), |_| {}, &cancel).await;
        assert!(matches!(result, Err(RuntimeError::Cancelled)));
    }

    #[tokio::test]
    async fn test_existence_check_without_hash() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("present.bin");
        std::fs::write(&path, b"x").unwrap();

        let outcome = verify_file(&path, None, &pool(), |_| {}, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, VerifyOutcome::Success { digest: None });

        let missing = dir.path().join("absent.bin");
        let outcome = verify_file(&missing, None, &pool(), |_| {}, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, VerifyOutcome::FileNotFound);
    }

    #[tokio::test]
    async fn test_verify_success_persists_cache_then_hits_it() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        std::fs::write(&path, b"model-bytes").unwrap();

        let expected = compute_sha256(&path, &pool(), |_| {}, &CancellationToken::new())
            .await
            .unwrap();

        let outcome = verify_file(
            &path,
            Some(&expected),
            &pool(),
            |_| {},
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, VerifyOutcome::Success { .. }));
        assert!(cache_path(&path).exists());

        // Second verification must come from the sidecar.
        let outcome = verify_file(
            &path,
            Some(&expected.to_ascii_uppercase()),
            &pool(),
            |_| {},
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, VerifyOutcome::CacheHit { .. }));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_file_body() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        std::fs::write(&path, vec![7u8; HASH_BLOCK_SIZE * 2]).unwrap();

        let expected = compute_sha256(&path, &pool(), |_| {}, &CancellationToken::new())
            .await
            .unwrap();
        verify_file(&path, Some(&expected), &pool(), |_| {}, &CancellationToken::new())
            .await
            .unwrap();

        // On a cache hit progress jumps straight to 1.0 without per-block
        // callbacks, which is observable as a single progress report.
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let outcome = verify_file(
            &path,
            Some(&expected),
            &pool(),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, VerifyOutcome::CacheHit { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_cache_invalidated_on_rewrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        std::fs::write(&path, b"v1").unwrap();

        let v1 = compute_sha256(&path, &pool(), |_| {}, &CancellationToken::new())
            .await
            .unwrap();
        verify_file(&path, Some(&v1), &pool(), |_| {}, &CancellationToken::new())
            .await
            .unwrap();

        // Rewrite with different content and push mtime into the future so
        // the sidecar is strictly older.
        std::fs::write(&path, b"v2-different").unwrap();
        let future = SystemTime::now() + std::time::Duration::from_secs(60);
        let file = std::fs::File::open(&path).unwrap();
        file.set_modified(future).unwrap();

        let outcome = verify_file(&path, Some(&v1), &pool(), |_| {}, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, VerifyOutcome::HashMismatch { .. }));
    }

    #[tokio::test]
    async fn test_directory_with_hash_request() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("subdir");
        std::fs::create_dir(&sub).unwrap();

        let outcome = verify_file(
            &sub,
            Some("00ff"),
            &pool(),
            |_| {},
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome, VerifyOutcome::IsDirectory);
    }

    #[tokio::test]
    async fn test_hash_mismatch_reported_lowercase() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, b"contents").unwrap();

        let outcome = verify_file(
            &path,
            Some(&"AB".repeat(32)),
            &pool(),
            |_| {},
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        match outcome {
            VerifyOutcome::HashMismatch { expected, actual } => {
                assert_eq!(expected, "ab".repeat(32));
                assert_eq!(actual, actual.to_ascii_lowercase());
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_cache_path_suffix() {
        assert_eq!(
            cache_path(Path::new("/m/model.onnx")),
            PathBuf::from("/m/model.onnx.sha256")
        );
    }
}
