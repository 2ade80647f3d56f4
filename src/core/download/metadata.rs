//! Persistent chunk plan for resumable downloads.
//!
//! The plan lives next to the in-flight body as
//! `<staging>.download.metadata` and is stable across process versions so a
//! newer build can resume an older download.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{RuntimeError, RuntimeResult};

/// Suffix of the in-flight download body.
pub const BODY_SUFFIX: &str = "download";

/// Suffix of the persisted chunk plan.
pub const METADATA_SUFFIX: &str = "download.metadata";

/// Minimum chunk size considered worth a separate range request.
pub const MIN_CHUNK_SIZE: u64 = 1024 * 1024;

/// Upper bound on a single chunk.
pub const MAX_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// One contiguous byte range of the download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub index: usize,
    pub start: u64,
    /// Inclusive end offset.
    pub end: u64,
    /// Bytes already written for this chunk.
    pub downloaded: u64,
    #[serde(rename = "isCompleted")]
    pub is_completed: bool,
    #[serde(rename = "errorMessage", default)]
    pub error_message: Option<String>,
    #[serde(rename = "retryCount", default)]
    pub retry_count: u32,
}

impl ChunkInfo {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remaining(&self) -> u64 {
        self.len().saturating_sub(self.downloaded)
    }
}

/// The persisted plan for one in-flight download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadPlan {
    pub url: String,
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(rename = "totalSize")]
    pub total_size: u64,
    #[serde(rename = "chunkSize")]
    pub chunk_size: u64,
    #[serde(rename = "createdTime")]
    pub created_time: DateTime<Utc>,
    #[serde(rename = "lastModifiedTime")]
    pub last_modified_time: DateTime<Utc>,
    pub chunks: Vec<ChunkInfo>,
}

impl DownloadPlan {
    /// Build a fresh plan covering `[0, total_size)`.
    ///
    /// Without range support the whole body is one chunk.
    pub fn new(url: &str, file_name: &str, total_size: u64, ranges_supported: bool, max_parallel_chunks: usize) -> Self {
        let chunk_size = if ranges_supported {
            plan_chunk_size(total_size, max_parallel_chunks)
        } else {
            total_size.max(1)
        };

        let mut chunks = Vec::new();
        let mut start = 0u64;
        let mut index = 0usize;
        while start < total_size {
            let end = (start + chunk_size - 1).min(total_size - 1);
            chunks.push(ChunkInfo {
                index,
                start,
                end,
                downloaded: 0,
                is_completed: false,
                error_message: None,
                retry_count: 0,
            });
            start = end + 1;
            index += 1;
        }

        let now = Utc::now();
        Self {
            url: url.to_string(),
            file_name: file_name.to_string(),
            total_size,
            chunk_size,
            created_time: now,
            last_modified_time: now,
            chunks,
        }
    }

    pub fn downloaded_total(&self) -> u64 {
        self.chunks.iter().map(|c| c.downloaded).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.iter().all(|c| c.is_completed)
    }

    /// Whether an on-disk plan can resume the given request.
    pub fn matches(&self, url: &str, total_size: u64) -> bool {
        self.url == url && self.total_size == total_size
    }

    pub fn load(path: &Path) -> RuntimeResult<Self> {
        let body = std::fs::read_to_string(path)
            .map_err(|_| RuntimeError::NotFound(path.to_path_buf()))?;
        serde_json::from_str(&body)
            .map_err(|e| RuntimeError::Precondition(format!("corrupt download metadata: {e}")))
    }

    pub fn save(&self, path: &Path) -> RuntimeResult<()> {
        let body = serde_json::to_string_pretty(self)
            .map_err(|e| RuntimeError::Precondition(format!("serialize metadata: {e}")))?;
        std::fs::write(path, body)?;
        Ok(())
    }

    pub fn touch(&mut self) {
        self.last_modified_time = Utc::now();
    }
}

/// `clamp(max(1 MiB, total / parallelism), 1 MiB, 10 MiB)`.
pub fn plan_chunk_size(total_size: u64, max_parallel_chunks: usize) -> u64 {
    let per_worker = total_size / max_parallel_chunks.max(1) as u64;
    per_worker.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

/// `<final>.download`, the in-flight body.
pub fn body_path(final_path: &Path) -> PathBuf {
    append_suffix(final_path, BODY_SUFFIX)
}

/// `<final>.download.metadata`, the persisted plan.
pub fn metadata_path(final_path: &Path) -> PathBuf {
    append_suffix(final_path, METADATA_SUFFIX)
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_chunk_size_clamping() {
        // Tiny file: floor at 1 MiB.
        assert_eq!(plan_chunk_size(10, 4), MIN_CHUNK_SIZE);
        // Huge file: ceiling at 10 MiB.
        assert_eq!(plan_chunk_size(100 * 1024 * 1024 * 1024, 4), MAX_CHUNK_SIZE);
        // In between: total / parallelism.
        assert_eq!(plan_chunk_size(8 * 1024 * 1024, 4), 2 * 1024 * 1024);
    }

    #[test]
    fn test_plan_covers_every_byte_exactly_once() {
        let plan = DownloadPlan::new("https://e/x", "x", 25 * 1024 * 1024 + 123, true, 4);
        let mut expected_start = 0u64;
        for chunk in &plan.chunks {
            assert_eq!(chunk.start, expected_start);
            assert!(chunk.end >= chunk.start);
            expected_start = chunk.end + 1;
        }
        assert_eq!(expected_start, plan.total_size);
    }

    #[test]
    fn test_single_chunk_without_range_support() {
        let plan = DownloadPlan::new("https://e/x", "x", 50 * 1024 * 1024, false, 4);
        assert_eq!(plan.chunks.len(), 1);
        assert_eq!(plan.chunks[0].start, 0);
        assert_eq!(plan.chunks[0].end, plan.total_size - 1);
    }

    #[test]
    fn test_sidecar_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.tar.bz2.download.metadata");

        let mut plan = DownloadPlan::new("https://e/m.tar.bz2", "m.tar.bz2", 3 * 1024 * 1024, true, 2);
        plan.chunks[0].downloaded = 512;
        plan.chunks[0].retry_count = 1;
        plan.save(&path).unwrap();

        let loaded = DownloadPlan::load(&path).unwrap();
        assert_eq!(loaded.url, plan.url);
        assert_eq!(loaded.total_size, plan.total_size);
        assert_eq!(loaded.chunks.len(), plan.chunks.len());
        assert_eq!(loaded.chunks[0].downloaded, 512);
        assert_eq!(loaded.chunks[0].retry_count, 1);
        assert_eq!(loaded.created_time, plan.created_time);
    }

    #[test]
    fn test_matches_requires_url_and_size() {
        let plan = DownloadPlan::new("https://e/a", "a", 100, false, 1);
        assert!(plan.matches("https://e/a", 100));
        assert!(!plan.matches("https://e/b", 100));
        assert!(!plan.matches("https://e/a", 99));
    }

    #[test]
    fn test_paths() {
        let base = Path::new("/models/m.tar.bz2");
        assert_eq!(body_path(base), PathBuf::from("/models/m.tar.bz2.download"));
        assert_eq!(
            metadata_path(base),
            PathBuf::from("/models/m.tar.bz2.download.metadata")
        );
    }

    #[test]
    fn test_chunk_remaining() {
        let mut chunk = ChunkInfo {
            index: 0,
            start: 0,
            end: 99,
            downloaded: 40,
            is_completed: false,
            error_message: None,
            retry_count: 0,
        };
        assert_eq!(chunk.len(), 100);
        assert_eq!(chunk.remaining(), 60);
        chunk.downloaded = 100;
        assert_eq!(chunk.remaining(), 0);
    }
}
