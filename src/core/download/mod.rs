//! Resumable multi-chunk HTTP downloader.
//!
//! The body is assembled in `<final>.download` with the chunk plan persisted
//! alongside; a re-run with the same URL resumes completed chunks instead of
//! refetching them. Chunks run under a counting semaphore, all file writes go
//! through a single file lock at absolute offsets, and the body is renamed
//! into place only after the full length verifies.

pub mod metadata;
pub mod probe;

pub use metadata::{body_path, metadata_path, ChunkInfo, DownloadPlan};
pub use probe::{probe, ProbeResult};

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::Client;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{global_env, MAX_PARALLEL_CHUNKS_LIMIT};
use crate::errors::{RuntimeError, RuntimeResult};

/// Downloader tuning.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub max_parallel_chunks: usize,
    pub max_retry_attempts: usize,
    /// Fixed delay between retries of the same chunk.
    pub retry_delay: Duration,
    /// Per-request timeout (probes and chunk requests).
    pub request_timeout: Duration,
    pub user_agent: String,
    /// Mirror prefix prepended to every URL. When unset, the well-known
    /// `SherpaOnnx.GithubProxy` settings key applies.
    pub proxy_prefix: Option<String>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_parallel_chunks: 4,
            max_retry_attempts: 3,
            retry_delay: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
            user_agent: format!("sherpa-runtime/{}", env!("CARGO_PKG_VERSION")),
            proxy_prefix: None,
        }
    }
}

/// Rolling progress snapshot emitted at most every 500 ms.
#[derive(Debug, Clone, Copy)]
pub struct DownloadProgressUpdate {
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    /// `downloaded / total` in `[0, 1]`.
    pub progress: f32,
    pub speed_bytes_per_second: f64,
    pub estimated_remaining: Option<Duration>,
}

pub type DownloadProgressFn = Arc<dyn Fn(DownloadProgressUpdate) + Send + Sync>;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Aggregates per-chunk byte counts into throttled progress updates.
struct ProgressTracker {
    total: u64,
    state: Mutex<TrackerState>,
    callback: DownloadProgressFn,
}

struct TrackerState {
    downloaded: u64,
    last_emit: Instant,
    last_bytes: u64,
    speed: f64,
}

impl ProgressTracker {
    fn new(total: u64, already_downloaded: u64, callback: DownloadProgressFn) -> Self {
        Self {
            total,
            state: Mutex::new(TrackerState {
                downloaded: already_downloaded,
                last_emit: Instant::now(),
                last_bytes: already_downloaded,
                speed: 0.0,
            }),
            callback,
        }
    }

    fn add(&self, bytes: u64) {
        let update = {
            let mut state = self.state.lock();
            state.downloaded += bytes;
            let elapsed = state.last_emit.elapsed();
            if elapsed < PROGRESS_INTERVAL {
                None
            } else {
                let delta = state.downloaded - state.last_bytes;
                state.speed = delta as f64 / elapsed.as_secs_f64();
                state.last_emit = Instant::now();
                state.last_bytes = state.downloaded;
                Some(self.snapshot(&state))
            }
        };
        if let Some(update) = update {
            (self.callback)(update);
        }
    }

    fn finish(&self) {
        let update = {
            let state = self.state.lock();
            self.snapshot(&state)
        };
        (self.callback)(update);
    }

    fn snapshot(&self, state: &TrackerState) -> DownloadProgressUpdate {
        let remaining = self.total.saturating_sub(state.downloaded);
        DownloadProgressUpdate {
            downloaded_bytes: state.downloaded,
            total_bytes: self.total,
            progress: if self.total > 0 {
                (state.downloaded as f64 / self.total as f64) as f32
            } else {
                0.0
            },
            speed_bytes_per_second: state.speed,
            estimated_remaining: if state.speed > 1.0 {
                Some(Duration::from_secs_f64(remaining as f64 / state.speed))
            } else {
                None
            },
        }
    }
}

/// Resumable HTTP downloader with bounded chunk concurrency.
pub struct Downloader {
    client: Client,
    config: DownloadConfig,
}

impl Downloader {
    pub fn new(config: DownloadConfig) -> RuntimeResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| RuntimeError::Network(format!("client build: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn with_defaults() -> RuntimeResult<Self> {
        Self::new(DownloadConfig::default())
    }

    /// Download `url` to `final_path`, resuming any prior partial state.
    ///
    /// On cancellation the body and sidecar stay on disk so the next run can
    /// resume; callers decide whether to delete them.
    pub async fn download(
        &self,
        url: &str,
        final_path: &Path,
        progress: DownloadProgressFn,
        cancel: &CancellationToken,
    ) -> RuntimeResult<()> {
        let url = self.apply_proxy(url);
        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }

        let probe = probe::probe(&self.client, &url).await?;
        if probe.total_size == 0 {
            return Err(RuntimeError::UnknownSize(url.clone()));
        }
        debug!(
            %url,
            total = probe.total_size,
            ranges = probe.accepts_ranges,
            "Download probe complete"
        );

        let body = body_path(final_path);
        let sidecar = metadata_path(final_path);
        let plan = self.stage(&url, final_path, &body, &sidecar, probe).await?;
        let already = plan.downloaded_total();

        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&body)
            .await?;

        let tracker = Arc::new(ProgressTracker::new(probe.total_size, already, progress));
        let shared_plan = Arc::new(Mutex::new(plan));
        let shared_file = Arc::new(tokio::sync::Mutex::new(file));
        let semaphore = Arc::new(Semaphore::new(
            self.config
                .max_parallel_chunks
                .clamp(1, MAX_PARALLEL_CHUNKS_LIMIT),
        ));
        let linked = cancel.child_token();

        let pending: Vec<usize> = {
            let plan = shared_plan.lock();
            plan.chunks
                .iter()
                .filter(|c| !c.is_completed)
                .map(|c| c.index)
                .collect()
        };

        let mut tasks = Vec::with_capacity(pending.len());
        for index in pending {
            let worker = ChunkWorker {
                client: self.client.clone(),
                url: url.clone(),
                plan: Arc::clone(&shared_plan),
                sidecar: sidecar.clone(),
                file: Arc::clone(&shared_file),
                tracker: Arc::clone(&tracker),
                cancel: linked.clone(),
                max_attempts: self.config.max_retry_attempts,
                retry_delay: self.config.retry_delay,
            };
            let semaphore = Arc::clone(&semaphore);
            let token = linked.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| RuntimeError::Cancelled)?;
                let result = worker.run(index).await;
                if result.is_err() {
                    // Stop sibling chunks; partial state stays resumable.
                    token.cancel();
                }
                result
            }));
        }

        let mut first_error: Option<RuntimeError> = None;
        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(RuntimeError::Network(format!("chunk task: {e}")));
                }
            }
        }

        // Persist partial chunk offsets so a cancelled run resumes tightly.
        {
            let mut plan = shared_plan.lock();
            plan.touch();
            if let Err(e) = plan.save(&sidecar) {
                warn!("Failed to persist download metadata: {e}");
            }
        }

        if let Some(e) = first_error {
            if cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }
            return Err(e);
        }

        self.finalize(&url, final_path, &body, &sidecar, probe.total_size, &shared_file)
            .await?;
        tracker.finish();
        Ok(())
    }

    /// Load a matching on-disk plan or create a fresh body + plan.
    async fn stage(
        &self,
        url: &str,
        final_path: &Path,
        body: &Path,
        sidecar: &Path,
        probe: ProbeResult,
    ) -> RuntimeResult<DownloadPlan> {
        if sidecar.exists() && body.exists() {
            if let Ok(plan) = DownloadPlan::load(sidecar) {
                if plan.matches(url, probe.total_size) {
                    info!(
                        %url,
                        resumed = plan.downloaded_total(),
                        "Resuming partial download"
                    );
                    return Ok(plan);
                }
                debug!(%url, "Stale download metadata, restarting from scratch");
            }
        }

        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = tokio::fs::File::create(body).await?;
        file.set_len(probe.total_size).await?;
        drop(file);

        let plan = DownloadPlan::new(
            url,
            &final_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            probe.total_size,
            probe.accepts_ranges,
            self.config.max_parallel_chunks,
        );
        plan.save(sidecar)?;
        Ok(plan)
    }

    async fn finalize(
        &self,
        url: &str,
        final_path: &Path,
        body: &Path,
        sidecar: &Path,
        total_size: u64,
        file: &Arc<tokio::sync::Mutex<tokio::fs::File>>,
    ) -> RuntimeResult<()> {
        {
            let mut guard = file.lock().await;
            guard.flush().await?;
            guard.sync_all().await?;
        }

        let actual = tokio::fs::metadata(body).await?.len();
        if actual != total_size {
            return Err(RuntimeError::Network(format!(
                "{url}: body is {actual} bytes, expected {total_size}"
            )));
        }

        tokio::fs::rename(body, final_path).await?;
        let _ = tokio::fs::remove_file(sidecar).await;
        info!(%url, path = %final_path.display(), "Download finalized");
        Ok(())
    }

    /// Prepend the configured mirror prefix, if any.
    fn apply_proxy(&self, url: &str) -> String {
        let prefix = match &self.config.proxy_prefix {
            Some(prefix) if !prefix.is_empty() => {
                let mut prefix = prefix.clone();
                if !prefix.ends_with('/') {
                    prefix.push('/');
                }
                Some(prefix)
            }
            _ => global_env().github_proxy(),
        };
        match prefix {
            Some(prefix) => format!("{prefix}{url}"),
            None => url.to_string(),
        }
    }
}

/// State shared by one chunk's retry loop.
struct ChunkWorker {
    client: Client,
    url: String,
    plan: Arc<Mutex<DownloadPlan>>,
    sidecar: PathBuf,
    file: Arc<tokio::sync::Mutex<tokio::fs::File>>,
    tracker: Arc<ProgressTracker>,
    cancel: CancellationToken,
    max_attempts: usize,
    retry_delay: Duration,
}

impl ChunkWorker {
    async fn run(&self, index: usize) -> RuntimeResult<()> {
        let mut last_error: Option<RuntimeError> = None;

        for attempt in 1..=self.max_attempts {
            if self.cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }

            match self.attempt(index).await {
                Ok(()) => return Ok(()),
                Err(RuntimeError::Cancelled) => return Err(RuntimeError::Cancelled),
                Err(e) => {
                    warn!(
                        url = %self.url,
                        chunk = index,
                        attempt,
                        "Chunk attempt failed: {e}"
                    );
                    {
                        let mut plan = self.plan.lock();
                        let chunk = &mut plan.chunks[index];
                        chunk.error_message = Some(e.to_string());
                        chunk.retry_count += 1;
                    }
                    last_error = Some(e);
                    if attempt < self.max_attempts {
                        tokio::select! {
                            _ = tokio::time::sleep(self.retry_delay) => {}
                            _ = self.cancel.cancelled() => return Err(RuntimeError::Cancelled),
                        }
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| RuntimeError::Network(format!("{}: chunk {index} failed", self.url))))
    }

    async fn attempt(&self, index: usize) -> RuntimeResult<()> {
        let (start, end, downloaded) = {
            let plan = self.plan.lock();
            let chunk = &plan.chunks[index];
            if chunk.is_completed || chunk.remaining() == 0 {
                return Ok(());
            }
            (chunk.start, chunk.end, chunk.downloaded)
        };

        let response = self
            .client
            .get(&self.url)
            .header(
                reqwest::header::RANGE,
                format!("bytes={}-{}", start + downloaded, end),
            )
            .send()
            .await
            .map_err(|e| RuntimeError::Network(format!("{}: {e}", self.url)))?;

        let status = response.status();
        let mut write_offset = start + downloaded;

        match status.as_u16() {
            206 => {}
            200 => {
                // Server ignored the range: the body restarts at byte zero.
                if downloaded > 0 {
                    self.set_downloaded(index, 0);
                }
                write_offset = start;
            }
            416 => {
                // Range already satisfied; the chunk is complete.
                debug!(chunk = index, "416 response, chunk already complete");
                self.complete_chunk(index);
                return Ok(());
            }
            _ => {
                return Err(RuntimeError::Network(format!(
                    "{}: status {status} for chunk {index}",
                    self.url
                )));
            }
        }

        let mut response = response;
        loop {
            let piece = tokio::select! {
                piece = response.chunk() => {
                    piece.map_err(|e| RuntimeError::Network(format!("{}: read: {e}", self.url)))?
                }
                _ = self.cancel.cancelled() => return Err(RuntimeError::Cancelled),
            };
            let Some(piece) = piece else { break };
            if piece.is_empty() {
                continue;
            }

            // Never write past this chunk's range even if the server
            // over-delivers.
            let chunk_end_exclusive = end + 1;
            let writable = (chunk_end_exclusive.saturating_sub(write_offset))
                .min(piece.len() as u64) as usize;
            if writable == 0 {
                break;
            }

            {
                let mut file = self.file.lock().await;
                file.seek(SeekFrom::Start(write_offset)).await?;
                file.write_all(&piece[..writable]).await?;
            }

            write_offset += writable as u64;
            self.set_downloaded(index, write_offset - start);
            self.tracker.add(writable as u64);
        }

        let remaining = {
            let plan = self.plan.lock();
            plan.chunks[index].remaining()
        };
        if remaining > 0 {
            return Err(RuntimeError::Network(format!(
                "{}: chunk {index} short by {remaining} bytes",
                self.url
            )));
        }

        self.complete_chunk(index);
        Ok(())
    }

    fn set_downloaded(&self, index: usize, downloaded: u64) {
        let mut plan = self.plan.lock();
        plan.chunks[index].downloaded = downloaded;
    }

    /// Mark the chunk done and flush the plan, the only sidecar writer for
    /// this chunk.
    fn complete_chunk(&self, index: usize) {
        let mut plan = self.plan.lock();
        let chunk = &mut plan.chunks[index];
        chunk.downloaded = chunk.len();
        chunk.is_completed = true;
        chunk.error_message = None;
        plan.touch();
        if let Err(e) = plan.save(&self.sidecar) {
            warn!(chunk = index, "Failed to flush download metadata: {e}");
        }
    }
}
