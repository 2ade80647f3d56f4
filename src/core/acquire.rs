//! The verify → download → extract acquisition loop.
//!
//! [`ModelAcquirer::prepare_model`] drives a model from metadata to a
//! verified directory on disk. Each round verifies what is already present,
//! downloads the artifact if needed, extracts archives and re-verifies;
//! failed rounds back off exponentially. Every terminal outcome produces
//! exactly one `Success`, `Failed` or `Cancel` event; intermediate retries
//! only emit progress.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::core::buffer_pool::BufferPool;
use crate::core::download::{DownloadConfig, DownloadProgressUpdate, Downloader};
use crate::core::extract::{extract, ExtractOptions};
use crate::core::feedback::{FeedbackBase, FeedbackReporter, ModelFeedback};
use crate::core::metadata::ModelMetadata;
use crate::core::paths::{is_archive_name, PathResolver};
use crate::core::verify::{verify_file, VerifyOutcome, HASH_BLOCK_SIZE};
use crate::errors::{RuntimeError, RuntimeResult};

/// First backoff delay.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
/// Backoff growth factor per attempt.
const BACKOFF_MULTIPLIER: u32 = 2;
/// Backoff ceiling.
const BACKOFF_MAX: Duration = Duration::from_secs(16);

/// Size of the probe file used when free-space APIs are unavailable.
const SPACE_PROBE_BYTES: usize = 1024;

/// Drives model acquisition end to end.
pub struct ModelAcquirer {
    resolver: PathResolver,
    downloader: Downloader,
    pool: BufferPool,
    max_attempts: usize,
    extract_options: ExtractOptions,
}

impl ModelAcquirer {
    pub fn new(config: &RuntimeConfig) -> RuntimeResult<Self> {
        let downloader = Downloader::new(DownloadConfig {
            max_parallel_chunks: config.max_parallel_chunks,
            max_retry_attempts: config.max_chunk_retries,
            request_timeout: config.request_timeout,
            ..Default::default()
        })?;
        Ok(Self {
            resolver: PathResolver::new(config.data_root.clone()),
            downloader,
            pool: BufferPool::new(HASH_BLOCK_SIZE),
            max_attempts: config.max_acquire_attempts.max(1),
            extract_options: ExtractOptions::default(),
        })
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn with_extract_options(mut self, options: ExtractOptions) -> Self {
        self.extract_options = options;
        self
    }

    /// Acquire one model; true means every file is present and verified.
    pub async fn prepare_model(
        &self,
        metadata: &ModelMetadata,
        reporter: &FeedbackReporter,
        cancel: &CancellationToken,
    ) -> bool {
        reporter.report(ModelFeedback::Prepare(FeedbackBase::new(
            metadata,
            format!("Preparing model '{}'", metadata.model_id),
        )));

        if let Err(reason) = metadata.validate() {
            reporter.report(ModelFeedback::Failed(
                FeedbackBase::new(metadata, "Invalid model metadata").with_error(reason),
            ));
            return false;
        }

        let (model_dir, staging, files) = match self.resolve_layout(metadata) {
            Ok(layout) => layout,
            Err(e) => {
                reporter.report(ModelFeedback::Failed(
                    FeedbackBase::new(metadata, "Path resolution failed").with_error(e.to_string()),
                ));
                return false;
            }
        };

        if let Err(e) = self.check_disk_space(&model_dir).await {
            reporter.report(ModelFeedback::Failed(
                FeedbackBase::new(metadata, "Insufficient disk space").with_error(e.to_string()),
            ));
            return false;
        }

        for attempt in 0..self.max_attempts {
            if cancel.is_cancelled() {
                self.report_cancel(metadata, reporter);
                return false;
            }

            debug!(
                model_id = %metadata.model_id,
                attempt,
                "Starting acquisition round"
            );

            match self
                .run_round(metadata, &model_dir, &staging, &files, reporter, cancel)
                .await
            {
                Ok(true) => {
                    reporter.report(ModelFeedback::Success(FeedbackBase::new(
                        metadata,
                        format!("Model '{}' ready", metadata.model_id),
                    )));
                    return true;
                }
                Ok(false) => {}
                Err(RuntimeError::Cancelled) => {
                    self.report_cancel(metadata, reporter);
                    return false;
                }
                Err(e) => {
                    warn!(
                        model_id = %metadata.model_id,
                        attempt, "Acquisition round failed: {e}"
                    );
                }
            }

            // No backoff after the final attempt.
            if attempt + 1 < self.max_attempts {
                let delay = backoff_delay(attempt);
                debug!(model_id = %metadata.model_id, ?delay, "Backing off");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        self.report_cancel(metadata, reporter);
                        return false;
                    }
                }
            }
        }

        self.cleanup(metadata, &model_dir, &staging, reporter).await;
        reporter.report(ModelFeedback::Failed(
            FeedbackBase::new(
                metadata,
                format!(
                    "Model '{}' could not be acquired after {} attempts",
                    metadata.model_id, self.max_attempts
                ),
            )
            .with_error("retry budget exhausted"),
        ));
        false
    }

    /// One verify → download → extract → verify round.
    async fn run_round(
        &self,
        metadata: &ModelMetadata,
        model_dir: &Path,
        staging: &Path,
        files: &[(PathBuf, Option<String>)],
        reporter: &FeedbackReporter,
        cancel: &CancellationToken,
    ) -> RuntimeResult<bool> {
        if self
            .verify_existing_model(metadata, model_dir, staging, files, reporter, cancel)
            .await?
        {
            return Ok(true);
        }

        self.download_artifact(metadata, staging, reporter, cancel)
            .await?;

        let staging_name = staging
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();

        if is_archive_name(staging_name) {
            self.extract_artifact(metadata, staging, model_dir, reporter, cancel)
                .await?;
        }

        Ok(self
            .verify_existing_model(metadata, model_dir, staging, files, reporter, cancel)
            .await?)
    }

    /// Verify every model file in parallel.
    ///
    /// Any invalid file deletes the whole model directory so the next round
    /// starts clean; full success deletes a lingering staged archive.
    async fn verify_existing_model(
        &self,
        metadata: &ModelMetadata,
        model_dir: &Path,
        staging: &Path,
        files: &[(PathBuf, Option<String>)],
        reporter: &FeedbackReporter,
        cancel: &CancellationToken,
    ) -> RuntimeResult<bool> {
        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }

        let checks = files.iter().map(|(path, expected)| {
            let pool = self.pool.clone();
            let cancel = cancel.clone();
            async move {
                let outcome = verify_file(
                    path,
                    expected.as_deref(),
                    &pool,
                    |_| {},
                    &cancel,
                )
                .await?;
                Ok::<_, RuntimeError>((path.clone(), outcome))
            }
        });

        let mut all_valid = true;
        for result in join_all(checks).await {
            let (path, outcome) = result?;
            let (message, calculated) = match &outcome {
                VerifyOutcome::Success { digest } => ("verified", digest.clone()),
                VerifyOutcome::CacheHit { digest } => ("verified (cache)", Some(digest.clone())),
                VerifyOutcome::HashMismatch { actual, .. } => ("hash mismatch", Some(actual.clone())),
                VerifyOutcome::FileNotFound => ("missing", None),
                VerifyOutcome::IsDirectory => ("unexpected directory", None),
                VerifyOutcome::Error(_) => ("verification error", None),
            };
            reporter.report(ModelFeedback::Verify {
                base: FeedbackBase::new(metadata, format!("{}: {message}", path.display())),
                file_path: path.to_string_lossy().into_owned(),
                progress: 1.0,
                calculated_hash: calculated,
                expected_hash: files
                    .iter()
                    .find(|(p, _)| p == &path)
                    .and_then(|(_, h)| h.clone()),
            });
            if !outcome.is_valid() {
                all_valid = false;
            }
        }

        if !all_valid {
            if model_dir.exists() {
                debug!(
                    model_id = %metadata.model_id,
                    "Removing invalid model directory"
                );
                let _ = tokio::fs::remove_dir_all(model_dir).await;
            }
            return Ok(false);
        }

        // The model is canonical in its directory; drop a lingering archive.
        // Plain-file downloads stage directly at the model file, which must
        // survive.
        let staging_is_archive = staging
            .file_name()
            .and_then(|n| n.to_str())
            .map(is_archive_name)
            .unwrap_or(false);
        if staging_is_archive && staging.is_file() {
            let _ = tokio::fs::remove_file(staging).await;
        }
        Ok(true)
    }

    async fn download_artifact(
        &self,
        metadata: &ModelMetadata,
        staging: &Path,
        reporter: &FeedbackReporter,
        cancel: &CancellationToken,
    ) -> RuntimeResult<()> {
        let url = metadata.download_url.clone();
        let progress_reporter = reporter.clone();
        let progress_meta = metadata.clone();
        let progress_url = url.clone();

        self.downloader
            .download(
                &url,
                staging,
                Arc::new(move |update: DownloadProgressUpdate| {
                    progress_reporter.report(ModelFeedback::Download {
                        base: FeedbackBase::new(
                            &progress_meta,
                            format!(
                                "Downloading '{}' ({:.1}%)",
                                progress_meta.model_id,
                                update.progress * 100.0
                            ),
                        ),
                        url: progress_url.clone(),
                        progress: update.progress,
                        downloaded_bytes: update.downloaded_bytes,
                        total_bytes: update.total_bytes,
                        speed_bytes_per_second: update.speed_bytes_per_second,
                        estimated_remaining: update.estimated_remaining,
                    });
                }),
                cancel,
            )
            .await
    }

    async fn extract_artifact(
        &self,
        metadata: &ModelMetadata,
        staging: &Path,
        model_dir: &Path,
        reporter: &FeedbackReporter,
        cancel: &CancellationToken,
    ) -> RuntimeResult<()> {
        let progress_reporter = reporter.clone();
        let progress_meta = metadata.clone();
        let progress_path = staging.to_string_lossy().into_owned();

        // Archives carry the model-id directory inside them, so they unpack
        // into the module root; plain entries land in the model directory
        // either way through the entry paths.
        let dest = model_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| model_dir.to_path_buf());

        let result = extract(
            staging,
            &dest,
            self.extract_options.clone(),
            Arc::new(move |progress| {
                progress_reporter.report(ModelFeedback::Extract {
                    base: FeedbackBase::new(&progress_meta, "Extracting model archive"),
                    file_path: progress_path.clone(),
                    progress,
                });
            }),
            cancel,
        )
        .await;

        match result {
            Ok(outcome) => {
                info!(
                    model_id = %metadata.model_id,
                    files = outcome.files_written,
                    "Archive extracted"
                );
                Ok(())
            }
            Err(RuntimeError::Cancelled) => {
                // A half-populated model directory is unusable; remove it.
                // The archive itself stays for the next run.
                let _ = tokio::fs::remove_dir_all(model_dir).await;
                Err(RuntimeError::Cancelled)
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve the directory, staging path and expected files up front.
    #[allow(clippy::type_complexity)]
    fn resolve_layout(
        &self,
        metadata: &ModelMetadata,
    ) -> RuntimeResult<(PathBuf, PathBuf, Vec<(PathBuf, Option<String>)>)> {
        let model_dir = self.resolver.model_root(metadata)?;
        let staging = self.resolver.staging_path(metadata)?;

        let mut files = Vec::with_capacity(metadata.model_file_names.len());
        for (index, name) in metadata.model_file_names.iter().enumerate() {
            let path = if Path::new(name).is_absolute() {
                PathBuf::from(name)
            } else {
                self.resolver.model_file_path(metadata, name)?
            };
            files.push((path, metadata.file_hash(index).map(str::to_string)));
        }
        Ok((model_dir, staging, files))
    }

    /// Write-and-delete a 1 KiB probe to prove the volume is writable.
    async fn check_disk_space(&self, model_dir: &Path) -> RuntimeResult<()> {
        tokio::fs::create_dir_all(model_dir).await?;
        let probe = model_dir.join(".space-probe");
        let result = tokio::fs::write(&probe, [0u8; SPACE_PROBE_BYTES]).await;
        let _ = tokio::fs::remove_file(&probe).await;
        result.map_err(|_| RuntimeError::InsufficientSpace(model_dir.to_path_buf()))
    }

    fn report_cancel(&self, metadata: &ModelMetadata, reporter: &FeedbackReporter) {
        reporter.report(ModelFeedback::Cancel(FeedbackBase::new(
            metadata,
            format!("Acquisition of '{}' cancelled", metadata.model_id),
        )));
    }

    /// Best-effort removal of the model directory and staging artifacts.
    ///
    /// Each removal is announced as a `Clean` event; cleanup failures are
    /// logged without masking the original cause.
    async fn cleanup(
        &self,
        metadata: &ModelMetadata,
        model_dir: &Path,
        staging: &Path,
        reporter: &FeedbackReporter,
    ) {
        let staging_body = crate::core::download::body_path(staging);
        let staging_meta = crate::core::download::metadata_path(staging);

        let (dir_result, file_results) = tokio::join!(
            async {
                if model_dir.exists() {
                    tokio::fs::remove_dir_all(model_dir).await.map(|_| true)
                } else {
                    Ok(false)
                }
            },
            async {
                let mut removed = Vec::new();
                for path in [staging, staging_body.as_path(), staging_meta.as_path()] {
                    if path.exists() {
                        match tokio::fs::remove_file(path).await {
                            Ok(()) => removed.push((path.to_path_buf(), None)),
                            Err(e) => removed.push((path.to_path_buf(), Some(e.to_string()))),
                        }
                    }
                }
                removed
            }
        );

        match dir_result {
            Ok(true) => reporter.report(ModelFeedback::Clean {
                base: FeedbackBase::new(metadata, "Removed model directory"),
                file_path: model_dir.to_string_lossy().into_owned(),
            }),
            Ok(false) => {}
            Err(e) => {
                warn!(model_id = %metadata.model_id, "Cleanup failed: {e}");
                reporter.report(ModelFeedback::Failed(
                    FeedbackBase::new(metadata, "Cleanup of model directory failed")
                        .with_error(e.to_string()),
                ));
            }
        }

        for (path, error) in file_results {
            match error {
                None => reporter.report(ModelFeedback::Clean {
                    base: FeedbackBase::new(metadata, "Removed staging artifact"),
                    file_path: path.to_string_lossy().into_owned(),
                }),
                Some(e) => {
                    warn!(path = %path.display(), "Cleanup failed: {e}");
                }
            }
        }
    }
}

/// `min(INITIAL * MULTIPLIER^attempt, MAX)`.
pub fn backoff_delay(attempt: usize) -> Duration {
    let factor = BACKOFF_MULTIPLIER.saturating_pow(attempt.min(16) as u32);
    BACKOFF_INITIAL
        .saturating_mul(factor)
        .min(BACKOFF_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(4), Duration::from_secs(16));
        // Capped thereafter.
        assert_eq!(backoff_delay(5), Duration::from_secs(16));
        assert_eq!(backoff_delay(40), Duration::from_secs(16));
    }
}
