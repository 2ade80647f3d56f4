//! Initialization helpers for preparing runtime assets ahead of first use.
//!
//! Deployments that want models on disk before any module is constructed
//! call [`prefetch`] from an async context:
//!
//! ```rust,no_run
//! use sherpa_runtime::{config::RuntimeConfig, init};
//!
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! runtime.block_on(async {
//!     let config = RuntimeConfig::from_env().expect("config");
//!     init::prefetch(&config, &["silero-vad-v5"]).await.expect("prefetch");
//! });
//! ```

use anyhow::{anyhow, Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::core::acquire::ModelAcquirer;
use crate::core::feedback::FeedbackReporter;
use crate::core::paths::PathResolver;
use crate::core::registry::ModelRegistry;

/// Install a `tracing` subscriber honouring `RUST_LOG`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Download and verify the given models so later module construction is a
/// cache hit.
///
/// Fails on the first model that cannot be acquired, after logging a manual
/// fallback for operators.
pub async fn prefetch(config: &RuntimeConfig, model_ids: &[&str]) -> Result<()> {
    let registry = ModelRegistry::new(PathResolver::new(config.data_root.clone()));
    let acquirer = ModelAcquirer::new(config).context("building model acquirer")?;
    let reporter = FeedbackReporter::from_callback(|event| {
        tracing::debug!(kind = event.kind(), model = %event.base().metadata.model_id, "prefetch");
    });
    let cancel = CancellationToken::new();

    for model_id in model_ids.iter().copied() {
        let metadata = registry
            .get(model_id)
            .ok_or_else(|| anyhow!("model '{model_id}' not found in manifest"))?;

        tracing::info!(model_id, "Prefetching model...");
        if !acquirer.prepare_model(&metadata, &reporter, &cancel).await {
            tracing::error!(model_id, "Prefetch failed");
            tracing::error!(
                "You can manually download from: {} and extract into {:?}",
                metadata.download_url,
                acquirer.resolver().model_root(&metadata)
            );
            return Err(anyhow!("failed to prefetch model '{model_id}'"));
        }
        tracing::info!(model_id, "Model ready");
    }

    Ok(())
}
