//! Runtime configuration loaded from the process environment.

pub mod env_store;
pub mod utils;

pub use env_store::{global_env, reset_global_env, EnvChange, EnvStore, KEY_GITHUB_PROXY};

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use self::utils::parse_nonzero_usize;

/// Hard upper bound on concurrent download chunks.
pub const MAX_PARALLEL_CHUNKS_LIMIT: usize = 8;

/// Configuration for the acquisition and streaming core.
///
/// Every field has a sensible default so `RuntimeConfig::default()` works in
/// tests; `from_env` layers process environment variables on top.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Writable application data root under which `sherpa-onnx/` is created.
    pub data_root: PathBuf,
    /// Per-request timeout for download probes and chunk requests.
    pub request_timeout: Duration,
    /// Number of download chunks fetched concurrently (clamped to 8).
    pub max_parallel_chunks: usize,
    /// Retry attempts per download chunk.
    pub max_chunk_retries: usize,
    /// Full verify/download/extract rounds before giving up.
    pub max_acquire_attempts: usize,
    /// Maximum tasks a module's runner executes concurrently.
    pub max_concurrent_tasks: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            request_timeout: Duration::from_secs(30),
            max_parallel_chunks: 4,
            max_chunk_retries: 3,
            max_acquire_attempts: 3,
            max_concurrent_tasks: 8,
        }
    }
}

/// Default writable data root: `$XDG_DATA_HOME` or `~/.local/share`,
/// falling back to the working directory.
pub fn default_data_root() -> PathBuf {
    env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|_| env::var("HOME").map(|h| PathBuf::from(h).join(".local").join("share")))
        .unwrap_or_else(|_| PathBuf::from("."))
}

impl RuntimeConfig {
    /// Load configuration from environment variables
    ///
    /// Reads configuration from environment variables, with sensible defaults.
    /// Also loads from .env file if present using dotenvy.
    ///
    /// # Errors
    /// Returns an error if a provided value is malformed (e.g. a zero or
    /// non-numeric parallelism).
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let mut config = Self::default();

        if let Ok(root) = env::var("SHERPA_DATA_ROOT") {
            if root.trim().is_empty() {
                return Err("SHERPA_DATA_ROOT must not be empty".into());
            }
            config.data_root = PathBuf::from(root);
        }

        if let Ok(value) = env::var("SHERPA_REQUEST_TIMEOUT_SECS") {
            let secs = value
                .trim()
                .parse::<u64>()
                .map_err(|e| format!("Invalid SHERPA_REQUEST_TIMEOUT_SECS: {e}"))?;
            config.request_timeout = Duration::from_secs(secs);
        }

        if let Ok(value) = env::var("SHERPA_MAX_PARALLEL_CHUNKS") {
            config.max_parallel_chunks = parse_nonzero_usize(&value)
                .ok_or("SHERPA_MAX_PARALLEL_CHUNKS must be a positive integer")?;
        }

        if let Ok(value) = env::var("SHERPA_MAX_CHUNK_RETRIES") {
            config.max_chunk_retries = parse_nonzero_usize(&value)
                .ok_or("SHERPA_MAX_CHUNK_RETRIES must be a positive integer")?;
        }

        if let Ok(value) = env::var("SHERPA_MAX_ACQUIRE_ATTEMPTS") {
            config.max_acquire_attempts = parse_nonzero_usize(&value)
                .ok_or("SHERPA_MAX_ACQUIRE_ATTEMPTS must be a positive integer")?;
        }

        if let Ok(value) = env::var("SHERPA_MAX_CONCURRENT_TASKS") {
            config.max_concurrent_tasks = parse_nonzero_usize(&value)
                .ok_or("SHERPA_MAX_CONCURRENT_TASKS must be a positive integer")?;
        }

        // Mirror the proxy env var into the settings store so the downloader
        // picks it up without the caller wiring it through.
        if let Ok(proxy) = env::var("SHERPA_GITHUB_PROXY") {
            if !proxy.trim().is_empty() {
                global_env().set(KEY_GITHUB_PROXY, proxy);
            }
        }

        config.max_parallel_chunks = config.max_parallel_chunks.min(MAX_PARALLEL_CHUNKS_LIMIT);

        Ok(config)
    }

    /// Builder-style override of the data root (tests redirect into a tempdir).
    pub fn with_data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.data_root = root.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_parallel_chunks(mut self, chunks: usize) -> Self {
        self.max_parallel_chunks = chunks.clamp(1, MAX_PARALLEL_CHUNKS_LIMIT);
        self
    }

    pub fn with_max_acquire_attempts(mut self, attempts: usize) -> Self {
        self.max_acquire_attempts = attempts.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_acquire_attempts, 3);
        assert!(config.max_parallel_chunks <= MAX_PARALLEL_CHUNKS_LIMIT);
    }

    #[test]
    fn test_builder_overrides() {
        let config = RuntimeConfig::default()
            .with_data_root("/tmp/sandbox")
            .with_max_parallel_chunks(99)
            .with_max_acquire_attempts(0);

        assert_eq!(config.data_root, PathBuf::from("/tmp/sandbox"));
        // Clamped to the hard chunk bound.
        assert_eq!(config.max_parallel_chunks, MAX_PARALLEL_CHUNKS_LIMIT);
        assert_eq!(config.max_acquire_attempts, 1);
    }
}
