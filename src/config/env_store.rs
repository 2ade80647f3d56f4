//! Process-wide key/value settings with change notification.
//!
//! Optional runtime settings (download proxy, tuning knobs) are discovered
//! through this store instead of being threaded through every constructor.
//! Keys are case-insensitive; values are strings with typed readers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::debug;

/// Well-known key: URL prefix prepended to download URLs when set.
pub const KEY_GITHUB_PROXY: &str = "SherpaOnnx.GithubProxy";

/// Change notification delivered to subscribers after a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvChange {
    Set(String),
    Removed(String),
    Cleared,
}

type ChangeListener = Arc<dyn Fn(&EnvChange) + Send + Sync>;

/// Thread-safe, case-insensitive string map with typed readers.
///
/// Listeners are invoked after the write commits, outside the map lock.
pub struct EnvStore {
    values: RwLock<HashMap<String, String>>,
    listeners: RwLock<Vec<ChangeListener>>,
}

impl EnvStore {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    fn canonical(key: &str) -> String {
        key.to_ascii_lowercase()
    }

    /// Store a value, replacing any previous one.
    pub fn set(&self, key: &str, value: impl Into<String>) {
        let value = value.into();
        self.values.write().insert(Self::canonical(key), value);
        self.notify(EnvChange::Set(key.to_string()));
    }

    /// Remove a value; returns true when a value was present.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.values.write().remove(&Self::canonical(key)).is_some();
        if removed {
            self.notify(EnvChange::Removed(key.to_string()));
        }
        removed
    }

    /// Drop every stored value.
    pub fn clear(&self) {
        self.values.write().clear();
        self.notify(EnvChange::Cleared);
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(&Self::canonical(key)).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.read().contains_key(&Self::canonical(key))
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    /// Read a boolean, accepting `true/false`, `1/0`, `yes/no`, `on/off`.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| super::utils::parse_bool(&v))
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn get_f32(&self, key: &str) -> Option<f32> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    /// Read a duration expressed in (possibly fractional) seconds.
    pub fn get_duration(&self, key: &str) -> Option<Duration> {
        self.get_f64(key)
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
    }

    /// Register a listener invoked after every committed change.
    pub fn subscribe(&self, listener: impl Fn(&EnvChange) + Send + Sync + 'static) {
        self.listeners.write().push(Arc::new(listener));
    }

    fn notify(&self, change: EnvChange) {
        let listeners: Vec<ChangeListener> = self.listeners.read().clone();
        for listener in listeners {
            listener(&change);
        }
    }

    /// The download proxy prefix, normalised to end with a slash.
    pub fn github_proxy(&self) -> Option<String> {
        self.get(KEY_GITHUB_PROXY).map(|mut prefix| {
            if !prefix.ends_with('/') {
                prefix.push('/');
            }
            prefix
        })
    }
}

impl Default for EnvStore {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_ENV: Lazy<RwLock<Arc<EnvStore>>> =
    Lazy::new(|| RwLock::new(Arc::new(EnvStore::new())));

/// The process-wide settings store.
pub fn global_env() -> Arc<EnvStore> {
    Arc::clone(&GLOBAL_ENV.read())
}

/// Replace the process-wide store with a fresh one.
///
/// Intended for test isolation; handles obtained earlier keep the old store.
pub fn reset_global_env() {
    debug!("Resetting global environment store");
    *GLOBAL_ENV.write() = Arc::new(EnvStore::new());
}
