//! Process-wide catalogue of known models.
//!
//! The registry serves [`ModelMetadata`] records keyed by model id. First
//! access parses the embedded default manifest; hosts can replace it with an
//! on-disk manifest via [`ModelRegistry::load_from_path`]. `get` rewrites a
//! record's logical file names to absolute paths once per id.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::core::metadata::ModelMetadata;
use crate::core::paths::PathResolver;
use crate::errors::{RuntimeError, RuntimeResult};

const DEFAULT_MANIFEST: &str = include_str!("default_manifest.json");

/// On-disk / embedded manifest shape: `{ "models": [ ... ] }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub models: Vec<ModelMetadata>,
}

struct Entry {
    metadata: ModelMetadata,
    /// Set once `model_file_names` have been rewritten to absolute paths.
    resolved: bool,
}

struct Inner {
    order: Vec<String>,
    entries: HashMap<String, Entry>,
}

/// Lazily-initialised model catalogue.
pub struct ModelRegistry {
    resolver: PathResolver,
    state: RwLock<Option<Inner>>,
}

impl ModelRegistry {
    pub fn new(resolver: PathResolver) -> Self {
        Self {
            resolver,
            state: RwLock::new(None),
        }
    }

    /// Parse a manifest body, dropping duplicate or empty ids (first wins).
    fn build(&self, manifest: Manifest) -> Inner {
        let mut order = Vec::new();
        let mut entries = HashMap::new();

        for metadata in manifest.models {
            let id = metadata.model_id.trim().to_string();
            if id.is_empty() {
                warn!("Skipping manifest entry with empty modelId");
                continue;
            }
            if entries.contains_key(&id) {
                warn!(model_id = %id, "Skipping duplicate manifest entry");
                continue;
            }
            order.push(id.clone());
            entries.insert(
                id,
                Entry {
                    metadata,
                    resolved: false,
                },
            );
        }

        info!("Model registry loaded with {} models", order.len());
        Inner { order, entries }
    }

    /// Ensure the embedded manifest has been parsed.
    ///
    /// A parse failure leaves the registry uninitialised so the next call
    /// retries.
    fn ensure_loaded(&self) -> RuntimeResult<()> {
        if self.state.read().is_some() {
            return Ok(());
        }
        let mut state = self.state.write();
        if state.is_some() {
            return Ok(());
        }
        let manifest: Manifest = serde_json::from_str(DEFAULT_MANIFEST).map_err(|e| {
            warn!("Failed to parse embedded manifest: {e}");
            RuntimeError::Precondition(format!("embedded manifest invalid: {e}"))
        })?;
        *state = Some(self.build(manifest));
        Ok(())
    }

    /// Replace the catalogue with a manifest read from disk.
    pub fn load_from_path(&self, path: &Path) -> RuntimeResult<usize> {
        let body = std::fs::read_to_string(path)
            .map_err(|_| RuntimeError::NotFound(path.to_path_buf()))?;
        let manifest: Manifest = serde_json::from_str(&body)
            .map_err(|e| RuntimeError::Precondition(format!("manifest {path:?} invalid: {e}")))?;
        let inner = self.build(manifest);
        let count = inner.order.len();
        *self.state.write() = Some(inner);
        Ok(count)
    }

    /// Look up a model, rewriting its file names to absolute paths.
    ///
    /// The rewrite happens once per id; later calls return the memoised
    /// record.
    pub fn get(&self, model_id: &str) -> Option<ModelMetadata> {
        if self.ensure_loaded().is_err() {
            return None;
        }

        {
            let state = self.state.read();
            let inner = state.as_ref()?;
            let entry = inner.entries.get(model_id)?;
            if entry.resolved {
                return Some(entry.metadata.clone());
            }
        }

        let mut state = self.state.write();
        let inner = state.as_mut()?;
        let entry = inner.entries.get_mut(model_id)?;
        if !entry.resolved {
            let mut resolved_names = Vec::with_capacity(entry.metadata.model_file_names.len());
            for name in &entry.metadata.model_file_names {
                match self.resolver.model_file_path(&entry.metadata, name) {
                    Ok(path) => resolved_names.push(path.to_string_lossy().into_owned()),
                    Err(e) => {
                        warn!(model_id, file = %name, "Path resolution failed: {e}");
                        return None;
                    }
                }
            }
            entry.metadata.model_file_names = resolved_names;
            entry.resolved = true;
            debug!(model_id, "Resolved model file paths");
        }
        Some(entry.metadata.clone())
    }

    /// All models in manifest order, without path rewriting.
    pub fn all(&self) -> Vec<ModelMetadata> {
        if self.ensure_loaded().is_err() {
            return Vec::new();
        }
        let state = self.state.read();
        let inner = match state.as_ref() {
            Some(inner) => inner,
            None => return Vec::new(),
        };
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .map(|entry| entry.metadata.clone())
            .collect()
    }

    /// Models matching a predicate, in manifest order.
    pub fn filter(&self, predicate: impl Fn(&ModelMetadata) -> bool) -> Vec<ModelMetadata> {
        self.all().into_iter().filter(|m| predicate(m)).collect()
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }
}

static GLOBAL_REGISTRY: Lazy<RwLock<Option<Arc<ModelRegistry>>>> = Lazy::new(|| RwLock::new(None));

/// Install the process-wide registry with an explicit resolver.
pub fn init_global_registry(resolver: PathResolver) -> Arc<ModelRegistry> {
    let registry = Arc::new(ModelRegistry::new(resolver));
    *GLOBAL_REGISTRY.write() = Some(Arc::clone(&registry));
    registry
}

/// The process-wide registry, created from the default data root on first use.
pub fn global_registry() -> Arc<ModelRegistry> {
    if let Some(registry) = GLOBAL_REGISTRY.read().as_ref() {
        return Arc::clone(registry);
    }
    let mut slot = GLOBAL_REGISTRY.write();
    if let Some(registry) = slot.as_ref() {
        return Arc::clone(registry);
    }
    let resolver = PathResolver::new(RuntimeConfig::default().data_root);
    let registry = Arc::new(ModelRegistry::new(resolver));
    *slot = Some(Arc::clone(&registry));
    registry
}

/// Drop the process-wide registry so tests can re-init with a sandbox root.
pub fn reset_global_registry() {
    *GLOBAL_REGISTRY.write() = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::metadata::ModuleKind;
    use tempfile::tempdir;

    fn registry_at(root: &Path) -> ModelRegistry {
        ModelRegistry::new(PathResolver::new(root))
    }

    #[test]
    fn test_embedded_manifest_loads() {
        let dir = tempdir().unwrap();
        let registry = registry_at(dir.path());
        let all = registry.all();
        assert!(!all.is_empty());
        assert!(all.iter().any(|m| m.model_id == "silero-vad-v5"));
    }

    #[test]
    fn test_get_rewrites_to_absolute_paths() {
        let dir = tempdir().unwrap();
        let registry = registry_at(dir.path());

        let meta = registry.get("silero-vad-v5").unwrap();
        let expected = dir
            .path()
            .join("sherpa-onnx/models/voice-activity-detection/silero-vad-v5/silero_vad.onnx");
        assert_eq!(meta.model_file_names, vec![expected.to_string_lossy()]);

        // Memoised: second lookup must not re-prefix.
        let again = registry.get("silero-vad-v5").unwrap();
        assert_eq!(again.model_file_names, meta.model_file_names);
    }

    #[test]
    fn test_all_preserves_manifest_order_without_rewrite() {
        let dir = tempdir().unwrap();
        let registry = registry_at(dir.path());

        let before = registry.all();
        let _ = registry.get(&before[0].model_id);
        let after = registry.all();
        let ids: Vec<_> = after.iter().map(|m| m.model_id.clone()).collect();
        let expected: Vec<_> = before.iter().map(|m| m.model_id.clone()).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_duplicates_and_empty_ids_dropped_first_wins() {
        let dir = tempdir().unwrap();
        let registry = registry_at(dir.path());

        let manifest = r#"{
            "models": [
                {"modelId": "dup", "moduleType": "SpeechRecognition",
                 "downloadUrl": "https://example.com/first.tar.bz2",
                 "modelFileNames": ["a.onnx"]},
                {"modelId": "dup", "moduleType": "SpeechRecognition",
                 "downloadUrl": "https://example.com/second.tar.bz2",
                 "modelFileNames": ["b.onnx"]},
                {"modelId": "  ", "moduleType": "SpeechSynthesis",
                 "downloadUrl": "https://example.com/none.tar.bz2",
                 "modelFileNames": ["c.onnx"]}
            ]
        }"#;
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, manifest).unwrap();

        let count = registry.load_from_path(&path).unwrap();
        assert_eq!(count, 1);
        let dup = registry.get("dup").unwrap();
        assert!(dup.download_url.contains("first"));
    }

    #[test]
    fn test_filter_by_kind() {
        let dir = tempdir().unwrap();
        let registry = registry_at(dir.path());
        let tts = registry.filter(|m| m.module_kind == ModuleKind::SpeechSynthesis);
        assert!(tts.iter().all(|m| m.module_kind == ModuleKind::SpeechSynthesis));
        assert!(!tts.is_empty());
    }

    #[test]
    fn test_manifest_round_trip_preserves_order() {
        let dir = tempdir().unwrap();
        let registry = registry_at(dir.path());
        let models = registry.all();

        let manifest = Manifest {
            models: models.clone(),
        };
        let json = serde_json::to_string(&manifest).unwrap();
        let back: Manifest = serde_json::from_str(&json).unwrap();
        let ids: Vec<_> = back.models.iter().map(|m| &m.model_id).collect();
        let expected: Vec<_> = models.iter().map(|m| &m.model_id).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_missing_manifest_file() {
        let dir = tempdir().unwrap();
        let registry = registry_at(dir.path());
        let result = registry.load_from_path(&dir.path().join("nope.json"));
        assert!(matches!(result, Err(RuntimeError::NotFound(_))));
    }

    #[test]
    fn test_global_registry_init_and_reset() {
        reset_global_registry();
        let dir = tempdir().unwrap();
        let installed = init_global_registry(PathResolver::new(dir.path()));
        assert!(Arc::ptr_eq(&installed, &global_registry()));
        reset_global_registry();
        // A fresh default registry is created on next access.
        assert!(!global_registry().all().is_empty());
        reset_global_registry();
    }
}
