//! Concrete speech modules over the shared lifecycle and pipeline.
//!
//! Each module pairs a [`crate::core::module::ModuleCore`] with one native
//! capability set: VAD and keyword spotting stream through the pipeline
//! plumbing, online recognition decodes windows against an
//! [`crate::core::engine::OnlineStream`], while offline recognition,
//! synthesis and enhancement are whole-buffer calls. Registry kinds without
//! a binding here still acquire through `prepare_model`; they just have no
//! engine to open yet.

pub mod asr;
pub mod asr_offline;
pub mod enhance;
pub mod kws;
pub mod tts;
pub mod vad;

pub use asr::{RecognitionEvent, SpeechRecognitionModule};
pub use asr_offline::OfflineRecognitionModule;
pub use enhance::EnhancementModule;
pub use kws::KeywordSpotterModule;
pub use tts::TtsModule;
pub use vad::VadModule;

use std::path::PathBuf;

use crate::core::engine::EngineConfig;
use crate::core::metadata::ModelMetadata;

/// Build the native engine config from resolved metadata.
///
/// Expects `model_file_names` to have been rewritten to absolute paths by
/// the registry.
pub(crate) fn engine_config(metadata: &ModelMetadata, sample_rate: u32) -> EngineConfig {
    EngineConfig {
        model_id: metadata.model_id.clone(),
        model_files: metadata.model_file_names.iter().map(PathBuf::from).collect(),
        sample_rate,
        num_threads: 1,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Sandbox helpers shared by the module tests: a tempdir-backed registry
    //! whose model files already exist, so acquisition verifies locally
    //! without touching the network.

    use std::path::Path;
    use std::sync::Arc;

    use crate::config::RuntimeConfig;
    use crate::core::paths::PathResolver;
    use crate::core::registry::ModelRegistry;

    pub fn sandbox(root: &Path) -> (RuntimeConfig, Arc<ModelRegistry>) {
        let config = RuntimeConfig::default().with_data_root(root);
        let registry = Arc::new(ModelRegistry::new(PathResolver::new(root)));
        (config, registry)
    }

    /// Create every file the registry expects for `model_id`, so
    /// verification passes without a download.
    pub fn materialize_model(registry: &ModelRegistry, model_id: &str) {
        let metadata = registry.get(model_id).expect("model in manifest");
        for file in &metadata.model_file_names {
            let path = Path::new(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"model-bytes").unwrap();
        }
    }
}
