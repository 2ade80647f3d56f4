//! Offline speech-recognition module.
//!
//! The whole-utterance sibling of the streaming recognizer: callers hand in
//! a complete buffer and get the transcript back from a single native
//! decode, run on a blocking thread with the engine behind the module lock.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::core::engine::{EngineFactory, OfflineRecognizer};
use crate::core::feedback::FeedbackReporter;
use crate::core::metadata::ModelMetadata;
use crate::core::module::{ModuleCore, ModuleState, SpeechModule};
use crate::core::modules::engine_config;
use crate::core::registry::ModelRegistry;
use crate::errors::{RuntimeError, RuntimeResult};

/// Configuration for an [`OfflineRecognitionModule`].
#[derive(Debug, Clone)]
pub struct OfflineAsrModuleConfig {
    pub model_id: String,
    pub sample_rate: u32,
}

impl Default for OfflineAsrModuleConfig {
    fn default() -> Self {
        Self {
            model_id: "sherpa-onnx-whisper-tiny.en".to_string(),
            sample_rate: 16000,
        }
    }
}

/// Whole-utterance recognizer bound to one model.
pub struct OfflineRecognitionModule {
    core: Arc<ModuleCore>,
    factory: Arc<dyn EngineFactory>,
    engine: Arc<Mutex<Option<Box<dyn OfflineRecognizer>>>>,
}

impl OfflineRecognitionModule {
    pub fn new(
        config: OfflineAsrModuleConfig,
        runtime: &RuntimeConfig,
        registry: Arc<ModelRegistry>,
        factory: Arc<dyn EngineFactory>,
        reporter: FeedbackReporter,
    ) -> RuntimeResult<Arc<Self>> {
        let core = Arc::new(ModuleCore::new(
            config.model_id.clone(),
            config.sample_rate,
            runtime,
            registry,
            reporter,
        )?);

        let module = Arc::new(Self {
            core: Arc::clone(&core),
            factory,
            engine: Arc::new(Mutex::new(None)),
        });

        let init_module = Arc::clone(&module);
        core.start(
            Arc::new(move |metadata, sample_rate, reporter, cancel| {
                let module = Arc::clone(&init_module);
                Box::pin(async move {
                    module
                        .initialize(&metadata, sample_rate, &reporter, &cancel)
                        .await
                })
            }),
            None,
        )?;

        Ok(module)
    }

    pub fn state(&self) -> ModuleState {
        self.core.state()
    }

    pub fn is_ready(&self) -> bool {
        self.core.is_ready()
    }

    /// Decode a complete utterance buffer into its transcript.
    pub async fn transcribe(&self, samples: &[f32]) -> RuntimeResult<String> {
        self.core.ensure_live()?;
        if samples.is_empty() {
            return Err(RuntimeError::Precondition("empty audio buffer".into()));
        }

        let engine = Arc::clone(&self.engine);
        let sample_rate = self.core.sample_rate();
        let samples = samples.to_vec();
        tokio::task::spawn_blocking(move || {
            let guard = engine.lock();
            let engine = guard.as_ref().ok_or_else(|| {
                RuntimeError::Precondition("offline ASR module is not ready".to_string())
            })?;
            engine.transcribe(sample_rate, &samples)
        })
        .await
        .map_err(|e| RuntimeError::NativeInit(format!("offline decode task: {e}")))?
    }

    pub async fn dispose(&self) {
        self.core.dispose(self).await;
    }
}

#[async_trait]
impl SpeechModule for OfflineRecognitionModule {
    async fn initialize(
        &self,
        metadata: &ModelMetadata,
        sample_rate: u32,
        _reporter: &FeedbackReporter,
        _cancel: &CancellationToken,
    ) -> RuntimeResult<()> {
        let engine_cfg = engine_config(metadata, sample_rate);
        let factory = Arc::clone(&self.factory);

        let engine = tokio::task::spawn_blocking(move || factory.open_asr_offline(&engine_cfg))
            .await
            .map_err(|e| RuntimeError::NativeInit(format!("offline asr open task: {e}")))?
            .map_err(|e| RuntimeError::NativeInit(e.to_string()))?;

        *self.engine.lock() = Some(engine);
        debug!(model_id = self.core.model_id(), "Offline recognizer loaded");
        Ok(())
    }

    fn on_destroy(&self) {
        *self.engine.lock() = None;
    }
}

impl Drop for OfflineRecognitionModule {
    fn drop(&mut self) {
        if !self.core.is_disposed() {
            self.core.dispose_sync(self);
        }
    }
}
