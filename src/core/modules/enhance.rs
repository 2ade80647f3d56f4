//! Speech-enhancement module.
//!
//! Wraps an offline denoiser: whole buffers in, cleaned buffers out, on a
//! blocking thread.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::core::engine::{DenoiserEngine, EngineFactory};
use crate::core::feedback::FeedbackReporter;
use crate::core::metadata::ModelMetadata;
use crate::core::module::{ModuleCore, ModuleState, SpeechModule};
use crate::core::modules::engine_config;
use crate::core::registry::ModelRegistry;
use crate::errors::{RuntimeError, RuntimeResult};

/// Configuration for an [`EnhancementModule`].
#[derive(Debug, Clone)]
pub struct EnhanceModuleConfig {
    pub model_id: String,
    pub sample_rate: u32,
}

impl Default for EnhanceModuleConfig {
    fn default() -> Self {
        Self {
            model_id: "gtcrn-simple".to_string(),
            sample_rate: 16000,
        }
    }
}

/// Offline denoiser bound to one model.
pub struct EnhancementModule {
    core: Arc<ModuleCore>,
    factory: Arc<dyn EngineFactory>,
    engine: Arc<Mutex<Option<Box<dyn DenoiserEngine>>>>,
}

impl EnhancementModule {
    pub fn new(
        config: EnhanceModuleConfig,
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

    /// Run the denoiser over a full buffer.
    pub async fn run(&self, samples: &[f32]) -> RuntimeResult<Vec<f32>> {
        self.core.ensure_live()?;
        let engine = Arc::clone(&self.engine);
        let sample_rate = self.core.sample_rate();
        let samples = samples.to_vec();
        tokio::task::spawn_blocking(move || {
            let guard = engine.lock();
            let engine = guard.as_ref().ok_or_else(|| {
                RuntimeError::Precondition("enhancement module is not ready".to_string())
            })?;
            engine.run(&samples, sample_rate)
        })
        .await
        .map_err(|e| RuntimeError::NativeInit(format!("denoise task: {e}")))?
    }

    pub async fn dispose(&self) {
        self.core.dispose(self).await;
    }
}

#[async_trait]
impl SpeechModule for EnhancementModule {
    async fn initialize(
        &self,
        metadata: &ModelMetadata,
        sample_rate: u32,
        _reporter: &FeedbackReporter,
        _cancel: &CancellationToken,
    ) -> RuntimeResult<()> {
        let engine_cfg = engine_config(metadata, sample_rate);
        let factory = Arc::clone(&self.factory);

        let engine = tokio::task::spawn_blocking(move || factory.open_denoiser(&engine_cfg))
            .await
            .map_err(|e| RuntimeError::NativeInit(format!("denoiser open task: {e}")))?
            .map_err(|e| RuntimeError::NativeInit(e.to_string()))?;

        *self.engine.lock() = Some(engine);
        debug!(model_id = self.core.model_id(), "Denoiser loaded");
        Ok(())
    }

    fn on_destroy(&self) {
        *self.engine.lock() = None;
    }
}

impl Drop for EnhancementModule {
    fn drop(&mut self) {
        if !self.core.is_disposed() {
            self.core.dispose_sync(self);
        }
    }
}
