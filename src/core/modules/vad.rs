//! Voice-activity-detection module.
//!
//! Streams producer audio through the [`VoicePipeline`]: windows go to the
//! native detector, completed segments come back with their leading padding,
//! and the speaking state is derived with silence hysteresis.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::core::engine::EngineFactory;
use crate::core::feedback::FeedbackReporter;
use crate::core::metadata::ModelMetadata;
use crate::core::module::{ModuleCore, ModuleState, SpeechModule};
use crate::core::modules::engine_config;
use crate::core::pipeline::{PipelineConfig, PipelineEvent, PipelineEventFn, VoicePipeline};
use crate::core::registry::ModelRegistry;
use crate::errors::{RuntimeError, RuntimeResult};

/// Configuration for a [`VadModule`].
#[derive(Debug, Clone)]
pub struct VadModuleConfig {
    pub model_id: String,
    pub pipeline: PipelineConfig,
    /// Seconds of audio the native detector buffers internally.
    pub buffer_seconds: f32,
}

impl Default for VadModuleConfig {
    fn default() -> Self {
        Self {
            model_id: "silero-vad-v5".to_string(),
            pipeline: PipelineConfig::default(),
            buffer_seconds: 60.0,
        }
    }
}

/// Streaming voice-activity detector bound to one model.
pub struct VadModule {
    core: Arc<ModuleCore>,
    config: VadModuleConfig,
    factory: Arc<dyn EngineFactory>,
    on_event: PipelineEventFn,
    pipeline: Mutex<Option<Arc<VoicePipeline>>>,
}

impl VadModule {
    /// Construct the module and start acquisition in the background.
    ///
    /// `on_event` receives [`PipelineEvent`]s once the module is ready.
    pub fn new(
        config: VadModuleConfig,
        runtime: &RuntimeConfig,
        registry: Arc<ModelRegistry>,
        factory: Arc<dyn EngineFactory>,
        reporter: FeedbackReporter,
        on_event: PipelineEventFn,
    ) -> RuntimeResult<Arc<Self>> {
        let core = Arc::new(ModuleCore::new(
            config.model_id.clone(),
            config.pipeline.sample_rate,
            runtime,
            registry,
            reporter,
        )?);

        let module = Arc::new(Self {
            core: Arc::clone(&core),
            config,
            factory,
            on_event,
            pipeline: Mutex::new(None),
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

    /// Queue samples for detection; callable from any thread.
    pub fn stream_detect(&self, samples: &[f32]) -> RuntimeResult<()> {
        self.core.ensure_live()?;
        self.pipeline_handle()?.stream_detect(samples)
    }

    /// Push all buffered audio through the detector and emit what remains.
    pub fn flush(&self) -> RuntimeResult<()> {
        self.core.ensure_live()?;
        self.pipeline_handle()?.flush()
    }

    pub fn is_speaking(&self) -> bool {
        self.pipeline
            .lock()
            .as_ref()
            .map(|p| p.is_speaking())
            .unwrap_or(false)
    }

    pub async fn dispose(&self) {
        self.core.dispose(self).await;
    }

    fn pipeline_handle(&self) -> RuntimeResult<Arc<VoicePipeline>> {
        self.pipeline.lock().clone().ok_or_else(|| {
            RuntimeError::Precondition(format!(
                "VAD module '{}' is not ready",
                self.core.model_id()
            ))
        })
    }
}

#[async_trait]
impl SpeechModule for VadModule {
    async fn initialize(
        &self,
        metadata: &ModelMetadata,
        sample_rate: u32,
        _reporter: &FeedbackReporter,
        cancel: &CancellationToken,
    ) -> RuntimeResult<()> {
        let engine_cfg = engine_config(metadata, sample_rate);
        let buffer_seconds = self.config.buffer_seconds;
        let factory = Arc::clone(&self.factory);

        // Opening the native detector can be slow; keep it off the runtime.
        let engine = tokio::task::spawn_blocking(move || factory.open_vad(&engine_cfg, buffer_seconds))
            .await
            .map_err(|e| RuntimeError::NativeInit(format!("vad open task: {e}")))?
            .map_err(|e| RuntimeError::NativeInit(e.to_string()))?;

        let on_event = Arc::clone(&self.on_event);
        let pipeline = Arc::new(VoicePipeline::new(
            engine,
            self.config.pipeline.clone(),
            Arc::new(move |event: PipelineEvent| on_event(event)),
        ));
        pipeline.attach(self.core.runner(), Some(cancel.clone()))?;

        *self.pipeline.lock() = Some(pipeline);
        debug!(model_id = self.core.model_id(), "VAD pipeline attached");
        Ok(())
    }

    fn on_destroy(&self) {
        if let Some(pipeline) = self.pipeline.lock().take() {
            pipeline.dispose();
        }
    }
}

impl Drop for VadModule {
    fn drop(&mut self) {
        if !self.core.is_disposed() {
            self.core.dispose_sync(self);
        }
    }
}
