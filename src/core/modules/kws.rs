//! Keyword-spotting module.
//!
//! Windows of 3200 samples stream through a native spotter; a non-empty
//! decode result is a keyword hit, after which the stream resets so the same
//! keyword can fire again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RuntimeConfig;
use crate::core::engine::{EngineFactory, OnlineRecognizer, OnlineStream};
use crate::core::feedback::FeedbackReporter;
use crate::core::metadata::ModelMetadata;
use crate::core::module::{ModuleCore, ModuleState, SpeechModule};
use crate::core::modules::engine_config;
use crate::core::pipeline::WindowedQueue;
use crate::core::registry::ModelRegistry;
use crate::errors::{RuntimeError, RuntimeResult};

pub type KeywordEventFn = Arc<dyn Fn(String) + Send + Sync>;

/// Configuration for a [`KeywordSpotterModule`].
#[derive(Debug, Clone)]
pub struct KwsModuleConfig {
    pub model_id: String,
    pub sample_rate: u32,
    pub window_size: usize,
    pub drain_interval: Duration,
}

impl Default for KwsModuleConfig {
    fn default() -> Self {
        Self {
            model_id: "sherpa-onnx-kws-zipformer-gigaspeech-3.3M-2024-01-01".to_string(),
            sample_rate: 16000,
            window_size: 3200,
            drain_interval: Duration::from_millis(10),
        }
    }
}

struct KwsInner {
    intake: WindowedQueue,
    _spotter: Box<dyn OnlineRecognizer>,
    stream: Box<dyn OnlineStream>,
}

/// Streaming keyword spotter bound to one model.
pub struct KeywordSpotterModule {
    core: Arc<ModuleCore>,
    config: KwsModuleConfig,
    factory: Arc<dyn EngineFactory>,
    on_keyword: KeywordEventFn,
    inner: Arc<Mutex<Option<KwsInner>>>,
}

impl KeywordSpotterModule {
    pub fn new(
        config: KwsModuleConfig,
        runtime: &RuntimeConfig,
        registry: Arc<ModelRegistry>,
        factory: Arc<dyn EngineFactory>,
        reporter: FeedbackReporter,
        on_keyword: KeywordEventFn,
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
            config,
            factory,
            on_keyword,
            inner: Arc::new(Mutex::new(None)),
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

    /// Queue samples for spotting.
    pub fn stream_detect(&self, samples: &[f32]) -> RuntimeResult<()> {
        self.core.ensure_live()?;
        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or_else(|| {
            RuntimeError::Precondition(format!(
                "KWS module '{}' is not ready",
                self.core.model_id()
            ))
        })?;
        inner.intake.push(samples);
        Ok(())
    }

    pub async fn dispose(&self) {
        self.core.dispose(self).await;
    }

    fn drain_once(inner: &Arc<Mutex<Option<KwsInner>>>, sample_rate: u32, on_keyword: &KeywordEventFn) {
        let mut hits = Vec::new();
        {
            let mut guard = inner.lock();
            let Some(inner) = guard.as_mut() else { return };

            while let Some(window) = inner.intake.pop_window() {
                inner.stream.accept_waveform(sample_rate, window);
            }
            while inner.stream.is_ready() {
                inner.stream.decode();
                let keyword = inner.stream.result();
                if !keyword.is_empty() {
                    // A hit; reset so the stream can spot the next one.
                    inner.stream.reset();
                    hits.push(keyword);
                }
            }
        }
        for keyword in hits {
            info!(%keyword, "Keyword detected");
            on_keyword(keyword);
        }
    }
}

#[async_trait]
impl SpeechModule for KeywordSpotterModule {
    async fn initialize(
        &self,
        metadata: &ModelMetadata,
        sample_rate: u32,
        _reporter: &FeedbackReporter,
        cancel: &CancellationToken,
    ) -> RuntimeResult<()> {
        let engine_cfg = engine_config(metadata, sample_rate);
        let factory = Arc::clone(&self.factory);

        let spotter = tokio::task::spawn_blocking(move || factory.open_kws(&engine_cfg))
            .await
            .map_err(|e| RuntimeError::NativeInit(format!("kws open task: {e}")))?
            .map_err(|e| RuntimeError::NativeInit(e.to_string()))?;
        let stream = spotter.create_stream();

        *self.inner.lock() = Some(KwsInner {
            intake: WindowedQueue::new(self.config.window_size),
            _spotter: spotter,
            stream,
        });

        let inner = Arc::clone(&self.inner);
        let on_keyword = Arc::clone(&self.on_keyword);
        let rate = self.config.sample_rate;
        self.core.runner().loop_every(
            move |_| {
                let inner = Arc::clone(&inner);
                let on_keyword = Arc::clone(&on_keyword);
                async move {
                    Self::drain_once(&inner, rate, &on_keyword);
                    Ok(())
                }
            },
            self.config.drain_interval,
            None,
            Some(cancel.clone()),
        )?;

        debug!(model_id = self.core.model_id(), "KWS stream attached");
        Ok(())
    }

    fn on_destroy(&self) {
        *self.inner.lock() = None;
    }
}

impl Drop for KeywordSpotterModule {
    fn drop(&mut self) {
        if !self.core.is_disposed() {
            self.core.dispose_sync(self);
        }
    }
}
