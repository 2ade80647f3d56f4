//! Text-to-speech module.
//!
//! Synthesis is an offline native call; it runs on a blocking thread with
//! the engine behind the module lock. Streamed chunks, when requested, are
//! forwarded through the caller's callback as the engine produces them.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::core::engine::{EngineFactory, GeneratedAudio, TtsEngine};
use crate::core::feedback::FeedbackReporter;
use crate::core::metadata::ModelMetadata;
use crate::core::module::{ModuleCore, ModuleState, SpeechModule};
use crate::core::modules::engine_config;
use crate::core::registry::ModelRegistry;
use crate::errors::{RuntimeError, RuntimeResult};

/// Configuration for a [`TtsModule`].
#[derive(Debug, Clone)]
pub struct TtsModuleConfig {
    pub model_id: String,
    pub sample_rate: u32,
}

impl Default for TtsModuleConfig {
    fn default() -> Self {
        Self {
            model_id: "vits-piper-en_US-amy-medium".to_string(),
            sample_rate: 22050,
        }
    }
}

/// Offline synthesizer bound to one voice model.
pub struct TtsModule {
    core: Arc<ModuleCore>,
    config: TtsModuleConfig,
    factory: Arc<dyn EngineFactory>,
    engine: Arc<Mutex<Option<Box<dyn TtsEngine>>>>,
}

impl TtsModule {
    pub fn new(
        config: TtsModuleConfig,
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
            config,
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

    /// Synthesize `text` at `speed` with the given voice.
    pub async fn generate(
        &self,
        text: &str,
        speed: f32,
        voice_id: i32,
    ) -> RuntimeResult<GeneratedAudio> {
        self.generate_with_chunks(text, speed, voice_id, None).await
    }

    /// Synthesize with an optional per-chunk callback for streamed playback.
    pub async fn generate_with_chunks(
        &self,
        text: &str,
        speed: f32,
        voice_id: i32,
        on_chunk: Option<Arc<dyn Fn(&[f32]) + Send + Sync>>,
    ) -> RuntimeResult<GeneratedAudio> {
        self.core.ensure_live()?;
        if text.trim().is_empty() {
            return Err(RuntimeError::Precondition("empty synthesis text".into()));
        }

        let engine = Arc::clone(&self.engine);
        let text = text.to_string();
        tokio::task::spawn_blocking(move || {
            let guard = engine.lock();
            let engine = guard.as_ref().ok_or_else(|| {
                RuntimeError::Precondition("TTS module is not ready".to_string())
            })?;
            match on_chunk {
                Some(callback) => {
                    let mut forward = |chunk: &[f32]| callback(chunk);
                    engine.generate(&text, speed, voice_id, Some(&mut forward))
                }
                None => engine.generate(&text, speed, voice_id, None),
            }
        })
        .await
        .map_err(|e| RuntimeError::NativeInit(format!("tts task: {e}")))?
    }

    pub async fn dispose(&self) {
        self.core.dispose(self).await;
    }
}

#[async_trait]
impl SpeechModule for TtsModule {
    async fn initialize(
        &self,
        metadata: &ModelMetadata,
        sample_rate: u32,
        _reporter: &FeedbackReporter,
        _cancel: &CancellationToken,
    ) -> RuntimeResult<()> {
        let engine_cfg = engine_config(metadata, sample_rate);
        let factory = Arc::clone(&self.factory);

        let engine = tokio::task::spawn_blocking(move || factory.open_tts(&engine_cfg))
            .await
            .map_err(|e| RuntimeError::NativeInit(format!("tts open task: {e}")))?
            .map_err(|e| RuntimeError::NativeInit(e.to_string()))?;

        *self.engine.lock() = Some(engine);
        debug!(model_id = self.core.model_id(), "TTS engine loaded");
        Ok(())
    }

    fn on_destroy(&self) {
        *self.engine.lock() = None;
    }
}

impl Drop for TtsModule {
    fn drop(&mut self) {
        if !self.core.is_disposed() {
            self.core.dispose_sync(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::modules::test_support::{materialize_model, sandbox};
    use std::time::Duration;
    use tempfile::tempdir;

    /// Emits one sample per input character, in two chunks.
    struct FakeTts {
        sample_rate: u32,
    }

    impl TtsEngine for FakeTts {
        fn generate(
            &self,
            text: &str,
            speed: f32,
            _voice_id: i32,
            mut on_chunk: Option<&mut dyn FnMut(&[f32])>,
        ) -> RuntimeResult<GeneratedAudio> {
            let count = ((text.len() as f32) / speed.max(0.1)).ceil() as usize;
            let samples = vec![0.25f32; count];
            if let Some(callback) = on_chunk.as_mut() {
                let half = count / 2;
                callback(&samples[..half]);
                callback(&samples[half..]);
            }
            Ok(GeneratedAudio {
                samples,
                sample_rate: self.sample_rate,
            })
        }
    }

    struct FakeFactory;

    impl EngineFactory for FakeFactory {
        fn open_online_asr(
            &self,
            _config: &crate::core::engine::EngineConfig,
        ) -> RuntimeResult<Box<dyn crate::core::engine::OnlineRecognizer>> {
            Err(RuntimeError::NativeInit("not supported".into()))
        }
        fn open_asr_offline(
            &self,
            _config: &crate::core::engine::EngineConfig,
        ) -> RuntimeResult<Box<dyn crate::core::engine::OfflineRecognizer>> {
            Err(RuntimeError::NativeInit("not supported".into()))
        }
        fn open_vad(
            &self,
            _config: &crate::core::engine::EngineConfig,
            _buffer_seconds: f32,
        ) -> RuntimeResult<Box<dyn crate::core::engine::VadEngine>> {
            Err(RuntimeError::NativeInit("not supported".into()))
        }
        fn open_kws(
            &self,
            _config: &crate::core::engine::EngineConfig,
        ) -> RuntimeResult<Box<dyn crate::core::engine::OnlineRecognizer>> {
            Err(RuntimeError::NativeInit("not supported".into()))
        }
        fn open_tts(
            &self,
            config: &crate::core::engine::EngineConfig,
        ) -> RuntimeResult<Box<dyn TtsEngine>> {
            Ok(Box::new(FakeTts {
                sample_rate: config.sample_rate,
            }))
        }
        fn open_denoiser(
            &self,
            _config: &crate::core::engine::EngineConfig,
        ) -> RuntimeResult<Box<dyn crate::core::engine::DenoiserEngine>> {
            Err(RuntimeError::NativeInit("not supported".into()))
        }
    }

    async fn ready_module(root: &std::path::Path) -> Arc<TtsModule> {
        let (config, registry) = sandbox(root);
        materialize_model(&registry, "vits-piper-en_US-amy-medium");
        let module = TtsModule::new(
            TtsModuleConfig::default(),
            &config,
            registry,
            Arc::new(FakeFactory),
            FeedbackReporter::discard(),
        )
        .unwrap();
        for _ in 0..200 {
            if module.is_ready() {
                return module;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("TTS module never became ready, state {:?}", module.state());
    }

    #[tokio::test]
    async fn test_generate_produces_audio() {
        let dir = tempdir().unwrap();
        let module = ready_module(dir.path()).await;

        let audio = module.generate("hello world", 1.0, 0).await.unwrap();
        assert_eq!(audio.num_samples(), 11);
        assert_eq!(audio.sample_rate, 22050);
        module.dispose().await;
    }

    #[tokio::test]
    async fn test_generate_with_chunk_callback() {
        let dir = tempdir().unwrap();
        let module = ready_module(dir.path()).await;

        let chunk_samples = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&chunk_samples);
        let audio = module
            .generate_with_chunks(
                "streaming synthesis",
                1.0,
                0,
                Some(Arc::new(move |chunk: &[f32]| {
                    *sink.lock() += chunk.len();
                })),
            )
            .await
            .unwrap();

        assert_eq!(*chunk_samples.lock(), audio.num_samples());
        module.dispose().await;
    }

    #[tokio::test]
    async fn test_empty_text_rejected() {
        let dir = tempdir().unwrap();
        let module = ready_module(dir.path()).await;
        assert!(matches!(
            module.generate("   ", 1.0, 0).await,
            Err(RuntimeError::Precondition(_))
        ));
        module.dispose().await;
    }

    #[tokio::test]
    async fn test_generate_after_dispose_fails() {
        let dir = tempdir().unwrap();
        let module = ready_module(dir.path()).await;
        module.dispose().await;
        assert!(matches!(
            module.generate("hello", 1.0, 0).await,
            Err(RuntimeError::Disposed)
        ));
    }
}
