//! Online speech-recognition module.
//!
//! Audio windows feed a native online stream; a periodic decode loop emits
//! partial results as they change and a final result whenever the
//! recognizer declares an endpoint, after which the stream resets for the
//! next utterance.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::core::engine::{EngineFactory, OnlineRecognizer, OnlineStream};
use crate::core::feedback::FeedbackReporter;
use crate::core::metadata::ModelMetadata;
use crate::core::module::{ModuleCore, ModuleState, SpeechModule};
use crate::core::modules::engine_config;
use crate::core::pipeline::WindowedQueue;
use crate::core::registry::ModelRegistry;
use crate::errors::{RuntimeError, RuntimeResult};

/// Recognition output events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// The in-progress hypothesis changed.
    Partial(String),
    /// The recognizer declared the utterance complete.
    Final(String),
}

pub type RecognitionEventFn = Arc<dyn Fn(RecognitionEvent) + Send + Sync>;

/// Configuration for a [`SpeechRecognitionModule`].
#[derive(Debug, Clone)]
pub struct AsrModuleConfig {
    pub model_id: String,
    pub sample_rate: u32,
    /// Samples handed to the stream per dispatch.
    pub window_size: usize,
    pub drain_interval: Duration,
}

impl Default for AsrModuleConfig {
    fn default() -> Self {
        Self {
            model_id: "sherpa-onnx-streaming-zipformer-en-20M-2023-02-17".to_string(),
            sample_rate: 16000,
            // 100 ms of audio per dispatch.
            window_size: 1600,
            drain_interval: Duration::from_millis(10),
        }
    }
}

struct AsrInner {
    intake: WindowedQueue,
    // Kept alive for the stream's lifetime.
    _recognizer: Box<dyn OnlineRecognizer>,
    stream: Box<dyn OnlineStream>,
    last_partial: String,
}

/// Streaming recognizer bound to one model.
pub struct SpeechRecognitionModule {
    core: Arc<ModuleCore>,
    config: AsrModuleConfig,
    factory: Arc<dyn EngineFactory>,
    on_event: RecognitionEventFn,
    inner: Arc<Mutex<Option<AsrInner>>>,
}

impl SpeechRecognitionModule {
    pub fn new(
        config: AsrModuleConfig,
        runtime: &RuntimeConfig,
        registry: Arc<ModelRegistry>,
        factory: Arc<dyn EngineFactory>,
        reporter: FeedbackReporter,
        on_event: RecognitionEventFn,
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
            on_event,
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

    /// Queue samples for recognition.
    pub fn stream_detect(&self, samples: &[f32]) -> RuntimeResult<()> {
        self.core.ensure_live()?;
        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or_else(|| {
            RuntimeError::Precondition(format!(
                "ASR module '{}' is not ready",
                self.core.model_id()
            ))
        })?;
        inner.intake.push(samples);
        Ok(())
    }

    /// Feed the remainder, decode everything and emit the final hypothesis.
    pub fn flush(&self) -> RuntimeResult<()> {
        self.core.ensure_live()?;
        let mut events = Vec::new();
        {
            let mut guard = self.inner.lock();
            let inner = guard.as_mut().ok_or_else(|| {
                RuntimeError::Precondition(format!(
                    "ASR module '{}' is not ready",
                    self.core.model_id()
                ))
            })?;

            drain_into_stream(inner, self.config.sample_rate, &mut events, true);
        }
        for event in events {
            (self.on_event)(event);
        }
        Ok(())
    }

    pub async fn dispose(&self) {
        self.core.dispose(self).await;
    }

    fn drain_once(
        inner: &Arc<Mutex<Option<AsrInner>>>,
        sample_rate: u32,
        on_event: &RecognitionEventFn,
    ) {
        let mut events = Vec::new();
        {
            let mut guard = inner.lock();
            let Some(inner) = guard.as_mut() else { return };
            drain_into_stream(inner, sample_rate, &mut events, false);
        }
        for event in events {
            on_event(event);
        }
    }
}

/// Window dispatch + decode + event derivation; runs under the module lock.
fn drain_into_stream(
    inner: &mut AsrInner,
    sample_rate: u32,
    events: &mut Vec<RecognitionEvent>,
    flush: bool,
) {
    while let Some(window) = inner.intake.pop_window() {
        inner.stream.accept_waveform(sample_rate, window);
    }
    if flush {
        let rest = inner.intake.take_remainder();
        if !rest.is_empty() {
            inner.stream.accept_waveform(sample_rate, &rest);
        }
    }

    while inner.stream.is_ready() {
        inner.stream.decode();
    }

    let text = inner.stream.result();
    if inner.stream.is_endpoint() || flush {
        if !text.is_empty() {
            events.push(RecognitionEvent::Final(text));
        }
        inner.stream.reset();
        inner.last_partial.clear();
    } else if !text.is_empty() && text != inner.last_partial {
        events.push(RecognitionEvent::Partial(text.clone()));
        inner.last_partial = text;
    }
}

#[async_trait]
impl SpeechModule for SpeechRecognitionModule {
    async fn initialize(
        &self,
        metadata: &ModelMetadata,
        sample_rate: u32,
        _reporter: &FeedbackReporter,
        cancel: &CancellationToken,
    ) -> RuntimeResult<()> {
        let engine_cfg = engine_config(metadata, sample_rate);
        let factory = Arc::clone(&self.factory);

        let recognizer = tokio::task::spawn_blocking(move || factory.open_online_asr(&engine_cfg))
            .await
            .map_err(|e| RuntimeError::NativeInit(format!("asr open task: {e}")))?
            .map_err(|e| RuntimeError::NativeInit(e.to_string()))?;
        let stream = recognizer.create_stream();

        *self.inner.lock() = Some(AsrInner {
            intake: WindowedQueue::new(self.config.window_size),
            _recognizer: recognizer,
            stream,
            last_partial: String::new(),
        });

        let inner = Arc::clone(&self.inner);
        let on_event = Arc::clone(&self.on_event);
        let rate = self.config.sample_rate;
        self.core.runner().loop_every(
            move |_| {
                let inner = Arc::clone(&inner);
                let on_event = Arc::clone(&on_event);
                async move {
                    Self::drain_once(&inner, rate, &on_event);
                    Ok(())
                }
            },
            self.config.drain_interval,
            None,
            Some(cancel.clone()),
        )?;

        debug!(model_id = self.core.model_id(), "ASR stream attached");
        Ok(())
    }

    fn on_destroy(&self) {
        *self.inner.lock() = None;
    }
}

impl Drop for SpeechRecognitionModule {
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
    use tempfile::tempdir;

    /// Fake recognizer: transcribes energy bursts as words, endpoints after
    /// sustained silence.
    struct FakeStream {
        buffered: usize,
        words: Vec<&'static str>,
        silent_run: usize,
        endpoint: bool,
        in_word: bool,
    }

    impl OnlineStream for FakeStream {
        fn accept_waveform(&mut self, _sample_rate: u32, samples: &[f32]) {
            let energy =
                samples.iter().map(|s| s.abs()).sum::<f32>() / samples.len().max(1) as f32;
            if energy > 0.1 {
                if !self.in_word {
                    self.in_word = true;
                    let next = ["hello", "world", "again"][self.words.len().min(2)];
                    self.words.push(next);
                }
                self.silent_run = 0;
            } else {
                self.in_word = false;
                self.silent_run += 1;
                if self.silent_run >= 3 && !self.words.is_empty() {
                    self.endpoint = true;
                }
            }
            self.buffered += samples.len();
        }
        fn is_ready(&self) -> bool {
            self.buffered > 0
        }
        fn decode(&mut self) {
            self.buffered = 0;
        }
        fn result(&self) -> String {
            self.words.join(" ")
        }
        fn is_endpoint(&self) -> bool {
            self.endpoint
        }
        fn reset(&mut self) {
            self.words.clear();
            self.endpoint = false;
            self.silent_run = 0;
            self.in_word = false;
        }
    }

    struct FakeRecognizer;

    impl OnlineRecognizer for FakeRecognizer {
        fn create_stream(&self) -> Box<dyn OnlineStream> {
            Box::new(FakeStream {
                buffered: 0,
                words: Vec::new(),
                silent_run: 0,
                endpoint: false,
                in_word: false,
            })
        }
    }

    struct FakeFactory;

    impl EngineFactory for FakeFactory {
        fn open_online_asr(
            &self,
            _config: &crate::core::engine::EngineConfig,
        ) -> RuntimeResult<Box<dyn OnlineRecognizer>> {
            Ok(Box::new(FakeRecognizer))
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
        ) -> RuntimeResult<Box<dyn OnlineRecognizer>> {
            Err(RuntimeError::NativeInit("not supported".into()))
        }
        fn open_tts(
            &self,
            _config: &crate::core::engine::EngineConfig,
        ) -> RuntimeResult<Box<dyn crate::core::engine::TtsEngine>> {
            Err(RuntimeError::NativeInit("not supported".into()))
        }
        fn open_denoiser(
            &self,
            _config: &crate::core::engine::EngineConfig,
        ) -> RuntimeResult<Box<dyn crate::core::engine::DenoiserEngine>> {
            Err(RuntimeError::NativeInit("not supported".into()))
        }
    }

    async fn wait_ready(module: &SpeechRecognitionModule) {
        for _ in 0..200 {
            if module.is_ready() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("module never became ready, state {:?}", module.state());
    }

    fn tone(samples: usize) -> Vec<f32> {
        (0..samples).map(|i| 0.8 * (i as f32 * 0.3).sin()).collect()
    }

    #[tokio::test]
    async fn test_partial_then_final_on_flush() {
        let dir = tempdir().unwrap();
        let (config, registry) = sandbox(dir.path());
        materialize_model(&registry, "sherpa-onnx-streaming-zipformer-en-20M-2023-02-17");

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let module = SpeechRecognitionModule::new(
            AsrModuleConfig::default(),
            &config,
            registry,
            Arc::new(FakeFactory),
            FeedbackReporter::discard(),
            Arc::new(move |event| sink.lock().push(event)),
        )
        .unwrap();
        wait_ready(&module).await;

        module.stream_detect(&tone(4800)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        module.flush().unwrap();

        let seen = events.lock().clone();
        assert!(seen
            .iter()
            .any(|e| matches!(e, RecognitionEvent::Partial(text) if text.contains("hello"))));
        assert!(seen
            .iter()
            .any(|e| matches!(e, RecognitionEvent::Final(_))));
        module.dispose().await;
    }

    #[tokio::test]
    async fn test_endpoint_emits_final_and_resets() {
        let dir = tempdir().unwrap();
        let (config, registry) = sandbox(dir.path());
        materialize_model(&registry, "sherpa-onnx-streaming-zipformer-en-20M-2023-02-17");

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let module = SpeechRecognitionModule::new(
            AsrModuleConfig::default(),
            &config,
            registry,
            Arc::new(FakeFactory),
            FeedbackReporter::discard(),
            Arc::new(move |event| sink.lock().push(event)),
        )
        .unwrap();
        wait_ready(&module).await;

        // A burst of speech followed by enough silent windows to endpoint.
        module.stream_detect(&tone(3200)).unwrap();
        module.stream_detect(&vec![0.0; 1600 * 4]).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let finals: Vec<_> = events
            .lock()
            .iter()
            .filter(|e| matches!(e, RecognitionEvent::Final(_)))
            .cloned()
            .collect();
        assert_eq!(finals.len(), 1);
        module.dispose().await;
    }
}
