//! Streaming audio plumbing shared by VAD, keyword spotting and online ASR.
//!
//! Producers push samples through [`VoicePipeline::stream_detect`] from any
//! thread; a periodic drain on the module's task runner feeds whole windows
//! to the native engine through a reusable buffer, emits completed speech
//! segments with their leading padding, and derives the speaking state with
//! silent-frame hysteresis. Everything that touches the engine runs under
//! one pipeline lock, and every critical section checks the disposed flag
//! first.

pub mod padding_ring;
pub mod windowed;

pub use padding_ring::PaddingRing;
pub use windowed::WindowedQueue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::core::engine::VadEngine;
use crate::core::runner::TaskRunner;
use crate::errors::{RuntimeError, RuntimeResult};

/// Default interval of the periodic drain loop.
pub const DRAIN_INTERVAL: Duration = Duration::from_millis(10);

/// Pipeline geometry and detection thresholds.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Samples handed to the engine per dispatch (512 for Silero at 16 kHz,
    /// 3200 for keyword spotting).
    pub window_size: usize,
    pub sample_rate: u32,
    /// Seconds of pre-speech audio prepended to each segment.
    pub padding_seconds: f32,
    /// Continuous silence required before the speaking state drops.
    pub min_silence_seconds: f32,
    pub drain_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_size: 512,
            sample_rate: 16000,
            padding_seconds: 0.2,
            min_silence_seconds: 0.3,
            drain_interval: DRAIN_INTERVAL,
        }
    }
}

impl PipelineConfig {
    /// Silent windows required before `is_speaking` drops.
    pub fn silence_window_threshold(&self) -> usize {
        let frames =
            (self.min_silence_seconds * self.sample_rate as f32) / self.window_size as f32;
        frames.ceil().max(1.0) as usize
    }
}

/// Events emitted by the pipeline.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// The derived speaking state flipped.
    SpeakingStateChanged(bool),
    /// A completed speech segment: leading padding followed by the engine's
    /// samples, materialised exactly once.
    SpeechSegmentDetected(Vec<f32>),
}

pub type PipelineEventFn = Arc<dyn Fn(PipelineEvent) + Send + Sync>;

struct PipelineInner {
    intake: WindowedQueue,
    ring: PaddingRing,
    engine: Box<dyn VadEngine>,
    is_speaking: bool,
    silent_windows: usize,
}

/// Intake queue, window dispatch, padding ring and segment emission for one
/// module.
pub struct VoicePipeline {
    config: PipelineConfig,
    inner: Mutex<PipelineInner>,
    disposed: AtomicBool,
    on_event: PipelineEventFn,
}

impl VoicePipeline {
    pub fn new(engine: Box<dyn VadEngine>, config: PipelineConfig, on_event: PipelineEventFn) -> Self {
        let ring = PaddingRing::new(PaddingRing::capacity_for(
            config.padding_seconds,
            config.sample_rate,
        ));
        Self {
            inner: Mutex::new(PipelineInner {
                intake: WindowedQueue::new(config.window_size),
                ring,
                engine,
                is_speaking: false,
                silent_windows: 0,
            }),
            config,
            disposed: AtomicBool::new(false),
            on_event,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Queue samples for detection. Callable from any thread.
    pub fn stream_detect(&self, samples: &[f32]) -> RuntimeResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(RuntimeError::Disposed);
        }
        let mut inner = self.inner.lock();
        if self.disposed.load(Ordering::Acquire) {
            return Err(RuntimeError::Disposed);
        }
        inner.intake.push(samples);
        Ok(())
    }

    /// Start the periodic drain on `runner`.
    pub fn attach(
        self: &Arc<Self>,
        runner: &TaskRunner,
        cancel: Option<CancellationToken>,
    ) -> RuntimeResult<()> {
        let pipeline = Arc::clone(self);
        runner.loop_every(
            move |_| {
                let pipeline = Arc::clone(&pipeline);
                async move {
                    pipeline.drain_once();
                    Ok(())
                }
            },
            self.config.drain_interval,
            None,
            cancel,
        )?;
        Ok(())
    }

    /// Dispatch every complete window currently queued.
    ///
    /// Partial windows stay queued until more samples arrive or `flush` is
    /// called.
    pub fn drain_once(&self) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            if self.disposed.load(Ordering::Acquire) {
                return;
            }
            while inner.intake.has_window() {
                self.dispatch_window(&mut inner, &mut events);
            }
        }
        for event in events {
            (self.on_event)(event);
        }
    }

    /// Feed one window through the engine and derive events.
    fn dispatch_window(&self, inner: &mut PipelineInner, events: &mut Vec<PipelineEvent>) {
        let PipelineInner {
            intake,
            ring,
            engine,
            is_speaking,
            ..
        } = inner;
        let Some(window) = intake.pop_window() else {
            return;
        };

        engine.accept_waveform(window);

        // Pre-speech audio feeds the padding ring.
        if !*is_speaking {
            ring.push_slice(window);
        }

        self.derive_state(inner, events);
        self.emit_segments(inner, events);
    }

    /// Speaking-state hysteresis: rise immediately, fall only after enough
    /// silent windows.
    fn derive_state(&self, inner: &mut PipelineInner, events: &mut Vec<PipelineEvent>) {
        let detected = inner.engine.is_speech_detected();
        if detected {
            inner.silent_windows = 0;
            if !inner.is_speaking {
                inner.is_speaking = true;
                debug!("Speaking state: true");
                events.push(PipelineEvent::SpeakingStateChanged(true));
            }
        } else if inner.is_speaking {
            inner.silent_windows += 1;
            if inner.silent_windows >= self.config.silence_window_threshold() {
                inner.is_speaking = false;
                inner.silent_windows = 0;
                debug!("Speaking state: false");
                events.push(PipelineEvent::SpeakingStateChanged(false));
            }
        }
    }

    /// Drain the engine's completed-segment queue.
    fn emit_segments(&self, inner: &mut PipelineInner, events: &mut Vec<PipelineEvent>) {
        while !inner.engine.is_empty() {
            let Some(samples) = inner.engine.front() else {
                break;
            };
            inner.engine.pop();

            let padding = inner.ring.take();
            let mut segment = Vec::with_capacity(padding.len() + samples.len());
            segment.extend_from_slice(&padding);
            segment.extend_from_slice(&samples);
            trace!(
                padding = padding.len(),
                body = samples.len(),
                "Emitting speech segment"
            );
            events.push(PipelineEvent::SpeechSegmentDetected(segment));
        }
    }

    /// Push everything through the engine and reset the speaking state.
    pub fn flush(&self) -> RuntimeResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(RuntimeError::Disposed);
        }
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            if self.disposed.load(Ordering::Acquire) {
                return Err(RuntimeError::Disposed);
            }

            while inner.intake.has_window() {
                self.dispatch_window(&mut inner, &mut events);
            }
            // Remaining partial window goes straight to the engine.
            let rest = inner.intake.take_remainder();
            if !rest.is_empty() {
                inner.engine.accept_waveform(&rest);
                if !inner.is_speaking {
                    inner.ring.push_slice(&rest);
                }
            }

            inner.engine.flush();
            self.emit_segments(&mut inner, &mut events);

            if inner.is_speaking {
                inner.is_speaking = false;
                events.push(PipelineEvent::SpeakingStateChanged(false));
            }
            inner.silent_windows = 0;
        }
        for event in events {
            (self.on_event)(event);
        }
        Ok(())
    }

    /// Stop accepting and processing samples.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        // Taking the lock guarantees no drain is mid-dispatch when we return.
        let _guard = self.inner.lock();
    }

    pub fn is_speaking(&self) -> bool {
        self.inner.lock().is_speaking
    }

    /// Samples queued but not yet dispatched.
    pub fn queued(&self) -> usize {
        self.inner.lock().intake.queued()
    }

    /// `(submitted, dispatched)` sample counters; `submitted - dispatched`
    /// always equals the queue length.
    pub fn counters(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.intake.submitted(), inner.intake.dispatched())
    }

    /// Current padding-ring fill, for diagnostics.
    pub fn padding_len(&self) -> usize {
        self.inner.lock().ring.len()
    }
}
