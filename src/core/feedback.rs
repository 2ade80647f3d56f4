//! Typed acquisition feedback delivered to observers.
//!
//! Producers report progress through a [`FeedbackReporter`], built either
//! from a plain callback or from a [`FeedbackHandler`] with per-variant
//! hooks. Events are posted on the delivery context captured at construction
//! and never block the producer; a panicking observer is logged, not
//! propagated.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use crate::core::metadata::ModelMetadata;

/// Fields shared by every feedback variant.
#[derive(Debug, Clone)]
pub struct FeedbackBase {
    pub metadata: ModelMetadata,
    pub message: String,
    pub error: Option<String>,
}

impl FeedbackBase {
    pub fn new(metadata: &ModelMetadata, message: impl Into<String>) -> Self {
        Self {
            metadata: metadata.clone(),
            message: message.into(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Feedback event taxonomy for the acquisition pipeline.
#[derive(Debug, Clone)]
pub enum ModelFeedback {
    Prepare(FeedbackBase),
    Load(FeedbackBase),
    Success(FeedbackBase),
    Cancel(FeedbackBase),
    Failed(FeedbackBase),
    Clean {
        base: FeedbackBase,
        file_path: String,
    },
    Verify {
        base: FeedbackBase,
        file_path: String,
        progress: f32,
        calculated_hash: Option<String>,
        expected_hash: Option<String>,
    },
    Extract {
        base: FeedbackBase,
        file_path: String,
        progress: f32,
    },
    Download {
        base: FeedbackBase,
        url: String,
        progress: f32,
        downloaded_bytes: u64,
        total_bytes: u64,
        speed_bytes_per_second: f64,
        estimated_remaining: Option<Duration>,
    },
}

impl ModelFeedback {
    pub fn base(&self) -> &FeedbackBase {
        match self {
            ModelFeedback::Prepare(base)
            | ModelFeedback::Load(base)
            | ModelFeedback::Success(base)
            | ModelFeedback::Cancel(base)
            | ModelFeedback::Failed(base) => base,
            ModelFeedback::Clean { base, .. }
            | ModelFeedback::Verify { base, .. }
            | ModelFeedback::Extract { base, .. }
            | ModelFeedback::Download { base, .. } => base,
        }
    }

    /// Short variant name, used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            ModelFeedback::Prepare(_) => "prepare",
            ModelFeedback::Load(_) => "load",
            ModelFeedback::Success(_) => "success",
            ModelFeedback::Cancel(_) => "cancel",
            ModelFeedback::Failed(_) => "failed",
            ModelFeedback::Clean { .. } => "clean",
            ModelFeedback::Verify { .. } => "verify",
            ModelFeedback::Extract { .. } => "extract",
            ModelFeedback::Download { .. } => "download",
        }
    }
}

/// Observer with per-variant hooks; implement only what you need.
///
/// `handle` dispatches to the typed hooks by default; override it to match
/// on the event directly.
pub trait FeedbackHandler: Send + Sync {
    fn handle(&self, event: &ModelFeedback) {
        match event {
            ModelFeedback::Prepare(base) => self.on_prepare(base),
            ModelFeedback::Load(base) => self.on_load(base),
            ModelFeedback::Success(base) => self.on_success(base),
            ModelFeedback::Cancel(base) => self.on_cancel(base),
            ModelFeedback::Failed(base) => self.on_failed(base),
            ModelFeedback::Clean { base, file_path } => self.on_clean(base, file_path),
            ModelFeedback::Verify {
                base,
                file_path,
                progress,
                ..
            } => self.on_verify(base, file_path, *progress),
            ModelFeedback::Extract {
                base,
                file_path,
                progress,
            } => self.on_extract(base, file_path, *progress),
            ModelFeedback::Download {
                base,
                url,
                progress,
                ..
            } => self.on_download(base, url, *progress),
        }
    }

    fn on_prepare(&self, _base: &FeedbackBase) {}
    fn on_load(&self, _base: &FeedbackBase) {}
    fn on_success(&self, _base: &FeedbackBase) {}
    fn on_cancel(&self, _base: &FeedbackBase) {}
    fn on_failed(&self, _base: &FeedbackBase) {}
    fn on_clean(&self, _base: &FeedbackBase, _file_path: &str) {}
    fn on_verify(&self, _base: &FeedbackBase, _file_path: &str, _progress: f32) {}
    fn on_extract(&self, _base: &FeedbackBase, _file_path: &str, _progress: f32) {}
    fn on_download(&self, _base: &FeedbackBase, _url: &str, _progress: f32) {}
}

/// Scheduling target for observer callbacks.
pub trait DeliveryContext: Send + Sync {
    fn post(&self, task: Box<dyn FnOnce() + Send>);
}

/// Runs callbacks immediately on the reporting thread.
pub struct InlineContext;

impl DeliveryContext for InlineContext {
    fn post(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}

/// Marshals callbacks onto a dedicated tokio task, preserving order without
/// ever blocking the producer.
pub struct ChannelContext {
    sender: mpsc::UnboundedSender<Box<dyn FnOnce() + Send>>,
}

impl ChannelContext {
    /// Spawn the drain task on the current runtime.
    pub fn spawn() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Box<dyn FnOnce() + Send>>();
        tokio::spawn(async move {
            while let Some(task) = receiver.recv().await {
                task();
            }
        });
        Self { sender }
    }
}

impl DeliveryContext for ChannelContext {
    fn post(&self, task: Box<dyn FnOnce() + Send>) {
        // Receiver gone means the runtime is shutting down; drop silently.
        let _ = self.sender.send(task);
    }
}

type Callback = Arc<dyn Fn(&ModelFeedback) + Send + Sync>;

enum Sink {
    Callback(Callback),
    Handler(Arc<dyn FeedbackHandler>),
    Discard,
}

/// Posts [`ModelFeedback`] events to one observer on a delivery context.
#[derive(Clone)]
pub struct FeedbackReporter {
    sink: Arc<Sink>,
    context: Arc<dyn DeliveryContext>,
}

impl FeedbackReporter {
    pub fn from_callback(callback: impl Fn(&ModelFeedback) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(Sink::Callback(Arc::new(callback))),
            context: Arc::new(InlineContext),
        }
    }

    pub fn from_handler(handler: Arc<dyn FeedbackHandler>) -> Self {
        Self {
            sink: Arc::new(Sink::Handler(handler)),
            context: Arc::new(InlineContext),
        }
    }

    /// A reporter that drops every event.
    pub fn discard() -> Self {
        Self {
            sink: Arc::new(Sink::Discard),
            context: Arc::new(InlineContext),
        }
    }

    /// Replace the delivery context (e.g. marshal onto a main-thread sink).
    pub fn with_context(mut self, context: Arc<dyn DeliveryContext>) -> Self {
        self.context = context;
        self
    }

    /// Post one event. Observer panics are caught and logged.
    pub fn report(&self, event: ModelFeedback) {
        if matches!(*self.sink, Sink::Discard) {
            return;
        }
        let sink = Arc::clone(&self.sink);
        self.context.post(Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(|| match &*sink {
                Sink::Callback(callback) => callback(&event),
                Sink::Handler(handler) => handler.handle(&event),
                Sink::Discard => {}
            }));
            if result.is_err() {
                warn!(kind = event.kind(), "Feedback observer panicked");
            }
        }));
    }
}
