//! Shared lifecycle for every speech module.
//!
//! A module is constructed, acquires its model in the background, builds the
//! native engine, streams in the steady state and tears down exactly once.
//! [`ModuleCore`] owns that sequence as a value: it holds the task runner,
//! the reporter and the disposal latch, and modules delegate to it instead
//! of inheriting.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::core::acquire::ModelAcquirer;
use crate::core::feedback::{FeedbackBase, FeedbackReporter, ModelFeedback};
use crate::core::metadata::ModelMetadata;
use crate::core::registry::ModelRegistry;
use crate::core::runner::TaskRunner;
use crate::errors::{RuntimeError, RuntimeResult};

/// Lifecycle states of a module; transitions are monotone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ModuleState {
    Constructing,
    Acquiring,
    Loading,
    Ready,
    Failed,
    Disposing,
    Disposed,
}

/// Capability surface every speech module exposes.
#[async_trait]
pub trait SpeechModule: Send + Sync {
    /// Build the native engine once the model files are on disk.
    async fn initialize(
        &self,
        metadata: &ModelMetadata,
        sample_rate: u32,
        reporter: &FeedbackReporter,
        cancel: &CancellationToken,
    ) -> RuntimeResult<()>;

    /// Release native resources; called exactly once during disposal.
    fn on_destroy(&self);
}

/// Engine-construction hook used when a module prefers a closure over
/// implementing [`SpeechModule`] directly.
pub type InitFn = Arc<
    dyn Fn(ModelMetadata, u32, FeedbackReporter, CancellationToken) -> BoxFuture<'static, RuntimeResult<()>>
        + Send
        + Sync,
>;

/// Owns acquisition, the runner and the disposal latch for one module.
pub struct ModuleCore {
    model_id: String,
    sample_rate: u32,
    runner: Arc<TaskRunner>,
    reporter: FeedbackReporter,
    acquirer: Arc<ModelAcquirer>,
    registry: Arc<ModelRegistry>,
    state: Mutex<ModuleState>,
    disposed: Mutex<bool>,
}

impl ModuleCore {
    pub fn new(
        model_id: impl Into<String>,
        sample_rate: u32,
        config: &RuntimeConfig,
        registry: Arc<ModelRegistry>,
        reporter: FeedbackReporter,
    ) -> RuntimeResult<Self> {
        Ok(Self {
            model_id: model_id.into(),
            sample_rate,
            runner: Arc::new(TaskRunner::new(config.max_concurrent_tasks)),
            reporter,
            acquirer: Arc::new(ModelAcquirer::new(config)?),
            registry,
            state: Mutex::new(ModuleState::Constructing),
            disposed: Mutex::new(false),
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn state(&self) -> ModuleState {
        *self.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ModuleState::Ready
    }

    pub fn is_disposed(&self) -> bool {
        *self.disposed.lock()
    }

    pub fn runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    pub fn reporter(&self) -> &FeedbackReporter {
        &self.reporter
    }

    /// Advance the state machine; regressions are ignored and logged.
    fn advance(&self, to: ModuleState) {
        let mut state = self.state.lock();
        if to > *state {
            debug!(model_id = %self.model_id, from = ?*state, ?to, "Module state");
            *state = to;
        } else if to != *state {
            warn!(model_id = %self.model_id, from = ?*state, ?to, "Ignoring state regression");
        }
    }

    /// Start acquisition and engine construction in the background.
    ///
    /// Resolves the metadata, runs the acquirer, then invokes `init`. The
    /// acquirer's `Success` is withheld and re-emitted only after `init`
    /// completes, so observers see exactly one terminal event for the whole
    /// path.
    pub fn start(self: &Arc<Self>, init: InitFn, cancel: Option<CancellationToken>) -> RuntimeResult<()> {
        let core = Arc::clone(self);
        self.runner.run(
            move |token| async move {
                core.advance(ModuleState::Acquiring);

                let Some(metadata) = core.registry.get(&core.model_id) else {
                    core.advance(ModuleState::Failed);
                    core.reporter.report(ModelFeedback::Failed(
                        FeedbackBase::new(
                            &placeholder_metadata(&core.model_id),
                            format!("Model '{}' not found in registry", core.model_id),
                        )
                        .with_error("unknown model id"),
                    ));
                    return Ok(());
                };

                // Hold back the acquirer's Success until the engine loads.
                let held_success: Arc<Mutex<Option<ModelFeedback>>> = Arc::new(Mutex::new(None));
                let inner = core.reporter.clone();
                let held = Arc::clone(&held_success);
                let filtered = FeedbackReporter::from_callback(move |event| {
                    if matches!(event, ModelFeedback::Success(_)) {
                        *held.lock() = Some(event.clone());
                    } else {
                        inner.report(event.clone());
                    }
                });

                let acquired = core
                    .acquirer
                    .prepare_model(&metadata, &filtered, &token)
                    .await;

                if token.is_cancelled() {
                    // The acquirer already reported Cancel.
                    return Ok(());
                }
                if !acquired {
                    core.advance(ModuleState::Failed);
                    return Ok(());
                }

                core.advance(ModuleState::Loading);
                core.reporter.report(ModelFeedback::Load(FeedbackBase::new(
                    &metadata,
                    format!("Loading engine for '{}'", core.model_id),
                )));

                match init(
                    metadata.clone(),
                    core.sample_rate,
                    core.reporter.clone(),
                    token.clone(),
                )
                .await
                {
                    Ok(()) => {
                        core.advance(ModuleState::Ready);
                        if let Some(success) = held_success.lock().take() {
                            core.reporter.report(success);
                        } else {
                            core.reporter.report(ModelFeedback::Success(FeedbackBase::new(
                                &metadata,
                                format!("Module '{}' ready", core.model_id),
                            )));
                        }
                        info!(model_id = %core.model_id, "Module ready");
                    }
                    Err(e) if e.is_cancellation() => {
                        core.reporter.report(ModelFeedback::Cancel(FeedbackBase::new(
                            &metadata,
                            format!("Engine load for '{}' cancelled", core.model_id),
                        )));
                    }
                    Err(e) => {
                        core.advance(ModuleState::Failed);
                        core.reporter.report(ModelFeedback::Failed(
                            FeedbackBase::new(
                                &metadata,
                                format!("Engine load for '{}' failed", core.model_id),
                            )
                            .with_error(e.to_string()),
                        ));
                    }
                }
                Ok(())
            },
            None,
            cancel,
        )?;
        Ok(())
    }

    /// Tear the module down exactly once.
    ///
    /// Cancels and drains the runner, then calls `on_destroy`. Concurrent
    /// callers converge on the first invocation; later calls are no-ops.
    pub async fn dispose(&self, module: &dyn SpeechModule) {
        {
            let mut disposed = self.disposed.lock();
            if *disposed {
                return;
            }
            *disposed = true;
        }
        self.advance(ModuleState::Disposing);
        self.runner.dispose().await;
        module.on_destroy();
        self.advance(ModuleState::Disposed);
        info!(model_id = %self.model_id, "Module disposed");
    }

    /// Synchronous disposal safety net for `Drop` implementations.
    ///
    /// Cancels in-flight work immediately; native teardown still happens via
    /// `on_destroy` by the caller.
    pub fn dispose_sync(&self, module: &dyn SpeechModule) {
        {
            let mut disposed = self.disposed.lock();
            if *disposed {
                return;
            }
            *disposed = true;
        }
        self.advance(ModuleState::Disposing);
        self.runner.cancel_all();
        module.on_destroy();
        self.advance(ModuleState::Disposed);
    }

    /// Guard for steady-state operations.
    pub fn ensure_live(&self) -> RuntimeResult<()> {
        if self.is_disposed() {
            Err(RuntimeError::Disposed)
        } else {
            Ok(())
        }
    }
}

/// Metadata stand-in for events reported before registry resolution.
fn placeholder_metadata(model_id: &str) -> ModelMetadata {
    ModelMetadata {
        model_id: model_id.to_string(),
        module_kind: crate::core::metadata::ModuleKind::SpeechRecognition,
        download_url: String::new(),
        download_file_hash: None,
        model_file_names: vec![String::new()],
        model_file_hashes: vec![],
    }
}
