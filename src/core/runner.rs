//! Bounded, cancellable task supervisor.
//!
//! Every module owns one runner. Work acquires a permit from the runner's
//! semaphore and executes with a cancellation token linked to both the
//! runner's global token and the caller's; disposing the runner therefore
//! cancels every in-flight task. Completed tasks remove themselves from the
//! active set, with a periodic reaper as a safety net.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::core::feedback::{DeliveryContext, InlineContext};
use crate::errors::{RuntimeError, RuntimeResult};

/// Sweep interval for the leak-guard reaper.
const REAPER_INTERVAL: Duration = Duration::from_secs(30);

/// How long `dispose` waits for in-flight tasks to drain.
const DISPOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub type CompletionCallback = Box<dyn FnOnce(Option<RuntimeError>) + Send>;

/// Supervisor for a module's background work.
pub struct TaskRunner {
    semaphore: Arc<Semaphore>,
    global_cancel: CancellationToken,
    /// Registered before spawn (handle slot still empty), removed by the
    /// task itself on completion.
    active: Arc<Mutex<HashMap<u64, Option<JoinHandle<()>>>>>,
    next_id: AtomicU64,
    disposed: Arc<AtomicBool>,
    context: Arc<dyn DeliveryContext>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl TaskRunner {
    pub fn new(max_concurrent_tasks: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent_tasks.max(1))),
            global_cancel: CancellationToken::new(),
            active: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            disposed: Arc::new(AtomicBool::new(false)),
            context: Arc::new(InlineContext),
            reaper: Mutex::new(None),
        }
    }

    /// Completion callbacks are posted on `context` instead of running
    /// inline on the worker.
    pub fn with_context(mut self, context: Arc<dyn DeliveryContext>) -> Self {
        self.context = context;
        self
    }

    /// Token cancelled when the runner is disposed or `cancel_all` runs.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.global_cancel.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Run `work` once a permit is available.
    ///
    /// The work receives a token linked to the runner's global token and the
    /// caller's `cancel`; `on_complete` is posted on the delivery context
    /// with the work's error, if any.
    pub fn run<F, Fut>(
        &self,
        work: F,
        on_complete: Option<CompletionCallback>,
        cancel: Option<CancellationToken>,
    ) -> RuntimeResult<u64>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = RuntimeResult<()>> + Send + 'static,
    {
        if self.is_disposed() {
            return Err(RuntimeError::Disposed);
        }
        self.ensure_reaper();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let semaphore = Arc::clone(&self.semaphore);
        let active = Arc::clone(&self.active);
        let context = Arc::clone(&self.context);

        // Register before spawning so the task is visible to wait_for_all
        // even if it finishes before the handle is stored.
        self.active.lock().insert(id, None);

        let linked = match &cancel {
            Some(caller) => {
                let linked = self.global_cancel.child_token();
                let caller = caller.clone();
                let mirror = linked.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = caller.cancelled() => mirror.cancel(),
                        _ = mirror.cancelled() => {}
                    }
                });
                linked
            }
            None => self.global_cancel.child_token(),
        };

        let handle = tokio::spawn(async move {
            let result = async {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| RuntimeError::Cancelled)?;
                if linked.is_cancelled() {
                    return Err(RuntimeError::Cancelled);
                }
                work(linked.clone()).await
            }
            .await;

            if let Err(e) = &result {
                if e.is_cancellation() {
                    trace!(task = id, "Task cancelled");
                } else {
                    debug!(task = id, "Task failed: {e}");
                }
            }

            if let Some(callback) = on_complete {
                let error = result.err();
                context.post(Box::new(move || callback(error)));
            }

            active.lock().remove(&id);
        });

        if let Some(slot) = self.active.lock().get_mut(&id) {
            *slot = Some(handle);
        }
        Ok(id)
    }

    /// Run `work` repeatedly with `interval` between iterations until the
    /// linked token cancels.
    ///
    /// Non-cancellation errors are swallowed per iteration and handed to
    /// `on_iteration`.
    pub fn loop_every<F, Fut>(
        &self,
        mut work: F,
        interval: Duration,
        on_iteration: Option<Box<dyn FnMut(Option<RuntimeError>) + Send>>,
        cancel: Option<CancellationToken>,
    ) -> RuntimeResult<u64>
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = RuntimeResult<()>> + Send + 'static,
    {
        let mut on_iteration = on_iteration;
        self.run(
            move |token| async move {
                loop {
                    if token.is_cancelled() {
                        return Ok(());
                    }
                    let result = work(token.clone()).await;
                    match result {
                        Err(e) if e.is_cancellation() => return Ok(()),
                        Err(e) => {
                            if let Some(callback) = on_iteration.as_mut() {
                                callback(Some(e));
                            }
                        }
                        Ok(()) => {
                            if let Some(callback) = on_iteration.as_mut() {
                                callback(None);
                            }
                        }
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = token.cancelled() => return Ok(()),
                    }
                }
            },
            None,
            cancel,
        )
    }

    /// Cancel every task linked to this runner.
    pub fn cancel_all(&self) {
        self.global_cancel.cancel();
    }

    /// Wait until every active task has finished, up to `timeout`.
    ///
    /// Returns false when tasks were still running at the deadline.
    pub async fn wait_for_all(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.active.lock().is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Cancel everything, stop the reaper and drain briefly.
    ///
    /// Safe to call more than once; later calls are no-ops.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Disposing task runner ({} active)", self.active_count());
        self.global_cancel.cancel();

        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }

        if !self.wait_for_all(DISPOSE_DRAIN_TIMEOUT).await {
            warn!(
                "Task runner disposed with {} tasks still running",
                self.active_count()
            );
        }
        self.semaphore.close();
    }

    fn ensure_reaper(&self) {
        let mut slot = self.reaper.lock();
        if slot.is_some() {
            return;
        }
        let active = Arc::clone(&self.active);
        let cancel = self.global_cancel.clone();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAPER_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut map = active.lock();
                        let before = map.len();
                        map.retain(|_, handle| {
                            handle.as_ref().map(|h| !h.is_finished()).unwrap_or(true)
                        });
                        let swept = before - map.len();
                        if swept > 0 {
                            trace!(swept, "Reaper removed finished tasks");
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        }));
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        // Synchronous safety net: cancel and stop the reaper even when
        // dispose() was never awaited.
        self.global_cancel.cancel();
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_run_executes_and_self_removes() {
        let runner = TaskRunner::new(4);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        runner
            .run(
                move |_| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                None,
                None,
            )
            .unwrap();

        assert!(runner.wait_for_all(Duration::from_secs(1)).await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(runner.active_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_semaphore() {
        let runner = TaskRunner::new(2);
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let peak = Arc::clone(&peak);
            let current = Arc::clone(&current);
            runner
                .run(
                    move |_| async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    },
                    None,
                    None,
                )
                .unwrap();
        }

        assert!(runner.wait_for_all(Duration::from_secs(5)).await);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_on_complete_receives_error() {
        let runner = TaskRunner::new(1);
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);

        runner
            .run(
                |_| async { Err(RuntimeError::Network("boom".into())) },
                Some(Box::new(move |error| {
                    *sink.lock() = error.map(|e| e.to_string());
                })),
                None,
            )
            .unwrap();

        assert!(runner.wait_for_all(Duration::from_secs(1)).await);
        assert!(seen.lock().as_deref().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_caller_cancellation_links() {
        let runner = TaskRunner::new(1);
        let caller = CancellationToken::new();
        let finished_clean = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished_clean);

        runner
            .run(
                move |token| async move {
                    token.cancelled().await;
                    flag.store(true, Ordering::SeqCst);
                    Err(RuntimeError::Cancelled)
                },
                None,
                Some(caller.clone()),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        caller.cancel();
        assert!(runner.wait_for_all(Duration::from_secs(1)).await);
        assert!(finished_clean.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_loop_every_runs_until_cancelled() {
        let runner = TaskRunner::new(1);
        let iterations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&iterations);
        let cancel = CancellationToken::new();

        runner
            .loop_every(
                move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                Duration::from_millis(5),
                None,
                Some(cancel.clone()),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        assert!(runner.wait_for_all(Duration::from_secs(1)).await);
        assert!(iterations.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_loop_every_swallows_errors() {
        let runner = TaskRunner::new(1);
        let errors = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&errors);
        let cancel = CancellationToken::new();

        runner
            .loop_every(
                |_| async { Err(RuntimeError::Network("flaky".into())) },
                Duration::from_millis(5),
                Some(Box::new(move |error| {
                    if error.is_some() {
                        sink.fetch_add(1, Ordering::SeqCst);
                    }
                })),
                Some(cancel.clone()),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        cancel.cancel();
        assert!(runner.wait_for_all(Duration::from_secs(1)).await);
        assert!(errors.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_dispose_cancels_and_rejects_new_work() {
        let runner = TaskRunner::new(1);
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);

        runner
            .run(
                move |token| async move {
                    token.cancelled().await;
                    flag.store(true, Ordering::SeqCst);
                    Err(RuntimeError::Cancelled)
                },
                None,
                None,
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        runner.dispose().await;
        assert!(cancelled.load(Ordering::SeqCst));
        assert!(matches!(
            runner.run(|_| async { Ok(()) }, None, None),
            Err(RuntimeError::Disposed)
        ));

        // Idempotent.
        runner.dispose().await;
    }

    #[tokio::test]
    async fn test_wait_for_all_times_out() {
        let runner = TaskRunner::new(1);
        runner
            .run(
                |token| async move {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                        _ = token.cancelled() => {}
                    }
                    Ok(())
                },
                None,
                None,
            )
            .unwrap();

        assert!(!runner.wait_for_all(Duration::from_millis(50)).await);
        runner.cancel_all();
        assert!(runner.wait_for_all(Duration::from_secs(1)).await);
    }
}
