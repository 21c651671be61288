//! Retrying async data controller with loading/refresh/error state.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, trace, warn};

use crate::{
    error::{AppError, AppErrorCode},
    retry::LinearBackoff,
    types::{AsyncState, ClientTuning},
};

type FetchFuture<T> = Pin<Box<dyn Future<Output = Result<T, AppError>> + Send + 'static>>;
type FetchFn<K, T> = Arc<dyn Fn(K) -> FetchFuture<T> + Send + Sync + 'static>;

/// Retry and timeout settings of one controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerOptions {
    /// Attempts per cycle, the first one included.
    pub retry_count: u32,
    /// Base of the linear backoff between attempts.
    pub retry_delay: Duration,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Keep the last good `data` when a cycle finally fails.
    pub preserve_stale_data: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_delay: Duration::from_millis(1_000),
            timeout: Duration::from_millis(30_000),
            preserve_stale_data: false,
        }
    }
}

impl From<&ClientTuning> for ControllerOptions {
    fn from(tuning: &ClientTuning) -> Self {
        Self {
            retry_count: tuning.controller_retry_count,
            retry_delay: Duration::from_millis(tuning.controller_retry_delay_ms),
            timeout: Duration::from_millis(tuning.controller_timeout_ms),
            preserve_stale_data: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleKind {
    Load,
    Refresh,
}

struct Shared<T> {
    state: watch::Sender<AsyncState<T>>,
    alive: AtomicBool,
    generation: AtomicU64,
}

impl<T> Shared<T> {
    /// Start a new cycle under the state lock and return its generation.
    fn begin(&self, kind: CycleKind) -> Option<u64> {
        let mut generation = None;
        self.state.send_if_modified(|state| {
            if !self.alive.load(Ordering::Acquire) {
                return false;
            }
            generation = Some(self.generation.fetch_add(1, Ordering::AcqRel) + 1);
            state.error = None;
            state.is_loading = kind == CycleKind::Load;
            state.is_refreshing = kind == CycleKind::Refresh;
            true
        });
        generation
    }

    /// Apply `update` if the controller is alive and `generation` is current.
    fn write(&self, generation: u64, update: impl FnOnce(&mut AsyncState<T>)) -> bool {
        self.state.send_if_modified(|state| {
            if !self.is_current(generation) {
                return false;
            }
            update(state);
            true
        })
    }

    fn is_current(&self, generation: u64) -> bool {
        self.alive.load(Ordering::Acquire) && self.generation.load(Ordering::Acquire) == generation
    }

    /// Flip the liveness flag while holding the state lock, so no write can
    /// interleave with teardown.
    fn close(&self) {
        self.state.send_if_modified(|_| {
            self.alive.store(false, Ordering::Release);
            false
        });
    }
}

/// Wraps a fetch operation with loading/refresh/error state, bounded retries
/// with linear backoff, and teardown-safe state writes.
///
/// Each cycle has a generation number. Starting a new cycle (key change,
/// [`refetch`](Self::refetch), [`retry`](Self::retry)) supersedes the previous
/// one: its task is aborted and any write it still attempts is discarded.
pub struct AsyncDataController<K, T> {
    shared: Arc<Shared<T>>,
    fetch: FetchFn<K, T>,
    key: K,
    options: ControllerOptions,
    task: Option<JoinHandle<()>>,
}

impl<K, T> AsyncDataController<K, T>
where
    K: Clone + PartialEq + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    /// Create the controller and immediately start the first load cycle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(fetch: F, key: K, options: ControllerOptions) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, AppError>> + Send + 'static,
    {
        let (state, _) = watch::channel(AsyncState::loading());
        let fetch: FetchFn<K, T> =
            Arc::new(move |key| -> FetchFuture<T> { Box::pin(fetch(key)) });
        let mut controller = Self {
            shared: Arc::new(Shared {
                state,
                alive: AtomicBool::new(true),
                generation: AtomicU64::new(0),
            }),
            fetch,
            key,
            options,
            task: None,
        };
        controller.start(CycleKind::Load);
        controller
    }

    /// Current state snapshot.
    pub fn state(&self) -> AsyncState<T>
    where
        T: Clone,
    {
        self.shared.state.borrow().clone()
    }

    /// Receiver notified on every state write.
    pub fn subscribe(&self) -> watch::Receiver<AsyncState<T>> {
        self.shared.state.subscribe()
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Switch the dependency key; a different key starts a fresh load cycle.
    pub fn set_key(&mut self, key: K) {
        if self.key == key {
            return;
        }
        self.key = key;
        self.start(CycleKind::Load);
    }

    /// Re-run the fetch in the background, keeping current data visible.
    pub fn refetch(&mut self) {
        self.start(CycleKind::Refresh);
    }

    /// Re-run the fetch as a foreground load (retry affordance).
    pub fn retry(&mut self) {
        self.start(CycleKind::Load);
    }

    /// Stop all state writes and abandon the in-flight cycle. Idempotent.
    pub fn teardown(&mut self) {
        if !self.is_alive() {
            return;
        }
        self.shared.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        trace!("async data controller torn down");
    }

    fn start(&mut self, kind: CycleKind) {
        if let Some(previous) = self.task.take() {
            previous.abort();
        }
        let Some(generation) = self.shared.begin(kind) else {
            return;
        };

        let shared = Arc::clone(&self.shared);
        let fetch = Arc::clone(&self.fetch);
        let key = self.key.clone();
        let options = self.options;
        self.task = Some(tokio::spawn(async move {
            run_cycle(shared, fetch, key, options, generation).await;
        }));
    }
}

impl<K, T> Drop for AsyncDataController<K, T> {
    fn drop(&mut self) {
        self.shared.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_cycle<K, T>(
    shared: Arc<Shared<T>>,
    fetch: FetchFn<K, T>,
    key: K,
    options: ControllerOptions,
    generation: u64,
) where
    K: Clone,
{
    let backoff = LinearBackoff::new(options.retry_count, options.retry_delay);
    let mut attempt: u32 = 1;

    loop {
        let outcome = match tokio::time::timeout(options.timeout, fetch(key.clone())).await {
            Ok(result) => result,
            Err(_) => Err(AppError::new(
                AppErrorCode::Timeout,
                format!("fetch timed out after {}ms", options.timeout.as_millis()),
            )),
        };

        let err = match outcome {
            Ok(data) => {
                shared.write(generation, |state| {
                    state.data = Some(data);
                    state.error = None;
                    state.is_loading = false;
                    state.is_refreshing = false;
                });
                return;
            }
            Err(err) => err,
        };

        match backoff.delay_after(attempt) {
            Some(delay) => {
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "fetch attempt failed; backing off"
                );
                if !shared.is_current(generation) {
                    return;
                }
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            None => {
                warn!(attempts = attempt, error = %err, "fetch failed after exhausting retries");
                let preserve = options.preserve_stale_data;
                shared.write(generation, |state| {
                    if !preserve {
                        state.data = None;
                    }
                    state.error = Some(err);
                    state.is_loading = false;
                    state.is_refreshing = false;
                });
                return;
            }
        }
    }
}
