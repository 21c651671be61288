//! Deferred module loading with a single delayed retry and a terminal fallback.

use std::{fmt::Display, future::Future, time::Duration};

use tokio::sync::OnceCell;
use tracing::{info, warn};

/// What the fallback view offers the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackAction {
    /// Reload the whole application, fetching fresh module chunks.
    FullReload,
}

/// Static view shown when a module cannot be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackView {
    pub module: String,
    pub title: &'static str,
    pub message: &'static str,
    pub action: FallbackAction,
}

impl FallbackView {
    fn for_module(module: &str) -> Self {
        Self {
            module: module.to_owned(),
            title: "This page could not be loaded",
            message: "A newer version may have been deployed. Reload to continue.",
            action: FallbackAction::FullReload,
        }
    }
}

/// Result of a deferred load. Never an error: failures end in a fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Loaded<M> {
    Module(M),
    Fallback(FallbackView),
}

impl<M> Loaded<M> {
    pub fn module(&self) -> Option<&M> {
        match self {
            Self::Module(module) => Some(module),
            Self::Fallback(_) => None,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredModuleLoader {
    retry_delay: Duration,
}

impl DeferredModuleLoader {
    pub fn new(retry_delay: Duration) -> Self {
        Self { retry_delay }
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Import a module: one direct attempt, then exactly one retry after the
    /// fixed delay, then the fallback view.
    pub async fn load<M, E, F, Fut>(&self, module: &str, mut import: F) -> Loaded<M>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<M, E>>,
        E: Display,
    {
        match import().await {
            Ok(loaded) => return Loaded::Module(loaded),
            Err(err) => warn!(
                module,
                retry_in_ms = self.retry_delay.as_millis() as u64,
                error = %err,
                "module import failed; retrying once"
            ),
        }

        tokio::time::sleep(self.retry_delay).await;

        match import().await {
            Ok(loaded) => {
                info!(module, "module import succeeded on retry");
                Loaded::Module(loaded)
            }
            Err(err) => {
                warn!(module, error = %err, "module import failed twice; showing fallback");
                Loaded::Fallback(FallbackView::for_module(module))
            }
        }
    }
}

impl Default for DeferredModuleLoader {
    fn default() -> Self {
        Self::new(Duration::from_millis(1_500))
    }
}

/// A route module loaded at most once per process.
pub struct LazyModule<M, F> {
    name: String,
    loader: DeferredModuleLoader,
    import: F,
    cell: OnceCell<Loaded<M>>,
}

impl<M, E, F, Fut> LazyModule<M, F>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<M, E>>,
    E: Display,
{
    pub fn new(name: impl Into<String>, loader: DeferredModuleLoader, import: F) -> Self {
        Self {
            name: name.into(),
            loader,
            import,
            cell: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Load on first use; later calls return the memoized outcome.
    pub async fn get(&self) -> &Loaded<M> {
        self.cell
            .get_or_init(|| self.loader.load(&self.name, &self.import))
            .await
    }

    /// Forget the memoized outcome so the next `get` imports again.
    pub fn reset(&mut self) {
        self.cell = OnceCell::new();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use tokio::time::Instant;

    use super::*;

    fn failing_until(
        succeed_on: u32,
        calls: Arc<AtomicU32>,
    ) -> impl Fn() -> std::future::Ready<Result<&'static str, String>> {
        move || {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if call >= succeed_on {
                Ok("ladder page")
            } else {
                Err(format!("chunk load failed ({call})"))
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn two_rejections_resolve_to_fallback() {
        let calls = Arc::new(AtomicU32::new(0));
        let loader = DeferredModuleLoader::default();

        let loaded = loader
            .load("ladder", failing_until(u32::MAX, Arc::clone(&calls)))
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        match loaded {
            Loaded::Fallback(view) => {
                assert_eq!(view.module, "ladder");
                assert_eq!(view.action, FallbackAction::FullReload);
            }
            other => panic!("expected fallback, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_rejection_then_module_after_fixed_delay() {
        let calls = Arc::new(AtomicU32::new(0));
        let loader = DeferredModuleLoader::new(Duration::from_millis(1_500));
        let started = Instant::now();

        let loaded = loader
            .load("ladder", failing_until(2, Arc::clone(&calls)))
            .await;

        assert_eq!(loaded, Loaded::Module("ladder page"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), Duration::from_millis(1_500));
    }

    #[tokio::test(start_paused = true)]
    async fn direct_success_does_not_wait() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();
        let loaded = DeferredModuleLoader::default()
            .load("ladder", failing_until(1, Arc::clone(&calls)))
            .await;

        assert_eq!(loaded.module(), Some(&"ladder page"));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn lazy_module_imports_once_until_reset() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut module = LazyModule::new(
            "americano",
            DeferredModuleLoader::default(),
            failing_until(1, Arc::clone(&calls)),
        );

        assert!(!module.get().await.is_fallback());
        assert!(!module.get().await.is_fallback());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        module.reset();
        module.get().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(module.name(), "americano");
    }
}
