//! Realtime change delivery: the bus seam, subscriptions and bus backends.

mod local;
mod phoenix;

use std::fmt;

use async_trait::async_trait;
use padel_core::{ChangeFilter, RealtimeSignal};
use thiserror::Error;
use tokio::sync::mpsc;

pub use local::LocalRealtimeBus;
pub use phoenix::{PhoenixConfig, PhoenixRealtimeBus};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RealtimeError {
    #[error("realtime bus rejected subscription to '{channel}': {reason}")]
    Rejected { channel: String, reason: String },
    #[error("realtime bus is shut down")]
    Closed,
}

/// Source of change subscriptions.
#[async_trait]
pub trait RealtimeBus: Send + Sync {
    async fn subscribe(
        &self,
        channel: &str,
        filter: &ChangeFilter,
    ) -> Result<Subscription, RealtimeError>;
}

type ReleaseFn = Box<dyn FnOnce() + Send + 'static>;

/// One open subscription. Signals arrive in order; the underlying resource is
/// released exactly once, on `release` or drop, whichever comes first.
pub struct Subscription {
    channel: String,
    signals: mpsc::Receiver<RealtimeSignal>,
    release: Option<ReleaseFn>,
}

impl Subscription {
    pub fn new<F>(
        channel: impl Into<String>,
        signals: mpsc::Receiver<RealtimeSignal>,
        release: F,
    ) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            channel: channel.into(),
            signals,
            release: Some(Box::new(release)),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next signal, or `None` once the bus side has gone away.
    pub async fn next(&mut self) -> Option<RealtimeSignal> {
        self.signals.recv().await
    }

    pub fn is_released(&self) -> bool {
        self.release.is_none()
    }

    pub fn release(&mut self) {
        if let Some(release) = self.release.take() {
            self.signals.close();
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;

    #[test]
    fn release_runs_once_across_release_and_drop() {
        let releases = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&releases);
        let (_tx, rx) = mpsc::channel(1);
        let mut subscription = Subscription::new("ladder", rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        subscription.release();
        subscription.release();
        assert!(subscription.is_released());
        drop(subscription);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_releases() {
        let releases = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&releases);
        let (_tx, rx) = mpsc::channel(1);
        drop(Subscription::new("ladder", rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }
}
