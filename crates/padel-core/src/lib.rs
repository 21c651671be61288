//! Core data-layer contract shared by the Supabase runtime and UI consumers.
//!
//! This crate defines error classification, retry policies, the async data
//! controller, realtime health bookkeeping, change fan-in and deferred module
//! loading. Nothing here performs network I/O.

/// Change fan-in channel primitives.
pub mod channel;
/// Retrying async data controller.
pub mod controller;
/// Stable application error types and classification helpers.
pub mod error;
/// Deferred module loading with a fallback view.
pub mod loader;
/// Backoff policies used by retry loops.
pub mod retry;
/// Realtime subscription health state machine.
pub mod state_machine;
/// Shared data types (state snapshots, counts, realtime payloads, tuning).
pub mod types;

pub use channel::{ChangeFeed, ChangeFeedError, ChangeProducer, ChangeReceiver, RelationChange};
pub use controller::{AsyncDataController, ControllerOptions};
pub use error::{AppError, AppErrorCode, RawFailure, classify, classify_http_status};
pub use loader::{DeferredModuleLoader, FallbackAction, FallbackView, LazyModule, Loaded};
pub use retry::{LinearBackoff, RetryPolicy, attempts_for_method};
pub use state_machine::RealtimeHealthMachine;
pub use types::{
    AsyncState, ChangeFilter, ChangeKind, ChangePayload, ClientTuning, HttpMethod,
    NotificationCounts, RealtimeHealthState, RealtimeSignal, RealtimeStatus, SubscriptionStatus,
};
