//! Hosted backend client for the padel club app.
//!
//! Requests go through [`RequestExecutor`], which applies timeouts, retries
//! idempotent reads, classifies failures and reports them. Realtime changes
//! arrive through a [`RealtimeBus`]; [`RealtimeSubscriptionMonitor`] tracks
//! channel health and [`NotificationAggregator`] keeps navigation badge
//! counts fresh.

/// Notification badge aggregation.
pub mod aggregator;
pub mod endpoint;
/// Request execution over a pluggable HTTP transport.
pub mod executor;
/// Realtime channel health tracking.
pub mod monitor;
pub mod query;
/// Realtime change delivery.
pub mod realtime;
pub mod session;
pub mod source;

pub use aggregator::{
    AggregatorError, DEFAULT_DEBOUNCE, NotificationAggregator, NotificationSource, aggregate,
};
pub use endpoint::{EndpointError, ProjectEndpoint};
pub use executor::{
    DEFAULT_REQUEST_TIMEOUT, HttpTransport, OutboundRequest, RequestExecutor, RequestOptions,
    ReqwestTransport, TransportError, TransportResponse,
};
pub use monitor::RealtimeSubscriptionMonitor;
pub use query::{Query, parse_content_range};
pub use realtime::{
    LocalRealtimeBus, PhoenixConfig, PhoenixRealtimeBus, RealtimeBus, RealtimeError, Subscription,
};
pub use session::{AuthClient, AuthSession, AuthUser, SessionError, SessionStore};
pub use source::{NotificationTables, SupabaseNotificationSource};
