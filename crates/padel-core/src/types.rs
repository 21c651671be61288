use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;

/// Observable state of one async data controller.
#[derive(Debug, Clone, PartialEq)]
pub struct AsyncState<T> {
    /// Last successful result, if any.
    pub data: Option<T>,
    /// A first load (or user retry) is in flight.
    pub is_loading: bool,
    /// Final error of the last settled cycle.
    pub error: Option<AppError>,
    /// A background refresh is in flight; `data` stays visible meanwhile.
    pub is_refreshing: bool,
}

impl<T> AsyncState<T> {
    /// State of a controller that has just been created.
    pub fn loading() -> Self {
        Self {
            data: None,
            is_loading: true,
            error: None,
            is_refreshing: false,
        }
    }

    /// Whether no cycle is in flight.
    pub fn is_settled(&self) -> bool {
        !self.is_loading && !self.is_refreshing
    }
}

impl<T> Default for AsyncState<T> {
    fn default() -> Self {
        Self::loading()
    }
}

/// Badge counts shown in the navigation. Fields are private so `total`
/// always equals the sum of the parts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NotificationCounts {
    incoming_challenges: u64,
    scheduled_matches: u64,
    ladder_approvals: u64,
    total: u64,
}

impl NotificationCounts {
    pub fn new(incoming_challenges: u64, scheduled_matches: u64, ladder_approvals: u64) -> Self {
        Self {
            incoming_challenges,
            scheduled_matches,
            ladder_approvals,
            total: incoming_challenges
                .saturating_add(scheduled_matches)
                .saturating_add(ladder_approvals),
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn incoming_challenges(&self) -> u64 {
        self.incoming_challenges
    }

    pub fn scheduled_matches(&self) -> u64 {
        self.scheduled_matches
    }

    pub fn ladder_approvals(&self) -> u64 {
        self.ladder_approvals
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

/// Connection status of one realtime subscription.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RealtimeStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Health of a realtime subscription as seen by its monitor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RealtimeHealthState {
    pub status: RealtimeStatus,
    /// Number of disconnected -> connected transitions.
    pub reconnect_count: u32,
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl Default for RealtimeHealthState {
    fn default() -> Self {
        Self {
            status: RealtimeStatus::Connecting,
            reconnect_count: 0,
            last_connected_at: None,
        }
    }
}

/// Row-level change kinds delivered by the realtime service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum ChangeKind {
    #[default]
    #[serde(rename = "*")]
    All,
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "*",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    /// Parse a concrete change kind as sent on the wire.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "*" => Some(Self::All),
            "INSERT" => Some(Self::Insert),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Which changes a subscription wants to receive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChangeFilter {
    pub schema: String,
    pub table: String,
    pub event: ChangeKind,
}

impl ChangeFilter {
    /// All changes on `public.<table>`.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            schema: "public".to_owned(),
            table: table.into(),
            event: ChangeKind::All,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_event(mut self, event: ChangeKind) -> Self {
        self.event = event;
        self
    }

    pub fn matches(&self, change: &ChangePayload) -> bool {
        self.schema == change.schema
            && self.table == change.table
            && (self.event == ChangeKind::All || self.event == change.kind)
    }
}

impl fmt::Display for ChangeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.event.as_str(), self.schema, self.table)
    }
}

/// One row-level change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangePayload {
    pub schema: String,
    pub table: String,
    pub kind: ChangeKind,
    /// New row (empty object for deletes).
    pub record: Value,
    /// Previous row, as far as the replica identity exposes it.
    pub old_record: Value,
    pub commit_timestamp: Option<String>,
}

/// Lifecycle status reported by the subscription mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Subscribed,
    Closed,
    ChannelError(String),
    TimedOut,
}

/// Everything a subscription can deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeSignal {
    Status(SubscriptionStatus),
    Change(ChangePayload),
}

/// HTTP verbs used by the request executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    pub fn is_idempotent(self) -> bool {
        matches!(self, Self::Get | Self::Head)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime tuning shared by the data-layer components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTuning {
    /// Per-attempt timeout of a single network request.
    pub request_timeout_ms: u64,
    /// Attempts per async data controller cycle.
    pub controller_retry_count: u32,
    /// Base of the controller's linear backoff.
    pub controller_retry_delay_ms: u64,
    /// Per-attempt timeout inside a controller cycle.
    pub controller_timeout_ms: u64,
    /// Window in which notification refreshes collapse into one.
    pub notification_debounce_ms: u64,
    /// Delay before the single retry of a deferred module import.
    pub module_retry_delay_ms: u64,
}

impl ClientTuning {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn notification_debounce(&self) -> Duration {
        Duration::from_millis(self.notification_debounce_ms)
    }

    pub fn module_retry_delay(&self) -> Duration {
        Duration::from_millis(self.module_retry_delay_ms)
    }
}

impl Default for ClientTuning {
    fn default() -> Self {
        Self {
            request_timeout_ms: 15_000,
            controller_retry_count: 3,
            controller_retry_delay_ms: 1_000,
            controller_timeout_ms: 30_000,
            notification_debounce_ms: 500,
            module_retry_delay_ms: 1_500,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn total_is_sum_of_parts_for_many_combinations() {
        let samples = [0_u64, 1, 2, 7, 42, 999, 1_000_000];
        for a in samples {
            for b in samples {
                for c in samples {
                    let counts = NotificationCounts::new(a, b, c);
                    assert_eq!(counts.total(), a + b + c);
                    assert_eq!(counts.incoming_challenges(), a);
                    assert_eq!(counts.scheduled_matches(), b);
                    assert_eq!(counts.ladder_approvals(), c);
                }
            }
        }
    }

    #[test]
    fn total_saturates_instead_of_overflowing() {
        let counts = NotificationCounts::new(u64::MAX, 1, 1);
        assert_eq!(counts.total(), u64::MAX);
    }

    #[test]
    fn zero_counts_are_all_zero() {
        assert_eq!(NotificationCounts::zero(), NotificationCounts::new(0, 0, 0));
        assert_eq!(NotificationCounts::zero().total(), 0);
    }

    fn change(kind: ChangeKind) -> ChangePayload {
        ChangePayload {
            schema: "public".into(),
            table: "match_requests".into(),
            kind,
            record: json!({ "id": "r1" }),
            old_record: json!({}),
            commit_timestamp: None,
        }
    }

    #[test]
    fn wildcard_filter_matches_every_kind() {
        let filter = ChangeFilter::table("match_requests");
        assert!(filter.matches(&change(ChangeKind::Insert)));
        assert!(filter.matches(&change(ChangeKind::Delete)));
        assert!(!ChangeFilter::table("matches").matches(&change(ChangeKind::Insert)));
    }

    #[test]
    fn event_filter_only_matches_its_kind() {
        let filter = ChangeFilter::table("match_requests").with_event(ChangeKind::Update);
        assert!(filter.matches(&change(ChangeKind::Update)));
        assert!(!filter.matches(&change(ChangeKind::Insert)));
        assert!(
            !filter
                .clone()
                .with_schema("private")
                .matches(&change(ChangeKind::Update))
        );
    }

    #[test]
    fn parses_wire_change_kinds() {
        assert_eq!(ChangeKind::parse("insert"), Some(ChangeKind::Insert));
        assert_eq!(ChangeKind::parse("DELETE"), Some(ChangeKind::Delete));
        assert_eq!(ChangeKind::parse("TRUNCATE"), None);
    }

    #[test]
    fn new_async_state_is_loading() {
        let state = AsyncState::<u32>::default();
        assert!(state.is_loading);
        assert!(!state.is_refreshing);
        assert!(!state.is_settled());
    }
}
