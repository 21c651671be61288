use chrono::{DateTime, Utc};

use crate::types::{RealtimeHealthState, RealtimeStatus, SubscriptionStatus};

/// Health bookkeeping for one realtime subscription.
///
/// Status follows the lifecycle signals of the subscription mechanism. The
/// reconnect counter only moves on a disconnected -> connected transition.
#[derive(Debug, Clone, Default)]
pub struct RealtimeHealthMachine {
    state: RealtimeHealthState,
}

impl RealtimeHealthMachine {
    pub fn state(&self) -> &RealtimeHealthState {
        &self.state
    }

    pub fn status(&self) -> RealtimeStatus {
        self.state.status
    }

    /// Apply a lifecycle signal, returning `true` when the health changed.
    pub fn apply(&mut self, signal: &SubscriptionStatus, now: DateTime<Utc>) -> bool {
        match signal {
            SubscriptionStatus::Subscribed => self.on_connected(now),
            SubscriptionStatus::Closed => self.set_status(RealtimeStatus::Disconnected),
            SubscriptionStatus::ChannelError(_) | SubscriptionStatus::TimedOut => {
                self.on_error()
            }
        }
    }

    /// Record that the subscription could not be opened at all.
    pub fn on_error(&mut self) -> bool {
        self.set_status(RealtimeStatus::Error)
    }

    fn on_connected(&mut self, now: DateTime<Utc>) -> bool {
        if self.state.status == RealtimeStatus::Disconnected {
            self.state.reconnect_count = self.state.reconnect_count.saturating_add(1);
        }
        self.state.status = RealtimeStatus::Connected;
        self.state.last_connected_at = Some(now);
        true
    }

    fn set_status(&mut self, next: RealtimeStatus) -> bool {
        if self.state.status == next {
            return false;
        }
        self.state.status = next;
        true
    }
}
