use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use padel_core::{ChangeFilter, ChangePayload, RealtimeSignal, SubscriptionStatus};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::{RealtimeBus, RealtimeError, Subscription};

const SIGNAL_BUFFER: usize = 256;

struct Subscriber {
    id: u64,
    channel: String,
    filter: ChangeFilter,
    tx: mpsc::Sender<RealtimeSignal>,
}

#[derive(Default)]
struct BusState {
    next_id: u64,
    subscribers: Vec<Subscriber>,
    subscribes: HashMap<String, u32>,
    releases: HashMap<String, u32>,
    rejection: Option<String>,
}

/// In-process bus. Changes published here reach every live subscription whose
/// filter matches; statuses are addressed by channel name.
#[derive(Clone, Default)]
pub struct LocalRealtimeBus {
    state: Arc<Mutex<BusState>>,
    auto_ack: bool,
}

impl LocalRealtimeBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acknowledge every new subscription with `Subscribed` right away.
    pub fn with_auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    /// Make subsequent subscribe calls fail with `reason`, or succeed again.
    pub fn reject_subscriptions(&self, reason: Option<&str>) {
        self.lock().rejection = reason.map(str::to_owned);
    }

    /// Returns how many subscriptions received the change.
    pub fn publish(&self, change: ChangePayload) -> usize {
        let state = self.lock();
        let mut delivered = 0;
        for subscriber in state
            .subscribers
            .iter()
            .filter(|subscriber| subscriber.filter.matches(&change))
        {
            if deliver(subscriber, RealtimeSignal::Change(change.clone())) {
                delivered += 1;
            }
        }
        debug!(table = %change.table, delivered, "local change published");
        delivered
    }

    pub fn emit_status(&self, channel: &str, status: SubscriptionStatus) -> usize {
        let state = self.lock();
        state
            .subscribers
            .iter()
            .filter(|subscriber| subscriber.channel == channel)
            .map(|subscriber| deliver(subscriber, RealtimeSignal::Status(status.clone())))
            .filter(|delivered| *delivered)
            .count()
    }

    pub fn subscribe_count(&self, channel: &str) -> u32 {
        self.lock().subscribes.get(channel).copied().unwrap_or(0)
    }

    pub fn release_count(&self, channel: &str) -> u32 {
        self.lock().releases.get(channel).copied().unwrap_or(0)
    }

    pub fn active_count(&self, channel: &str) -> usize {
        self.lock()
            .subscribers
            .iter()
            .filter(|subscriber| subscriber.channel == channel)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn deliver(subscriber: &Subscriber, signal: RealtimeSignal) -> bool {
    match subscriber.tx.try_send(signal) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(channel = %subscriber.channel, "subscriber lagging; signal dropped");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

#[async_trait]
impl RealtimeBus for LocalRealtimeBus {
    async fn subscribe(
        &self,
        channel: &str,
        filter: &ChangeFilter,
    ) -> Result<Subscription, RealtimeError> {
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        let id = {
            let mut state = self.lock();
            *state.subscribes.entry(channel.to_owned()).or_default() += 1;
            if let Some(reason) = state.rejection.clone() {
                return Err(RealtimeError::Rejected {
                    channel: channel.to_owned(),
                    reason,
                });
            }
            let id = state.next_id;
            state.next_id += 1;
            if self.auto_ack {
                // Fresh channel with spare capacity; this cannot fail.
                let _ = tx.try_send(RealtimeSignal::Status(SubscriptionStatus::Subscribed));
            }
            state.subscribers.push(Subscriber {
                id,
                channel: channel.to_owned(),
                filter: filter.clone(),
                tx,
            });
            id
        };
        debug!(channel, filter = %filter, id, "local subscription opened");

        let state = Arc::clone(&self.state);
        let released_channel = channel.to_owned();
        Ok(Subscription::new(channel, rx, move || {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            state.subscribers.retain(|subscriber| subscriber.id != id);
            *state.releases.entry(released_channel).or_default() += 1;
        }))
    }
}
