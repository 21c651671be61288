//! Health monitor around one realtime subscription.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use chrono::Utc;
use padel_core::{
    ChangeFilter, ChangePayload, RealtimeHealthMachine, RealtimeHealthState, RealtimeSignal,
    SubscriptionStatus,
};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::realtime::RealtimeBus;

type PayloadFn = Arc<dyn Fn(ChangePayload) + Send + Sync + 'static>;

/// Health cell shared with the running task. Writes from a retired task are
/// rejected under the watch lock.
struct HealthCell {
    tx: watch::Sender<RealtimeHealthState>,
    generation: AtomicU64,
}

impl HealthCell {
    fn restart(&self) -> u64 {
        let mut generation = 0;
        self.tx.send_modify(|state| {
            generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *state = RealtimeHealthState::default();
        });
        generation
    }

    fn retire(&self) {
        self.tx.send_if_modified(|_| {
            self.generation.fetch_add(1, Ordering::SeqCst);
            false
        });
    }

    fn publish(&self, generation: u64, next: &RealtimeHealthState) -> bool {
        self.tx.send_if_modified(|state| {
            if self.generation.load(Ordering::SeqCst) != generation || state == next {
                return false;
            }
            *state = next.clone();
            true
        })
    }
}

pub struct RealtimeSubscriptionMonitor {
    bus: Arc<dyn RealtimeBus>,
    channel: String,
    filter: ChangeFilter,
    on_payload: PayloadFn,
    health: Arc<HealthCell>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RealtimeSubscriptionMonitor {
    pub fn spawn<F>(
        bus: Arc<dyn RealtimeBus>,
        channel: impl Into<String>,
        filter: ChangeFilter,
        on_payload: F,
    ) -> Self
    where
        F: Fn(ChangePayload) + Send + Sync + 'static,
    {
        let (tx, _rx) = watch::channel(RealtimeHealthState::default());
        let mut monitor = Self {
            bus,
            channel: channel.into(),
            filter,
            on_payload: Arc::new(on_payload),
            health: Arc::new(HealthCell {
                tx,
                generation: AtomicU64::new(0),
            }),
            cancel: CancellationToken::new(),
            task: None,
        };
        monitor.start();
        monitor
    }

    pub fn health(&self) -> RealtimeHealthState {
        self.health.tx.borrow().clone()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<RealtimeHealthState> {
        self.health.tx.subscribe()
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn filter(&self) -> &ChangeFilter {
        &self.filter
    }

    /// Point the monitor at a different channel or filter. Identical
    /// parameters keep the current subscription; anything else releases it
    /// and starts over from `connecting`. Returns whether it restarted.
    pub fn reconfigure(&mut self, channel: impl Into<String>, filter: ChangeFilter) -> bool {
        let channel = channel.into();
        if channel == self.channel && filter == self.filter && self.task.is_some() {
            return false;
        }
        self.stop();
        self.channel = channel;
        self.filter = filter;
        self.start();
        true
    }

    /// Release the subscription. Health stops updating afterwards.
    pub fn teardown(&mut self) {
        if self.task.is_some() {
            info!(channel = %self.channel, "realtime monitor torn down");
        }
        self.stop();
    }

    fn start(&mut self) {
        let generation = self.health.restart();
        self.cancel = CancellationToken::new();
        let task = watch_subscription(
            Arc::clone(&self.bus),
            self.channel.clone(),
            self.filter.clone(),
            Arc::clone(&self.on_payload),
            Arc::clone(&self.health),
            generation,
            self.cancel.clone(),
        );
        self.task = Some(tokio::spawn(task));
    }

    fn stop(&mut self) {
        if self.task.take().is_some() {
            self.health.retire();
            self.cancel.cancel();
        }
    }
}

impl Drop for RealtimeSubscriptionMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn watch_subscription(
    bus: Arc<dyn RealtimeBus>,
    channel: String,
    filter: ChangeFilter,
    on_payload: PayloadFn,
    health: Arc<HealthCell>,
    generation: u64,
    cancel: CancellationToken,
) {
    let mut machine = RealtimeHealthMachine::default();

    let opened = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = bus.subscribe(&channel, &filter) => opened,
    };
    let mut subscription = match opened {
        Ok(subscription) => subscription,
        Err(err) => {
            warn!(channel = %channel, filter = %filter, error = %err, "realtime subscribe failed");
            machine.on_error();
            health.publish(generation, machine.state());
            return;
        }
    };
    debug!(channel = %channel, filter = %filter, "realtime monitor subscribed");

    loop {
        let signal = tokio::select! {
            _ = cancel.cancelled() => break,
            signal = subscription.next() => signal,
        };
        match signal {
            Some(RealtimeSignal::Change(change)) => on_payload(change),
            Some(RealtimeSignal::Status(status)) => {
                if machine.apply(&status, Utc::now()) {
                    let state = machine.state();
                    info!(
                        channel = %channel,
                        status = ?state.status,
                        reconnect_count = state.reconnect_count,
                        "realtime health changed"
                    );
                    health.publish(generation, state);
                }
            }
            None => {
                machine.apply(&SubscriptionStatus::Closed, Utc::now());
                health.publish(generation, machine.state());
                break;
            }
        }
    }

    subscription.release();
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use padel_core::{ChangeKind, RealtimeStatus};
    use serde_json::json;

    use super::*;
    use crate::realtime::LocalRealtimeBus;

    fn filter() -> ChangeFilter {
        ChangeFilter::table("match_requests")
    }

    fn change() -> ChangePayload {
        ChangePayload {
            schema: "public".into(),
            table: "match_requests".into(),
            kind: ChangeKind::Update,
            record: json!({ "id": "r1" }),
            old_record: json!({}),
            commit_timestamp: None,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    async fn wait_status(
        rx: &mut watch::Receiver<RealtimeHealthState>,
        status: RealtimeStatus,
    ) -> RealtimeHealthState {
        rx.wait_for(|health| health.status == status)
            .await
            .expect("monitor alive")
            .clone()
    }

    #[tokio::test(start_paused = true)]
    async fn counts_only_disconnect_reconnect_cycles() {
        let bus = LocalRealtimeBus::new().with_auto_ack();
        let monitor =
            RealtimeSubscriptionMonitor::spawn(Arc::new(bus.clone()), "requests", filter(), |_| {});
        let mut rx = monitor.subscribe_health();

        let connected = wait_status(&mut rx, RealtimeStatus::Connected).await;
        assert_eq!(connected.reconnect_count, 0);
        assert!(connected.last_connected_at.is_some());

        bus.emit_status("requests", SubscriptionStatus::Closed);
        wait_status(&mut rx, RealtimeStatus::Disconnected).await;
        bus.emit_status("requests", SubscriptionStatus::Subscribed);
        let reconnected = wait_status(&mut rx, RealtimeStatus::Connected).await;

        assert_eq!(reconnected.reconnect_count, 1);
        assert_eq!(monitor.health(), reconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn starts_connecting_until_acknowledged() {
        let bus = LocalRealtimeBus::new();
        let monitor =
            RealtimeSubscriptionMonitor::spawn(Arc::new(bus.clone()), "requests", filter(), |_| {});
        settle().await;
        assert_eq!(monitor.health().status, RealtimeStatus::Connecting);
        assert_eq!(bus.active_count("requests"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn payloads_reach_callback_without_touching_health() {
        let bus = LocalRealtimeBus::new().with_auto_ack();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let monitor = RealtimeSubscriptionMonitor::spawn(
            Arc::new(bus.clone()),
            "requests",
            filter(),
            move |change| sink.lock().expect("seen lock").push(change.table),
        );
        let mut rx = monitor.subscribe_health();
        let before = wait_status(&mut rx, RealtimeStatus::Connected).await;

        bus.publish(change());
        bus.publish(change());
        settle().await;

        assert_eq!(seen.lock().expect("seen lock").len(), 2);
        assert_eq!(monitor.health(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_failure_surfaces_as_error() {
        let bus = LocalRealtimeBus::new();
        bus.reject_subscriptions(Some("not allowed"));
        let monitor =
            RealtimeSubscriptionMonitor::spawn(Arc::new(bus), "requests", filter(), |_| {});
        let mut rx = monitor.subscribe_health();
        wait_status(&mut rx, RealtimeStatus::Error).await;
    }

    #[tokio::test(start_paused = true)]
    async fn channel_errors_surface_as_error() {
        let bus = LocalRealtimeBus::new().with_auto_ack();
        let monitor =
            RealtimeSubscriptionMonitor::spawn(Arc::new(bus.clone()), "requests", filter(), |_| {});
        let mut rx = monitor.subscribe_health();
        wait_status(&mut rx, RealtimeStatus::Connected).await;

        bus.emit_status("requests", SubscriptionStatus::ChannelError("boom".into()));
        wait_status(&mut rx, RealtimeStatus::Error).await;
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_and_drop_release_exactly_once() {
        let bus = LocalRealtimeBus::new().with_auto_ack();
        let mut monitor =
            RealtimeSubscriptionMonitor::spawn(Arc::new(bus.clone()), "requests", filter(), |_| {});
        let mut rx = monitor.subscribe_health();
        wait_status(&mut rx, RealtimeStatus::Connected).await;

        monitor.teardown();
        monitor.teardown();
        drop(monitor);
        settle().await;

        assert_eq!(bus.release_count("requests"), 1);
        assert_eq!(bus.active_count("requests"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_health_updates_after_teardown() {
        let bus = LocalRealtimeBus::new().with_auto_ack();
        let mut monitor =
            RealtimeSubscriptionMonitor::spawn(Arc::new(bus.clone()), "requests", filter(), |_| {});
        let mut rx = monitor.subscribe_health();
        wait_status(&mut rx, RealtimeStatus::Connected).await;

        monitor.teardown();
        bus.emit_status("requests", SubscriptionStatus::Closed);
        settle().await;

        assert!(!rx.has_changed().expect("sender alive"));
        assert_eq!(monitor.health().status, RealtimeStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn reconfigure_restarts_from_scratch() {
        let bus = LocalRealtimeBus::new().with_auto_ack();
        let mut monitor =
            RealtimeSubscriptionMonitor::spawn(Arc::new(bus.clone()), "requests", filter(), |_| {});
        let mut rx = monitor.subscribe_health();
        wait_status(&mut rx, RealtimeStatus::Connected).await;
        bus.emit_status("requests", SubscriptionStatus::Closed);
        wait_status(&mut rx, RealtimeStatus::Disconnected).await;
        bus.emit_status("requests", SubscriptionStatus::Subscribed);
        assert_eq!(
            wait_status(&mut rx, RealtimeStatus::Connected).await.reconnect_count,
            1
        );

        assert!(!monitor.reconfigure("requests", filter()));
        assert!(monitor.reconfigure("matches", ChangeFilter::table("matches")));
        let fresh = wait_status(&mut rx, RealtimeStatus::Connected).await;

        assert_eq!(fresh.reconnect_count, 0);
        assert_eq!(monitor.channel(), "matches");
        settle().await;
        assert_eq!(bus.release_count("requests"), 1);
        assert_eq!(bus.active_count("matches"), 1);
    }
}
