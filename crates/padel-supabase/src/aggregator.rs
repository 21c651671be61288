//! Navigation badge counts, kept fresh from realtime changes.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use padel_core::{AppError, ChangeFeed, ChangeFilter, ChangeReceiver, NotificationCounts};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, trace, warn};

use crate::{monitor::RealtimeSubscriptionMonitor, realtime::RealtimeBus, session::AuthSession};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Scoped queries behind the counts.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    async fn team_for_user(&self, user_id: &str) -> Result<Option<String>, AppError>;

    /// Pending requests where the team is the recipient.
    async fn pending_incoming_requests(&self, team_id: &str) -> Result<u64, AppError>;

    async fn accepted_request_ids(&self, team_id: &str) -> Result<Vec<String>, AppError>;

    /// Scheduled, not yet completed matches belonging to the given requests.
    async fn scheduled_matches(&self, request_ids: &[String]) -> Result<u64, AppError>;

    async fn approved_join_requests(&self, team_id: &str) -> Result<u64, AppError>;

    /// Relations whose changes can move the counts.
    fn watched_relations(&self) -> Vec<ChangeFilter>;
}

/// Compute the counts for one user.
pub async fn aggregate(
    source: &dyn NotificationSource,
    user_id: &str,
) -> Result<NotificationCounts, AppError> {
    let Some(team_id) = source.team_for_user(user_id).await? else {
        debug!(user_id, "user has no team; counts are zero");
        return Ok(NotificationCounts::zero());
    };

    let (incoming, scheduled, approvals) = tokio::try_join!(
        source.pending_incoming_requests(&team_id),
        scheduled_for_team(source, &team_id),
        source.approved_join_requests(&team_id),
    )?;
    Ok(NotificationCounts::new(incoming, scheduled, approvals))
}

async fn scheduled_for_team(
    source: &dyn NotificationSource,
    team_id: &str,
) -> Result<u64, AppError> {
    let request_ids = source.accepted_request_ids(team_id).await?;
    if request_ids.is_empty() {
        return Ok(0);
    }
    source.scheduled_matches(&request_ids).await
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorError {
    #[error("notification aggregator has stopped")]
    Stopped,
}

enum Command {
    Refresh,
    RefreshNow(oneshot::Sender<NotificationCounts>),
    Shutdown,
}

/// Handle to the task that owns the counts.
pub struct NotificationAggregator {
    counts: watch::Receiver<NotificationCounts>,
    commands: mpsc::Sender<Command>,
    task: Option<JoinHandle<()>>,
}

impl NotificationAggregator {
    pub fn spawn(
        source: Arc<dyn NotificationSource>,
        bus: Arc<dyn RealtimeBus>,
        identity: watch::Receiver<Option<AuthSession>>,
        debounce: Duration,
    ) -> Self {
        let (counts_tx, counts) = watch::channel(NotificationCounts::zero());
        let (commands, commands_rx) = mpsc::channel(16);
        let (feed, changes) = ChangeFeed::new(64);
        let worker = Worker {
            source,
            bus,
            identity,
            debounce,
            counts: counts_tx,
            feed,
            user_id: None,
            monitors: Vec::new(),
        };
        let task = tokio::spawn(worker.run(commands_rx, changes));
        Self {
            counts,
            commands,
            task: Some(task),
        }
    }

    pub fn counts(&self) -> NotificationCounts {
        *self.counts.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<NotificationCounts> {
        self.counts.clone()
    }

    /// Schedule a debounced refresh.
    pub fn refresh(&self) -> Result<(), AggregatorError> {
        match self.commands.try_send(Command::Refresh) {
            // A full queue already holds pending work that will refresh.
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(AggregatorError::Stopped),
        }
    }

    /// Refresh immediately and return the resulting counts.
    pub async fn refresh_now(&self) -> Result<NotificationCounts, AggregatorError> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::RefreshNow(ack))
            .await
            .map_err(|_| AggregatorError::Stopped)?;
        done.await.map_err(|_| AggregatorError::Stopped)
    }

    /// Stop the task and release its subscriptions.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for NotificationAggregator {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Worker {
    source: Arc<dyn NotificationSource>,
    bus: Arc<dyn RealtimeBus>,
    identity: watch::Receiver<Option<AuthSession>>,
    debounce: Duration,
    counts: watch::Sender<NotificationCounts>,
    feed: ChangeFeed,
    user_id: Option<String>,
    monitors: Vec<RealtimeSubscriptionMonitor>,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut changes: ChangeReceiver) {
        let mut deadline: Option<Instant> = None;
        let mut identity_open = true;
        self.on_identity().await;

        loop {
            tokio::select! {
                changed = self.identity.changed(), if identity_open => {
                    if changed.is_err() {
                        identity_open = false;
                        continue;
                    }
                    if self.on_identity().await {
                        deadline = None;
                    }
                }
                command = commands.recv() => match command {
                    Some(Command::Refresh) => deadline = Some(self.schedule()),
                    Some(Command::RefreshNow(ack)) => {
                        deadline = None;
                        self.refresh().await;
                        let _ = ack.send(*self.counts.borrow());
                    }
                    Some(Command::Shutdown) | None => break,
                },
                Some(change) = changes.recv() => {
                    trace!(
                        relation = %change.relation,
                        kind = change.change.kind.as_str(),
                        "change observed"
                    );
                    deadline = Some(self.schedule());
                }
                _ = sleep_until(deadline), if deadline.is_some() => {
                    deadline = None;
                    self.refresh().await;
                }
            }
        }

        self.monitors.clear();
        info!("notification aggregator stopped");
    }

    /// Apply the current identity. Returns whether the user changed.
    async fn on_identity(&mut self) -> bool {
        let user_id = self
            .identity
            .borrow_and_update()
            .as_ref()
            .map(|session| session.user.id.clone());
        if user_id == self.user_id {
            return false;
        }

        self.monitors.clear();
        self.user_id = user_id;
        match self.user_id.clone() {
            None => {
                info!("signed out; notification counts reset");
                self.counts.send_replace(NotificationCounts::zero());
            }
            Some(user_id) => {
                info!(user_id = %user_id, "tracking notifications for user");
                self.counts.send_if_modified(|counts| {
                    let stale = *counts != NotificationCounts::zero();
                    *counts = NotificationCounts::zero();
                    stale
                });
                self.open_monitors();
                self.refresh().await;
            }
        }
        true
    }

    fn open_monitors(&mut self) {
        self.monitors = self
            .source
            .watched_relations()
            .into_iter()
            .map(|filter| {
                let producer = self.feed.producer(filter.table.clone());
                let channel = format!("notifications-{}", filter.table);
                RealtimeSubscriptionMonitor::spawn(
                    Arc::clone(&self.bus),
                    channel,
                    filter,
                    move |change| {
                        if let Err(err) = producer.push(change) {
                            debug!(
                                relation = producer.relation(),
                                error = %err,
                                "change not queued"
                            );
                        }
                    },
                )
            })
            .collect();
    }

    fn schedule(&self) -> Instant {
        Instant::now() + self.debounce
    }

    async fn refresh(&mut self) {
        let Some(user_id) = self.user_id.clone() else {
            return;
        };
        match aggregate(self.source.as_ref(), &user_id).await {
            Ok(counts) => {
                debug!(
                    user_id = %user_id,
                    incoming = counts.incoming_challenges(),
                    scheduled = counts.scheduled_matches(),
                    approvals = counts.ladder_approvals(),
                    total = counts.total(),
                    "notification counts refreshed"
                );
                self.counts.send_replace(counts);
            }
            Err(err) => {
                warn!(
                    user_id = %user_id,
                    code = err.code.as_str(),
                    error = %err,
                    "notification refresh failed; keeping previous counts"
                );
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
