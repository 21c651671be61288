use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use padel_core::{
    ChangeFilter, ChangeKind, ChangePayload, RealtimeSignal, RetryPolicy, SubscriptionStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::{sync::mpsc, time::Instant};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;
use uuid::Uuid;

use super::{RealtimeBus, RealtimeError, Subscription};
use crate::{endpoint::ProjectEndpoint, session::SessionStore};

const SIGNAL_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoenixConfig {
    pub heartbeat_interval: Duration,
    pub join_timeout: Duration,
    pub reconnect: RetryPolicy,
}

impl Default for PhoenixConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            join_timeout: Duration::from_secs(10),
            reconnect: RetryPolicy::new(500, 30_000),
        }
    }
}

/// Websocket bus speaking the Phoenix channel protocol of the hosted realtime
/// service. Every subscription owns one socket and reconnects on its own.
#[derive(Clone)]
pub struct PhoenixRealtimeBus {
    url: Url,
    anon_key: String,
    session: SessionStore,
    config: PhoenixConfig,
}

impl PhoenixRealtimeBus {
    pub fn new(endpoint: &ProjectEndpoint, session: SessionStore) -> Self {
        Self {
            url: endpoint.realtime(),
            anon_key: endpoint.anon_key().to_owned(),
            session,
            config: PhoenixConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PhoenixConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl RealtimeBus for PhoenixRealtimeBus {
    async fn subscribe(
        &self,
        channel: &str,
        filter: &ChangeFilter,
    ) -> Result<Subscription, RealtimeError> {
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        let cancel = CancellationToken::new();
        let task = ChannelTask {
            id: Uuid::new_v4(),
            url: self.url.clone(),
            topic: topic_for(channel),
            filter: filter.clone(),
            anon_key: self.anon_key.clone(),
            session: self.session.clone(),
            config: self.config.clone(),
            signals: tx,
            cancel: cancel.clone(),
        };
        info!(channel, filter = %filter, task = %task.id, "opening realtime channel");
        tokio::spawn(task.run());

        Ok(Subscription::new(channel, rx, move || cancel.cancel()))
    }
}

enum SocketEnd {
    Released,
    Lost {
        status: SubscriptionStatus,
        joined: bool,
    },
}

struct ChannelTask {
    id: Uuid,
    url: Url,
    topic: String,
    filter: ChangeFilter,
    anon_key: String,
    session: SessionStore,
    config: PhoenixConfig,
    signals: mpsc::Sender<RealtimeSignal>,
    cancel: CancellationToken,
}

impl ChannelTask {
    async fn run(self) {
        let mut attempt: u32 = 0;
        let mut ever_joined = false;

        loop {
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                connected = tokio_tungstenite::connect_async(self.url.as_str()) => connected,
            };

            match connected {
                Ok((socket, _)) => match self.drive(socket).await {
                    SocketEnd::Released => break,
                    SocketEnd::Lost { status, joined } => {
                        if joined {
                            attempt = 0;
                            ever_joined = true;
                        }
                        warn!(
                            topic = %self.topic,
                            task = %self.id,
                            ?status,
                            "realtime channel lost"
                        );
                        self.emit(RealtimeSignal::Status(status)).await;
                    }
                },
                Err(err) if ever_joined => {
                    debug!(topic = %self.topic, error = %err, "realtime reconnect failed");
                }
                Err(err) => {
                    warn!(topic = %self.topic, error = %err, "realtime connect failed");
                    self.emit(RealtimeSignal::Status(SubscriptionStatus::ChannelError(
                        err.to_string(),
                    )))
                    .await;
                }
            }

            let delay = self.config.reconnect.delay_for_attempt(attempt);
            attempt = attempt.saturating_add(1);
            debug!(
                topic = %self.topic,
                delay_ms = delay.as_millis() as u64,
                "realtime reconnect scheduled"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!(topic = %self.topic, task = %self.id, "realtime channel task finished");
    }

    async fn drive<S>(&self, socket: S) -> SocketEnd
    where
        S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
    {
        let (mut sink, mut stream) = socket.split();
        let mut refs = RefCounter::default();
        let access_token = self
            .session
            .access_token()
            .unwrap_or_else(|| self.anon_key.clone());

        let join_ref = refs.next();
        let join = join_message(&self.topic, &self.filter, &access_token, &join_ref);
        if let Err(err) = send(&mut sink, &join).await {
            return lost(SubscriptionStatus::ChannelError(err.to_string()), false);
        }

        let mut joined = false;
        let join_deadline = tokio::time::sleep(self.config.join_timeout);
        tokio::pin!(join_deadline);
        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let leave = leave_message(&self.topic, &refs.next());
                    if let Err(err) = send(&mut sink, &leave).await {
                        debug!(topic = %self.topic, error = %err, "phx_leave not delivered");
                    }
                    let _ = sink.close().await;
                    return SocketEnd::Released;
                }
                _ = &mut join_deadline, if !joined => {
                    return lost(SubscriptionStatus::TimedOut, false);
                }
                _ = heartbeat.tick() => {
                    if let Err(err) = send(&mut sink, &heartbeat_message(&refs.next())).await {
                        debug!(topic = %self.topic, error = %err, "heartbeat failed");
                        return lost(SubscriptionStatus::Closed, joined);
                    }
                }
                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sink.send(Message::Pong(data)).await;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return lost(SubscriptionStatus::Closed, joined);
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => {
                            debug!(topic = %self.topic, error = %err, "realtime socket error");
                            return lost(SubscriptionStatus::Closed, joined);
                        }
                    };

                    let Some(message) = decode_message(&text) else {
                        warn!(topic = %self.topic, "undecodable realtime frame");
                        continue;
                    };
                    match classify_frame(&message, &self.topic, &join_ref) {
                        Frame::Joined => {
                            joined = true;
                            info!(topic = %self.topic, "realtime channel joined");
                            self.emit(RealtimeSignal::Status(SubscriptionStatus::Subscribed)).await;
                        }
                        Frame::Change(change) => {
                            trace!(topic = %self.topic, table = %change.table, "realtime change");
                            self.emit(RealtimeSignal::Change(change)).await;
                        }
                        Frame::Failed(reason) => {
                            return lost(SubscriptionStatus::ChannelError(reason), joined);
                        }
                        Frame::Closed => return lost(SubscriptionStatus::Closed, joined),
                        Frame::Ignored => {}
                    }
                }
            }
        }
    }

    async fn emit(&self, signal: RealtimeSignal) {
        if self.signals.send(signal).await.is_err() {
            trace!(topic = %self.topic, "subscription receiver gone");
        }
    }
}

fn lost(status: SubscriptionStatus, joined: bool) -> SocketEnd {
    SocketEnd::Lost { status, joined }
}

async fn send<S>(sink: &mut S, message: &PhoenixMessage) -> Result<(), WsError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let text = serde_json::to_string(message).map_err(|err| WsError::Io(err.into()))?;
    sink.send(Message::Text(text)).await
}

#[derive(Default)]
struct RefCounter(u64);

impl RefCounter {
    fn next(&mut self) -> String {
        self.0 += 1;
        self.0.to_string()
    }
}

/// One frame of the Phoenix v1 JSON serializer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

pub(crate) fn topic_for(channel: &str) -> String {
    format!("realtime:{channel}")
}

pub(crate) fn join_message(
    topic: &str,
    filter: &ChangeFilter,
    access_token: &str,
    reference: &str,
) -> PhoenixMessage {
    PhoenixMessage {
        topic: topic.to_owned(),
        event: "phx_join".to_owned(),
        payload: json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [{
                    "event": filter.event.as_str(),
                    "schema": filter.schema,
                    "table": filter.table,
                }],
            },
            "access_token": access_token,
        }),
        reference: Some(reference.to_owned()),
    }
}

pub(crate) fn heartbeat_message(reference: &str) -> PhoenixMessage {
    PhoenixMessage {
        topic: "phoenix".to_owned(),
        event: "heartbeat".to_owned(),
        payload: json!({}),
        reference: Some(reference.to_owned()),
    }
}

pub(crate) fn leave_message(topic: &str, reference: &str) -> PhoenixMessage {
    PhoenixMessage {
        topic: topic.to_owned(),
        event: "phx_leave".to_owned(),
        payload: json!({}),
        reference: Some(reference.to_owned()),
    }
}

pub(crate) fn decode_message(text: &str) -> Option<PhoenixMessage> {
    serde_json::from_str(text).ok()
}

#[derive(Debug, PartialEq)]
pub(crate) enum Frame {
    Joined,
    Change(ChangePayload),
    Failed(String),
    Closed,
    Ignored,
}

pub(crate) fn classify_frame(message: &PhoenixMessage, topic: &str, join_ref: &str) -> Frame {
    if message.topic != topic {
        return Frame::Ignored;
    }
    match message.event.as_str() {
        "phx_reply" if message.reference.as_deref() == Some(join_ref) => {
            match message.payload.get("status").and_then(Value::as_str) {
                Some("ok") => Frame::Joined,
                _ => Frame::Failed(reply_reason(&message.payload)),
            }
        }
        "postgres_changes" => decode_change(&message.payload)
            .map(Frame::Change)
            .unwrap_or(Frame::Ignored),
        "system" if message.payload.get("status").and_then(Value::as_str) == Some("error") => {
            Frame::Failed(reply_reason(&message.payload))
        }
        "phx_error" => Frame::Failed("channel crashed".to_owned()),
        "phx_close" => Frame::Closed,
        _ => Frame::Ignored,
    }
}

fn reply_reason(payload: &Value) -> String {
    payload
        .pointer("/response/reason")
        .or_else(|| payload.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("join rejected")
        .to_owned()
}

pub(crate) fn decode_change(payload: &Value) -> Option<ChangePayload> {
    let data = payload.get("data")?;
    let kind = data
        .get("type")
        .or_else(|| data.get("eventType"))
        .and_then(Value::as_str)
        .and_then(ChangeKind::parse)?;
    let text = |key: &str| data.get(key).and_then(Value::as_str).map(str::to_owned);

    Some(ChangePayload {
        schema: text("schema")?,
        table: text("table")?,
        kind,
        record: data.get("record").cloned().unwrap_or_else(|| json!({})),
        old_record: data.get("old_record").cloned().unwrap_or_else(|| json!({})),
        commit_timestamp: text("commit_timestamp"),
    })
}
