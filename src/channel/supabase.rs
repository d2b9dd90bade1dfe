//! Hosted realtime transport: a Phoenix-protocol websocket client scoped to
//! one room topic, carrying presence tracking, broadcast fan-out, and
//! postgres change notifications for the stroke and room tables.
//!
//! There is no automatic reconnect: when the socket drops the subscriber
//! sees `Closed`, the session falls back to `Disconnected`, and the user
//! retries the join.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::domain::{ProfileId, Room, RoomCode, RoundId, StrokeEvent, StrokePath};
use crate::events::RoomEvent;

use super::{ChannelError, ChannelFactory, ChannelMessage, RoomChannel, Subscription};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const LOG_TARGET: &str = "channel::supabase";

#[derive(Clone, Debug)]
pub struct SupabaseChannelConfig {
    pub realtime_url: Url,
    pub api_key: String,
    pub schema: String,
    pub stroke_table: String,
    pub room_table: String,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl SupabaseChannelConfig {
    pub fn new(realtime_url: Url, api_key: impl Into<String>) -> Self {
        Self {
            realtime_url,
            api_key: api_key.into(),
            schema: "public".to_string(),
            stroke_table: "art_strokes".to_string(),
            room_table: "art_rooms".to_string(),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
        }
    }

    fn phoenix_topic(&self, room: &RoomCode) -> String {
        format!("realtime:{}", room.channel_topic())
    }
}

pub struct SupabaseChannelFactory {
    cfg: SupabaseChannelConfig,
}

impl SupabaseChannelFactory {
    pub fn new(cfg: SupabaseChannelConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl ChannelFactory for SupabaseChannelFactory {
    async fn join(
        &self,
        room: &RoomCode,
        presence_key: ProfileId,
    ) -> Result<Subscription, ChannelError> {
        let stream = connect(&self.cfg)
            .await
            .map_err(|err| ChannelError::SubscriptionFailed(err.to_string()))?;

        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (joined_tx, joined_rx) = oneshot::channel();
        let stop = CancellationToken::new();

        let pump = Pump {
            cfg: self.cfg.clone(),
            room: room.clone(),
            topic: self.cfg.phoenix_topic(room),
            presence_key,
            messages: messages_tx,
            refs: AtomicU64::new(0),
            stop: stop.clone(),
        };
        tokio::spawn(async move {
            if let Err(err) = pump.run(stream, commands_rx, joined_tx).await {
                warn!(target = LOG_TARGET, error = %err, "realtime pump ended with error");
            }
        });

        // The subscription is only live once the server acknowledges the
        // topic join.
        match timeout(self.cfg.handshake_timeout, joined_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(reason))) => {
                stop.cancel();
                return Err(ChannelError::SubscriptionFailed(reason));
            }
            Ok(Err(_)) | Err(_) => {
                stop.cancel();
                return Err(ChannelError::SubscriptionFailed(
                    "no join acknowledgement from realtime server".into(),
                ));
            }
        }

        let channel = Arc::new(SupabaseChannel { commands: commands_tx, stop });
        Ok(Subscription {
            channel,
            messages: messages_rx,
        })
    }
}

async fn connect(cfg: &SupabaseChannelConfig) -> Result<WsStream> {
    let connect_fut = connect_async(cfg.realtime_url.to_string());
    let (stream, _) = timeout(cfg.handshake_timeout, connect_fut)
        .await
        .context("realtime handshake timed out")?
        .context("realtime handshake failed")?;
    Ok(stream)
}

enum Command {
    Track(ProfileId),
    Send(RoomEvent),
    Leave,
}

pub struct SupabaseChannel {
    commands: mpsc::UnboundedSender<Command>,
    stop: CancellationToken,
}

#[async_trait]
impl RoomChannel for SupabaseChannel {
    async fn track(&self, profile: ProfileId) -> Result<(), ChannelError> {
        self.commands
            .send(Command::Track(profile))
            .map_err(|_| ChannelError::Closed)
    }

    async fn send(&self, event: RoomEvent) -> Result<(), ChannelError> {
        self.commands
            .send(Command::Send(event))
            .map_err(|_| ChannelError::Closed)
    }

    async fn leave(&self) {
        let _ = self.commands.send(Command::Leave);
        self.stop.cancel();
    }
}

struct Pump {
    cfg: SupabaseChannelConfig,
    room: RoomCode,
    topic: String,
    presence_key: ProfileId,
    messages: mpsc::UnboundedSender<ChannelMessage>,
    refs: AtomicU64,
    stop: CancellationToken,
}

impl Pump {
    fn next_ref(&self) -> String {
        self.refs.fetch_add(1, Ordering::Relaxed).to_string()
    }

    async fn run(
        self,
        stream: WsStream,
        mut commands: mpsc::UnboundedReceiver<Command>,
        joined_tx: oneshot::Sender<Result<(), String>>,
    ) -> Result<()> {
        let (mut sink, mut source) = stream.split();

        let join_ref = self.next_ref();
        let join = self.join_message(&join_ref)?;
        sink.send(Message::Text(join))
            .await
            .context("failed to send join message")?;

        let mut heartbeat = interval(self.cfg.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut joined_tx = Some(joined_tx);

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => {
                    debug!(target = LOG_TARGET, "shutdown signal received");
                    break;
                }
                _ = heartbeat.tick() => {
                    let message = self.heartbeat_message()?;
                    if let Err(err) = sink.send(Message::Text(message)).await {
                        warn!(target = LOG_TARGET, error = %err, "heartbeat send failed, ending loop");
                        break;
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(Command::Track(profile)) => {
                            let message = self.track_message(profile)?;
                            if let Err(err) = sink.send(Message::Text(message)).await {
                                warn!(target = LOG_TARGET, error = %err, "presence track send failed");
                                break;
                            }
                        }
                        Some(Command::Send(event)) => {
                            let message = self.broadcast_message(&event)?;
                            if let Err(err) = sink.send(Message::Text(message)).await {
                                warn!(target = LOG_TARGET, error = %err, "broadcast send failed");
                                break;
                            }
                        }
                        Some(Command::Leave) | None => break,
                    }
                }
                incoming = source.next() => {
                    match incoming {
                        Some(Ok(Message::Text(txt))) => {
                            if let Err(err) = self.handle_text(&join_ref, &mut joined_tx, txt) {
                                warn!(target = LOG_TARGET, error = %err, "failed to handle realtime message");
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            sink.send(Message::Pong(payload)).await.ok();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(target = LOG_TARGET, ?frame, "socket closed by server");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(target = LOG_TARGET, error = %err, "websocket error");
                            break;
                        }
                        None => {
                            debug!(target = LOG_TARGET, "websocket stream ended");
                            break;
                        }
                    }
                }
            }
        }

        let leave = self.leave_message()?;
        sink.send(Message::Text(leave)).await.ok();
        let _ = sink.close().await;
        let _ = self.messages.send(ChannelMessage::Closed);
        Ok(())
    }

    fn handle_text(
        &self,
        join_ref: &str,
        joined_tx: &mut Option<oneshot::Sender<Result<(), String>>>,
        txt: String,
    ) -> Result<()> {
        let incoming: IncomingMessage =
            serde_json::from_str(&txt).context("failed to deserialize realtime message")?;
        if incoming.topic != self.topic && incoming.topic != "phoenix" {
            return Ok(());
        }

        match incoming.event.as_str() {
            "phx_reply" => {
                if incoming.reference.as_deref() == Some(join_ref) {
                    if let Some(tx) = joined_tx.take() {
                        let reply: ReplyPayload =
                            serde_json::from_value(incoming.payload.unwrap_or(Value::Null))
                                .context("failed to decode phx_reply payload")?;
                        let result = if reply.status == "ok" {
                            debug!(target = LOG_TARGET, "subscription acknowledged");
                            Ok(())
                        } else {
                            Err(format!("subscription rejected: {}", reply.status))
                        };
                        let _ = tx.send(result);
                    }
                }
            }
            "presence_state" => {
                let payload = incoming.payload.unwrap_or(Value::Null);
                let members = presence_keys(&payload);
                let _ = self.messages.send(ChannelMessage::PresenceSync { members });
            }
            "presence_diff" => {
                let payload = incoming.payload.unwrap_or(Value::Null);
                for profile in presence_keys(payload.get("joins").unwrap_or(&Value::Null)) {
                    let _ = self.messages.send(ChannelMessage::PresenceJoin { profile });
                }
                for profile in presence_keys(payload.get("leaves").unwrap_or(&Value::Null)) {
                    let _ = self.messages.send(ChannelMessage::PresenceLeave { profile });
                }
            }
            "broadcast" => {
                let payload = incoming.payload.unwrap_or(Value::Null);
                let name = payload.get("event").and_then(Value::as_str).unwrap_or("");
                let body = payload.get("payload").cloned().unwrap_or(Value::Null);
                if let Some(event) = RoomEvent::decode(name, body) {
                    let _ = self.messages.send(ChannelMessage::Broadcast(event));
                }
            }
            "postgres_changes" => {
                let payload = incoming.payload.unwrap_or(Value::Null);
                if let Some(data) = payload.get("data") {
                    self.handle_change(data);
                }
            }
            other => {
                debug!(target = LOG_TARGET, event = other, "ignoring realtime event");
            }
        }

        Ok(())
    }

    fn handle_change(&self, data: &Value) {
        let table = data.get("table").and_then(Value::as_str).unwrap_or("");
        let Some(new_row) = data.get("new").cloned() else {
            return;
        };

        if table == self.cfg.stroke_table {
            match serde_json::from_value::<StrokeRow>(new_row) {
                Ok(row) => {
                    let _ = self.messages.send(ChannelMessage::StrokeAppended(StrokeEvent {
                        round: row.round_id,
                        seq: row.id,
                        path: row.path,
                    }));
                }
                Err(err) => {
                    debug!(target = LOG_TARGET, error = %err, "dropping undecodable stroke row");
                }
            }
        } else if table == self.cfg.room_table {
            match serde_json::from_value::<RoomRow>(new_row) {
                Ok(row) => {
                    if let Some(room) = row.into_room() {
                        let _ = self.messages.send(ChannelMessage::RoomChanged(room));
                    }
                }
                Err(err) => {
                    debug!(target = LOG_TARGET, error = %err, "dropping undecodable room row");
                }
            }
        }
    }

    fn join_message(&self, reference: &str) -> Result<String> {
        // Broadcasts echo back to the sender so every client, the sender
        // included, transitions on the delivered event.
        let payload = serde_json::json!({
            "access_token": self.cfg.api_key,
            "user_token": self.cfg.api_key,
            "config": {
                "broadcast": { "self": true },
                "presence": { "key": self.presence_key.to_string() },
                "postgres_changes": [
                    {
                        "event": "INSERT",
                        "schema": self.cfg.schema,
                        "table": self.cfg.stroke_table,
                    },
                    {
                        "event": "UPDATE",
                        "schema": self.cfg.schema,
                        "table": self.cfg.room_table,
                        "filter": format!("room_id=eq.{}", self.room.as_str()),
                    },
                ],
            },
        });
        self.envelope("phx_join", reference, payload)
    }

    fn heartbeat_message(&self) -> Result<String> {
        let envelope = serde_json::json!({
            "topic": "phoenix",
            "event": "heartbeat",
            "ref": self.next_ref(),
            "payload": {},
        });
        serde_json::to_string(&envelope).context("failed to serialize heartbeat")
    }

    fn track_message(&self, profile: ProfileId) -> Result<String> {
        let payload = serde_json::json!({
            "type": "presence",
            "event": "track",
            "payload": { "user_id": profile.to_string() },
        });
        self.envelope("presence", &self.next_ref(), payload)
    }

    fn broadcast_message(&self, event: &RoomEvent) -> Result<String> {
        let payload = serde_json::json!({
            "type": "broadcast",
            "event": event.name(),
            "payload": event.payload(),
        });
        self.envelope("broadcast", &self.next_ref(), payload)
    }

    fn leave_message(&self) -> Result<String> {
        self.envelope("phx_leave", &self.next_ref(), serde_json::json!({}))
    }

    fn envelope(&self, event: &str, reference: &str, payload: Value) -> Result<String> {
        let envelope = serde_json::json!({
            "topic": self.topic,
            "event": event,
            "ref": reference,
            "payload": payload,
        });
        serde_json::to_string(&envelope).context("failed to serialize realtime message")
    }
}

/// Presence payloads are maps keyed by presence key; only keys that parse
/// as profile identifiers count, the rest are ignored.
fn presence_keys(payload: &Value) -> Vec<ProfileId> {
    let mut keys: Vec<ProfileId> = payload
        .as_object()
        .map(|map| {
            map.keys()
                .filter_map(|key| Uuid::parse_str(key).ok())
                .collect()
        })
        .unwrap_or_default();
    keys.sort();
    keys.dedup();
    keys
}

#[derive(Debug, serde::Deserialize)]
struct IncomingMessage {
    topic: String,
    event: String,
    #[serde(rename = "ref")]
    reference: Option<String>,
    payload: Option<Value>,
}

#[derive(Debug, serde::Deserialize)]
struct ReplyPayload {
    status: String,
}

#[derive(Debug, serde::Deserialize)]
struct StrokeRow {
    id: i64,
    round_id: RoundId,
    path: StrokePath,
}

#[derive(Debug, serde::Deserialize)]
struct RoomRow {
    room_id: String,
    host_id: ProfileId,
    is_active: bool,
    round_duration: i64,
    created_at: Option<DateTime<Utc>>,
}

impl RoomRow {
    fn into_room(self) -> Option<Room> {
        Some(Room {
            code: RoomCode::parse(&self.room_id)?,
            host: self.host_id,
            is_active: self.is_active,
            round_duration_secs: self.round_duration.max(0) as u32,
            created_at: self.created_at.unwrap_or_else(Utc::now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_keys_collapse_and_ignore_foreign_keys() {
        let a = Uuid::new_v4();
        let payload = serde_json::json!({
            a.to_string(): { "metas": [{}, {}] },
            "not-a-uuid": { "metas": [{}] },
        });
        let keys = presence_keys(&payload);
        assert_eq!(keys, vec![a]);
    }

    #[test]
    fn phoenix_topic_is_room_scoped() {
        let cfg = SupabaseChannelConfig::new(
            Url::parse("wss://example.test/realtime/v1/websocket").unwrap(),
            "anon",
        );
        let room = RoomCode::parse("ABCD").unwrap();
        assert_eq!(cfg.phoenix_topic(&room), "realtime:room:ABCD");
    }
}
