//! Realtime websocket connection management
//!
//! Handles the connection lifecycle, reconnection with exponential backoff,
//! heartbeats and topic joins. Topics are re-joined after every reconnect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bazaar_config::RealtimeConfig;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use super::{ChangeEvent, ChangeKind, Registry};

/// Connection status
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelStatus {
    Connecting,
    Connected,
    Reconnecting(u32), // attempt number
    Disconnected,
    Failed(String),
}

impl ChannelStatus {
    fn gauge_value(&self) -> i64 {
        match self {
            ChannelStatus::Connected => 2,
            ChannelStatus::Connecting | ChannelStatus::Reconnecting(_) => 1,
            ChannelStatus::Disconnected | ChannelStatus::Failed(_) => 0,
        }
    }
}

/// Instructions for the connection task
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Join(String),
    Leave(String),
    Shutdown,
}

/// Everything the connection task owns
pub(crate) struct LoopContext {
    pub url: Url,
    pub config: RealtimeConfig,
    pub access_token: Option<String>,
    pub registry: Registry,
    pub status: Arc<RwLock<ChannelStatus>>,
    pub next_ref: Arc<AtomicU64>,
}

impl LoopContext {
    async fn set_status(&self, status: ChannelStatus) {
        bazaar_metrics::metrics()
            .realtime
            .connection_status
            .set(status.gauge_value());
        *self.status.write().await = status;
    }

    fn next_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

/// `wss://{host}/realtime/v1/websocket?apikey=..&vsn=1.0.0`
pub(crate) fn websocket_url(base: &Url, anon_key: &str) -> Result<Url, url::ParseError> {
    let mut url = base.join("realtime/v1/websocket")?;
    let scheme = if base.scheme() == "http" { "ws" } else { "wss" };
    // Switching between special schemes always succeeds.
    let _ = url.set_scheme(scheme);
    url.query_pairs_mut()
        .append_pair("apikey", anon_key)
        .append_pair("vsn", "1.0.0");
    Ok(url)
}

/// Join message for `topic`; the table and filter are recovered from the topic name
pub(crate) fn join_message(topic: &str, access_token: Option<&str>, msg_ref: &str) -> Value {
    let rest = topic.strip_prefix("realtime:public:").unwrap_or(topic);
    let (table, filter) = match rest.split_once(':') {
        Some((table, filter)) => (table, Some(filter)),
        None => (rest, None),
    };

    let mut change = json!({ "event": "*", "schema": "public", "table": table });
    if let Some(filter) = filter {
        change["filter"] = json!(filter);
    }

    let mut payload = json!({ "config": { "postgres_changes": [change] } });
    if let Some(token) = access_token {
        payload["access_token"] = json!(token);
    }

    json!({ "topic": topic, "event": "phx_join", "payload": payload, "ref": msg_ref })
}

pub(crate) fn leave_message(topic: &str, msg_ref: &str) -> Value {
    json!({ "topic": topic, "event": "phx_leave", "payload": {}, "ref": msg_ref })
}

pub(crate) fn heartbeat_message(msg_ref: &str) -> Value {
    json!({ "topic": "phoenix", "event": "heartbeat", "payload": {}, "ref": msg_ref })
}

/// Extract `(topic, change)` from a server frame. Replies, heartbeats and
/// system messages yield `None`.
pub(crate) fn parse_change(text: &str) -> Option<(String, ChangeEvent)> {
    let frame: Value = serde_json::from_str(text).ok()?;
    let topic = frame.get("topic")?.as_str()?.to_string();
    let event = frame.get("event")?.as_str()?;
    let payload = frame.get("payload")?;

    // Newer servers wrap the row change in `postgres_changes.data`; older
    // ones send the change kind as the event name.
    let data = match event {
        "postgres_changes" => payload.get("data")?,
        "INSERT" | "UPDATE" | "DELETE" => payload,
        _ => return None,
    };

    let kind = data
        .get("type")
        .or_else(|| data.get("eventType"))
        .and_then(|t| t.as_str())
        .and_then(ChangeKind::parse)?;

    let table = data
        .get("table")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();

    Some((
        topic,
        ChangeEvent {
            table,
            kind,
            record: data.get("record").cloned().unwrap_or(Value::Null),
            old_record: data.get("old_record").cloned().unwrap_or(Value::Null),
        },
    ))
}

/// Hand `event` to every listener of `topic`
pub(crate) fn dispatch(registry: &Registry, topic: &str, event: ChangeEvent) {
    let callbacks: Vec<_> = match registry.get(topic) {
        Some(listeners) => listeners.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
        None => {
            debug!("Change for unsubscribed topic {}", topic);
            return;
        }
    };

    bazaar_metrics::metrics()
        .realtime
        .events
        .with_label_values(&[&event.table, event.kind.as_str()])
        .inc();

    for callback in callbacks {
        callback(event.clone());
    }
}

/// Main connection loop with reconnection logic
pub(crate) async fn connection_loop(ctx: LoopContext, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut reconnect_attempt = 0u32;
    let mut reconnect_delay = ctx.config.initial_reconnect_delay_ms;

    loop {
        ctx.set_status(if reconnect_attempt > 0 {
            ChannelStatus::Reconnecting(reconnect_attempt)
        } else {
            ChannelStatus::Connecting
        })
        .await;

        info!("Connecting to realtime: {}", ctx.url.host_str().unwrap_or_default());

        let connect_result = tokio::time::timeout(
            Duration::from_millis(ctx.config.connect_timeout_ms),
            connect_async(ctx.url.as_str()),
        )
        .await;

        match connect_result {
            Ok(Ok((ws_stream, _response))) => {
                info!("Realtime connected");
                ctx.set_status(ChannelStatus::Connected).await;

                reconnect_attempt = 0;
                reconnect_delay = ctx.config.initial_reconnect_delay_ms;

                match message_loop(ws_stream, &ctx, &mut commands).await {
                    DisconnectReason::Shutdown => {
                        info!("Realtime disconnected by shutdown request");
                        break;
                    }
                    DisconnectReason::Error(e) => {
                        warn!("Realtime error: {}", e);
                        bazaar_metrics::metrics()
                            .realtime
                            .reconnects
                            .with_label_values(&["error"])
                            .inc();
                    }
                    DisconnectReason::ServerClosed => {
                        info!("Realtime closed by server");
                        bazaar_metrics::metrics()
                            .realtime
                            .reconnects
                            .with_label_values(&["server_closed"])
                            .inc();
                    }
                }
            }
            Ok(Err(e)) => {
                error!("Realtime connection failed: {}", e);
            }
            Err(_) => {
                error!("Realtime connection timed out");
            }
        }

        reconnect_attempt += 1;
        if ctx.config.max_reconnect_attempts > 0 && reconnect_attempt >= ctx.config.max_reconnect_attempts {
            error!("Max reconnection attempts reached ({})", ctx.config.max_reconnect_attempts);
            ctx.set_status(ChannelStatus::Failed("Max reconnection attempts reached".to_string()))
                .await;
            return;
        }

        info!("Reconnecting in {}ms (attempt {})", reconnect_delay, reconnect_attempt);
        ctx.set_status(ChannelStatus::Reconnecting(reconnect_attempt)).await;

        if !wait_for_retry(Duration::from_millis(reconnect_delay), &mut commands).await {
            info!("Realtime shut down while waiting to reconnect");
            break;
        }

        reconnect_delay = next_backoff(reconnect_delay, ctx.config.max_reconnect_delay_ms);
    }

    ctx.set_status(ChannelStatus::Disconnected).await;
}

/// Sleep for `delay` while draining commands. Joins and leaves are picked up
/// from the registry on reconnect. Returns `false` on shutdown.
/// Doubled reconnect delay, capped at `max_ms`
pub(crate) fn next_backoff(current_ms: u64, max_ms: u64) -> u64 {
    current_ms.saturating_mul(2).min(max_ms)
}

async fn wait_for_retry(delay: Duration, commands: &mut mpsc::UnboundedReceiver<Command>) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => return true,
            cmd = commands.recv() => match cmd {
                Some(Command::Shutdown) | None => return false,
                Some(_) => continue,
            },
        }
    }
}

enum DisconnectReason {
    Shutdown,
    Error(String),
    ServerClosed,
}

/// Message loop - joins, heartbeats and incoming change frames
async fn message_loop(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ctx: &LoopContext,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> DisconnectReason {
    let (mut write, mut read) = ws_stream.split();

    let topics: Vec<String> = ctx.registry.iter().map(|e| e.key().clone()).collect();
    for topic in topics {
        let msg = join_message(&topic, ctx.access_token.as_deref(), &ctx.next_ref());
        if let Err(e) = write.send(Message::Text(msg.to_string())).await {
            return DisconnectReason::Error(format!("Join failed: {}", e));
        }
    }

    let period = Duration::from_millis(ctx.config.heartbeat_interval_ms.max(1));
    let mut heartbeat = tokio::time::interval(period);

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                let msg = match cmd {
                    Some(Command::Join(topic)) => join_message(&topic, ctx.access_token.as_deref(), &ctx.next_ref()),
                    Some(Command::Leave(topic)) => leave_message(&topic, &ctx.next_ref()),
                    Some(Command::Shutdown) | None => {
                        debug!("Message loop received shutdown");
                        let _ = write.close().await;
                        return DisconnectReason::Shutdown;
                    }
                };
                if let Err(e) = write.send(Message::Text(msg.to_string())).await {
                    return DisconnectReason::Error(format!("Send failed: {}", e));
                }
            }

            _ = heartbeat.tick() => {
                let msg = heartbeat_message(&ctx.next_ref());
                if let Err(e) = write.send(Message::Text(msg.to_string())).await {
                    return DisconnectReason::Error(format!("Heartbeat failed: {}", e));
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some((topic, event)) = parse_change(&text) {
                            dispatch(&ctx.registry, &topic, event);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            return DisconnectReason::Error(format!("Pong failed: {}", e));
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return DisconnectReason::ServerClosed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return DisconnectReason::Error(format!("WebSocket error: {}", e));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashmap::DashMap;
    use parking_lot::Mutex;

    #[test]
    fn test_websocket_url() {
        let base = Url::parse("https://project.example.co").unwrap();
        let url = websocket_url(&base, "anon").unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/realtime/v1/websocket");
        assert_eq!(url.query(), Some("apikey=anon&vsn=1.0.0"));

        let local = Url::parse("http://localhost:54321").unwrap();
        assert_eq!(websocket_url(&local, "k").unwrap().scheme(), "ws");
    }

    #[test]
    fn test_join_message_with_filter() {
        let msg = join_message("realtime:public:agent_logs:agent_id=eq.7", Some("jwt"), "3");
        assert_eq!(msg["event"], "phx_join");
        assert_eq!(msg["ref"], "3");
        let change = &msg["payload"]["config"]["postgres_changes"][0];
        assert_eq!(change["table"], "agent_logs");
        assert_eq!(change["filter"], "agent_id=eq.7");
        assert_eq!(msg["payload"]["access_token"], "jwt");
    }

    #[test]
    fn test_parse_postgres_changes_frame() {
        let frame = json!({
            "topic": "realtime:public:deployments",
            "event": "postgres_changes",
            "payload": {
                "data": {
                    "type": "UPDATE",
                    "table": "deployments",
                    "record": { "status": "running" },
                    "old_record": { "status": "deploying" }
                }
            },
            "ref": null
        });

        let (topic, event) = parse_change(&frame.to_string()).unwrap();
        assert_eq!(topic, "realtime:public:deployments");
        assert_eq!(event.kind, ChangeKind::Update);
        assert_eq!(event.record["status"], "running");
        assert_eq!(event.old_record["status"], "deploying");
    }

    #[test]
    fn test_parse_legacy_frame() {
        let frame = json!({
            "topic": "realtime:public:agent_health",
            "event": "INSERT",
            "payload": { "type": "INSERT", "table": "agent_health", "record": { "status": "healthy" } },
            "ref": null
        });

        let (_, event) = parse_change(&frame.to_string()).unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.old_record, Value::Null);
    }

    #[test]
    fn test_parse_ignores_replies() {
        let reply = json!({
            "topic": "phoenix",
            "event": "phx_reply",
            "payload": { "status": "ok", "response": {} },
            "ref": "1"
        });
        assert!(parse_change(&reply.to_string()).is_none());
        assert!(parse_change("not json").is_none());
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        assert_eq!(next_backoff(1000, 30_000), 2000);
        assert_eq!(next_backoff(20_000, 30_000), 30_000);
        assert_eq!(next_backoff(u64::MAX / 2 + 1, u64::MAX), u64::MAX);
        assert_eq!(next_backoff(u64::MAX, u64::MAX), u64::MAX);
    }

    #[test]
    fn test_dispatch_reaches_every_listener() {
        let registry: Registry = Arc::new(DashMap::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        for n in 0..2 {
            let seen = Arc::clone(&seen);
            registry
                .entry("realtime:public:deployments".to_string())
                .or_default()
                .push((n, Arc::new(move |e: ChangeEvent| seen.lock().push((n, e.kind)))));
        }

        let event = ChangeEvent {
            table: "deployments".to_string(),
            kind: ChangeKind::Update,
            record: json!({}),
            old_record: Value::Null,
        };
        dispatch(&registry, "realtime:public:deployments", event.clone());
        dispatch(&registry, "realtime:public:other", event);

        assert_eq!(*seen.lock(), vec![(0, ChangeKind::Update), (1, ChangeKind::Update)]);
    }
}
