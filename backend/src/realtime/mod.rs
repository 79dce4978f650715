//! Realtime row-change subscriptions
//!
//! One managed websocket per [`RealtimeClient`]. Each [`Subscription`] owns a
//! callback that is invoked once per change event with the changed row;
//! dropping the subscription removes the callback and leaves the topic when
//! nobody else listens to it.

mod channel;

pub use channel::{ChannelStatus, Command};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bazaar_config::RealtimeConfig;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::{BackendClient, BackendError, BackendResult};

/// Kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" => Some(ChangeKind::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

/// A single row change
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    /// New row; `Null` for deletes
    pub record: Value,
    /// Previous row when the backend sends it
    pub old_record: Value,
}

impl ChangeEvent {
    /// Decode the changed row, `None` when it does not have the expected shape
    pub fn record_as<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.record.clone()).ok()
    }
}

pub(crate) type Callback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// Callbacks by topic
pub(crate) type Registry = Arc<DashMap<String, Vec<(u64, Callback)>>>;

/// Topic name for a table plus optional row filter such as `agent_id=eq.42`
pub fn topic_for(table: &str, filter: Option<&str>) -> String {
    match filter {
        Some(filter) => format!("realtime:public:{}:{}", table, filter),
        None => format!("realtime:public:{}", table),
    }
}

/// Handle to a managed realtime connection
pub struct RealtimeClient {
    registry: Registry,
    commands: mpsc::UnboundedSender<Command>,
    status: Arc<RwLock<ChannelStatus>>,
    next_id: AtomicU64,
}

impl RealtimeClient {
    /// Open the websocket for `backend` and start the connection task
    pub fn connect(backend: &BackendClient, config: &RealtimeConfig) -> BackendResult<Self> {
        let url = channel::websocket_url(backend.base_url(), backend.anon_key())
            .map_err(|e| BackendError::Realtime(e.to_string()))?;

        let registry: Registry = Arc::new(DashMap::new());
        let status = Arc::new(RwLock::new(ChannelStatus::Disconnected));
        let (commands, command_rx) = mpsc::unbounded_channel();

        let ctx = channel::LoopContext {
            url,
            config: config.clone(),
            access_token: backend.access_token(),
            registry: Arc::clone(&registry),
            status: Arc::clone(&status),
            next_ref: Arc::new(AtomicU64::new(1)),
        };

        tokio::spawn(async move {
            channel::connection_loop(ctx, command_rx).await;
        });

        info!("Realtime channel task started");

        Ok(Self {
            registry,
            commands,
            status,
            next_id: AtomicU64::new(1),
        })
    }

    pub async fn status(&self) -> ChannelStatus {
        self.status.read().await.clone()
    }

    /// Invoke `callback` for every change on `table` matching `filter`
    pub fn subscribe<F>(&self, table: &str, filter: Option<&str>, callback: F) -> Subscription
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        let topic = topic_for(table, filter);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: Callback = Arc::new(callback);

        let first = {
            let mut entry = self.registry.entry(topic.clone()).or_default();
            entry.push((id, callback));
            entry.len() == 1
        };

        if first {
            let _ = self.commands.send(Command::Join(topic.clone()));
        }

        bazaar_metrics::metrics().realtime.subscriptions.inc();
        debug!("Subscribed #{} to {}", id, topic);

        Subscription {
            id,
            topic,
            registry: Arc::clone(&self.registry),
            commands: self.commands.clone(),
        }
    }

    /// Number of topics with at least one listener
    pub fn topic_count(&self) -> usize {
        self.registry.len()
    }

    /// Stop the connection task
    pub fn close(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Active subscription; unsubscribes on drop
pub struct Subscription {
    id: u64,
    topic: String,
    registry: Registry,
    commands: mpsc::UnboundedSender<Command>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Prune and remove under one shard lock; a racing subscribe either
        // keeps the topic alive or sends a fresh Join after this Leave.
        let id = self.id;
        let removed = self.registry.remove_if_mut(&self.topic, |_, listeners| {
            listeners.retain(|(listener, _)| *listener != id);
            listeners.is_empty()
        });

        if removed.is_some() {
            let _ = self.commands.send(Command::Leave(self.topic.clone()));
        }

        bazaar_metrics::metrics().realtime.subscriptions.dec();
        debug!("Unsubscribed #{} from {}", self.id, self.topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topic_for() {
        assert_eq!(topic_for("deployments", None), "realtime:public:deployments");
        assert_eq!(
            topic_for("agent_logs", Some("agent_id=eq.7")),
            "realtime:public:agent_logs:agent_id=eq.7"
        );
    }

    #[test]
    fn test_change_kind_parse() {
        assert_eq!(ChangeKind::parse("update"), Some(ChangeKind::Update));
        assert_eq!(ChangeKind::parse("DELETE"), Some(ChangeKind::Delete));
        assert_eq!(ChangeKind::parse("TRUNCATE"), None);
    }

    #[test]
    fn test_record_as_defaults_to_none() {
        #[derive(serde::Deserialize)]
        struct Row {
            #[allow(dead_code)]
            id: u32,
        }

        let event = ChangeEvent {
            table: "t".to_string(),
            kind: ChangeKind::Insert,
            record: json!({ "id": "not a number" }),
            old_record: Value::Null,
        };
        assert!(event.record_as::<Row>().is_none());
    }

    #[tokio::test]
    async fn test_subscription_drop_leaves_topic() {
        let registry: Registry = Arc::new(DashMap::new());
        let (commands, mut rx) = mpsc::unbounded_channel();
        let client = RealtimeClient {
            registry: Arc::clone(&registry),
            commands,
            status: Arc::new(RwLock::new(ChannelStatus::Disconnected)),
            next_id: AtomicU64::new(1),
        };

        let a = client.subscribe("deployments", None, |_| {});
        let b = client.subscribe("deployments", None, |_| {});
        assert_eq!(client.topic_count(), 1);
        assert_eq!(rx.try_recv().unwrap(), Command::Join("realtime:public:deployments".to_string()));
        assert!(rx.try_recv().is_err());

        drop(a);
        assert_eq!(client.topic_count(), 1);
        assert!(rx.try_recv().is_err());

        b.unsubscribe();
        assert_eq!(client.topic_count(), 0);
        assert_eq!(rx.try_recv().unwrap(), Command::Leave("realtime:public:deployments".to_string()));
    }

    #[tokio::test]
    async fn test_drop_keeps_topic_with_late_listener() {
        let registry: Registry = Arc::new(DashMap::new());
        let (commands, mut rx) = mpsc::unbounded_channel();
        let client = RealtimeClient {
            registry: Arc::clone(&registry),
            commands,
            status: Arc::new(RwLock::new(ChannelStatus::Disconnected)),
            next_id: AtomicU64::new(1),
        };
        let topic = topic_for("agent_logs", None);

        let a = client.subscribe("agent_logs", None, |_| {});
        assert_eq!(rx.try_recv().unwrap(), Command::Join(topic.clone()));

        // Listener registered by another subscriber while `a` is going away
        let late: Callback = Arc::new(|_: ChangeEvent| {});
        registry.get_mut(&topic).unwrap().push((u64::MAX, late));

        drop(a);
        assert_eq!(client.topic_count(), 1);
        assert_eq!(registry.get(&topic).unwrap().len(), 1);
        assert!(rx.try_recv().is_err());

        // Once the topic is really gone, a new subscriber joins again
        registry.remove(&topic);
        let _b = client.subscribe("agent_logs", None, |_| {});
        assert_eq!(rx.try_recv().unwrap(), Command::Join(topic));
    }
}
