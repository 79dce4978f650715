//! Agent log view: filtering plus a bounded live tail

use std::collections::VecDeque;
use std::sync::Arc;

use backend::tables::AGENT_LOGS;
use backend::{ChangeKind, RealtimeClient, Subscription};
use bazaar_types::{AgentLog, LogLevel};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

/// What the log view currently shows. Empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogFilter {
    pub min_level: Option<LogLevel>,
    /// Case-insensitive substring of the message
    pub search: Option<String>,
    pub agent_id: Option<Uuid>,
    pub since: Option<DateTime<Utc>>,
}

impl LogFilter {
    pub fn matches(&self, log: &AgentLog) -> bool {
        if self.min_level.is_some_and(|min| log.level < min) {
            return false;
        }
        if self.agent_id.is_some_and(|id| log.agent_id != id) {
            return false;
        }
        if self.since.is_some_and(|since| log.created_at < since) {
            return false;
        }
        match self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(needle) => log.message.to_lowercase().contains(&needle.to_lowercase()),
            None => true,
        }
    }

    pub fn apply<'a>(&self, logs: &'a [AgentLog]) -> Vec<&'a AgentLog> {
        logs.iter().filter(|log| self.matches(log)).collect()
    }
}

/// Most recent log rows, oldest first, capped at `capacity`
#[derive(Debug, Clone)]
pub struct LiveLogBuffer {
    capacity: usize,
    entries: VecDeque<AgentLog>,
}

impl LiveLogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Append, evicting the oldest row when full
    pub fn push(&mut self, log: AgentLog) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(log);
    }

    /// Seed with rows fetched newest-first
    pub fn extend_newest_first(&mut self, logs: Vec<AgentLog>) {
        for log in logs.into_iter().rev() {
            self.push(log);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentLog> {
        self.entries.iter()
    }

    pub fn filtered(&self, filter: &LogFilter) -> Vec<AgentLog> {
        self.entries.iter().filter(|log| filter.matches(log)).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Live tail of one agent's logs fed by the realtime channel.
///
/// Inserts on `agent_logs` for the agent are appended as they arrive;
/// dropping this stops the feed.
pub struct LiveLogs {
    buffer: Arc<Mutex<LiveLogBuffer>>,
    _subscription: Subscription,
}

impl LiveLogs {
    pub fn attach(realtime: &RealtimeClient, agent_id: Uuid, capacity: usize) -> Self {
        let buffer = Arc::new(Mutex::new(LiveLogBuffer::new(capacity)));
        let sink = Arc::clone(&buffer);
        let filter = format!("agent_id=eq.{}", agent_id);

        let subscription = realtime.subscribe(AGENT_LOGS, Some(&filter), move |event| {
            if event.kind != ChangeKind::Insert {
                return;
            }
            match event.record_as::<AgentLog>() {
                Some(log) if log.agent_id == agent_id => sink.lock().push(log),
                Some(_) => {}
                None => debug!("Skipping malformed log row"),
            }
        });

        Self {
            buffer,
            _subscription: subscription,
        }
    }

    /// Prepend rows loaded before the subscription started
    pub fn seed(&self, recent_newest_first: Vec<AgentLog>) {
        let mut buffer = self.buffer.lock();
        let live: Vec<AgentLog> = buffer.iter().cloned().collect();
        buffer.clear();
        buffer.extend_newest_first(recent_newest_first);
        for log in live {
            buffer.push(log);
        }
    }

    pub fn snapshot(&self, filter: &LogFilter) -> Vec<AgentLog> {
        self.buffer.lock().filtered(filter)
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }
}
