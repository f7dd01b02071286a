//! Per-deployment log buffer with live fan-out.
//!
//! Every deployment key owns a channel holding the lines of its current run
//! and the senders of its live subscribers. A subscriber registers and takes
//! its history snapshot under the same lock as `append`, so it sees every
//! line exactly once and in order, followed by a single terminal marker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::deployment::{DeploymentKey, DeploymentStatus};
use crate::stream::sink::LogSink;

/// Event delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum LogEvent {
    Line(String),
    Finished(DeploymentStatus),
}

#[derive(Debug, Default)]
struct Channel {
    lines: Vec<String>,
    finished: Option<DeploymentStatus>,
    subscribers: Vec<(u64, mpsc::UnboundedSender<LogEvent>)>,
}

impl Channel {
    fn publish(&mut self, event: LogEvent) {
        self.subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }
}

/// In-memory log broadcaster
#[derive(Debug, Default)]
pub struct LogBroadcaster {
    channels: Mutex<HashMap<DeploymentKey, Channel>>,
    next_subscriber: AtomicU64,
}

impl LogBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new run for `key`: clears the previous run's lines and
    /// terminal state. Subscribers waiting on the key stay registered.
    pub fn begin(&self, key: &DeploymentKey) {
        let mut channels = self.lock();
        let channel = channels.entry(key.clone()).or_default();
        channel.lines.clear();
        channel.finished = None;
    }

    /// Append a line and publish it to live subscribers
    pub fn append(&self, key: &DeploymentKey, line: impl Into<String>) {
        let line = line.into();
        let mut channels = self.lock();
        let channel = channels.entry(key.clone()).or_default();
        if let Some(status) = channel.finished {
            warn!("Dropping log line for {} after run finished ({}): {}", key, status, line);
            return;
        }
        channel.lines.push(line.clone());
        channel.publish(LogEvent::Line(line));
    }

    /// Emit the terminal marker and close all live subscriptions for the run
    pub fn finish(&self, key: &DeploymentKey, status: DeploymentStatus) {
        let mut channels = self.lock();
        let channel = channels.entry(key.clone()).or_default();
        if channel.finished.is_some() {
            warn!("Run for {} already finished", key);
            return;
        }
        channel.finished = Some(status);
        channel.publish(LogEvent::Finished(status));
        channel.subscribers.clear();
        debug!("Log stream for {} finished with {}", key, status);
    }

    /// Lines of the current run, or `None` when nothing was ever logged for the key
    pub fn history(&self, key: &DeploymentKey) -> Option<Vec<String>> {
        let channels = self.lock();
        channels
            .get(key)
            .filter(|c| !c.lines.is_empty() || c.finished.is_some())
            .map(|c| c.lines.clone())
    }

    /// Subscribe to a key: history first, then live lines, then the terminal marker
    pub fn subscribe(&self, key: &DeploymentKey) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut channels = self.lock();
        let channel = channels.entry(key.clone()).or_default();

        let mut backlog: VecDeque<LogEvent> = channel.lines.iter().cloned().map(LogEvent::Line).collect();
        match channel.finished {
            Some(status) => backlog.push_back(LogEvent::Finished(status)),
            None => channel.subscribers.push((id, tx)),
        }

        Subscription {
            id,
            key: key.clone(),
            backlog,
            rx,
        }
    }

    /// Remove a live subscription
    pub fn unsubscribe(&self, subscription: Subscription) {
        let mut channels = self.lock();
        if let Some(channel) = channels.get_mut(&subscription.key) {
            channel.subscribers.retain(|(id, _)| *id != subscription.id);
        }
    }

    /// Number of live subscribers on a key
    pub fn subscriber_count(&self, key: &DeploymentKey) -> usize {
        self.lock().get(key).map(|c| c.subscribers.len()).unwrap_or(0)
    }

    /// Sink that appends to `key`
    pub fn sink(self: &Arc<Self>, key: &DeploymentKey) -> KeySink {
        KeySink {
            key: key.clone(),
            broadcaster: self.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DeploymentKey, Channel>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A subscriber's view of one key's log stream
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    key: DeploymentKey,
    backlog: VecDeque<LogEvent>,
    rx: mpsc::UnboundedReceiver<LogEvent>,
}

impl Subscription {
    pub fn key(&self) -> &DeploymentKey {
        &self.key
    }

    /// Next event; `None` once the terminal marker has been delivered
    pub async fn next(&mut self) -> Option<LogEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        self.rx.recv().await
    }
}

/// [`LogSink`] bound to one deployment key
#[derive(Debug, Clone)]
pub struct KeySink {
    key: DeploymentKey,
    broadcaster: Arc<LogBroadcaster>,
}

impl LogSink for KeySink {
    fn log(&self, line: String) {
        self.broadcaster.append(&self.key, line);
    }
}
