//! Log Streamer: one shared upstream subscription per (cluster, workspace)
//! fanned out to N downstream consumers, grounded on the per-subject
//! map-of-channels shape `common::wait_registry::DirectWaitRegistry` uses for
//! NATS replies — here the "subject" is a (cluster, workspace) key, the
//! payload is a log line instead of a single reply, and the subscription
//! survives across multiple deliveries instead of being torn down after one.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

const DEFAULT_RING_SIZE: usize = 2_000;

#[derive(Clone, Debug, PartialEq)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

#[derive(Clone, Debug)]
pub enum LogEvent {
    Line(LogLine),
    /// Emitted to a consumer that fell behind the ring before it is dropped.
    Lagged,
}

struct Subscription {
    tx: broadcast::Sender<LogEvent>,
    ring: std::collections::VecDeque<LogLine>,
    ring_size: usize,
}

impl Subscription {
    fn new(ring_size: usize) -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            tx,
            ring: std::collections::VecDeque::with_capacity(ring_size),
            ring_size,
        }
    }

    fn push(&mut self, line: LogLine) {
        if self.ring.len() == self.ring_size {
            self.ring.pop_front();
        }
        self.ring.push_back(line.clone());
        let _ = self.tx.send(LogEvent::Line(line));
    }
}

#[derive(Clone)]
pub struct LogStreamer {
    ring_size: usize,
    subscriptions: Arc<Mutex<HashMap<(Uuid, String), Subscription>>>,
}

impl LogStreamer {
    pub fn new() -> Self {
        Self::with_ring_size(DEFAULT_RING_SIZE)
    }

    pub fn with_ring_size(ring_size: usize) -> Self {
        Self {
            ring_size,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Appends a line from the upstream source (one producer per key).
    pub async fn publish(&self, cluster_id: Uuid, workspace: &str, line: LogLine) {
        let mut subs = self.subscriptions.lock().await;
        subs.entry((cluster_id, workspace.to_string()))
            .or_insert_with(|| Subscription::new(self.ring_size))
            .push(line);
    }

    /// Joins the stream for (cluster, workspace): returns the ring's current
    /// contents plus a receiver for everything after. A receiver that lags
    /// past the ring observes `LogEvent::Lagged` from `recv()` and should
    /// stop — it is not automatically resubscribed.
    pub async fn subscribe(
        &self,
        cluster_id: Uuid,
        workspace: &str,
    ) -> (Vec<LogLine>, broadcast::Receiver<LogEvent>) {
        let mut subs = self.subscriptions.lock().await;
        let sub = subs
            .entry((cluster_id, workspace.to_string()))
            .or_insert_with(|| Subscription::new(self.ring_size));
        (sub.ring.iter().cloned().collect(), sub.tx.subscribe())
    }

    pub async fn drop_subscription(&self, cluster_id: Uuid, workspace: &str) {
        self.subscriptions
            .lock()
            .await
            .remove(&(cluster_id, workspace.to_string()));
    }
}

impl Default for LogStreamer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(s: &str) -> LogLine {
        LogLine {
            timestamp: Utc::now(),
            line: s.to_string(),
        }
    }

    #[tokio::test]
    async fn late_joiner_gets_ring_then_live_lines() {
        let streamer = LogStreamer::new();
        let cluster = Uuid::new_v4();
        streamer.publish(cluster, "ws", line("a")).await;
        streamer.publish(cluster, "ws", line("b")).await;

        let (ring, mut rx) = streamer.subscribe(cluster, "ws").await;
        assert_eq!(ring.iter().map(|l| l.line.clone()).collect::<Vec<_>>(), vec!["a", "b"]);

        streamer.publish(cluster, "ws", line("c")).await;
        match rx.recv().await.unwrap() {
            LogEvent::Line(l) => assert_eq!(l.line, "c"),
            LogEvent::Lagged => panic!("unexpected lag"),
        }
    }

    #[tokio::test]
    async fn ring_evicts_oldest_past_capacity() {
        let streamer = LogStreamer::with_ring_size(2);
        let cluster = Uuid::new_v4();
        streamer.publish(cluster, "ws", line("a")).await;
        streamer.publish(cluster, "ws", line("b")).await;
        streamer.publish(cluster, "ws", line("c")).await;

        let (ring, _rx) = streamer.subscribe(cluster, "ws").await;
        assert_eq!(ring.iter().map(|l| l.line.clone()).collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn separate_workspaces_do_not_share_a_ring() {
        let streamer = LogStreamer::new();
        let cluster = Uuid::new_v4();
        streamer.publish(cluster, "ws-a", line("a")).await;
        let (ring, _rx) = streamer.subscribe(cluster, "ws-b").await;
        assert!(ring.is_empty());
    }
}
