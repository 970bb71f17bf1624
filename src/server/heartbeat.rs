use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Last heartbeat seen from each node.
#[derive(Debug)]
pub struct HeartbeatTracker {
    ttl: Option<Duration>,
    last_seen: Mutex<HashMap<String, Instant>>,
}

impl HeartbeatTracker {
    /// A `None` ttl never expires anything.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub async fn record(&self, node_id: &str) {
        self.last_seen
            .lock()
            .await
            .insert(node_id.to_string(), Instant::now());
    }

    pub async fn forget(&self, node_id: &str) {
        self.last_seen.lock().await.remove(node_id);
    }

    pub async fn is_alive(&self, node_id: &str) -> bool {
        let Some(ttl) = self.ttl else {
            return true;
        };
        self.last_seen
            .lock()
            .await
            .get(node_id)
            .is_some_and(|seen| seen.elapsed() < ttl)
    }

    /// Remove and return every node whose heartbeat is older than the ttl.
    pub async fn take_expired(&self) -> Vec<String> {
        let Some(ttl) = self.ttl else {
            return Vec::new();
        };
        let mut last_seen = self.last_seen.lock().await;
        let expired: Vec<String> = last_seen
            .iter()
            .filter(|(_, seen)| seen.elapsed() >= ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            last_seen.remove(id);
        }
        expired
    }
}
