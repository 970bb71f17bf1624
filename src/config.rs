use std::net::SocketAddr;
use std::time::Duration;

/// Evaluation broker tuning.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// How long a dequeued evaluation may stay unacked before it is requeued.
    pub nack_timeout_ms: u64,
    /// Deliveries after which an evaluation is moved to the failed set.
    pub delivery_limit: u32,
    /// Requeue delay after the first nack.
    pub initial_nack_delay_ms: u64,
    /// Requeue delay after every later nack.
    pub subsequent_nack_delay_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            nack_timeout_ms: 60_000,
            delivery_limit: 3,
            initial_nack_delay_ms: 1_000,
            subsequent_nack_delay_ms: 20_000,
        }
    }
}

impl BrokerConfig {
    pub fn nack_timeout(&self) -> Duration {
        Duration::from_millis(self.nack_timeout_ms)
    }

    /// Delay before a nacked evaluation becomes ready again, given how many
    /// times it has been delivered so far.
    pub fn nack_delay(&self, deliveries: u32) -> Duration {
        if deliveries <= 1 {
            Duration::from_millis(self.initial_nack_delay_ms)
        } else {
            Duration::from_millis(self.subsequent_nack_delay_ms)
        }
    }
}

/// A federated region reachable over HTTP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionPeer {
    pub region: String,
    pub addr: String, // base URL, e.g. http://10.0.0.2:4646
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub region: String,
    pub datacenter: String,
    /// Scheduler workers running in parallel.
    pub num_schedulers: usize,
    /// Bounded wait used by each worker's dequeue call.
    pub dequeue_timeout_ms: u64,
    /// Plan submissions per evaluation before it is marked failed.
    pub max_plan_attempts: u32,
    pub broker: BrokerConfig,
    /// Period of the leader's reaper (canceled/failed evals, expired nodes).
    pub reap_interval_ms: u64,
    /// Deployment watcher health re-check tick.
    pub deployment_watch_interval_ms: u64,
    /// Multiregion status pull interval.
    pub multiregion_poll_interval_ms: u64,
    /// Nodes that miss heartbeats for this long are marked down. Zero disables expiry.
    pub node_heartbeat_ttl_ms: u64,
    /// Maximum wait for a blocking state query.
    pub blocking_query_timeout_ms: u64,
    pub http_addr: Option<SocketAddr>,
    pub peers: Vec<RegionPeer>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            region: "global".to_string(),
            datacenter: "dc1".to_string(),
            num_schedulers: 2,
            dequeue_timeout_ms: 500,
            max_plan_attempts: 5,
            broker: BrokerConfig::default(),
            reap_interval_ms: 1_000,
            deployment_watch_interval_ms: 500,
            multiregion_poll_interval_ms: 5_000,
            node_heartbeat_ttl_ms: 10_000,
            blocking_query_timeout_ms: 5_000,
            http_addr: None,
            peers: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn new(region: impl Into<String>, datacenter: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            datacenter: datacenter.into(),
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, region: impl Into<String>, addr: impl Into<String>) -> Self {
        self.peers.push(RegionPeer {
            region: region.into(),
            addr: addr.into(),
        });
        self
    }

    pub fn with_http_addr(mut self, addr: SocketAddr) -> Self {
        self.http_addr = Some(addr);
        self
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn deployment_watch_interval(&self) -> Duration {
        Duration::from_millis(self.deployment_watch_interval_ms)
    }

    pub fn multiregion_poll_interval(&self) -> Duration {
        Duration::from_millis(self.multiregion_poll_interval_ms)
    }

    pub fn blocking_query_timeout(&self) -> Duration {
        Duration::from_millis(self.blocking_query_timeout_ms)
    }

    pub fn node_heartbeat_ttl(&self) -> Option<Duration> {
        if self.node_heartbeat_ttl_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.node_heartbeat_ttl_ms))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_config_default() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.nack_timeout_ms, 60_000);
        assert_eq!(cfg.delivery_limit, 3);
        assert_eq!(cfg.initial_nack_delay_ms, 1_000);
        assert_eq!(cfg.subsequent_nack_delay_ms, 20_000);
    }

    #[test]
    fn broker_nack_delay_grows_after_first_delivery() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.nack_delay(0), Duration::from_secs(1));
        assert_eq!(cfg.nack_delay(1), Duration::from_secs(1));
        assert_eq!(cfg.nack_delay(2), Duration::from_secs(20));
        assert_eq!(cfg.nack_delay(7), Duration::from_secs(20));
    }

    #[test]
    fn server_config_default() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.region, "global");
        assert_eq!(cfg.datacenter, "dc1");
        assert_eq!(cfg.num_schedulers, 2);
        assert_eq!(cfg.max_plan_attempts, 5);
        assert!(cfg.http_addr.is_none());
        assert!(cfg.peers.is_empty());
        assert_eq!(cfg.node_heartbeat_ttl(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn server_config_new() {
        let cfg = ServerConfig::new("east", "east-1");
        assert_eq!(cfg.region, "east");
        assert_eq!(cfg.datacenter, "east-1");
        assert_eq!(cfg.num_schedulers, 2);
    }

    #[test]
    fn server_config_with_peer() {
        let cfg = ServerConfig::new("east", "east-1")
            .with_peer("west", "http://10.0.0.2:4646")
            .with_peer("south", "http://10.0.0.3:4646");
        assert_eq!(cfg.peers.len(), 2);
        assert_eq!(cfg.peers[0].region, "west");
        assert_eq!(cfg.peers[0].addr, "http://10.0.0.2:4646");
        assert_eq!(cfg.peers[1].region, "south");
    }

    #[test]
    fn zero_heartbeat_ttl_disables_expiry() {
        let cfg = ServerConfig {
            node_heartbeat_ttl_ms: 0,
            ..Default::default()
        };
        assert!(cfg.node_heartbeat_ttl().is_none());
    }

    #[test]
    fn with_http_addr_sets_listener() {
        let addr: SocketAddr = "127.0.0.1:4646".parse().unwrap();
        let cfg = ServerConfig::default().with_http_addr(addr);
        assert_eq!(cfg.http_addr, Some(addr));
    }
}
