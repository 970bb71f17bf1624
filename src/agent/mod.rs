use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::api::ApiClient;
use crate::error::{OrchError, Result};
use crate::model::{generate_id, Allocation, ClientStatus, DesiredStatus, Node, Resources};
use crate::server::Server;
use crate::state::AllocClientUpdate;

/// Task config key that makes the mock driver fail the task on start.
pub const MOCK_FAIL_ON_START: &str = "fail_on_start";

pub const MOCK_DRIVER: &str = "mock_driver";

/// What a node agent needs from the servers.
#[async_trait]
pub trait NodeEndpoint: Send + Sync {
    async fn register_node(&self, node: &Node) -> Result<u64>;

    async fn heartbeat(&self, node_id: &str) -> Result<u64>;

    async fn node_allocations(&self, node_id: &str) -> Result<Vec<Allocation>>;

    async fn update_allocations(&self, updates: Vec<AllocClientUpdate>) -> Result<u64>;
}

#[async_trait]
impl NodeEndpoint for Server {
    async fn register_node(&self, node: &Node) -> Result<u64> {
        Server::register_node(self, node.clone()).await
    }

    async fn heartbeat(&self, node_id: &str) -> Result<u64> {
        self.node_heartbeat(node_id).await
    }

    async fn node_allocations(&self, node_id: &str) -> Result<Vec<Allocation>> {
        Server::node_allocations(self, node_id).await
    }

    async fn update_allocations(&self, updates: Vec<AllocClientUpdate>) -> Result<u64> {
        Server::update_allocations(self, updates).await
    }
}

#[async_trait]
impl NodeEndpoint for ApiClient {
    async fn register_node(&self, node: &Node) -> Result<u64> {
        ApiClient::register_node(self, node).await
    }

    async fn heartbeat(&self, node_id: &str) -> Result<u64> {
        ApiClient::heartbeat(self, node_id).await
    }

    async fn node_allocations(&self, node_id: &str) -> Result<Vec<Allocation>> {
        ApiClient::node_allocations(self, node_id).await
    }

    async fn update_allocations(&self, updates: Vec<AllocClientUpdate>) -> Result<u64> {
        ApiClient::update_allocations(self, &updates).await
    }
}

/// A node with the mock driver and room for a handful of small tasks.
pub fn dev_node(name: &str, datacenter: &str) -> Node {
    let mut node = Node::new(generate_id(), datacenter, Resources::new(4_000, 8_192)).with_driver(MOCK_DRIVER);
    node.name = name.to_string();
    node
}

/// The client status the mock driver moves `alloc` to, if any.
pub fn next_client_status(alloc: &Allocation) -> Option<(ClientStatus, &'static str)> {
    match alloc.desired_status {
        DesiredStatus::Stop | DesiredStatus::Evict if !alloc.client_terminal() => {
            Some((ClientStatus::Complete, "stopped by server"))
        }
        DesiredStatus::Run if alloc.client_status == ClientStatus::Pending => {
            let fails = alloc
                .tg()
                .map(|tg| {
                    tg.tasks.iter().any(|t| {
                        t.config
                            .get(MOCK_FAIL_ON_START)
                            .is_some_and(|v| v == "true")
                    })
                })
                .unwrap_or(false);
            if fails {
                Some((ClientStatus::Failed, "task failed to start"))
            } else {
                Some((ClientStatus::Running, "tasks started"))
            }
        }
        _ => None,
    }
}

/// Development node agent: registers a node, heartbeats, and runs its
/// allocations on the mock driver.
pub struct DevAgent {
    node: Node,
    endpoint: Arc<dyn NodeEndpoint>,
    interval: Duration,
}

impl DevAgent {
    pub fn new(node: Node, endpoint: Arc<dyn NodeEndpoint>, interval: Duration) -> Self {
        Self {
            node,
            endpoint,
            interval,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node.id
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.interval);
        let mut registered = false;
        tracing::info!(node_id = %self.node.id, name = %self.node.name, "Node agent started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
            if !registered {
                match self.endpoint.register_node(&self.node).await {
                    Ok(_) => registered = true,
                    Err(err) => {
                        tracing::warn!(node_id = %self.node.id, error = %err, "Node registration failed");
                        continue;
                    }
                }
            }
            match self.endpoint.heartbeat(&self.node.id).await {
                Ok(_) => {}
                Err(OrchError::NodeNotFound(_)) | Err(OrchError::Api { status: 404, .. }) => {
                    registered = false;
                    continue;
                }
                Err(err) => {
                    tracing::warn!(node_id = %self.node.id, error = %err, "Heartbeat failed");
                    continue;
                }
            }
            if let Err(err) = self.sync_once().await {
                tracing::warn!(node_id = %self.node.id, error = %err, "Allocation sync failed");
            }
        }
        tracing::info!(node_id = %self.node.id, "Node agent stopped");
    }

    /// Push every allocation the mock driver would move forward. Returns how
    /// many were updated.
    pub async fn sync_once(&self) -> Result<usize> {
        let allocs = self.endpoint.node_allocations(&self.node.id).await?;
        let updates: Vec<AllocClientUpdate> = allocs
            .iter()
            .filter_map(|a| {
                next_client_status(a).map(|(status, description)| AllocClientUpdate {
                    alloc_id: a.id.clone(),
                    client_status: status,
                    description: description.to_string(),
                })
            })
            .collect();
        if updates.is_empty() {
            return Ok(0);
        }
        let count = updates.len();
        tracing::debug!(node_id = %self.node.id, count, "Reporting allocation status");
        self.endpoint.update_allocations(updates).await?;
        Ok(count)
    }
}
