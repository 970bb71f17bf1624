//! Tests for the HTTP API client and the HTTP region client against a
//! server listening on a local port.


use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use nomad_orch::agent::{dev_node, DevAgent, NodeEndpoint};
use nomad_orch::api::{self, ApiClient};
use nomad_orch::error::OrchError;
use nomad_orch::model::{ClientStatus, NodeStatus};
use nomad_orch::multiregion::client::HttpRegionClient;
use nomad_orch::multiregion::RegionClient;
use test_harness::{assert_eventually, rolling_job, service_job, TestRegion};

/// Serve `region`'s API on an ephemeral port.
async fn serve(region: &TestRegion) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api::router(region.server.clone());
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
            .unwrap();
    });
    (addr, shutdown)
}

fn client(addr: SocketAddr) -> ApiClient {
    ApiClient::new(format!("http://{addr}"), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_job_lifecycle_over_http() {
    let region = TestRegion::start("global").await;
    let (addr, shutdown) = serve(&region).await;
    let api = client(addr);

    let resp = api.register_job(&service_job("web", 1)).await.unwrap();
    let report = api.job_status("web", resp.index).await.unwrap();
    assert_eq!(report.job.id, "web");
    assert!(report.index >= resp.index);

    let jobs = api.list_jobs().await.unwrap();
    assert_eq!(jobs.len(), 1);

    let versions = api.job_versions("web").await.unwrap();
    assert_eq!(versions.len(), 1);

    let eval = api.evaluation(&resp.eval_id).await.unwrap();
    assert_eq!(eval.job_id, "web");

    api.deregister_job("web").await.unwrap();
    let versions = api.job_versions("web").await.unwrap();
    assert!(versions[0].stop);

    shutdown.cancel();
}

#[tokio::test]
async fn test_client_errors_map_back() {
    let region = TestRegion::start("global").await;
    region.server.register_job(service_job("api-a", 1)).await.unwrap();
    region.server.register_job(service_job("api-b", 1)).await.unwrap();
    let (addr, shutdown) = serve(&region).await;
    let api = client(addr);

    match api.job_status("api", 0).await {
        Err(OrchError::AmbiguousPrefix { prefix, matches }) => {
            assert_eq!(prefix, "api");
            assert_eq!(matches.len(), 2);
        }
        other => panic!("expected ambiguous prefix, got {other:?}"),
    }

    match api.job_status("missing", 0).await {
        Err(OrchError::Api { status, message }) => {
            assert_eq!(status, 404);
            assert!(message.contains("missing"));
        }
        other => panic!("expected not found, got {other:?}"),
    }

    shutdown.cancel();
}

#[tokio::test]
async fn test_region_client_over_http() {
    let region = TestRegion::start("west").await;
    let (addr, shutdown) = serve(&region).await;
    let west = HttpRegionClient::new("west", client(addr));

    assert!(
        west.latest_deployment("web").await.unwrap().is_none(),
        "Unknown jobs have no deployment"
    );

    region
        .server
        .register_job(rolling_job("web", 1, 30_000))
        .await
        .unwrap();
    assert_eventually(
        || async { west.latest_deployment("web").await.is_ok_and(|d| d.is_some()) },
        Duration::from_secs(5),
        "Deployment should be visible over HTTP",
    )
    .await;

    west.fail("web").await.expect("Fail should be forwarded");
    let d = region.latest_deployment("web").await.unwrap();
    assert_eq!(d.status, nomad_orch::model::DeploymentStatus::Failed);

    shutdown.cancel();
}

#[tokio::test]
async fn test_unreachable_region_is_unavailable() {
    // Bind then drop to get a port nothing listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let west = HttpRegionClient::new("west", client(addr));
    let err = west.latest_deployment("web").await.unwrap_err();
    assert!(matches!(err, OrchError::RegionUnavailable { .. }), "got {err:?}");
}

#[tokio::test]
async fn test_dev_agent_over_http() {
    let region = TestRegion::start("global").await;
    let (addr, shutdown) = serve(&region).await;

    let node = dev_node("http-node", "dc1");
    let node_id = node.id.clone();
    let endpoint: Arc<dyn NodeEndpoint> = Arc::new(client(addr));
    let agent = DevAgent::new(node, endpoint, Duration::from_millis(50));
    let agent_token = CancellationToken::new();
    let token = agent_token.clone();
    let handle = tokio::spawn(async move { agent.run(token).await });

    let api = client(addr);
    assert_eventually(
        || async {
            api.node(&node_id)
                .await
                .is_ok_and(|n| n.status == NodeStatus::Ready)
        },
        Duration::from_secs(5),
        "Agent should register over HTTP",
    )
    .await;

    api.register_job(&service_job("web", 2)).await.unwrap();
    assert_eventually(
        || async {
            api.node_allocations(&node_id).await.is_ok_and(|allocs| {
                allocs.len() == 2
                    && allocs
                        .iter()
                        .all(|a| a.client_status == ClientStatus::Running)
            })
        },
        Duration::from_secs(5),
        "Agent should start its allocations",
    )
    .await;

    let status = api.status().await.unwrap();
    assert!(status.leader);

    agent_token.cancel();
    handle.await.unwrap();
    shutdown.cancel();
}
