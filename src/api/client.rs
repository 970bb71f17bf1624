use std::time::Duration;

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::{DrainRequest, ErrorBody, NodeStatusRequest, PauseRequest, PromoteRequest};
use crate::error::{OrchError, Result};
use crate::model::{Allocation, Deployment, Evaluation, Job, Node, NodeStatus};
use crate::multiregion::{RegionActionResult, RegionDeploymentStatus};
use crate::server::types::{
    DeregisterResponse, JobListStub, JobStatusReport, RegisterResponse, ServerStatus,
};
use crate::state::AllocClientUpdate;

/// HTTP client for a server's `/v1` API.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<ErrorBody>(&body) {
                Ok(ErrorBody {
                    matches: Some(matches),
                    ..
                }) => OrchError::AmbiguousPrefix {
                    prefix: String::new(),
                    matches,
                },
                Ok(parsed) => OrchError::Api {
                    status: status.as_u16(),
                    message: parsed.error,
                },
                Err(_) => OrchError::Api {
                    status: status.as_u16(),
                    message: body,
                },
            });
        }
        Ok(response.json().await?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.client.get(self.url(path)).send().await?;
        Self::decode(response).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        Self::decode(response).await
    }

    async fn put<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self.client.put(self.url(path)).json(body).send().await?;
        Self::decode(response).await
    }

    // Jobs

    pub async fn register_job(&self, job: &Job) -> Result<RegisterResponse> {
        self.post("jobs", job).await
    }

    pub async fn deregister_job(&self, job_id: &str) -> Result<DeregisterResponse> {
        let response = self.client.delete(self.url(&format!("job/{job_id}"))).send().await?;
        Self::decode(response).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobListStub>> {
        self.get("jobs").await
    }

    /// Resolve `prefix` to a job and report on it once the server has
    /// reached `min_index`.
    pub async fn job_status(&self, prefix: &str, min_index: u64) -> Result<JobStatusReport> {
        self.get(&format!("job/{prefix}/status?index={min_index}"))
            .await
            .map_err(|err| match err {
                OrchError::AmbiguousPrefix { matches, .. } => OrchError::AmbiguousPrefix {
                    prefix: prefix.to_string(),
                    matches,
                },
                other => other,
            })
    }

    pub async fn job_versions(&self, job_id: &str) -> Result<Vec<Job>> {
        self.get(&format!("job/{job_id}/versions")).await
    }

    pub async fn job_deployment(&self, job_id: &str) -> Result<Option<Deployment>> {
        self.get(&format!("job/{job_id}/deployment")).await
    }

    pub async fn promote_job_deployment(&self, job_id: &str) -> Result<u64> {
        self.post(&format!("job/{job_id}/deployment/promote"), &()).await
    }

    pub async fn fail_job_deployment(&self, job_id: &str) -> Result<u64> {
        self.post(&format!("job/{job_id}/deployment/fail"), &()).await
    }

    pub async fn deployment_status(
        &self,
        job_id: &str,
        region: Option<&str>,
    ) -> Result<Vec<RegionDeploymentStatus>> {
        let path = match region {
            Some(region) => format!("job/{job_id}/deployments/regions?region={region}"),
            None => format!("job/{job_id}/deployments/regions"),
        };
        self.get(&path).await
    }

    pub async fn multiregion_promote(&self, job_id: &str) -> Result<Vec<RegionActionResult>> {
        self.post(&format!("job/{job_id}/deployment/multiregion/promote"), &())
            .await
    }

    pub async fn multiregion_fail(&self, job_id: &str) -> Result<Vec<RegionActionResult>> {
        self.post(&format!("job/{job_id}/deployment/multiregion/fail"), &())
            .await
    }

    // Deployments

    pub async fn pause_deployment(&self, id: &str, pause: bool) -> Result<u64> {
        self.post(&format!("deployment/{id}/pause"), &PauseRequest { pause })
            .await
    }

    pub async fn promote_deployment(&self, id: &str, groups: Option<Vec<String>>) -> Result<u64> {
        self.post(&format!("deployment/{id}/promote"), &PromoteRequest { groups })
            .await
    }

    pub async fn fail_deployment(&self, id: &str) -> Result<u64> {
        self.post(&format!("deployment/{id}/fail"), &()).await
    }

    pub async fn cancel_deployment(&self, id: &str) -> Result<u64> {
        self.post(&format!("deployment/{id}/cancel"), &()).await
    }

    pub async fn evaluation(&self, id: &str) -> Result<Evaluation> {
        self.get(&format!("evaluation/{id}")).await
    }

    // Nodes

    pub async fn register_node(&self, node: &Node) -> Result<u64> {
        self.post("nodes", node).await
    }

    pub async fn heartbeat(&self, node_id: &str) -> Result<u64> {
        self.put(&format!("node/{node_id}/heartbeat"), &()).await
    }

    pub async fn node(&self, node_id: &str) -> Result<Node> {
        self.get(&format!("node/{node_id}")).await
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.get("nodes").await
    }

    pub async fn update_node_status(&self, node_id: &str, status: NodeStatus) -> Result<Vec<String>> {
        self.post(&format!("node/{node_id}/status"), &NodeStatusRequest { status })
            .await
    }

    pub async fn update_node_drain(&self, node_id: &str, drain: bool) -> Result<Vec<String>> {
        self.post(&format!("node/{node_id}/drain"), &DrainRequest { drain })
            .await
    }

    pub async fn node_allocations(&self, node_id: &str) -> Result<Vec<Allocation>> {
        self.get(&format!("node/{node_id}/allocations")).await
    }

    pub async fn update_allocations(&self, updates: &[AllocClientUpdate]) -> Result<u64> {
        self.post("allocations/client-update", updates).await
    }

    pub async fn status(&self) -> Result<ServerStatus> {
        self.get("status").await
    }
}
