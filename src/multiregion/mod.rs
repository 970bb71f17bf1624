pub mod client;
pub mod coordinator;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use client::HttpRegionClient;
pub use coordinator::MultiregionCoordinator;

use crate::deployment;
use crate::error::{OrchError, Result};
use crate::model::{Deployment, DeploymentStatus};
use crate::plan::PlanQueue;
use crate::state::StateStore;

/// Last known deployment status of one region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionDeploymentStatus {
    pub region: String,
    #[serde(default)]
    pub deployment_id: Option<String>,
    /// None until the region has reported a deployment.
    #[serde(default)]
    pub status: Option<DeploymentStatus>,
    #[serde(default)]
    pub status_description: String,
    /// The last query failed; `status` is what the region said before that.
    #[serde(default)]
    pub stale: bool,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RegionDeploymentStatus {
    pub fn pending(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            deployment_id: None,
            status: None,
            status_description: String::new(),
            stale: false,
            last_error: None,
            updated_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status.is_none()
    }

    /// `pending` until observed, `(stale)` appended after a failed query.
    pub fn display_status(&self) -> String {
        let base = match self.status {
            Some(status) => status.to_string(),
            None => "pending".to_string(),
        };
        if self.stale {
            format!("{base} (stale)")
        } else {
            base
        }
    }
}

/// Outcome of a fanned-out action in one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionActionResult {
    pub region: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl RegionActionResult {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Region-addressed access to a job's deployment.
#[async_trait]
pub trait RegionClient: Send + Sync {
    async fn latest_deployment(&self, job_id: &str) -> Result<Option<Deployment>>;

    async fn promote(&self, job_id: &str) -> Result<()>;

    async fn fail(&self, job_id: &str) -> Result<()>;
}

/// The server's own region, served straight from its store.
pub struct LocalRegion {
    store: Arc<StateStore>,
    plan_queue: PlanQueue,
}

impl LocalRegion {
    pub fn new(store: Arc<StateStore>, plan_queue: PlanQueue) -> Self {
        Self { store, plan_queue }
    }

    async fn job_and_deployment(&self, job_id: &str) -> Result<(Arc<crate::model::Job>, Deployment)> {
        let snapshot = self.store.snapshot().await;
        let job = snapshot
            .job_by_id(job_id)
            .ok_or_else(|| OrchError::JobNotFound(job_id.to_string()))?;
        let deployment = snapshot
            .latest_deployment_by_job(job_id)
            .ok_or_else(|| OrchError::DeploymentNotFound(format!("latest deployment of {job_id}")))?;
        Ok((job, deployment))
    }
}

#[async_trait]
impl RegionClient for LocalRegion {
    async fn latest_deployment(&self, job_id: &str) -> Result<Option<Deployment>> {
        Ok(self.store.snapshot().await.latest_deployment_by_job(job_id))
    }

    async fn promote(&self, job_id: &str) -> Result<()> {
        let (job, d) = self.job_and_deployment(job_id).await?;
        let write = deployment::promote(&job, &d, None)?;
        self.plan_queue.update_deployment(write).await?;
        Ok(())
    }

    async fn fail(&self, job_id: &str) -> Result<()> {
        let (job, d) = self.job_and_deployment(job_id).await?;
        let write = deployment::fail(&job, &d)?;
        self.plan_queue.update_deployment(write).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_and_stale_display() {
        let mut status = RegionDeploymentStatus::pending("west");
        assert!(status.is_pending());
        assert_eq!(status.display_status(), "pending");

        status.status = Some(DeploymentStatus::Running);
        assert_eq!(status.display_status(), "running");
        status.stale = true;
        assert_eq!(status.display_status(), "running (stale)");
    }
}
