use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::job::Job;
use crate::model::{generate_id, short_id};

pub const DESC_RUNNING: &str = "Deployment is running";
pub const DESC_RUNNING_NEEDS_PROMOTION: &str =
    "Deployment is running but requires manual promotion";
pub const DESC_RUNNING_AUTO_PROMOTION: &str =
    "Deployment is running pending automatic promotion";
pub const DESC_PAUSED: &str = "Deployment is paused";
pub const DESC_SUCCESSFUL: &str = "Deployment completed successfully";
pub const DESC_FAILED_ALLOCATIONS: &str = "Failed due to unhealthy allocations";
pub const DESC_FAILED_BY_USER: &str = "Deployment marked as failed";
pub const DESC_STOPPED_JOB: &str = "Cancelled because job is stopped";
pub const DESC_NEWER_JOB: &str = "Cancelled due to newer version of job";
pub const DESC_CANCELLED_BY_USER: &str = "Deployment cancelled by operator";
pub const DESC_PROMOTED: &str = "Deployment is running and canaries are promoted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    #[default]
    Running,
    Paused,
    Failed,
    Successful,
    Cancelled,
}

impl DeploymentStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, DeploymentStatus::Running | DeploymentStatus::Paused)
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentStatus::Running => write!(f, "running"),
            DeploymentStatus::Paused => write!(f, "paused"),
            DeploymentStatus::Failed => write!(f, "failed"),
            DeploymentStatus::Successful => write!(f, "successful"),
            DeploymentStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Rollout progress of one task group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DeploymentState {
    pub auto_promote: bool,
    pub promoted: bool,
    /// Allocation ids of the canaries placed so far.
    pub placed_canaries: Vec<String>,
    pub desired_canaries: u32,
    pub desired_total: u32,
    pub placed_allocs: u32,
    pub healthy_allocs: u32,
    pub unhealthy_allocs: u32,
    /// Allocations created at or after this index form the current batch.
    /// Moves past the write that gives the batch's last verdict.
    #[serde(default)]
    pub batch_start_index: u64,
}

impl DeploymentState {
    pub fn requires_promotion(&self) -> bool {
        self.desired_canaries > 0 && !self.promoted
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub job_id: String,
    pub job_version: u64,
    pub job_modify_index: u64,
    pub job_create_index: u64,
    #[serde(default)]
    pub is_multiregion: bool,
    pub status: DeploymentStatus,
    pub status_description: String,
    pub task_groups: BTreeMap<String, DeploymentState>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
}

impl Deployment {
    pub fn new(job: &Job) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id(),
            job_id: job.id.clone(),
            job_version: job.version,
            job_modify_index: job.job_modify_index,
            job_create_index: job.create_index,
            is_multiregion: job.is_multiregion(),
            status: DeploymentStatus::Running,
            status_description: DESC_RUNNING.to_string(),
            task_groups: BTreeMap::new(),
            create_index: 0,
            modify_index: 0,
            create_time: now,
            modify_time: now,
        }
    }

    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    pub fn active(&self) -> bool {
        self.status.is_active()
    }

    pub fn requires_promotion(&self) -> bool {
        self.task_groups.values().any(|s| s.requires_promotion())
    }

    pub fn has_auto_promote(&self) -> bool {
        let canary_groups: Vec<_> = self
            .task_groups
            .values()
            .filter(|s| s.desired_canaries > 0)
            .collect();
        !canary_groups.is_empty() && canary_groups.iter().all(|s| s.auto_promote)
    }

    pub fn has_placed_canaries(&self) -> bool {
        self.task_groups.values().any(|s| !s.placed_canaries.is_empty())
    }

    /// Description shown while running, reflecting pending promotion.
    pub fn running_description(&self) -> &'static str {
        if self.requires_promotion() {
            if self.has_auto_promote() {
                DESC_RUNNING_AUTO_PROMOTION
            } else {
                DESC_RUNNING_NEEDS_PROMOTION
            }
        } else {
            DESC_RUNNING
        }
    }
}

/// Status change for a deployment, applied together with a plan or on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStatusUpdate {
    pub deployment_id: String,
    pub status: DeploymentStatus,
    pub status_description: String,
}
