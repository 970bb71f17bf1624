use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broker::{BlockedStats, BrokerStats};
use crate::model::{
    Allocation, ClientStatus, Deployment, DesiredStatus, Evaluation, Job, JobStatus,
};
use crate::multiregion::RegionDeploymentStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub eval_id: String,
    pub index: u64,
    pub job_modify_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeregisterResponse {
    pub eval_id: String,
    pub index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobListStub {
    pub id: String,
    pub name: String,
    pub priority: u32,
    pub status: JobStatus,
    pub stop: bool,
    pub version: u64,
    pub datacenters: Vec<String>,
    pub multiregion: bool,
    pub submit_time: Option<DateTime<Utc>>,
    pub modify_index: u64,
}

impl From<&Job> for JobListStub {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            name: job.name.clone(),
            priority: job.priority,
            status: job.status,
            stop: job.stop,
            version: job.version,
            datacenters: job.datacenters.clone(),
            multiregion: job.is_multiregion(),
            submit_time: job.submit_time,
            modify_index: job.modify_index,
        }
    }
}

/// Allocation counts of one task group, by client state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGroupSummary {
    pub queued: u32,
    pub starting: u32,
    pub running: u32,
    pub failed: u32,
    pub complete: u32,
    pub lost: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocListStub {
    pub id: String,
    pub eval_id: String,
    pub node_id: String,
    pub node_name: String,
    pub task_group: String,
    pub job_version: u64,
    pub desired_status: DesiredStatus,
    pub client_status: ClientStatus,
    pub healthy: Option<bool>,
    pub followup_eval_id: Option<String>,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
}

impl From<&Allocation> for AllocListStub {
    fn from(a: &Allocation) -> Self {
        Self {
            id: a.id.clone(),
            eval_id: a.eval_id.clone(),
            node_id: a.node_id.clone(),
            node_name: a.node_name.clone(),
            task_group: a.task_group.clone(),
            job_version: a.job.version,
            desired_status: a.desired_status,
            client_status: a.client_status,
            healthy: a.deployment_healthy(),
            followup_eval_id: a.followup_eval_id.clone(),
            create_time: a.create_time,
            modify_time: a.modify_time,
        }
    }
}

/// A pending delayed evaluation that will retry a failed allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FutureReschedule {
    pub task_group: String,
    pub eval_id: String,
    pub wait_until: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job: Job,
    pub summary: BTreeMap<String, TaskGroupSummary>,
    pub allocations: Vec<AllocListStub>,
    pub evaluations: Vec<Evaluation>,
    pub latest_deployment: Option<Deployment>,
    /// One entry per declared region for multiregion jobs.
    pub multiregion: Option<Vec<RegionDeploymentStatus>>,
    pub future_reschedules: Vec<FutureReschedule>,
    pub index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub region: String,
    pub datacenter: String,
    pub leader: bool,
    pub index: u64,
    pub broker: BrokerStats,
    pub blocked: BlockedStats,
}
