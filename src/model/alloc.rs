use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::job::{Job, TaskGroup};
use crate::model::node::Resources;
use crate::model::{generate_id, short_id};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DesiredStatus {
    #[default]
    Run,
    Stop,
    Evict,
}

impl std::fmt::Display for DesiredStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DesiredStatus::Run => write!(f, "run"),
            DesiredStatus::Stop => write!(f, "stop"),
            DesiredStatus::Evict => write!(f, "evict"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
}

impl ClientStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClientStatus::Complete | ClientStatus::Failed | ClientStatus::Lost
        )
    }
}

impl std::fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientStatus::Pending => write!(f, "pending"),
            ClientStatus::Running => write!(f, "running"),
            ClientStatus::Complete => write!(f, "complete"),
            ClientStatus::Failed => write!(f, "failed"),
            ClientStatus::Lost => write!(f, "lost"),
        }
    }
}

/// One reschedule in an allocation's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RescheduleEvent {
    pub reschedule_time: DateTime<Utc>,
    pub prev_alloc_id: String,
    pub prev_node_id: String,
    /// Zero-based attempt number this event represents.
    pub attempt: u32,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RescheduleTracker {
    pub events: Vec<RescheduleEvent>,
}

impl RescheduleTracker {
    /// Attempt number the next reschedule will carry.
    pub fn next_attempt(&self) -> u32 {
        self.events.last().map(|e| e.attempt + 1).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AllocDeploymentStatus {
    /// None until the deployment watcher decides.
    pub healthy: Option<bool>,
    pub timestamp: Option<DateTime<Utc>>,
    pub canary: bool,
}

/// Why placements failed or how nodes scored, recorded per task group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AllocMetric {
    pub nodes_evaluated: u32,
    pub nodes_filtered: u32,
    pub nodes_available: BTreeMap<String, u32>,
    pub class_filtered: BTreeMap<String, u32>,
    pub constraint_filtered: BTreeMap<String, u32>,
    pub nodes_exhausted: u32,
    pub dimension_exhausted: BTreeMap<String, u32>,
    /// Final normalized score per node.
    pub scores: BTreeMap<String, f64>,
    /// Further placements of the same group that failed the same way.
    pub coalesced_failures: u32,
}

impl AllocMetric {
    pub fn filter_node(&mut self, class: &str, reason: &str) {
        self.nodes_filtered += 1;
        if !class.is_empty() {
            *self.class_filtered.entry(class.to_string()).or_default() += 1;
        }
        *self.constraint_filtered.entry(reason.to_string()).or_default() += 1;
    }

    pub fn exhausted_node(&mut self, dimension: &str) {
        self.nodes_exhausted += 1;
        *self.dimension_exhausted.entry(dimension.to_string()).or_default() += 1;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub id: String,
    pub eval_id: String,
    /// Slot name `job.group[index]`.
    pub name: String,
    pub node_id: String,
    #[serde(default)]
    pub node_name: String,
    pub job_id: String,
    pub job: Arc<Job>,
    pub task_group: String,
    pub resources: Resources,
    pub desired_status: DesiredStatus,
    #[serde(default)]
    pub desired_description: String,
    pub client_status: ClientStatus,
    #[serde(default)]
    pub client_description: String,
    /// When the client status last changed.
    #[serde(default)]
    pub client_status_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deployment_id: Option<String>,
    #[serde(default)]
    pub deployment_status: Option<AllocDeploymentStatus>,
    #[serde(default)]
    pub reschedule_tracker: Option<RescheduleTracker>,
    #[serde(default)]
    pub previous_allocation: Option<String>,
    #[serde(default)]
    pub next_allocation: Option<String>,
    /// Delayed evaluation that will replace this allocation.
    #[serde(default)]
    pub followup_eval_id: Option<String>,
    #[serde(default)]
    pub metrics: AllocMetric,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
}

impl Allocation {
    pub fn new(
        eval_id: impl Into<String>,
        job: Arc<Job>,
        tg: &TaskGroup,
        name: impl Into<String>,
        node_id: impl Into<String>,
        node_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id(),
            eval_id: eval_id.into(),
            name: name.into(),
            node_id: node_id.into(),
            node_name: node_name.into(),
            job_id: job.id.clone(),
            task_group: tg.name.clone(),
            resources: tg.combined_resources(),
            job,
            desired_status: DesiredStatus::Run,
            desired_description: String::new(),
            client_status: ClientStatus::Pending,
            client_description: String::new(),
            client_status_time: Some(now),
            deployment_id: None,
            deployment_status: None,
            reschedule_tracker: None,
            previous_allocation: None,
            next_allocation: None,
            followup_eval_id: None,
            metrics: AllocMetric::default(),
            create_index: 0,
            modify_index: 0,
            create_time: now,
            modify_time: now,
        }
    }

    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    /// Slot index parsed from the `job.group[i]` name.
    pub fn index(&self) -> u32 {
        let start = self.name.rfind('[').map(|i| i + 1);
        let end = self.name.rfind(']');
        match (start, end) {
            (Some(s), Some(e)) if s < e => self.name[s..e].parse().unwrap_or(0),
            _ => 0,
        }
    }

    pub fn server_terminal(&self) -> bool {
        matches!(self.desired_status, DesiredStatus::Stop | DesiredStatus::Evict)
    }

    pub fn client_terminal(&self) -> bool {
        self.client_status.is_terminal()
    }

    pub fn terminal_status(&self) -> bool {
        self.server_terminal() || self.client_terminal()
    }

    pub fn is_canary(&self) -> bool {
        self.deployment_status
            .as_ref()
            .map(|s| s.canary)
            .unwrap_or(false)
    }

    pub fn deployment_healthy(&self) -> Option<bool> {
        self.deployment_status.as_ref().and_then(|s| s.healthy)
    }

    pub fn is_unhealthy(&self) -> bool {
        self.deployment_healthy() == Some(false)
    }

    pub fn tg(&self) -> Option<&TaskGroup> {
        self.job.lookup_task_group(&self.task_group)
    }

    /// Time the allocation failed, falling back to its last modification.
    pub fn last_event_time(&self) -> DateTime<Utc> {
        self.client_status_time.unwrap_or(self.modify_time)
    }

    pub fn set_client_status(&mut self, status: ClientStatus, description: impl Into<String>) {
        if self.client_status != status {
            self.client_status_time = Some(Utc::now());
        }
        self.client_status = status;
        self.client_description = description.into();
    }
}

/// Slot name for the `index`th allocation of a group.
pub fn alloc_name(job_id: &str, group: &str, index: u32) -> String {
    format!("{job_id}.{group}[{index}]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_index_parses() {
        let job = Arc::new(crate::model::test_fixtures::job("web", 1));
        let tg = job.task_groups[0].clone();
        let alloc = Allocation::new("e1", job, &tg, alloc_name("web", "web", 7), "n1", "n1");
        assert_eq!(alloc.index(), 7);
        assert_eq!(alloc.name, "web.web[7]");
    }

    #[test]
    fn terminal_flags() {
        let job = Arc::new(crate::model::test_fixtures::job("web", 1));
        let tg = job.task_groups[0].clone();
        let mut alloc = Allocation::new("e1", job, &tg, alloc_name("web", "web", 0), "n1", "n1");
        assert!(!alloc.terminal_status());

        alloc.set_client_status(ClientStatus::Failed, "exit 1");
        assert!(alloc.client_terminal());
        assert!(!alloc.server_terminal());

        alloc.desired_status = DesiredStatus::Stop;
        assert!(alloc.server_terminal());
    }

    #[test]
    fn tracker_attempts_continue_past_trimmed_history() {
        let tracker = RescheduleTracker {
            events: vec![RescheduleEvent {
                reschedule_time: Utc::now(),
                prev_alloc_id: "a".into(),
                prev_node_id: "n".into(),
                attempt: 9,
                delay_ms: 1000,
            }],
        };
        assert_eq!(tracker.next_attempt(), 10);
        assert_eq!(RescheduleTracker::default().next_attempt(), 0);
    }

    #[test]
    fn metric_counters() {
        let mut metric = AllocMetric::default();
        metric.filter_node("v1:abc", "missing drivers");
        metric.exhausted_node("memory");
        metric.exhausted_node("memory");
        assert_eq!(metric.nodes_filtered, 1);
        assert_eq!(metric.class_filtered["v1:abc"], 1);
        assert_eq!(metric.dimension_exhausted["memory"], 2);
    }
}
