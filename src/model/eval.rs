use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OrchError, Result};
use crate::model::alloc::AllocMetric;
use crate::model::{generate_id, short_id};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EvalStatus {
    #[default]
    Pending,
    Blocked,
    Complete,
    Failed,
    Canceled,
}

impl EvalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EvalStatus::Complete | EvalStatus::Failed | EvalStatus::Canceled
        )
    }

    /// Allowed moves: pending to anything, blocked back to pending (unblock)
    /// or to a terminal state. Terminal states absorb. Rewriting the same
    /// status is allowed so reblocking stays idempotent.
    pub fn can_transition(&self, to: EvalStatus) -> bool {
        if *self == to {
            return true;
        }
        match self {
            EvalStatus::Pending => true,
            EvalStatus::Blocked => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for EvalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvalStatus::Pending => write!(f, "pending"),
            EvalStatus::Blocked => write!(f, "blocked"),
            EvalStatus::Complete => write!(f, "complete"),
            EvalStatus::Failed => write!(f, "failed"),
            EvalStatus::Canceled => write!(f, "canceled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerReason {
    JobRegister,
    JobDeregister,
    NodeUpdate,
    NodeDrain,
    AllocFailure,
    AllocStop,
    RetryFailedAlloc,
    DeploymentWatcher,
    RollingUpdate,
    QueuedAllocs,
    MaxPlanAttempts,
    FailedFollowUp,
}

impl std::fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggerReason::JobRegister => "job-register",
            TriggerReason::JobDeregister => "job-deregister",
            TriggerReason::NodeUpdate => "node-update",
            TriggerReason::NodeDrain => "node-drain",
            TriggerReason::AllocFailure => "alloc-failure",
            TriggerReason::AllocStop => "alloc-stop",
            TriggerReason::RetryFailedAlloc => "alloc-failure-retry",
            TriggerReason::DeploymentWatcher => "deployment-watcher",
            TriggerReason::RollingUpdate => "rolling-update",
            TriggerReason::QueuedAllocs => "queued-allocs",
            TriggerReason::MaxPlanAttempts => "max-plan-attempts",
            TriggerReason::FailedFollowUp => "failed-follow-up",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: String,
    pub priority: u32,
    pub triggered_by: TriggerReason,
    pub job_id: String,
    #[serde(default)]
    pub job_modify_index: u64,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub deployment_id: Option<String>,
    pub status: EvalStatus,
    #[serde(default)]
    pub status_description: String,
    /// The broker holds the evaluation back until this instant.
    #[serde(default)]
    pub wait_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub previous_eval: Option<String>,
    #[serde(default)]
    pub next_eval: Option<String>,
    #[serde(default)]
    pub blocked_eval: Option<String>,
    #[serde(default)]
    pub deliveries: u32,
    /// Per task group placement failure metrics.
    #[serde(default)]
    pub failed_tg_allocs: BTreeMap<String, AllocMetric>,
    /// Computed node classes and whether they could run the job.
    #[serde(default)]
    pub class_eligibility: BTreeMap<String, bool>,
    /// Set when a constraint could not be judged per class.
    #[serde(default)]
    pub escaped_computed_class: bool,
    #[serde(default)]
    pub queued_allocations: BTreeMap<String, u32>,
    /// State index the scheduler last worked against.
    #[serde(default)]
    pub snapshot_index: u64,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
}

impl Evaluation {
    pub fn new(job_id: impl Into<String>, priority: u32, triggered_by: TriggerReason) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id(),
            priority,
            triggered_by,
            job_id: job_id.into(),
            job_modify_index: 0,
            node_id: None,
            deployment_id: None,
            status: EvalStatus::Pending,
            status_description: String::new(),
            wait_until: None,
            previous_eval: None,
            next_eval: None,
            blocked_eval: None,
            deliveries: 0,
            failed_tg_allocs: BTreeMap::new(),
            class_eligibility: BTreeMap::new(),
            escaped_computed_class: false,
            queued_allocations: BTreeMap::new(),
            snapshot_index: 0,
            create_index: 0,
            modify_index: 0,
            create_time: now,
            modify_time: now,
        }
    }

    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    pub fn terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn should_enqueue(&self) -> bool {
        self.status == EvalStatus::Pending
    }

    pub fn should_block(&self) -> bool {
        self.status == EvalStatus::Blocked
    }

    pub fn set_status(&mut self, to: EvalStatus, description: impl Into<String>) -> Result<()> {
        if !self.status.can_transition(to) {
            return Err(OrchError::InvalidEvalTransition {
                id: self.id.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        self.status_description = description.into();
        self.modify_time = Utc::now();
        Ok(())
    }

    /// Blocked evaluation that retries this one's failed placements once
    /// capacity shows up in an eligible class.
    pub fn create_blocked_eval(
        &self,
        class_eligibility: BTreeMap<String, bool>,
        escaped: bool,
        failed_tg_allocs: BTreeMap<String, AllocMetric>,
    ) -> Evaluation {
        let mut blocked = Evaluation::new(self.job_id.clone(), self.priority, self.triggered_by);
        blocked.job_modify_index = self.job_modify_index;
        blocked.status = EvalStatus::Blocked;
        blocked.status_description = "created to place remaining allocations".to_string();
        blocked.previous_eval = Some(self.id.clone());
        blocked.class_eligibility = class_eligibility;
        blocked.escaped_computed_class = escaped;
        blocked.failed_tg_allocs = failed_tg_allocs;
        blocked.snapshot_index = self.snapshot_index;
        blocked
    }

    /// Next evaluation after the plan attempt budget ran out.
    pub fn create_failed_followup_eval(&self, wait: chrono::Duration) -> Evaluation {
        let mut next = Evaluation::new(self.job_id.clone(), self.priority, TriggerReason::FailedFollowUp);
        next.job_modify_index = self.job_modify_index;
        next.previous_eval = Some(self.id.clone());
        next.status_description = "created after evaluation failed".to_string();
        next.wait_until = Some(Utc::now() + wait);
        next
    }
}
