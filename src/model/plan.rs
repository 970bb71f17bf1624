use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::model::alloc::{Allocation, ClientStatus, DesiredStatus};
use crate::model::deployment::{Deployment, DeploymentStatusUpdate};
use crate::model::eval::Evaluation;
use crate::model::job::Job;

/// Proposed changes for one evaluation, keyed by node.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Plan {
    pub eval_id: String,
    /// Delivery token from the broker. The plan is refused once it goes stale.
    pub eval_token: String,
    pub priority: u32,
    pub job: Option<Arc<Job>>,
    /// Store index the decisions were made at.
    pub snapshot_index: u64,
    /// Allocations to stop or evict, by node.
    pub node_update: BTreeMap<String, Vec<Allocation>>,
    /// New and in-place updated allocations, by node.
    pub node_allocation: BTreeMap<String, Vec<Allocation>>,
    /// Deployment to create or update.
    pub deployment: Option<Deployment>,
    pub deployment_updates: Vec<DeploymentStatusUpdate>,
    /// Delayed evaluations referenced by allocations in this plan. They are
    /// written in the same commit as the allocations.
    pub followup_evals: Vec<Evaluation>,
}

impl Plan {
    pub fn new(eval_id: impl Into<String>, eval_token: impl Into<String>, priority: u32) -> Self {
        Self {
            eval_id: eval_id.into(),
            eval_token: eval_token.into(),
            priority,
            ..Default::default()
        }
    }

    /// Queue a stop for `alloc`, optionally overriding its client status
    /// (used to mark allocations on dead nodes lost).
    pub fn append_stopped_alloc(
        &mut self,
        alloc: &Allocation,
        description: &str,
        client_status: Option<ClientStatus>,
        followup_eval_id: Option<String>,
    ) {
        let mut stopped = alloc.clone();
        stopped.desired_status = DesiredStatus::Stop;
        stopped.desired_description = description.to_string();
        if let Some(status) = client_status {
            stopped.set_client_status(status, description);
        }
        if followup_eval_id.is_some() {
            stopped.followup_eval_id = followup_eval_id;
        }
        self.node_update
            .entry(alloc.node_id.clone())
            .or_default()
            .push(stopped);
    }

    pub fn append_alloc(&mut self, alloc: Allocation) {
        self.node_allocation
            .entry(alloc.node_id.clone())
            .or_default()
            .push(alloc);
    }

    /// Withdraw a previously queued stop, used when a placement fails and
    /// the allocation it would have replaced must keep running.
    pub fn pop_update(&mut self, alloc: &Allocation) {
        if let Some(existing) = self.node_update.get_mut(&alloc.node_id) {
            if let Some(pos) = existing.iter().rposition(|a| a.id == alloc.id) {
                existing.remove(pos);
            }
            if existing.is_empty() {
                self.node_update.remove(&alloc.node_id);
            }
        }
    }

    pub fn is_no_op(&self) -> bool {
        self.node_update.is_empty()
            && self.node_allocation.is_empty()
            && self.deployment.is_none()
            && self.deployment_updates.is_empty()
    }

    /// Allocations placed or updated on `node_id` by this plan.
    pub fn placed_on(&self, node_id: &str) -> &[Allocation] {
        self.node_allocation
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn stopped_on(&self, node_id: &str) -> &[Allocation] {
        self.node_update
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// What the applier actually committed.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlanResult {
    pub node_update: BTreeMap<String, Vec<Allocation>>,
    pub node_allocation: BTreeMap<String, Vec<Allocation>>,
    pub deployment: Option<Deployment>,
    pub deployment_updates: Vec<DeploymentStatusUpdate>,
    pub rejected_nodes: Vec<String>,
    /// Non-zero when part of the plan was refused. The scheduler must
    /// refresh its state to at least this index before retrying.
    pub refresh_index: u64,
    /// Index at which the accepted portion was written.
    pub alloc_index: u64,
}

impl PlanResult {
    /// Whether everything in `plan` was committed. Returns the expected and
    /// actual number of touched allocations too.
    pub fn full_commit(&self, plan: &Plan) -> (bool, usize, usize) {
        let expected: usize = plan.node_update.values().map(Vec::len).sum::<usize>()
            + plan.node_allocation.values().map(Vec::len).sum::<usize>();
        let actual: usize = self.node_update.values().map(Vec::len).sum::<usize>()
            + self.node_allocation.values().map(Vec::len).sum::<usize>();
        (expected == actual, expected, actual)
    }

    pub fn is_no_op(&self) -> bool {
        self.node_update.is_empty()
            && self.node_allocation.is_empty()
            && self.deployment.is_none()
            && self.deployment_updates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::alloc::alloc_name;

    fn alloc(node: &str, index: u32) -> Allocation {
        let job = Arc::new(crate::model::test_fixtures::job("web", 2));
        let tg = job.task_groups[0].clone();
        Allocation::new("e1", job, &tg, alloc_name("web", "web", index), node, node)
    }

    #[test]
    fn stop_then_pop() {
        let mut plan = Plan::new("e1", "tok", 50);
        let a = alloc("n1", 0);
        plan.append_stopped_alloc(&a, "alloc not needed", None, None);
        assert_eq!(plan.stopped_on("n1").len(), 1);
        assert_eq!(plan.stopped_on("n1")[0].desired_status, DesiredStatus::Stop);
        assert!(!plan.is_no_op());

        plan.pop_update(&a);
        assert!(plan.node_update.is_empty());
        assert!(plan.is_no_op());
    }

    #[test]
    fn lost_stop_overrides_client_status() {
        let mut plan = Plan::new("e1", "tok", 50);
        let a = alloc("n1", 0);
        plan.append_stopped_alloc(&a, "alloc is lost", Some(ClientStatus::Lost), None);
        assert_eq!(plan.stopped_on("n1")[0].client_status, ClientStatus::Lost);
    }

    #[test]
    fn full_commit_counts() {
        let mut plan = Plan::new("e1", "tok", 50);
        plan.append_alloc(alloc("n1", 0));
        plan.append_alloc(alloc("n2", 1));

        let mut result = PlanResult::default();
        result
            .node_allocation
            .insert("n1".into(), plan.placed_on("n1").to_vec());
        assert_eq!(result.full_commit(&plan), (false, 2, 1));

        result
            .node_allocation
            .insert("n2".into(), plan.placed_on("n2").to_vec());
        assert_eq!(result.full_commit(&plan), (true, 2, 2));
    }
}
