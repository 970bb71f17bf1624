use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{OrchError, Result};
use crate::model::{
    AllocDeploymentStatus, AllocMetric, Allocation, Deployment, DesiredStatus, EvalStatus,
    Evaluation, Job, Node, Plan, PlanResult, TaskGroup, TriggerReason,
};
use crate::scheduler::reconcile::{
    AllocDestructiveResult, AllocPlaceResult, AllocReconciler, ReconcileResults,
    ALLOC_RESCHEDULED,
};
use crate::scheduler::reschedule::next_tracker;
use crate::scheduler::select::{ready_nodes_in_dcs, GenericStack, SelectOptions};
use crate::state::StateSnapshot;

pub const BLOCKED_EVAL_MAX_PLAN_DESC: &str = "created due to placement conflicts";
pub const BLOCKED_EVAL_FAILED_PLACEMENTS: &str = "created to place remaining allocations";

/// What a scheduler needs from the server while processing one evaluation.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Submit a plan. A refreshed snapshot comes back when part of the plan
    /// was refused and the scheduler should retry against newer state.
    async fn submit_plan(&self, plan: Plan) -> Result<(PlanResult, Option<StateSnapshot>)>;

    /// Record the final state of the evaluation being processed.
    async fn update_eval(&self, eval: Evaluation) -> Result<()>;

    /// Create a blocked or follow-up evaluation.
    async fn create_eval(&self, eval: Evaluation) -> Result<()>;

    /// Put a blocked evaluation that still cannot place everything back into
    /// the blocked set.
    async fn reblock_eval(&self, eval: Evaluation) -> Result<()>;
}

/// One unit of placement work.
enum Placement<'a> {
    Place(&'a AllocPlaceResult),
    Destructive(&'a AllocDestructiveResult),
}

impl Placement<'_> {
    fn name(&self) -> &str {
        match self {
            Placement::Place(p) => &p.name,
            Placement::Destructive(d) => &d.place_name,
        }
    }

    fn task_group(&self) -> &TaskGroup {
        match self {
            Placement::Place(p) => &p.task_group,
            Placement::Destructive(d) => &d.task_group,
        }
    }

    fn previous_alloc(&self) -> Option<&Allocation> {
        match self {
            Placement::Place(p) => p.previous_alloc.as_ref(),
            Placement::Destructive(d) => Some(&d.stop_alloc),
        }
    }

    fn canary(&self) -> bool {
        matches!(self, Placement::Place(p) if p.canary)
    }

    fn rescheduling(&self) -> bool {
        matches!(self, Placement::Place(p) if p.reschedule)
    }

    /// The previous allocation is stopped in the same plan as its
    /// replacement, and only if the replacement finds a node.
    fn stop_previous(&self) -> Option<(&Allocation, &str)> {
        match self {
            Placement::Place(p) if p.reschedule => {
                p.previous_alloc.as_ref().map(|a| (a, ALLOC_RESCHEDULED))
            }
            Placement::Destructive(d) => Some((&d.stop_alloc, d.stop_description.as_str())),
            Placement::Place(_) => None,
        }
    }
}

/// Scheduler for long-running service jobs.
pub struct GenericScheduler<'p> {
    planner: &'p dyn Planner,
    snapshot: StateSnapshot,
    max_plan_attempts: u32,

    eval: Evaluation,
    job: Option<Arc<Job>>,
    plan: Plan,
    deployment: Option<Deployment>,
    stack: Option<GenericStack>,
    blocked: Option<Evaluation>,
    failed_tg_allocs: BTreeMap<String, AllocMetric>,
    queued_allocs: BTreeMap<String, u32>,
    followup_evals: Vec<Evaluation>,
}

impl<'p> GenericScheduler<'p> {
    pub fn new(
        planner: &'p dyn Planner,
        snapshot: StateSnapshot,
        eval: Evaluation,
        max_plan_attempts: u32,
    ) -> Self {
        Self {
            planner,
            snapshot,
            max_plan_attempts: max_plan_attempts.max(1),
            plan: Plan::new(eval.id.clone(), "", eval.priority),
            eval,
            job: None,
            deployment: None,
            stack: None,
            blocked: None,
            failed_tg_allocs: BTreeMap::new(),
            queued_allocs: BTreeMap::new(),
            followup_evals: Vec::new(),
        }
    }

    /// Process the evaluation handed out with `token`. Errors mean the
    /// evaluation should be nacked and retried.
    pub async fn process(mut self, token: &str) -> Result<()> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            if self.process_once(token).await? {
                break;
            }
            if attempts >= self.max_plan_attempts {
                tracing::warn!(
                    eval_id = %self.eval.short_id(),
                    job_id = %self.eval.job_id,
                    attempts,
                    "Plan attempts exhausted"
                );
                if self.blocked.is_none() {
                    if let Err(err) = self.create_blocked_eval(true).await {
                        tracing::error!(error = %err, "Failed to create blocked evaluation");
                    }
                }
                let desc = format!("maximum attempts reached ({})", self.max_plan_attempts);
                return self.set_status(EvalStatus::Failed, desc).await;
            }
        }

        if self.eval.status == EvalStatus::Blocked && !self.failed_tg_allocs.is_empty() {
            let mut reblocked = self.eval.clone();
            if let Some(stack) = &self.stack {
                let elig = stack.eligibility();
                reblocked.escaped_computed_class = elig.has_escaped();
                reblocked.class_eligibility = if elig.has_escaped() {
                    BTreeMap::new()
                } else {
                    elig.classes()
                };
            }
            reblocked.failed_tg_allocs = self.failed_tg_allocs.clone();
            reblocked.snapshot_index = self.snapshot.index();
            return self.planner.reblock_eval(reblocked).await;
        }

        self.set_status(EvalStatus::Complete, String::new()).await
    }

    /// One attempt. Ok(true) when done, Ok(false) to retry on fresher state.
    async fn process_once(&mut self, token: &str) -> Result<bool> {
        self.job = self.snapshot.job_by_id(&self.eval.job_id);
        self.queued_allocs = BTreeMap::new();
        self.followup_evals = Vec::new();
        self.failed_tg_allocs = BTreeMap::new();
        self.deployment = self.snapshot.latest_deployment_by_job(&self.eval.job_id);

        self.plan = Plan::new(self.eval.id.clone(), token, self.eval.priority);
        self.plan.job = self.job.clone();
        self.plan.snapshot_index = self.snapshot.index();
        self.stack = match &self.job {
            Some(job) if !job.stop => Some(GenericStack::new(job.clone(), Vec::new())),
            _ => None,
        };

        self.compute_job_allocs()?;

        let delay_instead = !self.followup_evals.is_empty() && self.eval.wait_until.is_none();
        if self.eval.status != EvalStatus::Blocked
            && !self.failed_tg_allocs.is_empty()
            && self.blocked.is_none()
            && !delay_instead
        {
            self.create_blocked_eval(false).await?;
        }

        if self.plan.is_no_op() && self.followup_evals.is_empty() {
            return Ok(true);
        }
        self.plan.followup_evals = std::mem::take(&mut self.followup_evals);

        let plan = self.plan.clone();
        let (result, refreshed) = self.planner.submit_plan(plan).await?;
        adjust_queued_allocations(&result, &mut self.queued_allocs);

        if let Some(snapshot) = refreshed {
            tracing::debug!(
                eval_id = %self.eval.short_id(),
                refresh_index = result.refresh_index,
                "Refresh forced"
            );
            self.snapshot = snapshot;
            return Ok(false);
        }

        let (full, expected, actual) = result.full_commit(&self.plan);
        if !full {
            tracing::debug!(expected, actual, "Plan did not fully commit");
            return Err(OrchError::Internal(
                "missing state refresh after partial commit".into(),
            ));
        }
        Ok(true)
    }

    fn compute_job_allocs(&mut self) -> Result<()> {
        let allocs = self.snapshot.allocs_by_job(&self.eval.job_id);
        let tainted = tainted_nodes(&self.snapshot, &allocs);

        let results = AllocReconciler::new(
            self.eval.job_id.clone(),
            self.job.clone(),
            self.deployment.clone(),
            allocs,
            &tainted,
            &self.eval,
            Utc::now(),
        )
        .compute();
        tracing::debug!(
            eval_id = %self.eval.short_id(),
            job_id = %self.eval.job_id,
            results = %results,
            "Reconciled current state with desired state"
        );

        self.plan.deployment = results.deployment.clone();
        self.plan.deployment_updates = results.deployment_updates.clone();
        self.followup_evals = results.followup_evals().cloned().collect();
        self.deployment = results.active_deployment.clone();

        for stop in &results.stop {
            self.plan.append_stopped_alloc(
                &stop.alloc,
                &stop.description,
                stop.client_status,
                None,
            );
        }

        let deployment_id = self.deployment.as_ref().map(|d| d.id.clone());
        for update in &results.inplace_update {
            let mut update = update.clone();
            if update.deployment_id != deployment_id {
                update.deployment_id = deployment_id.clone();
                update.deployment_status = None;
            }
            self.plan.append_alloc(update);
        }

        for update in results.attribute_updates.values() {
            let stopped = self
                .plan
                .stopped_on(&update.node_id)
                .iter()
                .any(|a| a.id == update.id);
            let destructive = results
                .destructive_update
                .iter()
                .any(|d| d.stop_alloc.id == update.id);
            if !stopped && !destructive {
                self.plan.append_alloc(update.clone());
            }
        }

        let Some(job) = self.job.clone().filter(|j| !j.stop) else {
            return Ok(());
        };
        if results.place.is_empty() && results.destructive_update.is_empty() {
            for tg in &job.task_groups {
                self.queued_allocs.insert(tg.name.clone(), 0);
            }
            return Ok(());
        }
        for p in &results.place {
            *self.queued_allocs.entry(p.task_group.name.clone()).or_default() += 1;
        }
        for d in &results.destructive_update {
            *self.queued_allocs.entry(d.task_group.name.clone()).or_default() += 1;
        }

        self.compute_placements(&job, &results);
        Ok(())
    }

    fn compute_placements(&mut self, job: &Arc<Job>, results: &ReconcileResults) {
        let (nodes, by_dc) = ready_nodes_in_dcs(&self.snapshot, &job.datacenters);
        let Some(stack) = self.stack.as_mut() else {
            return;
        };
        stack.set_nodes(nodes);
        let now = Utc::now();
        let deployment_id = self.deployment.as_ref().map(|d| d.id.clone());

        // Destructive updates go first so the resources they free count.
        let work: Vec<Placement<'_>> = results
            .destructive_update
            .iter()
            .map(Placement::Destructive)
            .chain(results.place.iter().map(Placement::Place))
            .collect();

        for missing in work {
            let tg = missing.task_group();
            if let Some(metric) = self.failed_tg_allocs.get_mut(&tg.name) {
                metric.coalesced_failures += 1;
                continue;
            }

            let stop_prev = missing.stop_previous();
            if let Some((prev, desc)) = stop_prev {
                self.plan.append_stopped_alloc(prev, desc, None, None);
            }

            let options = SelectOptions::for_previous(missing.previous_alloc());
            let (option, mut metric) = stack.select(tg, &self.snapshot, &self.plan, &options);
            metric.nodes_available = by_dc.clone();

            let Some(ranked) = option else {
                tracing::debug!(
                    eval_id = %self.eval.short_id(),
                    task_group = %tg.name,
                    nodes_evaluated = metric.nodes_evaluated,
                    nodes_exhausted = metric.nodes_exhausted,
                    "Failed to place allocation"
                );
                self.failed_tg_allocs.insert(tg.name.clone(), metric);
                if let Some((prev, _)) = stop_prev {
                    self.plan.pop_update(prev);
                }
                continue;
            };

            let mut alloc = Allocation::new(
                self.eval.id.clone(),
                job.clone(),
                tg,
                missing.name(),
                ranked.node.id.clone(),
                ranked.node.name.clone(),
            );
            alloc.metrics = metric;
            alloc.deployment_id = deployment_id.clone();
            if let Some(prev) = missing.previous_alloc() {
                alloc.previous_allocation = Some(prev.id.clone());
                if missing.rescheduling() {
                    let policy = tg.reschedule_policy();
                    alloc.reschedule_tracker = Some(next_tracker(prev, &policy, now));
                }
            }

            if missing.canary() {
                if let Some(d) = self.deployment.as_mut() {
                    alloc.deployment_status = Some(AllocDeploymentStatus {
                        healthy: None,
                        timestamp: None,
                        canary: true,
                    });
                    record_canary(d, &self.snapshot, &self.plan, &tg.name, &alloc.id);
                    self.plan.deployment = Some(d.clone());
                }
            }

            self.plan.append_alloc(alloc);
        }
    }

    async fn create_blocked_eval(&mut self, plan_failure: bool) -> Result<()> {
        let (classes, escaped) = match &self.stack {
            Some(stack) => {
                let elig = stack.eligibility();
                if elig.has_escaped() {
                    (BTreeMap::new(), true)
                } else {
                    (elig.classes(), false)
                }
            }
            None => (BTreeMap::new(), false),
        };
        let mut blocked =
            self.eval
                .create_blocked_eval(classes, escaped, self.failed_tg_allocs.clone());
        if plan_failure {
            blocked.triggered_by = TriggerReason::MaxPlanAttempts;
            blocked.status_description = BLOCKED_EVAL_MAX_PLAN_DESC.to_string();
        } else {
            blocked.status_description = BLOCKED_EVAL_FAILED_PLACEMENTS.to_string();
        }
        blocked.snapshot_index = self.snapshot.index();
        tracing::debug!(
            eval_id = %self.eval.short_id(),
            blocked_eval_id = %blocked.short_id(),
            "Failed to place all allocations, blocked eval created"
        );
        self.planner.create_eval(blocked.clone()).await?;
        self.blocked = Some(blocked);
        Ok(())
    }

    async fn set_status(&self, status: EvalStatus, description: String) -> Result<()> {
        let mut eval = self.eval.clone();
        eval.set_status(status, description)?;
        eval.blocked_eval = self.blocked.as_ref().map(|b| b.id.clone());
        eval.failed_tg_allocs = self.failed_tg_allocs.clone();
        eval.queued_allocations = self.queued_allocs.clone();
        eval.snapshot_index = self.snapshot.index();
        if let Some(d) = &self.deployment {
            eval.deployment_id = Some(d.id.clone());
        }
        self.planner.update_eval(eval).await
    }
}

/// Nodes holding `allocs` that are gone or no longer ready.
pub fn tainted_nodes(snapshot: &StateSnapshot, allocs: &[Allocation]) -> BTreeMap<String, Option<Node>> {
    let mut out = BTreeMap::new();
    for alloc in allocs {
        if out.contains_key(&alloc.node_id) {
            continue;
        }
        match snapshot.node_by_id(&alloc.node_id) {
            None => {
                out.insert(alloc.node_id.clone(), None);
            }
            Some(node) if node.is_tainted() => {
                out.insert(alloc.node_id.clone(), Some(node.clone()));
            }
            Some(_) => {}
        }
    }
    out
}

/// Track a new canary on the deployment, dropping canaries that are gone or
/// being stopped by this plan.
fn record_canary(
    deployment: &mut Deployment,
    snapshot: &StateSnapshot,
    plan: &Plan,
    group: &str,
    alloc_id: &str,
) {
    let Some(state) = deployment.task_groups.get_mut(group) else {
        return;
    };
    state.placed_canaries.retain(|id| {
        let live = snapshot
            .alloc_by_id(id)
            .map(|a| !a.terminal_status())
            .unwrap_or(true);
        let stopping = plan
            .node_update
            .values()
            .flatten()
            .any(|a| &a.id == id && a.desired_status != DesiredStatus::Run);
        live && !stopping
    });
    state.placed_canaries.push(alloc_id.to_string());
}

/// Subtract committed placements from the queued counts.
fn adjust_queued_allocations(result: &PlanResult, queued: &mut BTreeMap<String, u32>) {
    for allocs in result.node_allocation.values() {
        for alloc in allocs {
            if alloc.create_index != result.alloc_index {
                continue;
            }
            if let Some(n) = queued.get_mut(&alloc.task_group) {
                *n = n.saturating_sub(1);
            }
        }
    }
}
