use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};

use crate::error::{OrchError, Result};
use crate::model::{
    AllocDeploymentStatus, Allocation, ClientStatus, Deployment, DeploymentStatus,
    DeploymentStatusUpdate, EvalStatus, Evaluation, Job, JobStatus, Node, NodeStatus, PlanResult,
};
use crate::state::snapshot::StateSnapshot;

/// Status report for one allocation from the node running it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocClientUpdate {
    pub alloc_id: String,
    pub client_status: ClientStatus,
    #[serde(default)]
    pub description: String,
}

/// Versioned in-memory state. Every write bumps the index and publishes it
/// on a watch channel so blocking readers wake up.
pub struct StateStore {
    inner: RwLock<StateSnapshot>,
    index_tx: watch::Sender<u64>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        let (index_tx, _) = watch::channel(0);
        Self {
            inner: RwLock::new(StateSnapshot::default()),
            index_tx,
        }
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        self.inner.read().await.clone()
    }

    pub fn latest_index(&self) -> u64 {
        *self.index_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.index_tx.subscribe()
    }

    /// Block until the store reaches `min_index` or the timeout passes.
    pub async fn wait_for_index(&self, min_index: u64, timeout: Duration) -> Result<u64> {
        let mut rx = self.index_tx.subscribe();
        let wait = rx.wait_for(|idx| *idx >= min_index);
        let reached = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(idx)) => Ok(*idx),
            Ok(Err(_)) => Err(OrchError::Internal("state index channel closed".into())),
            Err(_) => Err(OrchError::IndexTimeout(min_index)),
        };
        reached
    }

    pub async fn snapshot_min_index(
        &self,
        min_index: u64,
        timeout: Duration,
    ) -> Result<StateSnapshot> {
        self.wait_for_index(min_index, timeout).await?;
        Ok(self.snapshot().await)
    }

    fn publish(&self, index: u64) {
        self.index_tx.send_replace(index);
    }

    /// Register or update a job, together with the evaluation it triggers.
    /// The version only moves when the submitted spec differs.
    pub async fn upsert_job(
        &self,
        mut job: Job,
        eval: Option<Evaluation>,
    ) -> Result<(u64, Arc<Job>)> {
        let mut inner = self.inner.write().await;
        let index = inner.index + 1;
        let now = Utc::now();

        let new_version = match inner.jobs.get(&job.id) {
            Some(prev) => {
                job.create_index = prev.create_index;
                if prev.spec_changed(&job) {
                    job.version = prev.version + 1;
                    job.job_modify_index = index;
                    job.submit_time = Some(now);
                    true
                } else {
                    job.version = prev.version;
                    job.job_modify_index = prev.job_modify_index;
                    job.submit_time = prev.submit_time;
                    job.status = prev.status;
                    false
                }
            }
            None => {
                job.create_index = index;
                job.version = 0;
                job.job_modify_index = index;
                job.submit_time = Some(now);
                true
            }
        };
        job.modify_index = index;

        let mut eval = eval;
        if let Some(e) = eval.as_mut() {
            e.job_modify_index = job.job_modify_index;
        }
        if let Some(e) = &eval {
            check_eval_transition(&inner, e)?;
        }

        let job = Arc::new(job);
        inner.jobs.insert(job.id.clone(), job.clone());
        if new_version {
            inner
                .job_versions
                .entry(job.id.clone())
                .or_default()
                .push(job.clone());
        }
        if let Some(e) = eval {
            insert_eval(&mut inner, e, index, now);
        }
        inner.index = index;
        refresh_job_status(&mut inner, &job.id, index);
        let job = inner.jobs.get(&job.id).cloned().unwrap_or(job);

        self.publish(index);
        Ok((index, job))
    }

    pub async fn upsert_evals(&self, evals: Vec<Evaluation>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        for e in &evals {
            check_eval_transition(&inner, e)?;
        }
        let index = inner.index + 1;
        let now = Utc::now();
        let mut touched = BTreeSet::new();
        for e in evals {
            touched.insert(e.job_id.clone());
            insert_eval(&mut inner, e, index, now);
        }
        inner.index = index;
        for job_id in touched {
            refresh_job_status(&mut inner, &job_id, index);
        }
        self.publish(index);
        Ok(index)
    }

    /// Commit the accepted part of a plan together with the evaluations it
    /// created. Either everything lands or nothing does.
    pub async fn upsert_plan_results(
        &self,
        result: &PlanResult,
        evals: Vec<Evaluation>,
    ) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let index = inner.index + 1;
        let now = Utc::now();

        for e in &evals {
            check_eval_transition(&inner, e)?;
        }

        let mut deployment = match &result.deployment {
            Some(d) => Some(merge_deployment(inner.deployments.get(&d.id), d)),
            None => None,
        };
        if let Some(d) = &deployment {
            check_canary_bounds(d)?;
        }

        let mut touched_jobs = BTreeSet::new();

        for stops in result.node_update.values() {
            for stop in stops {
                let Some(existing) = inner.allocs.get_mut(&stop.id) else {
                    tracing::warn!(alloc_id = %stop.id, "Stop for unknown allocation ignored");
                    continue;
                };
                existing.desired_status = stop.desired_status;
                existing.desired_description = stop.desired_description.clone();
                if stop.client_status == ClientStatus::Lost
                    && existing.client_status != ClientStatus::Lost
                {
                    existing.set_client_status(ClientStatus::Lost, stop.client_description.clone());
                }
                if stop.followup_eval_id.is_some() {
                    existing.followup_eval_id = stop.followup_eval_id.clone();
                }
                existing.modify_index = index;
                existing.modify_time = now;
                touched_jobs.insert(existing.job_id.clone());
            }
        }

        for allocs in result.node_allocation.values() {
            for alloc in allocs {
                touched_jobs.insert(alloc.job_id.clone());
                if let Some(existing) = inner.allocs.get_mut(&alloc.id) {
                    existing.job = alloc.job.clone();
                    existing.resources = alloc.resources;
                    // Moving to another deployment resets the health verdict.
                    if alloc.deployment_id.is_some() && alloc.deployment_id != existing.deployment_id {
                        existing.deployment_id = alloc.deployment_id.clone();
                        existing.deployment_status = alloc.deployment_status.clone();
                    }
                    if alloc.followup_eval_id.is_some() {
                        existing.followup_eval_id = alloc.followup_eval_id.clone();
                    }
                    existing.modify_index = index;
                    existing.modify_time = now;
                    continue;
                }

                let mut alloc = alloc.clone();
                alloc.create_index = index;
                alloc.modify_index = index;
                alloc.create_time = now;
                alloc.modify_time = now;

                if let Some(dep_id) = &alloc.deployment_id {
                    let target = match deployment.as_mut() {
                        Some(d) if &d.id == dep_id => Some(d),
                        _ => None,
                    };
                    if let Some(d) = target {
                        if let Some(state) = d.task_groups.get_mut(&alloc.task_group) {
                            state.placed_allocs += 1;
                        }
                    } else if let Some(d) = inner.deployments.get_mut(dep_id) {
                        if let Some(state) = d.task_groups.get_mut(&alloc.task_group) {
                            state.placed_allocs += 1;
                        }
                        d.modify_index = index;
                    }
                }
                if let Some(prev_id) = &alloc.previous_allocation {
                    if let Some(prev) = inner.allocs.get_mut(prev_id) {
                        prev.next_allocation = Some(alloc.id.clone());
                        prev.modify_index = index;
                    }
                }
                inner.allocs.insert(alloc.id.clone(), alloc);
            }
        }

        if let Some(mut d) = deployment {
            if !inner.deployments.contains_key(&d.id) {
                d.create_index = index;
                d.create_time = now;
            }
            d.modify_index = index;
            d.modify_time = now;
            inner.deployments.insert(d.id.clone(), d);
        }

        for update in &result.deployment_updates {
            if let Some(d) = inner.deployments.get_mut(&update.deployment_id) {
                if !d.active() {
                    continue;
                }
                d.status = update.status;
                d.status_description = update.status_description.clone();
                d.modify_index = index;
                d.modify_time = now;
            }
        }

        for e in evals {
            touched_jobs.insert(e.job_id.clone());
            insert_eval(&mut inner, e, index, now);
        }

        inner.index = index;
        for job_id in touched_jobs {
            refresh_job_status(&mut inner, &job_id, index);
        }
        self.publish(index);
        Ok(index)
    }

    /// Change a deployment's status, optionally creating an evaluation with it.
    pub async fn update_deployment_status(
        &self,
        update: DeploymentStatusUpdate,
        eval: Option<Evaluation>,
    ) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let d = inner
            .deployments
            .get(&update.deployment_id)
            .ok_or_else(|| OrchError::DeploymentNotFound(update.deployment_id.clone()))?;
        if !d.active() {
            return Err(OrchError::InvalidDeploymentAction {
                id: d.id.clone(),
                action: update.status.to_string(),
                reason: format!("deployment is already {}", d.status),
            });
        }
        if let Some(e) = &eval {
            check_eval_transition(&inner, e)?;
        }

        let index = inner.index + 1;
        let now = Utc::now();
        let job_id = d.job_id.clone();
        if let Some(d) = inner.deployments.get_mut(&update.deployment_id) {
            d.status = update.status;
            d.status_description = update.status_description;
            d.modify_index = index;
            d.modify_time = now;
        }
        if let Some(e) = eval {
            insert_eval(&mut inner, e, index, now);
        }
        inner.index = index;
        refresh_job_status(&mut inner, &job_id, index);
        self.publish(index);
        Ok(index)
    }

    /// Promote canaries of the named groups, or of every group when `groups`
    /// is None. Each promoted group needs all its desired canaries healthy.
    pub async fn update_deployment_promotion(
        &self,
        deployment_id: &str,
        groups: Option<Vec<String>>,
        eval: Option<Evaluation>,
    ) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let d = inner
            .deployments
            .get(deployment_id)
            .ok_or_else(|| OrchError::DeploymentNotFound(deployment_id.to_string()))?;
        let reject = |reason: String| OrchError::InvalidDeploymentAction {
            id: deployment_id.to_string(),
            action: "promote".to_string(),
            reason,
        };
        if !d.active() {
            return Err(reject(format!("deployment is {}", d.status)));
        }
        if !d.requires_promotion() {
            return Err(reject("no canaries to promote".to_string()));
        }

        let mut to_promote = Vec::new();
        for (name, state) in &d.task_groups {
            if let Some(wanted) = &groups {
                if !wanted.iter().any(|g| g == name) {
                    continue;
                }
            }
            if state.desired_canaries == 0 || state.promoted {
                continue;
            }
            let healthy = state
                .placed_canaries
                .iter()
                .filter(|id| {
                    inner
                        .allocs
                        .get(*id)
                        .and_then(|a| a.deployment_healthy())
                        .unwrap_or(false)
                })
                .count() as u32;
            if healthy < state.desired_canaries {
                return Err(reject(format!(
                    "task group {name} has {healthy}/{} healthy canaries",
                    state.desired_canaries
                )));
            }
            to_promote.push(name.clone());
        }
        if to_promote.is_empty() {
            return Err(reject("no matching task groups need promotion".to_string()));
        }
        if let Some(e) = &eval {
            check_eval_transition(&inner, e)?;
        }

        let index = inner.index + 1;
        let now = Utc::now();
        if let Some(d) = inner.deployments.get_mut(deployment_id) {
            for name in &to_promote {
                if let Some(state) = d.task_groups.get_mut(name) {
                    state.promoted = true;
                }
            }
            if d.status == DeploymentStatus::Running {
                d.status_description = d.running_description().to_string();
            }
            d.modify_index = index;
            d.modify_time = now;
        }
        if let Some(e) = eval {
            insert_eval(&mut inner, e, index, now);
        }
        inner.index = index;
        self.publish(index);
        Ok(index)
    }

    /// Record health decisions for deployment allocations. A decision is
    /// made once per allocation; later reports for it are ignored.
    pub async fn update_deployment_alloc_health(
        &self,
        deployment_id: &str,
        healthy: &[String],
        unhealthy: &[String],
        status_update: Option<DeploymentStatusUpdate>,
        eval: Option<Evaluation>,
        timestamp: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let d = inner
            .deployments
            .get(deployment_id)
            .ok_or_else(|| OrchError::DeploymentNotFound(deployment_id.to_string()))?;
        if !d.active() {
            return Err(OrchError::InvalidDeploymentAction {
                id: deployment_id.to_string(),
                action: "set allocation health".to_string(),
                reason: format!("deployment is {}", d.status),
            });
        }
        for id in healthy.iter().chain(unhealthy.iter()) {
            match inner.allocs.get(id) {
                Some(a) if a.deployment_id.as_deref() == Some(deployment_id) => {}
                Some(_) => {
                    return Err(OrchError::InvalidDeploymentAction {
                        id: deployment_id.to_string(),
                        action: "set allocation health".to_string(),
                        reason: format!("allocation {id} is not part of the deployment"),
                    })
                }
                None => return Err(OrchError::AllocNotFound(id.clone())),
            }
        }
        if let Some(e) = &eval {
            check_eval_transition(&inner, e)?;
        }

        let index = inner.index + 1;
        let now = Utc::now();
        let mut counts: BTreeMap<String, (u32, u32)> = BTreeMap::new();
        for (ids, is_healthy) in [(healthy, true), (unhealthy, false)] {
            for id in ids {
                let Some(alloc) = inner.allocs.get_mut(id) else {
                    continue;
                };
                let status = alloc
                    .deployment_status
                    .get_or_insert_with(AllocDeploymentStatus::default);
                if status.healthy.is_some() {
                    continue;
                }
                status.healthy = Some(is_healthy);
                status.timestamp = Some(timestamp);
                alloc.modify_index = index;
                alloc.modify_time = now;
                let entry = counts.entry(alloc.task_group.clone()).or_default();
                if is_healthy {
                    entry.0 += 1;
                } else {
                    entry.1 += 1;
                }
            }
        }

        let settled: Vec<String> = match inner.deployments.get(deployment_id) {
            Some(d) => d
                .task_groups
                .keys()
                .filter(|group| {
                    let batch = inner.deployment_batch(d, group);
                    !batch.is_empty() && batch.iter().all(|a| a.deployment_healthy().is_some())
                })
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        let job_id = if let Some(d) = inner.deployments.get_mut(deployment_id) {
            for (group, (h, u)) in counts {
                if let Some(state) = d.task_groups.get_mut(&group) {
                    state.healthy_allocs += h;
                    state.unhealthy_allocs += u;
                }
            }
            for group in settled {
                if let Some(state) = d.task_groups.get_mut(&group) {
                    state.batch_start_index = index + 1;
                }
            }
            if let Some(update) = status_update {
                d.status = update.status;
                d.status_description = update.status_description;
            }
            d.modify_index = index;
            d.modify_time = now;
            d.job_id.clone()
        } else {
            String::new()
        };
        if let Some(e) = eval {
            insert_eval(&mut inner, e, index, now);
        }
        inner.index = index;
        refresh_job_status(&mut inner, &job_id, index);
        self.publish(index);
        Ok(index)
    }

    /// Apply client-reported allocation status, with the evaluations those
    /// changes trigger.
    pub async fn update_allocs_from_client(
        &self,
        updates: Vec<AllocClientUpdate>,
        evals: Vec<Evaluation>,
    ) -> Result<u64> {
        let mut inner = self.inner.write().await;
        for e in &evals {
            check_eval_transition(&inner, e)?;
        }
        let index = inner.index + 1;
        let now = Utc::now();
        let mut touched = BTreeSet::new();
        for update in updates {
            let Some(alloc) = inner.allocs.get_mut(&update.alloc_id) else {
                tracing::debug!(alloc_id = %update.alloc_id, "Client update for unknown allocation");
                continue;
            };
            if alloc.client_status == update.client_status {
                continue;
            }
            // Lost is decided by the servers; a late client report cannot revive it.
            if alloc.client_status == ClientStatus::Lost {
                continue;
            }
            alloc.set_client_status(update.client_status, update.description);
            alloc.modify_index = index;
            alloc.modify_time = now;
            touched.insert(alloc.job_id.clone());
        }
        for e in evals {
            touched.insert(e.job_id.clone());
            insert_eval(&mut inner, e, index, now);
        }
        inner.index = index;
        for job_id in touched {
            refresh_job_status(&mut inner, &job_id, index);
        }
        self.publish(index);
        Ok(index)
    }

    /// Store a delayed follow-up evaluation and point `alloc_id` at it.
    pub async fn attach_followup_eval(&self, alloc_id: &str, eval: Evaluation) -> Result<u64> {
        let mut inner = self.inner.write().await;
        if !inner.allocs.contains_key(alloc_id) {
            return Err(OrchError::AllocNotFound(alloc_id.to_string()));
        }
        check_eval_transition(&inner, &eval)?;
        let index = inner.index + 1;
        let now = Utc::now();
        if let Some(alloc) = inner.allocs.get_mut(alloc_id) {
            alloc.followup_eval_id = Some(eval.id.clone());
            alloc.modify_index = index;
            alloc.modify_time = now;
        }
        let job_id = eval.job_id.clone();
        insert_eval(&mut inner, eval, index, now);
        inner.index = index;
        refresh_job_status(&mut inner, &job_id, index);
        self.publish(index);
        Ok(index)
    }

    pub async fn upsert_node(&self, mut node: Node) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let index = inner.index + 1;
        match inner.nodes.get(&node.id) {
            Some(prev) => {
                node.create_index = prev.create_index;
                // Drain and eligibility are operator decisions that survive
                // re-registration.
                node.drain = prev.drain;
                node.eligible = prev.eligible;
            }
            None => node.create_index = index,
        }
        node.compute_class();
        node.modify_index = index;
        node.status_updated_at = Some(Utc::now());
        inner.nodes.insert(node.id.clone(), node);
        inner.index = index;
        self.publish(index);
        Ok(index)
    }

    pub async fn update_node_status(
        &self,
        node_id: &str,
        status: NodeStatus,
        evals: Vec<Evaluation>,
    ) -> Result<u64> {
        let mut inner = self.inner.write().await;
        if !inner.nodes.contains_key(node_id) {
            return Err(OrchError::NodeNotFound(node_id.to_string()));
        }
        for e in &evals {
            check_eval_transition(&inner, e)?;
        }
        let index = inner.index + 1;
        let now = Utc::now();
        if let Some(node) = inner.nodes.get_mut(node_id) {
            node.status = status;
            node.status_updated_at = Some(now);
            node.modify_index = index;
        }
        for e in evals {
            insert_eval(&mut inner, e, index, now);
        }
        inner.index = index;
        self.publish(index);
        Ok(index)
    }

    pub async fn update_node_drain(
        &self,
        node_id: &str,
        drain: bool,
        evals: Vec<Evaluation>,
    ) -> Result<u64> {
        let mut inner = self.inner.write().await;
        if !inner.nodes.contains_key(node_id) {
            return Err(OrchError::NodeNotFound(node_id.to_string()));
        }
        for e in &evals {
            check_eval_transition(&inner, e)?;
        }
        let index = inner.index + 1;
        let now = Utc::now();
        if let Some(node) = inner.nodes.get_mut(node_id) {
            node.drain = drain;
            node.eligible = !drain;
            node.status = if drain {
                NodeStatus::Draining
            } else if node.status == NodeStatus::Draining {
                NodeStatus::Ready
            } else {
                node.status
            };
            node.status_updated_at = Some(now);
            node.modify_index = index;
        }
        for e in evals {
            insert_eval(&mut inner, e, index, now);
        }
        inner.index = index;
        self.publish(index);
        Ok(index)
    }
}

fn check_eval_transition(inner: &StateSnapshot, eval: &Evaluation) -> Result<()> {
    if let Some(existing) = inner.evals.get(&eval.id) {
        if !existing.status.can_transition(eval.status) {
            return Err(OrchError::InvalidEvalTransition {
                id: eval.id.clone(),
                from: existing.status.to_string(),
                to: eval.status.to_string(),
            });
        }
    }
    Ok(())
}

fn insert_eval(inner: &mut StateSnapshot, mut eval: Evaluation, index: u64, now: DateTime<Utc>) {
    match inner.evals.get(&eval.id) {
        Some(existing) => {
            eval.create_index = existing.create_index;
            eval.create_time = existing.create_time;
        }
        None => eval.create_index = index,
    }
    eval.modify_index = index;
    eval.modify_time = now;
    inner.evals.insert(eval.id.clone(), eval);
}

/// Fold a scheduler-proposed deployment into the stored copy. Counters are
/// owned by the store and never taken from the proposal.
fn merge_deployment(stored: Option<&Deployment>, proposed: &Deployment) -> Deployment {
    let Some(stored) = stored else {
        let mut fresh = proposed.clone();
        for state in fresh.task_groups.values_mut() {
            state.placed_allocs = 0;
            state.healthy_allocs = 0;
            state.unhealthy_allocs = 0;
        }
        return fresh;
    };
    let mut merged = stored.clone();
    for (name, proposed_state) in &proposed.task_groups {
        let state = merged.task_groups.entry(name.clone()).or_default();
        state.desired_canaries = proposed_state.desired_canaries;
        state.desired_total = proposed_state.desired_total;
        state.auto_promote = proposed_state.auto_promote;
        // Only the scheduler for this job writes the canary list, one
        // evaluation at a time, so its copy is authoritative.
        state.placed_canaries = proposed_state.placed_canaries.clone();
    }
    if merged.active() && proposed.status != merged.status && !proposed.active() {
        merged.status = proposed.status;
        merged.status_description = proposed.status_description.clone();
    }
    merged
}

fn check_canary_bounds(d: &Deployment) -> Result<()> {
    for (name, state) in &d.task_groups {
        if state.placed_canaries.len() as u32 > state.desired_canaries {
            return Err(OrchError::Invariant(format!(
                "deployment {} group {name}: {} placed canaries exceed {} desired",
                d.id,
                state.placed_canaries.len(),
                state.desired_canaries
            )));
        }
    }
    Ok(())
}

fn refresh_job_status(inner: &mut StateSnapshot, job_id: &str, index: u64) {
    let Some(job) = inner.jobs.get(job_id) else {
        return;
    };
    let running = inner
        .allocs
        .values()
        .any(|a| a.job_id == job_id && !a.terminal_status());
    let has_allocs = inner.allocs.values().any(|a| a.job_id == job_id);
    let pending_evals = inner.evals.values().any(|e| {
        e.job_id == job_id && matches!(e.status, EvalStatus::Pending | EvalStatus::Blocked)
    });

    let status = if running {
        JobStatus::Running
    } else if job.stop {
        JobStatus::Dead
    } else if pending_evals || !has_allocs {
        JobStatus::Pending
    } else {
        JobStatus::Dead
    };
    if job.status != status {
        let mut updated = (**job).clone();
        updated.status = status;
        updated.modify_index = index;
        inner.jobs.insert(job_id.to_string(), Arc::new(updated));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_fixtures::job;
    use crate::model::{alloc_name, DeploymentState, Plan, Resources, TriggerReason};

    fn alloc_for(job: &Arc<Job>, index: u32, node: &str) -> Allocation {
        let tg = job.task_groups[0].clone();
        Allocation::new("e1", job.clone(), &tg, alloc_name(&job.id, &tg.name, index), node, node)
    }

    #[tokio::test]
    async fn every_write_advances_index() {
        let store = StateStore::new();
        let (i1, _) = store.upsert_job(job("web", 1), None).await.unwrap();
        let i2 = store
            .upsert_node(Node::new("n1", "dc1", Resources::new(1000, 1024)))
            .await
            .unwrap();
        assert!(i2 > i1);
        assert_eq!(store.latest_index(), i2);
        assert_eq!(store.snapshot().await.index(), i2);
    }

    #[tokio::test]
    async fn job_version_moves_only_on_change() {
        let store = StateStore::new();
        let (_, v0) = store.upsert_job(job("web", 1), None).await.unwrap();
        let (_, same) = store.upsert_job(job("web", 1), None).await.unwrap();
        assert_eq!(v0.version, 0);
        assert_eq!(same.version, 0);
        assert_eq!(same.job_modify_index, v0.job_modify_index);

        let (_, v1) = store.upsert_job(job("web", 3), None).await.unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(store.snapshot().await.job_versions("web").len(), 2);
    }

    #[tokio::test]
    async fn eval_transitions_are_monotonic() {
        let store = StateStore::new();
        let mut eval = Evaluation::new("web", 50, TriggerReason::JobRegister);
        store.upsert_evals(vec![eval.clone()]).await.unwrap();
        eval.status = EvalStatus::Complete;
        store.upsert_evals(vec![eval.clone()]).await.unwrap();
        eval.status = EvalStatus::Pending;
        let err = store.upsert_evals(vec![eval]).await.unwrap_err();
        assert!(matches!(err, OrchError::InvalidEvalTransition { .. }));
    }

    #[tokio::test]
    async fn wait_for_index_times_out() {
        let store = StateStore::new();
        let err = store
            .wait_for_index(5, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchError::IndexTimeout(5)));
    }

    #[tokio::test]
    async fn wait_for_index_wakes_on_write() {
        let store = Arc::new(StateStore::new());
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_for_index(1, Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.upsert_job(job("web", 1), None).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn plan_results_link_and_count() {
        let store = StateStore::new();
        let (_, j) = store.upsert_job(job("web", 2), None).await.unwrap();

        let mut deployment = Deployment::new(&j);
        deployment.task_groups.insert(
            "web".into(),
            DeploymentState {
                desired_total: 2,
                ..Default::default()
            },
        );
        let mut first = alloc_for(&j, 0, "n1");
        first.deployment_id = Some(deployment.id.clone());

        let mut plan = Plan::new("e1", "t", 50);
        plan.append_alloc(first.clone());
        let result = PlanResult {
            node_allocation: plan.node_allocation.clone(),
            deployment: Some(deployment.clone()),
            ..Default::default()
        };
        store.upsert_plan_results(&result, vec![]).await.unwrap();

        let snap = store.snapshot().await;
        assert_eq!(
            snap.deployment_by_id(&deployment.id).unwrap().task_groups["web"].placed_allocs,
            1
        );
        assert_eq!(snap.job_by_id("web").unwrap().status, JobStatus::Running);

        let mut replacement = alloc_for(&j, 0, "n2");
        replacement.previous_allocation = Some(first.id.clone());
        let result = PlanResult {
            node_allocation: BTreeMap::from([("n2".to_string(), vec![replacement.clone()])]),
            ..Default::default()
        };
        store.upsert_plan_results(&result, vec![]).await.unwrap();
        let snap = store.snapshot().await;
        assert_eq!(
            snap.alloc_by_id(&first.id).unwrap().next_allocation.as_deref(),
            Some(replacement.id.as_str())
        );
    }

    #[tokio::test]
    async fn plan_results_reject_canary_overflow() {
        let store = StateStore::new();
        let (_, j) = store.upsert_job(job("web", 2), None).await.unwrap();
        let mut deployment = Deployment::new(&j);
        deployment.task_groups.insert(
            "web".into(),
            DeploymentState {
                desired_canaries: 1,
                desired_total: 2,
                placed_canaries: vec!["a".into(), "b".into()],
                ..Default::default()
            },
        );
        let result = PlanResult {
            deployment: Some(deployment),
            ..Default::default()
        };
        let before = store.latest_index();
        let err = store.upsert_plan_results(&result, vec![]).await.unwrap_err();
        assert!(matches!(err, OrchError::Invariant(_)));
        assert_eq!(store.latest_index(), before);
    }

    #[tokio::test]
    async fn alloc_health_counts_once() {
        let store = StateStore::new();
        let (_, j) = store.upsert_job(job("web", 1), None).await.unwrap();
        let mut deployment = Deployment::new(&j);
        deployment.task_groups.insert(
            "web".into(),
            DeploymentState {
                desired_total: 1,
                ..Default::default()
            },
        );
        let mut a = alloc_for(&j, 0, "n1");
        a.deployment_id = Some(deployment.id.clone());
        let result = PlanResult {
            node_allocation: BTreeMap::from([("n1".to_string(), vec![a.clone()])]),
            deployment: Some(deployment.clone()),
            ..Default::default()
        };
        store.upsert_plan_results(&result, vec![]).await.unwrap();

        for _ in 0..2 {
            store
                .update_deployment_alloc_health(
                    &deployment.id,
                    &[a.id.clone()],
                    &[],
                    None,
                    None,
                    Utc::now(),
                )
                .await
                .unwrap();
        }
        let snap = store.snapshot().await;
        let state = &snap.deployment_by_id(&deployment.id).unwrap().task_groups["web"];
        assert_eq!(state.healthy_allocs, 1);
        assert_eq!(snap.alloc_by_id(&a.id).unwrap().deployment_healthy(), Some(true));
    }

    #[tokio::test]
    async fn batch_moves_on_once_every_allocation_is_judged() {
        let store = StateStore::new();
        let (_, j) = store.upsert_job(job("web", 3), None).await.unwrap();
        let mut deployment = Deployment::new(&j);
        deployment.task_groups.insert(
            "web".into(),
            DeploymentState {
                desired_total: 3,
                ..Default::default()
            },
        );
        let mut first = Vec::new();
        for i in 0..2 {
            let mut a = alloc_for(&j, i, "n1");
            a.deployment_id = Some(deployment.id.clone());
            first.push(a);
        }
        let result = PlanResult {
            node_allocation: BTreeMap::from([("n1".to_string(), first.clone())]),
            deployment: Some(deployment.clone()),
            ..Default::default()
        };
        store.upsert_plan_results(&result, vec![]).await.unwrap();

        store
            .update_deployment_alloc_health(&deployment.id, &[first[0].id.clone()], &[], None, None, Utc::now())
            .await
            .unwrap();
        let snap = store.snapshot().await;
        let d = snap.deployment_by_id(&deployment.id).unwrap();
        assert_eq!(d.task_groups["web"].batch_start_index, 0, "Batch still has an undecided allocation");
        assert_eq!(snap.deployment_batch(d, "web").len(), 2);

        let settled_at = store
            .update_deployment_alloc_health(&deployment.id, &[], &[first[1].id.clone()], None, None, Utc::now())
            .await
            .unwrap();
        let snap = store.snapshot().await;
        let d = snap.deployment_by_id(&deployment.id).unwrap();
        assert_eq!(d.task_groups["web"].batch_start_index, settled_at + 1);
        assert!(snap.deployment_batch(d, "web").is_empty());

        let mut next = alloc_for(&j, 2, "n1");
        next.deployment_id = Some(deployment.id.clone());
        let result = PlanResult {
            node_allocation: BTreeMap::from([("n1".to_string(), vec![next.clone()])]),
            ..Default::default()
        };
        store.upsert_plan_results(&result, vec![]).await.unwrap();
        let snap = store.snapshot().await;
        let d = snap.deployment_by_id(&deployment.id).unwrap();
        let batch = snap.deployment_batch(d, "web");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, next.id);
        assert_eq!(d.task_groups["web"].placed_allocs, 3);
    }

    #[tokio::test]
    async fn terminal_deployment_rejects_status_change() {
        let store = StateStore::new();
        let (_, j) = store.upsert_job(job("web", 1), None).await.unwrap();
        let deployment = Deployment::new(&j);
        let result = PlanResult {
            deployment: Some(deployment.clone()),
            ..Default::default()
        };
        store.upsert_plan_results(&result, vec![]).await.unwrap();

        let fail = DeploymentStatusUpdate {
            deployment_id: deployment.id.clone(),
            status: DeploymentStatus::Failed,
            status_description: "failed".into(),
        };
        store.update_deployment_status(fail.clone(), None).await.unwrap();
        let err = store.update_deployment_status(fail, None).await.unwrap_err();
        assert!(matches!(err, OrchError::InvalidDeploymentAction { .. }));
    }

    #[tokio::test]
    async fn lost_allocations_ignore_late_client_updates() {
        let store = StateStore::new();
        let (_, j) = store.upsert_job(job("web", 1), None).await.unwrap();
        let a = alloc_for(&j, 0, "n1");
        let mut plan = Plan::new("e1", "t", 50);
        plan.append_alloc(a.clone());
        let result = PlanResult {
            node_allocation: plan.node_allocation.clone(),
            ..Default::default()
        };
        store.upsert_plan_results(&result, vec![]).await.unwrap();

        let mut stop = Plan::new("e2", "t", 50);
        stop.append_stopped_alloc(&a, "alloc is lost", Some(ClientStatus::Lost), None);
        let result = PlanResult {
            node_update: stop.node_update.clone(),
            ..Default::default()
        };
        store.upsert_plan_results(&result, vec![]).await.unwrap();

        store
            .update_allocs_from_client(
                vec![AllocClientUpdate {
                    alloc_id: a.id.clone(),
                    client_status: ClientStatus::Running,
                    description: String::new(),
                }],
                vec![],
            )
            .await
            .unwrap();
        let snap = store.snapshot().await;
        assert_eq!(snap.alloc_by_id(&a.id).unwrap().client_status, ClientStatus::Lost);
    }

    #[tokio::test]
    async fn prefix_resolution() {
        let store = StateStore::new();
        store.upsert_job(job("job1", 1), None).await.unwrap();
        store.upsert_job(job("job2", 1), None).await.unwrap();
        let snap = store.snapshot().await;

        assert_eq!(snap.resolve_job("job1").unwrap().id, "job1");
        match snap.resolve_job("job") {
            Err(OrchError::AmbiguousPrefix { matches, .. }) => {
                assert_eq!(matches, vec!["job1".to_string(), "job2".to_string()])
            }
            other => panic!("expected ambiguous prefix, got {other:?}"),
        }
        assert!(matches!(snap.resolve_job("nope"), Err(OrchError::JobNotFound(_))));
    }
}
