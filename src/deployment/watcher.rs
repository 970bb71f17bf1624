use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::deployment::deployment_eval;
use crate::error::Result;
use crate::model::deployment::{DESC_FAILED_ALLOCATIONS, DESC_SUCCESSFUL};
use crate::model::{
    Allocation, ClientStatus, Deployment, DeploymentStatus, DeploymentStatusUpdate, Job,
};
use crate::plan::{DeploymentWrite, PlanQueue};
use crate::state::{StateSnapshot, StateStore};

/// Health verdicts reached in one pass over a deployment.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct HealthDecisions {
    pub healthy: Vec<String>,
    pub unhealthy: Vec<String>,
}

impl HealthDecisions {
    fn is_empty(&self) -> bool {
        self.healthy.is_empty() && self.unhealthy.is_empty()
    }
}

/// Healthy after `min_healthy_time` running; unhealthy once it stops
/// running or misses the healthy deadline. None while undecided.
pub fn alloc_health(job: &Job, alloc: &Allocation, now: DateTime<Utc>) -> Option<bool> {
    let strategy = job
        .lookup_task_group(&alloc.task_group)
        .and_then(|tg| tg.update.as_ref())?;
    match alloc.client_status {
        ClientStatus::Failed | ClientStatus::Lost | ClientStatus::Complete => Some(false),
        ClientStatus::Running => {
            let since = alloc.client_status_time.unwrap_or(alloc.create_time);
            let running_for = (now - since).to_std().unwrap_or(Duration::ZERO);
            if running_for >= strategy.min_healthy_time() {
                Some(true)
            } else {
                past_deadline(alloc, strategy.healthy_deadline(), now)
            }
        }
        ClientStatus::Pending => past_deadline(alloc, strategy.healthy_deadline(), now),
    }
}

fn past_deadline(alloc: &Allocation, deadline: Duration, now: DateTime<Utc>) -> Option<bool> {
    let age = (now - alloc.create_time).to_std().unwrap_or(Duration::ZERO);
    (age >= deadline).then_some(false)
}

/// Undecided allocations of `deployment` that now have a verdict.
pub fn decide_health(
    snapshot: &StateSnapshot,
    job: &Job,
    deployment: &Deployment,
    now: DateTime<Utc>,
) -> HealthDecisions {
    let mut decisions = HealthDecisions::default();
    for alloc in snapshot.allocs_by_deployment(&deployment.id) {
        if alloc.deployment_healthy().is_some() {
            continue;
        }
        // Stopped by the scheduler before it ever failed: no verdict.
        if alloc.server_terminal() && !alloc.client_terminal() {
            continue;
        }
        match alloc_health(job, &alloc, now) {
            Some(true) => decisions.healthy.push(alloc.id),
            Some(false) => decisions.unhealthy.push(alloc.id),
            None => {}
        }
    }
    decisions
}

/// Whether the unhealthy allocations of any group's current batch, counting
/// the verdicts in `decisions`, exceed the group's failure threshold.
pub fn exceeds_failure_threshold(
    snapshot: &StateSnapshot,
    job: &Job,
    deployment: &Deployment,
    decisions: &HealthDecisions,
) -> bool {
    deployment.task_groups.keys().any(|name| {
        let batch = snapshot.deployment_batch(deployment, name);
        let unhealthy = batch
            .iter()
            .filter(|a| a.deployment_healthy() == Some(false) || decisions.unhealthy.contains(&a.id))
            .count();
        if unhealthy == 0 {
            return false;
        }
        let threshold = job
            .lookup_task_group(name)
            .and_then(|tg| tg.update.as_ref())
            .map(|u| u.failure_threshold)
            .unwrap_or(0.0);
        unhealthy as f64 > threshold * batch.len() as f64
    })
}

/// Every canary group that auto-promotes has all its canaries healthy.
pub fn ready_for_auto_promotion(snapshot: &StateSnapshot, deployment: &Deployment) -> bool {
    if !deployment.requires_promotion() || !deployment.has_auto_promote() {
        return false;
    }
    deployment
        .task_groups
        .values()
        .filter(|s| s.requires_promotion())
        .all(|state| {
            let healthy = state
                .placed_canaries
                .iter()
                .filter(|id| {
                    snapshot
                        .alloc_by_id(id)
                        .and_then(|a| a.deployment_healthy())
                        .unwrap_or(false)
                })
                .count() as u32;
            healthy >= state.desired_canaries
        })
}

/// All groups promoted (or canary-free) with enough healthy allocations.
pub fn is_complete(deployment: &Deployment) -> bool {
    !deployment.task_groups.is_empty()
        && deployment
            .task_groups
            .values()
            .all(|s| !s.requires_promotion() && s.healthy_allocs >= s.desired_total)
}

/// Leader loop that drives active deployments: allocation health,
/// auto-promotion, failure and completion.
pub struct DeploymentWatcher {
    store: Arc<StateStore>,
    plan_queue: PlanQueue,
    interval: Duration,
}

impl DeploymentWatcher {
    pub fn new(store: Arc<StateStore>, plan_queue: PlanQueue, interval: Duration) -> Self {
        Self {
            store,
            plan_queue,
            interval,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut index_rx = self.store.subscribe();
        let mut tick = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = index_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tick.tick() => {}
            }
            if let Err(err) = self.watch_once().await {
                tracing::warn!(error = %err, "Deployment watcher pass failed");
            }
        }
        tracing::debug!("Deployment watcher stopped");
    }

    /// One pass over every active deployment.
    pub async fn watch_once(&self) -> Result<()> {
        let snapshot = self.store.snapshot().await;
        let now = Utc::now();
        let active: Vec<Deployment> = snapshot.deployments().filter(|d| d.active()).cloned().collect();
        for deployment in active {
            let Some(job) = snapshot.job_by_id(&deployment.job_id) else {
                continue;
            };
            // The scheduler cancels deployments of older job versions.
            if job.job_modify_index != deployment.job_modify_index {
                continue;
            }
            if let Err(err) = self.watch_deployment(&snapshot, &job, &deployment, now).await {
                tracing::warn!(
                    deployment_id = %deployment.short_id(),
                    error = %err,
                    "Failed to update deployment"
                );
            }
        }
        Ok(())
    }

    async fn watch_deployment(
        &self,
        snapshot: &StateSnapshot,
        job: &Job,
        deployment: &Deployment,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let running = deployment.status == DeploymentStatus::Running;
        let decisions = decide_health(snapshot, job, deployment, now);
        if !decisions.is_empty() {
            let failing = exceeds_failure_threshold(snapshot, job, deployment, &decisions);
            let status_update = failing.then(|| DeploymentStatusUpdate {
                deployment_id: deployment.id.clone(),
                status: DeploymentStatus::Failed,
                status_description: DESC_FAILED_ALLOCATIONS.to_string(),
            });
            // Healthy allocations unlock the next batch. Unhealthy ones can
            // now be rescheduled, even while the rollout is paused.
            let eval = (failing || running || !decisions.unhealthy.is_empty())
                .then(|| deployment_eval(job, deployment));
            tracing::info!(
                deployment_id = %deployment.short_id(),
                healthy = decisions.healthy.len(),
                unhealthy = decisions.unhealthy.len(),
                failing,
                "Recording allocation health"
            );
            self.plan_queue
                .update_deployment(DeploymentWrite::AllocHealth {
                    deployment_id: deployment.id.clone(),
                    healthy: decisions.healthy,
                    unhealthy: decisions.unhealthy,
                    status_update,
                    eval,
                    timestamp: now,
                })
                .await?;
            // Promotion and completion are judged on the next pass.
            return Ok(());
        }

        if !running {
            return Ok(());
        }

        if ready_for_auto_promotion(snapshot, deployment) {
            tracing::info!(deployment_id = %deployment.short_id(), "Auto-promoting canaries");
            self.plan_queue
                .update_deployment(DeploymentWrite::Promotion {
                    deployment_id: deployment.id.clone(),
                    groups: None,
                    eval: Some(deployment_eval(job, deployment)),
                })
                .await?;
            return Ok(());
        }

        if is_complete(deployment) {
            tracing::info!(deployment_id = %deployment.short_id(), "Deployment successful");
            // Allocations that failed after being judged healthy were held
            // back from rescheduling while the deployment was active.
            let unreplaced = snapshot
                .allocs_by_deployment(&deployment.id)
                .iter()
                .any(|a| a.client_status == ClientStatus::Failed && a.next_allocation.is_none());
            self.plan_queue
                .update_deployment(DeploymentWrite::Status {
                    update: DeploymentStatusUpdate {
                        deployment_id: deployment.id.clone(),
                        status: DeploymentStatus::Successful,
                        status_description: DESC_SUCCESSFUL.to_string(),
                    },
                    eval: unreplaced.then(|| deployment_eval(job, deployment)),
                })
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_fixtures::job;
    use crate::model::{alloc_name, AllocDeploymentStatus, DeploymentState, UpdateStrategy};

    fn rolling_job() -> Arc<Job> {
        let mut j = job("web", 2);
        j.task_groups[0].update = Some(UpdateStrategy {
            min_healthy_time_ms: 1_000,
            healthy_deadline_ms: 10_000,
            ..Default::default()
        });
        Arc::new(j)
    }

    fn alloc(j: &Arc<Job>, status: ClientStatus, age_ms: i64) -> Allocation {
        let tg = j.task_groups[0].clone();
        let mut a = Allocation::new("e1", j.clone(), &tg, alloc_name("web", "web", 0), "n1", "n1");
        let at = Utc::now() - chrono::Duration::milliseconds(age_ms);
        a.create_time = at;
        a.client_status = status;
        a.client_status_time = Some(at);
        a
    }

    #[test]
    fn health_follows_running_time_and_deadline() {
        let j = rolling_job();
        let now = Utc::now();
        assert_eq!(alloc_health(&j, &alloc(&j, ClientStatus::Running, 2_000), now), Some(true));
        assert_eq!(alloc_health(&j, &alloc(&j, ClientStatus::Running, 100), now), None);
        assert_eq!(alloc_health(&j, &alloc(&j, ClientStatus::Failed, 100), now), Some(false));
        assert_eq!(alloc_health(&j, &alloc(&j, ClientStatus::Pending, 100), now), None);
        assert_eq!(alloc_health(&j, &alloc(&j, ClientStatus::Pending, 20_000), now), Some(false));
    }

    #[test]
    fn no_update_strategy_means_no_verdict() {
        let j = Arc::new(job("web", 1));
        assert_eq!(alloc_health(&j, &alloc(&j, ClientStatus::Failed, 0), Utc::now()), None);
    }

    fn batch_alloc(
        j: &Arc<Job>,
        d: &Deployment,
        index: u32,
        create_index: u64,
        healthy: Option<bool>,
    ) -> Allocation {
        let mut a = alloc(j, ClientStatus::Running, 2_000);
        a.name = alloc_name("web", "web", index);
        a.deployment_id = Some(d.id.clone());
        a.create_index = create_index;
        a.deployment_status = Some(AllocDeploymentStatus {
            healthy,
            ..Default::default()
        });
        a
    }

    #[test]
    fn failure_threshold_applies_to_current_batch() {
        let mut j = job("web", 4);
        j.task_groups[0].update = Some(UpdateStrategy {
            max_parallel: 2,
            failure_threshold: 0.5,
            ..Default::default()
        });
        let j = Arc::new(j);
        let mut d = Deployment::new(&j);
        d.task_groups.insert(
            "web".into(),
            DeploymentState {
                desired_total: 4,
                placed_allocs: 4,
                healthy_allocs: 2,
                batch_start_index: 10,
                ..Default::default()
            },
        );

        let mut snapshot = StateSnapshot::default();
        let mut second_batch = Vec::new();
        for (i, create_index, healthy) in [(0, 5, Some(true)), (1, 5, Some(true)), (2, 12, None), (3, 12, None)] {
            let a = batch_alloc(&j, &d, i, create_index, healthy);
            if create_index == 12 {
                second_batch.push(a.id.clone());
            }
            snapshot.allocs.insert(a.id.clone(), a);
        }

        let one = HealthDecisions {
            healthy: Vec::new(),
            unhealthy: second_batch[..1].to_vec(),
        };
        assert!(!exceeds_failure_threshold(&snapshot, &j, &d, &one), "Half of the batch is tolerated");

        let both = HealthDecisions {
            healthy: Vec::new(),
            unhealthy: second_batch.clone(),
        };
        assert!(exceeds_failure_threshold(&snapshot, &j, &d, &both));

        // Spread over every placement the same failures would not trip it
        if let Some(state) = d.task_groups.get_mut("web") {
            state.batch_start_index = 0;
        }
        assert!(!exceeds_failure_threshold(&snapshot, &j, &d, &both));
    }

    #[test]
    fn zero_threshold_fails_on_first_unhealthy() {
        let j = rolling_job();
        let mut d = Deployment::new(&j);
        d.task_groups.insert("web".into(), DeploymentState::default());
        let mut snapshot = StateSnapshot::default();
        let a = batch_alloc(&j, &d, 0, 1, None);
        let decisions = HealthDecisions {
            healthy: Vec::new(),
            unhealthy: vec![a.id.clone()],
        };
        snapshot.allocs.insert(a.id.clone(), a);
        assert!(exceeds_failure_threshold(&snapshot, &j, &d, &decisions));
    }

    #[test]
    fn completion_requires_promotion_and_health() {
        let j = rolling_job();
        let mut d = Deployment::new(&j);
        d.task_groups.insert(
            "web".into(),
            DeploymentState {
                desired_total: 2,
                desired_canaries: 1,
                healthy_allocs: 2,
                ..Default::default()
            },
        );
        assert!(!is_complete(&d));
        if let Some(s) = d.task_groups.get_mut("web") {
            s.promoted = true;
        }
        assert!(is_complete(&d));
        if let Some(s) = d.task_groups.get_mut("web") {
            s.healthy_allocs = 1;
        }
        assert!(!is_complete(&d));
    }
}
