use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OrchError, Result};
use crate::model::deployment::{DESC_NEWER_JOB, DESC_STOPPED_JOB};
use crate::model::{
    Allocation, ClientStatus, Deployment, DeploymentState, DeploymentStatus,
    DeploymentStatusUpdate, Evaluation, Job, Node, TaskGroup, TriggerReason, UpdateStrategy,
};
use crate::scheduler::reconcile_util::{AllocNameIndex, AllocSet, DelayedReschedule};
use crate::scheduler::reschedule::BATCHED_FAILED_ALLOC_WINDOW;

pub const ALLOC_NOT_NEEDED: &str = "alloc not needed due to job update";
pub const ALLOC_JOB_STOPPED: &str = "alloc not needed since job is stopped";
pub const ALLOC_MIGRATING: &str = "alloc is being migrated";
pub const ALLOC_UPDATING: &str = "alloc is being updated due to job update";
pub const ALLOC_LOST: &str = "alloc is lost since its node is down";
pub const ALLOC_RESCHEDULED: &str = "alloc was rescheduled because it failed";
pub const RESCHEDULING_FOLLOWUP_EVAL_DESC: &str = "created for delayed rescheduling";

/// A new allocation the scheduler must find a node for.
#[derive(Debug, Clone)]
pub struct AllocPlaceResult {
    pub name: String,
    pub task_group: TaskGroup,
    /// Allocation being replaced, if any.
    pub previous_alloc: Option<Allocation>,
    pub canary: bool,
    /// Replacement for a failed allocation. The failed one is stopped only
    /// once the replacement finds a node.
    pub reschedule: bool,
    pub lost: bool,
}

/// Replace `stop_alloc` with a fresh allocation of the same name.
#[derive(Debug, Clone)]
pub struct AllocDestructiveResult {
    pub place_name: String,
    pub task_group: TaskGroup,
    pub stop_alloc: Allocation,
    pub stop_description: String,
}

#[derive(Debug, Clone)]
pub struct AllocStopResult {
    pub alloc: Allocation,
    pub client_status: Option<ClientStatus>,
    pub description: String,
}

/// Per group tally of what the reconciler decided.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredUpdates {
    pub ignore: u32,
    pub place: u32,
    pub migrate: u32,
    pub stop: u32,
    pub in_place_update: u32,
    pub destructive_update: u32,
    pub canary: u32,
}

impl fmt::Display for DesiredUpdates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(place {}) (inplace {}) (destructive {}) (stop {}) (migrate {}) (ignore {}) (canary {})",
            self.place,
            self.in_place_update,
            self.destructive_update,
            self.stop,
            self.migrate,
            self.ignore,
            self.canary
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileResults {
    /// Deployment created by this pass.
    pub deployment: Option<Deployment>,
    pub deployment_updates: Vec<DeploymentStatusUpdate>,
    pub place: Vec<AllocPlaceResult>,
    pub destructive_update: Vec<AllocDestructiveResult>,
    pub inplace_update: Vec<Allocation>,
    pub stop: Vec<AllocStopResult>,
    /// Existing allocations annotated with their follow-up evaluation.
    pub attribute_updates: BTreeMap<String, Allocation>,
    pub desired_tg_updates: BTreeMap<String, DesiredUpdates>,
    pub desired_followup_evals: BTreeMap<String, Vec<Evaluation>>,
    /// Deployment that new placements join: the one created here or the
    /// job's current one, when active.
    pub active_deployment: Option<Deployment>,
}

impl ReconcileResults {
    pub fn followup_evals(&self) -> impl Iterator<Item = &Evaluation> {
        self.desired_followup_evals.values().flatten()
    }
}

impl fmt::Display for ReconcileResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "place={} destructive={} inplace={} stop={} followups={}",
            self.place.len(),
            self.destructive_update.len(),
            self.inplace_update.len(),
            self.stop.len(),
            self.followup_evals().count()
        )?;
        for (group, desired) in &self.desired_tg_updates {
            write!(f, " [{group}: {desired}]")?;
        }
        Ok(())
    }
}

/// Delayed evaluation that retries failed allocations at `wait_until`.
/// The instant must lie in the future.
pub(crate) fn create_followup_evaluation(
    job: &Job,
    priority: u32,
    wait_until: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Evaluation> {
    if wait_until <= now {
        return Err(OrchError::FollowupNotInFuture);
    }
    let mut eval = Evaluation::new(job.id.clone(), priority, TriggerReason::RetryFailedAlloc);
    eval.job_modify_index = job.job_modify_index;
    eval.status_description = RESCHEDULING_FOLLOWUP_EVAL_DESC.to_string();
    eval.wait_until = Some(wait_until);
    Ok(eval)
}

/// Diffs the allocations a job has against the ones it should have.
///
/// The result is a pure function of its inputs: running it twice over the
/// same state yields the same decisions, and running it over the state
/// produced by applying its own decisions yields nothing new.
pub struct AllocReconciler<'a> {
    job_id: String,
    job: Option<Arc<Job>>,
    deployment: Option<Deployment>,
    old_deployment: Option<Deployment>,
    deployment_paused: bool,
    deployment_failed: bool,
    existing: Vec<Allocation>,
    tainted: &'a BTreeMap<String, Option<Node>>,
    eval_id: String,
    eval_priority: u32,
    now: DateTime<Utc>,
    result: ReconcileResults,
}

impl<'a> AllocReconciler<'a> {
    /// `job` is None when the job was purged. `tainted` holds the nodes of
    /// `existing` that are not ready, or None for nodes that are gone.
    pub fn new(
        job_id: impl Into<String>,
        job: Option<Arc<Job>>,
        deployment: Option<Deployment>,
        existing: Vec<Allocation>,
        tainted: &'a BTreeMap<String, Option<Node>>,
        eval: &Evaluation,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            job,
            deployment,
            old_deployment: None,
            deployment_paused: false,
            deployment_failed: false,
            existing,
            tainted,
            eval_id: eval.id.clone(),
            eval_priority: eval.priority,
            now,
            result: ReconcileResults::default(),
        }
    }

    pub fn compute(mut self) -> ReconcileResults {
        let job = match &self.job {
            Some(job) if !job.stop => job.clone(),
            _ => {
                self.handle_stop();
                return self.result;
            }
        };

        self.cancel_unneeded_deployments(&job);
        if let Some(d) = &self.deployment {
            self.deployment_paused = d.status == DeploymentStatus::Paused;
            self.deployment_failed =
                matches!(d.status, DeploymentStatus::Failed | DeploymentStatus::Cancelled);
        }

        let mut groups: BTreeMap<String, AllocSet> = BTreeMap::new();
        for tg in &job.task_groups {
            groups.entry(tg.name.clone()).or_default();
        }
        for alloc in std::mem::take(&mut self.existing) {
            groups.entry(alloc.task_group.clone()).or_default().insert(alloc);
        }
        for (group, all) in groups {
            self.compute_group(&job, &group, all);
        }

        self.result.active_deployment = self.deployment.clone().filter(Deployment::active);
        self.result
    }

    fn handle_stop(&mut self) {
        if let Some(d) = self.deployment.take() {
            if d.active() {
                self.result.deployment_updates.push(DeploymentStatusUpdate {
                    deployment_id: d.id.clone(),
                    status: DeploymentStatus::Cancelled,
                    status_description: DESC_STOPPED_JOB.to_string(),
                });
            }
            self.old_deployment = Some(d);
        }

        let mut groups: BTreeMap<String, AllocSet> = BTreeMap::new();
        for alloc in std::mem::take(&mut self.existing) {
            groups.entry(alloc.task_group.clone()).or_default().insert(alloc);
        }
        for (group, all) in groups {
            let (untainted, migrate, lost) = all.filter_by_tainted(self.tainted);
            let untainted = untainted.filter_non_terminal();
            self.mark_stop(&untainted, None, ALLOC_JOB_STOPPED);
            self.mark_stop(&migrate, None, ALLOC_JOB_STOPPED);
            self.mark_stop(&lost, Some(ClientStatus::Lost), ALLOC_LOST);
            let desired = DesiredUpdates {
                stop: (untainted.len() + migrate.len() + lost.len()) as u32,
                ..Default::default()
            };
            self.result.desired_tg_updates.insert(group, desired);
        }
    }

    /// Retire deployments that no longer describe the job version.
    fn cancel_unneeded_deployments(&mut self, job: &Job) {
        let Some(d) = self.deployment.clone() else {
            return;
        };
        if d.job_create_index != job.create_index || d.job_version != job.version {
            if d.active() {
                self.result.deployment_updates.push(DeploymentStatusUpdate {
                    deployment_id: d.id.clone(),
                    status: DeploymentStatus::Cancelled,
                    status_description: DESC_NEWER_JOB.to_string(),
                });
            }
            self.old_deployment = Some(d);
            self.deployment = None;
            return;
        }
        if d.status == DeploymentStatus::Successful {
            self.old_deployment = Some(d);
            self.deployment = None;
        }
    }

    fn mark_stop(&mut self, set: &AllocSet, client_status: Option<ClientStatus>, description: &str) {
        for alloc in set.values() {
            self.result.stop.push(AllocStopResult {
                alloc: alloc.clone(),
                client_status,
                description: description.to_string(),
            });
        }
    }

    fn compute_group(&mut self, job: &Arc<Job>, group: &str, all: AllocSet) {
        let mut desired = DesiredUpdates::default();

        let Some(tg) = job.lookup_task_group(group).cloned() else {
            let stop = all.filter_non_terminal();
            desired.stop = stop.len() as u32;
            self.mark_stop(&stop, None, ALLOC_NOT_NEEDED);
            self.result.desired_tg_updates.insert(group.to_string(), desired);
            return;
        };
        let strategy: Option<UpdateStrategy> = tg.update.clone().filter(|u| !u.is_empty());

        let existing_state = self
            .deployment
            .as_ref()
            .and_then(|d| d.task_groups.get(group).cloned());
        let existing_deployment = existing_state.is_some();
        let mut dstate = existing_state.unwrap_or_else(|| DeploymentState {
            auto_promote: strategy.as_ref().map(|s| s.auto_promote).unwrap_or(false),
            ..Default::default()
        });

        let (canaries, all) = self.handle_group_canaries(all, &mut desired);

        let (untainted, migrate, lost) = all.filter_by_tainted(self.tainted);
        let (mut untainted, reschedule_now, reschedule_later) =
            untainted.filter_by_rescheduleable(self.now, &self.eval_id, self.deployment.as_ref());

        self.handle_delayed_reschedules(job, reschedule_later, &all, group);

        let mut name_index = AllocNameIndex::new(
            &self.job_id,
            group,
            tg.count,
            &untainted.union(&[&migrate, &reschedule_now]),
        );

        let mut canary_state = dstate.desired_canaries != 0 && !dstate.promoted;
        let (stop, migrate) = self.compute_stop(
            &tg,
            &mut name_index,
            &untainted,
            migrate,
            &lost,
            &canaries,
            canary_state,
        );
        desired.stop += stop.len() as u32;
        untainted = untainted.difference(&[&stop]);

        let (ignore, inplace, destructive) = self.compute_updates(job, &tg, &untainted);
        desired.ignore += ignore.len() as u32;
        desired.in_place_update += inplace.len() as u32;
        if !existing_deployment {
            dstate.desired_total += (destructive.len() + inplace.len()) as u32;
        }

        if canary_state {
            untainted = untainted.difference(&[&canaries]);
        }

        let require_canary = !destructive.is_empty()
            && strategy
                .as_ref()
                .map(|s| (canaries.len() as u32) < s.canary)
                .unwrap_or(false)
            && !dstate.promoted;
        if require_canary {
            if let Some(s) = &strategy {
                dstate.desired_canaries = s.canary;
            }
        }
        if require_canary && !self.deployment_paused && !self.deployment_failed {
            let number = dstate.desired_canaries as usize - canaries.len();
            desired.canary += number as u32;
            for name in name_index.next_canaries(number, &canaries, &destructive) {
                self.result.place.push(AllocPlaceResult {
                    name,
                    task_group: tg.clone(),
                    previous_alloc: None,
                    canary: true,
                    reschedule: false,
                    lost: false,
                });
            }
        }

        canary_state = dstate.desired_canaries != 0 && !dstate.promoted;
        let mut limit = self.compute_limit(&tg, &untainted, &destructive, &migrate, canary_state);

        let place = compute_placements(
            &tg,
            &mut name_index,
            &untainted,
            &migrate,
            &reschedule_now,
            &lost,
        );
        if !existing_deployment {
            dstate.desired_total += place.len() as u32;
        }

        let place_ready = !self.deployment_paused && !self.deployment_failed && !canary_state;
        if place_ready {
            desired.place += place.len() as u32;
            limit = limit.saturating_sub(place.len());
            self.result.place.extend(place);
        } else {
            // Lost and failed allocations are replaced even while the rollout
            // is held, except failures belonging to the failed deployment.
            let failed_id = self
                .deployment
                .as_ref()
                .filter(|_| self.deployment_failed)
                .map(|d| d.id.clone());
            for p in place {
                let in_failed = p
                    .previous_alloc
                    .as_ref()
                    .map(|prev| prev.deployment_id.is_some() && prev.deployment_id == failed_id)
                    .unwrap_or(false);
                if p.lost || (p.reschedule && !in_failed) {
                    desired.place += 1;
                    self.result.place.push(p);
                }
            }
        }

        if place_ready {
            let ordered = destructive.name_order();
            let n = ordered.len().min(limit);
            desired.destructive_update += n as u32;
            desired.ignore += (ordered.len() - n) as u32;
            for alloc in ordered.into_iter().take(n) {
                self.result.destructive_update.push(AllocDestructiveResult {
                    place_name: alloc.name.clone(),
                    task_group: tg.clone(),
                    stop_alloc: alloc,
                    stop_description: ALLOC_UPDATING.to_string(),
                });
            }
        } else {
            desired.ignore += destructive.len() as u32;
        }

        desired.migrate += migrate.len() as u32;
        for alloc in migrate.name_order() {
            self.result.stop.push(AllocStopResult {
                alloc: alloc.clone(),
                client_status: None,
                description: ALLOC_MIGRATING.to_string(),
            });
            self.result.place.push(AllocPlaceResult {
                name: alloc.name.clone(),
                task_group: tg.clone(),
                previous_alloc: Some(alloc),
                canary: false,
                reschedule: false,
                lost: false,
            });
        }

        let updating_spec = !destructive.is_empty() || !self.result.inplace_update.is_empty();
        let had_running = all.values().any(|a| {
            a.job.version == job.version && a.job.create_index == job.create_index
        });
        if !existing_deployment
            && strategy.is_some()
            && dstate.desired_total != 0
            && (!had_running || updating_spec)
        {
            if self.deployment.is_none() {
                let d = Deployment::new(job);
                tracing::debug!(
                    deployment_id = %d.short_id(),
                    job_id = %job.id,
                    version = job.version,
                    "Creating deployment"
                );
                self.deployment = Some(d);
            }
            if let Some(d) = self.deployment.as_mut() {
                d.task_groups.insert(group.to_string(), dstate);
                self.result.deployment = Some(d.clone());
            }
        }

        self.result.desired_tg_updates.insert(group.to_string(), desired);
    }

    /// Stop canaries of superseded or failed deployments and split the
    /// current deployment's canaries off the rest of the group.
    fn handle_group_canaries(
        &mut self,
        all: AllocSet,
        desired: &mut DesiredUpdates,
    ) -> (AllocSet, AllocSet) {
        let mut stop_ids: Vec<String> = Vec::new();
        if let Some(old) = &self.old_deployment {
            for state in old.task_groups.values().filter(|s| !s.promoted) {
                stop_ids.extend(state.placed_canaries.iter().cloned());
            }
        }
        if let Some(d) = &self.deployment {
            if self.deployment_failed {
                for state in d.task_groups.values().filter(|s| !s.promoted) {
                    stop_ids.extend(state.placed_canaries.iter().cloned());
                }
            }
        }
        let stop_set = all.from_keys(stop_ids.iter());
        let live = stop_set.filter_non_terminal();
        self.mark_stop(&live, None, ALLOC_NOT_NEEDED);
        desired.stop += live.len() as u32;
        let mut all = all.difference(&[&stop_set]);

        let mut canaries = AllocSet::default();
        if let Some(d) = &self.deployment {
            let ids: Vec<String> = d
                .task_groups
                .values()
                .flat_map(|s| s.placed_canaries.iter().cloned())
                .collect();
            let current = all.from_keys(ids.iter());
            let (untainted, migrate, lost) = current.filter_by_tainted(self.tainted);
            self.mark_stop(&migrate, None, ALLOC_MIGRATING);
            self.mark_stop(&lost, Some(ClientStatus::Lost), ALLOC_LOST);
            desired.stop += (migrate.len() + lost.len()) as u32;
            all = all.difference(&[&migrate, &lost]);
            canaries = untainted;
        }
        (canaries, all)
    }

    /// Batch failures that are due later into follow-up evaluations and
    /// annotate each allocation with the evaluation that will replace it.
    fn handle_delayed_reschedules(
        &mut self,
        job: &Job,
        mut later: Vec<DelayedReschedule>,
        all: &AllocSet,
        group: &str,
    ) {
        if later.is_empty() {
            return;
        }
        later.sort_by(|a, b| a.reschedule_time.cmp(&b.reschedule_time));

        let window = chrono::Duration::milliseconds(BATCHED_FAILED_ALLOC_WINDOW.as_millis() as i64);
        let mut evals: Vec<Evaluation> = Vec::new();
        let mut batch_start: Option<DateTime<Utc>> = None;
        let mut followups: BTreeMap<String, String> = BTreeMap::new();

        for delayed in &later {
            let starts_batch = match batch_start {
                Some(start) => delayed.reschedule_time - start >= window,
                None => true,
            };
            if starts_batch {
                match create_followup_evaluation(
                    job,
                    self.eval_priority,
                    delayed.reschedule_time,
                    self.now,
                ) {
                    Ok(mut eval) => {
                        eval.previous_eval = Some(self.eval_id.clone());
                        batch_start = Some(delayed.reschedule_time);
                        evals.push(eval);
                    }
                    Err(err) => {
                        tracing::warn!(
                            alloc_id = %delayed.alloc.short_id(),
                            error = %err,
                            "Skipping delayed reschedule"
                        );
                        continue;
                    }
                }
            }
            if let Some(eval) = evals.last() {
                followups.insert(delayed.alloc.id.clone(), eval.id.clone());
            }
        }

        for (alloc_id, eval_id) in followups {
            if let Some(alloc) = all.get(&alloc_id) {
                let mut updated = alloc.clone();
                updated.followup_eval_id = Some(eval_id);
                self.result.attribute_updates.insert(alloc_id, updated);
            }
        }
        if !evals.is_empty() {
            self.result
                .desired_followup_evals
                .insert(group.to_string(), evals);
        }
    }

    /// Pick allocations to stop so the group shrinks to its count. Lost
    /// allocations always go. Returns the stopped set and what is left of
    /// `migrate`.
    #[allow(clippy::too_many_arguments)]
    fn compute_stop(
        &mut self,
        tg: &TaskGroup,
        name_index: &mut AllocNameIndex,
        untainted: &AllocSet,
        mut migrate: AllocSet,
        lost: &AllocSet,
        canaries: &AllocSet,
        canary_state: bool,
    ) -> (AllocSet, AllocSet) {
        let mut stop = lost.clone();
        self.mark_stop(lost, Some(ClientStatus::Lost), ALLOC_LOST);

        let mut untainted = if canary_state {
            untainted.difference(&[canaries])
        } else {
            untainted.clone()
        };

        let mut remove = untainted.len() as i64 + migrate.len() as i64 - tg.count as i64;
        if remove <= 0 {
            return (stop, migrate);
        }

        untainted = untainted.filter_non_terminal();

        // Once promoted, the old allocations sharing a canary's name go first.
        if !canary_state && !canaries.is_empty() {
            let canary_names = canaries.name_set();
            for alloc in untainted.difference(&[canaries]).name_order() {
                if !canary_names.contains(&alloc.name) {
                    continue;
                }
                untainted.remove(&alloc.id);
                self.push_stop(&mut stop, alloc, ALLOC_NOT_NEEDED);
                remove -= 1;
                if remove == 0 {
                    return (stop, migrate);
                }
            }
        }

        if !migrate.is_empty() {
            let mut migrating_names = AllocNameIndex::new(&self.job_id, &tg.name, tg.count, &migrate);
            let remove_names = migrating_names.highest(remove as usize);
            for alloc in migrate.name_order() {
                if !remove_names.contains(&alloc.name) {
                    continue;
                }
                migrate.remove(&alloc.id);
                name_index.unset_index(alloc.index());
                self.push_stop(&mut stop, alloc, ALLOC_NOT_NEEDED);
                remove -= 1;
                if remove == 0 {
                    return (stop, migrate);
                }
            }
        }

        let remove_names: BTreeSet<String> = name_index.highest(remove as usize);
        for alloc in untainted.name_order() {
            if !remove_names.contains(&alloc.name) {
                continue;
            }
            untainted.remove(&alloc.id);
            self.push_stop(&mut stop, alloc, ALLOC_NOT_NEEDED);
            remove -= 1;
            if remove == 0 {
                return (stop, migrate);
            }
        }

        // Duplicate names can leave a remainder.
        for alloc in untainted.name_order().into_iter().rev() {
            self.push_stop(&mut stop, alloc, ALLOC_NOT_NEEDED);
            remove -= 1;
            if remove == 0 {
                break;
            }
        }
        (stop, migrate)
    }

    fn push_stop(&mut self, stop: &mut AllocSet, alloc: Allocation, description: &str) {
        self.result.stop.push(AllocStopResult {
            alloc: alloc.clone(),
            client_status: None,
            description: description.to_string(),
        });
        stop.insert(alloc);
    }

    /// Split allocations into (unchanged, updated in place, must be replaced).
    fn compute_updates(
        &mut self,
        job: &Arc<Job>,
        tg: &TaskGroup,
        untainted: &AllocSet,
    ) -> (AllocSet, AllocSet, AllocSet) {
        let mut ignore = AllocSet::default();
        let mut inplace = AllocSet::default();
        let mut destructive = AllocSet::default();
        for alloc in untainted.values() {
            if alloc.job.job_modify_index == job.job_modify_index
                && alloc.job.create_index == job.create_index
            {
                ignore.insert(alloc.clone());
                continue;
            }
            let job_level_changed = alloc.job.constraints != job.constraints
                || alloc.job.affinities != job.affinities
                || alloc.job.datacenters != job.datacenters
                || alloc.job.scheduler_algorithm != job.scheduler_algorithm;
            let group_changed = alloc.tg().map(|old| old.tasks_updated(tg)).unwrap_or(true);
            if job_level_changed || group_changed {
                destructive.insert(alloc.clone());
                continue;
            }
            if alloc.terminal_status() {
                ignore.insert(alloc.clone());
                continue;
            }
            let mut updated = alloc.clone();
            updated.job = job.clone();
            updated.eval_id = self.eval_id.clone();
            self.result.inplace_update.push(updated);
            inplace.insert(alloc.clone());
        }
        (ignore, inplace, destructive)
    }

    /// How many destructive changes may start in this pass.
    fn compute_limit(
        &self,
        tg: &TaskGroup,
        untainted: &AllocSet,
        destructive: &AllocSet,
        migrate: &AllocSet,
        canary_state: bool,
    ) -> usize {
        let strategy = match tg.update.as_ref().filter(|u| !u.is_empty()) {
            Some(s) if destructive.len() + migrate.len() > 0 => s,
            _ => return tg.count as usize,
        };
        if self.deployment_paused || self.deployment_failed || canary_state {
            return 0;
        }
        let mut limit = strategy.max_parallel as i64;
        if let Some(d) = &self.deployment {
            let (part_of, _) = untainted.filter_by_deployment(&d.id);
            for alloc in part_of.values() {
                match alloc.deployment_healthy() {
                    Some(false) => return 0,
                    Some(true) => {}
                    None => limit -= 1,
                }
            }
        }
        limit.max(0) as usize
    }
}

/// Replacements for failed and lost allocations, then fresh slots up to the
/// group count.
fn compute_placements(
    tg: &TaskGroup,
    name_index: &mut AllocNameIndex,
    untainted: &AllocSet,
    migrate: &AllocSet,
    reschedule: &AllocSet,
    lost: &AllocSet,
) -> Vec<AllocPlaceResult> {
    let mut place = Vec::new();
    for alloc in reschedule.name_order() {
        place.push(AllocPlaceResult {
            name: alloc.name.clone(),
            task_group: tg.clone(),
            canary: alloc.is_canary(),
            previous_alloc: Some(alloc),
            reschedule: true,
            lost: false,
        });
    }

    let mut existing = untainted.len() + migrate.len() + reschedule.len();
    let count = tg.count as usize;
    if existing >= count {
        return place;
    }

    for alloc in lost.name_order() {
        if existing >= count {
            break;
        }
        existing += 1;
        place.push(AllocPlaceResult {
            name: alloc.name.clone(),
            task_group: tg.clone(),
            canary: alloc.is_canary(),
            previous_alloc: Some(alloc),
            reschedule: false,
            lost: true,
        });
    }

    if existing < count {
        for name in name_index.next(count - existing) {
            place.push(AllocPlaceResult {
                name,
                task_group: tg.clone(),
                previous_alloc: None,
                canary: false,
                reschedule: false,
                lost: false,
            });
        }
    }
    place
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_fixtures::job;
    use crate::model::alloc_name;

    fn running(job: &Arc<Job>, count: u32) -> Vec<Allocation> {
        (0..count)
            .map(|i| {
                let mut alloc = Allocation::new(
                    "eval-0",
                    job.clone(),
                    &job.task_groups[0],
                    alloc_name(&job.id, "web", i),
                    format!("node-{i}"),
                    format!("node-{i}"),
                );
                alloc.set_client_status(ClientStatus::Running, "started");
                alloc
            })
            .collect()
    }

    fn reconcile(
        job: &Arc<Job>,
        existing: Vec<Allocation>,
        tainted: &BTreeMap<String, Option<Node>>,
    ) -> ReconcileResults {
        let eval = Evaluation::new(job.id.clone(), 50, TriggerReason::JobRegister);
        AllocReconciler::new(
            job.id.clone(),
            Some(job.clone()),
            None,
            existing,
            tainted,
            &eval,
            Utc::now(),
        )
        .compute()
    }

    #[test]
    fn places_missing_allocations() {
        let job = Arc::new(job("web", 3));
        let tainted = BTreeMap::new();
        let results = reconcile(&job, Vec::new(), &tainted);

        assert_eq!(results.place.len(), 3);
        let names: BTreeSet<String> = results.place.iter().map(|p| p.name.clone()).collect();
        assert!(names.contains("web.web[0]"));
        assert!(names.contains("web.web[2]"));
        assert_eq!(results.desired_tg_updates["web"].place, 3);
        assert!(results.deployment.is_none(), "No update strategy, no deployment");
    }

    #[test]
    fn converged_state_is_a_no_op() {
        let job = Arc::new(job("web", 3));
        let tainted = BTreeMap::new();
        let existing = running(&job, 3);

        let first = reconcile(&job, existing.clone(), &tainted);
        let second = reconcile(&job, existing, &tainted);
        assert!(first.place.is_empty());
        assert!(first.stop.is_empty());
        assert_eq!(first.desired_tg_updates["web"].ignore, 3);
        assert_eq!(first.desired_tg_updates, second.desired_tg_updates);
    }

    #[test]
    fn surplus_stops_highest_index() {
        let job = Arc::new(job("web", 2));
        let tainted = BTreeMap::new();
        let results = reconcile(&job, running(&job, 3), &tainted);

        assert_eq!(results.stop.len(), 1);
        assert_eq!(results.stop[0].alloc.name, "web.web[2]");
        assert_eq!(results.stop[0].description, ALLOC_NOT_NEEDED);
    }

    #[test]
    fn allocations_on_missing_node_are_lost_and_replaced() {
        let job = Arc::new(job("web", 2));
        let mut tainted = BTreeMap::new();
        tainted.insert("node-1".to_string(), None);
        let results = reconcile(&job, running(&job, 2), &tainted);

        assert_eq!(results.stop.len(), 1);
        assert_eq!(results.stop[0].client_status, Some(ClientStatus::Lost));
        assert_eq!(results.stop[0].description, ALLOC_LOST);
        assert_eq!(results.place.len(), 1);
        assert!(results.place[0].lost);
        assert_eq!(results.place[0].name, "web.web[1]");
    }

    #[test]
    fn stopped_job_stops_everything() {
        let job = Arc::new(job("web", 2));
        let existing = running(&job, 2);
        let mut stopped = (*job).clone();
        stopped.stop = true;
        let stopped = Arc::new(stopped);
        let tainted = BTreeMap::new();
        let results = reconcile(&stopped, existing, &tainted);

        assert_eq!(results.stop.len(), 2);
        assert!(results.stop.iter().all(|s| s.description == ALLOC_JOB_STOPPED));
        assert!(results.place.is_empty());
    }

    #[test]
    fn rolling_update_respects_max_parallel() {
        let mut v0 = job("web", 3);
        v0.task_groups[0].update = Some(UpdateStrategy::default());
        let v0 = Arc::new(v0);
        let existing = running(&v0, 3);

        let mut v1 = (*v0).clone();
        v1.version = 1;
        v1.job_modify_index += 1;
        v1.task_groups[0].tasks[0]
            .config
            .insert("image".to_string(), "v1".to_string());
        let v1 = Arc::new(v1);
        let tainted = BTreeMap::new();
        let results = reconcile(&v1, existing, &tainted);

        assert_eq!(results.destructive_update.len(), 1);
        let desired = &results.desired_tg_updates["web"];
        assert_eq!(desired.destructive_update, 1);
        assert_eq!(desired.ignore, 2);
        let deployment = results.deployment.expect("Update creates a deployment");
        assert_eq!(deployment.job_version, 1);
        assert_eq!(deployment.task_groups["web"].desired_total, 3);
    }

    #[test]
    fn followup_must_be_in_future() {
        let job = crate::model::test_fixtures::job("web", 1);
        let now = Utc::now();
        assert!(matches!(
            create_followup_evaluation(&job, 50, now, now),
            Err(OrchError::FollowupNotInFuture)
        ));
        let eval =
            create_followup_evaluation(&job, 50, now + chrono::Duration::seconds(30), now).unwrap();
        assert_eq!(eval.triggered_by, TriggerReason::RetryFailedAlloc);
        assert_eq!(eval.status_description, RESCHEDULING_FOLLOWUP_EVAL_DESC);
    }

    #[test]
    fn desired_updates_display() {
        let d = DesiredUpdates {
            place: 2,
            stop: 1,
            ..Default::default()
        };
        assert_eq!(
            d.to_string(),
            "(place 2) (inplace 0) (destructive 0) (stop 1) (migrate 0) (ignore 0) (canary 0)"
        );
    }
}
