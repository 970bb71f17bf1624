use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::broker::EvalBroker;
use crate::model::{Evaluation, TriggerReason};

#[derive(Debug, Clone)]
struct Tracked {
    eval: Evaluation,
    /// Delivery token when the evaluation was reblocked while outstanding.
    token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockedStats {
    pub total_blocked: usize,
    pub total_escaped: usize,
}

#[derive(Default)]
struct BlockedState {
    enabled: bool,
    /// Evaluations with a usable class eligibility map.
    captured: HashMap<String, Tracked>,
    /// Evaluations whose constraints escaped class computation.
    escaped: HashMap<String, Tracked>,
    /// Job id to its single blocked evaluation id.
    jobs: HashMap<String, String>,
    /// Last index at which each computed class gained capacity.
    unblock_indexes: HashMap<String, u64>,
    duplicates: Vec<Evaluation>,
}

impl BlockedState {
    fn get(&self, id: &str) -> Option<&Tracked> {
        self.captured.get(id).or_else(|| self.escaped.get(id))
    }

    fn remove(&mut self, id: &str) -> Option<Tracked> {
        self.captured.remove(id).or_else(|| self.escaped.remove(id))
    }

    /// True if a class the evaluation could use (or never saw) gained
    /// capacity after the snapshot it was scheduled against.
    fn missed_unblock(&self, eval: &Evaluation) -> bool {
        let mut max = 0;
        for (class, &index) in &self.unblock_indexes {
            max = max.max(index);
            if eval.snapshot_index >= index {
                continue;
            }
            match eval.class_eligibility.get(class) {
                None | Some(true) => return true,
                Some(false) => {}
            }
        }
        eval.escaped_computed_class && eval.snapshot_index < max
    }
}

/// Parks evaluations that could not place everything until capacity
/// appears in a node class they can use.
pub struct BlockedEvals {
    broker: Arc<EvalBroker>,
    state: Mutex<BlockedState>,
}

impl BlockedEvals {
    pub fn new(broker: Arc<EvalBroker>) -> Self {
        Self {
            broker,
            state: Mutex::new(BlockedState::default()),
        }
    }

    pub async fn set_enabled(&self, enabled: bool) {
        let mut state = self.state.lock().await;
        *state = BlockedState {
            enabled,
            ..Default::default()
        };
    }

    pub async fn block(&self, eval: Evaluation) {
        self.process_block(eval, None).await;
    }

    /// Block an evaluation the scheduler produced while holding `token`.
    pub async fn reblock(&self, eval: Evaluation, token: &str) {
        self.process_block(eval, Some(token.to_string())).await;
    }

    async fn process_block(&self, eval: Evaluation, token: Option<String>) {
        let mut state = self.state.lock().await;
        if !state.enabled {
            return;
        }

        // One blocked evaluation per job. The newer one carries the fresher
        // class eligibility.
        if let Some(existing_id) = state.jobs.get(&eval.job_id).cloned() {
            if existing_id != eval.id {
                let existing_newer = state
                    .get(&existing_id)
                    .is_some_and(|t| t.eval.create_index > eval.create_index);
                if existing_newer {
                    state.duplicates.push(eval);
                    return;
                }
                if let Some(old) = state.remove(&existing_id) {
                    state.duplicates.push(old.eval);
                }
            } else {
                state.remove(&existing_id);
            }
        }

        if state.missed_unblock(&eval) {
            state.jobs.remove(&eval.job_id);
            drop(state);
            tracing::debug!(eval_id = %eval.short_id(), "Blocked evaluation missed an unblock");
            self.requeue(eval, token).await;
            return;
        }

        tracing::debug!(
            eval_id = %eval.short_id(),
            job_id = %eval.job_id,
            escaped = eval.escaped_computed_class,
            "Blocking evaluation"
        );
        state.jobs.insert(eval.job_id.clone(), eval.id.clone());
        let id = eval.id.clone();
        let tracked = Tracked { eval, token };
        if tracked.eval.escaped_computed_class {
            state.escaped.insert(id, tracked);
        } else {
            state.captured.insert(id, tracked);
        }
    }

    async fn requeue(&self, eval: Evaluation, token: Option<String>) {
        match token {
            Some(token) => self.broker.enqueue_with_token(eval, &token).await,
            None => self.broker.enqueue(eval).await,
        }
    }

    /// Capacity changed in `class` at `index`. Every escaped evaluation is
    /// released, plus every captured one that did not rule the class out.
    pub async fn unblock(&self, class: &str, index: u64) {
        let released = {
            let mut state = self.state.lock().await;
            if !state.enabled {
                return;
            }
            let entry = state.unblock_indexes.entry(class.to_string()).or_default();
            *entry = (*entry).max(index);

            let mut released: Vec<Tracked> = Vec::new();
            if !class.is_empty() {
                released.extend(state.escaped.drain().map(|(_, t)| t));
            }
            let ids: Vec<String> = state
                .captured
                .iter()
                .filter(|(_, t)| t.eval.class_eligibility.get(class) != Some(&false))
                .map(|(id, _)| id.clone())
                .collect();
            for id in ids {
                if let Some(t) = state.captured.remove(&id) {
                    released.push(t);
                }
            }
            for t in &released {
                state.jobs.remove(&t.eval.job_id);
            }
            released
        };

        if !released.is_empty() {
            tracing::info!(class, index, count = released.len(), "Unblocking evaluations");
        }
        for t in released {
            self.requeue(t.eval, t.token).await;
        }
    }

    /// Release evaluations that were blocked because their plan attempts
    /// ran out. Called periodically by the leader.
    pub async fn unblock_failed(&self) {
        let released = {
            let mut state = self.state.lock().await;
            let ids: Vec<String> = state
                .captured
                .iter()
                .chain(state.escaped.iter())
                .filter(|(_, t)| t.eval.triggered_by == TriggerReason::MaxPlanAttempts)
                .map(|(id, _)| id.clone())
                .collect();
            let mut released = Vec::new();
            for id in ids {
                if let Some(t) = state.remove(&id) {
                    state.jobs.remove(&t.eval.job_id);
                    released.push(t);
                }
            }
            released
        };
        for t in released {
            self.requeue(t.eval, t.token).await;
        }
    }

    /// Stop tracking the job's blocked evaluation, e.g. after a deregister.
    pub async fn untrack(&self, job_id: &str) -> Option<Evaluation> {
        let mut state = self.state.lock().await;
        let id = state.jobs.remove(job_id)?;
        state.remove(&id).map(|t| t.eval)
    }

    /// The job's blocked evaluation, if one is tracked.
    pub async fn blocked_for_job(&self, job_id: &str) -> Option<Evaluation> {
        let state = self.state.lock().await;
        let id = state.jobs.get(job_id)?;
        state.get(id).map(|t| t.eval.clone())
    }

    /// Evaluations superseded by a newer blocked evaluation for the same job.
    pub async fn take_duplicates(&self) -> Vec<Evaluation> {
        std::mem::take(&mut self.state.lock().await.duplicates)
    }

    pub async fn stats(&self) -> BlockedStats {
        let state = self.state.lock().await;
        BlockedStats {
            total_blocked: state.captured.len(),
            total_escaped: state.escaped.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::BrokerConfig;
    use crate::model::EvalStatus;

    async fn setup() -> (Arc<EvalBroker>, BlockedEvals) {
        let broker = Arc::new(EvalBroker::new(BrokerConfig::default()));
        broker.set_enabled(true).await;
        let blocked = BlockedEvals::new(broker.clone());
        blocked.set_enabled(true).await;
        (broker, blocked)
    }

    fn blocked_eval(job: &str, classes: &[(&str, bool)], snapshot_index: u64) -> Evaluation {
        let mut eval = Evaluation::new(job, 50, TriggerReason::JobRegister);
        eval.status = EvalStatus::Blocked;
        eval.snapshot_index = snapshot_index;
        eval.class_eligibility = classes.iter().map(|(c, e)| (c.to_string(), *e)).collect();
        eval
    }

    #[tokio::test]
    async fn unblocks_on_eligible_class_only() {
        let (broker, blocked) = setup().await;
        blocked
            .block(blocked_eval("web", &[("v1:a", true), ("v1:b", false)], 10))
            .await;

        blocked.unblock("v1:b", 11).await;
        assert_eq!(blocked.stats().await.total_blocked, 1);

        blocked.unblock("v1:a", 12).await;
        assert_eq!(blocked.stats().await.total_blocked, 0);
        let (eval, _) = broker.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(eval.job_id, "web");
    }

    #[tokio::test]
    async fn unseen_class_unblocks() {
        let (_, blocked) = setup().await;
        blocked.block(blocked_eval("web", &[("v1:a", false)], 10)).await;
        blocked.unblock("v1:new", 11).await;
        assert_eq!(blocked.stats().await, BlockedStats::default());
    }

    #[tokio::test]
    async fn escaped_unblocks_on_any_class() {
        let (_, blocked) = setup().await;
        let mut eval = blocked_eval("web", &[("v1:a", false)], 10);
        eval.escaped_computed_class = true;
        blocked.block(eval).await;
        assert_eq!(blocked.stats().await.total_escaped, 1);
        blocked.unblock("v1:a", 11).await;
        assert_eq!(blocked.stats().await.total_escaped, 0);
    }

    #[tokio::test]
    async fn missed_unblock_requeues_immediately() {
        let (broker, blocked) = setup().await;
        blocked.unblock("v1:a", 20).await;
        blocked.block(blocked_eval("web", &[("v1:a", true)], 15)).await;
        assert_eq!(blocked.stats().await.total_blocked, 0);
        assert_eq!(broker.stats().await.total_ready, 1);
    }

    #[tokio::test]
    async fn keeps_one_per_job() {
        let (_, blocked) = setup().await;
        let mut old = blocked_eval("web", &[("v1:a", true)], 10);
        old.create_index = 5;
        let mut new = blocked_eval("web", &[("v1:a", true)], 12);
        new.create_index = 9;
        blocked.block(old.clone()).await;
        blocked.block(new.clone()).await;

        assert_eq!(blocked.stats().await.total_blocked, 1);
        assert_eq!(blocked.blocked_for_job("web").await.unwrap().id, new.id);
        let dups = blocked.take_duplicates().await;
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].id, old.id);
    }

    #[tokio::test]
    async fn untrack_forgets_job() {
        let (_, blocked) = setup().await;
        blocked.block(blocked_eval("web", &[], 10)).await;
        assert!(blocked.untrack("web").await.is_some());
        assert!(blocked.blocked_for_job("web").await.is_none());
    }
}
