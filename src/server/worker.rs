use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::broker::EvalRouter;
use crate::config::ServerConfig;
use crate::error::{OrchError, Result};
use crate::model::{Evaluation, Plan, PlanResult};
use crate::plan::PlanQueue;
use crate::scheduler::{GenericScheduler, Planner};
use crate::state::{StateSnapshot, StateStore};

/// Scheduler worker: dequeues one evaluation at a time and runs the
/// generic scheduler on it.
pub struct Worker {
    id: usize,
    store: Arc<StateStore>,
    router: EvalRouter,
    plan_queue: PlanQueue,
    dequeue_timeout: Duration,
    snapshot_timeout: Duration,
    max_plan_attempts: u32,
}

impl Worker {
    pub fn new(
        id: usize,
        config: &ServerConfig,
        store: Arc<StateStore>,
        router: EvalRouter,
        plan_queue: PlanQueue,
    ) -> Self {
        Self {
            id,
            store,
            router,
            plan_queue,
            dequeue_timeout: config.dequeue_timeout(),
            snapshot_timeout: config.blocking_query_timeout(),
            max_plan_attempts: config.max_plan_attempts,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        tracing::debug!(worker = self.id, "Scheduler worker started");
        loop {
            let dequeued = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.router.broker().dequeue(self.dequeue_timeout) => result,
            };
            match dequeued {
                Ok((eval, token)) => self.process(eval, token).await,
                Err(OrchError::NoWorkAvailable) => {}
                Err(OrchError::BrokerDisabled) => {
                    // Not the leader right now; back off instead of spinning.
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.dequeue_timeout) => {}
                    }
                }
                Err(err) => tracing::warn!(worker = self.id, error = %err, "Dequeue failed"),
            }
        }
        tracing::debug!(worker = self.id, "Scheduler worker stopped");
    }

    async fn process(&self, eval: Evaluation, token: String) {
        let eval_id = eval.id.clone();
        tracing::debug!(
            worker = self.id,
            eval_id = %eval.short_id(),
            job_id = %eval.job_id,
            triggered_by = %eval.triggered_by,
            "Processing evaluation"
        );

        // Never schedule against state older than the evaluation itself.
        let snapshot = match self
            .store
            .snapshot_min_index(eval.modify_index, self.snapshot_timeout)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(eval_id = %eval_id, error = %err, "Snapshot not available");
                self.nack(&eval_id, &token).await;
                return;
            }
        };

        let planner = WorkerPlanner {
            store: &self.store,
            router: &self.router,
            plan_queue: &self.plan_queue,
            token: &token,
            snapshot_timeout: self.snapshot_timeout,
        };
        let scheduler = GenericScheduler::new(&planner, snapshot, eval, self.max_plan_attempts);
        match scheduler.process(&token).await {
            Ok(()) => {
                if let Err(err) = self.router.broker().ack(&eval_id, &token).await {
                    tracing::warn!(eval_id = %eval_id, error = %err, "Failed to ack evaluation");
                }
            }
            Err(err) => {
                tracing::warn!(eval_id = %eval_id, error = %err, "Scheduling failed");
                self.nack(&eval_id, &token).await;
            }
        }
    }

    async fn nack(&self, eval_id: &str, token: &str) {
        if let Err(err) = self.router.broker().nack(eval_id, token).await {
            tracing::warn!(eval_id = %eval_id, error = %err, "Failed to nack evaluation");
        }
    }
}

/// The scheduler's view of the server while it holds one delivery.
struct WorkerPlanner<'a> {
    store: &'a StateStore,
    router: &'a EvalRouter,
    plan_queue: &'a PlanQueue,
    token: &'a str,
    snapshot_timeout: Duration,
}

#[async_trait]
impl Planner for WorkerPlanner<'_> {
    async fn submit_plan(&self, plan: Plan) -> Result<(PlanResult, Option<StateSnapshot>)> {
        // Restart the lease before the plan queues behind others.
        self.router
            .broker()
            .outstanding_reset(&plan.eval_id, self.token)
            .await?;
        let result = self.plan_queue.submit(plan).await?;
        if result.refresh_index == 0 {
            return Ok((result, None));
        }
        let snapshot = self
            .store
            .snapshot_min_index(result.refresh_index, self.snapshot_timeout)
            .await?;
        Ok((result, Some(snapshot)))
    }

    async fn update_eval(&self, eval: Evaluation) -> Result<()> {
        self.store.upsert_evals(vec![eval]).await?;
        Ok(())
    }

    async fn create_eval(&self, eval: Evaluation) -> Result<()> {
        self.store.upsert_evals(vec![eval.clone()]).await?;
        self.router
            .route_committed(self.store, std::slice::from_ref(&eval))
            .await;
        Ok(())
    }

    async fn reblock_eval(&self, eval: Evaluation) -> Result<()> {
        self.store.upsert_evals(vec![eval.clone()]).await?;
        let snapshot = self.store.snapshot().await;
        let stored = snapshot.eval_by_id(&eval.id).cloned().unwrap_or(eval);
        self.router.blocked().reblock(stored, self.token).await;
        Ok(())
    }
}
