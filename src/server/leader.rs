use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::{EvalStatus, Evaluation, NodeStatus};
use crate::server::Server;

/// How often evaluations blocked after exhausting their plan attempts are
/// given another chance.
const FAILED_EVAL_UNBLOCK_INTERVAL: Duration = Duration::from_secs(60);

/// Follow-ups for evaluations that hit the delivery limit wait the baseline
/// plus a random share of the range.
const FAILED_FOLLOWUP_BASELINE: Duration = Duration::from_secs(60);
const FAILED_FOLLOWUP_RANGE: Duration = Duration::from_secs(300);

impl Server {
    /// Enable the evaluation queues and rebuild them from the stored
    /// evaluations.
    pub async fn establish_leadership(&self) {
        self.router.set_enabled(true).await;
        self.leader.store(true, Ordering::SeqCst);

        let snapshot = self.store.snapshot().await;
        let restore: Vec<Evaluation> = snapshot
            .evals()
            .filter(|e| e.should_enqueue() || e.should_block())
            .cloned()
            .collect();
        self.router.route(&restore).await;

        // Every live node gets a full ttl from now.
        for node in snapshot.nodes().filter(|n| !n.is_terminal()) {
            self.heartbeats.record(&node.id).await;
        }
        tracing::info!(
            restored_evals = restore.len(),
            index = snapshot.index(),
            "Leadership established"
        );
    }

    pub async fn revoke_leadership(&self) {
        self.leader.store(false, Ordering::SeqCst);
        self.router.set_enabled(false).await;
        tracing::info!("Leadership revoked");
    }

    /// Periodic leader housekeeping until shutdown.
    pub(crate) async fn reap_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut reap = tokio::time::interval(self.config.reap_interval());
        let mut unblock = tokio::time::interval_at(
            tokio::time::Instant::now() + FAILED_EVAL_UNBLOCK_INTERVAL,
            FAILED_EVAL_UNBLOCK_INTERVAL,
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = reap.tick() => {
                    if let Err(err) = self.reap_once().await {
                        tracing::warn!(error = %err, "Reap pass failed");
                    }
                }
                _ = unblock.tick() => {
                    self.router.blocked().unblock_failed().await;
                }
            }
        }
        tracing::debug!("Reaper stopped");
    }

    pub(crate) async fn reap_once(&self) -> Result<()> {
        self.reap_cancelable().await?;
        self.reap_failed().await?;
        self.reap_heartbeats().await;
        Ok(())
    }

    /// Cancel evaluations superseded in the broker or the blocked tracker.
    async fn reap_cancelable(&self) -> Result<()> {
        let mut superseded = self.router.broker().take_cancelable().await;
        superseded.extend(self.router.blocked().take_duplicates().await);
        if superseded.is_empty() {
            return Ok(());
        }
        let snapshot = self.store.snapshot().await;
        let canceled: Vec<Evaluation> = superseded
            .into_iter()
            .filter_map(|e| {
                let mut stored = snapshot.eval_by_id(&e.id).cloned().unwrap_or(e);
                if stored.terminal() {
                    return None;
                }
                stored
                    .set_status(EvalStatus::Canceled, "canceled after more recent eval was processed")
                    .ok()?;
                Some(stored)
            })
            .collect();
        if canceled.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = canceled.len(), "Canceling superseded evaluations");
        self.store.upsert_evals(canceled).await?;
        Ok(())
    }

    /// Fail evaluations that hit the delivery limit and schedule a delayed
    /// follow-up for each.
    async fn reap_failed(&self) -> Result<()> {
        let failed = self.router.broker().take_failed().await;
        if failed.is_empty() {
            return Ok(());
        }
        let limit = self.config.broker.delivery_limit;
        let snapshot = self.store.snapshot().await;
        let mut writes = Vec::new();
        let mut followups = Vec::new();
        for eval in failed {
            let mut stored = snapshot.eval_by_id(&eval.id).cloned().unwrap_or(eval);
            if stored.terminal() {
                continue;
            }
            let jitter = rand::thread_rng().gen_range(0..FAILED_FOLLOWUP_RANGE.as_millis() as i64);
            let wait = chrono::Duration::milliseconds(FAILED_FOLLOWUP_BASELINE.as_millis() as i64 + jitter);
            let followup = stored.create_failed_followup_eval(wait);
            if stored
                .set_status(
                    EvalStatus::Failed,
                    format!("evaluation reached delivery limit ({limit})"),
                )
                .is_err()
            {
                continue;
            }
            stored.next_eval = Some(followup.id.clone());
            tracing::warn!(
                eval_id = %stored.short_id(),
                job_id = %stored.job_id,
                followup = %followup.short_id(),
                "Evaluation reached delivery limit"
            );
            writes.push(stored);
            followups.push(followup);
        }
        if writes.is_empty() {
            return Ok(());
        }
        writes.extend(followups.iter().cloned());
        self.store.upsert_evals(writes).await?;
        self.router.route_committed(&self.store, &followups).await;
        Ok(())
    }

    /// Mark nodes down once their heartbeat ttl has passed.
    async fn reap_heartbeats(&self) {
        for node_id in self.heartbeats.take_expired().await {
            let live = self
                .store
                .snapshot()
                .await
                .node_by_id(&node_id)
                .is_some_and(|n| !n.is_terminal());
            if !live {
                continue;
            }
            tracing::warn!(node_id = %node_id, "Node missed its heartbeat, marking down");
            if let Err(err) = self.set_node_status(&node_id, NodeStatus::Down).await {
                tracing::warn!(node_id = %node_id, error = %err, "Failed to mark node down");
            }
        }
    }
}
