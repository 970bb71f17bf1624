pub mod blocked;
pub mod eval_broker;

use std::sync::Arc;

pub use blocked::{BlockedEvals, BlockedStats};
pub use eval_broker::{BrokerStats, EvalBroker};

use crate::model::Evaluation;
use crate::state::StateStore;

/// Hands freshly written evaluations to whichever queue owns their status:
/// pending ones to the broker, blocked ones to the blocked tracker.
#[derive(Clone)]
pub struct EvalRouter {
    broker: Arc<EvalBroker>,
    blocked: Arc<BlockedEvals>,
}

impl EvalRouter {
    pub fn new(broker: Arc<EvalBroker>, blocked: Arc<BlockedEvals>) -> Self {
        Self { broker, blocked }
    }

    pub fn broker(&self) -> &Arc<EvalBroker> {
        &self.broker
    }

    pub fn blocked(&self) -> &Arc<BlockedEvals> {
        &self.blocked
    }

    pub async fn route(&self, evals: &[Evaluation]) {
        for eval in evals {
            if eval.should_enqueue() {
                self.broker.enqueue(eval.clone()).await;
            } else if eval.should_block() {
                self.blocked.block(eval.clone()).await;
            }
        }
    }

    /// Route `evals` as the store recorded them, indexes included.
    pub async fn route_committed(&self, store: &StateStore, evals: &[Evaluation]) {
        if evals.is_empty() {
            return;
        }
        let snapshot = store.snapshot().await;
        let committed: Vec<Evaluation> = evals
            .iter()
            .map(|e| snapshot.eval_by_id(&e.id).cloned().unwrap_or_else(|| e.clone()))
            .collect();
        self.route(&committed).await;
    }

    pub async fn set_enabled(&self, enabled: bool) {
        self.broker.set_enabled(enabled).await;
        self.blocked.set_enabled(enabled).await;
    }
}
