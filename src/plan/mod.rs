pub mod applier;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

pub use applier::{evaluate_plan, PlanApplier};

use crate::error::{OrchError, Result};
use crate::model::{DeploymentStatusUpdate, Evaluation, Plan, PlanResult};

/// Deployment changes that go through the plan queue so allocations and
/// deployments have a single writer.
#[derive(Debug, Clone)]
pub enum DeploymentWrite {
    Status {
        update: DeploymentStatusUpdate,
        eval: Option<Evaluation>,
    },
    Promotion {
        deployment_id: String,
        groups: Option<Vec<String>>,
        eval: Option<Evaluation>,
    },
    AllocHealth {
        deployment_id: String,
        healthy: Vec<String>,
        unhealthy: Vec<String>,
        status_update: Option<DeploymentStatusUpdate>,
        eval: Option<Evaluation>,
        timestamp: DateTime<Utc>,
    },
}

/// Message to the plan applier, answered on its oneshot channel.
#[derive(Debug)]
pub enum ApplyRequest {
    SubmitPlan {
        plan: Plan,
        response_tx: oneshot::Sender<Result<PlanResult>>,
    },
    UpdateDeployment {
        write: DeploymentWrite,
        response_tx: oneshot::Sender<Result<u64>>,
    },
    AttachFollowup {
        alloc_id: String,
        eval: Evaluation,
        response_tx: oneshot::Sender<Result<u64>>,
    },
}

/// Sending half of the leader's plan queue.
#[derive(Clone)]
pub struct PlanQueue {
    tx: mpsc::Sender<ApplyRequest>,
}

impl PlanQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ApplyRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue `plan` and wait for the applier's verdict.
    pub async fn submit(&self, plan: Plan) -> Result<PlanResult> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(ApplyRequest::SubmitPlan { plan, response_tx })
            .await
            .map_err(|_| OrchError::Internal("plan queue closed".into()))?;
        response_rx
            .await
            .map_err(|_| OrchError::Internal("plan applier dropped the request".into()))?
    }

    pub async fn update_deployment(&self, write: DeploymentWrite) -> Result<u64> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(ApplyRequest::UpdateDeployment { write, response_tx })
            .await
            .map_err(|_| OrchError::Internal("plan queue closed".into()))?;
        response_rx
            .await
            .map_err(|_| OrchError::Internal("plan applier dropped the request".into()))?
    }

    /// Record a delayed follow-up evaluation on an allocation.
    pub async fn attach_followup(&self, alloc_id: String, eval: Evaluation) -> Result<u64> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(ApplyRequest::AttachFollowup {
                alloc_id,
                eval,
                response_tx,
            })
            .await
            .map_err(|_| OrchError::Internal("plan queue closed".into()))?;
        response_rx
            .await
            .map_err(|_| OrchError::Internal("plan applier dropped the request".into()))?
    }
}
