pub mod watcher;

pub use watcher::DeploymentWatcher;

use crate::error::{OrchError, Result};
use crate::model::deployment::{
    DESC_CANCELLED_BY_USER, DESC_FAILED_BY_USER, DESC_PAUSED,
};
use crate::model::{Deployment, DeploymentStatus, DeploymentStatusUpdate, Evaluation, Job, TriggerReason};
use crate::plan::DeploymentWrite;

/// Evaluation that lets the scheduler act on a deployment change.
pub fn deployment_eval(job: &Job, deployment: &Deployment) -> Evaluation {
    let mut eval = Evaluation::new(job.id.clone(), job.priority, TriggerReason::DeploymentWatcher);
    eval.deployment_id = Some(deployment.id.clone());
    eval.job_modify_index = job.job_modify_index;
    eval
}

fn require_active(deployment: &Deployment, action: &str) -> Result<()> {
    if deployment.active() {
        return Ok(());
    }
    Err(OrchError::InvalidDeploymentAction {
        id: deployment.id.clone(),
        action: action.to_string(),
        reason: format!("deployment is {}", deployment.status),
    })
}

fn status_write(
    deployment: &Deployment,
    status: DeploymentStatus,
    description: &str,
    eval: Option<Evaluation>,
) -> DeploymentWrite {
    DeploymentWrite::Status {
        update: DeploymentStatusUpdate {
            deployment_id: deployment.id.clone(),
            status,
            status_description: description.to_string(),
        },
        eval,
    }
}

/// Pause or resume. Resuming creates an evaluation so the rollout continues.
pub fn pause(job: &Job, deployment: &Deployment, paused: bool) -> Result<DeploymentWrite> {
    require_active(deployment, if paused { "pause" } else { "resume" })?;
    if paused {
        if deployment.status == DeploymentStatus::Paused {
            return Err(OrchError::InvalidDeploymentAction {
                id: deployment.id.clone(),
                action: "pause".to_string(),
                reason: "deployment is already paused".to_string(),
            });
        }
        return Ok(status_write(deployment, DeploymentStatus::Paused, DESC_PAUSED, None));
    }
    Ok(status_write(
        deployment,
        DeploymentStatus::Running,
        deployment.running_description(),
        Some(deployment_eval(job, deployment)),
    ))
}

pub fn promote(job: &Job, deployment: &Deployment, groups: Option<Vec<String>>) -> Result<DeploymentWrite> {
    require_active(deployment, "promote")?;
    Ok(DeploymentWrite::Promotion {
        deployment_id: deployment.id.clone(),
        groups,
        eval: Some(deployment_eval(job, deployment)),
    })
}

/// Operator-initiated failure. No rollback is attempted.
pub fn fail(job: &Job, deployment: &Deployment) -> Result<DeploymentWrite> {
    require_active(deployment, "fail")?;
    Ok(status_write(
        deployment,
        DeploymentStatus::Failed,
        DESC_FAILED_BY_USER,
        Some(deployment_eval(job, deployment)),
    ))
}

/// Cancel without a follow-up evaluation; nothing else is rolled out.
pub fn cancel(deployment: &Deployment) -> Result<DeploymentWrite> {
    require_active(deployment, "cancel")?;
    Ok(status_write(
        deployment,
        DeploymentStatus::Cancelled,
        DESC_CANCELLED_BY_USER,
        None,
    ))
}
