use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchError {
    #[error("Not the leader")]
    NotLeader,

    #[error("Job validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Prefix {prefix:?} matched multiple jobs: {}", .matches.join(", "))]
    AmbiguousPrefix {
        prefix: String,
        matches: Vec<String>,
    },

    #[error("Evaluation not found: {0}")]
    EvalNotFound(String),

    #[error("Allocation not found: {0}")]
    AllocNotFound(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("No evaluation became available before the timeout")]
    NoWorkAvailable,

    #[error("Evaluation broker is disabled")]
    BrokerDisabled,

    #[error("Evaluation {0} is not outstanding")]
    NotOutstanding(String),

    #[error("Delivery token does not match outstanding evaluation {0}")]
    TokenMismatch(String),

    #[error("Invalid status transition for evaluation {id}: {from} -> {to}")]
    InvalidEvalTransition { id: String, from: String, to: String },

    #[error("Follow-up evaluation must wait until a future time")]
    FollowupNotInFuture,

    #[error("Deployment {id} cannot accept {action}: {reason}")]
    InvalidDeploymentAction {
        id: String,
        action: String,
        reason: String,
    },

    #[error("Plan rejected: {0}")]
    PlanRejected(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Unknown region: {0}")]
    UnknownRegion(String),

    #[error("Region {region} unavailable: {reason}")]
    RegionUnavailable { region: String, reason: String },

    #[error("Timed out waiting for state index {0}")]
    IndexTimeout(u64),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, OrchError>;
