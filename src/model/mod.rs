pub mod alloc;
pub mod deployment;
pub mod eval;
pub mod job;
pub mod node;
pub mod plan;

pub use alloc::{
    alloc_name, AllocDeploymentStatus, AllocMetric, Allocation, ClientStatus, DesiredStatus,
    RescheduleEvent, RescheduleTracker,
};
pub use deployment::{Deployment, DeploymentState, DeploymentStatus, DeploymentStatusUpdate};
pub use eval::{EvalStatus, Evaluation, TriggerReason};
pub use job::{
    Affinity, Constraint, ConstraintOperand, DelayFunction, Job, JobStatus, Multiregion,
    MultiregionRegion, MultiregionStrategy, ReschedulePolicy, SchedulerAlgorithm, Task, TaskGroup,
    UpdateStrategy,
};
pub use node::{DriverInfo, Node, NodeStatus, Resources};
pub use plan::{Plan, PlanResult};

use uuid::Uuid;

pub const SHORT_ID_LENGTH: usize = 8;

pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// First eight characters of an identifier, for display.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LENGTH) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_truncates() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }
}
