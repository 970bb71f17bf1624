use std::collections::BTreeSet;

use crate::model::{Affinity, Allocation, Job, Node, Resources, SchedulerAlgorithm, TaskGroup};
use crate::scheduler::feasible::constraint_met;

/// Highest raw fit score: both dimensions completely free gives 20 - 2.
const MAX_FIT_SCORE: f64 = 18.0;

/// Scoring stages applied to every feasible node, in order. Each stage may
/// contribute one score in [-1, 1]; the node's final score is their mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreStage {
    Fit,
    JobAntiAffinity,
    NodeAffinity,
    ReschedulePenalty,
}

pub const SCORE_STAGES: [ScoreStage; 4] = [
    ScoreStage::Fit,
    ScoreStage::JobAntiAffinity,
    ScoreStage::NodeAffinity,
    ScoreStage::ReschedulePenalty,
];

/// Inputs shared by the scoring stages for one candidate node.
pub struct ScoreInput<'a> {
    pub job: &'a Job,
    pub tg: &'a TaskGroup,
    pub node: &'a Node,
    /// Allocations on the node after the in-progress plan is applied.
    pub proposed: &'a [Allocation],
    /// Resources the node would be using if the placement lands.
    pub utilization: Resources,
    pub penalty_nodes: &'a BTreeSet<String>,
}

impl ScoreStage {
    pub fn name(&self) -> &'static str {
        match self {
            ScoreStage::Fit => "binpack",
            ScoreStage::JobAntiAffinity => "job-anti-affinity",
            ScoreStage::NodeAffinity => "node-affinity",
            ScoreStage::ReschedulePenalty => "node-reschedule-penalty",
        }
    }

    pub fn score(&self, input: &ScoreInput<'_>) -> Option<f64> {
        match self {
            ScoreStage::Fit => Some(fit_score(
                input.job.scheduler_algorithm,
                &input.node.allocatable(),
                &input.utilization,
            )),
            ScoreStage::JobAntiAffinity => {
                let collisions = input
                    .proposed
                    .iter()
                    .filter(|a| a.job_id == input.job.id && a.task_group == input.tg.name)
                    .count();
                if collisions == 0 || input.tg.count == 0 {
                    None
                } else {
                    Some(-((collisions + 1) as f64) / input.tg.count as f64)
                }
            }
            ScoreStage::NodeAffinity => {
                let affinities: Vec<&Affinity> = input
                    .job
                    .affinities
                    .iter()
                    .chain(input.tg.affinities.iter())
                    .collect();
                affinity_score(&affinities, input.node)
            }
            ScoreStage::ReschedulePenalty => {
                if input.penalty_nodes.contains(&input.node.id) {
                    Some(-1.0)
                } else {
                    None
                }
            }
        }
    }
}

/// Normalized fit of `used` within `capacity`.
///
/// Binpack rewards fuller nodes: `(20 - (10^free_cpu + 10^free_mem)) / 18`.
/// Spread is the mirror image, `(10^free_cpu + 10^free_mem - 2) / 18`.
pub fn fit_score(algorithm: SchedulerAlgorithm, capacity: &Resources, used: &Resources) -> f64 {
    let free = |cap: u64, used: u64| -> f64 {
        if cap == 0 {
            0.0
        } else {
            (1.0 - used as f64 / cap as f64).clamp(0.0, 1.0)
        }
    };
    let free_cpu = free(capacity.cpu, used.cpu);
    let free_mem = free(capacity.memory_mb, used.memory_mb);
    let total = 10f64.powf(free_cpu) + 10f64.powf(free_mem);
    let raw = match algorithm {
        SchedulerAlgorithm::Binpack => 20.0 - total,
        SchedulerAlgorithm::Spread => total - 2.0,
    };
    (raw / MAX_FIT_SCORE).clamp(0.0, 1.0)
}

/// Sum of matching weights over the sum of absolute weights.
fn affinity_score(affinities: &[&Affinity], node: &Node) -> Option<f64> {
    if affinities.is_empty() {
        return None;
    }
    let total: f64 = affinities.iter().map(|a| a.weight.unsigned_abs() as f64).sum();
    if total == 0.0 {
        return None;
    }
    let matched: f64 = affinities
        .iter()
        .filter(|a| {
            constraint_met(
                &crate::model::Constraint::equal(a.attribute.clone(), a.value.clone()),
                node,
            )
        })
        .map(|a| a.weight as f64)
        .sum();
    Some(matched / total)
}
