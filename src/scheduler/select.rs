use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::model::{AllocMetric, Allocation, Job, Node, Plan, Resources, TaskGroup};
use crate::scheduler::feasible::{EvalEligibility, FeasibilityStage, STAGES};
use crate::scheduler::rank::{ScoreInput, SCORE_STAGES};
use crate::state::StateSnapshot;

/// Scores closer than this are ties.
const SCORE_EPSILON: f64 = 1e-9;

/// A node that passed every feasibility stage, with its scores.
#[derive(Debug, Clone)]
pub struct RankedNode {
    pub node: Node,
    pub final_score: f64,
    pub scores: Vec<(&'static str, f64)>,
}

#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    /// Nodes a rescheduled allocation already failed on.
    pub penalty_nodes: BTreeSet<String>,
}

impl SelectOptions {
    /// Penalize the node `prev` failed on and every node in its history.
    pub fn for_previous(prev: Option<&Allocation>) -> Self {
        let mut penalty_nodes = BTreeSet::new();
        if let Some(prev) = prev {
            if prev.client_status == crate::model::ClientStatus::Failed {
                penalty_nodes.insert(prev.node_id.clone());
            }
            if let Some(tracker) = &prev.reschedule_tracker {
                for event in &tracker.events {
                    penalty_nodes.insert(event.prev_node_id.clone());
                }
            }
        }
        Self { penalty_nodes }
    }
}

/// Allocations that would be on `node_id` once `plan` lands: the snapshot's
/// live allocations, minus the plan's stops and updates, plus its placements.
pub fn proposed_allocs(snapshot: &StateSnapshot, plan: &Plan, node_id: &str) -> Vec<Allocation> {
    let stopped: BTreeSet<&str> = plan
        .stopped_on(node_id)
        .iter()
        .map(|a| a.id.as_str())
        .collect();
    let placed = plan.placed_on(node_id);
    let replaced: BTreeSet<&str> = placed.iter().map(|a| a.id.as_str()).collect();

    let mut out: Vec<Allocation> = snapshot
        .non_terminal_allocs_by_node(node_id)
        .into_iter()
        .filter(|a| !stopped.contains(a.id.as_str()) && !replaced.contains(a.id.as_str()))
        .cloned()
        .collect();
    out.extend(
        placed
            .iter()
            .filter(|a| !stopped.contains(a.id.as_str()) && !a.terminal_status())
            .cloned(),
    );
    out
}

/// Feasibility chain plus ranking over a fixed, ordered node list.
///
/// Nodes are visited in id order and ties keep the earlier node, so the
/// choice is deterministic for a given snapshot and plan.
pub struct GenericStack {
    job: Arc<Job>,
    nodes: Vec<Node>,
    eligibility: EvalEligibility,
}

impl GenericStack {
    pub fn new(job: Arc<Job>, nodes: Vec<Node>) -> Self {
        let eligibility = EvalEligibility::new(&job);
        let mut stack = Self {
            job,
            nodes: Vec::new(),
            eligibility,
        };
        stack.set_nodes(nodes);
        stack
    }

    pub fn set_nodes(&mut self, mut nodes: Vec<Node>) {
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        self.nodes = nodes;
    }

    pub fn eligibility(&self) -> &EvalEligibility {
        &self.eligibility
    }

    /// Best node for one allocation of `tg`, or None with the metrics
    /// explaining why every node was passed over.
    pub fn select(
        &mut self,
        tg: &TaskGroup,
        snapshot: &StateSnapshot,
        plan: &Plan,
        options: &SelectOptions,
    ) -> (Option<RankedNode>, AllocMetric) {
        let mut metric = AllocMetric::default();
        let ask = tg.combined_resources();
        let job = self.job.clone();
        let mut best: Option<RankedNode> = None;

        for idx in 0..self.nodes.len() {
            let node = self.nodes[idx].clone();
            metric.nodes_evaluated += 1;
            *metric
                .nodes_available
                .entry(node.datacenter.clone())
                .or_default() += 1;

            let proposed = proposed_allocs(snapshot, plan, &node.id);
            if !self.feasible(&job, tg, &node, &proposed, &mut metric) {
                continue;
            }

            let used = proposed
                .iter()
                .fold(Resources::default(), |acc, a| acc.add(&a.resources));
            let utilization = used.add(&ask);
            if let Err(dimension) = node.allocatable().superset(&utilization) {
                metric.exhausted_node(dimension);
                continue;
            }

            let input = ScoreInput {
                job: &job,
                tg,
                node: &node,
                proposed: &proposed,
                utilization,
                penalty_nodes: &options.penalty_nodes,
            };
            let scores: Vec<(&'static str, f64)> = SCORE_STAGES
                .iter()
                .filter_map(|stage| stage.score(&input).map(|s| (stage.name(), s)))
                .collect();
            let final_score = if scores.is_empty() {
                0.0
            } else {
                scores.iter().map(|(_, s)| s).sum::<f64>() / scores.len() as f64
            };
            metric.scores.insert(node.id.clone(), final_score);

            let better = match &best {
                None => true,
                Some(b) => final_score > b.final_score + SCORE_EPSILON,
            };
            if better {
                best = Some(RankedNode {
                    node,
                    final_score,
                    scores,
                });
            }
        }
        (best, metric)
    }

    fn feasible(
        &mut self,
        job: &Job,
        tg: &TaskGroup,
        node: &Node,
        proposed: &[Allocation],
        metric: &mut AllocMetric,
    ) -> bool {
        let class = node.computed_class.clone();

        if let Err(reason) = FeasibilityStage::Readiness.check(job, tg, node, proposed) {
            metric.filter_node(&class, &reason);
            return false;
        }

        let job_ok = match self.eligibility.job_status(&class) {
            Some(ok) => {
                if !ok {
                    metric.filter_node(&class, "computed class ineligible");
                }
                ok
            }
            None => {
                let ok = run_stages(true, job, tg, node, proposed, metric);
                self.eligibility.set_job(&class, ok);
                ok
            }
        };
        if !job_ok {
            return false;
        }

        let group_ok = match self.eligibility.group_status(&tg.name, &class) {
            Some(ok) => {
                if !ok {
                    metric.filter_node(&class, "computed class ineligible");
                }
                ok
            }
            None => {
                let ok = run_stages(false, job, tg, node, proposed, metric);
                self.eligibility.set_group(&tg.name, &class, ok);
                ok
            }
        };
        if !group_ok {
            return false;
        }

        if let Err(reason) = FeasibilityStage::DistinctHosts.check(job, tg, node, proposed) {
            metric.filter_node(&class, &reason);
            return false;
        }
        true
    }
}

/// Run the class-scoped stages at job or group level. The first failure is
/// recorded against the node and stops the chain.
fn run_stages(
    job_level: bool,
    job: &Job,
    tg: &TaskGroup,
    node: &Node,
    proposed: &[Allocation],
    metric: &mut AllocMetric,
) -> bool {
    for stage in STAGES
        .iter()
        .filter(|s| s.class_scoped() && s.job_scoped() == job_level)
    {
        if let Err(reason) = stage.check(job, tg, node, proposed) {
            metric.filter_node(&node.computed_class, &reason);
            return false;
        }
    }
    true
}

/// Ready nodes in `datacenters`, and how many each datacenter has.
pub fn ready_nodes_in_dcs(
    snapshot: &StateSnapshot,
    datacenters: &[String],
) -> (Vec<Node>, BTreeMap<String, u32>) {
    let mut by_dc: BTreeMap<String, u32> = datacenters.iter().map(|dc| (dc.clone(), 0)).collect();
    let nodes: Vec<Node> = snapshot
        .nodes()
        .filter(|n| n.ready_for_placements())
        .filter(|n| datacenters.iter().any(|dc| dc == &n.datacenter))
        .cloned()
        .collect();
    for n in &nodes {
        *by_dc.entry(n.datacenter.clone()).or_default() += 1;
    }
    (nodes, by_dc)
}
