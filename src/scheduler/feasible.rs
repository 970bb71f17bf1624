use std::collections::{BTreeMap, BTreeSet};

use crate::model::{Allocation, Constraint, ConstraintOperand, Job, Node, TaskGroup};

/// Ordered feasibility stages. Each either passes a node or names why not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeasibilityStage {
    /// Node status, eligibility and drain.
    Readiness,
    Datacenter,
    Drivers,
    JobConstraints,
    GroupConstraints,
    /// At most one allocation per node where `distinct_hosts` is set.
    DistinctHosts,
}

pub const STAGES: [FeasibilityStage; 6] = [
    FeasibilityStage::Readiness,
    FeasibilityStage::Datacenter,
    FeasibilityStage::Drivers,
    FeasibilityStage::JobConstraints,
    FeasibilityStage::GroupConstraints,
    FeasibilityStage::DistinctHosts,
];

impl FeasibilityStage {
    /// Whether the verdict for one node holds for every node of its computed
    /// class. Stages that depend on node state or placements are not.
    pub fn class_scoped(&self) -> bool {
        matches!(
            self,
            FeasibilityStage::Datacenter
                | FeasibilityStage::Drivers
                | FeasibilityStage::JobConstraints
                | FeasibilityStage::GroupConstraints
        )
    }

    /// Job-level stages are shared by every group of the job.
    pub fn job_scoped(&self) -> bool {
        matches!(
            self,
            FeasibilityStage::Datacenter | FeasibilityStage::JobConstraints
        )
    }

    pub fn check(
        &self,
        job: &Job,
        tg: &TaskGroup,
        node: &Node,
        proposed: &[Allocation],
    ) -> Result<(), String> {
        match self {
            FeasibilityStage::Readiness => {
                if node.ready_for_placements() {
                    Ok(())
                } else {
                    Err(format!("node {}", node.status))
                }
            }
            FeasibilityStage::Datacenter => {
                if job.datacenters.iter().any(|dc| dc == &node.datacenter) {
                    Ok(())
                } else {
                    Err("datacenter".to_string())
                }
            }
            FeasibilityStage::Drivers => {
                for driver in tg.drivers() {
                    match node.drivers.get(driver) {
                        Some(info) if info.detected && info.healthy => {}
                        _ => return Err(format!("missing drivers: {driver}")),
                    }
                }
                Ok(())
            }
            FeasibilityStage::JobConstraints => check_constraints(&job.constraints, node),
            FeasibilityStage::GroupConstraints => check_constraints(&tg.constraints, node),
            FeasibilityStage::DistinctHosts => {
                let job_level = job
                    .constraints
                    .iter()
                    .any(|c| c.operand == ConstraintOperand::DistinctHosts);
                let group_level = tg
                    .constraints
                    .iter()
                    .any(|c| c.operand == ConstraintOperand::DistinctHosts);
                if !job_level && !group_level {
                    return Ok(());
                }
                let collision = proposed.iter().any(|a| {
                    a.job_id == job.id && (job_level || a.task_group == tg.name)
                });
                if collision {
                    Err("distinct_hosts".to_string())
                } else {
                    Ok(())
                }
            }
        }
    }
}

fn check_constraints(constraints: &[Constraint], node: &Node) -> Result<(), String> {
    for c in constraints {
        if !constraint_met(c, node) {
            return Err(format!("{} {:?} {}", c.attribute, c.operand, c.value));
        }
    }
    Ok(())
}

pub fn constraint_met(c: &Constraint, node: &Node) -> bool {
    let lhs = node.resolve_target(&c.attribute);
    match c.operand {
        ConstraintOperand::Equal => lhs.as_deref() == Some(c.value.as_str()),
        ConstraintOperand::NotEqual => lhs.as_deref() != Some(c.value.as_str()),
        ConstraintOperand::IsSet => lhs.is_some(),
        ConstraintOperand::IsNotSet => lhs.is_none(),
        ConstraintOperand::DistinctHosts => true,
    }
}

/// Class-level verdicts collected while selecting nodes for an evaluation.
/// Blocked evaluations use them to decide which capacity changes matter.
#[derive(Debug, Clone, Default)]
pub struct EvalEligibility {
    job: BTreeMap<String, bool>,
    groups: BTreeMap<String, BTreeMap<String, bool>>,
    job_escaped: bool,
    groups_escaped: BTreeSet<String>,
}

impl EvalEligibility {
    pub fn new(job: &Job) -> Self {
        let mut out = Self {
            job_escaped: job.constraints.iter().any(Constraint::escapes_class),
            ..Default::default()
        };
        for tg in &job.task_groups {
            if tg.constraints.iter().any(Constraint::escapes_class) {
                out.groups_escaped.insert(tg.name.clone());
            }
        }
        out
    }

    pub fn job_status(&self, class: &str) -> Option<bool> {
        self.job.get(class).copied()
    }

    pub fn group_status(&self, group: &str, class: &str) -> Option<bool> {
        self.groups.get(group).and_then(|m| m.get(class)).copied()
    }

    pub fn set_job(&mut self, class: &str, eligible: bool) {
        if !self.job_escaped {
            self.job.insert(class.to_string(), eligible);
        }
    }

    pub fn set_group(&mut self, group: &str, class: &str, eligible: bool) {
        if !self.groups_escaped.contains(group) {
            self.groups
                .entry(group.to_string())
                .or_default()
                .insert(class.to_string(), eligible);
        }
    }

    pub fn job_escaped(&self) -> bool {
        self.job_escaped
    }

    pub fn group_escaped(&self, group: &str) -> bool {
        self.groups_escaped.contains(group)
    }

    pub fn has_escaped(&self) -> bool {
        self.job_escaped || !self.groups_escaped.is_empty()
    }

    /// Merged verdict per class: the job must accept it and at least one
    /// group must accept it.
    pub fn classes(&self) -> BTreeMap<String, bool> {
        let mut out: BTreeMap<String, bool> = BTreeMap::new();
        for group in self.groups.values() {
            for (class, ok) in group {
                let entry = out.entry(class.clone()).or_insert(false);
                *entry = *entry || *ok;
            }
        }
        for (class, ok) in &self.job {
            if !ok {
                out.insert(class.clone(), false);
            } else {
                out.entry(class.clone()).or_insert(true);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeStatus, Resources};

    fn node() -> Node {
        Node::new("n1", "dc1", Resources::new(1000, 1024))
            .with_driver("mock_driver")
            .with_attribute("kernel.name", "linux")
    }

    #[test]
    fn stages_reject_with_reason() {
        let mut job = crate::model::test_fixtures::job("web", 1);
        let tg = job.task_groups[0].clone();
        let n = node();
        for stage in STAGES {
            assert!(stage.check(&job, &tg, &n, &[]).is_ok(), "{stage:?}");
        }

        job.datacenters = vec!["dc2".to_string()];
        assert_eq!(
            FeasibilityStage::Datacenter.check(&job, &tg, &n, &[]),
            Err("datacenter".to_string())
        );

        let bare = Node::new("n2", "dc1", Resources::new(1000, 1024));
        assert!(FeasibilityStage::Drivers
            .check(&job, &tg, &bare, &[])
            .unwrap_err()
            .contains("mock_driver"));

        let mut down = node();
        down.status = NodeStatus::Down;
        assert!(FeasibilityStage::Readiness.check(&job, &tg, &down, &[]).is_err());
    }

    #[test]
    fn constraint_operands() {
        let n = node();
        assert!(constraint_met(&Constraint::equal("attr.kernel.name", "linux"), &n));
        assert!(!constraint_met(&Constraint::equal("attr.kernel.name", "darwin"), &n));
        let not_equal = Constraint {
            attribute: "attr.kernel.name".into(),
            operand: ConstraintOperand::NotEqual,
            value: "darwin".into(),
        };
        assert!(constraint_met(&not_equal, &n));
        let is_set = Constraint {
            attribute: "meta.rack".into(),
            operand: ConstraintOperand::IsSet,
            value: String::new(),
        };
        assert!(!constraint_met(&is_set, &n));
    }

    #[test]
    fn distinct_hosts_sees_proposed() {
        let mut job = crate::model::test_fixtures::job("web", 2);
        job.constraints.push(Constraint::distinct_hosts());
        let tg = job.task_groups[0].clone();
        let n = node();
        let existing = Allocation::new(
            "e1",
            std::sync::Arc::new(job.clone()),
            &tg,
            "web.web[0]",
            "n1",
            "n1",
        );
        assert!(FeasibilityStage::DistinctHosts
            .check(&job, &tg, &n, &[existing])
            .is_err());
    }

    #[test]
    fn eligibility_merges_job_and_groups() {
        let job = crate::model::test_fixtures::job("web", 1);
        let mut elig = EvalEligibility::new(&job);
        elig.set_job("a", true);
        elig.set_job("b", false);
        elig.set_group("web", "a", true);
        elig.set_group("web", "b", true);
        elig.set_group("web", "c", false);
        let classes = elig.classes();
        assert!(classes["a"]);
        assert!(!classes["b"]);
        assert!(!classes["c"]);
        assert!(!elig.has_escaped());
    }

    #[test]
    fn unique_constraints_escape() {
        let mut job = crate::model::test_fixtures::job("web", 1);
        job.task_groups[0]
            .constraints
            .push(Constraint::equal("unique.node.id", "n1"));
        let mut elig = EvalEligibility::new(&job);
        elig.set_group("web", "a", false);
        assert!(elig.group_escaped("web"));
        assert!(elig.has_escaped());
        assert!(elig.classes().is_empty());
    }
}
