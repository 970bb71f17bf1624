use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{OrchError, Result};
use crate::model::{Allocation, Deployment, Evaluation, Job, Node};

/// Point-in-time copy of the state, stamped with the index it was taken at.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    pub(crate) index: u64,
    pub(crate) jobs: BTreeMap<String, Arc<Job>>,
    pub(crate) job_versions: BTreeMap<String, Vec<Arc<Job>>>,
    pub(crate) evals: BTreeMap<String, Evaluation>,
    pub(crate) allocs: BTreeMap<String, Allocation>,
    pub(crate) deployments: BTreeMap<String, Deployment>,
    pub(crate) nodes: BTreeMap<String, Node>,
}

impl StateSnapshot {
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn job_by_id(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.get(id).cloned()
    }

    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.jobs.values().cloned().collect()
    }

    pub fn jobs_by_id_prefix(&self, prefix: &str) -> Vec<Arc<Job>> {
        self.jobs
            .range(prefix.to_string()..)
            .take_while(|(id, _)| id.starts_with(prefix))
            .map(|(_, job)| job.clone())
            .collect()
    }

    /// Exact id first, then a unique prefix. An ambiguous prefix lists
    /// every match.
    pub fn resolve_job(&self, prefix: &str) -> Result<Arc<Job>> {
        if let Some(job) = self.jobs.get(prefix) {
            return Ok(job.clone());
        }
        let matches = self.jobs_by_id_prefix(prefix);
        match matches.len() {
            0 => Err(OrchError::JobNotFound(prefix.to_string())),
            1 => Ok(matches[0].clone()),
            _ => Err(OrchError::AmbiguousPrefix {
                prefix: prefix.to_string(),
                matches: matches.iter().map(|j| j.id.clone()).collect(),
            }),
        }
    }

    /// Every registered version, oldest first.
    pub fn job_versions(&self, id: &str) -> Vec<Arc<Job>> {
        self.job_versions.get(id).cloned().unwrap_or_default()
    }

    pub fn eval_by_id(&self, id: &str) -> Option<&Evaluation> {
        self.evals.get(id)
    }

    pub fn evals(&self) -> impl Iterator<Item = &Evaluation> {
        self.evals.values()
    }

    /// Evaluations of a job, newest first.
    pub fn evals_by_job(&self, job_id: &str) -> Vec<Evaluation> {
        let mut evals: Vec<_> = self
            .evals
            .values()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect();
        evals.sort_by(|a, b| b.create_index.cmp(&a.create_index));
        evals
    }

    pub fn alloc_by_id(&self, id: &str) -> Option<&Allocation> {
        self.allocs.get(id)
    }

    pub fn allocs_by_job(&self, job_id: &str) -> Vec<Allocation> {
        self.allocs
            .values()
            .filter(|a| a.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn allocs_by_node(&self, node_id: &str) -> Vec<Allocation> {
        self.allocs
            .values()
            .filter(|a| a.node_id == node_id)
            .cloned()
            .collect()
    }

    /// Allocations still holding resources on the node.
    pub fn non_terminal_allocs_by_node(&self, node_id: &str) -> Vec<&Allocation> {
        self.allocs
            .values()
            .filter(|a| a.node_id == node_id && !a.terminal_status())
            .collect()
    }

    pub fn allocs_by_deployment(&self, deployment_id: &str) -> Vec<Allocation> {
        self.allocs
            .values()
            .filter(|a| a.deployment_id.as_deref() == Some(deployment_id))
            .cloned()
            .collect()
    }

    /// The current batch of `group` in `deployment`. Allocations the
    /// scheduler stopped before they got a verdict are left out.
    pub fn deployment_batch(&self, deployment: &Deployment, group: &str) -> Vec<&Allocation> {
        let start = deployment
            .task_groups
            .get(group)
            .map(|s| s.batch_start_index)
            .unwrap_or(0);
        self.allocs
            .values()
            .filter(|a| {
                a.deployment_id.as_deref() == Some(deployment.id.as_str())
                    && a.task_group == group
                    && a.create_index >= start
                    && !(a.deployment_healthy().is_none() && a.server_terminal() && !a.client_terminal())
            })
            .collect()
    }

    pub fn deployment_by_id(&self, id: &str) -> Option<&Deployment> {
        self.deployments.get(id)
    }

    pub fn deployments(&self) -> impl Iterator<Item = &Deployment> {
        self.deployments.values()
    }

    pub fn deployments_by_job(&self, job_id: &str) -> Vec<Deployment> {
        let mut out: Vec<_> = self
            .deployments
            .values()
            .filter(|d| d.job_id == job_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.create_index.cmp(&a.create_index));
        out
    }

    pub fn latest_deployment_by_job(&self, job_id: &str) -> Option<Deployment> {
        self.deployments
            .values()
            .filter(|d| d.job_id == job_id)
            .max_by_key(|d| d.create_index)
            .cloned()
    }

    pub fn node_by_id(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }
}
