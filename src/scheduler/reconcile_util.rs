use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::model::{alloc_name, Allocation, ClientStatus, Deployment, DesiredStatus, Node};
use crate::scheduler::reschedule::next_reschedule_time;

/// Failed allocations due within this window are replaced right away.
pub const RESCHEDULE_WINDOW: Duration = Duration::from_secs(1);

/// Allocations keyed by id. Ordered so every pass over a set is deterministic.
#[derive(Debug, Clone, Default)]
pub struct AllocSet(BTreeMap<String, Allocation>);

/// A failed allocation that may be replaced once `reschedule_time` passes.
#[derive(Debug, Clone)]
pub struct DelayedReschedule {
    pub alloc: Allocation,
    pub reschedule_time: DateTime<Utc>,
}

impl FromIterator<Allocation> for AllocSet {
    fn from_iter<I: IntoIterator<Item = Allocation>>(iter: I) -> Self {
        AllocSet(iter.into_iter().map(|a| (a.id.clone(), a)).collect())
    }
}

impl AllocSet {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn insert(&mut self, alloc: Allocation) {
        self.0.insert(alloc.id.clone(), alloc);
    }

    pub fn remove(&mut self, id: &str) -> Option<Allocation> {
        self.0.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Allocation> {
        self.0.get(id)
    }

    pub fn values(&self) -> impl Iterator<Item = &Allocation> {
        self.0.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn difference(&self, others: &[&AllocSet]) -> AllocSet {
        self.values()
            .filter(|a| !others.iter().any(|o| o.contains(&a.id)))
            .cloned()
            .collect()
    }

    pub fn union(&self, others: &[&AllocSet]) -> AllocSet {
        let mut out = self.clone();
        for other in others {
            for a in other.values() {
                out.insert(a.clone());
            }
        }
        out
    }

    pub fn from_keys<'a>(&self, ids: impl IntoIterator<Item = &'a String>) -> AllocSet {
        ids.into_iter()
            .filter_map(|id| self.get(id).cloned())
            .collect()
    }

    pub fn name_set(&self) -> BTreeSet<String> {
        self.values().map(|a| a.name.clone()).collect()
    }

    /// Allocations ordered by slot index, then id.
    pub fn name_order(&self) -> Vec<Allocation> {
        let mut out: Vec<_> = self.values().cloned().collect();
        out.sort_by(|a, b| a.index().cmp(&b.index()).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Split into allocations that can stay, those on draining nodes that
    /// must migrate, and those on down or missing nodes that are lost.
    /// `tainted` maps node ids to the node, or None for nodes that no longer
    /// exist.
    pub fn filter_by_tainted(
        &self,
        tainted: &BTreeMap<String, Option<Node>>,
    ) -> (AllocSet, AllocSet, AllocSet) {
        let mut untainted = AllocSet::default();
        let mut migrate = AllocSet::default();
        let mut lost = AllocSet::default();
        for alloc in self.values() {
            if alloc.terminal_status() {
                untainted.insert(alloc.clone());
                continue;
            }
            match tainted.get(&alloc.node_id) {
                None => untainted.insert(alloc.clone()),
                Some(None) => lost.insert(alloc.clone()),
                Some(Some(node)) if node.is_terminal() => lost.insert(alloc.clone()),
                Some(Some(node)) if node.is_tainted() => migrate.insert(alloc.clone()),
                Some(Some(_)) => untainted.insert(alloc.clone()),
            }
        }
        (untainted, migrate, lost)
    }

    /// Split out failed allocations that should be replaced now or later.
    /// Stopped, complete and lost allocations are dropped; allocations that
    /// were already replaced are dropped too.
    pub fn filter_by_rescheduleable(
        &self,
        now: DateTime<Utc>,
        eval_id: &str,
        deployment: Option<&Deployment>,
    ) -> (AllocSet, AllocSet, Vec<DelayedReschedule>) {
        let mut untainted = AllocSet::default();
        let mut reschedule_now = AllocSet::default();
        let mut reschedule_later = Vec::new();

        for alloc in self.values() {
            if alloc.next_allocation.is_some() {
                continue;
            }
            if matches!(alloc.desired_status, DesiredStatus::Stop | DesiredStatus::Evict)
                || matches!(alloc.client_status, ClientStatus::Complete | ClientStatus::Lost)
            {
                continue;
            }
            if alloc.client_status != ClientStatus::Failed {
                untainted.insert(alloc.clone());
                continue;
            }

            let (now_ok, later_ok, at) = reschedule_eligibility(alloc, now, eval_id, deployment);
            if now_ok {
                reschedule_now.insert(alloc.clone());
            } else {
                untainted.insert(alloc.clone());
                if later_ok {
                    reschedule_later.push(DelayedReschedule {
                        alloc: alloc.clone(),
                        reschedule_time: at,
                    });
                }
            }
        }
        (untainted, reschedule_now, reschedule_later)
    }

    pub fn filter_by_deployment(&self, deployment_id: &str) -> (AllocSet, AllocSet) {
        let mut matched = AllocSet::default();
        let mut other = AllocSet::default();
        for alloc in self.values() {
            if alloc.deployment_id.as_deref() == Some(deployment_id) {
                matched.insert(alloc.clone());
            } else {
                other.insert(alloc.clone());
            }
        }
        (matched, other)
    }

    pub fn filter_non_terminal(&self) -> AllocSet {
        self.values()
            .filter(|a| !a.terminal_status())
            .cloned()
            .collect()
    }
}

/// (replace now, replace later, when). Allocations of an active deployment
/// are only replaced once the deployment has judged them unhealthy.
fn reschedule_eligibility(
    alloc: &Allocation,
    now: DateTime<Utc>,
    eval_id: &str,
    deployment: Option<&Deployment>,
) -> (bool, bool, DateTime<Utc>) {
    if let Some(d) = deployment {
        if alloc.deployment_id.as_deref() == Some(d.id.as_str())
            && d.active()
            && !alloc.is_unhealthy()
        {
            return (false, false, now);
        }
    }
    let Some(policy) = alloc.tg().map(|tg| tg.reschedule_policy()) else {
        return (false, false, now);
    };
    let Some((at, eligible)) = next_reschedule_time(alloc, &policy) else {
        return (false, false, now);
    };
    if !eligible {
        return (false, false, at);
    }
    let window = chrono::Duration::milliseconds(RESCHEDULE_WINDOW.as_millis() as i64);
    if alloc.followup_eval_id.as_deref() == Some(eval_id) || at - now <= window {
        return (true, false, at);
    }
    (false, alloc.followup_eval_id.is_none(), at)
}

/// Tracks which slot indexes of a group are taken.
#[derive(Debug, Clone)]
pub struct AllocNameIndex {
    job_id: String,
    group: String,
    count: u32,
    used: BTreeSet<u32>,
}

impl AllocNameIndex {
    pub fn new(job_id: &str, group: &str, count: u32, taken: &AllocSet) -> Self {
        Self {
            job_id: job_id.to_string(),
            group: group.to_string(),
            count,
            used: taken.values().map(Allocation::index).collect(),
        }
    }

    fn name(&self, index: u32) -> String {
        alloc_name(&self.job_id, &self.group, index)
    }

    pub fn unset_index(&mut self, index: u32) {
        self.used.remove(&index);
    }

    /// Names of the `n` highest taken indexes, which are released.
    pub fn highest(&mut self, n: usize) -> BTreeSet<String> {
        let picked: Vec<u32> = self.used.iter().rev().take(n).copied().collect();
        picked
            .into_iter()
            .map(|idx| {
                self.used.remove(&idx);
                self.name(idx)
            })
            .collect()
    }

    /// Next `n` free names below the count; reuses low indexes when full.
    pub fn next(&mut self, n: usize) -> Vec<String> {
        let mut out = Vec::with_capacity(n);
        for idx in 0..self.count {
            if out.len() == n {
                return out;
            }
            if self.used.insert(idx) {
                out.push(self.name(idx));
            }
        }
        let mut idx = 0;
        while out.len() < n {
            self.used.insert(idx);
            out.push(self.name(idx));
            idx += 1;
        }
        out
    }

    /// Canary names: slots being destructively updated first, then free
    /// slots, then any slot not already held by a canary.
    pub fn next_canaries(
        &mut self,
        n: usize,
        existing: &AllocSet,
        destructive: &AllocSet,
    ) -> Vec<String> {
        let mut out = Vec::with_capacity(n);
        let existing_names = existing.name_set();

        let destructive_idx: BTreeSet<u32> = destructive
            .values()
            .map(Allocation::index)
            .filter(|idx| *idx < self.count)
            .collect();
        for idx in destructive_idx {
            if out.len() == n {
                return out;
            }
            let name = self.name(idx);
            if !existing_names.contains(&name) && !out.contains(&name) {
                self.used.insert(idx);
                out.push(name);
            }
        }

        for idx in 0..self.count {
            if out.len() == n {
                return out;
            }
            if self.used.contains(&idx) {
                continue;
            }
            let name = self.name(idx);
            if !existing_names.contains(&name) {
                self.used.insert(idx);
                out.push(name);
            }
        }

        let mut idx = 0;
        while out.len() < n && idx < self.count.max(n as u32) * 2 {
            let name = self.name(idx);
            if !existing_names.contains(&name) && !out.contains(&name) {
                self.used.insert(idx);
                out.push(name);
            }
            idx += 1;
        }
        out
    }
}
