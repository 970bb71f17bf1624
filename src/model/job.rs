use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OrchError, Result};
use crate::model::node::Resources;

pub const DEFAULT_PRIORITY: u32 = 50;
pub const MIN_PRIORITY: u32 = 1;
pub const MAX_PRIORITY: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Dead,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Dead => write!(f, "dead"),
        }
    }
}

/// Node scoring mode chosen per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerAlgorithm {
    #[default]
    Binpack,
    Spread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DelayFunction {
    Constant,
    #[default]
    Exponential,
    Fibonacci,
}

impl std::fmt::Display for DelayFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DelayFunction::Constant => write!(f, "constant"),
            DelayFunction::Exponential => write!(f, "exponential"),
            DelayFunction::Fibonacci => write!(f, "fibonacci"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReschedulePolicy {
    /// Attempts allowed within `interval_ms`. Ignored when `unlimited`.
    pub attempts: u32,
    pub interval_ms: u64,
    pub delay_ms: u64,
    pub delay_function: DelayFunction,
    /// Ceiling for growing delay functions. Zero means no ceiling.
    pub max_delay_ms: u64,
    pub unlimited: bool,
}

impl Default for ReschedulePolicy {
    fn default() -> Self {
        Self {
            attempts: 0,
            interval_ms: 0,
            delay_ms: 30_000,
            delay_function: DelayFunction::Exponential,
            max_delay_ms: 3_600_000,
            unlimited: true,
        }
    }
}

impl ReschedulePolicy {
    pub fn disabled() -> Self {
        Self {
            attempts: 0,
            unlimited: false,
            ..Default::default()
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn enabled(&self) -> bool {
        self.unlimited || self.attempts > 0
    }

    fn validate(&self, errors: &mut Vec<String>, group: &str) {
        if !self.unlimited && self.attempts > 0 && self.interval_ms == 0 {
            errors.push(format!(
                "group {group}: reschedule interval must be set when attempts are limited"
            ));
        }
        if self.delay_function != DelayFunction::Constant
            && self.max_delay_ms > 0
            && self.max_delay_ms < self.delay_ms
        {
            errors.push(format!(
                "group {group}: reschedule max_delay_ms ({}) is below delay_ms ({})",
                self.max_delay_ms, self.delay_ms
            ));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateStrategy {
    pub max_parallel: u32,
    pub canary: u32,
    pub auto_promote: bool,
    pub min_healthy_time_ms: u64,
    pub healthy_deadline_ms: u64,
    /// Fraction of a deployment's placed allocations that may turn unhealthy
    /// before the deployment fails. Zero fails on the first unhealthy one.
    pub failure_threshold: f64,
}

impl Default for UpdateStrategy {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            canary: 0,
            auto_promote: false,
            min_healthy_time_ms: 10_000,
            healthy_deadline_ms: 300_000,
            failure_threshold: 0.0,
        }
    }
}

impl UpdateStrategy {
    pub fn min_healthy_time(&self) -> Duration {
        Duration::from_millis(self.min_healthy_time_ms)
    }

    pub fn healthy_deadline(&self) -> Duration {
        Duration::from_millis(self.healthy_deadline_ms)
    }

    /// A zero max_parallel strategy means rolling updates are unmanaged.
    pub fn is_empty(&self) -> bool {
        self.max_parallel == 0
    }

    fn validate(&self, errors: &mut Vec<String>, group: &str) {
        if self.canary > 0 && self.max_parallel == 0 {
            errors.push(format!(
                "group {group}: canary deployments require max_parallel > 0"
            ));
        }
        if self.auto_promote && self.canary == 0 {
            errors.push(format!("group {group}: auto_promote requires canary > 0"));
        }
        if self.max_parallel > 0 && self.min_healthy_time_ms >= self.healthy_deadline_ms {
            errors.push(format!(
                "group {group}: min_healthy_time_ms must be below healthy_deadline_ms"
            ));
        }
        if !(0.0..=1.0).contains(&self.failure_threshold) {
            errors.push(format!(
                "group {group}: failure_threshold must be within [0, 1]"
            ));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintOperand {
    Equal,
    NotEqual,
    IsSet,
    IsNotSet,
    /// At most one allocation of the job per node.
    DistinctHosts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    #[serde(default)]
    pub attribute: String,
    pub operand: ConstraintOperand,
    #[serde(default)]
    pub value: String,
}

impl Constraint {
    pub fn equal(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            operand: ConstraintOperand::Equal,
            value: value.into(),
        }
    }

    pub fn distinct_hosts() -> Self {
        Self {
            attribute: String::new(),
            operand: ConstraintOperand::DistinctHosts,
            value: String::new(),
        }
    }

    /// Constraints on `unique.*` attributes cannot be decided per node class.
    pub fn escapes_class(&self) -> bool {
        self.attribute.starts_with("unique.")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affinity {
    pub attribute: String,
    pub value: String,
    /// -100..=100, negative weights repel.
    pub weight: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub name: String,
    pub count: u32,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub affinities: Vec<Affinity>,
    #[serde(default)]
    pub update: Option<UpdateStrategy>,
    #[serde(default)]
    pub reschedule_policy: Option<ReschedulePolicy>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl TaskGroup {
    /// Total resources asked for by one allocation of this group.
    pub fn combined_resources(&self) -> Resources {
        self.tasks
            .iter()
            .fold(Resources::default(), |acc, t| acc.add(&t.resources))
    }

    pub fn reschedule_policy(&self) -> ReschedulePolicy {
        self.reschedule_policy.clone().unwrap_or_default()
    }

    /// Whether moving an allocation from `self` to `other` requires a restart.
    /// Metadata-only changes can be applied in place.
    pub fn tasks_updated(&self, other: &TaskGroup) -> bool {
        if self.tasks.len() != other.tasks.len()
            || self.constraints != other.constraints
            || self.affinities != other.affinities
        {
            return true;
        }
        self.tasks.iter().zip(other.tasks.iter()).any(|(a, b)| {
            a.name != b.name
                || a.driver != b.driver
                || a.config != b.config
                || a.resources != b.resources
        })
    }

    pub fn drivers(&self) -> HashSet<&str> {
        self.tasks.iter().map(|t| t.driver.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiregionStrategy {
    #[serde(default)]
    pub max_parallel: u32,
    /// "fail_all" or "fail_local".
    #[serde(default)]
    pub on_failure: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiregionRegion {
    pub name: String,
    #[serde(default)]
    pub count: Option<u32>,
    #[serde(default)]
    pub datacenters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Multiregion {
    #[serde(default)]
    pub strategy: Option<MultiregionStrategy>,
    pub regions: Vec<MultiregionRegion>,
}

impl Multiregion {
    pub fn region_names(&self) -> Vec<String> {
        self.regions.iter().map(|r| r.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub datacenters: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: u32,
    pub task_groups: Vec<TaskGroup>,
    /// Job-wide update strategy, inherited by groups without their own.
    #[serde(default)]
    pub update: Option<UpdateStrategy>,
    #[serde(default)]
    pub multiregion: Option<Multiregion>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub affinities: Vec<Affinity>,
    #[serde(default)]
    pub scheduler_algorithm: SchedulerAlgorithm,
    #[serde(default)]
    pub stop: bool,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub submit_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
    #[serde(default)]
    pub job_modify_index: u64,
}

fn default_priority() -> u32 {
    DEFAULT_PRIORITY
}

impl Job {
    pub fn new(id: impl Into<String>, task_groups: Vec<TaskGroup>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            region: String::new(),
            datacenters: Vec::new(),
            priority: DEFAULT_PRIORITY,
            task_groups,
            update: None,
            multiregion: None,
            constraints: Vec::new(),
            affinities: Vec::new(),
            scheduler_algorithm: SchedulerAlgorithm::Binpack,
            stop: false,
            status: JobStatus::Pending,
            version: 0,
            submit_time: None,
            create_index: 0,
            modify_index: 0,
            job_modify_index: 0,
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn lookup_task_group(&self, name: &str) -> Option<&TaskGroup> {
        self.task_groups.iter().find(|tg| tg.name == name)
    }

    pub fn is_multiregion(&self) -> bool {
        self.multiregion
            .as_ref()
            .map(|m| !m.regions.is_empty())
            .unwrap_or(false)
    }

    /// Fill defaults, push the job update strategy down into groups and apply
    /// the multiregion entry for `region`.
    pub fn canonicalize(&mut self, region: &str, datacenter: &str) {
        if self.name.is_empty() {
            self.name = self.id.clone();
        }
        if self.region.is_empty() {
            self.region = region.to_string();
        }
        if let Some(entry) = self
            .multiregion
            .as_ref()
            .and_then(|m| m.regions.iter().find(|r| r.name == self.region))
            .cloned()
        {
            if !entry.datacenters.is_empty() {
                self.datacenters = entry.datacenters.clone();
            }
            if let Some(count) = entry.count {
                for tg in &mut self.task_groups {
                    tg.count = count;
                }
            }
        }
        if self.datacenters.is_empty() {
            self.datacenters = vec![datacenter.to_string()];
        }
        if let Some(update) = &self.update {
            for tg in &mut self.task_groups {
                if tg.update.is_none() {
                    tg.update = Some(update.clone());
                }
            }
        }
    }

    /// Synchronous validation run by job registration.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.id.is_empty() {
            errors.push("job id is required".to_string());
        } else if self.id.contains(char::is_whitespace) {
            errors.push("job id must not contain whitespace".to_string());
        }
        if self.datacenters.is_empty() {
            errors.push("at least one datacenter is required".to_string());
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            errors.push(format!(
                "priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}"
            ));
        }
        if self.task_groups.is_empty() {
            errors.push("at least one task group is required".to_string());
        }

        let mut group_names = HashSet::new();
        for tg in &self.task_groups {
            if tg.name.is_empty() {
                errors.push("task group name is required".to_string());
                continue;
            }
            if !group_names.insert(tg.name.as_str()) {
                errors.push(format!("duplicate task group {}", tg.name));
            }
            if tg.tasks.is_empty() {
                errors.push(format!("group {}: at least one task is required", tg.name));
            }
            let mut task_names = HashSet::new();
            for task in &tg.tasks {
                if !task_names.insert(task.name.as_str()) {
                    errors.push(format!("group {}: duplicate task {}", tg.name, task.name));
                }
                if task.driver.is_empty() {
                    errors.push(format!("task {}: driver is required", task.name));
                }
                if task.resources.cpu == 0 || task.resources.memory_mb == 0 {
                    errors.push(format!(
                        "task {}: cpu and memory_mb must be positive",
                        task.name
                    ));
                }
            }
            if let Some(update) = &tg.update {
                update.validate(&mut errors, &tg.name);
            }
            if let Some(policy) = &tg.reschedule_policy {
                policy.validate(&mut errors, &tg.name);
            }
            validate_placement_rules(&tg.constraints, &tg.affinities, &mut errors);
        }
        validate_placement_rules(&self.constraints, &self.affinities, &mut errors);

        if let Some(multiregion) = &self.multiregion {
            let mut seen = HashSet::new();
            for r in &multiregion.regions {
                if !seen.insert(r.name.as_str()) {
                    errors.push(format!("multiregion: duplicate region {}", r.name));
                }
            }
            if !multiregion.regions.is_empty() && !seen.contains(self.region.as_str()) {
                errors.push(format!(
                    "multiregion: job region {} is not among the declared regions",
                    self.region
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(OrchError::Validation(errors))
        }
    }

    /// True when the user-submitted parts of the jobs differ.
    pub fn spec_changed(&self, other: &Job) -> bool {
        self.name != other.name
            || self.region != other.region
            || self.datacenters != other.datacenters
            || self.priority != other.priority
            || self.task_groups != other.task_groups
            || self.update != other.update
            || self.multiregion != other.multiregion
            || self.constraints != other.constraints
            || self.affinities != other.affinities
            || self.scheduler_algorithm != other.scheduler_algorithm
            || self.stop != other.stop
    }
}

fn validate_placement_rules(
    constraints: &[Constraint],
    affinities: &[Affinity],
    errors: &mut Vec<String>,
) {
    for c in constraints {
        if c.operand != ConstraintOperand::DistinctHosts && c.attribute.is_empty() {
            errors.push(format!("{:?} constraint requires an attribute", c.operand));
        }
    }
    for a in affinities {
        if a.weight == 0 || !(-100..=100).contains(&a.weight) {
            errors.push(format!(
                "affinity on {} must have a non-zero weight within [-100, 100]",
                a.attribute
            ));
        }
    }
}
