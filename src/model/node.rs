use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// CPU in MHz, memory in MB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Resources {
    pub cpu: u64,
    pub memory_mb: u64,
}

impl Resources {
    pub fn new(cpu: u64, memory_mb: u64) -> Self {
        Self { cpu, memory_mb }
    }

    pub fn add(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu + other.cpu,
            memory_mb: self.memory_mb + other.memory_mb,
        }
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_sub(other.cpu),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
        }
    }

    /// Whether `self` can hold `ask`. Returns the exhausted dimension otherwise.
    pub fn superset(&self, ask: &Resources) -> Result<(), &'static str> {
        if ask.cpu > self.cpu {
            return Err("cpu");
        }
        if ask.memory_mb > self.memory_mb {
            return Err("memory");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Ready,
    Down,
    Draining,
    Disconnected,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Ready => write!(f, "ready"),
            NodeStatus::Down => write!(f, "down"),
            NodeStatus::Draining => write!(f, "draining"),
            NodeStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverInfo {
    pub detected: bool,
    pub healthy: bool,
}

impl DriverInfo {
    pub fn healthy() -> Self {
        Self {
            detected: true,
            healthy: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub datacenter: String,
    #[serde(default)]
    pub node_class: String,
    #[serde(default)]
    pub computed_class: String,
    pub resources: Resources,
    #[serde(default)]
    pub reserved: Resources,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub drivers: BTreeMap<String, DriverInfo>,
    #[serde(default)]
    pub status: NodeStatus,
    /// False once the operator marks the node ineligible or drains it.
    #[serde(default = "default_true")]
    pub eligible: bool,
    #[serde(default)]
    pub drain: bool,
    #[serde(default)]
    pub status_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

fn default_true() -> bool {
    true
}

impl Node {
    pub fn new(
        id: impl Into<String>,
        datacenter: impl Into<String>,
        resources: Resources,
    ) -> Self {
        let id = id.into();
        let mut node = Self {
            name: id.clone(),
            id,
            datacenter: datacenter.into(),
            node_class: String::new(),
            computed_class: String::new(),
            resources,
            reserved: Resources::default(),
            attributes: BTreeMap::new(),
            meta: BTreeMap::new(),
            drivers: BTreeMap::new(),
            status: NodeStatus::Ready,
            eligible: true,
            drain: false,
            status_updated_at: None,
            create_index: 0,
            modify_index: 0,
        };
        node.compute_class();
        node
    }

    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.drivers.insert(driver.into(), DriverInfo::healthy());
        self.compute_class();
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self.compute_class();
        self
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.node_class = class.into();
        self.compute_class();
        self
    }

    /// Capacity left for allocations once reserved resources are taken out.
    pub fn allocatable(&self) -> Resources {
        self.resources.saturating_sub(&self.reserved)
    }

    /// Ready and eligible for new placements.
    pub fn ready_for_placements(&self) -> bool {
        self.status == NodeStatus::Ready && self.eligible && !self.drain
    }

    /// Nodes whose allocations must be migrated or replaced.
    pub fn is_tainted(&self) -> bool {
        self.status != NodeStatus::Ready || self.drain
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, NodeStatus::Down | NodeStatus::Disconnected)
    }

    /// Resolve an attribute target like `node.datacenter`, `attr.kernel.name`
    /// or `meta.rack`.
    pub fn resolve_target(&self, target: &str) -> Option<String> {
        match target {
            "node.id" | "unique.node.id" => Some(self.id.clone()),
            "node.name" | "unique.node.name" => Some(self.name.clone()),
            "node.datacenter" => Some(self.datacenter.clone()),
            "node.class" => Some(self.node_class.clone()),
            _ => {
                if let Some(key) = target.strip_prefix("attr.") {
                    self.attributes.get(key).cloned()
                } else if let Some(key) = target.strip_prefix("meta.") {
                    self.meta.get(key).cloned()
                } else {
                    self.attributes.get(target).cloned()
                }
            }
        }
    }

    /// Hash the scheduling-relevant fields so nodes that are interchangeable
    /// for feasibility share a class. `unique.*` attributes are excluded.
    pub fn compute_class(&mut self) {
        let mut hasher = Sha256::new();
        hasher.update(self.datacenter.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.node_class.as_bytes());
        hasher.update([0u8]);
        for (k, v) in self.attributes.iter().filter(|(k, _)| !k.starts_with("unique.")) {
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
            hasher.update([0u8]);
        }
        for (k, v) in self.meta.iter().filter(|(k, _)| !k.starts_with("unique.")) {
            hasher.update(b"meta.");
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
            hasher.update([0u8]);
        }
        for (driver, info) in &self.drivers {
            hasher.update(driver.as_bytes());
            hasher.update([info.detected as u8, info.healthy as u8]);
        }
        let digest = hasher.finalize();
        self.computed_class = format!("v1:{}", &hex::encode(digest)[..16]);
    }
}
