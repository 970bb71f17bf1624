use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::{Deployment, Job};
use crate::multiregion::{RegionActionResult, RegionClient, RegionDeploymentStatus};
use crate::state::StateStore;

type RegionViews = BTreeMap<String, RegionDeploymentStatus>;

/// Keeps a per-region view of every multiregion job's deployments.
///
/// Regions are queried independently; a failing region only marks its own
/// entry stale and never hides or changes another region's status.
pub struct MultiregionCoordinator {
    clients: BTreeMap<String, Arc<dyn RegionClient>>,
    views: RwLock<HashMap<String, RegionViews>>,
}

impl MultiregionCoordinator {
    pub fn new(clients: BTreeMap<String, Arc<dyn RegionClient>>) -> Self {
        Self {
            clients,
            views: RwLock::new(HashMap::new()),
        }
    }

    pub fn regions(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }

    fn declared_regions(job: &Job) -> Vec<String> {
        match &job.multiregion {
            Some(m) if !m.regions.is_empty() => m.region_names(),
            _ => vec![job.region.clone()],
        }
    }

    /// Query every declared region of `job` and fold the answers in.
    pub async fn refresh_job(&self, job: &Job) {
        let mut queries: JoinSet<(String, Result<Option<Deployment>>)> = JoinSet::new();
        let mut unknown = Vec::new();
        for region in Self::declared_regions(job) {
            match self.clients.get(&region) {
                Some(client) => {
                    let client = client.clone();
                    let job_id = job.id.clone();
                    queries.spawn(async move {
                        let result = client.latest_deployment(&job_id).await;
                        (region, result)
                    });
                }
                None => unknown.push(region),
            }
        }

        let mut answers = Vec::new();
        while let Some(joined) = queries.join_next().await {
            match joined {
                Ok(answer) => answers.push(answer),
                Err(err) => tracing::warn!(error = %err, "Region query task failed"),
            }
        }

        let mut views = self.views.write().await;
        let view = views.entry(job.id.clone()).or_default();
        for region in unknown {
            let entry = view
                .entry(region.clone())
                .or_insert_with(|| RegionDeploymentStatus::pending(&region));
            entry.last_error = Some(format!("no client for region {region}"));
        }
        for (region, result) in answers {
            let entry = view
                .entry(region.clone())
                .or_insert_with(|| RegionDeploymentStatus::pending(&region));
            match result {
                Ok(Some(d)) => {
                    if entry.status != Some(d.status) {
                        tracing::info!(
                            job_id = %job.id,
                            region = %region,
                            status = %d.status,
                            "Region deployment status changed"
                        );
                    }
                    entry.deployment_id = Some(d.id);
                    entry.status = Some(d.status);
                    entry.status_description = d.status_description;
                    entry.stale = false;
                    entry.last_error = None;
                    entry.updated_at = Some(Utc::now());
                }
                Ok(None) => {
                    entry.stale = false;
                    entry.last_error = None;
                }
                Err(err) => {
                    tracing::warn!(job_id = %job.id, region = %region, error = %err, "Region status query failed");
                    entry.stale = entry.status.is_some();
                    entry.last_error = Some(err.to_string());
                }
            }
        }
    }

    /// One entry per declared region, in declaration order. Regions never
    /// heard from are pending.
    pub async fn view(&self, job: &Job) -> Vec<RegionDeploymentStatus> {
        let views = self.views.read().await;
        let known = views.get(&job.id);
        Self::declared_regions(job)
            .into_iter()
            .map(|region| {
                known
                    .and_then(|v| v.get(&region))
                    .cloned()
                    .unwrap_or_else(|| RegionDeploymentStatus::pending(region))
            })
            .collect()
    }

    pub async fn promote(&self, job: &Job) -> Vec<RegionActionResult> {
        self.fan_out(job, Action::Promote).await
    }

    pub async fn fail(&self, job: &Job) -> Vec<RegionActionResult> {
        self.fan_out(job, Action::Fail).await
    }

    async fn fan_out(&self, job: &Job, action: Action) -> Vec<RegionActionResult> {
        let mut calls: JoinSet<RegionActionResult> = JoinSet::new();
        let mut results = Vec::new();
        for region in Self::declared_regions(job) {
            let Some(client) = self.clients.get(&region).cloned() else {
                results.push(RegionActionResult {
                    error: Some(format!("no client for region {region}")),
                    region,
                });
                continue;
            };
            let job_id = job.id.clone();
            calls.spawn(async move {
                let outcome = match action {
                    Action::Promote => client.promote(&job_id).await,
                    Action::Fail => client.fail(&job_id).await,
                };
                RegionActionResult {
                    region,
                    error: outcome.err().map(|e| e.to_string()),
                }
            });
        }
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok(result) => {
                    if let Some(err) = &result.error {
                        tracing::warn!(job_id = %job.id, region = %result.region, error = %err, ?action, "Regional action failed");
                    }
                    results.push(result);
                }
                Err(err) => tracing::warn!(error = %err, "Regional action task failed"),
            }
        }
        let order = Self::declared_regions(job);
        results.sort_by_key(|r| order.iter().position(|o| o == &r.region));
        self.refresh_job(job).await;
        results
    }

    /// Poll on a timer, and right away when a local multiregion deployment
    /// changes.
    pub async fn run(self: Arc<Self>, store: Arc<StateStore>, interval: Duration, shutdown: CancellationToken) {
        let mut index_rx = store.subscribe();
        let mut tick = tokio::time::interval(interval);
        let mut seen: HashMap<String, u64> = HashMap::new();
        loop {
            let full = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => true,
                changed = index_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    false
                }
            };

            let snapshot = store.snapshot().await;
            for job in snapshot.jobs().into_iter().filter(|j| j.is_multiregion()) {
                let local = snapshot
                    .latest_deployment_by_job(&job.id)
                    .map(|d| d.modify_index)
                    .unwrap_or(0);
                let changed = seen.insert(job.id.clone(), local) != Some(local);
                if full || changed {
                    self.refresh_job(&job).await;
                }
            }
        }
        tracing::debug!("Multiregion coordinator stopped");
    }
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Promote,
    Fail,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::OrchError;
    use crate::model::test_fixtures::job;
    use crate::model::{DeploymentStatus, Multiregion, MultiregionRegion};

    struct FakeRegion {
        deployment: Option<Deployment>,
        down: AtomicBool,
    }

    #[async_trait]
    impl RegionClient for FakeRegion {
        async fn latest_deployment(&self, _job_id: &str) -> Result<Option<Deployment>> {
            if self.down.load(Ordering::SeqCst) {
                return Err(OrchError::RegionUnavailable {
                    region: "fake".into(),
                    reason: "connection refused".into(),
                });
            }
            Ok(self.deployment.clone())
        }

        async fn promote(&self, _job_id: &str) -> Result<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(OrchError::Internal("down".into()));
            }
            Ok(())
        }

        async fn fail(&self, job_id: &str) -> Result<()> {
            self.promote(job_id).await
        }
    }

    fn two_region_job() -> Job {
        let mut j = job("web", 1);
        j.region = "east".into();
        j.multiregion = Some(Multiregion {
            strategy: None,
            regions: ["east", "west"]
                .iter()
                .map(|r| MultiregionRegion {
                    name: r.to_string(),
                    count: None,
                    datacenters: Vec::new(),
                })
                .collect(),
        });
        j
    }

    fn coordinator(east: Option<Deployment>, west: Option<Deployment>) -> (MultiregionCoordinator, Arc<FakeRegion>) {
        let east = Arc::new(FakeRegion {
            deployment: east,
            down: AtomicBool::new(false),
        });
        let west = Arc::new(FakeRegion {
            deployment: west,
            down: AtomicBool::new(false),
        });
        let mut clients: BTreeMap<String, Arc<dyn RegionClient>> = BTreeMap::new();
        clients.insert("east".into(), east);
        clients.insert("west".into(), west.clone());
        (MultiregionCoordinator::new(clients), west)
    }

    #[tokio::test]
    async fn unobserved_regions_are_pending() {
        let j = two_region_job();
        let (c, _) = coordinator(Some(Deployment::new(&j)), None);
        let before = c.view(&j).await;
        assert_eq!(before.len(), 2);
        assert!(before.iter().all(|r| r.is_pending()));

        c.refresh_job(&j).await;
        let after = c.view(&j).await;
        assert_eq!(after[0].region, "east");
        assert_eq!(after[0].status, Some(DeploymentStatus::Running));
        assert_eq!(after[1].region, "west");
        assert_eq!(after[1].display_status(), "pending");
    }

    #[tokio::test]
    async fn failed_query_keeps_last_status_as_stale() {
        let j = two_region_job();
        let mut west_dep = Deployment::new(&j);
        west_dep.status = DeploymentStatus::Failed;
        let (c, west) = coordinator(Some(Deployment::new(&j)), Some(west_dep));
        c.refresh_job(&j).await;

        west.down.store(true, Ordering::SeqCst);
        c.refresh_job(&j).await;
        let view = c.view(&j).await;
        assert_eq!(view[0].status, Some(DeploymentStatus::Running));
        assert!(!view[0].stale);
        assert_eq!(view[1].status, Some(DeploymentStatus::Failed));
        assert!(view[1].stale);
        assert!(view[1].last_error.is_some());
    }

    #[tokio::test]
    async fn fan_out_reports_each_region() {
        let j = two_region_job();
        let (c, west) = coordinator(Some(Deployment::new(&j)), None);
        west.down.store(true, Ordering::SeqCst);
        let results = c.promote(&j).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].region, "east");
        assert!(results[0].ok());
        assert_eq!(results[1].region, "west");
        assert!(!results[1].ok());
    }
}
