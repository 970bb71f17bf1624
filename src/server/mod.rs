pub mod heartbeat;
pub mod leader;
pub mod types;
pub mod worker;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::ApiClient;
use crate::broker::{BlockedEvals, EvalBroker, EvalRouter};
use crate::config::ServerConfig;
use crate::deployment::{self, DeploymentWatcher};
use crate::error::{OrchError, Result};
use crate::model::{
    Allocation, ClientStatus, DesiredStatus, EvalStatus, Evaluation, Job, Node, NodeStatus,
    TriggerReason,
};
use crate::multiregion::{
    HttpRegionClient, LocalRegion, MultiregionCoordinator, RegionActionResult, RegionClient,
    RegionDeploymentStatus,
};
use crate::plan::{ApplyRequest, DeploymentWrite, PlanApplier, PlanQueue};
use crate::scheduler::reconcile::create_followup_evaluation;
use crate::state::{AllocClientUpdate, StateSnapshot, StateStore};

pub use heartbeat::HeartbeatTracker;
pub use types::{
    AllocListStub, DeregisterResponse, FutureReschedule, JobListStub, JobStatusReport,
    RegisterResponse, ServerStatus, TaskGroupSummary,
};
pub use worker::Worker;

const PLAN_QUEUE_CAPACITY: usize = 256;

/// One region's server: state store, evaluation queues, scheduler workers,
/// plan applier, deployment watcher and the multiregion coordinator.
pub struct Server {
    config: ServerConfig,
    store: Arc<StateStore>,
    router: EvalRouter,
    plan_queue: PlanQueue,
    heartbeats: Arc<HeartbeatTracker>,
    coordinator: Arc<MultiregionCoordinator>,
    leader: AtomicBool,
}

impl Server {
    /// Build a server whose peer regions are reached over HTTP.
    pub fn new(config: ServerConfig) -> Result<(Arc<Self>, mpsc::Receiver<ApplyRequest>)> {
        let mut regions: BTreeMap<String, Arc<dyn RegionClient>> = BTreeMap::new();
        for peer in &config.peers {
            let base_url = if peer.addr.contains("://") {
                peer.addr.clone()
            } else {
                format!("http://{}", peer.addr)
            };
            let api = ApiClient::new(base_url, config.blocking_query_timeout())?;
            regions.insert(
                peer.region.clone(),
                Arc::new(HttpRegionClient::new(peer.region.clone(), api)),
            );
        }
        Ok(Self::with_regions(config, regions))
    }

    /// Build a server with explicit clients for its peer regions. The
    /// server's own region is always served locally.
    pub fn with_regions(
        config: ServerConfig,
        mut regions: BTreeMap<String, Arc<dyn RegionClient>>,
    ) -> (Arc<Self>, mpsc::Receiver<ApplyRequest>) {
        let store = Arc::new(StateStore::new());
        let broker = Arc::new(EvalBroker::new(config.broker.clone()));
        let blocked = Arc::new(BlockedEvals::new(broker.clone()));
        let router = EvalRouter::new(broker, blocked);
        let (plan_queue, plan_rx) = PlanQueue::new(PLAN_QUEUE_CAPACITY);

        regions.insert(
            config.region.clone(),
            Arc::new(LocalRegion::new(store.clone(), plan_queue.clone())),
        );
        let server = Self {
            heartbeats: Arc::new(HeartbeatTracker::new(config.node_heartbeat_ttl())),
            coordinator: Arc::new(MultiregionCoordinator::new(regions)),
            leader: AtomicBool::new(false),
            config,
            store,
            router,
            plan_queue,
        };
        (Arc::new(server), plan_rx)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn region(&self) -> &str {
        &self.config.region
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn router(&self) -> &EvalRouter {
        &self.router
    }

    pub fn plan_queue(&self) -> &PlanQueue {
        &self.plan_queue
    }

    pub fn coordinator(&self) -> &Arc<MultiregionCoordinator> {
        &self.coordinator
    }

    /// Client for this server's own region, for wiring peers in process.
    pub fn region_client(&self) -> Arc<dyn RegionClient> {
        Arc::new(LocalRegion::new(self.store.clone(), self.plan_queue.clone()))
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn require_leader(&self) -> Result<()> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(OrchError::NotLeader)
        }
    }

    /// Start every background loop: the plan applier, scheduler workers,
    /// the deployment watcher, the multiregion coordinator and the leader's
    /// reaper. Leadership is established before anything is spawned.
    pub async fn start(
        self: &Arc<Self>,
        plan_rx: mpsc::Receiver<ApplyRequest>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        self.establish_leadership().await;

        let mut handles = Vec::new();

        let applier = PlanApplier::new(self.store.clone(), self.router.clone());
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move { applier.run(plan_rx, token).await }));

        for id in 0..self.config.num_schedulers {
            let worker = Worker::new(
                id,
                &self.config,
                self.store.clone(),
                self.router.clone(),
                self.plan_queue.clone(),
            );
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move { worker.run(token).await }));
        }

        let watcher = DeploymentWatcher::new(
            self.store.clone(),
            self.plan_queue.clone(),
            self.config.deployment_watch_interval(),
        );
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move { watcher.run(token).await }));

        let coordinator = self.coordinator.clone();
        let store = self.store.clone();
        let interval = self.config.multiregion_poll_interval();
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            coordinator.run(store, interval, token).await
        }));

        let server = self.clone();
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move { server.reap_loop(token).await }));

        tracing::info!(
            region = %self.config.region,
            datacenter = %self.config.datacenter,
            schedulers = self.config.num_schedulers,
            "Server started"
        );
        handles
    }

    /// Start the background loops and serve the HTTP API until shutdown.
    pub async fn run(
        self: Arc<Self>,
        plan_rx: mpsc::Receiver<ApplyRequest>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let handles = self.start(plan_rx, shutdown.clone()).await;
        match self.config.http_addr {
            Some(addr) => crate::api::serve(addr, self.clone(), shutdown.clone()).await?,
            None => shutdown.cancelled().await,
        }
        self.revoke_leadership().await;
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "Background task ended abnormally");
            }
        }
        tracing::info!("Server stopped");
        Ok(())
    }

    // Jobs

    /// Register or update a job and create the evaluation that schedules it.
    pub async fn register_job(&self, mut job: Job) -> Result<RegisterResponse> {
        self.require_leader()?;
        job.canonicalize(&self.config.region, &self.config.datacenter);
        job.validate()?;
        if job.region != self.config.region {
            return Err(OrchError::Validation(vec![format!(
                "job region {} does not match server region {}",
                job.region, self.config.region
            )]));
        }

        let eval = Evaluation::new(job.id.clone(), job.priority, TriggerReason::JobRegister);
        let eval_id = eval.id.clone();
        let (index, job) = self.store.upsert_job(job, Some(eval.clone())).await?;
        self.router
            .route_committed(&self.store, std::slice::from_ref(&eval))
            .await;
        tracing::info!(
            job_id = %job.id,
            version = job.version,
            eval_id = %crate::model::short_id(&eval_id),
            "Job registered"
        );
        Ok(RegisterResponse {
            eval_id,
            index,
            job_modify_index: job.job_modify_index,
        })
    }

    /// Mark the job stopped and schedule the stop of its allocations.
    pub async fn deregister_job(&self, job_id: &str) -> Result<DeregisterResponse> {
        self.require_leader()?;
        let snapshot = self.store.snapshot().await;
        let job = snapshot
            .job_by_id(job_id)
            .ok_or_else(|| OrchError::JobNotFound(job_id.to_string()))?;

        let mut stopped = (*job).clone();
        stopped.stop = true;
        let eval = Evaluation::new(job.id.clone(), job.priority, TriggerReason::JobDeregister);
        let eval_id = eval.id.clone();

        let (index, _) = self.store.upsert_job(stopped, Some(eval.clone())).await?;
        self.router
            .route_committed(&self.store, std::slice::from_ref(&eval))
            .await;

        if let Some(mut blocked) = self.router.blocked().untrack(job_id).await {
            if blocked
                .set_status(EvalStatus::Canceled, "job deregistered")
                .is_ok()
            {
                self.store.upsert_evals(vec![blocked]).await?;
            }
        }
        tracing::info!(job_id = %job_id, "Job deregistered");
        Ok(DeregisterResponse { eval_id, index })
    }

    pub async fn list_jobs(&self) -> Vec<JobListStub> {
        self.store
            .snapshot()
            .await
            .jobs()
            .iter()
            .map(|j| JobListStub::from(j.as_ref()))
            .collect()
    }

    pub async fn job_versions(&self, job_id: &str) -> Result<Vec<Job>> {
        let snapshot = self.store.snapshot().await;
        let versions = snapshot.job_versions(job_id);
        if versions.is_empty() {
            return Err(OrchError::JobNotFound(job_id.to_string()));
        }
        Ok(versions.iter().rev().map(|j| (**j).clone()).collect())
    }

    /// Status of the job matching `prefix`, read once the store has reached
    /// `min_index` (or the blocking timeout passes).
    pub async fn job_status(&self, prefix: &str, min_index: u64) -> Result<JobStatusReport> {
        if min_index > 0 {
            match self
                .store
                .wait_for_index(min_index, self.config.blocking_query_timeout())
                .await
            {
                Ok(_) | Err(OrchError::IndexTimeout(_)) => {}
                Err(err) => return Err(err),
            }
        }
        let snapshot = self.store.snapshot().await;
        let job = snapshot.resolve_job(prefix)?;
        let multiregion = if job.is_multiregion() {
            Some(self.coordinator.view(&job).await)
        } else {
            None
        };
        Ok(build_status_report(&snapshot, &job, multiregion, Utc::now()))
    }

    /// Create a delayed evaluation to retry `alloc_id` at `wait_until` and
    /// link it from the allocation.
    pub(crate) async fn create_followup_evaluation(
        &self,
        alloc_id: &str,
        wait_until: DateTime<Utc>,
    ) -> Result<Evaluation> {
        self.require_leader()?;
        let snapshot = self.store.snapshot().await;
        let alloc = snapshot
            .alloc_by_id(alloc_id)
            .ok_or_else(|| OrchError::AllocNotFound(alloc_id.to_string()))?;
        let job = snapshot
            .job_by_id(&alloc.job_id)
            .ok_or_else(|| OrchError::JobNotFound(alloc.job_id.clone()))?;
        let eval = create_followup_evaluation(&job, job.priority, wait_until, Utc::now())?;
        self.plan_queue
            .attach_followup(alloc_id.to_string(), eval.clone())
            .await?;
        Ok(eval)
    }

    // Deployments

    /// Per-region deployment status of a job, optionally for one region.
    pub async fn deployment_status(
        &self,
        job_id: &str,
        region: Option<&str>,
    ) -> Result<Vec<RegionDeploymentStatus>> {
        let snapshot = self.store.snapshot().await;
        let job = snapshot
            .job_by_id(job_id)
            .ok_or_else(|| OrchError::JobNotFound(job_id.to_string()))?;

        let statuses = if job.is_multiregion() {
            self.coordinator.refresh_job(&job).await;
            self.coordinator.view(&job).await
        } else {
            let mut local = RegionDeploymentStatus::pending(&self.config.region);
            if let Some(d) = snapshot.latest_deployment_by_job(job_id) {
                local.deployment_id = Some(d.id.clone());
                local.status = Some(d.status);
                local.status_description = d.status_description.clone();
                local.updated_at = Some(d.modify_time);
            }
            vec![local]
        };

        match region {
            None => Ok(statuses),
            Some(region) => {
                let filtered: Vec<_> = statuses.into_iter().filter(|s| s.region == region).collect();
                if filtered.is_empty() {
                    return Err(OrchError::UnknownRegion(region.to_string()));
                }
                Ok(filtered)
            }
        }
    }

    async fn deployment_and_job(&self, id: &str) -> Result<(Arc<Job>, crate::model::Deployment)> {
        let snapshot = self.store.snapshot().await;
        let deployment = snapshot
            .deployment_by_id(id)
            .cloned()
            .ok_or_else(|| OrchError::DeploymentNotFound(id.to_string()))?;
        let job = snapshot
            .job_by_id(&deployment.job_id)
            .ok_or_else(|| OrchError::JobNotFound(deployment.job_id.clone()))?;
        Ok((job, deployment))
    }

    async fn write_deployment(&self, write: DeploymentWrite) -> Result<u64> {
        self.require_leader()?;
        self.plan_queue.update_deployment(write).await
    }

    pub async fn pause_deployment(&self, id: &str, pause: bool) -> Result<u64> {
        let (job, d) = self.deployment_and_job(id).await?;
        self.write_deployment(deployment::pause(&job, &d, pause)?).await
    }

    pub async fn promote_deployment(&self, id: &str, groups: Option<Vec<String>>) -> Result<u64> {
        let (job, d) = self.deployment_and_job(id).await?;
        self.write_deployment(deployment::promote(&job, &d, groups)?).await
    }

    pub async fn fail_deployment(&self, id: &str) -> Result<u64> {
        let (job, d) = self.deployment_and_job(id).await?;
        self.write_deployment(deployment::fail(&job, &d)?).await
    }

    pub async fn cancel_deployment(&self, id: &str) -> Result<u64> {
        let (_, d) = self.deployment_and_job(id).await?;
        self.write_deployment(deployment::cancel(&d)?).await
    }

    /// Latest local deployment of a job; None while the job has none.
    pub async fn job_deployment(&self, job_id: &str) -> Result<Option<crate::model::Deployment>> {
        let snapshot = self.store.snapshot().await;
        if snapshot.job_by_id(job_id).is_none() {
            return Err(OrchError::JobNotFound(job_id.to_string()));
        }
        Ok(snapshot.latest_deployment_by_job(job_id))
    }

    async fn latest_deployment_id(&self, job_id: &str) -> Result<String> {
        self.job_deployment(job_id)
            .await?
            .map(|d| d.id)
            .ok_or_else(|| OrchError::DeploymentNotFound(format!("latest deployment of {job_id}")))
    }

    pub async fn promote_job_deployment(&self, job_id: &str) -> Result<u64> {
        let id = self.latest_deployment_id(job_id).await?;
        self.promote_deployment(&id, None).await
    }

    pub async fn fail_job_deployment(&self, job_id: &str) -> Result<u64> {
        let id = self.latest_deployment_id(job_id).await?;
        self.fail_deployment(&id).await
    }

    async fn multiregion_job(&self, job_id: &str) -> Result<Arc<Job>> {
        let job = self
            .store
            .snapshot()
            .await
            .job_by_id(job_id)
            .ok_or_else(|| OrchError::JobNotFound(job_id.to_string()))?;
        if !job.is_multiregion() {
            return Err(OrchError::Validation(vec![format!(
                "job {job_id} is not a multiregion job"
            )]));
        }
        Ok(job)
    }

    /// Promote the job's deployment in every declared region.
    pub async fn multiregion_promote(&self, job_id: &str) -> Result<Vec<RegionActionResult>> {
        let job = self.multiregion_job(job_id).await?;
        Ok(self.coordinator.promote(&job).await)
    }

    /// Fail the job's deployment in every declared region.
    pub async fn multiregion_fail(&self, job_id: &str) -> Result<Vec<RegionActionResult>> {
        let job = self.multiregion_job(job_id).await?;
        Ok(self.coordinator.fail(&job).await)
    }

    pub async fn evaluation(&self, id: &str) -> Result<Evaluation> {
        self.store
            .snapshot()
            .await
            .eval_by_id(id)
            .cloned()
            .ok_or_else(|| OrchError::EvalNotFound(id.to_string()))
    }

    pub async fn allocation(&self, id: &str) -> Result<Allocation> {
        self.store
            .snapshot()
            .await
            .alloc_by_id(id)
            .cloned()
            .ok_or_else(|| OrchError::AllocNotFound(id.to_string()))
    }

    // Nodes

    /// Register or re-register a node. A node that comes back ready
    /// unblocks evaluations waiting on its class.
    pub async fn register_node(&self, node: Node) -> Result<u64> {
        self.require_leader()?;
        let previous = self.store.snapshot().await.node_by_id(&node.id).cloned();
        let node_id = node.id.clone();
        let mut index = self.store.upsert_node(node).await?;
        self.heartbeats.record(&node_id).await;

        if let Some(prev) = previous.filter(|p| p.status != NodeStatus::Ready) {
            tracing::info!(node_id = %node_id, previous = %prev.status, "Node re-registered");
            index = self.set_node_status(&node_id, NodeStatus::Ready).await?.0;
        } else {
            self.unblock_node(&node_id, index).await;
        }
        tracing::debug!(node_id = %node_id, index, "Node registered");
        Ok(index)
    }

    /// Refresh the node's heartbeat. A node that had been marked down comes
    /// back as ready.
    pub async fn node_heartbeat(&self, node_id: &str) -> Result<u64> {
        self.require_leader()?;
        let node = self
            .store
            .snapshot()
            .await
            .node_by_id(node_id)
            .cloned()
            .ok_or_else(|| OrchError::NodeNotFound(node_id.to_string()))?;
        self.heartbeats.record(node_id).await;
        if node.is_terminal() {
            tracing::info!(node_id = %node_id, "Heartbeat from down node, marking ready");
            return Ok(self.set_node_status(node_id, NodeStatus::Ready).await?.0);
        }
        Ok(self.store.latest_index())
    }

    /// Change a node's status, creating node-update evaluations for every
    /// job with allocations on it.
    pub async fn update_node_status(&self, node_id: &str, status: NodeStatus) -> Result<Vec<String>> {
        self.require_leader()?;
        let (_, eval_ids) = self.set_node_status(node_id, status).await?;
        Ok(eval_ids)
    }

    pub(crate) async fn set_node_status(
        &self,
        node_id: &str,
        status: NodeStatus,
    ) -> Result<(u64, Vec<String>)> {
        let snapshot = self.store.snapshot().await;
        if snapshot.node_by_id(node_id).is_none() {
            return Err(OrchError::NodeNotFound(node_id.to_string()));
        }
        let evals = node_evals(&snapshot, node_id, TriggerReason::NodeUpdate);
        let index = self
            .store
            .update_node_status(node_id, status, evals.clone())
            .await?;
        self.router.route_committed(&self.store, &evals).await;
        match status {
            NodeStatus::Ready => self.unblock_node(node_id, index).await,
            NodeStatus::Down | NodeStatus::Disconnected => self.heartbeats.forget(node_id).await,
            NodeStatus::Draining => {}
        }
        tracing::info!(node_id = %node_id, status = %status, evals = evals.len(), "Node status updated");
        Ok((index, evals.into_iter().map(|e| e.id).collect()))
    }

    /// Toggle drain. Draining migrates every allocation off the node.
    pub async fn update_node_drain(&self, node_id: &str, drain: bool) -> Result<Vec<String>> {
        self.require_leader()?;
        let snapshot = self.store.snapshot().await;
        if snapshot.node_by_id(node_id).is_none() {
            return Err(OrchError::NodeNotFound(node_id.to_string()));
        }
        let evals = node_evals(&snapshot, node_id, TriggerReason::NodeDrain);
        let index = self
            .store
            .update_node_drain(node_id, drain, evals.clone())
            .await?;
        self.router.route_committed(&self.store, &evals).await;
        if !drain {
            self.unblock_node(node_id, index).await;
        }
        tracing::info!(node_id = %node_id, drain, evals = evals.len(), "Node drain updated");
        Ok(evals.into_iter().map(|e| e.id).collect())
    }

    pub async fn node(&self, node_id: &str) -> Result<Node> {
        self.store
            .snapshot()
            .await
            .node_by_id(node_id)
            .cloned()
            .ok_or_else(|| OrchError::NodeNotFound(node_id.to_string()))
    }

    pub async fn list_nodes(&self) -> Vec<Node> {
        self.store.snapshot().await.nodes().cloned().collect()
    }

    pub async fn node_allocations(&self, node_id: &str) -> Result<Vec<Allocation>> {
        let snapshot = self.store.snapshot().await;
        if snapshot.node_by_id(node_id).is_none() {
            return Err(OrchError::NodeNotFound(node_id.to_string()));
        }
        Ok(snapshot.allocs_by_node(node_id))
    }

    /// Apply allocation status reported by nodes. Failed allocations get an
    /// evaluation so they can be rescheduled, and freed capacity unblocks
    /// the node's class.
    pub async fn update_allocations(&self, updates: Vec<AllocClientUpdate>) -> Result<u64> {
        self.require_leader()?;
        let snapshot = self.store.snapshot().await;
        let mut failed_jobs = BTreeSet::new();
        let mut freed_nodes = BTreeSet::new();
        for update in &updates {
            let Some(alloc) = snapshot.alloc_by_id(&update.alloc_id) else {
                continue;
            };
            if update.client_status == alloc.client_status {
                continue;
            }
            if update.client_status.is_terminal() {
                freed_nodes.insert(alloc.node_id.clone());
            }
            if update.client_status == ClientStatus::Failed && alloc.desired_status == DesiredStatus::Run {
                failed_jobs.insert(alloc.job_id.clone());
            }
        }

        let evals: Vec<Evaluation> = failed_jobs
            .iter()
            .filter_map(|job_id| snapshot.job_by_id(job_id))
            .filter(|job| !job.stop)
            .map(|job| {
                let mut eval = Evaluation::new(job.id.clone(), job.priority, TriggerReason::AllocFailure);
                eval.job_modify_index = job.job_modify_index;
                eval
            })
            .collect();

        let index = self
            .store
            .update_allocs_from_client(updates, evals.clone())
            .await?;
        self.router.route_committed(&self.store, &evals).await;
        for node_id in freed_nodes {
            self.unblock_node(&node_id, index).await;
        }
        Ok(index)
    }

    async fn unblock_node(&self, node_id: &str, index: u64) {
        let class = self
            .store
            .snapshot()
            .await
            .node_by_id(node_id)
            .filter(|n| n.ready_for_placements())
            .map(|n| n.computed_class.clone());
        if let Some(class) = class {
            self.router.blocked().unblock(&class, index).await;
        }
    }

    pub async fn status(&self) -> ServerStatus {
        ServerStatus {
            region: self.config.region.clone(),
            datacenter: self.config.datacenter.clone(),
            leader: self.is_leader(),
            index: self.store.latest_index(),
            broker: self.router.broker().stats().await,
            blocked: self.router.blocked().stats().await,
        }
    }
}

/// One evaluation per job with live allocations on `node_id`.
fn node_evals(snapshot: &StateSnapshot, node_id: &str, trigger: TriggerReason) -> Vec<Evaluation> {
    let jobs: BTreeSet<&str> = snapshot
        .non_terminal_allocs_by_node(node_id)
        .into_iter()
        .map(|a| a.job_id.as_str())
        .collect();
    jobs.into_iter()
        .filter_map(|job_id| snapshot.job_by_id(job_id))
        .map(|job| {
            let mut eval = Evaluation::new(job.id.clone(), job.priority, trigger);
            eval.job_modify_index = job.job_modify_index;
            eval.node_id = Some(node_id.to_string());
            eval
        })
        .collect()
}

/// Assemble the status view of `job` from one snapshot.
pub fn build_status_report(
    snapshot: &StateSnapshot,
    job: &Job,
    multiregion: Option<Vec<RegionDeploymentStatus>>,
    now: DateTime<Utc>,
) -> JobStatusReport {
    let mut allocs = snapshot.allocs_by_job(&job.id);
    allocs.sort_by(|a, b| b.create_index.cmp(&a.create_index).then_with(|| a.name.cmp(&b.name)));
    let evals = snapshot.evals_by_job(&job.id);

    let mut summary: BTreeMap<String, TaskGroupSummary> = job
        .task_groups
        .iter()
        .map(|tg| (tg.name.clone(), TaskGroupSummary::default()))
        .collect();
    for alloc in &allocs {
        let entry = summary.entry(alloc.task_group.clone()).or_default();
        match alloc.client_status {
            ClientStatus::Pending => entry.starting += 1,
            ClientStatus::Running => entry.running += 1,
            ClientStatus::Failed => entry.failed += 1,
            ClientStatus::Complete => entry.complete += 1,
            ClientStatus::Lost => entry.lost += 1,
        }
    }
    // Queued counts come from the newest evaluation that recorded them.
    for (group, entry) in summary.iter_mut() {
        if let Some(queued) = evals
            .iter()
            .filter(|e| e.status != EvalStatus::Canceled)
            .find_map(|e| e.queued_allocations.get(group))
        {
            entry.queued = *queued;
        }
    }

    let future_reschedules = allocs
        .iter()
        .filter(|a| a.client_status == ClientStatus::Failed)
        .filter_map(|a| {
            let eval = snapshot.eval_by_id(a.followup_eval_id.as_deref()?)?;
            let wait_until = eval.wait_until?;
            (eval.status == EvalStatus::Pending && wait_until > now).then(|| FutureReschedule {
                task_group: a.task_group.clone(),
                eval_id: eval.id.clone(),
                wait_until,
            })
        })
        .collect();

    JobStatusReport {
        job: job.clone(),
        summary,
        allocations: allocs.iter().map(AllocListStub::from).collect(),
        evaluations: evals,
        latest_deployment: snapshot.latest_deployment_by_job(&job.id),
        multiregion,
        future_reschedules,
        index: snapshot.index(),
    }
}
