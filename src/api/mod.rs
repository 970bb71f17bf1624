pub mod client;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use client::ApiClient;

use crate::error::{OrchError, Result};
use crate::model::{Allocation, Deployment, Evaluation, Job, Node, NodeStatus};
use crate::multiregion::{RegionActionResult, RegionDeploymentStatus};
use crate::server::types::{
    DeregisterResponse, JobListStub, JobStatusReport, RegisterResponse, ServerStatus,
};
use crate::server::Server;
use crate::state::AllocClientUpdate;

#[derive(Debug, Serialize, Deserialize)]
pub struct PauseRequest {
    pub pause: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PromoteRequest {
    #[serde(default)]
    pub groups: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeStatusRequest {
    pub status: NodeStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DrainRequest {
    pub drain: bool,
}

/// Error body returned by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    /// Set when a job prefix matched more than one job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matches: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct StatusQuery {
    #[serde(default)]
    index: u64,
}

#[derive(Deserialize)]
struct RegionQuery {
    region: Option<String>,
}

pub struct ApiError(OrchError);

impl From<OrchError> for ApiError {
    fn from(err: OrchError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            OrchError::NotLeader => StatusCode::SERVICE_UNAVAILABLE,
            OrchError::Validation(_)
            | OrchError::InvalidDeploymentAction { .. }
            | OrchError::FollowupNotInFuture
            | OrchError::InvalidEvalTransition { .. } => StatusCode::BAD_REQUEST,
            OrchError::AmbiguousPrefix { .. } => StatusCode::CONFLICT,
            OrchError::JobNotFound(_)
            | OrchError::EvalNotFound(_)
            | OrchError::AllocNotFound(_)
            | OrchError::NodeNotFound(_)
            | OrchError::DeploymentNotFound(_)
            | OrchError::UnknownRegion(_) => StatusCode::NOT_FOUND,
            OrchError::RegionUnavailable { .. } => StatusCode::BAD_GATEWAY,
            OrchError::IndexTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "Request failed");
        }
        let matches = match &self.0 {
            OrchError::AmbiguousPrefix { matches, .. } => Some(matches.clone()),
            _ => None,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
            matches,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// All `/v1` routes over `server`.
pub fn router(server: Arc<Server>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/jobs", get(list_jobs).post(register_job))
        .route("/v1/job/{id}", axum::routing::delete(deregister_job))
        .route("/v1/job/{id}/status", get(job_status))
        .route("/v1/job/{id}/versions", get(job_versions))
        .route("/v1/job/{id}/deployment", get(job_deployment))
        .route("/v1/job/{id}/deployment/promote", post(promote_job_deployment))
        .route("/v1/job/{id}/deployment/fail", post(fail_job_deployment))
        .route("/v1/job/{id}/deployment/multiregion/promote", post(multiregion_promote))
        .route("/v1/job/{id}/deployment/multiregion/fail", post(multiregion_fail))
        .route("/v1/job/{id}/deployments/regions", get(deployment_status))
        .route("/v1/deployment/{id}/pause", post(pause_deployment))
        .route("/v1/deployment/{id}/promote", post(promote_deployment))
        .route("/v1/deployment/{id}/fail", post(fail_deployment))
        .route("/v1/deployment/{id}/cancel", post(cancel_deployment))
        .route("/v1/evaluation/{id}", get(evaluation))
        .route("/v1/allocation/{id}", get(allocation))
        .route("/v1/nodes", get(list_nodes).post(register_node))
        .route("/v1/node/{id}", get(node))
        .route("/v1/node/{id}/heartbeat", put(node_heartbeat))
        .route("/v1/node/{id}/status", post(update_node_status))
        .route("/v1/node/{id}/drain", post(update_node_drain))
        .route("/v1/node/{id}/allocations", get(node_allocations))
        .route("/v1/allocations/client-update", post(update_allocations))
        .route("/v1/status", get(status))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(server)
}

/// Serve the API on `addr` until `shutdown` fires.
pub async fn serve(addr: SocketAddr, server: Arc<Server>, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting HTTP API");
    axum::serve(listener, router(server))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn list_jobs(State(server): State<Arc<Server>>) -> Json<Vec<JobListStub>> {
    Json(server.list_jobs().await)
}

async fn register_job(
    State(server): State<Arc<Server>>,
    Json(job): Json<Job>,
) -> ApiResult<RegisterResponse> {
    Ok(Json(server.register_job(job).await?))
}

async fn deregister_job(
    State(server): State<Arc<Server>>,
    Path(id): Path<String>,
) -> ApiResult<DeregisterResponse> {
    Ok(Json(server.deregister_job(&id).await?))
}

async fn job_status(
    State(server): State<Arc<Server>>,
    Path(prefix): Path<String>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<JobStatusReport> {
    Ok(Json(server.job_status(&prefix, query.index).await?))
}

async fn job_versions(State(server): State<Arc<Server>>, Path(id): Path<String>) -> ApiResult<Vec<Job>> {
    Ok(Json(server.job_versions(&id).await?))
}

async fn job_deployment(
    State(server): State<Arc<Server>>,
    Path(id): Path<String>,
) -> ApiResult<Option<Deployment>> {
    Ok(Json(server.job_deployment(&id).await?))
}

async fn promote_job_deployment(State(server): State<Arc<Server>>, Path(id): Path<String>) -> ApiResult<u64> {
    Ok(Json(server.promote_job_deployment(&id).await?))
}

async fn fail_job_deployment(State(server): State<Arc<Server>>, Path(id): Path<String>) -> ApiResult<u64> {
    Ok(Json(server.fail_job_deployment(&id).await?))
}

async fn multiregion_promote(
    State(server): State<Arc<Server>>,
    Path(id): Path<String>,
) -> ApiResult<Vec<RegionActionResult>> {
    Ok(Json(server.multiregion_promote(&id).await?))
}

async fn multiregion_fail(
    State(server): State<Arc<Server>>,
    Path(id): Path<String>,
) -> ApiResult<Vec<RegionActionResult>> {
    Ok(Json(server.multiregion_fail(&id).await?))
}

async fn deployment_status(
    State(server): State<Arc<Server>>,
    Path(id): Path<String>,
    Query(query): Query<RegionQuery>,
) -> ApiResult<Vec<RegionDeploymentStatus>> {
    Ok(Json(server.deployment_status(&id, query.region.as_deref()).await?))
}

async fn pause_deployment(
    State(server): State<Arc<Server>>,
    Path(id): Path<String>,
    Json(request): Json<PauseRequest>,
) -> ApiResult<u64> {
    Ok(Json(server.pause_deployment(&id, request.pause).await?))
}

async fn promote_deployment(
    State(server): State<Arc<Server>>,
    Path(id): Path<String>,
    Json(request): Json<PromoteRequest>,
) -> ApiResult<u64> {
    Ok(Json(server.promote_deployment(&id, request.groups).await?))
}

async fn fail_deployment(State(server): State<Arc<Server>>, Path(id): Path<String>) -> ApiResult<u64> {
    Ok(Json(server.fail_deployment(&id).await?))
}

async fn cancel_deployment(State(server): State<Arc<Server>>, Path(id): Path<String>) -> ApiResult<u64> {
    Ok(Json(server.cancel_deployment(&id).await?))
}

async fn evaluation(State(server): State<Arc<Server>>, Path(id): Path<String>) -> ApiResult<Evaluation> {
    Ok(Json(server.evaluation(&id).await?))
}

async fn allocation(State(server): State<Arc<Server>>, Path(id): Path<String>) -> ApiResult<Allocation> {
    Ok(Json(server.allocation(&id).await?))
}

async fn list_nodes(State(server): State<Arc<Server>>) -> Json<Vec<Node>> {
    Json(server.list_nodes().await)
}

async fn register_node(State(server): State<Arc<Server>>, Json(node): Json<Node>) -> ApiResult<u64> {
    Ok(Json(server.register_node(node).await?))
}

async fn node(State(server): State<Arc<Server>>, Path(id): Path<String>) -> ApiResult<Node> {
    Ok(Json(server.node(&id).await?))
}

async fn node_heartbeat(State(server): State<Arc<Server>>, Path(id): Path<String>) -> ApiResult<u64> {
    Ok(Json(server.node_heartbeat(&id).await?))
}

async fn update_node_status(
    State(server): State<Arc<Server>>,
    Path(id): Path<String>,
    Json(request): Json<NodeStatusRequest>,
) -> ApiResult<Vec<String>> {
    Ok(Json(server.update_node_status(&id, request.status).await?))
}

async fn update_node_drain(
    State(server): State<Arc<Server>>,
    Path(id): Path<String>,
    Json(request): Json<DrainRequest>,
) -> ApiResult<Vec<String>> {
    Ok(Json(server.update_node_drain(&id, request.drain).await?))
}

async fn node_allocations(
    State(server): State<Arc<Server>>,
    Path(id): Path<String>,
) -> ApiResult<Vec<Allocation>> {
    Ok(Json(server.node_allocations(&id).await?))
}

async fn update_allocations(
    State(server): State<Arc<Server>>,
    Json(updates): Json<Vec<AllocClientUpdate>>,
) -> ApiResult<u64> {
    Ok(Json(server.update_allocations(updates).await?))
}

async fn status(State(server): State<Arc<Server>>) -> Json<ServerStatus> {
    Json(server.status().await)
}
