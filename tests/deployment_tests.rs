//! Deployment tests: rolling updates, canaries, promotion, pausing and
//! failure handling driven by the deployment watcher.


use std::time::Duration;

use nomad_orch::error::OrchError;
use nomad_orch::model::{ClientStatus, DeploymentStatus, DesiredStatus, UpdateStrategy};
use nomad_orch::state::AllocClientUpdate;
use test_harness::{
    assert_eventually, bump, failing, rolling_job, with_reschedule_delay, TestRegion,
};

const MIN_HEALTHY_MS: u64 = 200;

/// Test 1: The initial deployment succeeds once every allocation is healthy
#[tokio::test]
async fn test_initial_deployment_succeeds() {
    let mut region = TestRegion::start("global").await;
    region.add_node("node-1").await;

    region
        .server
        .register_job(rolling_job("web", 2, MIN_HEALTHY_MS))
        .await
        .unwrap();

    assert!(
        region
            .wait_for_deployment("web", 0, DeploymentStatus::Successful, Duration::from_secs(10))
            .await,
        "Initial deployment should succeed"
    );
    let d = region.latest_deployment("web").await.unwrap();
    assert_eq!(d.task_groups["web"].desired_total, 2);
    assert_eq!(d.task_groups["web"].healthy_allocs, 2);
}

/// Test 2: A destructive update rolls out and replaces every allocation
#[tokio::test]
async fn test_rolling_update_replaces_all_allocations() {
    let mut region = TestRegion::start("global").await;
    region.add_node("node-1").await;

    let job = rolling_job("web", 3, MIN_HEALTHY_MS);
    region.server.register_job(job.clone()).await.unwrap();
    assert!(
        region
            .wait_for_deployment("web", 0, DeploymentStatus::Successful, Duration::from_secs(10))
            .await
    );

    region.server.register_job(bump(&job, "2")).await.unwrap();

    assert!(
        region
            .wait_for_deployment("web", 1, DeploymentStatus::Successful, Duration::from_secs(15))
            .await,
        "Rolling update should succeed"
    );
    assert_eq!(region.running("web", 1).await, 3);
    assert_eq!(region.running("web", 0).await, 0);
    let old_stopped = region
        .allocs("web")
        .await
        .iter()
        .filter(|a| a.job.version == 0)
        .all(|a| a.desired_status == DesiredStatus::Stop);
    assert!(old_stopped, "Every old allocation should be stopped");
}

/// Test 3: Canaries are promoted automatically once healthy
#[tokio::test]
async fn test_canary_auto_promotes() {
    let mut region = TestRegion::start("global").await;
    region.add_node("node-1").await;

    let mut job = rolling_job("web", 2, MIN_HEALTHY_MS);
    job.update = Some(UpdateStrategy {
        canary: 1,
        auto_promote: true,
        ..job.update.clone().unwrap()
    });
    region.server.register_job(job.clone()).await.unwrap();
    assert!(
        region
            .wait_for_deployment("web", 0, DeploymentStatus::Successful, Duration::from_secs(10))
            .await
    );

    region.server.register_job(bump(&job, "2")).await.unwrap();

    assert_eventually(
        || async {
            region
                .latest_deployment("web")
                .await
                .is_some_and(|d| d.job_version == 1 && d.task_groups["web"].placed_canaries.len() == 1)
        },
        Duration::from_secs(5),
        "One canary should be placed",
    )
    .await;
    assert!(
        region
            .wait_for_deployment("web", 1, DeploymentStatus::Successful, Duration::from_secs(15))
            .await,
        "Deployment should promote itself and finish"
    );
    let d = region.latest_deployment("web").await.unwrap();
    assert!(d.task_groups["web"].promoted);
    assert_eq!(region.running("web", 1).await, 2);
}

/// Test 4: Canaries wait for an operator to promote them
#[tokio::test]
async fn test_canary_requires_manual_promotion() {
    let mut region = TestRegion::start("global").await;
    region.add_node("node-1").await;

    let mut job = rolling_job("web", 2, MIN_HEALTHY_MS);
    job.update = Some(UpdateStrategy {
        canary: 1,
        ..job.update.clone().unwrap()
    });
    region.server.register_job(job.clone()).await.unwrap();
    assert!(
        region
            .wait_for_deployment("web", 0, DeploymentStatus::Successful, Duration::from_secs(10))
            .await
    );

    region.server.register_job(bump(&job, "2")).await.unwrap();

    assert_eventually(
        || async {
            region
                .latest_deployment("web")
                .await
                .is_some_and(|d| d.job_version == 1 && d.task_groups["web"].healthy_allocs == 1)
        },
        Duration::from_secs(10),
        "Canary should turn healthy",
    )
    .await;

    // Healthy canaries alone do not finish the deployment
    tokio::time::sleep(Duration::from_millis(500)).await;
    let d = region.latest_deployment("web").await.unwrap();
    assert_eq!(d.status, DeploymentStatus::Running);
    assert!(d.requires_promotion());
    assert_eq!(region.running("web", 0).await, 2, "Old allocations keep running");

    region
        .server
        .promote_job_deployment("web")
        .await
        .expect("Promotion should succeed");

    assert!(
        region
            .wait_for_deployment("web", 1, DeploymentStatus::Successful, Duration::from_secs(15))
            .await,
        "Promoted deployment should finish"
    );
    assert_eq!(region.running("web", 1).await, 2);
}

/// Test 5: A paused deployment places nothing until resumed
#[tokio::test]
async fn test_pause_and_resume() {
    let mut region = TestRegion::start("global").await;
    region.add_node("node-1").await;

    let job = rolling_job("web", 3, 500);
    region.server.register_job(job.clone()).await.unwrap();
    assert!(
        region
            .wait_for_deployment("web", 0, DeploymentStatus::Successful, Duration::from_secs(10))
            .await
    );

    region.server.register_job(bump(&job, "2")).await.unwrap();
    assert_eventually(
        || async {
            region
                .latest_deployment("web")
                .await
                .is_some_and(|d| d.job_version == 1)
        },
        Duration::from_secs(5),
        "Update should start a deployment",
    )
    .await;
    let d = region.latest_deployment("web").await.unwrap();
    region
        .server
        .pause_deployment(&d.id, true)
        .await
        .expect("Pause should succeed");

    let err = region.server.pause_deployment(&d.id, true).await.unwrap_err();
    assert!(matches!(err, OrchError::InvalidDeploymentAction { .. }), "got {err:?}");

    tokio::time::sleep(Duration::from_secs(2)).await;
    let paused = region.latest_deployment("web").await.unwrap();
    assert_eq!(paused.status, DeploymentStatus::Paused);
    let placed_v1 = region
        .allocs("web")
        .await
        .iter()
        .filter(|a| a.job.version == 1)
        .count();
    assert!(placed_v1 <= 1, "At most one batch before the pause, got {placed_v1}");

    region.server.pause_deployment(&d.id, false).await.unwrap();
    assert!(
        region
            .wait_for_deployment("web", 1, DeploymentStatus::Successful, Duration::from_secs(15))
            .await,
        "Resumed deployment should finish"
    );
    assert_eq!(region.running("web", 1).await, 3);
}

/// Test 6: Unhealthy allocations fail the deployment
#[tokio::test]
async fn test_unhealthy_allocations_fail_deployment() {
    let mut region = TestRegion::start("global").await;
    region.add_node("node-1").await;

    let job = rolling_job("web", 2, MIN_HEALTHY_MS);
    region.server.register_job(job.clone()).await.unwrap();
    assert!(
        region
            .wait_for_deployment("web", 0, DeploymentStatus::Successful, Duration::from_secs(10))
            .await
    );

    region
        .server
        .register_job(failing(bump(&job, "2")))
        .await
        .unwrap();

    assert!(
        region
            .wait_for_deployment("web", 1, DeploymentStatus::Failed, Duration::from_secs(10))
            .await,
        "Deployment should fail on the first unhealthy allocation"
    );
    let d = region.latest_deployment("web").await.unwrap();
    assert!(d.task_groups["web"].unhealthy_allocs >= 1);
    assert!(region.running("web", 0).await >= 1, "Rollout stops short of the old allocations");

    let err = region.server.fail_deployment(&d.id).await.unwrap_err();
    assert!(matches!(err, OrchError::InvalidDeploymentAction { .. }), "got {err:?}");
}

/// Test 7: An operator can fail or cancel a running deployment
#[tokio::test]
async fn test_fail_and_cancel_running_deployment() {
    let mut region = TestRegion::start("global").await;
    region.add_node("node-1").await;

    // Long health window keeps the deployment running
    let job = rolling_job("web", 1, 30_000);
    region.server.register_job(job.clone()).await.unwrap();
    assert_eventually(
        || async { region.latest_deployment("web").await.is_some() },
        Duration::from_secs(5),
        "Deployment should be created",
    )
    .await;

    region.server.fail_job_deployment("web").await.unwrap();
    let d = region.latest_deployment("web").await.unwrap();
    assert_eq!(d.status, DeploymentStatus::Failed);

    region.server.register_job(bump(&job, "2")).await.unwrap();
    assert_eventually(
        || async {
            region
                .latest_deployment("web")
                .await
                .is_some_and(|d| d.job_version == 1 && d.active())
        },
        Duration::from_secs(5),
        "Update should start a new deployment",
    )
    .await;
    let d = region.latest_deployment("web").await.unwrap();
    region.server.cancel_deployment(&d.id).await.unwrap();
    let d = region.latest_deployment("web").await.unwrap();
    assert_eq!(d.status, DeploymentStatus::Cancelled);

    let err = region.server.pause_deployment("missing", true).await.unwrap_err();
    assert!(matches!(err, OrchError::DeploymentNotFound(_)), "got {err:?}");
}

/// Test 8: A failed allocation below the failure threshold is replaced and
/// the deployment still finishes
#[tokio::test]
async fn test_unhealthy_allocation_below_threshold_is_replaced() {
    let mut region = TestRegion::start("global").await;
    region.add_node("node-1").await;

    let mut job = with_reschedule_delay(rolling_job("web", 3, 1_000), 0);
    job.update = Some(UpdateStrategy {
        failure_threshold: 0.5,
        ..job.update.clone().unwrap()
    });
    region.server.register_job(job).await.unwrap();
    assert!(
        region
            .wait_for_running("web", 0, 3, Duration::from_secs(5))
            .await
    );

    // Fail one allocation before the watcher judges it healthy
    let failed = region.allocs("web").await.remove(0);
    region
        .server
        .update_allocations(vec![AllocClientUpdate {
            alloc_id: failed.id.clone(),
            client_status: ClientStatus::Failed,
            description: "exited".to_string(),
        }])
        .await
        .unwrap();

    assert!(
        region
            .wait_for_deployment("web", 0, DeploymentStatus::Successful, Duration::from_secs(15))
            .await,
        "Deployment should finish with the replacement"
    );
    let d = region.latest_deployment("web").await.unwrap();
    assert_eq!(d.task_groups["web"].unhealthy_allocs, 1);
    assert_eq!(d.task_groups["web"].healthy_allocs, 3);

    let allocs = region.allocs("web").await;
    let replacement = allocs
        .iter()
        .find(|a| a.previous_allocation.as_deref() == Some(failed.id.as_str()))
        .expect("Failed allocation should have a replacement");
    assert_eq!(replacement.deployment_id.as_deref(), Some(d.id.as_str()));
    assert_eq!(region.running("web", 0).await, 3);
}

/// Test 9: The failure threshold is judged per batch, and earlier batches
/// survive a failed one
#[tokio::test]
async fn test_failed_batch_fails_deployment_past_threshold() {
    let mut region = TestRegion::start("global").await;
    region.add_node("node-1").await;

    let mut job = rolling_job("web", 4, MIN_HEALTHY_MS);
    job.update = Some(UpdateStrategy {
        max_parallel: 2,
        failure_threshold: 0.5,
        ..job.update.clone().unwrap()
    });
    region.server.register_job(job.clone()).await.unwrap();
    assert!(
        region
            .wait_for_deployment("web", 0, DeploymentStatus::Successful, Duration::from_secs(10))
            .await
    );

    region
        .server
        .register_job(failing(bump(&job, "2")))
        .await
        .unwrap();
    assert!(
        region
            .wait_for_deployment("web", 1, DeploymentStatus::Failed, Duration::from_secs(10))
            .await,
        "Two failures in a batch of two exceed half"
    );

    tokio::time::sleep(Duration::from_millis(500)).await;
    let d = region.latest_deployment("web").await.unwrap();
    assert_eq!(d.status, DeploymentStatus::Failed);
    assert_eq!(d.task_groups["web"].unhealthy_allocs, 2);
    assert_eq!(region.running("web", 0).await, 2, "No rollback of the old allocations");
}
