//! Tests for the command line job status rendering over live reports.


use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use nomad_orch::model::{short_id, Multiregion, MultiregionRegion};
use nomad_orch::multiregion::RegionClient;
use nomad_orch::status::{
    format_ambiguous, format_job_list, format_job_status, StatusOptions, NO_JOBS,
};
use test_harness::{
    assert_eventually, failing, rolling_job, service_job, test_config, with_reschedule_delay,
    TestRegion,
};

#[tokio::test]
async fn test_short_status_is_header_only() {
    let mut region = TestRegion::start("global").await;
    region.add_node("node-1").await;
    region.server.register_job(service_job("web", 1)).await.unwrap();
    assert!(
        region
            .wait_for_running("web", 0, 1, Duration::from_secs(5))
            .await
    );

    let report = region.server.job_status("web", 0).await.unwrap();
    let opts = StatusOptions {
        short: true,
        ..Default::default()
    };
    let out = format_job_status(&report, &opts, Utc::now());
    assert!(out.starts_with("ID"));
    assert!(out.contains("Status"));
    assert!(out.contains("running"));
    assert!(!out.contains("Allocations"));
    assert!(!out.contains(&report.allocations[0].eval_id));
}

#[tokio::test]
async fn test_verbose_status_shows_full_ids() {
    let mut region = TestRegion::start("global").await;
    region.add_node("node-1").await;
    region.server.register_job(service_job("web", 1)).await.unwrap();
    assert!(
        region
            .wait_for_running("web", 0, 1, Duration::from_secs(5))
            .await
    );

    let report = region.server.job_status("web", 0).await.unwrap();
    let alloc = &report.allocations[0];

    let out = format_job_status(&report, &StatusOptions::default(), Utc::now());
    assert!(out.contains("Summary"));
    assert!(out.contains(short_id(&alloc.id)));
    assert!(!out.contains(&alloc.id), "Default output shortens ids");
    assert!(!out.contains("Evaluations"));
    assert!(!out.contains("Node Name"));

    let opts = StatusOptions {
        verbose: true,
        ..Default::default()
    };
    let out = format_job_status(&report, &opts, Utc::now());
    assert!(out.contains(&alloc.id));
    assert!(out.contains(&alloc.eval_id));
    assert!(out.contains("Node Name"));
    assert!(out.contains("node-1"));
    assert!(out.contains("Evaluations"));
}

#[tokio::test]
async fn test_empty_allocations_message() {
    let region = TestRegion::start("global").await;
    region.server.register_job(service_job("web", 1)).await.unwrap();

    let report = region.server.job_status("web", 0).await.unwrap();
    let out = format_job_status(&report, &StatusOptions::default(), Utc::now());
    assert!(out.contains("No allocations placed"));
}

#[tokio::test]
async fn test_future_rescheduling_attempts() {
    let mut region = TestRegion::start("global").await;
    region.add_node("node-1").await;
    let job = with_reschedule_delay(failing(service_job("crash", 1)), 60_000);
    region.server.register_job(job).await.unwrap();

    assert_eventually(
        || async {
            region
                .server
                .job_status("crash", 0)
                .await
                .is_ok_and(|r| !r.future_reschedules.is_empty())
        },
        Duration::from_secs(5),
        "A follow-up evaluation should be pending",
    )
    .await;

    let report = region.server.job_status("crash", 0).await.unwrap();
    let out = format_job_status(&report, &StatusOptions::default(), Utc::now());
    assert!(out.contains("Future Rescheduling Attempts"));
    assert!(out.contains(short_id(&report.future_reschedules[0].eval_id)));
    assert!(out.contains("from now"));
}

#[tokio::test]
async fn test_multiregion_pending_regions() {
    let west = TestRegion::start("west").await;
    let mut peers: BTreeMap<String, Arc<dyn RegionClient>> = BTreeMap::new();
    peers.insert("west".to_string(), west.server.region_client());
    let mut east = TestRegion::start_with(test_config("east"), peers).await;
    east.add_node("east-1").await;

    let mut job = rolling_job("web", 1, 30_000);
    job.multiregion = Some(Multiregion {
        strategy: None,
        regions: ["east", "west"]
            .iter()
            .map(|name| MultiregionRegion {
                name: name.to_string(),
                count: None,
                datacenters: Vec::new(),
            })
            .collect(),
    });
    east.server.register_job(job).await.unwrap();
    assert_eventually(
        || async {
            east.server
                .deployment_status("web", None)
                .await
                .is_ok_and(|s| s[0].status.is_some())
        },
        Duration::from_secs(5),
        "East should report its deployment",
    )
    .await;

    let report = east.server.job_status("web", 0).await.unwrap();
    let out = format_job_status(&report, &StatusOptions::default(), Utc::now());
    assert!(out.contains("Multiregion Deployment"));
    let west_line = out
        .lines()
        .find(|l| l.starts_with("west"))
        .expect("West should have a row");
    assert!(west_line.contains("pending"));
    assert!(!out.contains("<none>"));
}

#[test]
fn test_job_list_and_ambiguous_output() {
    assert_eq!(format_job_list(&[]), NO_JOBS);

    let out = format_ambiguous("web", &["web-a".to_string(), "web-b".to_string()]);
    assert!(out.starts_with("Prefix \"web\" matched multiple jobs"));
    assert!(out.contains("web-a"));
    assert!(out.contains("web-b"));
}
