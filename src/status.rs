//! Plain-text rendering of job status for the command line.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::model::{short_id, Deployment, Evaluation};
use crate::multiregion::{RegionActionResult, RegionDeploymentStatus};
use crate::server::types::{AllocListStub, JobListStub, JobStatusReport};

/// Printed by `job status` when nothing is registered.
pub const NO_JOBS: &str = "No running jobs";

#[derive(Debug, Clone, Copy, Default)]
pub struct StatusOptions {
    /// Header only.
    pub short: bool,
    /// Full identifiers, absolute times and the evaluation table.
    pub verbose: bool,
    /// Include the evaluation table.
    pub evals: bool,
}

impl StatusOptions {
    fn id<'a>(&self, id: &'a str) -> &'a str {
        if self.verbose {
            id
        } else {
            short_id(id)
        }
    }
}

/// Align `rows` into columns separated by two spaces. Trailing whitespace
/// is trimmed from every line.
pub fn columnize(rows: &[Vec<String>]) -> String {
    let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut widths = vec![0; columns];
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }
    rows.iter()
        .map(|row| {
            let mut line = String::new();
            for (i, cell) in row.iter().enumerate() {
                if i > 0 {
                    line.push_str("  ");
                }
                line.push_str(cell);
                let pad = widths[i] - cell.chars().count();
                line.extend(std::iter::repeat(' ').take(pad));
            }
            line.trim_end().to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// `key = value` lines with the `=` aligned.
pub fn format_kv(pairs: &[(&str, String)]) -> String {
    let width = pairs.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    pairs
        .iter()
        .map(|(k, v)| format!("{k:<width$} = {v}").trim_end().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Human distance between `t` and `now`, at most two units: `3m12s ago`,
/// `1h5m from now`.
pub fn pretty_time_diff(t: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = (t - now).num_seconds();
    let (secs, suffix) = if delta < 0 {
        (-delta, "ago")
    } else {
        (delta, "from now")
    };
    let units = [
        (secs / 86_400, "d"),
        ((secs % 86_400) / 3_600, "h"),
        ((secs % 3_600) / 60, "m"),
        (secs % 60, "s"),
    ];
    let parts: String = units
        .iter()
        .skip_while(|(n, _)| *n == 0)
        .take(2)
        .filter(|(n, _)| *n > 0)
        .map(|(n, unit)| format!("{n}{unit}"))
        .collect();
    let parts = if parts.is_empty() { "0s".to_string() } else { parts };
    format!("{parts} {suffix}")
}

fn display_time(t: DateTime<Utc>, now: DateTime<Utc>, opts: &StatusOptions) -> String {
    if opts.verbose {
        format_time(t)
    } else {
        pretty_time_diff(t, now)
    }
}

pub fn format_job_list(jobs: &[JobListStub]) -> String {
    if jobs.is_empty() {
        return NO_JOBS.to_string();
    }
    let mut rows = vec![vec![
        "ID".to_string(),
        "Type".to_string(),
        "Priority".to_string(),
        "Status".to_string(),
        "Submit Date".to_string(),
    ]];
    for job in jobs {
        rows.push(vec![
            job.id.clone(),
            "service".to_string(),
            job.priority.to_string(),
            job.status.to_string(),
            job.submit_time.map(format_time).unwrap_or_default(),
        ]);
    }
    columnize(&rows)
}

/// Listing printed when a prefix matches more than one job.
pub fn format_ambiguous(prefix: &str, matches: &[String]) -> String {
    let mut rows = vec![vec!["ID".to_string()]];
    rows.extend(matches.iter().map(|m| vec![m.clone()]));
    format!(
        "Prefix {prefix:?} matched multiple jobs\n\n{}",
        columnize(&rows)
    )
}

pub fn format_job_status(report: &JobStatusReport, opts: &StatusOptions, now: DateTime<Utc>) -> String {
    let job = &report.job;
    let mut out = format_kv(&[
        ("ID", job.id.clone()),
        ("Name", job.name.clone()),
        (
            "Submit Date",
            job.submit_time.map(format_time).unwrap_or_default(),
        ),
        ("Type", "service".to_string()),
        ("Priority", job.priority.to_string()),
        ("Datacenters", job.datacenters.join(",")),
        ("Region", job.region.clone()),
        ("Version", job.version.to_string()),
        ("Status", job.status.to_string()),
    ]);
    if opts.short {
        return out;
    }

    out.push_str("\n\nSummary\n");
    let mut rows = vec![["Task Group", "Queued", "Starting", "Running", "Failed", "Complete", "Lost"]
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()];
    for (group, s) in &report.summary {
        rows.push(vec![
            group.clone(),
            s.queued.to_string(),
            s.starting.to_string(),
            s.running.to_string(),
            s.failed.to_string(),
            s.complete.to_string(),
            s.lost.to_string(),
        ]);
    }
    out.push_str(&columnize(&rows));

    if !report.future_reschedules.is_empty() {
        out.push_str("\n\nFuture Rescheduling Attempts\n");
        let mut rows = vec![vec![
            "Task Group".to_string(),
            "Eval ID".to_string(),
            "Eval Time".to_string(),
        ]];
        for r in &report.future_reschedules {
            rows.push(vec![
                r.task_group.clone(),
                opts.id(&r.eval_id).to_string(),
                pretty_time_diff(r.wait_until, now),
            ]);
        }
        out.push_str(&columnize(&rows));
    }

    if let Some(d) = &report.latest_deployment {
        out.push_str("\n\nLatest Deployment\n");
        out.push_str(&format_deployment(d, opts));
    }

    if let Some(regions) = &report.multiregion {
        out.push_str("\n\nMultiregion Deployment\n");
        out.push_str(&format_region_statuses(regions, opts));
    }

    if opts.evals || opts.verbose {
        out.push_str("\n\nEvaluations\n");
        out.push_str(&format_evals(&report.evaluations, opts, now));
    }

    out.push_str("\n\nAllocations\n");
    if report.allocations.is_empty() {
        out.push_str("No allocations placed");
    } else {
        out.push_str(&format_allocs(&report.allocations, opts, now));
    }
    out
}

pub fn format_deployment(d: &Deployment, opts: &StatusOptions) -> String {
    let mut out = format_kv(&[
        ("ID", opts.id(&d.id).to_string()),
        ("Status", d.status.to_string()),
        ("Description", d.status_description.clone()),
    ]);
    if d.task_groups.is_empty() {
        return out;
    }
    let canaries = d.task_groups.values().any(|s| s.desired_canaries > 0);
    let mut header = vec!["Task Group"];
    if canaries {
        header.push("Promoted");
    }
    header.extend(["Desired", "Canaries", "Placed", "Healthy", "Unhealthy"]);
    if !canaries {
        header.retain(|h| *h != "Canaries");
    }
    let mut rows = vec![header.iter().map(|s| s.to_string()).collect::<Vec<_>>()];
    for (group, s) in &d.task_groups {
        let mut row = vec![group.clone()];
        if canaries {
            row.push(s.promoted.to_string());
        }
        row.push(s.desired_total.to_string());
        if canaries {
            row.push(s.desired_canaries.to_string());
        }
        row.extend([
            s.placed_allocs.to_string(),
            s.healthy_allocs.to_string(),
            s.unhealthy_allocs.to_string(),
        ]);
        rows.push(row);
    }
    out.push_str("\n\nDeployed\n");
    out.push_str(&columnize(&rows));
    out
}

/// One row per region. Regions that have not reported show `pending`.
pub fn format_region_statuses(regions: &[RegionDeploymentStatus], opts: &StatusOptions) -> String {
    let mut rows = vec![vec!["Region".to_string(), "ID".to_string(), "Status".to_string()]];
    for r in regions {
        rows.push(vec![
            r.region.clone(),
            r.deployment_id
                .as_deref()
                .map(|id| opts.id(id).to_string())
                .unwrap_or_else(|| "-".to_string()),
            r.display_status(),
        ]);
    }
    columnize(&rows)
}

pub fn format_region_actions(results: &[RegionActionResult]) -> String {
    let mut rows = vec![vec!["Region".to_string(), "Result".to_string()]];
    for r in results {
        rows.push(vec![
            r.region.clone(),
            match &r.error {
                None => "ok".to_string(),
                Some(err) => format!("error: {err}"),
            },
        ]);
    }
    columnize(&rows)
}

pub fn format_evals(evals: &[Evaluation], opts: &StatusOptions, now: DateTime<Utc>) -> String {
    let mut rows = vec![[
        "ID",
        "Priority",
        "Triggered By",
        "Status",
        "Placement Failures",
        "Wait Until",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect::<Vec<_>>()];
    for e in evals {
        rows.push(vec![
            opts.id(&e.id).to_string(),
            e.priority.to_string(),
            e.triggered_by.to_string(),
            e.status.to_string(),
            (!e.failed_tg_allocs.is_empty()).to_string(),
            e.wait_until
                .map(|t| display_time(t, now, opts))
                .unwrap_or_else(|| "-".to_string()),
        ]);
    }
    columnize(&rows)
}

pub fn format_allocs(allocs: &[AllocListStub], opts: &StatusOptions, now: DateTime<Utc>) -> String {
    let header: &[&str] = if opts.verbose {
        &[
            "ID", "Eval ID", "Node ID", "Node Name", "Task Group", "Version", "Desired", "Status",
            "Created", "Modified",
        ]
    } else {
        &[
            "ID", "Node ID", "Task Group", "Version", "Desired", "Status", "Created", "Modified",
        ]
    };
    let mut rows = vec![header.iter().map(|s| s.to_string()).collect::<Vec<_>>()];
    for a in allocs {
        let mut row = vec![opts.id(&a.id).to_string()];
        if opts.verbose {
            row.push(a.eval_id.clone());
        }
        row.push(opts.id(&a.node_id).to_string());
        if opts.verbose {
            row.push(a.node_name.clone());
        }
        row.extend([
            a.task_group.clone(),
            a.job_version.to_string(),
            a.desired_status.to_string(),
            a.client_status.to_string(),
            display_time(a.create_time, now, opts),
            display_time(a.modify_time, now, opts),
        ]);
        rows.push(row);
    }
    columnize(&rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_align() {
        let rows = vec![
            vec!["ID".to_string(), "Status".to_string()],
            vec!["abcdef".to_string(), "running".to_string()],
        ];
        assert_eq!(columnize(&rows), "ID      Status\nabcdef  running");
    }

    #[test]
    fn kv_aligns_equals() {
        let out = format_kv(&[("ID", "web".into()), ("Priority", "50".into())]);
        assert_eq!(out, "ID       = web\nPriority = 50");
    }

    #[test]
    fn time_diff_uses_two_units() {
        let now = Utc::now();
        assert_eq!(pretty_time_diff(now - chrono::Duration::seconds(192), now), "3m12s ago");
        assert_eq!(pretty_time_diff(now + chrono::Duration::seconds(3_900), now), "1h5m from now");
        assert_eq!(pretty_time_diff(now + chrono::Duration::seconds(3_600), now), "1h from now");
        assert_eq!(pretty_time_diff(now, now), "0s from now");
    }

    #[test]
    fn empty_job_list() {
        assert_eq!(format_job_list(&[]), NO_JOBS);
    }
}
