use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::model::{
    Allocation, ClientStatus, DelayFunction, DesiredStatus, RescheduleEvent, ReschedulePolicy,
    RescheduleTracker,
};

/// History kept for unlimited policies, which have no interval to trim by.
pub const MAX_PAST_RESCHEDULE_EVENTS: usize = 5;

/// Failures closer together than this share one follow-up evaluation.
pub const BATCHED_FAILED_ALLOC_WINDOW: Duration = Duration::from_secs(5);

/// Delay before the `attempt`th reschedule (zero-based).
///
/// constant: `delay`; exponential: `delay * 2^attempt`; fibonacci:
/// `delay * fib(attempt)` over 1, 1, 2, 3, 5, ... Growing curves stop at
/// `max_delay` when one is set.
pub fn reschedule_delay(policy: &ReschedulePolicy, attempt: u32) -> Duration {
    let base = policy.delay_ms;
    let raw_ms = match policy.delay_function {
        DelayFunction::Constant => return policy.delay(),
        DelayFunction::Exponential => {
            let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
            base.saturating_mul(factor)
        }
        DelayFunction::Fibonacci => base.saturating_mul(fibonacci(attempt)),
    };
    let capped = if policy.max_delay_ms > 0 {
        raw_ms.min(policy.max_delay_ms)
    } else {
        raw_ms
    };
    Duration::from_millis(capped)
}

fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

/// `t + delay`, clamped to the largest representable instant.
pub fn add_delay(t: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| t.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Attempts already spent within the policy window ending at `fail_time`.
fn attempts_in_window(
    tracker: Option<&RescheduleTracker>,
    policy: &ReschedulePolicy,
    fail_time: DateTime<Utc>,
) -> u32 {
    let Some(tracker) = tracker else {
        return 0;
    };
    let window_start = fail_time - chrono::Duration::milliseconds(policy.interval_ms as i64);
    tracker
        .events
        .iter()
        .filter(|e| e.reschedule_time > window_start)
        .count() as u32
}

/// When `alloc` may be replaced and whether the policy allows it at all.
/// None when the allocation is not a reschedule candidate.
pub fn next_reschedule_time(
    alloc: &Allocation,
    policy: &ReschedulePolicy,
) -> Option<(DateTime<Utc>, bool)> {
    if alloc.desired_status != DesiredStatus::Run
        || alloc.client_status != ClientStatus::Failed
        || alloc.next_allocation.is_some()
        || !policy.enabled()
    {
        return None;
    }
    let fail_time = alloc.last_event_time();
    let attempt = alloc
        .reschedule_tracker
        .as_ref()
        .map(RescheduleTracker::next_attempt)
        .unwrap_or(0);
    let at = add_delay(fail_time, reschedule_delay(policy, attempt));

    let eligible = policy.unlimited
        || attempts_in_window(alloc.reschedule_tracker.as_ref(), policy, fail_time)
            < policy.attempts;
    Some((at, eligible))
}

/// Tracker for the replacement of `prev`: the prior history trimmed to what
/// the policy still counts, plus this reschedule.
pub fn next_tracker(
    prev: &Allocation,
    policy: &ReschedulePolicy,
    now: DateTime<Utc>,
) -> RescheduleTracker {
    let attempt = prev
        .reschedule_tracker
        .as_ref()
        .map(RescheduleTracker::next_attempt)
        .unwrap_or(0);
    let mut events: Vec<RescheduleEvent> = match &prev.reschedule_tracker {
        None => Vec::new(),
        Some(tracker) if policy.unlimited => {
            let skip = tracker
                .events
                .len()
                .saturating_sub(MAX_PAST_RESCHEDULE_EVENTS - 1);
            tracker.events[skip..].to_vec()
        }
        Some(tracker) => {
            let window_start = now - chrono::Duration::milliseconds(policy.interval_ms as i64);
            tracker
                .events
                .iter()
                .filter(|e| e.reschedule_time > window_start)
                .cloned()
                .collect()
        }
    };
    events.push(RescheduleEvent {
        reschedule_time: now,
        prev_alloc_id: prev.id.clone(),
        prev_node_id: prev.node_id.clone(),
        attempt,
        delay_ms: reschedule_delay(policy, attempt).as_millis() as u64,
    });
    RescheduleTracker { events }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::model::alloc_name;

    fn policy(function: DelayFunction) -> ReschedulePolicy {
        ReschedulePolicy {
            attempts: 0,
            interval_ms: 0,
            delay_ms: 5_000,
            delay_function: function,
            max_delay_ms: 60_000,
            unlimited: true,
        }
    }

    #[test]
    fn constant_delay_never_grows() {
        let p = policy(DelayFunction::Constant);
        for attempt in [0, 1, 5, 40] {
            assert_eq!(reschedule_delay(&p, attempt), Duration::from_secs(5));
        }
    }

    #[test]
    fn exponential_delay_doubles_then_caps() {
        let p = policy(DelayFunction::Exponential);
        let got: Vec<u64> = (0..6).map(|a| reschedule_delay(&p, a).as_secs()).collect();
        assert_eq!(got, vec![5, 10, 20, 40, 60, 60]);
        assert_eq!(reschedule_delay(&p, 200), Duration::from_secs(60));
    }

    #[test]
    fn fibonacci_delay_follows_sequence() {
        let p = policy(DelayFunction::Fibonacci);
        let got: Vec<u64> = (0..7).map(|a| reschedule_delay(&p, a).as_secs()).collect();
        assert_eq!(got, vec![5, 5, 10, 15, 25, 40, 60]);
    }

    #[test]
    fn uncapped_growth_saturates() {
        let mut p = policy(DelayFunction::Exponential);
        p.max_delay_ms = 0;
        assert_eq!(reschedule_delay(&p, 3), Duration::from_secs(40));
        assert_eq!(reschedule_delay(&p, 90), Duration::from_millis(u64::MAX));
    }

    fn failed_alloc(tracker: Option<RescheduleTracker>) -> Allocation {
        let job = Arc::new(crate::model::test_fixtures::job("web", 1));
        let tg = job.task_groups[0].clone();
        let mut a = Allocation::new("e1", job, &tg, alloc_name("web", "web", 0), "n1", "n1");
        a.set_client_status(ClientStatus::Failed, "exit 1");
        a.reschedule_tracker = tracker;
        a
    }

    #[test]
    fn limited_policy_runs_out() {
        let p = ReschedulePolicy {
            attempts: 2,
            interval_ms: 3_600_000,
            delay_ms: 1_000,
            delay_function: DelayFunction::Constant,
            max_delay_ms: 0,
            unlimited: false,
        };
        let first = failed_alloc(None);
        let (at, eligible) = next_reschedule_time(&first, &p).unwrap();
        assert!(eligible);
        assert_eq!(at, first.last_event_time() + chrono::Duration::seconds(1));

        let tracker = next_tracker(&first, &p, Utc::now());
        let second = failed_alloc(Some(tracker.clone()));
        assert!(next_reschedule_time(&second, &p).unwrap().1);

        let third = failed_alloc(Some(next_tracker(&second, &p, Utc::now())));
        assert_eq!(third.reschedule_tracker.as_ref().unwrap().events.len(), 2);
        assert!(!next_reschedule_time(&third, &p).unwrap().1);
    }

    #[test]
    fn unlimited_history_is_bounded() {
        let p = policy(DelayFunction::Exponential);
        let mut alloc = failed_alloc(None);
        for _ in 0..12 {
            let tracker = next_tracker(&alloc, &p, Utc::now());
            alloc = failed_alloc(Some(tracker));
        }
        let tracker = alloc.reschedule_tracker.as_ref().unwrap();
        assert_eq!(tracker.events.len(), MAX_PAST_RESCHEDULE_EVENTS);
        assert_eq!(tracker.next_attempt(), 12);
        assert!(next_reschedule_time(&alloc, &p).unwrap().1);
    }

    #[test]
    fn only_failed_running_allocs_qualify() {
        let p = policy(DelayFunction::Constant);
        let mut alloc = failed_alloc(None);
        alloc.next_allocation = Some("replacement".into());
        assert!(next_reschedule_time(&alloc, &p).is_none());

        let mut alloc = failed_alloc(None);
        alloc.desired_status = DesiredStatus::Stop;
        assert!(next_reschedule_time(&alloc, &p).is_none());

        let alloc = failed_alloc(None);
        assert!(next_reschedule_time(&alloc, &ReschedulePolicy::disabled()).is_none());
    }
}
