use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::config::BrokerConfig;
use crate::error::{OrchError, Result};
use crate::model::{generate_id, Evaluation};

/// Ready queue entry. Greater sorts first: higher priority, then older.
#[derive(Debug, Clone)]
struct ReadyEval {
    seq: u64,
    eval: Evaluation,
}

impl ReadyEval {
    fn key(&self) -> (u32, std::cmp::Reverse<u64>, std::cmp::Reverse<u64>) {
        (
            self.eval.priority,
            std::cmp::Reverse(self.eval.create_index),
            std::cmp::Reverse(self.seq),
        )
    }
}

impl PartialEq for ReadyEval {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ReadyEval {}

impl PartialOrd for ReadyEval {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEval {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Held back until `ready_at`. Greater sorts first: earliest instant.
#[derive(Debug, Clone)]
struct DelayedEval {
    ready_at: Instant,
    seq: u64,
    eval: Evaluation,
}

impl PartialEq for DelayedEval {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl Eq for DelayedEval {}

impl PartialOrd for DelayedEval {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEval {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Clone)]
struct Unacked {
    eval: Evaluation,
    token: String,
    deadline: Instant,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrokerStats {
    pub total_ready: usize,
    pub total_unacked: usize,
    pub total_pending: usize,
    pub total_waiting: usize,
}

#[derive(Default)]
struct BrokerState {
    enabled: bool,
    seq: u64,
    ready: BinaryHeap<ReadyEval>,
    unack: HashMap<String, Unacked>,
    /// Job id to the one evaluation that is ready, in flight or backing off.
    job_evals: HashMap<String, String>,
    /// Evaluations waiting for the job's current one to finish.
    pending: HashMap<String, Vec<ReadyEval>>,
    delayed: BinaryHeap<DelayedEval>,
    /// Evaluations re-enqueued while still outstanding, keyed by token.
    requeue: HashMap<String, Evaluation>,
    deliveries: HashMap<String, u32>,
    cancelable: Vec<Evaluation>,
    failed: Vec<Evaluation>,
}

impl BrokerState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn enqueue(&mut self, eval: Evaluation) {
        if let Some(wait_until) = eval.wait_until {
            let now = Utc::now();
            if wait_until > now {
                let seq = self.next_seq();
                self.delayed.push(DelayedEval {
                    ready_at: instant_for(wait_until, now),
                    seq,
                    eval,
                });
                return;
            }
        }
        self.enqueue_ready(eval);
    }

    fn enqueue_ready(&mut self, eval: Evaluation) {
        let seq = self.next_seq();
        let entry = ReadyEval { seq, eval };
        let job_id = entry.eval.job_id.clone();
        let tracked = self.job_evals.get(&job_id).cloned();
        match tracked {
            None => {
                self.job_evals.insert(job_id, entry.eval.id.clone());
                self.ready.push(entry);
            }
            Some(id) if id == entry.eval.id => {
                if !self.ready.iter().any(|r| r.eval.id == id) {
                    self.ready.push(entry);
                }
            }
            Some(id) => {
                let queued_priority = self
                    .ready
                    .iter()
                    .find(|r| r.eval.id == id)
                    .map(|r| r.eval.priority);
                match queued_priority {
                    Some(priority) if entry.eval.priority > priority => {
                        let mut collapsed = None;
                        self.ready.retain(|r| {
                            if r.eval.id == id {
                                collapsed = Some(r.eval.clone());
                                false
                            } else {
                                true
                            }
                        });
                        self.cancelable.extend(collapsed);
                        self.job_evals.insert(job_id, entry.eval.id.clone());
                        self.ready.push(entry);
                    }
                    Some(_) => self.cancelable.push(entry.eval),
                    None => self.pending.entry(job_id).or_default().push(entry),
                }
            }
        }
    }

    /// Move due delayed evaluations to the ready queue.
    fn promote_delayed(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|d| d.ready_at <= now) {
            if let Some(d) = self.delayed.pop() {
                self.enqueue_ready(d.eval);
            }
        }
    }

    /// Treat expired leases like nacks.
    fn expire_leases(&mut self, now: Instant, config: &BrokerConfig) {
        let expired: Vec<String> = self
            .unack
            .iter()
            .filter(|(_, u)| u.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(unacked) = self.unack.remove(&id) {
                tracing::warn!(
                    eval_id = %unacked.eval.short_id(),
                    job_id = %unacked.eval.job_id,
                    "Evaluation lease expired, requeueing"
                );
                self.after_nack(unacked, config);
            }
        }
    }

    fn after_nack(&mut self, unacked: Unacked, config: &BrokerConfig) {
        self.requeue.remove(&unacked.token);
        let id = unacked.eval.id.clone();
        let deliveries = self.deliveries.get(&id).copied().unwrap_or(0);
        if deliveries >= config.delivery_limit {
            tracing::warn!(
                eval_id = %unacked.eval.short_id(),
                deliveries,
                "Evaluation reached delivery limit"
            );
            self.deliveries.remove(&id);
            let job_id = unacked.eval.job_id.clone();
            self.failed.push(unacked.eval);
            self.release_job(&job_id, &id);
            return;
        }
        let delay = config.nack_delay(deliveries);
        if delay.is_zero() {
            self.enqueue_ready(unacked.eval);
        } else {
            let seq = self.next_seq();
            self.delayed.push(DelayedEval {
                ready_at: Instant::now() + delay,
                seq,
                eval: unacked.eval,
            });
        }
    }

    /// The job's current evaluation is done; promote the best waiting one
    /// and collapse the rest.
    fn release_job(&mut self, job_id: &str, eval_id: &str) {
        if self.job_evals.get(job_id).map(String::as_str) == Some(eval_id) {
            self.job_evals.remove(job_id);
        }
        if let Some(mut waiting) = self.pending.remove(job_id) {
            waiting.sort_by(|a, b| b.cmp(a));
            let mut waiting = waiting.into_iter();
            if let Some(best) = waiting.next() {
                self.cancelable.extend(waiting.map(|r| r.eval));
                self.enqueue_ready(best.eval);
            }
        }
    }

    fn pop_ready(&mut self, nack_timeout: Duration) -> Option<(Evaluation, String)> {
        let entry = self.ready.pop()?;
        let mut eval = entry.eval;
        let count = self.deliveries.entry(eval.id.clone()).or_insert(0);
        *count += 1;
        eval.deliveries = *count;
        let token = generate_id();
        self.unack.insert(
            eval.id.clone(),
            Unacked {
                eval: eval.clone(),
                token: token.clone(),
                deadline: Instant::now() + nack_timeout,
            },
        );
        Some((eval, token))
    }

    /// Earliest instant something changes without outside input.
    fn next_wakeup(&self) -> Option<Instant> {
        let delayed = self.delayed.peek().map(|d| d.ready_at);
        let lease = self.unack.values().map(|u| u.deadline).min();
        match (delayed, lease) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

fn instant_for(at: DateTime<Utc>, now: DateTime<Utc>) -> Instant {
    match (at - now).to_std() {
        Ok(wait) => Instant::now() + wait,
        Err(_) => Instant::now(),
    }
}

/// Leader-owned queue of evaluations waiting for a scheduler.
///
/// At most one evaluation per job is ready or in flight at a time. Each
/// delivery carries a token that must come back with the ack or nack; a
/// delivery that is neither acked nor nacked within the nack timeout is
/// handed out again.
pub struct EvalBroker {
    config: BrokerConfig,
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl EvalBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BrokerState::default()),
            notify: Notify::new(),
        }
    }

    pub async fn enabled(&self) -> bool {
        self.state.lock().await.enabled
    }

    /// Enabling starts from empty; disabling drops everything and wakes
    /// blocked dequeuers.
    pub async fn set_enabled(&self, enabled: bool) {
        let mut state = self.state.lock().await;
        let was = state.enabled;
        *state = BrokerState {
            enabled,
            ..Default::default()
        };
        drop(state);
        if was != enabled {
            tracing::info!(enabled, "Evaluation broker state changed");
        }
        self.notify.notify_waiters();
    }

    pub async fn enqueue(&self, eval: Evaluation) {
        let mut state = self.state.lock().await;
        if !state.enabled {
            return;
        }
        tracing::debug!(
            eval_id = %eval.short_id(),
            job_id = %eval.job_id,
            priority = eval.priority,
            "Enqueueing evaluation"
        );
        state.enqueue(eval);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Enqueue an evaluation that may still be outstanding under `token`.
    /// It is held until that delivery is acked.
    pub async fn enqueue_with_token(&self, eval: Evaluation, token: &str) {
        let mut state = self.state.lock().await;
        if !state.enabled {
            return;
        }
        let outstanding = state
            .unack
            .get(&eval.id)
            .is_some_and(|u| u.token == token);
        if outstanding {
            state.requeue.insert(token.to_string(), eval);
            return;
        }
        state.enqueue(eval);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Wait up to `timeout` for a ready evaluation.
    pub async fn dequeue(&self, timeout: Duration) -> Result<(Evaluation, String)> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake = {
                let mut state = self.state.lock().await;
                if !state.enabled {
                    return Err(OrchError::BrokerDisabled);
                }
                let now = Instant::now();
                state.expire_leases(now, &self.config);
                state.promote_delayed(now);
                if let Some((eval, token)) = state.pop_ready(self.config.nack_timeout()) {
                    tracing::debug!(
                        eval_id = %eval.short_id(),
                        job_id = %eval.job_id,
                        deliveries = eval.deliveries,
                        "Dequeued evaluation"
                    );
                    return Ok((eval, token));
                }
                state
                    .next_wakeup()
                    .map(|w| w.min(deadline))
                    .unwrap_or(deadline)
            };

            if Instant::now() >= deadline {
                return Err(OrchError::NoWorkAvailable);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    fn check_token(state: &BrokerState, id: &str, token: &str) -> Result<()> {
        let unacked = state
            .unack
            .get(id)
            .ok_or_else(|| OrchError::NotOutstanding(id.to_string()))?;
        if unacked.token != token {
            return Err(OrchError::TokenMismatch(id.to_string()));
        }
        Ok(())
    }

    pub async fn ack(&self, id: &str, token: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.expire_leases(Instant::now(), &self.config);
        Self::check_token(&state, id, token)?;
        let Some(unacked) = state.unack.remove(id) else {
            return Err(OrchError::NotOutstanding(id.to_string()));
        };
        state.deliveries.remove(id);
        let job_id = unacked.eval.job_id.clone();
        state.release_job(&job_id, id);
        if let Some(requeued) = state.requeue.remove(token) {
            state.enqueue(requeued);
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    pub async fn nack(&self, id: &str, token: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.expire_leases(Instant::now(), &self.config);
        Self::check_token(&state, id, token)?;
        let Some(unacked) = state.unack.remove(id) else {
            return Err(OrchError::NotOutstanding(id.to_string()));
        };
        tracing::debug!(eval_id = %unacked.eval.short_id(), "Evaluation nacked");
        state.after_nack(unacked, &self.config);
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Extend the lease of an outstanding delivery. A lease that already
    /// ran out is requeued instead.
    pub async fn outstanding_reset(&self, id: &str, token: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let expired = state.unack.len();
        state.expire_leases(Instant::now(), &self.config);
        if state.unack.len() != expired {
            self.notify.notify_waiters();
        }
        Self::check_token(&state, id, token)?;
        if let Some(unacked) = state.unack.get_mut(id) {
            unacked.deadline = Instant::now() + self.config.nack_timeout();
        }
        Ok(())
    }

    /// Collapsed evaluations waiting to be marked canceled.
    pub async fn take_cancelable(&self) -> Vec<Evaluation> {
        std::mem::take(&mut self.state.lock().await.cancelable)
    }

    /// Evaluations that hit the delivery limit.
    pub async fn take_failed(&self) -> Vec<Evaluation> {
        std::mem::take(&mut self.state.lock().await.failed)
    }

    pub async fn stats(&self) -> BrokerStats {
        let state = self.state.lock().await;
        BrokerStats {
            total_ready: state.ready.len(),
            total_unacked: state.unack.len(),
            total_pending: state.pending.values().map(Vec::len).sum(),
            total_waiting: state.delayed.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TriggerReason;

    fn config() -> BrokerConfig {
        BrokerConfig {
            nack_timeout_ms: 5_000,
            delivery_limit: 2,
            initial_nack_delay_ms: 0,
            subsequent_nack_delay_ms: 0,
        }
    }

    async fn broker() -> EvalBroker {
        let b = EvalBroker::new(config());
        b.set_enabled(true).await;
        b
    }

    fn eval(job: &str, priority: u32) -> Evaluation {
        Evaluation::new(job, priority, TriggerReason::JobRegister)
    }

    #[tokio::test]
    async fn higher_priority_first() {
        let b = broker().await;
        b.enqueue(eval("a", 10)).await;
        b.enqueue(eval("b", 90)).await;
        let (first, _) = b.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.job_id, "b");
    }

    #[tokio::test]
    async fn empty_dequeue_times_out() {
        let b = broker().await;
        let err = b.dequeue(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, OrchError::NoWorkAvailable));
    }

    #[tokio::test]
    async fn same_job_collapses_unless_higher_priority() {
        let b = broker().await;
        let first = eval("web", 50);
        b.enqueue(first.clone()).await;
        b.enqueue(eval("web", 50)).await;
        assert_eq!(b.take_cancelable().await.len(), 1);

        let urgent = eval("web", 80);
        b.enqueue(urgent.clone()).await;
        let cancelled = b.take_cancelable().await;
        assert_eq!(cancelled[0].id, first.id);

        let (got, _) = b.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(got.id, urgent.id);
        assert_eq!(b.stats().await.total_ready, 0);
    }

    #[tokio::test]
    async fn repeated_enqueue_delivers_once() {
        let b = broker().await;
        let e = eval("web", 50);
        b.enqueue(e.clone()).await;
        b.enqueue(e.clone()).await;
        assert_eq!(b.stats().await.total_ready, 1);
        assert!(b.take_cancelable().await.is_empty());

        let (got, _) = b.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(got.id, e.id);
        let err = b.dequeue(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, OrchError::NoWorkAvailable));
    }

    #[tokio::test]
    async fn in_flight_job_waits_then_best_pending_runs() {
        let b = broker().await;
        let e1 = eval("web", 50);
        b.enqueue(e1.clone()).await;
        let (got, token) = b.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(got.id, e1.id);

        let low = eval("web", 40);
        let high = eval("web", 60);
        b.enqueue(low.clone()).await;
        b.enqueue(high.clone()).await;
        assert_eq!(b.stats().await.total_pending, 2);
        assert!(b.dequeue(Duration::from_millis(10)).await.is_err());

        b.ack(&e1.id, &token).await.unwrap();
        let (next, _) = b.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(next.id, high.id);
        assert_eq!(b.take_cancelable().await[0].id, low.id);
    }

    #[tokio::test]
    async fn token_is_checked() {
        let b = broker().await;
        let e = eval("web", 50);
        b.enqueue(e.clone()).await;
        let (_, token) = b.dequeue(Duration::from_millis(10)).await.unwrap();
        assert!(matches!(
            b.ack(&e.id, "bogus").await,
            Err(OrchError::TokenMismatch(_))
        ));
        b.ack(&e.id, &token).await.unwrap();
        assert!(matches!(
            b.ack(&e.id, &token).await,
            Err(OrchError::NotOutstanding(_))
        ));
    }

    #[tokio::test]
    async fn nack_redelivers_until_limit() {
        let b = broker().await;
        let e = eval("web", 50);
        b.enqueue(e.clone()).await;

        let (first, token) = b.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.deliveries, 1);
        b.nack(&e.id, &token).await.unwrap();

        let (second, token) = b.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(second.deliveries, 2);
        b.nack(&e.id, &token).await.unwrap();

        assert!(b.dequeue(Duration::from_millis(10)).await.is_err());
        let failed = b.take_failed().await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, e.id);
    }

    #[tokio::test]
    async fn wait_until_holds_evaluation_back() {
        let b = broker().await;
        let mut e = eval("web", 50);
        e.wait_until = Some(Utc::now() + chrono::Duration::milliseconds(150));
        b.enqueue(e.clone()).await;
        assert!(b.dequeue(Duration::from_millis(30)).await.is_err());
        assert_eq!(b.stats().await.total_waiting, 1);
        let (got, _) = b.dequeue(Duration::from_secs(2)).await.unwrap();
        assert_eq!(got.id, e.id);
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered() {
        let b = EvalBroker::new(BrokerConfig {
            nack_timeout_ms: 50,
            ..config()
        });
        b.set_enabled(true).await;
        let e = eval("web", 50);
        b.enqueue(e.clone()).await;
        let (_, stale) = b.dequeue(Duration::from_millis(10)).await.unwrap();
        let (again, _) = b.dequeue(Duration::from_secs(1)).await.unwrap();
        assert_eq!(again.id, e.id);
        assert!(b.ack(&e.id, &stale).await.is_err());
    }

    #[tokio::test]
    async fn reset_keeps_lease_alive() {
        let b = EvalBroker::new(BrokerConfig {
            nack_timeout_ms: 100,
            ..config()
        });
        b.set_enabled(true).await;
        let e = eval("web", 50);
        b.enqueue(e.clone()).await;
        let (_, token) = b.dequeue(Duration::from_millis(10)).await.unwrap();
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            b.outstanding_reset(&e.id, &token).await.unwrap();
        }
        assert!(b.outstanding_reset(&e.id, "other").await.is_err());
        b.ack(&e.id, &token).await.unwrap();
    }

    #[tokio::test]
    async fn requeue_waits_for_ack() {
        let b = broker().await;
        let e = eval("web", 50);
        b.enqueue(e.clone()).await;
        let (got, token) = b.dequeue(Duration::from_millis(10)).await.unwrap();
        b.enqueue_with_token(got.clone(), &token).await;
        assert_eq!(b.stats().await.total_ready, 0);
        b.ack(&e.id, &token).await.unwrap();
        let (again, _) = b.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(again.id, e.id);
    }

    #[tokio::test]
    async fn disable_flushes() {
        let b = broker().await;
        b.enqueue(eval("web", 50)).await;
        b.set_enabled(false).await;
        assert!(matches!(
            b.dequeue(Duration::from_millis(10)).await,
            Err(OrchError::BrokerDisabled)
        ));
        b.set_enabled(true).await;
        assert_eq!(b.stats().await, BrokerStats::default());
    }
}
