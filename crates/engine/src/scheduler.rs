//! Assignment scheduler — owns the live (sequence, lead) executions.
//!
//! All state lives in the `AssignmentStore`; this type adds delay arithmetic,
//! lifecycle transitions, per-key single-writer locking and a wake-up signal
//! for the worker loop. Mutations are applied to a copy, written through,
//! and only then reflected in the caller's value.
//!
//! The single-writer lock has two layers: an in-process mutex per key, and a
//! lease taken in the store so workers sharing one store exclude each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use nurture_core::config::EngineConfig;
use nurture_core::error::{NurtureError, NurtureResult};
use nurture_core::event_bus::{make_event, EventSink, NurtureEventType};

use crate::clock::Clock;
use crate::metrics::MetricsAggregator;
use crate::state_machine::AssignmentStateMachine;
use crate::store::AssignmentStore;
use crate::types::{AbortReason, Assignment, AssignmentKey, AssignmentState, Sequence};

/// Exponential backoff for transient step failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_step_attempts.max(1),
            base: Duration::milliseconds(config.retry_backoff_base_ms as i64),
            max: Duration::milliseconds(config.retry_backoff_max_ms as i64),
        }
    }

    /// Delay before retry number `attempt` (1-based), with ±10% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let raw = self.base.num_milliseconds().saturating_mul(1_i64 << exp);
        let capped = raw.min(self.max.num_milliseconds()).max(0);
        let jitter = (capped / 10).max(0);
        let offset = if jitter > 0 {
            rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            0
        };
        Duration::milliseconds((capped + offset).max(0))
    }
}

/// What `advance` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    Scheduled {
        step_index: usize,
        at: DateTime<Utc>,
    },
    Completed,
}

/// What `retry_later` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retry {
    Scheduled { attempt: u32, at: DateTime<Utc> },
    Exhausted,
}

const LEASE_POLL: StdDuration = StdDuration::from_millis(20);

/// `from + delay`, or an error when the result leaves chrono's range.
fn schedule_after(from: DateTime<Utc>, delay: Duration) -> NurtureResult<DateTime<Utc>> {
    from.checked_add_signed(delay).ok_or_else(|| {
        NurtureError::InvalidSequence(format!(
            "delay of {} ms after {from} is out of range",
            delay.num_milliseconds()
        ))
    })
}

struct Lease {
    token: Uuid,
    store: Arc<dyn AssignmentStore>,
}

/// Exclusive access to one assignment key. Call `release` when done; a
/// guard that is merely dropped gives its store lease back in the
/// background.
pub struct KeyGuard {
    guard: Option<OwnedMutexGuard<()>>,
    lease: Option<Lease>,
    key: AssignmentKey,
    locks: Arc<DashMap<AssignmentKey, Arc<Mutex<()>>>>,
}

impl KeyGuard {
    /// Gives the store lease back, then the in-process lock.
    pub async fn release(mut self) {
        if let Some(lease) = self.lease.take() {
            if let Err(e) = lease.store.release_lease(&self.key, lease.token).await {
                warn!(assignment = %self.key, error = %e, "Lease release failed, it will expire");
            }
        }
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let key = self.key.clone();
                handle.spawn(async move {
                    let _ = lease.store.release_lease(&key, lease.token).await;
                });
            }
        }
        drop(self.guard.take());
        // Only the map still holds the mutex: nobody is waiting on it.
        self.locks
            .remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
    }
}

pub struct AssignmentScheduler {
    store: Arc<dyn AssignmentStore>,
    metrics: MetricsAggregator,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    lease_ttl: Duration,
    locks: Arc<DashMap<AssignmentKey, Arc<Mutex<()>>>>,
    wake: Notify,
}

impl std::fmt::Debug for AssignmentScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssignmentScheduler")
            .field("locked_keys", &self.locks.len())
            .field("retry", &self.retry)
            .field("lease_ttl", &self.lease_ttl)
            .finish()
    }
}

impl AssignmentScheduler {
    pub fn new(
        store: Arc<dyn AssignmentStore>,
        metrics: MetricsAggregator,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            store,
            metrics,
            events,
            clock,
            retry,
            lease_ttl,
            locks: Arc::new(DashMap::new()),
            wake: Notify::new(),
        }
    }

    /// Acquires the single-writer lock for `key`, waiting up to one lease
    /// lifetime for another worker to let go of it.
    pub async fn lock(&self, key: &AssignmentKey) -> NurtureResult<KeyGuard> {
        let deadline = tokio::time::Instant::now()
            + self.lease_ttl.to_std().unwrap_or(StdDuration::ZERO);
        let mut guard = self.local_lock(key).await;
        loop {
            if self.take_lease(&mut guard).await? {
                return Ok(guard);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(NurtureError::LeaseBusy(key.to_string()));
            }
            tokio::time::sleep(LEASE_POLL).await;
        }
    }

    /// Like `lock`, but gives up at once if another worker holds the lease.
    pub async fn try_lock(&self, key: &AssignmentKey) -> NurtureResult<Option<KeyGuard>> {
        let mut guard = self.local_lock(key).await;
        if self.take_lease(&mut guard).await? {
            Ok(Some(guard))
        } else {
            debug!(assignment = %key, "Assignment leased by another worker");
            Ok(None)
        }
    }

    async fn local_lock(&self, key: &AssignmentKey) -> KeyGuard {
        let mutex = self.locks.entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        KeyGuard {
            guard: Some(guard),
            lease: None,
            key: key.clone(),
            locks: self.locks.clone(),
        }
    }

    async fn take_lease(&self, guard: &mut KeyGuard) -> NurtureResult<bool> {
        let token = Uuid::new_v4();
        let acquired = self
            .store
            .acquire_lease(&guard.key, token, self.clock.now(), self.lease_ttl)
            .await?;
        if acquired {
            guard.lease = Some(Lease {
                token,
                store: self.store.clone(),
            });
        }
        Ok(acquired)
    }

    /// Resolves when a new assignment has been scheduled.
    pub async fn notified(&self) {
        self.wake.notified().await
    }

    pub async fn get(&self, key: &AssignmentKey) -> NurtureResult<Option<Assignment>> {
        self.store.get(key).await
    }

    pub async fn due(&self, limit: usize) -> NurtureResult<Vec<Assignment>> {
        self.store.due(self.clock.now(), limit).await
    }

    pub async fn list_for_sequence(&self, sequence_id: Uuid) -> NurtureResult<Vec<Assignment>> {
        self.store.list_for_sequence(sequence_id).await
    }

    pub async fn all(&self) -> NurtureResult<Vec<Assignment>> {
        self.store.all().await
    }

    /// Creates the live assignment for (sequence, lead), with step 0 due
    /// after its own delay.
    pub async fn assign(
        &self,
        sequence: &Sequence,
        lead_id: &str,
        custom_values: HashMap<String, String>,
    ) -> NurtureResult<Assignment> {
        let key = AssignmentKey::new(sequence.id, lead_id);
        let guard = self.lock(&key).await?;
        let result = self.assign_locked(sequence, key, custom_values).await;
        guard.release().await;
        result
    }

    async fn assign_locked(
        &self,
        sequence: &Sequence,
        key: AssignmentKey,
        custom_values: HashMap<String, String>,
    ) -> NurtureResult<Assignment> {
        let lead_id = key.lead_id.clone();
        if self.store.get(&key).await?.is_some() {
            return Err(NurtureError::AlreadyAssigned {
                sequence_id: sequence.id,
                lead_id: lead_id.clone(),
            });
        }

        let first = sequence.steps.first().ok_or_else(|| {
            NurtureError::InvalidSequence(format!("sequence {} has no steps", sequence.id))
        })?;

        let now = self.clock.now();
        let assignment = Assignment {
            id: Uuid::new_v4(),
            key: key.clone(),
            steps: sequence.steps.clone(),
            current_step_index: 0,
            next_execution_time: schedule_after(now, first.delay.as_duration())?,
            state: AssignmentState::Scheduled,
            attempts: 0,
            assigned_at: now,
            responded: false,
            custom_values,
        };

        self.store.put(&assignment).await?;
        self.metrics.on_assigned(sequence.id);
        self.emit(NurtureEventType::Assigned, &assignment, None, None);

        info!(
            sequence_id = %sequence.id,
            lead_id = %lead_id,
            execution_id = %assignment.id,
            next_execution_time = %assignment.next_execution_time,
            "Lead assigned to sequence"
        );

        self.wake.notify_one();
        Ok(assignment)
    }

    /// Moves past the current step. The next step's delay counts from
    /// `resolved_at`; after the last step the assignment completes.
    pub async fn advance(
        &self,
        assignment: &mut Assignment,
        resolved_at: DateTime<Utc>,
    ) -> NurtureResult<Advance> {
        let mut sm = AssignmentStateMachine::at(assignment.state);

        if assignment.is_last_step() {
            sm.transition(AssignmentState::Completed)?;
            self.store.remove(&assignment.key).await?;
            assignment.state = sm.state;
            self.metrics.on_completed(assignment.key.sequence_id);
            self.emit(NurtureEventType::Completed, assignment, None, None);
            info!(
                sequence_id = %assignment.key.sequence_id,
                lead_id = %assignment.key.lead_id,
                execution_id = %assignment.id,
                "Sequence completed"
            );
            return Ok(Advance::Completed);
        }

        sm.transition(AssignmentState::Scheduled)?;
        let mut next = assignment.clone();
        next.current_step_index += 1;
        next.attempts = 0;
        let delay = next.steps[next.current_step_index].delay.as_duration();
        next.next_execution_time = schedule_after(resolved_at, delay)?;

        self.store.put(&next).await?;
        *assignment = next;

        Ok(Advance::Scheduled {
            step_index: assignment.current_step_index,
            at: assignment.next_execution_time,
        })
    }

    /// Removes the assignment from the live set without running further steps.
    pub async fn abort(
        &self,
        assignment: &mut Assignment,
        reason: AbortReason,
    ) -> NurtureResult<()> {
        let mut sm = AssignmentStateMachine::at(assignment.state);
        sm.transition(AssignmentState::Aborted)?;

        self.store.remove(&assignment.key).await?;
        assignment.state = sm.state;
        self.metrics.on_aborted(assignment.key.sequence_id, &reason);
        self.emit(
            NurtureEventType::Aborted,
            assignment,
            None,
            Some(reason.to_string()),
        );

        info!(
            sequence_id = %assignment.key.sequence_id,
            lead_id = %assignment.key.lead_id,
            execution_id = %assignment.id,
            step_index = assignment.current_step_index,
            %reason,
            "Assignment aborted"
        );
        Ok(())
    }

    /// Aborts whatever assignment is live under `key`, if any.
    pub async fn abort_key(&self, key: &AssignmentKey, reason: AbortReason) -> NurtureResult<bool> {
        let guard = self.lock(key).await?;
        let result = match self.store.get(key).await {
            Ok(Some(mut assignment)) => self.abort(&mut assignment, reason).await.map(|_| true),
            Ok(None) => Ok(false),
            Err(e) => Err(e),
        };
        guard.release().await;
        result
    }

    /// Reschedules the current step after a transient failure, leaving the
    /// step index untouched. Aborts once the attempt budget is spent.
    pub async fn retry_later(
        &self,
        assignment: &mut Assignment,
        cause: &NurtureError,
    ) -> NurtureResult<Retry> {
        let attempt = assignment.attempts + 1;
        if attempt >= self.retry.max_attempts {
            self.abort(assignment, AbortReason::RetriesExhausted { attempts: attempt })
                .await?;
            return Ok(Retry::Exhausted);
        }

        let mut next = assignment.clone();
        next.attempts = attempt;
        next.next_execution_time = schedule_after(self.clock.now(), self.retry.backoff(attempt))?;
        self.store.put(&next).await?;
        *assignment = next;

        self.metrics.on_stalled(assignment.key.sequence_id);
        self.emit(
            NurtureEventType::RetryScheduled,
            assignment,
            assignment.current_step().map(|s| s.id),
            Some(cause.to_string()),
        );
        warn!(
            sequence_id = %assignment.key.sequence_id,
            lead_id = %assignment.key.lead_id,
            step_index = assignment.current_step_index,
            attempt,
            retry_at = %assignment.next_execution_time,
            error = %cause,
            "Step failed transiently, retry scheduled"
        );

        Ok(Retry::Scheduled {
            attempt,
            at: assignment.next_execution_time,
        })
    }

    pub(crate) fn emit(
        &self,
        event_type: NurtureEventType,
        assignment: &Assignment,
        step_id: Option<Uuid>,
        detail: Option<String>,
    ) {
        self.events.emit(make_event(
            event_type,
            assignment.key.sequence_id,
            assignment.key.lead_id.clone(),
            assignment.id,
            step_id,
            detail,
            self.clock.now(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryAssignmentStore;
    use crate::types::{Delay, SequenceMetrics, SequenceStatus, Step, Template};
    use nurture_core::event_bus::{capture_sink, CaptureSink};
    use nurture_core::types::{BusinessType, Channel};

    fn step(order: u32, delay: Delay) -> Step {
        Step {
            id: Uuid::new_v4(),
            order,
            name: format!("step {order}"),
            channel: Channel::Email,
            template: Template {
                id: "t".into(),
                subject: None,
                body: "body".into(),
                personalizations: vec![],
            },
            delay,
            conditions: vec![],
        }
    }

    fn sequence(steps: Vec<Step>) -> Sequence {
        let now = Utc::now();
        Sequence {
            id: Uuid::new_v4(),
            name: "s".into(),
            description: String::new(),
            business_type: BusinessType::Trainer,
            steps,
            triggers: vec![],
            status: SequenceStatus::Active,
            metrics: SequenceMetrics::default(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn scheduler(clock: Arc<ManualClock>) -> (AssignmentScheduler, Arc<InMemoryAssignmentStore>, MetricsAggregator) {
        let store = Arc::new(InMemoryAssignmentStore::new());
        let (scheduler, metrics) = scheduler_on(store.clone(), clock, capture_sink());
        (scheduler, store, metrics)
    }

    fn scheduler_on(
        store: Arc<InMemoryAssignmentStore>,
        clock: Arc<ManualClock>,
        events: Arc<CaptureSink>,
    ) -> (AssignmentScheduler, MetricsAggregator) {
        let metrics = MetricsAggregator::new();
        let policy = RetryPolicy {
            max_attempts: 3,
            base: Duration::minutes(1),
            max: Duration::minutes(10),
        };
        let scheduler = AssignmentScheduler::new(
            store,
            metrics.clone(),
            events,
            clock,
            policy,
            Duration::milliseconds(200),
        );
        (scheduler, metrics)
    }

    #[tokio::test]
    async fn test_assign_uses_first_step_delay() {
        let t0 = Utc::now();
        let clock = ManualClock::new(t0);
        let (scheduler, store, metrics) = scheduler(clock);
        let seq = sequence(vec![step(1, Delay::days(2))]);

        let a = scheduler.assign(&seq, "l1", HashMap::new()).await.unwrap();
        assert_eq!(a.current_step_index, 0);
        assert_eq!(
            a.next_execution_time.signed_duration_since(t0).num_milliseconds(),
            172_800_000
        );
        assert_eq!(store.len(), 1);
        assert_eq!(metrics.snapshot(seq.id).active_sequences, 1);
    }

    #[tokio::test]
    async fn test_second_assign_is_rejected() {
        let clock = ManualClock::new(Utc::now());
        let (scheduler, store, _) = scheduler(clock);
        let seq = sequence(vec![step(1, Delay::hours(1))]);

        scheduler.assign(&seq, "l1", HashMap::new()).await.unwrap();
        let err = scheduler.assign(&seq, "l1", HashMap::new()).await.unwrap_err();
        assert!(matches!(err, NurtureError::AlreadyAssigned { .. }));
        assert_eq!(store.len(), 1);

        // A different lead on the same sequence is independent.
        scheduler.assign(&seq, "l2", HashMap::new()).await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_assigns_create_one_assignment() {
        let clock = ManualClock::new(Utc::now());
        let (scheduler, store, _) = scheduler(clock);
        let scheduler = Arc::new(scheduler);
        let seq = Arc::new(sequence(vec![step(1, Delay::hours(1))]));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let scheduler = scheduler.clone();
            let seq = seq.clone();
            tasks.spawn(async move { scheduler.assign(&seq, "l1", HashMap::new()).await.is_ok() });
        }
        let mut ok = 0;
        while let Some(res) = tasks.join_next().await {
            if res.unwrap() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_advance_then_complete() {
        let t0 = Utc::now();
        let clock = ManualClock::new(t0);
        let (scheduler, store, metrics) = scheduler(clock);
        let seq = sequence(vec![step(1, Delay::minutes(0)), step(2, Delay::hours(3))]);

        let mut a = scheduler.assign(&seq, "l1", HashMap::new()).await.unwrap();
        let resolved = t0 + Duration::minutes(5);
        let adv = scheduler.advance(&mut a, resolved).await.unwrap();
        assert_eq!(
            adv,
            Advance::Scheduled {
                step_index: 1,
                at: resolved + Duration::hours(3)
            }
        );
        assert_eq!(store.get(&a.key).await.unwrap().unwrap().current_step_index, 1);

        let adv = scheduler.advance(&mut a, resolved).await.unwrap();
        assert_eq!(adv, Advance::Completed);
        assert_eq!(a.state, AssignmentState::Completed);
        assert!(store.is_empty());

        let snap = metrics.snapshot(seq.id);
        assert_eq!(snap.completed_sequences, 1);
        assert_eq!(snap.active_sequences, 0);

        // Completed is terminal.
        assert!(scheduler.advance(&mut a, resolved).await.is_err());
    }

    #[tokio::test]
    async fn test_retry_then_exhaust() {
        let t0 = Utc::now();
        let clock = ManualClock::new(t0);
        let (scheduler, store, metrics) = scheduler(clock);
        let seq = sequence(vec![step(1, Delay::minutes(0))]);
        let mut a = scheduler.assign(&seq, "l1", HashMap::new()).await.unwrap();
        let cause = NurtureError::StoreUnavailable("down".into());

        match scheduler.retry_later(&mut a, &cause).await.unwrap() {
            Retry::Scheduled { attempt, at } => {
                assert_eq!(attempt, 1);
                assert!(at >= t0 + Duration::seconds(54));
                assert!(at <= t0 + Duration::seconds(66));
            }
            other => panic!("expected retry, got {other:?}"),
        }
        assert_eq!(a.current_step_index, 0);
        assert!(matches!(
            scheduler.retry_later(&mut a, &cause).await.unwrap(),
            Retry::Scheduled { attempt: 2, .. }
        ));
        assert_eq!(
            scheduler.retry_later(&mut a, &cause).await.unwrap(),
            Retry::Exhausted
        );
        assert_eq!(a.state, AssignmentState::Aborted);
        assert!(store.is_empty());

        let snap = metrics.snapshot(seq.id);
        assert_eq!(snap.stalled_steps, 2);
        assert_eq!(snap.failed_sequences, 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base: Duration::seconds(10),
            max: Duration::seconds(60),
        };
        let b1 = policy.backoff(1);
        assert!(b1 >= Duration::seconds(9) && b1 <= Duration::seconds(11));
        let b9 = policy.backoff(9);
        assert!(b9 >= Duration::seconds(54) && b9 <= Duration::seconds(66));
    }

    #[tokio::test]
    async fn test_abort_key() {
        let clock = ManualClock::new(Utc::now());
        let (scheduler, store, _) = scheduler(clock);
        let seq = sequence(vec![step(1, Delay::hours(1))]);
        let a = scheduler.assign(&seq, "l1", HashMap::new()).await.unwrap();

        assert!(scheduler.abort_key(&a.key, AbortReason::SequencePaused).await.unwrap());
        assert!(!scheduler.abort_key(&a.key, AbortReason::SequencePaused).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_delay_is_an_error() {
        let clock = ManualClock::new(Utc::now());
        let (scheduler, store, metrics) = scheduler(clock);

        let seq = sequence(vec![step(1, Delay::days(200_000_000))]);
        let err = scheduler.assign(&seq, "l1", HashMap::new()).await.unwrap_err();
        assert!(matches!(err, NurtureError::InvalidSequence(_)));
        assert!(store.is_empty());
        assert_eq!(metrics.snapshot(seq.id).active_sequences, 0);

        // Overflow on a later step leaves the stored assignment untouched.
        let seq = sequence(vec![step(1, Delay::minutes(0)), step(2, Delay::days(200_000_000))]);
        let mut a = scheduler.assign(&seq, "l1", HashMap::new()).await.unwrap();
        let err = scheduler.advance(&mut a, Utc::now()).await.unwrap_err();
        assert!(matches!(err, NurtureError::InvalidSequence(_)));
        assert!(!err.is_transient());
        assert_eq!(a.current_step_index, 0);
        assert_eq!(store.get(&a.key).await.unwrap().unwrap().current_step_index, 0);
    }

    #[tokio::test]
    async fn test_lease_excludes_schedulers_sharing_a_store() {
        let clock = ManualClock::new(Utc::now());
        let store = Arc::new(InMemoryAssignmentStore::new());
        let (first, _) = scheduler_on(store.clone(), clock.clone(), capture_sink());
        let (second, _) = scheduler_on(store.clone(), clock.clone(), capture_sink());
        let key = AssignmentKey::new(Uuid::new_v4(), "l1");

        let held = first.try_lock(&key).await.unwrap().unwrap();
        assert!(second.try_lock(&key).await.unwrap().is_none());
        assert!(matches!(
            second.lock(&key).await,
            Err(NurtureError::LeaseBusy(_))
        ));

        held.release().await;
        let again = second.try_lock(&key).await.unwrap().unwrap();
        again.release().await;
        first.try_lock(&key).await.unwrap().unwrap().release().await;
    }

    #[tokio::test]
    async fn test_events_use_engine_clock() {
        let t0 = Utc::now() - Duration::days(30);
        let clock = ManualClock::new(t0);
        let events = capture_sink();
        let (scheduler, _) =
            scheduler_on(Arc::new(InMemoryAssignmentStore::new()), clock.clone(), events.clone());
        let seq = sequence(vec![step(1, Delay::minutes(0)), step(2, Delay::hours(1))]);

        let mut a = scheduler.assign(&seq, "l1", HashMap::new()).await.unwrap();
        clock.advance(Duration::hours(2));
        scheduler.advance(&mut a, clock.now()).await.unwrap();
        scheduler.advance(&mut a, clock.now()).await.unwrap();

        let stamps: Vec<_> = events.events().iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![t0, t0 + Duration::hours(2)]);
    }
}
