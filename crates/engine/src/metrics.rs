//! Per-sequence counters updated concurrently by many assignments.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Duration;
use dashmap::DashMap;
use uuid::Uuid;

use crate::types::{AbortReason, SequenceMetrics};

#[derive(Debug, Default)]
struct SequenceCounters {
    total_leads: AtomicU64,
    active: AtomicU64,
    completed: AtomicU64,
    aborted: AtomicU64,
    converted: AtomicU64,
    responded: AtomicU64,
    response_secs_total: AtomicU64,
    messages_sent: AtomicU64,
    steps_skipped: AtomicU64,
    stalled_steps: AtomicU64,
    failed: AtomicU64,
}

impl SequenceCounters {
    fn from_snapshot(m: &SequenceMetrics) -> Self {
        // Snapshots that only carry rates get their counts back from them.
        let from_rate = |count: u64, rate: f64| {
            if count > 0 {
                count
            } else {
                (rate * m.total_leads as f64 / 100.0).round() as u64
            }
        };
        let responded = from_rate(m.responded_leads, m.response_rate);
        let converted = from_rate(m.converted_leads, m.conversion_rate);
        let response_secs = (m.average_response_time * 3600.0 * responded as f64) as u64;
        Self {
            total_leads: AtomicU64::new(m.total_leads),
            active: AtomicU64::new(m.active_sequences),
            completed: AtomicU64::new(m.completed_sequences),
            aborted: AtomicU64::new(m.aborted_sequences),
            converted: AtomicU64::new(converted),
            responded: AtomicU64::new(responded),
            response_secs_total: AtomicU64::new(response_secs),
            messages_sent: AtomicU64::new(m.messages_sent),
            steps_skipped: AtomicU64::new(m.steps_skipped),
            stalled_steps: AtomicU64::new(m.stalled_steps),
            failed: AtomicU64::new(m.failed_sequences),
        }
    }

    /// Saturating decrement, so a recovery recount can never wrap.
    fn leave_active(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1)));
    }
}

/// Aggregates counters per sequence with atomic in-place increments.
#[derive(Debug, Default, Clone)]
pub struct MetricsAggregator {
    counters: Arc<DashMap<Uuid, Arc<SequenceCounters>>>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds counters from a stored snapshot; no-op if already tracked.
    pub fn register(&self, sequence_id: Uuid, baseline: &SequenceMetrics) {
        self.counters
            .entry(sequence_id)
            .or_insert_with(|| Arc::new(SequenceCounters::from_snapshot(baseline)));
    }

    fn get(&self, sequence_id: Uuid) -> Arc<SequenceCounters> {
        self.counters.entry(sequence_id).or_default().clone()
    }

    pub fn on_assigned(&self, sequence_id: Uuid) {
        let c = self.get(sequence_id);
        c.total_leads.fetch_add(1, Ordering::AcqRel);
        c.active.fetch_add(1, Ordering::AcqRel);
        metrics::counter!("nurture.assignments.created").increment(1);
    }

    pub fn on_completed(&self, sequence_id: Uuid) {
        let c = self.get(sequence_id);
        c.completed.fetch_add(1, Ordering::AcqRel);
        c.leave_active();
        metrics::counter!("nurture.assignments.completed").increment(1);
    }

    pub fn on_aborted(&self, sequence_id: Uuid, reason: &AbortReason) {
        let c = self.get(sequence_id);
        c.aborted.fetch_add(1, Ordering::AcqRel);
        if matches!(
            reason,
            AbortReason::RetriesExhausted { .. } | AbortReason::Failed { .. }
        ) {
            c.failed.fetch_add(1, Ordering::AcqRel);
            metrics::counter!("nurture.assignments.failed").increment(1);
        }
        c.leave_active();
        metrics::counter!("nurture.assignments.aborted").increment(1);
    }

    pub fn on_sent(&self, sequence_id: Uuid) {
        self.get(sequence_id)
            .messages_sent
            .fetch_add(1, Ordering::AcqRel);
        metrics::counter!("nurture.steps.sent").increment(1);
    }

    pub fn on_skipped(&self, sequence_id: Uuid) {
        self.get(sequence_id)
            .steps_skipped
            .fetch_add(1, Ordering::AcqRel);
        metrics::counter!("nurture.steps.skipped").increment(1);
    }

    pub fn on_stalled(&self, sequence_id: Uuid) {
        self.get(sequence_id)
            .stalled_steps
            .fetch_add(1, Ordering::AcqRel);
        metrics::counter!("nurture.steps.stalled").increment(1);
    }

    pub fn on_response(&self, sequence_id: Uuid, elapsed: Duration) {
        let c = self.get(sequence_id);
        c.responded.fetch_add(1, Ordering::AcqRel);
        c.response_secs_total
            .fetch_add(elapsed.num_seconds().max(0) as u64, Ordering::AcqRel);
        metrics::counter!("nurture.leads.responded").increment(1);
    }

    pub fn on_converted(&self, sequence_id: Uuid) {
        self.get(sequence_id)
            .converted
            .fetch_add(1, Ordering::AcqRel);
        metrics::counter!("nurture.leads.converted").increment(1);
    }

    /// Overwrites the active gauge with a count taken from the store.
    pub fn reset_active(&self, sequence_id: Uuid, active: u64) {
        self.get(sequence_id).active.store(active, Ordering::Release);
    }

    pub fn snapshot(&self, sequence_id: Uuid) -> SequenceMetrics {
        let Some(c) = self.counters.get(&sequence_id).map(|r| r.clone()) else {
            return SequenceMetrics::default();
        };

        let total = c.total_leads.load(Ordering::Acquire);
        let responded = c.responded.load(Ordering::Acquire);
        let converted = c.converted.load(Ordering::Acquire);
        let pct = |n: u64| {
            if total > 0 {
                n as f64 * 100.0 / total as f64
            } else {
                0.0
            }
        };
        let average_response_time = if responded > 0 {
            c.response_secs_total.load(Ordering::Acquire) as f64 / responded as f64 / 3600.0
        } else {
            0.0
        };

        SequenceMetrics {
            total_leads: total,
            active_sequences: c.active.load(Ordering::Acquire),
            completed_sequences: c.completed.load(Ordering::Acquire),
            aborted_sequences: c.aborted.load(Ordering::Acquire),
            converted_leads: converted,
            responded_leads: responded,
            messages_sent: c.messages_sent.load(Ordering::Acquire),
            steps_skipped: c.steps_skipped.load(Ordering::Acquire),
            stalled_steps: c.stalled_steps.load(Ordering::Acquire),
            failed_sequences: c.failed.load(Ordering::Acquire),
            response_rate: pct(responded),
            conversion_rate: pct(converted),
            average_response_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nurture_core::types::LeadStatus;

    #[test]
    fn test_lifecycle_counters() {
        let metrics = MetricsAggregator::new();
        let seq = Uuid::new_v4();

        metrics.on_assigned(seq);
        metrics.on_assigned(seq);
        metrics.on_sent(seq);
        metrics.on_skipped(seq);
        metrics.on_completed(seq);
        metrics.on_aborted(
            seq,
            &AbortReason::LeadTerminalStatus {
                status: LeadStatus::Lost,
            },
        );

        let snap = metrics.snapshot(seq);
        assert_eq!(snap.total_leads, 2);
        assert_eq!(snap.active_sequences, 0);
        assert_eq!(snap.completed_sequences, 1);
        assert_eq!(snap.aborted_sequences, 1);
        assert_eq!(snap.failed_sequences, 0);
        assert_eq!(snap.messages_sent, 1);
        assert_eq!(snap.steps_skipped, 1);
    }

    #[test]
    fn test_rates_and_response_time() {
        let metrics = MetricsAggregator::new();
        let seq = Uuid::new_v4();
        for _ in 0..4 {
            metrics.on_assigned(seq);
        }
        metrics.on_response(seq, Duration::hours(2));
        metrics.on_response(seq, Duration::hours(4));
        metrics.on_converted(seq);

        let snap = metrics.snapshot(seq);
        assert_eq!(snap.response_rate, 50.0);
        assert_eq!(snap.conversion_rate, 25.0);
        assert_eq!(snap.average_response_time, 3.0);
    }

    #[test]
    fn test_register_seeds_baseline_once() {
        let metrics = MetricsAggregator::new();
        let seq = Uuid::new_v4();
        let baseline = SequenceMetrics {
            total_leads: 15,
            active_sequences: 8,
            completed_sequences: 5,
            ..Default::default()
        };
        metrics.register(seq, &baseline);
        metrics.on_completed(seq);
        metrics.register(seq, &SequenceMetrics::default());

        let snap = metrics.snapshot(seq);
        assert_eq!(snap.total_leads, 15);
        assert_eq!(snap.active_sequences, 7);
        assert_eq!(snap.completed_sequences, 6);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let metrics = MetricsAggregator::new();
        let seq = Uuid::new_v4();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.on_assigned(seq);
                        metrics.on_completed(seq);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = metrics.snapshot(seq);
        assert_eq!(snap.total_leads, 8000);
        assert_eq!(snap.completed_sequences, 8000);
        assert_eq!(snap.active_sequences, 0);
    }

    #[test]
    fn test_rate_only_baseline_keeps_rates() {
        let metrics = MetricsAggregator::new();
        let seq = Uuid::new_v4();
        metrics.register(
            seq,
            &SequenceMetrics {
                total_leads: 25,
                response_rate: 24.0,
                conversion_rate: 12.0,
                average_response_time: 24.0,
                ..Default::default()
            },
        );

        let snap = metrics.snapshot(seq);
        assert_eq!(snap.responded_leads, 6);
        assert_eq!(snap.converted_leads, 3);
        assert_eq!(snap.response_rate, 24.0);
        assert_eq!(snap.conversion_rate, 12.0);
        assert_eq!(snap.average_response_time, 24.0);
    }

    #[test]
    fn test_unknown_sequence_snapshot_is_empty() {
        let metrics = MetricsAggregator::new();
        assert_eq!(metrics.snapshot(Uuid::new_v4()), SequenceMetrics::default());
    }
}
