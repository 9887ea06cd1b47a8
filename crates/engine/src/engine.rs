use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use nurture_core::config::EngineConfig;
use nurture_core::error::{NurtureError, NurtureResult};
use nurture_core::event_bus::{noop_sink, EventSink};
use nurture_core::types::{BusinessType, Lead};

use crate::clock::{Clock, SystemClock};
use crate::condition::EvaluationContext;
use crate::executor::{StepExecutor, StepOutcome};
use crate::lead_store::{InMemoryUserDirectory, LeadFilter, LeadStore, UserDirectory};
use crate::metrics::MetricsAggregator;
use crate::registry::SequenceRegistry;
use crate::scheduler::{AssignmentScheduler, RetryPolicy};
use crate::seed;
use crate::store::AssignmentStore;
use crate::trigger::TriggerMatcher;
use crate::types::{
    AbortReason, Assignment, AssignmentKey, Sequence, SequenceMetrics, SequenceStatus,
    TriggerEvent,
};

/// Entry point for callers: sequence configuration, trigger handling,
/// manual assignment, metrics, and the worker loop that fires due steps.
#[derive(Clone)]
pub struct NurtureEngine {
    sequences: Arc<SequenceRegistry>,
    scheduler: Arc<AssignmentScheduler>,
    executor: Arc<StepExecutor>,
    leads: Arc<dyn LeadStore>,
    matcher: TriggerMatcher,
    metrics: MetricsAggregator,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl std::fmt::Debug for NurtureEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NurtureEngine")
            .field("sequences", &self.sequences.list(None).len())
            .field("config", &self.config)
            .finish()
    }
}

/// Wires the engine's collaborators. Only the two stores are required.
pub struct NurtureEngineBuilder {
    leads: Arc<dyn LeadStore>,
    assignments: Arc<dyn AssignmentStore>,
    users: Arc<dyn UserDirectory>,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
    config: EngineConfig,
}

impl NurtureEngineBuilder {
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attach an event sink for lifecycle events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn with_user_directory(mut self, users: Arc<dyn UserDirectory>) -> Self {
        self.users = users;
        self
    }

    pub fn build(self) -> NurtureEngine {
        let metrics = MetricsAggregator::new();
        let sequences = Arc::new(SequenceRegistry::new());
        let scheduler = Arc::new(AssignmentScheduler::new(
            self.assignments,
            metrics.clone(),
            self.event_sink,
            self.clock.clone(),
            RetryPolicy::from_config(&self.config),
            Duration::milliseconds(self.config.lease_ttl_ms as i64),
        ));
        let executor = Arc::new(StepExecutor::new(
            scheduler.clone(),
            sequences.clone(),
            self.leads.clone(),
            self.users,
            metrics.clone(),
            self.clock.clone(),
            Duration::days(self.config.no_response_window_days),
        ));

        NurtureEngine {
            sequences,
            scheduler,
            executor,
            leads: self.leads,
            matcher: TriggerMatcher::new(),
            metrics,
            clock: self.clock,
            config: self.config,
        }
    }
}

impl NurtureEngine {
    pub fn builder(
        leads: Arc<dyn LeadStore>,
        assignments: Arc<dyn AssignmentStore>,
    ) -> NurtureEngineBuilder {
        NurtureEngineBuilder {
            leads,
            assignments,
            users: Arc::new(InMemoryUserDirectory::new()),
            clock: Arc::new(SystemClock),
            event_sink: noop_sink(),
            config: EngineConfig::default(),
        }
    }

    // ─── Sequence configuration ──────────────────────────────────────────

    /// Validates and registers a sequence; its stored metrics seed the
    /// live counters.
    pub fn register_sequence(&self, sequence: Sequence) -> NurtureResult<Uuid> {
        let baseline = sequence.metrics.clone();
        let id = self.sequences.register(sequence)?;
        self.metrics.register(id, &baseline);
        Ok(id)
    }

    /// Returns the sequence with live metrics, unless it was deleted.
    pub fn get_sequence(&self, id: Uuid) -> Option<Sequence> {
        self.sequences
            .get(id)
            .filter(|s| !s.is_deleted())
            .map(|s| self.with_live_metrics(s))
    }

    pub fn list_sequences(&self, business_type: Option<BusinessType>) -> Vec<Sequence> {
        self.sequences
            .list(business_type)
            .into_iter()
            .map(|s| self.with_live_metrics(s))
            .collect()
    }

    /// Changes a sequence's status. Pausing aborts its live assignments.
    pub async fn set_sequence_status(
        &self,
        id: Uuid,
        status: SequenceStatus,
    ) -> NurtureResult<Sequence> {
        let sequence = self.sequences.set_status(id, status)?;
        info!(sequence_id = %id, ?status, "Sequence status updated");
        if status == SequenceStatus::Paused {
            self.abort_live(id, AbortReason::SequencePaused).await?;
        }
        Ok(self.with_live_metrics(sequence))
    }

    /// Active ⇄ paused; a draft becomes active.
    pub async fn toggle_sequence_status(&self, id: Uuid) -> NurtureResult<Sequence> {
        let current = self
            .get_sequence(id)
            .ok_or(NurtureError::SequenceNotFound(id))?;
        let next = match current.status {
            SequenceStatus::Active => SequenceStatus::Paused,
            SequenceStatus::Paused | SequenceStatus::Draft => SequenceStatus::Active,
        };
        self.set_sequence_status(id, next).await
    }

    /// Soft delete: the definition is kept, live assignments are aborted.
    pub async fn delete_sequence(&self, id: Uuid) -> NurtureResult<()> {
        self.sequences.mark_deleted(id)?;
        info!(sequence_id = %id, "Sequence deleted");
        self.abort_live(id, AbortReason::SequenceNotFound).await?;
        Ok(())
    }

    async fn abort_live(&self, sequence_id: Uuid, reason: AbortReason) -> NurtureResult<usize> {
        let mut aborted = 0;
        for assignment in self.scheduler.list_for_sequence(sequence_id).await? {
            if self
                .scheduler
                .abort_key(&assignment.key, reason.clone())
                .await?
            {
                aborted += 1;
            }
        }
        if aborted > 0 {
            info!(sequence_id = %sequence_id, aborted, %reason, "Aborted live assignments");
        }
        Ok(aborted)
    }

    // ─── Triggers and assignment ─────────────────────────────────────────

    /// Enrolls the lead in the first sequence whose trigger fires for
    /// `event`. Returns `None` when nothing matches or the lead is already
    /// in the matched sequence.
    pub async fn check_triggers(
        &self,
        lead: &Lead,
        event: TriggerEvent,
    ) -> NurtureResult<Option<Assignment>> {
        if lead.status.is_terminal() {
            debug!(lead_id = %lead.id, status = lead.status.as_str(), "Terminal lead, triggers ignored");
            return Ok(None);
        }

        let candidates = self.sequences.list(Some(lead.business_type));
        let ctx = self.evaluation_context();
        let Some(sequence_id) = self.matcher.select(&candidates, lead, event, &ctx) else {
            return Ok(None);
        };

        match self.assign_sequence_to_lead(sequence_id, &lead.id).await {
            Ok(assignment) => Ok(Some(assignment)),
            Err(NurtureError::AlreadyAssigned { .. }) => {
                debug!(sequence_id = %sequence_id, lead_id = %lead.id, "Lead already in sequence");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn assign_sequence_to_lead(
        &self,
        sequence_id: Uuid,
        lead_id: &str,
    ) -> NurtureResult<Assignment> {
        self.assign_sequence_to_lead_with(sequence_id, lead_id, HashMap::new())
            .await
    }

    /// Manual assignment with caller-supplied values for `custom`
    /// personalization rules.
    pub async fn assign_sequence_to_lead_with(
        &self,
        sequence_id: Uuid,
        lead_id: &str,
        custom_values: HashMap<String, String>,
    ) -> NurtureResult<Assignment> {
        let sequence = self
            .sequences
            .get(sequence_id)
            .filter(|s| !s.is_deleted())
            .ok_or(NurtureError::SequenceNotFound(sequence_id))?;
        if sequence.status == SequenceStatus::Paused {
            return Err(NurtureError::InvalidSequence(format!(
                "sequence {sequence_id} is paused"
            )));
        }
        if self.leads.get_lead(lead_id).await?.is_none() {
            return Err(NurtureError::LeadNotFound(lead_id.to_string()));
        }

        self.scheduler
            .assign(&sequence, lead_id, custom_values)
            .await
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    pub fn get_sequence_metrics(&self, sequence_id: Uuid) -> NurtureResult<SequenceMetrics> {
        self.sequences
            .get(sequence_id)
            .ok_or(NurtureError::SequenceNotFound(sequence_id))?;
        Ok(self.metrics.snapshot(sequence_id))
    }

    /// Leads that currently hold a live assignment in the sequence.
    pub async fn get_active_leads_in_sequence(&self, sequence_id: Uuid) -> NurtureResult<Vec<Lead>> {
        self.sequences
            .get(sequence_id)
            .ok_or(NurtureError::SequenceNotFound(sequence_id))?;

        let mut leads = Vec::new();
        for assignment in self.scheduler.list_for_sequence(sequence_id).await? {
            if let Some(lead) = self.leads.get_lead(&assignment.key.lead_id).await? {
                leads.push(lead);
            }
        }
        Ok(leads)
    }

    pub async fn get_assignment(
        &self,
        sequence_id: Uuid,
        lead_id: &str,
    ) -> NurtureResult<Option<Assignment>> {
        self.scheduler
            .get(&AssignmentKey::new(sequence_id, lead_id))
            .await
    }

    pub async fn active_assignments(&self, sequence_id: Uuid) -> NurtureResult<Vec<Assignment>> {
        self.scheduler.list_for_sequence(sequence_id).await
    }

    // ─── Worker ──────────────────────────────────────────────────────────

    /// Offers every non-terminal lead to the `no_response_days` triggers.
    /// Returns the number of new assignments.
    pub async fn sweep_no_response(&self) -> NurtureResult<usize> {
        let filter = LeadFilter {
            exclude_terminal: true,
            ..Default::default()
        };
        let leads = self.leads.get_leads(&filter).await?;

        let mut assigned = 0;
        for lead in &leads {
            match self.check_triggers(lead, TriggerEvent::NoResponseDays).await {
                Ok(Some(_)) => assigned += 1,
                Ok(None) => {}
                Err(e) => warn!(lead_id = %lead.id, error = %e, "No-response trigger check failed"),
            }
        }
        info!(scanned = leads.len(), assigned, "No-response sweep finished");
        Ok(assigned)
    }

    /// Executes one batch of due assignments, one task per key.
    /// Returns how many steps made progress.
    pub async fn run_due(&self) -> NurtureResult<usize> {
        let due = self.scheduler.due(self.config.due_batch_size).await?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!(count = due.len(), "Executing due assignments");

        let mut tasks = JoinSet::new();
        for assignment in due {
            let executor = self.executor.clone();
            tasks.spawn(async move {
                let result = executor.execute(&assignment.key).await;
                (assignment.key, result)
            });
        }

        let mut progressed = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(StepOutcome::Stale))) => {}
                Ok((_, Ok(_))) => progressed += 1,
                Ok((key, Err(e))) => {
                    error!(assignment = %key, error = %e, "Step execution failed")
                }
                Err(e) => error!(error = %e, "Step execution task panicked"),
            }
        }
        Ok(progressed)
    }

    /// Runs batches until nothing due is left.
    pub async fn run_until_idle(&self) -> NurtureResult<usize> {
        let mut total = 0;
        loop {
            let progressed = self.run_due().await?;
            if progressed == 0 {
                return Ok(total);
            }
            total += progressed;
        }
    }

    /// Boot-time recovery: recounts live assignments per sequence from the
    /// store and executes everything already overdue.
    pub async fn recover(&self) -> NurtureResult<usize> {
        let live = self.scheduler.all().await?;
        let mut per_sequence: HashMap<Uuid, u64> = HashMap::new();
        for assignment in &live {
            *per_sequence.entry(assignment.key.sequence_id).or_default() += 1;
        }
        for sequence in self.sequences.list(None) {
            let count = per_sequence.get(&sequence.id).copied().unwrap_or(0);
            self.metrics.reset_active(sequence.id, count);
        }
        info!(live = live.len(), sequences = per_sequence.len(), "Recovered live assignments");

        let executed = self.run_until_idle().await?;
        info!(executed, "Overdue steps executed after recovery");
        Ok(executed)
    }

    /// Poll loop: fires due steps on every tick or new-assignment wake-up
    /// until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(StdDuration::from_millis(self.config.poll_interval_ms.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(poll_interval_ms = self.config.poll_interval_ms, "Nurture worker loop started");

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.scheduler.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }

            if let Err(e) = self.run_due().await {
                error!(error = %e, "Due batch failed");
            }
        }
        info!("Nurture worker loop stopped");
    }

    /// Periodically runs `sweep_no_response` until shutdown.
    pub async fn run_sweeper(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(StdDuration::from_secs(self.config.sweep_interval_secs.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_no_response().await {
                        error!(error = %e, "No-response sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Registers the demo sequences. Returns how many were added.
    pub fn seed_demo_sequences(&self) -> NurtureResult<usize> {
        info!("Seeding demo sequences");
        let sequences = seed::demo_sequences(self.clock.now())?;
        let count = sequences.len();
        for sequence in sequences {
            self.register_sequence(sequence)?;
        }
        Ok(count)
    }

    fn evaluation_context(&self) -> EvaluationContext {
        EvaluationContext::new(self.clock.now())
            .with_window(Duration::days(self.config.no_response_window_days))
    }

    fn with_live_metrics(&self, mut sequence: Sequence) -> Sequence {
        sequence.metrics = self.metrics.snapshot(sequence.id);
        sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lead_store::InMemoryLeadStore;
    use crate::store::InMemoryAssignmentStore;
    use chrono::Utc;
    use nurture_core::types::LeadSource;

    fn engine() -> (NurtureEngine, Arc<InMemoryLeadStore>) {
        let leads = Arc::new(InMemoryLeadStore::new());
        let engine = NurtureEngine::builder(leads.clone(), Arc::new(InMemoryAssignmentStore::new()))
            .with_clock(ManualClock::new(Utc::now()))
            .build();
        (engine, leads)
    }

    #[tokio::test]
    async fn test_seed_demo_sequences() {
        let (engine, _) = engine();
        assert_eq!(engine.seed_demo_sequences().unwrap(), 3);
        assert_eq!(engine.list_sequences(Some(BusinessType::Trainer)).len(), 2);
        assert_eq!(engine.list_sequences(Some(BusinessType::Gym)).len(), 1);

        let seq = &engine.list_sequences(Some(BusinessType::Gym))[0];
        assert_eq!(seq.metrics.total_leads, 25);
        assert_eq!(seq.metrics.active_sequences, 12);
        assert_eq!(seq.metrics.completed_sequences, 8);
        assert_eq!(seq.metrics.response_rate, 24.0);
    }

    #[tokio::test]
    async fn test_toggle_cycles_status() {
        let (engine, _) = engine();
        engine.seed_demo_sequences().unwrap();
        let paused = engine
            .list_sequences(None)
            .into_iter()
            .find(|s| s.status == SequenceStatus::Paused)
            .unwrap();

        let toggled = engine.toggle_sequence_status(paused.id).await.unwrap();
        assert_eq!(toggled.status, SequenceStatus::Active);
        let toggled = engine.toggle_sequence_status(paused.id).await.unwrap();
        assert_eq!(toggled.status, SequenceStatus::Paused);
    }

    #[tokio::test]
    async fn test_assign_errors() {
        let (engine, leads) = engine();
        engine.seed_demo_sequences().unwrap();
        let seq = engine.list_sequences(Some(BusinessType::Gym))[0].id;

        assert!(matches!(
            engine.assign_sequence_to_lead(Uuid::new_v4(), "x").await,
            Err(NurtureError::SequenceNotFound(_))
        ));
        assert!(matches!(
            engine.assign_sequence_to_lead(seq, "missing").await,
            Err(NurtureError::LeadNotFound(_))
        ));

        leads.upsert(Lead::new("l1", "Ana", LeadSource::Website, BusinessType::Gym));
        engine.assign_sequence_to_lead(seq, "l1").await.unwrap();
        assert!(matches!(
            engine.assign_sequence_to_lead(seq, "l1").await,
            Err(NurtureError::AlreadyAssigned { .. })
        ));

        engine.delete_sequence(seq).await.unwrap();
        assert!(engine.get_sequence(seq).is_none());
        assert!(engine.active_assignments(seq).await.unwrap().is_empty());
        assert!(matches!(
            engine.assign_sequence_to_lead(seq, "l1").await,
            Err(NurtureError::SequenceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_register_rejects_unbounded_delay() {
        let (engine, _) = engine();
        let mut seq = seed::demo_sequences(Utc::now()).unwrap().remove(1);
        seq.steps[0].delay = crate::types::Delay::days(200_000_000);

        assert!(matches!(
            engine.register_sequence(seq.clone()),
            Err(NurtureError::InvalidSequence(_))
        ));
        assert!(engine.get_sequence(seq.id).is_none());
        assert!(matches!(
            engine.assign_sequence_to_lead(seq.id, "l1").await,
            Err(NurtureError::SequenceNotFound(_))
        ));
    }
}
