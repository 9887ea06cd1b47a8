//! Runs one due step for one assignment.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info};
use uuid::Uuid;

use nurture_core::error::{NurtureError, NurtureResult};
use nurture_core::event_bus::NurtureEventType;
use nurture_core::types::{
    Interaction, InteractionMetadata, InteractionOutcome, Lead, LeadStatus,
};

use crate::clock::Clock;
use crate::condition::{ConditionEvaluator, EvaluationContext};
use crate::lead_store::{LeadStore, UserDirectory};
use crate::metrics::MetricsAggregator;
use crate::personalizer::{RenderedMessage, TemplatePersonalizer};
use crate::registry::SequenceRegistry;
use crate::scheduler::{Advance, AssignmentScheduler, Retry};
use crate::types::{AbortReason, Assignment, AssignmentKey, SequenceStatus, Step};

const DESCRIPTION_PREVIEW_CHARS: usize = 100;

/// Result of one `execute` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing to do: the assignment is gone, not due yet, or leased by
    /// another worker.
    Stale,
    Sent { step_index: usize, next: Advance },
    Skipped { step_index: usize, next: Advance },
    Aborted(AbortReason),
    Retrying(Retry),
}

pub struct StepExecutor {
    scheduler: Arc<AssignmentScheduler>,
    sequences: Arc<SequenceRegistry>,
    leads: Arc<dyn LeadStore>,
    users: Arc<dyn UserDirectory>,
    metrics: MetricsAggregator,
    clock: Arc<dyn Clock>,
    personalizer: TemplatePersonalizer,
    evaluator: ConditionEvaluator,
    no_response_window: Duration,
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor")
            .field("no_response_window", &self.no_response_window)
            .finish()
    }
}

impl StepExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scheduler: Arc<AssignmentScheduler>,
        sequences: Arc<SequenceRegistry>,
        leads: Arc<dyn LeadStore>,
        users: Arc<dyn UserDirectory>,
        metrics: MetricsAggregator,
        clock: Arc<dyn Clock>,
        no_response_window: Duration,
    ) -> Self {
        Self {
            scheduler,
            sequences,
            leads,
            users,
            metrics,
            clock,
            personalizer: TemplatePersonalizer::new(),
            evaluator: ConditionEvaluator::new(),
            no_response_window,
        }
    }

    /// Executes the current step of the assignment under `key`, if it is
    /// still live and due. Holds the key lock for the whole step; a key
    /// leased by another worker is left to that worker.
    pub async fn execute(&self, key: &AssignmentKey) -> NurtureResult<StepOutcome> {
        let Some(guard) = self.scheduler.try_lock(key).await? else {
            return Ok(StepOutcome::Stale);
        };
        let result = self.execute_locked(key).await;
        guard.release().await;
        result
    }

    async fn execute_locked(&self, key: &AssignmentKey) -> NurtureResult<StepOutcome> {
        let now = self.clock.now();

        let Some(mut assignment) = self.scheduler.get(key).await? else {
            debug!(assignment = %key, "Assignment no longer live");
            return Ok(StepOutcome::Stale);
        };
        if !assignment.is_due(now) {
            debug!(assignment = %key, next_execution_time = %assignment.next_execution_time, "Assignment not due");
            return Ok(StepOutcome::Stale);
        }

        let responded = assignment.responded;
        match self.run_step(&mut assignment, now).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_transient() => {
                // The response was not counted; leave it for the retry.
                assignment.responded = responded;
                let retry = self.scheduler.retry_later(&mut assignment, &e).await?;
                Ok(StepOutcome::Retrying(retry))
            }
            Err(e) => {
                error!(
                    assignment = %key,
                    step_index = assignment.current_step_index,
                    error = %e,
                    "Step failed"
                );
                let reason = AbortReason::Failed {
                    message: e.to_string(),
                };
                self.scheduler.abort(&mut assignment, reason.clone()).await?;
                Ok(StepOutcome::Aborted(reason))
            }
        }
    }

    async fn run_step(
        &self,
        assignment: &mut Assignment,
        now: DateTime<Utc>,
    ) -> NurtureResult<StepOutcome> {
        let sequence_id = assignment.key.sequence_id;

        match self.sequences.get(sequence_id) {
            Some(s) if s.is_deleted() => {
                return self.abort(assignment, AbortReason::SequenceNotFound).await
            }
            Some(s) if s.status == SequenceStatus::Paused => {
                return self.abort(assignment, AbortReason::SequencePaused).await
            }
            Some(_) => {}
            None => return self.abort(assignment, AbortReason::SequenceNotFound).await,
        }

        let Some(lead) = self.leads.get_lead(&assignment.key.lead_id).await? else {
            return self.abort(assignment, AbortReason::LeadNotFound).await;
        };

        if lead.status.is_terminal() {
            if lead.status == LeadStatus::Converted {
                self.metrics.on_converted(sequence_id);
            }
            let reason = AbortReason::LeadTerminalStatus {
                status: lead.status,
            };
            return self.abort(assignment, reason).await;
        }

        let response = self.first_response(assignment, &lead);
        if response.is_some() {
            assignment.responded = true;
        }

        let step_index = assignment.current_step_index;
        let step = assignment.current_step().cloned().ok_or_else(|| {
            NurtureError::Internal(anyhow::anyhow!(
                "step index {} out of range for assignment {}",
                step_index,
                assignment.key
            ))
        })?;

        let ctx = EvaluationContext::new(now).with_window(self.no_response_window);
        let outcome = if self.evaluator.evaluate_all(&step.conditions, &lead, &ctx) {
            self.deliver(assignment, &step, &lead, now).await?;
            let next = self.scheduler.advance(assignment, now).await?;
            StepOutcome::Sent { step_index, next }
        } else {
            let next = self.scheduler.advance(assignment, now).await?;
            self.metrics.on_skipped(sequence_id);
            self.scheduler.emit(
                NurtureEventType::StepSkipped,
                assignment,
                Some(step.id),
                None,
            );
            info!(
                sequence_id = %sequence_id,
                lead_id = %lead.id,
                step = %step.name,
                step_index,
                "Step conditions not met, skipped"
            );
            StepOutcome::Skipped { step_index, next }
        };

        // Counted only once the flag is durable.
        if let Some(elapsed) = response {
            self.metrics.on_response(sequence_id, elapsed);
        }
        Ok(outcome)
    }

    /// Renders the step and appends its interaction, unless a previous
    /// attempt of this execution already recorded it.
    async fn deliver(
        &self,
        assignment: &Assignment,
        step: &Step,
        lead: &Lead,
        now: DateTime<Utc>,
    ) -> NurtureResult<()> {
        if lead.has_automated_interaction(assignment.id, step.id) {
            debug!(
                execution_id = %assignment.id,
                step_id = %step.id,
                "Interaction already recorded, not sending again"
            );
            return Ok(());
        }

        let user = lead
            .assigned_to
            .as_deref()
            .and_then(|id| self.users.get_user(id));
        let message = self.personalizer.render(
            &step.template,
            lead,
            user.as_ref(),
            Some(&assignment.custom_values),
        );

        let interaction = build_interaction(assignment, step, lead, &message, now);
        self.leads.append_interaction(&lead.id, interaction).await?;

        self.metrics.on_sent(assignment.key.sequence_id);
        self.scheduler.emit(
            NurtureEventType::StepSent,
            assignment,
            Some(step.id),
            Some(step.channel.as_str().to_string()),
        );
        info!(
            sequence_id = %assignment.key.sequence_id,
            lead_id = %lead.id,
            step = %step.name,
            channel = step.channel.as_str(),
            "Step sent"
        );
        Ok(())
    }

    /// Time to the lead's first response since enrollment, if it has not
    /// been counted for this assignment yet.
    fn first_response(&self, assignment: &Assignment, lead: &Lead) -> Option<Duration> {
        if assignment.responded {
            return None;
        }
        lead.interactions
            .iter()
            .filter(|i| i.interaction_type.is_response() && i.date >= assignment.assigned_at)
            .map(|i| i.date)
            .min()
            .map(|date| date - assignment.assigned_at)
    }

    async fn abort(
        &self,
        assignment: &mut Assignment,
        reason: AbortReason,
    ) -> NurtureResult<StepOutcome> {
        self.scheduler.abort(assignment, reason.clone()).await?;
        Ok(StepOutcome::Aborted(reason))
    }
}

fn build_interaction(
    assignment: &Assignment,
    step: &Step,
    lead: &Lead,
    message: &RenderedMessage,
    now: DateTime<Utc>,
) -> Interaction {
    let preview: String = message.body.chars().take(DESCRIPTION_PREVIEW_CHARS).collect();
    Interaction {
        id: Uuid::new_v4(),
        interaction_type: step.channel.sent_interaction(),
        channel: step.channel,
        date: now,
        description: format!("{}: {}...", step.name, preview),
        outcome: InteractionOutcome::Neutral,
        user_id: lead
            .assigned_to
            .clone()
            .unwrap_or_else(|| "system".to_string()),
        metadata: Some(InteractionMetadata {
            sequence_id: assignment.key.sequence_id,
            step_id: step.id,
            execution_id: assignment.id,
            automated: true,
        }),
    }
}
