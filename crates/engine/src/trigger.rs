//! Trigger matching: which sequences should a lead enter on a business event.

use tracing::debug;
use uuid::Uuid;

use nurture_core::types::Lead;

use crate::condition::{ConditionEvaluator, EvaluationContext};
use crate::types::{Sequence, TriggerEvent};

/// Pure query over a set of sequences.
#[derive(Debug, Clone, Default)]
pub struct TriggerMatcher {
    evaluator: ConditionEvaluator,
}

impl TriggerMatcher {
    pub fn new() -> Self {
        Self {
            evaluator: ConditionEvaluator::new(),
        }
    }

    /// Ids of every sequence whose trigger fires, in the order given.
    pub fn matches(
        &self,
        sequences: &[Sequence],
        lead: &Lead,
        event: TriggerEvent,
        ctx: &EvaluationContext,
    ) -> Vec<Uuid> {
        sequences
            .iter()
            .filter(|s| self.fires(s, lead, event, ctx))
            .map(|s| s.id)
            .collect()
    }

    /// First-match-wins selection: at most one sequence per (lead, event).
    pub fn select(
        &self,
        sequences: &[Sequence],
        lead: &Lead,
        event: TriggerEvent,
        ctx: &EvaluationContext,
    ) -> Option<Uuid> {
        let selected = sequences
            .iter()
            .find(|s| self.fires(s, lead, event, ctx))
            .map(|s| s.id);
        debug!(lead_id = %lead.id, ?event, ?selected, "Trigger selection");
        selected
    }

    fn fires(
        &self,
        sequence: &Sequence,
        lead: &Lead,
        event: TriggerEvent,
        ctx: &EvaluationContext,
    ) -> bool {
        sequence.business_type == lead.business_type
            && sequence.accepts_new_leads()
            && sequence.triggers.iter().any(|t| {
                t.event == event && self.evaluator.evaluate_all(&t.conditions, lead, ctx)
            })
    }
}
