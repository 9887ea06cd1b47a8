use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nurture_core::error::{NurtureError, NurtureResult};
use nurture_core::types::{BusinessType, Channel, LeadStatus};

use crate::condition::{StepCondition, TriggerCondition};

/// A nurture sequence: ordered communication steps plus the triggers that
/// decide which leads enter it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub business_type: BusinessType,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    pub status: SequenceStatus,
    #[serde(default)]
    pub metrics: SequenceMetrics,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStatus {
    Draft,
    Active,
    Paused,
}

impl Sequence {
    /// Checks structural invariants and sorts steps by `order`.
    pub fn normalize(&mut self) -> NurtureResult<()> {
        if self.steps.is_empty() {
            return Err(NurtureError::InvalidSequence(format!(
                "sequence {} has no steps",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.order == 0 {
                return Err(NurtureError::InvalidSequence(format!(
                    "step {} in sequence {} has order 0 (orders are 1-based)",
                    step.id, self.id
                )));
            }
            if step.delay.as_millis() > Delay::MAX_MILLIS {
                return Err(NurtureError::InvalidSequence(format!(
                    "step {} in sequence {} waits longer than {} days",
                    step.id,
                    self.id,
                    Delay::MAX_MILLIS / 86_400_000
                )));
            }
            if !seen.insert(step.order) {
                return Err(NurtureError::InvalidSequence(format!(
                    "duplicate step order {} in sequence {}",
                    step.order, self.id
                )));
            }
        }

        self.steps.sort_by_key(|s| s.order);
        Ok(())
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether trigger matching may enroll new leads.
    pub fn accepts_new_leads(&self) -> bool {
        self.status == SequenceStatus::Active && !self.is_deleted()
    }
}

/// One channel + template + delay unit within a sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub order: u32,
    pub name: String,
    pub channel: Channel,
    pub template: Template,
    pub delay: Delay,
    #[serde(default)]
    pub conditions: Vec<StepCondition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    Minutes,
    Hours,
    Days,
}

/// Wait before a step fires, relative to the previous resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delay {
    pub value: u32,
    pub unit: DelayUnit,
}

impl Delay {
    /// Longest wait a step may declare (ten years).
    pub const MAX_MILLIS: i64 = 3_650 * 86_400_000;

    pub fn minutes(value: u32) -> Self {
        Self {
            value,
            unit: DelayUnit::Minutes,
        }
    }

    pub fn hours(value: u32) -> Self {
        Self {
            value,
            unit: DelayUnit::Hours,
        }
    }

    pub fn days(value: u32) -> Self {
        Self {
            value,
            unit: DelayUnit::Days,
        }
    }

    pub fn as_millis(&self) -> i64 {
        let multiplier: i64 = match self.unit {
            DelayUnit::Minutes => 60_000,
            DelayUnit::Hours => 3_600_000,
            DelayUnit::Days => 86_400_000,
        };
        i64::from(self.value) * multiplier
    }

    pub fn as_duration(&self) -> Duration {
        Duration::milliseconds(self.as_millis())
    }
}

/// Business events that can enroll a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    LeadCreated,
    LeadStatusChanged,
    NoResponseDays,
    ScoreThreshold,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub event: TriggerEvent,
    #[serde(default)]
    pub conditions: Vec<TriggerCondition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub personalizations: Vec<PersonalizationRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonalizationSource {
    LeadData,
    UserProfile,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalizationRule {
    pub variable: String,
    pub source: PersonalizationSource,
    pub field: String,
    #[serde(default)]
    pub default_value: Option<String>,
}

/// Per-sequence counters, as reported to callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceMetrics {
    pub total_leads: u64,
    pub active_sequences: u64,
    pub completed_sequences: u64,
    #[serde(default)]
    pub aborted_sequences: u64,
    #[serde(default)]
    pub converted_leads: u64,
    #[serde(default)]
    pub responded_leads: u64,
    #[serde(default)]
    pub messages_sent: u64,
    #[serde(default)]
    pub steps_skipped: u64,
    #[serde(default)]
    pub stalled_steps: u64,
    #[serde(default)]
    pub failed_sequences: u64,
    /// Percentage of enrolled leads that responded.
    pub response_rate: f64,
    /// Percentage of enrolled leads that converted.
    pub conversion_rate: f64,
    /// Mean hours from enrollment to first response.
    pub average_response_time: f64,
}

/// Identity of a live assignment: one per (sequence, lead).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssignmentKey {
    pub sequence_id: Uuid,
    pub lead_id: String,
}

impl AssignmentKey {
    pub fn new(sequence_id: Uuid, lead_id: impl Into<String>) -> Self {
        Self {
            sequence_id,
            lead_id: lead_id.into(),
        }
    }
}

impl fmt::Display for AssignmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sequence_id, self.lead_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentState {
    Scheduled,
    Completed,
    Aborted,
}

/// Why an assignment left the live set without completing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum AbortReason {
    LeadNotFound,
    LeadTerminalStatus { status: LeadStatus },
    SequenceNotFound,
    SequencePaused,
    RetriesExhausted { attempts: u32 },
    Failed { message: String },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::LeadNotFound => write!(f, "lead not found"),
            AbortReason::LeadTerminalStatus { status } => {
                write!(f, "lead status is {}", status.as_str())
            }
            AbortReason::SequenceNotFound => write!(f, "sequence not found"),
            AbortReason::SequencePaused => write!(f, "sequence paused"),
            AbortReason::RetriesExhausted { attempts } => {
                write!(f, "retries exhausted after {attempts} attempts")
            }
            AbortReason::Failed { message } => write!(f, "failed: {message}"),
        }
    }
}

/// Runtime record of one lead's progress through one sequence.
///
/// The step list is snapshotted at assignment time, so later edits to the
/// sequence never change delays or templates of an in-flight execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Uuid,
    pub key: AssignmentKey,
    pub steps: Vec<Step>,
    pub current_step_index: usize,
    pub next_execution_time: DateTime<Utc>,
    pub state: AssignmentState,
    /// Transient failures on the current step.
    #[serde(default)]
    pub attempts: u32,
    pub assigned_at: DateTime<Utc>,
    #[serde(default)]
    pub responded: bool,
    #[serde(default)]
    pub custom_values: HashMap<String, String>,
}

impl Assignment {
    pub fn current_step(&self) -> Option<&Step> {
        self.steps.get(self.current_step_index)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == AssignmentState::Scheduled && self.next_execution_time <= now
    }

    pub fn is_last_step(&self) -> bool {
        self.current_step_index + 1 >= self.steps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(order: u32) -> Step {
        Step {
            id: Uuid::new_v4(),
            order,
            name: format!("step {order}"),
            channel: Channel::Email,
            template: Template {
                id: "t".into(),
                subject: None,
                body: "hi".into(),
                personalizations: vec![],
            },
            delay: Delay::minutes(0),
            conditions: vec![],
        }
    }

    fn sequence(steps: Vec<Step>) -> Sequence {
        let now = Utc::now();
        Sequence {
            id: Uuid::new_v4(),
            name: "s".into(),
            description: String::new(),
            business_type: BusinessType::Gym,
            steps,
            triggers: vec![],
            status: SequenceStatus::Active,
            metrics: SequenceMetrics::default(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn test_delay_conversion() {
        assert_eq!(Delay::minutes(5).as_millis(), 300_000);
        assert_eq!(Delay::hours(1).as_millis(), 3_600_000);
        assert_eq!(Delay::days(2).as_millis(), 172_800_000);
        assert_eq!(Delay::days(2).as_duration(), Duration::milliseconds(172_800_000));
        assert_eq!(Delay::minutes(0).as_millis(), 0);
    }

    #[test]
    fn test_normalize_sorts_steps() {
        let mut seq = sequence(vec![step(3), step(1), step(2)]);
        seq.normalize().unwrap();
        let orders: Vec<u32> = seq.steps.iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
    }

    #[test]
    fn test_normalize_rejects_bad_sequences() {
        assert!(matches!(
            sequence(vec![]).normalize(),
            Err(NurtureError::InvalidSequence(_))
        ));
        assert!(matches!(
            sequence(vec![step(1), step(1)]).normalize(),
            Err(NurtureError::InvalidSequence(_))
        ));
        assert!(matches!(
            sequence(vec![step(0)]).normalize(),
            Err(NurtureError::InvalidSequence(_))
        ));
    }

    #[test]
    fn test_normalize_bounds_delays() {
        let mut far = step(1);
        far.delay = Delay::days(200_000_000);
        assert!(matches!(
            sequence(vec![far]).normalize(),
            Err(NurtureError::InvalidSequence(_))
        ));

        let mut limit = step(1);
        limit.delay = Delay::days(3_650);
        assert!(sequence(vec![limit]).normalize().is_ok());
    }

    #[test]
    fn test_delay_from_json() {
        let delay: Delay = serde_json::from_str(r#"{"value": 2, "unit": "days"}"#).unwrap();
        assert_eq!(delay, Delay::days(2));
    }

    #[test]
    fn test_abort_reason_display() {
        let reason = AbortReason::LeadTerminalStatus {
            status: LeadStatus::Converted,
        };
        assert_eq!(reason.to_string(), "lead status is converted");
    }
}
