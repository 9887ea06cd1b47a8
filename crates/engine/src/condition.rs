//! Trigger and step conditions, and the pure evaluator that checks them
//! against a lead snapshot.
//!
//! Trigger conditions arrive as `{field, operator, value}` triples and are
//! resolved into closed variants when they are deserialized, so invalid
//! combinations (ordering on a text field, non-numeric thresholds, unknown
//! statuses) are rejected before a sequence is ever registered.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use nurture_core::error::NurtureError;
use nurture_core::types::{Lead, LeadSource, LeadStatus};

/// Literal operand of a trigger condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl ConditionValue {
    fn as_number(&self) -> Option<f64> {
        match self {
            ConditionValue::Number(n) => Some(*n),
            ConditionValue::Text(s) => s.trim().parse().ok(),
            ConditionValue::Bool(_) => None,
        }
    }
}

impl fmt::Display for ConditionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionValue::Bool(b) => write!(f, "{b}"),
            ConditionValue::Number(n) => write!(f, "{n}"),
            ConditionValue::Text(s) => f.write_str(s),
        }
    }
}

/// Lead attribute a trigger condition reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadField {
    Source,
    Status,
    Score,
    Stage,
    /// Days since last contact, or since creation when never contacted.
    DaysSinceContact,
    Custom(String),
}

impl LeadField {
    fn parse(name: &str) -> Result<Self, NurtureError> {
        let field = match name {
            "source" => LeadField::Source,
            "status" => LeadField::Status,
            "score" => LeadField::Score,
            "stage" => LeadField::Stage,
            "days" | "days_since_contact" | "days_since_last_contact" => {
                LeadField::DaysSinceContact
            }
            "" => {
                return Err(NurtureError::InvalidCondition(
                    "condition field must not be empty".to_string(),
                ))
            }
            other => LeadField::Custom(other.to_string()),
        };
        Ok(field)
    }

    fn name(&self) -> &str {
        match self {
            LeadField::Source => "source",
            LeadField::Status => "status",
            LeadField::Score => "score",
            LeadField::Stage => "stage",
            LeadField::DaysSinceContact => "days_since_contact",
            LeadField::Custom(name) => name,
        }
    }

    fn is_enumerated_text(&self) -> bool {
        matches!(self, LeadField::Source | LeadField::Status | LeadField::Stage)
    }

    fn resolve(&self, lead: &Lead, now: DateTime<Utc>) -> Option<FieldValue> {
        match self {
            LeadField::Source => Some(FieldValue::Text(lead.source.as_str().to_string())),
            LeadField::Status => Some(FieldValue::Text(lead.status.as_str().to_string())),
            LeadField::Score => Some(FieldValue::Number(f64::from(lead.score))),
            LeadField::Stage => Some(FieldValue::Text(lead.stage.clone())),
            LeadField::DaysSinceContact => {
                let elapsed = now.signed_duration_since(lead.last_touch());
                Some(FieldValue::Number(
                    elapsed.num_milliseconds() as f64 / 86_400_000.0,
                ))
            }
            LeadField::Custom(name) => lead
                .custom_fields
                .get(name)
                .filter(|v| !v.is_empty())
                .map(|v| FieldValue::Text(v.clone())),
        }
    }
}

/// Value of a lead field at evaluation time.
#[derive(Debug, Clone, PartialEq)]
enum FieldValue {
    Text(String),
    Number(f64),
}

impl FieldValue {
    fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(s) => s.trim().parse().ok(),
        }
    }

    fn as_text(&self) -> String {
        match self {
            FieldValue::Number(n) => n.to_string(),
            FieldValue::Text(s) => s.clone(),
        }
    }

    fn equals(&self, value: &ConditionValue) -> bool {
        match (self, value) {
            (FieldValue::Text(a), ConditionValue::Text(b)) => a == b,
            (FieldValue::Text(a), ConditionValue::Bool(b)) => *a == b.to_string(),
            (field, ConditionValue::Number(b)) => field.as_number() == Some(*b),
            (FieldValue::Number(_), _) => self.as_number() == value.as_number(),
        }
    }
}

/// Operator bound to its operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    Equals(ConditionValue),
    NotEquals(ConditionValue),
    GreaterThan(f64),
    LessThan(f64),
    Contains(String),
}

impl Comparison {
    /// Absent fields only satisfy `NotEquals`.
    fn apply(&self, field: Option<&FieldValue>) -> bool {
        let Some(field) = field else {
            return matches!(self, Comparison::NotEquals(_));
        };
        match self {
            Comparison::Equals(v) => field.equals(v),
            Comparison::NotEquals(v) => !field.equals(v),
            Comparison::GreaterThan(x) => field.as_number().is_some_and(|n| n > *x),
            Comparison::LessThan(x) => field.as_number().is_some_and(|n| n < *x),
            Comparison::Contains(s) => field.as_text().contains(s.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
}

/// Wire shape of a trigger condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTriggerCondition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: ConditionValue,
}

/// Validated trigger predicate over a lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTriggerCondition", into = "RawTriggerCondition")]
pub struct TriggerCondition {
    pub field: LeadField,
    pub comparison: Comparison,
}

impl TriggerCondition {
    pub fn new(
        field: &str,
        operator: ConditionOperator,
        value: ConditionValue,
    ) -> Result<Self, NurtureError> {
        Self::try_from(RawTriggerCondition {
            field: field.to_string(),
            operator,
            value,
        })
    }
}

impl TryFrom<RawTriggerCondition> for TriggerCondition {
    type Error = NurtureError;

    fn try_from(raw: RawTriggerCondition) -> Result<Self, Self::Error> {
        let field = LeadField::parse(&raw.field)?;
        let invalid = |msg: String| NurtureError::InvalidCondition(msg);

        let comparison = match raw.operator {
            ConditionOperator::GreaterThan | ConditionOperator::LessThan => {
                if field.is_enumerated_text() {
                    return Err(invalid(format!(
                        "field '{}' cannot be ordered",
                        field.name()
                    )));
                }
                let threshold = raw.value.as_number().ok_or_else(|| {
                    invalid(format!(
                        "{:?} on '{}' needs a numeric value, got '{}'",
                        raw.operator,
                        field.name(),
                        raw.value
                    ))
                })?;
                if raw.operator == ConditionOperator::GreaterThan {
                    Comparison::GreaterThan(threshold)
                } else {
                    Comparison::LessThan(threshold)
                }
            }
            ConditionOperator::Equals | ConditionOperator::NotEquals => {
                validate_equality_operand(&field, &raw.value)?;
                if raw.operator == ConditionOperator::Equals {
                    Comparison::Equals(raw.value)
                } else {
                    Comparison::NotEquals(raw.value)
                }
            }
            ConditionOperator::Contains => Comparison::Contains(raw.value.to_string()),
        };

        Ok(Self { field, comparison })
    }
}

fn validate_equality_operand(field: &LeadField, value: &ConditionValue) -> Result<(), NurtureError> {
    let text = match value {
        ConditionValue::Text(s) => Some(s.as_str()),
        _ => None,
    };
    let ok = match field {
        LeadField::Source => text
            .map(|s| serde_json::from_value::<LeadSource>(serde_json::Value::from(s)).is_ok())
            .unwrap_or(false),
        LeadField::Status => text
            .map(|s| serde_json::from_value::<LeadStatus>(serde_json::Value::from(s)).is_ok())
            .unwrap_or(false),
        LeadField::Score | LeadField::DaysSinceContact => value.as_number().is_some(),
        LeadField::Stage | LeadField::Custom(_) => true,
    };
    if ok {
        Ok(())
    } else {
        Err(NurtureError::InvalidCondition(format!(
            "'{}' is not a valid value for field '{}'",
            value,
            field.name()
        )))
    }
}

impl From<TriggerCondition> for RawTriggerCondition {
    fn from(condition: TriggerCondition) -> Self {
        let (operator, value) = match condition.comparison {
            Comparison::Equals(v) => (ConditionOperator::Equals, v),
            Comparison::NotEquals(v) => (ConditionOperator::NotEquals, v),
            Comparison::GreaterThan(x) => (ConditionOperator::GreaterThan, ConditionValue::Number(x)),
            Comparison::LessThan(x) => (ConditionOperator::LessThan, ConditionValue::Number(x)),
            Comparison::Contains(s) => (ConditionOperator::Contains, ConditionValue::Text(s)),
        };
        Self {
            field: condition.field.name().to_string(),
            operator,
            value,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Gate on an individual step, evaluated right before it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StepCondition {
    /// `true`: no response inside the trailing window. `false`: the inverse.
    NoResponse { value: bool },
    PreviousStepOpened {
        #[serde(default = "default_true")]
        value: bool,
    },
    PreviousStepClicked {
        #[serde(default = "default_true")]
        value: bool,
    },
    LeadStatus { value: LeadStatus },
}

/// Inputs shared by every condition in one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext {
    pub now: DateTime<Utc>,
    pub no_response_window: Duration,
}

impl EvaluationContext {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            no_response_window: Duration::days(7),
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.no_response_window = window;
        self
    }
}

/// A boolean predicate over a lead snapshot.
pub trait Predicate {
    fn evaluate(&self, lead: &Lead, ctx: &EvaluationContext) -> bool;
}

impl Predicate for TriggerCondition {
    fn evaluate(&self, lead: &Lead, ctx: &EvaluationContext) -> bool {
        let value = self.field.resolve(lead, ctx.now);
        let result = self.comparison.apply(value.as_ref());
        trace!(
            lead_id = %lead.id,
            field = self.field.name(),
            ?value,
            result,
            "Evaluated trigger condition"
        );
        result
    }
}

impl Predicate for StepCondition {
    fn evaluate(&self, lead: &Lead, ctx: &EvaluationContext) -> bool {
        let history = &lead.interactions;
        let result = match self {
            StepCondition::NoResponse { value } => {
                let window_start = ctx.now - ctx.no_response_window;
                let responded = history
                    .iter()
                    .any(|i| i.date > window_start && i.interaction_type.is_response());
                if *value {
                    !responded
                } else {
                    responded
                }
            }
            StepCondition::PreviousStepOpened { value } => {
                use nurture_core::types::InteractionType::{EmailClicked, EmailOpened};
                let opened = history
                    .iter()
                    .any(|i| matches!(i.interaction_type, EmailOpened | EmailClicked));
                opened == *value
            }
            StepCondition::PreviousStepClicked { value } => {
                use nurture_core::types::InteractionType::EmailClicked;
                let clicked = history.iter().any(|i| i.interaction_type == EmailClicked);
                clicked == *value
            }
            StepCondition::LeadStatus { value } => lead.status == *value,
        };
        trace!(lead_id = %lead.id, condition = ?self, result, "Evaluated step condition");
        result
    }
}

/// Evaluates condition lists: empty means satisfied, otherwise logical AND.
#[derive(Debug, Clone, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate_all<P: Predicate>(
        &self,
        conditions: &[P],
        lead: &Lead,
        ctx: &EvaluationContext,
    ) -> bool {
        conditions.iter().all(|c| c.evaluate(lead, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nurture_core::types::{
        BusinessType, Channel, Interaction, InteractionOutcome, InteractionType,
    };
    use uuid::Uuid;

    fn lead() -> Lead {
        let mut lead = Lead::new("l1", "Laura", LeadSource::Instagram, BusinessType::Trainer);
        lead.score = 80;
        lead.stage = "oportunidad".to_string();
        lead.custom_fields.insert("goal".into(), "weight loss".into());
        lead
    }

    fn interaction(kind: InteractionType, date: DateTime<Utc>) -> Interaction {
        Interaction {
            id: Uuid::new_v4(),
            interaction_type: kind,
            channel: Channel::Whatsapp,
            date,
            description: String::new(),
            outcome: InteractionOutcome::Positive,
            user_id: "u1".into(),
            metadata: None,
        }
    }

    fn cond(json: &str) -> TriggerCondition {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_empty_list_is_satisfied() {
        let evaluator = ConditionEvaluator::new();
        let ctx = EvaluationContext::new(Utc::now());
        let none: [TriggerCondition; 0] = [];
        assert!(evaluator.evaluate_all(&none, &lead(), &ctx));
    }

    #[test]
    fn test_trigger_field_comparisons() {
        let ctx = EvaluationContext::new(Utc::now());
        let lead = lead();

        assert!(cond(r#"{"field":"source","operator":"equals","value":"instagram"}"#).evaluate(&lead, &ctx));
        assert!(!cond(r#"{"field":"status","operator":"equals","value":"lost"}"#).evaluate(&lead, &ctx));
        assert!(cond(r#"{"field":"score","operator":"greater_than","value":75}"#).evaluate(&lead, &ctx));
        assert!(!cond(r#"{"field":"score","operator":"less_than","value":50}"#).evaluate(&lead, &ctx));
        assert!(cond(r#"{"field":"stage","operator":"contains","value":"oport"}"#).evaluate(&lead, &ctx));
        assert!(cond(r#"{"field":"goal","operator":"contains","value":"weight"}"#).evaluate(&lead, &ctx));
    }

    #[test]
    fn test_conditions_are_anded() {
        let evaluator = ConditionEvaluator::new();
        let ctx = EvaluationContext::new(Utc::now());
        let conditions = vec![
            cond(r#"{"field":"source","operator":"equals","value":"instagram"}"#),
            cond(r#"{"field":"status","operator":"equals","value":"qualified"}"#),
        ];
        assert!(!evaluator.evaluate_all(&conditions, &lead(), &ctx));
        let mut qualified = lead();
        qualified.status = LeadStatus::Qualified;
        assert!(evaluator.evaluate_all(&conditions, &qualified, &ctx));
    }

    #[test]
    fn test_unknown_field_only_matches_not_equals() {
        let ctx = EvaluationContext::new(Utc::now());
        let lead = lead();
        assert!(!cond(r#"{"field":"membership","operator":"equals","value":"gold"}"#).evaluate(&lead, &ctx));
        assert!(cond(r#"{"field":"membership","operator":"not_equals","value":"gold"}"#).evaluate(&lead, &ctx));
        assert!(!cond(r#"{"field":"membership","operator":"contains","value":"g"}"#).evaluate(&lead, &ctx));
        assert!(!cond(r#"{"field":"membership","operator":"greater_than","value":1}"#).evaluate(&lead, &ctx));
    }

    #[test]
    fn test_days_since_contact_uses_created_at_fallback() {
        let mut lead = lead();
        let now = Utc::now();
        lead.created_at = now - Duration::days(10);
        let ctx = EvaluationContext::new(now);
        let stale = cond(r#"{"field":"days","operator":"greater_than","value":7}"#);
        assert!(stale.evaluate(&lead, &ctx));

        lead.last_contact_date = Some(now - Duration::days(2));
        assert!(!stale.evaluate(&lead, &ctx));
    }

    #[test]
    fn test_invalid_conditions_rejected_at_parse_time() {
        let bad = [
            r#"{"field":"source","operator":"greater_than","value":3}"#,
            r#"{"field":"score","operator":"greater_than","value":"high"}"#,
            r#"{"field":"status","operator":"equals","value":"archived"}"#,
            r#"{"field":"source","operator":"equals","value":"carrier_pigeon"}"#,
            r#"{"field":"","operator":"equals","value":"x"}"#,
        ];
        for json in bad {
            assert!(
                serde_json::from_str::<TriggerCondition>(json).is_err(),
                "expected rejection: {json}"
            );
        }
    }

    #[test]
    fn test_trigger_condition_serializes_back_to_wire_shape() {
        let c = TriggerCondition::new(
            "score",
            ConditionOperator::GreaterThan,
            ConditionValue::Number(75.0),
        )
        .unwrap();
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["field"], "score");
        assert_eq!(json["operator"], "greater_than");
        assert_eq!(json["value"], 75.0);
    }

    #[test]
    fn test_no_response_window() {
        let now = Utc::now();
        let ctx = EvaluationContext::new(now);
        let mut lead = lead();
        let no_response = StepCondition::NoResponse { value: true };
        let has_response = StepCondition::NoResponse { value: false };

        assert!(no_response.evaluate(&lead, &ctx));
        assert!(!has_response.evaluate(&lead, &ctx));

        // Replies older than the window don't count.
        lead.interactions
            .push(interaction(InteractionType::WhatsappReplied, now - Duration::days(8)));
        assert!(no_response.evaluate(&lead, &ctx));

        // Outbound messages are not responses.
        lead.interactions
            .push(interaction(InteractionType::WhatsappSent, now - Duration::hours(1)));
        assert!(no_response.evaluate(&lead, &ctx));

        lead.interactions
            .push(interaction(InteractionType::CallReceived, now - Duration::days(1)));
        assert!(!no_response.evaluate(&lead, &ctx));
        assert!(has_response.evaluate(&lead, &ctx));
    }

    #[test]
    fn test_previous_step_engagement() {
        let ctx = EvaluationContext::new(Utc::now());
        let mut lead = lead();
        let opened: StepCondition = serde_json::from_str(r#"{"type":"previous_step_opened"}"#).unwrap();
        let clicked: StepCondition = serde_json::from_str(r#"{"type":"previous_step_clicked"}"#).unwrap();
        assert!(!opened.evaluate(&lead, &ctx));

        lead.interactions.push(interaction(
            InteractionType::EmailClicked,
            Utc::now() - Duration::days(30),
        ));
        assert!(opened.evaluate(&lead, &ctx));
        assert!(clicked.evaluate(&lead, &ctx));
    }

    #[test]
    fn test_lead_status_condition() {
        let ctx = EvaluationContext::new(Utc::now());
        let cond: StepCondition =
            serde_json::from_str(r#"{"type":"lead_status","value":"new"}"#).unwrap();
        assert!(cond.evaluate(&lead(), &ctx));
        let mut contacted = lead();
        contacted.status = LeadStatus::Contacted;
        assert!(!cond.evaluate(&contacted, &ctx));
    }
}
