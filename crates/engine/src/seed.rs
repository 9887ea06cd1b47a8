//! Demo data: three sequences, a handful of leads and their coaches.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use nurture_core::error::NurtureResult;
use nurture_core::types::{
    BusinessType, Channel, Interaction, InteractionOutcome, InteractionType, Lead, LeadSource,
    LeadStatus, UserProfile,
};

use crate::condition::{ConditionOperator, ConditionValue, StepCondition, TriggerCondition};
use crate::types::{
    Delay, PersonalizationRule, PersonalizationSource, Sequence, SequenceMetrics, SequenceStatus,
    Step, Template, Trigger, TriggerEvent,
};

fn name_rule(default: &str) -> Vec<PersonalizationRule> {
    vec![PersonalizationRule {
        variable: "name".to_string(),
        source: PersonalizationSource::LeadData,
        field: "name".to_string(),
        default_value: Some(default.to_string()),
    }]
}

fn template(id: &str, subject: Option<&str>, body: &str, default_name: &str) -> Template {
    Template {
        id: id.to_string(),
        subject: subject.map(str::to_string),
        body: body.to_string(),
        personalizations: name_rule(default_name),
    }
}

/// The three demo sequences, with their historical metrics.
pub fn demo_sequences(now: DateTime<Utc>) -> NurtureResult<Vec<Sequence>> {
    // ---- 1. Instagram follow-up (trainer) ----
    let instagram = Sequence {
        id: Uuid::new_v4(),
        name: "Seguimiento Instagram - Entrenador".to_string(),
        description: "Secuencia automática para leads nuevos de Instagram".to_string(),
        business_type: BusinessType::Trainer,
        steps: vec![
            Step {
                id: Uuid::new_v4(),
                order: 1,
                name: "Mensaje de bienvenida".to_string(),
                channel: Channel::Whatsapp,
                template: template(
                    "t1",
                    Some("¡Hola {{name}}! 👋"),
                    "Hola {{name}}, vi que te interesó nuestro contenido en Instagram. ¿Te gustaría conocer más sobre nuestros planes de entrenamiento personalizado?",
                    "amigo/a",
                ),
                delay: Delay::hours(1),
                conditions: vec![],
            },
            Step {
                id: Uuid::new_v4(),
                order: 2,
                name: "Email informativo".to_string(),
                channel: Channel::Email,
                template: template(
                    "t2",
                    Some("Información sobre nuestros planes"),
                    "{{name}}, aquí tienes información detallada sobre nuestros planes. ¿Tienes alguna pregunta?",
                    "amigo/a",
                ),
                delay: Delay::days(2),
                conditions: vec![StepCondition::NoResponse { value: true }],
            },
            Step {
                id: Uuid::new_v4(),
                order: 3,
                name: "Llamada de seguimiento".to_string(),
                channel: Channel::Phone,
                template: template("t3", None, "Llamada programada para {{name}}", "el lead"),
                delay: Delay::days(3),
                conditions: vec![StepCondition::NoResponse { value: true }],
            },
        ],
        triggers: vec![Trigger {
            event: TriggerEvent::LeadCreated,
            conditions: vec![
                TriggerCondition::new(
                    "source",
                    ConditionOperator::Equals,
                    ConditionValue::Text("instagram".to_string()),
                )?,
                TriggerCondition::new(
                    "status",
                    ConditionOperator::Equals,
                    ConditionValue::Text("new".to_string()),
                )?,
            ],
        }],
        status: SequenceStatus::Active,
        metrics: SequenceMetrics {
            total_leads: 15,
            active_sequences: 8,
            completed_sequences: 5,
            response_rate: 33.3,
            conversion_rate: 20.0,
            average_response_time: 12.5,
            ..Default::default()
        },
        created_at: now - Duration::days(30),
        updated_at: now,
        deleted_at: None,
    };

    // ---- 2. Cold lead reactivation (gym) ----
    let reactivation = Sequence {
        id: Uuid::new_v4(),
        name: "Nurturing Leads Fríos - Gimnasio".to_string(),
        description: "Reactivación de leads sin respuesta".to_string(),
        business_type: BusinessType::Gym,
        steps: vec![Step {
            id: Uuid::new_v4(),
            order: 1,
            name: "Email de reactivación".to_string(),
            channel: Channel::Email,
            template: template(
                "t4",
                Some("¿Aún interesado en unirte?"),
                "Hola {{name}}, vimos que te interesaste en nuestro gimnasio. Tenemos una oferta especial que podría interesarte.",
                "amigo/a",
            ),
            delay: Delay::days(7),
            conditions: vec![],
        }],
        triggers: vec![Trigger {
            event: TriggerEvent::NoResponseDays,
            conditions: vec![TriggerCondition::new(
                "days",
                ConditionOperator::GreaterThan,
                ConditionValue::Number(7.0),
            )?],
        }],
        status: SequenceStatus::Active,
        metrics: SequenceMetrics {
            total_leads: 25,
            active_sequences: 12,
            completed_sequences: 8,
            response_rate: 25.0,
            conversion_rate: 12.0,
            average_response_time: 24.0,
            ..Default::default()
        },
        created_at: now - Duration::days(20),
        updated_at: now,
        deleted_at: None,
    };

    // ---- 3. High-score follow-up (trainer, paused) ----
    let high_priority = Sequence {
        id: Uuid::new_v4(),
        name: "Seguimiento Alta Prioridad".to_string(),
        description: "Para leads con score alto".to_string(),
        business_type: BusinessType::Trainer,
        steps: vec![Step {
            id: Uuid::new_v4(),
            order: 1,
            name: "WhatsApp inmediato".to_string(),
            channel: Channel::Whatsapp,
            template: template(
                "t5",
                None,
                "¡Hola {{name}}! Vi tu interés y quería contactarte personalmente. ¿Cuándo te viene bien para una consulta?",
                "amigo/a",
            ),
            delay: Delay::minutes(30),
            conditions: vec![],
        }],
        triggers: vec![Trigger {
            event: TriggerEvent::ScoreThreshold,
            conditions: vec![TriggerCondition::new(
                "score",
                ConditionOperator::GreaterThan,
                ConditionValue::Number(75.0),
            )?],
        }],
        status: SequenceStatus::Paused,
        metrics: SequenceMetrics {
            total_leads: 10,
            active_sequences: 3,
            completed_sequences: 5,
            response_rate: 60.0,
            conversion_rate: 40.0,
            average_response_time: 2.0,
            ..Default::default()
        },
        created_at: now - Duration::days(10),
        updated_at: now,
        deleted_at: None,
    };

    Ok(vec![instagram, reactivation, high_priority])
}

/// The coach and the gym account the demo leads are assigned to.
pub fn demo_users() -> Vec<UserProfile> {
    vec![
        UserProfile {
            id: "1".to_string(),
            name: "Entrenador Demo".to_string(),
            email: Some("entrenador@example.com".to_string()),
            phone: Some("+34600000001".to_string()),
        },
        UserProfile {
            id: "2".to_string(),
            name: "Gimnasio Demo".to_string(),
            email: Some("gimnasio@example.com".to_string()),
            phone: Some("+34600000002".to_string()),
        },
    ]
}

#[allow(clippy::too_many_arguments)]
fn demo_lead(
    id: &str,
    name: &str,
    email: &str,
    source: LeadSource,
    business_type: BusinessType,
    status: LeadStatus,
    score: u32,
    created_at: DateTime<Utc>,
) -> Lead {
    let mut lead = Lead::new(id, name, source, business_type);
    lead.email = Some(email.to_string());
    lead.status = status;
    lead.score = score;
    lead.created_at = created_at;
    lead.assigned_to = Some(match business_type {
        BusinessType::Trainer => "1".to_string(),
        BusinessType::Gym => "2".to_string(),
    });
    lead
}

/// A small pipeline covering new, stale, replied and converted leads.
pub fn demo_leads(now: DateTime<Utc>) -> Vec<Lead> {
    let yesterday = now - Duration::days(1);

    let mut maria = demo_lead(
        "1",
        "María González",
        "maria.gonzalez@example.com",
        LeadSource::Instagram,
        BusinessType::Trainer,
        LeadStatus::Qualified,
        85,
        now - Duration::days(7),
    );
    maria.stage = "oportunidad".to_string();
    maria.interactions.push(Interaction {
        id: Uuid::new_v4(),
        interaction_type: InteractionType::WhatsappReplied,
        channel: Channel::Whatsapp,
        date: yesterday,
        description: "Respondió preguntando por disponibilidad".to_string(),
        outcome: InteractionOutcome::Positive,
        user_id: "1".to_string(),
        metadata: None,
    });
    maria.last_contact_date = Some(yesterday);

    let laura = demo_lead(
        "3",
        "Laura Sánchez",
        "laura.sanchez@example.com",
        LeadSource::Instagram,
        BusinessType::Trainer,
        LeadStatus::New,
        50,
        yesterday,
    );

    let mut pablo = demo_lead(
        "8",
        "Pablo Moreno",
        "pablo.moreno@example.com",
        LeadSource::Website,
        BusinessType::Gym,
        LeadStatus::Contacted,
        40,
        now - Duration::days(20),
    );
    pablo.stage = "interes".to_string();
    pablo.last_contact_date = Some(now - Duration::days(10));

    let mut roberto = demo_lead(
        "11",
        "Roberto Silva",
        "roberto.silva@example.com",
        LeadSource::Other,
        BusinessType::Gym,
        LeadStatus::Converted,
        88,
        now - Duration::days(7),
    );
    roberto.stage = "cierre".to_string();

    vec![maria, laura, pablo, roberto]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{ConditionEvaluator, EvaluationContext};

    #[test]
    fn test_demo_sequences_are_valid() {
        for mut seq in demo_sequences(Utc::now()).unwrap() {
            seq.normalize().unwrap();
        }
    }

    #[test]
    fn test_demo_triggers_match_demo_leads() {
        let now = Utc::now();
        let sequences = demo_sequences(now).unwrap();
        let leads = demo_leads(now);
        let evaluator = ConditionEvaluator::new();
        let ctx = EvaluationContext::new(now);

        let laura = leads.iter().find(|l| l.id == "3").unwrap();
        assert!(evaluator.evaluate_all(&sequences[0].triggers[0].conditions, laura, &ctx));

        let pablo = leads.iter().find(|l| l.id == "8").unwrap();
        assert!(evaluator.evaluate_all(&sequences[1].triggers[0].conditions, pablo, &ctx));

        let maria = leads.iter().find(|l| l.id == "1").unwrap();
        assert!(evaluator.evaluate_all(&sequences[2].triggers[0].conditions, maria, &ctx));
        assert!(!evaluator.evaluate_all(&sequences[0].triggers[0].conditions, maria, &ctx));
    }
}
