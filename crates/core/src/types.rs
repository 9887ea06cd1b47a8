use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of business that owns a lead or a sequence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BusinessType {
    #[serde(alias = "entrenador")]
    Trainer,
    #[serde(alias = "gimnasio")]
    Gym,
}

/// Pipeline status of a lead, owned by the lead store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    Contacted,
    Qualified,
    Negotiation,
    Converted,
    Lost,
}

impl LeadStatus {
    /// Converted and lost leads never receive automated messages.
    pub fn is_terminal(self) -> bool {
        matches!(self, LeadStatus::Converted | LeadStatus::Lost)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LeadStatus::New => "new",
            LeadStatus::Contacted => "contacted",
            LeadStatus::Qualified => "qualified",
            LeadStatus::Negotiation => "negotiation",
            LeadStatus::Converted => "converted",
            LeadStatus::Lost => "lost",
        }
    }
}

/// Acquisition source of a lead.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LeadSource {
    Instagram,
    Facebook,
    Tiktok,
    Whatsapp,
    Website,
    Referral,
    WalkIn,
    Event,
    Other,
}

impl LeadSource {
    pub fn as_str(self) -> &'static str {
        match self {
            LeadSource::Instagram => "instagram",
            LeadSource::Facebook => "facebook",
            LeadSource::Tiktok => "tiktok",
            LeadSource::Whatsapp => "whatsapp",
            LeadSource::Website => "website",
            LeadSource::Referral => "referral",
            LeadSource::WalkIn => "walk_in",
            LeadSource::Event => "event",
            LeadSource::Other => "other",
        }
    }
}

/// Communication medium used by a step or recorded on an interaction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Whatsapp,
    Phone,
    Sms,
}

impl Channel {
    /// Interaction type recorded when an automated step goes out on this channel.
    pub fn sent_interaction(self) -> InteractionType {
        match self {
            Channel::Email => InteractionType::EmailSent,
            Channel::Whatsapp => InteractionType::WhatsappSent,
            Channel::Phone => InteractionType::CallMade,
            Channel::Sms => InteractionType::SmsSent,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Whatsapp => "whatsapp",
            Channel::Phone => "phone",
            Channel::Sms => "sms",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    EmailSent,
    EmailOpened,
    EmailClicked,
    EmailReplied,
    WhatsappSent,
    WhatsappReplied,
    CallMade,
    CallReceived,
    SmsSent,
    SmsReplied,
    Meeting,
    Note,
}

impl InteractionType {
    /// Interactions that count as the lead responding to outreach.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            InteractionType::EmailOpened
                | InteractionType::EmailReplied
                | InteractionType::WhatsappReplied
                | InteractionType::CallReceived
                | InteractionType::SmsReplied
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InteractionOutcome {
    Positive,
    Neutral,
    Negative,
}

/// Provenance attached to interactions written by the nurture engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionMetadata {
    pub sequence_id: Uuid,
    pub step_id: Uuid,
    pub execution_id: Uuid,
    pub automated: bool,
}

/// A single touchpoint in a lead's history. The list is append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub interaction_type: InteractionType,
    pub channel: Channel,
    pub date: DateTime<Utc>,
    pub description: String,
    pub outcome: InteractionOutcome,
    pub user_id: String,
    #[serde(default)]
    pub metadata: Option<InteractionMetadata>,
}

/// A sales lead as held by the external lead store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    pub source: LeadSource,
    pub status: LeadStatus,
    pub stage: String,
    pub score: u32,
    pub business_type: BusinessType,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub interactions: Vec<Interaction>,
    #[serde(default)]
    pub custom_fields: HashMap<String, String>,
    #[serde(default)]
    pub last_contact_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Lead {
    /// Minimal lead with sensible defaults, mostly for seeding and tests.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        source: LeadSource,
        business_type: BusinessType,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: None,
            phone: None,
            source,
            status: LeadStatus::New,
            stage: "captacion".to_string(),
            score: 0,
            business_type,
            assigned_to: None,
            interactions: Vec::new(),
            custom_fields: HashMap::new(),
            last_contact_date: None,
            created_at: Utc::now(),
        }
    }

    /// Reference instant for "days since contact": last contact, else creation.
    pub fn last_touch(&self) -> DateTime<Utc> {
        self.last_contact_date.unwrap_or(self.created_at)
    }

    /// True when the engine already recorded `step_id` for this execution.
    pub fn has_automated_interaction(&self, execution_id: Uuid, step_id: Uuid) -> bool {
        self.interactions.iter().any(|i| {
            i.metadata
                .as_ref()
                .is_some_and(|m| m.execution_id == execution_id && m.step_id == step_id)
        })
    }
}

/// Profile of the CRM user (trainer or gym staff) a message is sent on behalf of.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}
