//! Contracts for the external lead store and user directory, with in-memory
//! implementations used by the demo worker and the tests.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use nurture_core::error::{NurtureError, NurtureResult};
use nurture_core::types::{BusinessType, Interaction, Lead, LeadStatus, UserProfile};

/// Filter for bulk lead queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeadFilter {
    pub business_type: Option<BusinessType>,
    /// Only leads whose status is in this list, when non-empty.
    #[serde(default)]
    pub statuses: Vec<LeadStatus>,
    /// Drop converted and lost leads.
    #[serde(default)]
    pub exclude_terminal: bool,
}

impl LeadFilter {
    pub fn matches(&self, lead: &Lead) -> bool {
        if self.business_type.is_some_and(|bt| bt != lead.business_type) {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&lead.status) {
            return false;
        }
        !(self.exclude_terminal && lead.status.is_terminal())
    }
}

/// Read/append access to leads owned by the CRM.
///
/// The engine never changes lead status. It only reads leads and appends
/// interactions; `append_interaction` must not overwrite concurrent appends
/// made by other subsystems.
#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn get_lead(&self, id: &str) -> NurtureResult<Option<Lead>>;

    async fn get_leads(&self, filter: &LeadFilter) -> NurtureResult<Vec<Lead>>;

    /// Appends `interaction` and sets `last_contact_date` to its date.
    async fn append_interaction(&self, id: &str, interaction: Interaction) -> NurtureResult<Lead>;
}

/// Lookup of the CRM user a lead is assigned to.
pub trait UserDirectory: Send + Sync {
    fn get_user(&self, id: &str) -> Option<UserProfile>;
}

#[derive(Debug, Default)]
pub struct InMemoryLeadStore {
    leads: DashMap<String, Lead>,
}

impl InMemoryLeadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, lead: Lead) {
        self.leads.insert(lead.id.clone(), lead);
    }

    /// Status changes come from the CRM, not from the engine.
    pub fn set_status(&self, id: &str, status: LeadStatus) -> NurtureResult<()> {
        let mut lead = self
            .leads
            .get_mut(id)
            .ok_or_else(|| NurtureError::LeadNotFound(id.to_string()))?;
        lead.status = status;
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Option<Lead> {
        self.leads.remove(id).map(|(_, lead)| lead)
    }

    pub fn len(&self) -> usize {
        self.leads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leads.is_empty()
    }
}

#[async_trait]
impl LeadStore for InMemoryLeadStore {
    async fn get_lead(&self, id: &str) -> NurtureResult<Option<Lead>> {
        Ok(self.leads.get(id).map(|r| r.clone()))
    }

    async fn get_leads(&self, filter: &LeadFilter) -> NurtureResult<Vec<Lead>> {
        let mut leads: Vec<Lead> = self
            .leads
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        leads.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(leads)
    }

    async fn append_interaction(&self, id: &str, interaction: Interaction) -> NurtureResult<Lead> {
        let mut lead = self
            .leads
            .get_mut(id)
            .ok_or_else(|| NurtureError::LeadNotFound(id.to_string()))?;
        lead.last_contact_date = Some(interaction.date);
        lead.interactions.push(interaction);
        Ok(lead.clone())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryUserDirectory {
    users: DashMap<String, UserProfile>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: UserProfile) {
        self.users.insert(user.id.clone(), user);
    }
}

impl UserDirectory for InMemoryUserDirectory {
    fn get_user(&self, id: &str) -> Option<UserProfile> {
        self.users.get(id).map(|r| r.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nurture_core::types::{Channel, InteractionOutcome, InteractionType, LeadSource};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_append_interaction_updates_contact_date() {
        let store = InMemoryLeadStore::new();
        store.upsert(Lead::new("l1", "Eva", LeadSource::Website, BusinessType::Gym));

        let date = Utc::now();
        let lead = store
            .append_interaction(
                "l1",
                Interaction {
                    id: Uuid::new_v4(),
                    interaction_type: InteractionType::Note,
                    channel: Channel::Phone,
                    date,
                    description: "manual note".into(),
                    outcome: InteractionOutcome::Neutral,
                    user_id: "u1".into(),
                    metadata: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(lead.interactions.len(), 1);
        assert_eq!(lead.last_contact_date, Some(date));
        assert!(matches!(
            store.append_interaction("missing", lead.interactions[0].clone()).await,
            Err(NurtureError::LeadNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_get_leads_filter() {
        let store = InMemoryLeadStore::new();
        store.upsert(Lead::new("a", "A", LeadSource::Website, BusinessType::Gym));
        store.upsert(Lead::new("b", "B", LeadSource::Website, BusinessType::Trainer));
        let mut lost = Lead::new("c", "C", LeadSource::Website, BusinessType::Gym);
        lost.status = LeadStatus::Lost;
        store.upsert(lost);

        let filter = LeadFilter {
            business_type: Some(BusinessType::Gym),
            exclude_terminal: true,
            ..Default::default()
        };
        let leads = store.get_leads(&filter).await.unwrap();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].id, "a");

        assert_eq!(store.get_leads(&LeadFilter::default()).await.unwrap().len(), 3);
    }
}
