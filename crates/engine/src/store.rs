//! Durable home of the live assignment set.
//!
//! Every scheduler mutation is written through an `AssignmentStore` before it
//! is acknowledged, so a restarted worker can rebuild its schedule from the
//! store alone. Backends must index assignments by `next_execution_time`,
//! and hand out per-key leases so several workers can share one store.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use nurture_core::error::NurtureResult;

use crate::types::{Assignment, AssignmentKey};

#[async_trait]
pub trait AssignmentStore: Send + Sync {
    async fn get(&self, key: &AssignmentKey) -> NurtureResult<Option<Assignment>>;

    /// Inserts or replaces the assignment stored under `assignment.key`.
    async fn put(&self, assignment: &Assignment) -> NurtureResult<()>;

    /// Returns `true` if an assignment was removed.
    async fn remove(&self, key: &AssignmentKey) -> NurtureResult<bool>;

    /// Assignments with `next_execution_time <= now`, earliest first.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> NurtureResult<Vec<Assignment>>;

    async fn list_for_sequence(&self, sequence_id: Uuid) -> NurtureResult<Vec<Assignment>>;

    async fn all(&self) -> NurtureResult<Vec<Assignment>>;

    /// Takes the lease on `key` for `ttl` if it is free or expired.
    /// Returns `false` while another holder's lease is live.
    async fn acquire_lease(
        &self,
        key: &AssignmentKey,
        token: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> NurtureResult<bool>;

    /// Drops the lease on `key` if `token` still holds it.
    async fn release_lease(&self, key: &AssignmentKey, token: Uuid) -> NurtureResult<()>;
}

/// Process-local store. Survives engine restarts only while the value itself
/// is kept alive, which is what the recovery tests rely on.
#[derive(Debug, Default)]
pub struct InMemoryAssignmentStore {
    assignments: DashMap<AssignmentKey, Assignment>,
    leases: DashMap<AssignmentKey, (Uuid, DateTime<Utc>)>,
}

impl InMemoryAssignmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

#[async_trait]
impl AssignmentStore for InMemoryAssignmentStore {
    async fn get(&self, key: &AssignmentKey) -> NurtureResult<Option<Assignment>> {
        Ok(self.assignments.get(key).map(|r| r.clone()))
    }

    async fn put(&self, assignment: &Assignment) -> NurtureResult<()> {
        self.assignments
            .insert(assignment.key.clone(), assignment.clone());
        Ok(())
    }

    async fn remove(&self, key: &AssignmentKey) -> NurtureResult<bool> {
        Ok(self.assignments.remove(key).is_some())
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> NurtureResult<Vec<Assignment>> {
        let mut due: Vec<Assignment> = self
            .assignments
            .iter()
            .filter(|r| r.value().next_execution_time <= now)
            .map(|r| r.value().clone())
            .collect();
        due.sort_by(|a, b| {
            a.next_execution_time
                .cmp(&b.next_execution_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn list_for_sequence(&self, sequence_id: Uuid) -> NurtureResult<Vec<Assignment>> {
        let mut list: Vec<Assignment> = self
            .assignments
            .iter()
            .filter(|r| r.key().sequence_id == sequence_id)
            .map(|r| r.value().clone())
            .collect();
        list.sort_by(|a, b| a.assigned_at.cmp(&b.assigned_at).then_with(|| a.id.cmp(&b.id)));
        Ok(list)
    }

    async fn all(&self) -> NurtureResult<Vec<Assignment>> {
        Ok(self.assignments.iter().map(|r| r.value().clone()).collect())
    }

    async fn acquire_lease(
        &self,
        key: &AssignmentKey,
        token: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> NurtureResult<bool> {
        let expires_at = now.checked_add_signed(ttl).unwrap_or(now);
        match self.leases.entry(key.clone()) {
            Entry::Occupied(mut held) => {
                if held.get().1 > now {
                    return Ok(false);
                }
                held.insert((token, expires_at));
            }
            Entry::Vacant(free) => {
                free.insert((token, expires_at));
            }
        }
        Ok(true)
    }

    async fn release_lease(&self, key: &AssignmentKey, token: Uuid) -> NurtureResult<()> {
        self.leases.remove_if(key, |_, (holder, _)| *holder == token);
        Ok(())
    }
}
