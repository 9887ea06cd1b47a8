use chrono::Utc;
use parking_lot::RwLock;
use tracing::info;
use uuid::Uuid;

use nurture_core::error::{NurtureError, NurtureResult};
use nurture_core::types::BusinessType;

use crate::types::{Sequence, SequenceStatus};

/// Configured sequences, kept in registration order so trigger matching is
/// deterministic.
#[derive(Debug, Default)]
pub struct SequenceRegistry {
    sequences: RwLock<Vec<Sequence>>,
}

impl SequenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and stores a sequence. Re-registering an id replaces the
    /// definition in place (live assignments keep their step snapshot).
    pub fn register(&self, mut sequence: Sequence) -> NurtureResult<Uuid> {
        sequence.normalize()?;
        let id = sequence.id;
        let mut sequences = self.sequences.write();
        match sequences.iter_mut().find(|s| s.id == id) {
            Some(existing) => {
                info!(sequence_id = %id, name = %sequence.name, "Replacing sequence definition");
                sequence.updated_at = Utc::now();
                *existing = sequence;
            }
            None => {
                info!(sequence_id = %id, name = %sequence.name, "Registering sequence");
                sequences.push(sequence);
            }
        }
        Ok(id)
    }

    pub fn get(&self, id: Uuid) -> Option<Sequence> {
        self.sequences.read().iter().find(|s| s.id == id).cloned()
    }

    /// Non-deleted sequences, optionally for one business type.
    pub fn list(&self, business_type: Option<BusinessType>) -> Vec<Sequence> {
        self.sequences
            .read()
            .iter()
            .filter(|s| !s.is_deleted())
            .filter(|s| business_type.map_or(true, |bt| s.business_type == bt))
            .cloned()
            .collect()
    }

    pub fn set_status(&self, id: Uuid, status: SequenceStatus) -> NurtureResult<Sequence> {
        self.update(id, |s| s.status = status)
    }

    pub fn mark_deleted(&self, id: Uuid) -> NurtureResult<Sequence> {
        self.update(id, |s| s.deleted_at = Some(Utc::now()))
    }

    fn update(&self, id: Uuid, f: impl FnOnce(&mut Sequence)) -> NurtureResult<Sequence> {
        let mut sequences = self.sequences.write();
        let sequence = sequences
            .iter_mut()
            .find(|s| s.id == id && !s.is_deleted())
            .ok_or(NurtureError::SequenceNotFound(id))?;
        f(sequence);
        sequence.updated_at = Utc::now();
        Ok(sequence.clone())
    }
}
