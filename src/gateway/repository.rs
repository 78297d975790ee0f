use std::{
    collections::HashMap,
    ops::Range,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::models::DoseRecord;
use crate::error::StoreError;

/// Durable storage for dose records.
///
/// `save` is a compare-and-set: it only succeeds when the stored revision is
/// exactly one behind the record being written.
#[async_trait]
pub trait DoseRepository: Send + Sync {
    async fn insert(&self, record: &DoseRecord) -> Result<(), StoreError>;

    async fn get(&self, dose_id: &str) -> Result<Option<DoseRecord>, StoreError>;

    async fn save(&self, record: &DoseRecord) -> Result<(), StoreError>;

    /// Records of `user_id` whose `scheduled_at` falls in `range`, oldest first.
    async fn list_by_user(
        &self,
        user_id: &str,
        range: Range<DateTime<Utc>>,
    ) -> Result<Vec<DoseRecord>, StoreError>;

    /// Live records with `next_alert_at <= now`, earliest alert first.
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<DoseRecord>, StoreError>;

    /// Returns the ids that were removed.
    async fn delete_by_medication(&self, medication_id: &str) -> Result<Vec<String>, StoreError>;

    /// Removes resolved records scheduled before `cutoff`; live ones are kept.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError>;
}

/// Process-local repository.
#[derive(Default)]
pub struct MemoryDoseRepository {
    records: Mutex<HashMap<String, DoseRecord>>,
}

impl MemoryDoseRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, DoseRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn remove_where<F>(&self, predicate: F) -> Vec<String>
    where
        F: Fn(&DoseRecord) -> bool,
    {
        let mut records = self.records();
        let mut removed: Vec<String> = records
            .values()
            .filter(|record| predicate(record))
            .map(|record| record.id.clone())
            .collect();
        removed.sort();
        for id in &removed {
            records.remove(id);
        }
        removed
    }
}

#[async_trait]
impl DoseRepository for MemoryDoseRepository {
    async fn insert(&self, record: &DoseRecord) -> Result<(), StoreError> {
        let mut records = self.records();
        if records.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id.clone()));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, dose_id: &str) -> Result<Option<DoseRecord>, StoreError> {
        Ok(self.records().get(dose_id).cloned())
    }

    async fn save(&self, record: &DoseRecord) -> Result<(), StoreError> {
        let mut records = self.records();
        let stored = records
            .get_mut(&record.id)
            .ok_or_else(|| StoreError::NotFound(record.id.clone()))?;
        let expected = record.revision.saturating_sub(1);
        if stored.revision != expected || record.revision == 0 {
            return Err(StoreError::Conflict {
                dose_id: record.id.clone(),
                expected,
                found: stored.revision,
            });
        }
        *stored = record.clone();
        Ok(())
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        range: Range<DateTime<Utc>>,
    ) -> Result<Vec<DoseRecord>, StoreError> {
        let mut found: Vec<DoseRecord> = self
            .records()
            .values()
            .filter(|r| r.user_id == user_id && range.contains(&r.scheduled_at))
            .cloned()
            .collect();
        found.sort_by_key(|r| r.scheduled_at);
        Ok(found)
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<DoseRecord>, StoreError> {
        let mut due: Vec<DoseRecord> = self
            .records()
            .values()
            .filter(|r| !r.is_terminal() && r.next_alert_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|r| (r.next_alert_at, r.scheduled_at));
        Ok(due)
    }

    async fn delete_by_medication(&self, medication_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.remove_where(|r| r.medication_id == medication_id))
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        Ok(self.remove_where(|r| r.is_terminal() && r.scheduled_at < cutoff))
    }
}
