use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime},
    models::{CaregiverLink, DoseOutcome},
};
use crate::error::NotifyError;
use crate::gateway::{CaregiverChannel, CaregiverMessage, CaregiverNotifier};

impl Database {
    /// Inserts or reactivates a caregiver link.
    pub async fn link_caregiver(&self, link: &CaregiverLink) -> Result<()> {
        let link = link.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO caregiver_links (patient_id, caregiver_id, active, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(patient_id, caregiver_id) DO UPDATE SET active = excluded.active",
                params![
                    link.patient_id,
                    link.caregiver_id,
                    link.active,
                    format_datetime(&link.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_link_active(
        &self,
        patient_id: &str,
        caregiver_id: &str,
        active: bool,
    ) -> Result<bool> {
        let patient_id = patient_id.to_string();
        let caregiver_id = caregiver_id.to_string();
        self.execute(move |conn| {
            let updated = conn.execute(
                "UPDATE caregiver_links SET active = ?3 WHERE patient_id = ?1 AND caregiver_id = ?2",
                params![patient_id, caregiver_id, active],
            )?;
            Ok(updated == 1)
        })
        .await
    }

    pub async fn caregiver_links(&self, patient_id: &str) -> Result<Vec<CaregiverLink>> {
        let patient_id = patient_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT patient_id, caregiver_id, active, created_at
                 FROM caregiver_links
                 WHERE patient_id = ?1
                 ORDER BY caregiver_id",
            )?;
            let mut rows = stmt.query(params![patient_id])?;
            let mut links = Vec::new();
            while let Some(row) = rows.next()? {
                let created_at: String = row.get(3)?;
                links.push(CaregiverLink {
                    patient_id: row.get(0)?,
                    caregiver_id: row.get(1)?,
                    active: row.get(2)?,
                    created_at: parse_datetime(&created_at, "created_at")?,
                });
            }
            Ok(links)
        })
        .await
    }

    /// Records the notice for `(dose_id, outcome)` and returns the active
    /// caregivers to deliver to. Returns `None` when there is nobody to tell
    /// or the pair was claimed before.
    async fn claim_notification(
        &self,
        dose_id: &str,
        patient_id: &str,
        outcome: DoseOutcome,
        claimed_at: DateTime<Utc>,
    ) -> Result<Option<Vec<String>>> {
        let dose_id = dose_id.to_string();
        let patient_id = patient_id.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let caregiver_ids = {
                let mut stmt = tx.prepare(
                    "SELECT caregiver_id FROM caregiver_links
                     WHERE patient_id = ?1 AND active = 1
                     ORDER BY caregiver_id",
                )?;
                let ids = stmt
                    .query_map(params![patient_id], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                ids
            };
            if caregiver_ids.is_empty() {
                return Ok(None);
            }

            let claimed = tx.execute(
                "INSERT OR IGNORE INTO caregiver_notifications
                     (dose_id, outcome, patient_id, recipients, claimed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    dose_id,
                    outcome.as_str(),
                    patient_id,
                    caregiver_ids.len() as i64,
                    format_datetime(&claimed_at),
                ],
            )?;
            tx.commit()?;

            Ok((claimed == 1).then_some(caregiver_ids))
        })
        .await
    }

    pub async fn was_notified(&self, dose_id: &str, outcome: DoseOutcome) -> Result<bool> {
        let dose_id = dose_id.to_string();
        self.execute(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM caregiver_notifications WHERE dose_id = ?1 AND outcome = ?2",
                params![dose_id, outcome.as_str()],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }
}

/// Notifier whose sent-ledger lives in the `caregiver_notifications` table,
/// so the at-most-once guarantee survives restarts.
pub struct SqliteCaregiverNotifier {
    db: Database,
    channel: Arc<dyn CaregiverChannel>,
}

impl SqliteCaregiverNotifier {
    pub fn new(db: Database, channel: Arc<dyn CaregiverChannel>) -> Self {
        Self { db, channel }
    }
}

#[async_trait]
impl CaregiverNotifier for SqliteCaregiverNotifier {
    async fn notify_once(
        &self,
        dose_id: &str,
        patient_id: &str,
        outcome: DoseOutcome,
    ) -> Result<bool, NotifyError> {
        let sent_at = Utc::now();
        let Some(caregiver_ids) = self
            .db
            .claim_notification(dose_id, patient_id, outcome, sent_at)
            .await?
        else {
            return Ok(false);
        };

        let message = CaregiverMessage {
            dose_id: dose_id.to_string(),
            patient_id: patient_id.to_string(),
            caregiver_ids,
            outcome,
            sent_at,
        };
        self.channel
            .deliver(&message)
            .await
            .map_err(|source| NotifyError::DeliveryFailed {
                dose_id: dose_id.to_string(),
                outcome,
                source,
            })?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::caregiver::testing::{active_link, RecordingChannel};

    #[tokio::test]
    async fn notice_is_sent_once_per_outcome() {
        let db = Database::open_in_memory().unwrap();
        db.link_caregiver(&active_link("patient", "carer-a"))
            .await
            .unwrap();
        db.link_caregiver(&active_link("patient", "carer-b"))
            .await
            .unwrap();
        let channel = Arc::new(RecordingChannel::default());
        let notifier = SqliteCaregiverNotifier::new(db.clone(), channel.clone());

        assert!(notifier
            .notify_once("dose-1", "patient", DoseOutcome::Missed)
            .await
            .unwrap());
        assert!(!notifier
            .notify_once("dose-1", "patient", DoseOutcome::Missed)
            .await
            .unwrap());
        assert!(notifier
            .notify_once("dose-1", "patient", DoseOutcome::Done)
            .await
            .unwrap());

        assert_eq!(channel.count(), 2);
        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent[0].caregiver_ids, vec!["carer-a", "carer-b"]);
    }

    #[tokio::test]
    async fn no_active_links_claims_nothing() {
        let db = Database::open_in_memory().unwrap();
        db.link_caregiver(&active_link("patient", "carer-a"))
            .await
            .unwrap();
        assert!(db
            .set_link_active("patient", "carer-a", false)
            .await
            .unwrap());
        let channel = Arc::new(RecordingChannel::default());
        let notifier = SqliteCaregiverNotifier::new(db.clone(), channel.clone());

        assert!(!notifier
            .notify_once("dose-1", "patient", DoseOutcome::Missed)
            .await
            .unwrap());
        assert!(!db.was_notified("dose-1", DoseOutcome::Missed).await.unwrap());
        assert_eq!(channel.count(), 0);

        let links = db.caregiver_links("patient").await.unwrap();
        assert_eq!(links.len(), 1);
        assert!(!links[0].active);
    }

    #[tokio::test]
    async fn failed_delivery_keeps_the_claim() {
        let db = Database::open_in_memory().unwrap();
        db.link_caregiver(&active_link("patient", "carer-a"))
            .await
            .unwrap();
        let notifier =
            SqliteCaregiverNotifier::new(db.clone(), Arc::new(RecordingChannel::failing()));

        let err = notifier
            .notify_once("dose-1", "patient", DoseOutcome::Missed)
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::DeliveryFailed { .. }));
        assert!(db.was_notified("dose-1", DoseOutcome::Missed).await.unwrap());
        assert!(!notifier
            .notify_once("dose-1", "patient", DoseOutcome::Missed)
            .await
            .unwrap());
    }
}
