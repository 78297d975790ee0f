use std::ops::Range;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{
    connection::Database,
    helpers::{
        format_datetime, parse_datetime, parse_intake_context, parse_optional_datetime,
        parse_slot_bucket, parse_status, to_i64, to_u32, to_u64,
    },
    models::DoseRecord,
};
use crate::error::StoreError;
use crate::gateway::DoseRepository;

const DOSE_COLUMNS: &str = "id, user_id, medication_id, category, scheduled_at, slot_bucket, \
     intake_context, status, has_pre_alert, has_confirm_alert, retries, next_alert_at, \
     card_key, card_title, revision, created_at, updated_at";

fn row_to_dose(row: &Row) -> Result<DoseRecord> {
    let scheduled_at: String = row.get("scheduled_at")?;
    let next_alert_at: Option<String> = row.get("next_alert_at")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let slot_bucket: String = row.get("slot_bucket")?;
    let intake_context: String = row.get("intake_context")?;
    let status: String = row.get("status")?;
    let retries: i64 = row.get("retries")?;
    let revision: i64 = row.get("revision")?;

    Ok(DoseRecord {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        medication_id: row.get("medication_id")?,
        category: row.get("category")?,
        scheduled_at: parse_datetime(&scheduled_at, "scheduled_at")?,
        slot_bucket: parse_slot_bucket(&slot_bucket)?,
        intake_context: parse_intake_context(&intake_context)?,
        status: parse_status(&status)?,
        has_pre_alert: row.get("has_pre_alert")?,
        has_confirm_alert: row.get("has_confirm_alert")?,
        retries: to_u32(retries, "retries")?,
        next_alert_at: parse_optional_datetime(next_alert_at, "next_alert_at")?,
        card_key: row.get("card_key")?,
        card_title: row.get("card_title")?,
        revision: to_u64(revision, "revision")?,
        created_at: parse_datetime(&created_at, "created_at")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

fn collect_doses(rows: &mut rusqlite::Rows<'_>) -> Result<Vec<DoseRecord>> {
    let mut doses = Vec::new();
    while let Some(row) = rows.next()? {
        doses.push(row_to_dose(row)?);
    }
    Ok(doses)
}

enum SaveOutcome {
    Saved,
    Missing,
    Stale(u64),
}

impl Database {
    /// Returns false when a dose with the same id already exists.
    pub async fn insert_dose(&self, dose: &DoseRecord) -> Result<bool> {
        let record = dose.clone();
        self.execute(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO doses (id, user_id, medication_id, category, scheduled_at, slot_bucket,
                                              intake_context, status, has_pre_alert, has_confirm_alert, retries,
                                              next_alert_at, card_key, card_title, revision, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    record.id,
                    record.user_id,
                    record.medication_id,
                    record.category,
                    format_datetime(&record.scheduled_at),
                    record.slot_bucket.as_str(),
                    record.intake_context.as_str(),
                    record.status.as_str(),
                    record.has_pre_alert,
                    record.has_confirm_alert,
                    i64::from(record.retries),
                    record.next_alert_at.as_ref().map(format_datetime),
                    record.card_key,
                    record.card_title,
                    to_i64(record.revision)?,
                    format_datetime(&record.created_at),
                    format_datetime(&record.updated_at),
                ],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    pub async fn get_dose(&self, dose_id: &str) -> Result<Option<DoseRecord>> {
        let dose_id = dose_id.to_string();
        self.execute(move |conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {DOSE_COLUMNS} FROM doses WHERE id = ?1"))?;
            let mut rows = stmt.query(params![dose_id])?;
            let dose = match rows.next()? {
                Some(row) => Some(row_to_dose(row)?),
                None => None,
            };
            Ok(dose)
        })
        .await
    }

    /// Writes the mutable columns if the stored revision is one behind.
    async fn update_dose(&self, dose: &DoseRecord) -> Result<SaveOutcome> {
        let record = dose.clone();
        self.execute(move |conn| {
            let expected = to_i64(record.revision.saturating_sub(1))?;
            let updated = if record.revision == 0 {
                0
            } else {
                conn.execute(
                    "UPDATE doses
                     SET status = ?1,
                         has_pre_alert = ?2,
                         has_confirm_alert = ?3,
                         retries = ?4,
                         next_alert_at = ?5,
                         revision = ?6,
                         updated_at = ?7
                     WHERE id = ?8 AND revision = ?9",
                    params![
                        record.status.as_str(),
                        record.has_pre_alert,
                        record.has_confirm_alert,
                        i64::from(record.retries),
                        record.next_alert_at.as_ref().map(format_datetime),
                        to_i64(record.revision)?,
                        format_datetime(&record.updated_at),
                        record.id,
                        expected,
                    ],
                )?
            };
            if updated == 1 {
                return Ok(SaveOutcome::Saved);
            }

            let found: Option<i64> = conn
                .query_row(
                    "SELECT revision FROM doses WHERE id = ?1",
                    params![record.id],
                    |row| row.get(0),
                )
                .optional()?;
            match found {
                Some(revision) => Ok(SaveOutcome::Stale(to_u64(revision, "revision")?)),
                None => Ok(SaveOutcome::Missing),
            }
        })
        .await
    }

    pub async fn list_doses_for_user(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<DoseRecord>> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DOSE_COLUMNS} FROM doses
                 WHERE user_id = ?1 AND scheduled_at >= ?2 AND scheduled_at < ?3
                 ORDER BY scheduled_at ASC"
            ))?;
            let mut rows = stmt.query(params![
                user_id,
                format_datetime(&from),
                format_datetime(&until)
            ])?;
            collect_doses(&mut rows)
        })
        .await
    }

    pub async fn list_due_doses(&self, now: DateTime<Utc>) -> Result<Vec<DoseRecord>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DOSE_COLUMNS} FROM doses
                 WHERE next_alert_at IS NOT NULL
                   AND next_alert_at <= ?1
                   AND status NOT IN ('Done', 'Missed')
                 ORDER BY next_alert_at ASC, scheduled_at ASC"
            ))?;
            let mut rows = stmt.query(params![format_datetime(&now)])?;
            collect_doses(&mut rows)
        })
        .await
    }

    /// Deletes every dose of a medication along with its caregiver
    /// notification rows.
    pub async fn delete_doses_for_medication(&self, medication_id: &str) -> Result<Vec<String>> {
        let medication_id = medication_id.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let ids = {
                let mut stmt =
                    tx.prepare("SELECT id FROM doses WHERE medication_id = ?1 ORDER BY id")?;
                let ids = stmt
                    .query_map(params![medication_id], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                ids
            };
            tx.execute(
                "DELETE FROM caregiver_notifications
                 WHERE dose_id IN (SELECT id FROM doses WHERE medication_id = ?1)",
                params![medication_id],
            )?;
            tx.execute(
                "DELETE FROM doses WHERE medication_id = ?1",
                params![medication_id],
            )?;
            tx.commit()?;
            Ok(ids)
        })
        .await
    }

    /// Removes resolved doses scheduled before `cutoff` along with their
    /// caregiver notification rows.
    pub async fn purge_doses_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        self.execute(move |conn| {
            let cutoff = format_datetime(&cutoff);
            let tx = conn.transaction()?;
            let ids = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM doses
                     WHERE scheduled_at < ?1 AND status IN ('Done', 'Missed')
                     ORDER BY id",
                )?;
                let ids = stmt
                    .query_map(params![cutoff], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                ids
            };
            tx.execute(
                "DELETE FROM caregiver_notifications
                 WHERE dose_id IN (SELECT id FROM doses
                                   WHERE scheduled_at < ?1 AND status IN ('Done', 'Missed'))",
                params![cutoff],
            )?;
            tx.execute(
                "DELETE FROM doses WHERE scheduled_at < ?1 AND status IN ('Done', 'Missed')",
                params![cutoff],
            )?;
            tx.commit()?;
            Ok(ids)
        })
        .await
    }
}

#[async_trait]
impl DoseRepository for Database {
    async fn insert(&self, record: &DoseRecord) -> Result<(), StoreError> {
        if self.insert_dose(record).await? {
            Ok(())
        } else {
            Err(StoreError::Duplicate(record.id.clone()))
        }
    }

    async fn get(&self, dose_id: &str) -> Result<Option<DoseRecord>, StoreError> {
        Ok(self.get_dose(dose_id).await?)
    }

    async fn save(&self, record: &DoseRecord) -> Result<(), StoreError> {
        match self.update_dose(record).await? {
            SaveOutcome::Saved => Ok(()),
            SaveOutcome::Missing => Err(StoreError::NotFound(record.id.clone())),
            SaveOutcome::Stale(found) => Err(StoreError::Conflict {
                dose_id: record.id.clone(),
                expected: record.revision.saturating_sub(1),
                found,
            }),
        }
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        range: Range<DateTime<Utc>>,
    ) -> Result<Vec<DoseRecord>, StoreError> {
        Ok(self
            .list_doses_for_user(user_id, range.start, range.end)
            .await?)
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<DoseRecord>, StoreError> {
        Ok(self.list_due_doses(now).await?)
    }

    async fn delete_by_medication(&self, medication_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.delete_doses_for_medication(medication_id).await?)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        Ok(self.purge_doses_before(cutoff).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{DoseOutcome, DoseStatus, SlotBucket};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    fn dose(medication_id: &str, offset_minutes: i64) -> DoseRecord {
        let scheduled_at = t0() + Duration::minutes(offset_minutes);
        let mut record = DoseRecord::new("user-1", medication_id, scheduled_at, t0());
        record.slot_bucket = SlotBucket::Morning;
        record.card_key = "2026-03-01:Morning".into();
        record.card_title = "Morning".into();
        record.next_alert_at = Some(scheduled_at - Duration::minutes(15));
        record
    }

    #[tokio::test]
    async fn stored_dose_reads_back() {
        let db = Database::open_in_memory().unwrap();
        let mut record = dose("med-1", 0);
        record.category = Some("cardio".into());
        db.insert(&record).await.unwrap();

        let loaded = db.get(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(db.get("missing").await.unwrap().is_none());
        assert!(matches!(
            db.insert(&record).await,
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn save_is_compare_and_set() {
        let db = Database::open_in_memory().unwrap();
        let record = dose("med-1", 0);
        db.insert(&record).await.unwrap();

        let mut snoozed = record.clone();
        snoozed.status = DoseStatus::Snoozed;
        snoozed.retries = 1;
        snoozed.revision = 1;
        db.save(&snoozed).await.unwrap();

        let mut stale = record.clone();
        stale.status = DoseStatus::Done;
        stale.next_alert_at = None;
        stale.revision = 1;
        let err = db.save(&stale).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { found: 1, .. }));

        let mut unknown = dose("med-1", 0);
        unknown.revision = 1;
        assert!(matches!(
            db.save(&unknown).await,
            Err(StoreError::NotFound(_))
        ));

        let loaded = db.get(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, DoseStatus::Snoozed);
        assert_eq!(loaded.retries, 1);
    }

    #[tokio::test]
    async fn due_listing_orders_by_alert_time() {
        let db = Database::open_in_memory().unwrap();
        let later = dose("med-1", 30);
        let sooner = dose("med-1", 0);
        let future = dose("med-1", 120);
        for record in [&later, &sooner, &future] {
            db.insert(record).await.unwrap();
        }

        let due = db.list_due(t0() + Duration::minutes(20)).await.unwrap();
        let ids: Vec<_> = due.iter().map(|d| d.id.clone()).collect();
        assert_eq!(ids, vec![sooner.id.clone(), later.id.clone()]);
    }

    #[tokio::test]
    async fn bulk_removal_and_retention() {
        let db = Database::open_in_memory().unwrap();
        let keep = dose("med-1", -1440);
        let mut resolved = dose("med-1", -1440);
        resolved.status = DoseStatus::Done;
        resolved.next_alert_at = None;
        let other = dose("med-2", 0);
        for record in [&keep, &resolved, &other] {
            db.insert(record).await.unwrap();
        }

        let purged = db.purge_before(t0()).await.unwrap();
        assert_eq!(purged, vec![resolved.id.clone()]);

        let in_day = db
            .list_by_user("user-1", t0() - Duration::days(2)..t0() + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(in_day.len(), 2);

        let removed = db.delete_by_medication("med-2").await.unwrap();
        assert_eq!(removed, vec![other.id.clone()]);
        assert!(db.get(&other.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn removing_a_medication_drops_its_notices() {
        let db = Database::open_in_memory().unwrap();
        let mut resolved = dose("med-1", 0);
        resolved.status = DoseStatus::Missed;
        resolved.next_alert_at = None;
        let kept = dose("med-2", 0);
        for record in [&resolved, &kept] {
            db.insert(record).await.unwrap();
        }
        for id in [resolved.id.clone(), kept.id.clone()] {
            db.execute(move |conn| {
                conn.execute(
                    "INSERT INTO caregiver_notifications (dose_id, outcome, patient_id, recipients, claimed_at)
                     VALUES (?1, 'Missed', 'user-1', 1, '2026-03-01T09:30:00.000Z')",
                    params![id],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        }

        db.delete_by_medication("med-1").await.unwrap();

        assert!(!db.was_notified(&resolved.id, DoseOutcome::Missed).await.unwrap());
        assert!(db.was_notified(&kept.id, DoseOutcome::Missed).await.unwrap());
    }
}
