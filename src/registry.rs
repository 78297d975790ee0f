//! Medication plans and the dose records they expand into.

use anyhow::{bail, Result};
use chrono::{DateTime, Days, FixedOffset, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::{DoseRecord, IntakeContext, SlotBucket};

/// Longest span one plan may expand to.
pub const MAX_PLAN_DAYS: u32 = 366;

/// A medication as saved by the user: which times of day, for how many days.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicationPlan {
    pub medication_id: String,
    pub user_id: String,
    pub name: String,
    pub category: Option<String>,
    pub times: Vec<NaiveTime>,
    pub intake_context: IntakeContext,
    pub start_date: NaiveDate,
    pub days: u32,
    /// Offset of the patient's local time from UTC, in seconds.
    pub utc_offset_secs: i32,
}

impl MedicationPlan {
    /// One record per time per covered day, ordered by scheduled instant.
    pub fn generate_doses(&self, created_at: DateTime<Utc>) -> Result<Vec<DoseRecord>> {
        if self.times.is_empty() {
            bail!("medication {} has no dose times", self.medication_id);
        }
        let Some(offset) = FixedOffset::east_opt(self.utc_offset_secs) else {
            bail!("invalid UTC offset {}s", self.utc_offset_secs);
        };

        let mut times = self.times.clone();
        times.sort();
        times.dedup();

        if self.days == 0 || self.days > MAX_PLAN_DAYS {
            bail!(
                "medication {} must cover 1 to {MAX_PLAN_DAYS} days, got {}",
                self.medication_id,
                self.days
            );
        }

        let mut doses = Vec::new();
        for day in 0..self.days {
            let Some(date) = self.start_date.checked_add_days(Days::new(u64::from(day))) else {
                bail!(
                    "medication {} runs past the last representable date",
                    self.medication_id
                );
            };
            for time in &times {
                let local = date.and_time(*time);
                let Some(scheduled) = offset.from_local_datetime(&local).single() else {
                    bail!("unrepresentable dose time {local}");
                };
                let slot = SlotBucket::from_hour(time.hour());

                let mut record = DoseRecord::new(
                    self.user_id.clone(),
                    self.medication_id.clone(),
                    scheduled.with_timezone(&Utc),
                    created_at,
                );
                record.category = self.category.clone();
                record.slot_bucket = slot;
                record.intake_context = self.intake_context;
                record.card_key = format!("{date}:{}", slot.as_str());
                record.card_title = slot.as_str().to_string();
                doses.push(record);
            }
        }
        Ok(doses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(times: &[(u32, u32)], days: u32, offset_hours: i32) -> MedicationPlan {
        MedicationPlan {
            medication_id: "med-1".into(),
            user_id: "user-1".into(),
            name: "Metformin 500mg".into(),
            category: Some("diabetes".into()),
            times: times
                .iter()
                .map(|(h, m)| NaiveTime::from_hms_opt(*h, *m, 0).unwrap())
                .collect(),
            intake_context: IntakeContext::PostMeal,
            start_date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            days,
            utc_offset_secs: offset_hours * 3600,
        }
    }

    #[test]
    fn one_record_per_time_per_day() {
        let created = Utc.with_ymd_and_hms(2026, 2, 28, 12, 0, 0).unwrap();
        let doses = plan(&[(20, 0), (8, 0)], 3, 0).generate_doses(created).unwrap();
        assert_eq!(doses.len(), 6);
        assert_eq!(
            doses[0].scheduled_at,
            Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
        );
        assert_eq!(doses[0].slot_bucket, SlotBucket::Morning);
        assert_eq!(doses[1].slot_bucket, SlotBucket::Evening);
        assert_eq!(doses[0].card_key, "2026-03-01:Morning");
        assert_eq!(doses[5].card_title, "Evening");
        assert!(doses.iter().all(|d| d.intake_context == IntakeContext::PostMeal));
    }

    #[test]
    fn local_offset_shifts_instant_but_not_bucket() {
        let created = Utc.with_ymd_and_hms(2026, 2, 28, 12, 0, 0).unwrap();
        let doses = plan(&[(8, 0)], 1, 9).generate_doses(created).unwrap();
        assert_eq!(
            doses[0].scheduled_at,
            Utc.with_ymd_and_hms(2026, 2, 28, 23, 0, 0).unwrap()
        );
        assert_eq!(doses[0].slot_bucket, SlotBucket::Morning);
    }

    #[test]
    fn duplicate_times_collapse() {
        let created = Utc.with_ymd_and_hms(2026, 2, 28, 12, 0, 0).unwrap();
        let doses = plan(&[(8, 0), (8, 0)], 2, 0).generate_doses(created).unwrap();
        assert_eq!(doses.len(), 2);
    }

    #[test]
    fn empty_plan_is_rejected() {
        let created = Utc.with_ymd_and_hms(2026, 2, 28, 12, 0, 0).unwrap();
        assert!(plan(&[], 2, 0).generate_doses(created).is_err());
    }

    #[test]
    fn day_count_is_bounded() {
        let created = Utc.with_ymd_and_hms(2026, 2, 28, 12, 0, 0).unwrap();
        assert!(plan(&[(8, 0)], 0, 0).generate_doses(created).is_err());
        assert!(plan(&[(8, 0)], u32::MAX, 0).generate_doses(created).is_err());
        let year = plan(&[(8, 0)], MAX_PLAN_DAYS, 0)
            .generate_doses(created)
            .unwrap();
        assert_eq!(year.len(), MAX_PLAN_DAYS as usize);
    }

    #[test]
    fn plans_at_the_end_of_the_calendar_fail_cleanly() {
        let created = Utc.with_ymd_and_hms(2026, 2, 28, 12, 0, 0).unwrap();
        let mut last = plan(&[(8, 0)], 2, 0);
        last.start_date = NaiveDate::MAX;
        assert!(last.generate_doses(created).is_err());
    }
}
