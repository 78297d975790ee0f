use std::convert::TryFrom;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::db::models::{DoseOutcome, DoseStatus, IntakeContext, SlotBucket};

pub fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

pub fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("{field} contains negative value {value}"))
}

pub fn to_u32(value: i64, field: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("{field} out of range: {value}"))
}

/// Fixed-width UTC timestamps so string comparison in SQL orders correctly.
pub fn format_datetime(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn parse_optional_datetime(
    value: Option<String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(raw) => parse_datetime(&raw, field).map(Some),
        None => Ok(None),
    }
}

pub fn parse_status(value: &str) -> Result<DoseStatus> {
    match value {
        "Scheduled" => Ok(DoseStatus::Scheduled),
        "Pending" => Ok(DoseStatus::Pending),
        "Snoozed" => Ok(DoseStatus::Snoozed),
        "Done" => Ok(DoseStatus::Done),
        "Missed" => Ok(DoseStatus::Missed),
        other => Err(anyhow!("unknown dose status {other}")),
    }
}

pub fn parse_slot_bucket(value: &str) -> Result<SlotBucket> {
    match value {
        "Morning" => Ok(SlotBucket::Morning),
        "Noon" => Ok(SlotBucket::Noon),
        "Evening" => Ok(SlotBucket::Evening),
        "Bedtime" => Ok(SlotBucket::Bedtime),
        "Other" => Ok(SlotBucket::Other),
        other => Err(anyhow!("unknown slot bucket {other}")),
    }
}

pub fn parse_intake_context(value: &str) -> Result<IntakeContext> {
    match value {
        "Plain" => Ok(IntakeContext::Plain),
        "PreMeal" => Ok(IntakeContext::PreMeal),
        "PostMeal" => Ok(IntakeContext::PostMeal),
        "Bedtime" => Ok(IntakeContext::Bedtime),
        other => Err(anyhow!("unknown intake context {other}")),
    }
}

pub fn parse_outcome(value: &str) -> Result<DoseOutcome> {
    match value {
        "Done" => Ok(DoseOutcome::Done),
        "Missed" => Ok(DoseOutcome::Missed),
        other => Err(anyhow!("unknown dose outcome {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn formatted_timestamps_sort_lexically() {
        let early = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let late = early + chrono::Duration::milliseconds(1500);
        let (a, b) = (format_datetime(&early), format_datetime(&late));
        assert_eq!(a, "2026-03-01T08:00:00.000Z");
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_datetime(&b, "late").unwrap(), late);
    }

    #[test]
    fn unknown_values_are_rejected() {
        assert!(parse_status("Paused").is_err());
        assert!(parse_outcome("Skipped").is_err());
        assert!(to_u64(-1, "revision").is_err());
        assert!(to_u32(i64::from(u32::MAX) + 1, "retries").is_err());
    }
}
