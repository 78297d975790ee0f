use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::{DoseRecord, DoseStatus};

use super::config::ReminderPolicy;

/// Which alert, if any, a dose record warrants at a given instant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum AlertKind {
    None,
    /// T-15 advisory
    Pre,
    /// "take now" / "snooze"
    Main,
    /// "done" / "not yet"
    Confirm,
}

impl AlertKind {
    /// Alerts that wait on a user decision.
    pub fn needs_decision(&self) -> bool {
        matches!(self, AlertKind::Main | AlertKind::Confirm)
    }
}

/// Pure classification of `record` at `now`. Never mutates anything.
pub fn classify(record: &DoseRecord, now: DateTime<Utc>, policy: &ReminderPolicy) -> AlertKind {
    let t = record.scheduled_at;
    match record.status {
        DoseStatus::Scheduled => {
            if !record.has_pre_alert && policy.pre_alert_at(t) <= now && now < t {
                AlertKind::Pre
            } else if t <= now && now < policy.confirm_at(t) {
                AlertKind::Main
            } else {
                AlertKind::None
            }
        }
        DoseStatus::Snoozed => match record.next_alert_at {
            Some(at) if at <= now => AlertKind::Main,
            _ => AlertKind::None,
        },
        DoseStatus::Pending => {
            if now >= policy.confirm_at(t) {
                AlertKind::Confirm
            } else {
                AlertKind::None
            }
        }
        DoseStatus::Done | DoseStatus::Missed => AlertKind::None,
    }
}
