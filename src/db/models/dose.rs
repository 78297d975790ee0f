//! Dose-related data models.
//!
//! `DoseRecord` is one scheduled occurrence of one medication dose. Records are
//! only ever mutated through `reminder::state::apply`; everything here is plain
//! data plus the string codecs used by the SQLite layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum DoseStatus {
    Scheduled,
    Pending,
    Snoozed,
    Done,
    Missed,
}

impl DoseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DoseStatus::Scheduled => "Scheduled",
            DoseStatus::Pending => "Pending",
            DoseStatus::Snoozed => "Snoozed",
            DoseStatus::Done => "Done",
            DoseStatus::Missed => "Missed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DoseStatus::Done | DoseStatus::Missed)
    }
}

/// Time-of-day grouping shown on cards. Never consulted by the alert logic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum SlotBucket {
    Morning,
    Noon,
    Evening,
    Bedtime,
    Other,
}

impl SlotBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotBucket::Morning => "Morning",
            SlotBucket::Noon => "Noon",
            SlotBucket::Evening => "Evening",
            SlotBucket::Bedtime => "Bedtime",
            SlotBucket::Other => "Other",
        }
    }

    /// Bucket for a local hour of day (0..=23).
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            5..=10 => SlotBucket::Morning,
            11..=14 => SlotBucket::Noon,
            17..=20 => SlotBucket::Evening,
            21..=23 => SlotBucket::Bedtime,
            _ => SlotBucket::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum IntakeContext {
    #[default]
    Plain,
    PreMeal,
    PostMeal,
    Bedtime,
}

impl IntakeContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntakeContext::Plain => "Plain",
            IntakeContext::PreMeal => "PreMeal",
            IntakeContext::PostMeal => "PostMeal",
            IntakeContext::Bedtime => "Bedtime",
        }
    }
}

/// Final result of a dose, as reported to caregivers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum DoseOutcome {
    Done,
    Missed,
}

impl DoseOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DoseOutcome::Done => "Done",
            DoseOutcome::Missed => "Missed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DoseRecord {
    pub id: String,
    pub user_id: String,
    pub medication_id: String,
    pub category: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub slot_bucket: SlotBucket,
    pub intake_context: IntakeContext,
    pub status: DoseStatus,
    pub has_pre_alert: bool,
    pub has_confirm_alert: bool,
    pub retries: u32,
    pub next_alert_at: Option<DateTime<Utc>>,
    pub card_key: String,
    pub card_title: String,
    /// Bumped on every committed mutation; the store compares it on save.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DoseRecord {
    /// Fresh record in `Scheduled` with no alert armed yet.
    pub fn new(
        user_id: impl Into<String>,
        medication_id: impl Into<String>,
        scheduled_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            medication_id: medication_id.into(),
            category: None,
            scheduled_at,
            slot_bucket: SlotBucket::Other,
            intake_context: IntakeContext::Plain,
            status: DoseStatus::Scheduled,
            has_pre_alert: false,
            has_confirm_alert: false,
            retries: 0,
            next_alert_at: None,
            card_key: String::new(),
            card_title: String::new(),
            revision: 0,
            created_at,
            updated_at: created_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn outcome(&self) -> Option<DoseOutcome> {
        match self.status {
            DoseStatus::Done => Some(DoseOutcome::Done),
            DoseStatus::Missed => Some(DoseOutcome::Missed),
            DoseStatus::Scheduled | DoseStatus::Pending | DoseStatus::Snoozed => None,
        }
    }
}
