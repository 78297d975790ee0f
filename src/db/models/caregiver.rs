use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A caregiver following a patient's doses. Only active links receive
/// outcome notifications.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaregiverLink {
    pub patient_id: String,
    pub caregiver_id: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}
