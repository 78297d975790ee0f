//! Dose state machine.
//!
//! `apply` is pure: it takes a record, a trigger and "now", and returns the
//! next record together with the side effects the caller must carry out.
//! Nothing here touches storage, caregivers or listeners.
//!
//! ```text
//! Scheduled --ArmPreAlert--> Scheduled (has_pre_alert, next = T)
//! Snoozed|Pending --ArmPreAlert--> unchanged apart from has_pre_alert
//! Scheduled|Snoozed --TakeNow--> Done
//! Scheduled (at or after T)|Snoozed --Snooze--> Snoozed (next = now + 10m, retries + 1) | Missed past deadline
//! Scheduled --StartConfirmCycle (T+15)--> Pending
//! Pending --ConfirmDone--> Done
//! Pending --ConfirmNotYet--> Pending (next = now + 15m, retries + 1) | Missed past deadline
//! any live --AutoMiss (T+90)--> Missed
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::{DoseOutcome, DoseRecord, DoseStatus};
use crate::error::DoseError;

use super::config::ReminderPolicy;

/// Decisions a user can send back from an alert.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum DoseAction {
    TakeNow,
    Snooze,
    ConfirmDone,
    ConfirmNotYet,
}

impl DoseAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DoseAction::TakeNow => "TakeNow",
            DoseAction::Snooze => "Snooze",
            DoseAction::ConfirmDone => "ConfirmDone",
            DoseAction::ConfirmNotYet => "ConfirmNotYet",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Trigger {
    User(DoseAction),
    ArmPreAlert,
    StartConfirmCycle,
    AutoMiss,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::User(action) => write!(f, "action {}", action.as_str()),
            Trigger::ArmPreAlert => f.write_str("pre-alert arm"),
            Trigger::StartConfirmCycle => f.write_str("confirm cycle start"),
            Trigger::AutoMiss => f.write_str("auto-miss"),
        }
    }
}

/// Mutable fields of a record after a transition.
#[derive(Debug, Clone, PartialEq)]
pub struct DosePatch {
    pub status: DoseStatus,
    pub has_pre_alert: bool,
    pub has_confirm_alert: bool,
    pub retries: u32,
    pub next_alert_at: Option<DateTime<Utc>>,
}

impl From<&DoseRecord> for DosePatch {
    fn from(record: &DoseRecord) -> Self {
        Self {
            status: record.status,
            has_pre_alert: record.has_pre_alert,
            has_confirm_alert: record.has_confirm_alert,
            retries: record.retries,
            next_alert_at: record.next_alert_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Persist {
        dose_id: String,
        patch: DosePatch,
    },
    RescheduleAlert {
        dose_id: String,
        at: DateTime<Utc>,
    },
    /// Show the T-15 advisory.
    PreAlert {
        dose_id: String,
    },
    NotifyCaregiver {
        dose_id: String,
        patient_id: String,
        outcome: DoseOutcome,
    },
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub record: DoseRecord,
    pub intents: Vec<Intent>,
}

impl Transition {
    pub fn caregiver_outcome(&self) -> Option<DoseOutcome> {
        self.intents.iter().find_map(|intent| match intent {
            Intent::NotifyCaregiver { outcome, .. } => Some(*outcome),
            _ => None,
        })
    }
}

pub fn apply(
    record: &DoseRecord,
    trigger: Trigger,
    now: DateTime<Utc>,
    policy: &ReminderPolicy,
) -> Result<Transition, DoseError> {
    let invalid = || DoseError::InvalidTransition {
        dose_id: record.id.clone(),
        status: record.status,
        trigger,
    };

    let t = record.scheduled_at;
    let past_deadline = policy.is_past_deadline(t, now);
    let mut next = record.clone();
    let mut advisory = false;

    match (record.status, trigger) {
        (DoseStatus::Done | DoseStatus::Missed, _) => return Err(invalid()),
        (_, Trigger::AutoMiss) => {
            if !past_deadline {
                return Err(invalid());
            }
            next.status = DoseStatus::Missed;
        }
        (DoseStatus::Scheduled, Trigger::ArmPreAlert) => {
            if record.has_pre_alert || now < policy.pre_alert_at(t) || past_deadline {
                return Err(invalid());
            }
            next.next_alert_at = Some(t);
            advisory = now < t;
        }
        // Only records the flag; the alert already armed stays as it is.
        (DoseStatus::Pending | DoseStatus::Snoozed, Trigger::ArmPreAlert) => {
            if record.has_pre_alert || now < policy.pre_alert_at(t) || past_deadline {
                return Err(invalid());
            }
        }
        (DoseStatus::Scheduled, Trigger::StartConfirmCycle) => {
            if now < policy.confirm_at(t) || past_deadline {
                return Err(invalid());
            }
            next.status = DoseStatus::Pending;
            next.has_confirm_alert = true;
            next.next_alert_at = Some(policy.clamp_to_deadline(t, policy.confirm_at(t)));
        }
        (DoseStatus::Scheduled | DoseStatus::Snoozed, Trigger::User(DoseAction::TakeNow)) => {
            next.status = DoseStatus::Done;
        }
        (DoseStatus::Scheduled, Trigger::User(DoseAction::Snooze)) if now < t => {
            return Err(invalid());
        }
        (DoseStatus::Scheduled | DoseStatus::Snoozed, Trigger::User(DoseAction::Snooze)) => {
            next.retries += 1;
            if past_deadline || ceiling_reached(next.retries, policy) {
                next.status = DoseStatus::Missed;
            } else {
                next.status = DoseStatus::Snoozed;
                next.next_alert_at =
                    Some(policy.clamp_to_deadline(t, now + policy.snooze_duration));
            }
        }
        (DoseStatus::Pending, Trigger::User(DoseAction::ConfirmDone)) => {
            next.status = DoseStatus::Done;
        }
        (DoseStatus::Pending, Trigger::User(DoseAction::ConfirmNotYet)) => {
            next.retries += 1;
            if past_deadline || ceiling_reached(next.retries, policy) {
                next.status = DoseStatus::Missed;
            } else {
                next.next_alert_at =
                    Some(policy.clamp_to_deadline(t, now + policy.confirm_interval));
            }
        }
        (DoseStatus::Scheduled | DoseStatus::Pending | DoseStatus::Snoozed, _) => {
            return Err(invalid());
        }
    }

    if now >= policy.pre_alert_at(t) {
        next.has_pre_alert = true;
    }
    if next.is_terminal() {
        next.next_alert_at = None;
    }
    next.revision += 1;
    next.updated_at = now;

    let mut intents = vec![Intent::Persist {
        dose_id: next.id.clone(),
        patch: DosePatch::from(&next),
    }];
    match (next.outcome(), next.next_alert_at) {
        (Some(outcome), _) => intents.push(Intent::NotifyCaregiver {
            dose_id: next.id.clone(),
            patient_id: next.user_id.clone(),
            outcome,
        }),
        (None, Some(at)) => {
            if advisory {
                intents.push(Intent::PreAlert {
                    dose_id: next.id.clone(),
                });
            }
            intents.push(Intent::RescheduleAlert {
                dose_id: next.id.clone(),
                at,
            });
        }
        (None, None) => {}
    }

    Ok(Transition {
        record: next,
        intents,
    })
}

fn ceiling_reached(retries: u32, policy: &ReminderPolicy) -> bool {
    policy.enforce_retry_ceiling && retries > policy.max_retries
}
