use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;

use crate::db::models::{CaregiverLink, DoseOutcome};
use crate::error::NotifyError;

/// Outbound caregiver messaging with an at-most-once guarantee per
/// `(dose_id, outcome)`.
#[async_trait]
pub trait CaregiverNotifier: Send + Sync {
    /// Returns `Ok(false)` when the pair was already notified or the patient
    /// has no active caregiver links. Never errors for "nothing to do".
    async fn notify_once(
        &self,
        dose_id: &str,
        patient_id: &str,
        outcome: DoseOutcome,
    ) -> Result<bool, NotifyError>;
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaregiverMessage {
    pub dose_id: String,
    pub patient_id: String,
    pub caregiver_ids: Vec<String>,
    pub outcome: DoseOutcome,
    pub sent_at: DateTime<Utc>,
}

/// Transport that actually reaches caregivers (push, SMS, ...).
#[async_trait]
pub trait CaregiverChannel: Send + Sync {
    async fn deliver(&self, message: &CaregiverMessage) -> anyhow::Result<()>;
}

/// Channel that only writes the message to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogChannel;

#[async_trait]
impl CaregiverChannel for LogChannel {
    async fn deliver(&self, message: &CaregiverMessage) -> anyhow::Result<()> {
        info!(
            "caregiver notice: dose {} of patient {} is {} ({} recipients)",
            message.dose_id,
            message.patient_id,
            message.outcome.as_str(),
            message.caregiver_ids.len()
        );
        Ok(())
    }
}

#[derive(Default)]
struct Ledger {
    links: HashMap<String, Vec<CaregiverLink>>,
    claimed: HashSet<(String, DoseOutcome)>,
}

/// Notifier keeping links and the sent-ledger in memory.
pub struct MemoryCaregiverNotifier {
    channel: Arc<dyn CaregiverChannel>,
    ledger: Mutex<Ledger>,
}

impl MemoryCaregiverNotifier {
    pub fn new(channel: Arc<dyn CaregiverChannel>) -> Self {
        Self {
            channel,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn link(&self, link: CaregiverLink) {
        let mut ledger = self.ledger();
        let links = ledger.links.entry(link.patient_id.clone()).or_default();
        links.retain(|existing| existing.caregiver_id != link.caregiver_id);
        links.push(link);
    }

    pub fn was_notified(&self, dose_id: &str, outcome: DoseOutcome) -> bool {
        self.ledger()
            .claimed
            .contains(&(dose_id.to_string(), outcome))
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        match self.ledger.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl CaregiverNotifier for MemoryCaregiverNotifier {
    async fn notify_once(
        &self,
        dose_id: &str,
        patient_id: &str,
        outcome: DoseOutcome,
    ) -> Result<bool, NotifyError> {
        // Claim before delivering: a failed delivery is never retried.
        let caregiver_ids = {
            let mut ledger = self.ledger();
            let caregiver_ids: Vec<String> = ledger
                .links
                .get(patient_id)
                .map(|links| {
                    links
                        .iter()
                        .filter(|link| link.active)
                        .map(|link| link.caregiver_id.clone())
                        .collect()
                })
                .unwrap_or_default();
            if caregiver_ids.is_empty() {
                return Ok(false);
            }
            if !ledger.claimed.insert((dose_id.to_string(), outcome)) {
                return Ok(false);
            }
            caregiver_ids
        };

        let message = CaregiverMessage {
            dose_id: dose_id.to_string(),
            patient_id: patient_id.to_string(),
            caregiver_ids,
            outcome,
            sent_at: Utc::now(),
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
