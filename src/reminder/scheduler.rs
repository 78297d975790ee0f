use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex as StdMutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    clock::Clock,
    db::models::{DoseRecord, DoseStatus},
    error::DoseError,
    gateway::{CaregiverNotifier, DoseRepository},
    registry::MedicationPlan,
};

use super::{
    config::SchedulerConfig,
    events::{ChangeBus, DoseEvent, Subscription},
    locks::DoseLocks,
    policy::{classify, AlertKind},
    state::{self, DoseAction, Intent, Transition, Trigger},
};

// Set to true to enable verbose logging in the ticker loop
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// A record waiting on a user decision.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuePrompt {
    pub record: DoseRecord,
    pub alert: AlertKind,
    pub surfaced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickFailure {
    pub dose_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub now: DateTime<Utc>,
    /// Another tick was still running; nothing was scanned.
    pub skipped: bool,
    pub scanned: usize,
    pub auto_missed: Vec<String>,
    pub pre_alerts: Vec<String>,
    pub confirm_started: Vec<String>,
    pub prompts: Vec<DuePrompt>,
    pub failures: Vec<TickFailure>,
}

impl TickReport {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            skipped: false,
            scanned: 0,
            auto_missed: Vec::new(),
            pre_alerts: Vec::new(),
            confirm_started: Vec::new(),
            prompts: Vec::new(),
            failures: Vec::new(),
        }
    }
}

/// What one pass over a single due record did.
#[derive(Debug, Default)]
struct Step {
    auto_missed: bool,
    pre_alert: bool,
    confirm_started: bool,
    prompt: Option<DuePrompt>,
}

struct Ticker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct DoseScheduler {
    repo: Arc<dyn DoseRepository>,
    notifier: Arc<dyn CaregiverNotifier>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    bus: ChangeBus,
    locks: DoseLocks,
    tick_lock: Arc<Mutex<()>>,
    prompts: Arc<StdMutex<BTreeMap<String, DuePrompt>>>,
    ticker: Arc<Mutex<Option<Ticker>>>,
}

impl DoseScheduler {
    pub fn new(
        repo: Arc<dyn DoseRepository>,
        notifier: Arc<dyn CaregiverNotifier>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repo,
            notifier,
            clock,
            config,
            bus: ChangeBus::new(),
            locks: DoseLocks::default(),
            tick_lock: Arc::new(Mutex::new(())),
            prompts: Arc::new(StdMutex::new(BTreeMap::new())),
            ticker: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Registers a fresh record and arms its first alert relative to the
    /// current clock: pre-alert, immediate main alert, confirm cycle, or an
    /// immediate miss when it is already past the deadline.
    pub async fn schedule_dose(&self, record: DoseRecord) -> Result<DoseRecord, DoseError> {
        if record.status != DoseStatus::Scheduled {
            return Err(DoseError::InvalidTransition {
                dose_id: record.id.clone(),
                status: record.status,
                trigger: Trigger::ArmPreAlert,
            });
        }

        let now = self.clock.now();
        let policy = &self.config.policy;
        let mut record = record;
        record.has_pre_alert = false;
        record.has_confirm_alert = false;
        record.retries = 0;
        record.revision = 0;
        record.next_alert_at = Some(policy.pre_alert_at(record.scheduled_at));
        record.updated_at = now;

        self.repo.insert(&record).await?;
        debug!(
            "dose {} scheduled at {} (first alert {:?})",
            record.id, record.scheduled_at, record.next_alert_at
        );
        self.bus.publish(&DoseEvent::Scheduled {
            record: record.clone(),
        });

        if record.next_alert_at.is_some_and(|at| at <= now) {
            self.process_due(&record.id, now).await?;
        }

        self.repo
            .get(&record.id)
            .await?
            .ok_or_else(|| DoseError::NotFound(record.id.clone()))
    }

    pub async fn schedule_medication(
        &self,
        plan: &MedicationPlan,
    ) -> Result<Vec<DoseRecord>, DoseError> {
        let doses = plan
            .generate_doses(self.clock.now())
            .map_err(DoseError::InvalidPlan)?;
        let mut scheduled = Vec::with_capacity(doses.len());
        for dose in doses {
            scheduled.push(self.schedule_dose(dose).await?);
        }
        info!(
            "scheduled {} doses for medication {} ({})",
            scheduled.len(),
            plan.medication_id,
            plan.name
        );
        Ok(scheduled)
    }

    pub async fn remove_medication(&self, medication_id: &str) -> Result<Vec<String>, DoseError> {
        let removed = self.repo.delete_by_medication(medication_id).await?;
        self.forget_removed(&removed);
        info!(
            "removed {} doses of medication {}",
            removed.len(),
            medication_id
        );
        Ok(removed)
    }

    /// Retention cleanup of resolved records scheduled before `cutoff`.
    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, DoseError> {
        let removed = self.repo.purge_before(cutoff).await?;
        self.forget_removed(&removed);
        Ok(removed)
    }

    pub async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<DoseRecord>, DoseError> {
        Ok(self.repo.list_due(now).await?)
    }

    /// Records currently surfaced for a user decision, earliest dose first.
    pub fn due_prompts(&self) -> Vec<DuePrompt> {
        let mut prompts: Vec<DuePrompt> = self.prompts().values().cloned().collect();
        prompts.sort_by_key(|p| (p.record.scheduled_at, p.record.id.clone()));
        prompts
    }

    pub fn on_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&DoseEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(listener)
    }

    /// Applies a user decision and commits it before returning.
    pub async fn apply_user_action(
        &self,
        dose_id: &str,
        action: DoseAction,
        now: DateTime<Utc>,
    ) -> Result<DoseRecord, DoseError> {
        let guard = self.locks.acquire(dose_id).await;
        let result = match self.repo.get(dose_id).await {
            Ok(Some(record)) => self.commit(&record, Trigger::User(action), now).await,
            Ok(None) => Err(DoseError::NotFound(dose_id.to_string())),
            Err(err) => Err(err.into()),
        };
        drop(guard);
        self.locks.prune();

        match result {
            Ok(committed) => Ok(committed),
            Err(err) if err.is_invalid_transition() => {
                info!("ignoring {} on dose {dose_id}: already handled", action.as_str());
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Runs one scheduler pass. Fails only when the due-list itself cannot be
    /// read; per-record failures are reported and the scan continues.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, DoseError> {
        let mut report = TickReport::new(now);
        let Ok(_running) = self.tick_lock.try_lock() else {
            warn!("tick at {now} skipped: previous tick still running");
            report.skipped = true;
            return Ok(report);
        };

        let due = self.repo.list_due(now).await?;
        report.scanned = due.len();

        for record in due {
            match self.process_due(&record.id, now).await {
                Ok(step) => {
                    if step.auto_missed {
                        report.auto_missed.push(record.id.clone());
                    }
                    if step.pre_alert {
                        report.pre_alerts.push(record.id.clone());
                    }
                    if step.confirm_started {
                        report.confirm_started.push(record.id.clone());
                    }
                    report.prompts.extend(step.prompt);
                }
                // A user action won the race for this record.
                Err(err) if err.is_invalid_transition() => {
                    debug!("tick: dose {} changed underneath: {err}", record.id);
                }
                Err(err) => {
                    log::error!("tick: processing dose {} failed: {err}", record.id);
                    report.failures.push(TickFailure {
                        dose_id: record.id.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        self.locks.prune();
        Ok(report)
    }

    /// Spawns the recurring ticker, replacing a previous one.
    pub async fn start(&self) {
        let mut ticker_guard = self.ticker.lock().await;
        if let Some(previous) = ticker_guard.take() {
            previous.cancel.cancel();
            previous.handle.abort();
        }

        let cancel = CancellationToken::new();
        let scheduler = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            scheduler.ticker_loop(token).await;
        });

        *ticker_guard = Some(Ticker { cancel, handle });
    }

    pub async fn stop(&self) {
        let ticker = self.ticker.lock().await.take();
        if let Some(ticker) = ticker {
            ticker.cancel.cancel();
            if let Err(err) = ticker.handle.await {
                if !err.is_cancelled() {
                    log_error!("ticker task ended abnormally: {err}");
                }
            }
        }
    }

    async fn ticker_loop(&self, cancel: CancellationToken) {
        let mut interval = time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log_info!(
            "dose ticker started (every {:?})",
            self.config.tick_interval
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = self.clock.now();
                    match self.tick(now).await {
                        Ok(report) if !report.failures.is_empty() => {
                            log_warn!(
                                "tick at {now}: {} of {} due doses failed",
                                report.failures.len(),
                                report.scanned
                            );
                        }
                        Ok(report) => {
                            log_debug!(
                                "tick at {now}: scanned {}, missed {}, prompts {}",
                                report.scanned,
                                report.auto_missed.len(),
                                report.prompts.len()
                            );
                        }
                        Err(err) => log_error!("tick at {now} failed: {err}"),
                    }
                }
                _ = cancel.cancelled() => {
                    log_info!("dose ticker shutting down");
                    break;
                }
            }
        }
    }

    /// Handles one due record under its lock, re-reading it first so a stale
    /// due-list entry never fires.
    async fn process_due(&self, dose_id: &str, now: DateTime<Utc>) -> Result<Step, DoseError> {
        let _guard = self.locks.acquire(dose_id).await;
        let mut step = Step::default();

        let Some(mut record) = self.repo.get(dose_id).await? else {
            self.forget_prompt(dose_id);
            return Ok(step);
        };
        if record.is_terminal() {
            self.forget_prompt(dose_id);
            return Ok(step);
        }
        if !record.next_alert_at.is_some_and(|at| at <= now) {
            return Ok(step);
        }

        let policy = &self.config.policy;
        if policy.is_past_deadline(record.scheduled_at, now) {
            self.commit(&record, Trigger::AutoMiss, now).await?;
            step.auto_missed = true;
            return Ok(step);
        }

        match classify(&record, now, policy) {
            AlertKind::Pre => {
                self.commit(&record, Trigger::ArmPreAlert, now).await?;
                step.pre_alert = true;
            }
            alert @ (AlertKind::Main | AlertKind::Confirm) => {
                if !record.has_pre_alert && now >= policy.pre_alert_at(record.scheduled_at) {
                    record = self.commit(&record, Trigger::ArmPreAlert, now).await?;
                }
                step.prompt = Some(self.surface(record, alert, now));
            }
            AlertKind::None => {
                if record.status == DoseStatus::Scheduled
                    && now >= policy.confirm_at(record.scheduled_at)
                {
                    record = self.commit(&record, Trigger::StartConfirmCycle, now).await?;
                    step.confirm_started = true;
                    let alert = classify(&record, now, policy);
                    if alert.needs_decision() {
                        step.prompt = Some(self.surface(record, alert, now));
                    }
                }
            }
        }

        Ok(step)
    }

    /// Runs the state machine and dispatches its intents. The store write
    /// happens first; nothing else runs if it fails.
    async fn commit(
        &self,
        record: &DoseRecord,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> Result<DoseRecord, DoseError> {
        let Transition { record, intents } =
            state::apply(record, trigger, now, &self.config.policy)?;

        for intent in intents {
            match intent {
                Intent::Persist { dose_id, patch } => {
                    self.repo.save(&record).await?;
                    self.forget_prompt(&dose_id);
                    debug!(
                        "dose {dose_id} -> {} after {trigger} (retries {}, next {:?})",
                        patch.status.as_str(),
                        patch.retries,
                        patch.next_alert_at
                    );
                    if patch.retries > self.config.policy.max_retries {
                        warn!(
                            "dose {dose_id} has {} retries, above the ceiling of {}",
                            patch.retries, self.config.policy.max_retries
                        );
                    }
                    self.bus.publish(&DoseEvent::Changed {
                        record: record.clone(),
                        trigger,
                    });
                }
                Intent::PreAlert { dose_id } => {
                    debug!("pre-alert for dose {dose_id}");
                    self.bus.publish(&DoseEvent::PreAlert {
                        record: record.clone(),
                    });
                }
                // The persisted next_alert_at is the schedule; list_due picks it up.
                Intent::RescheduleAlert { dose_id, at } => {
                    debug!("dose {dose_id} re-armed for {at}");
                }
                Intent::NotifyCaregiver {
                    dose_id,
                    patient_id,
                    outcome,
                } => match self.notifier.notify_once(&dose_id, &patient_id, outcome).await {
                    Ok(true) => info!(
                        "caregivers of {patient_id} notified: dose {dose_id} {}",
                        outcome.as_str()
                    ),
                    Ok(false) => debug!(
                        "no caregiver notice for dose {dose_id} {}: already sent or no links",
                        outcome.as_str()
                    ),
                    Err(err) => log::error!("{err}"),
                },
            }
        }

        Ok(record)
    }

    /// Adds the record to the due-list; listeners only hear about it the first
    /// time a given revision is surfaced with a given alert.
    fn surface(&self, record: DoseRecord, alert: AlertKind, now: DateTime<Utc>) -> DuePrompt {
        let (prompt, fresh) = {
            let mut prompts = self.prompts();
            let fresh = prompts.get(&record.id).map_or(true, |existing| {
                existing.alert != alert || existing.record.revision != record.revision
            });
            if fresh {
                prompts.insert(
                    record.id.clone(),
                    DuePrompt {
                        record: record.clone(),
                        alert,
                        surfaced_at: now,
                    },
                );
            }
            (prompts[&record.id].clone(), fresh)
        };

        if fresh {
            self.bus.publish(&DoseEvent::AlertDue {
                record: prompt.record.clone(),
                alert,
            });
        }
        prompt
    }

    fn forget_prompt(&self, dose_id: &str) {
        self.prompts().remove(dose_id);
    }

    fn forget_removed(&self, dose_ids: &[String]) {
        if dose_ids.is_empty() {
            return;
        }
        {
            let mut prompts = self.prompts();
            for id in dose_ids {
                prompts.remove(id);
            }
        }
        self.bus.publish(&DoseEvent::Removed {
            dose_ids: dose_ids.to_vec(),
        });
    }

    fn prompts(&self) -> MutexGuard<'_, BTreeMap<String, DuePrompt>> {
        match self.prompts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
