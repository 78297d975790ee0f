pub mod clock;
pub mod db;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod reminder;
pub mod settings;
pub mod utils;

use std::{path::PathBuf, sync::Arc};

use chrono::Utc;
use log::{info, warn};

pub use clock::{Clock, ManualClock, SystemClock};
pub use db::models::{
    CaregiverLink, DoseOutcome, DoseRecord, DoseStatus, IntakeContext, SlotBucket,
};
pub use db::{Database, SqliteCaregiverNotifier};
pub use error::{DoseError, NotifyError, StoreError};
pub use gateway::{
    CaregiverChannel, CaregiverMessage, CaregiverNotifier, DoseRepository, LogChannel,
    MemoryCaregiverNotifier, MemoryDoseRepository,
};
pub use registry::MedicationPlan;
pub use reminder::{
    AlertKind, DoseAction, DoseEvent, DoseScheduler, ReminderPolicy, SchedulerConfig, TickReport,
    Trigger,
};
pub use settings::{ReminderSettings, SettingsStore};

const DATA_DIR_ENV: &str = "DOSEWATCH_DATA_DIR";

fn data_dir() -> PathBuf {
    std::env::var_os(DATA_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("data"))
}

fn log_event(event: &DoseEvent) {
    match event {
        DoseEvent::Scheduled { record } => {
            info!("dose {} scheduled for {}", record.id, record.scheduled_at)
        }
        DoseEvent::Changed { record, trigger } => info!(
            "dose {} -> {} ({trigger})",
            record.id,
            record.status.as_str()
        ),
        DoseEvent::PreAlert { record } => {
            info!("pre-alert: dose {} at {}", record.id, record.scheduled_at)
        }
        DoseEvent::AlertDue { record, alert } => {
            info!("alert due: dose {} ({alert:?})", record.id)
        }
        DoseEvent::Removed { dose_ids } => info!("{} doses removed", dose_ids.len()),
    }
}

/// Runs the reminder daemon until Ctrl-C.
pub async fn run() -> anyhow::Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("dosewatch starting up...");

    let data_dir = data_dir();
    std::fs::create_dir_all(&data_dir)?;

    let settings = SettingsStore::new(data_dir.join("settings.json"))?;
    let reminders = settings.reminders();

    let database = Database::new(data_dir.join("dosewatch.sqlite3"))?;
    let notifier = SqliteCaregiverNotifier::new(database.clone(), Arc::new(LogChannel));

    let scheduler = DoseScheduler::new(
        Arc::new(database.clone()),
        Arc::new(notifier),
        Arc::new(SystemClock),
        reminders.scheduler_config()?,
    );
    let subscription = scheduler.on_change(log_event);

    // Catch up on everything that came due while the process was down.
    let now = Utc::now();
    let report = scheduler.tick(now).await?;
    if !report.auto_missed.is_empty() {
        warn!(
            "Recovered {} doses past their deadline; marked as missed",
            report.auto_missed.len()
        );
    }

    let purged = scheduler.purge_before(now - reminders.retention()?).await?;
    if !purged.is_empty() {
        info!("Purged {} resolved doses", purged.len());
    }

    scheduler.start().await;
    tokio::signal::ctrl_c().await?;

    info!("dosewatch shutting down");
    scheduler.stop().await;
    subscription.unsubscribe();
    Ok(())
}
