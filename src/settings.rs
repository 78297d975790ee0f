use anyhow::{bail, Context, Result};
use chrono::Duration;
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration as StdDuration,
};

use crate::reminder::{ReminderPolicy, SchedulerConfig, MAX_RETRIES};

const MAX_OFFSET_MINUTES: i64 = 24 * 60;
const MAX_TICK_INTERVAL_SECS: u64 = 60 * 60;
const MAX_RETENTION_DAYS: i64 = 36_500;

/// Alert timings as persisted in `settings.json`, in whole minutes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReminderSettings {
    pub pre_alert_minutes: i64,
    pub snooze_minutes: i64,
    pub confirm_start_minutes: i64,
    pub confirm_interval_minutes: i64,
    pub miss_deadline_minutes: i64,
    pub max_retries: u32,
    pub enforce_retry_ceiling: bool,
    pub tick_interval_secs: u64,
    /// Resolved doses older than this are purged at startup.
    pub retention_days: i64,
}

impl Default for ReminderSettings {
    fn default() -> Self {
        Self {
            pre_alert_minutes: 15,
            snooze_minutes: 10,
            confirm_start_minutes: 15,
            confirm_interval_minutes: 15,
            miss_deadline_minutes: 90,
            max_retries: MAX_RETRIES,
            enforce_retry_ceiling: false,
            tick_interval_secs: 60,
            retention_days: 30,
        }
    }
}

impl ReminderSettings {
    pub fn validate(&self) -> Result<()> {
        let offsets = [
            ("pre_alert_minutes", self.pre_alert_minutes),
            ("snooze_minutes", self.snooze_minutes),
            ("confirm_start_minutes", self.confirm_start_minutes),
            ("confirm_interval_minutes", self.confirm_interval_minutes),
            ("miss_deadline_minutes", self.miss_deadline_minutes),
        ];
        for (name, minutes) in offsets {
            if !(1..=MAX_OFFSET_MINUTES).contains(&minutes) {
                bail!("{name} must be between 1 and {MAX_OFFSET_MINUTES}, got {minutes}");
            }
        }
        if self.confirm_start_minutes >= self.miss_deadline_minutes {
            bail!("confirm cycle must start before the miss deadline");
        }
        if !(1..=MAX_TICK_INTERVAL_SECS).contains(&self.tick_interval_secs) {
            bail!(
                "tick_interval_secs must be between 1 and {MAX_TICK_INTERVAL_SECS}, got {}",
                self.tick_interval_secs
            );
        }
        if !(0..=MAX_RETENTION_DAYS).contains(&self.retention_days) {
            bail!(
                "retention_days must be between 0 and {MAX_RETENTION_DAYS}, got {}",
                self.retention_days
            );
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> Result<SchedulerConfig> {
        self.validate()?;
        Ok(SchedulerConfig {
            policy: ReminderPolicy {
                pre_alert_offset: minutes(self.pre_alert_minutes)?,
                snooze_duration: minutes(self.snooze_minutes)?,
                confirm_start_offset: minutes(self.confirm_start_minutes)?,
                confirm_interval: minutes(self.confirm_interval_minutes)?,
                miss_deadline: minutes(self.miss_deadline_minutes)?,
                max_retries: self.max_retries,
                enforce_retry_ceiling: self.enforce_retry_ceiling,
            },
            tick_interval: StdDuration::from_secs(self.tick_interval_secs),
        })
    }

    pub fn retention(&self) -> Result<Duration> {
        Duration::try_days(self.retention_days)
            .with_context(|| format!("retention_days out of range: {}", self.retention_days))
    }
}

fn minutes(value: i64) -> Result<Duration> {
    Duration::try_minutes(value).with_context(|| format!("{value} minutes is out of range"))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct UserSettings {
    reminders: ReminderSettings,
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<UserSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            match serde_json::from_str::<UserSettings>(&contents) {
                Ok(data) if data.reminders.validate().is_ok() => data,
                Ok(_) | Err(_) => {
                    warn!(
                        "Ignoring invalid settings in {}; using defaults",
                        path.display()
                    );
                    UserSettings::default()
                }
            }
        } else {
            UserSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn reminders(&self) -> ReminderSettings {
        self.read().reminders.clone()
    }

    pub fn update_reminders(&self, settings: ReminderSettings) -> Result<()> {
        settings.validate()?;
        let mut guard = self.write();
        guard.reminders = settings;
        self.persist(&guard)
    }

    fn persist(&self, data: &UserSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }

    fn read(&self) -> RwLockReadGuard<'_, UserSettings> {
        match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, UserSettings> {
        match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_production_defaults() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json")).unwrap();
        let config = store.reminders().scheduler_config().unwrap();
        assert_eq!(config.policy.miss_deadline, Duration::minutes(90));
        assert_eq!(config.policy.snooze_duration, Duration::minutes(10));
        assert_eq!(config.tick_interval, StdDuration::from_secs(60));
    }

    #[test]
    fn updates_persist_across_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::new(path.clone()).unwrap();

        let updated = ReminderSettings {
            snooze_minutes: 5,
            enforce_retry_ceiling: true,
            ..ReminderSettings::default()
        };
        store.update_reminders(updated.clone()).unwrap();

        let reloaded = SettingsStore::new(path).unwrap();
        assert_eq!(reloaded.reminders(), updated);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::new(path.clone()).unwrap();

        let bad = ReminderSettings {
            confirm_start_minutes: 120,
            ..ReminderSettings::default()
        };
        assert!(store.update_reminders(bad).is_err());

        fs::write(&path, r#"{"reminders": {"snooze_minutes": -3}}"#).unwrap();
        let reloaded = SettingsStore::new(path).unwrap();
        assert_eq!(reloaded.reminders(), ReminderSettings::default());
    }

    #[test]
    fn oversized_values_fall_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        for contents in [
            r#"{"reminders": {"miss_deadline_minutes": 9223372036854775807}}"#,
            r#"{"reminders": {"retention_days": 9223372036854775807}}"#,
            r#"{"reminders": {"snooze_minutes": 1000000}}"#,
            r#"{"reminders": {"tick_interval_secs": 18446744073709551615}}"#,
        ] {
            fs::write(&path, contents).unwrap();
            let store = SettingsStore::new(path.clone()).unwrap();
            let reminders = store.reminders();
            assert_eq!(reminders, ReminderSettings::default(), "{contents}");
            assert!(reminders.scheduler_config().is_ok());
            assert_eq!(reminders.retention().unwrap(), Duration::days(30));
        }
    }

    #[test]
    fn out_of_range_settings_never_build_a_config() {
        let huge = ReminderSettings {
            miss_deadline_minutes: i64::MAX,
            ..ReminderSettings::default()
        };
        assert!(huge.validate().is_err());
        assert!(huge.scheduler_config().is_err());

        let forever = ReminderSettings {
            retention_days: i64::MAX,
            ..ReminderSettings::default()
        };
        assert!(forever.retention().is_err());
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"reminders": {"tick_interval_secs": 15}}"#).unwrap();

        let store = SettingsStore::new(path).unwrap();
        let reminders = store.reminders();
        assert_eq!(reminders.tick_interval_secs, 15);
        assert_eq!(reminders.miss_deadline_minutes, 90);
    }
}
