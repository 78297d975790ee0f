use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};

pub const MAX_RETRIES: u32 = 6;

/// Timing policy for the alert cycle. Defaults are the production values.
#[derive(Debug, Clone)]
pub struct ReminderPolicy {
    /// Advisory alert lead time before `scheduled_at`
    pub pre_alert_offset: Duration,

    /// How far a snooze pushes the next main alert
    pub snooze_duration: Duration,

    /// Delay after `scheduled_at` at which an unanswered dose enters the confirm cycle
    pub confirm_start_offset: Duration,

    /// Repeat cadence after a "not yet" answer
    pub confirm_interval: Duration,

    /// Absolute deadline after `scheduled_at`; measured from T, not from the last alert
    pub miss_deadline: Duration,

    pub max_retries: u32,

    /// When set, a snooze / "not yet" that pushes `retries` past `max_retries`
    /// resolves the dose as missed instead of re-arming it.
    pub enforce_retry_ceiling: bool,
}

impl Default for ReminderPolicy {
    fn default() -> Self {
        Self {
            pre_alert_offset: Duration::minutes(15),
            snooze_duration: Duration::minutes(10),
            confirm_start_offset: Duration::minutes(15),
            confirm_interval: Duration::minutes(15),
            miss_deadline: Duration::minutes(90),
            max_retries: MAX_RETRIES,
            enforce_retry_ceiling: false,
        }
    }
}

impl ReminderPolicy {
    pub fn pre_alert_at(&self, scheduled_at: DateTime<Utc>) -> DateTime<Utc> {
        scheduled_at - self.pre_alert_offset
    }

    pub fn confirm_at(&self, scheduled_at: DateTime<Utc>) -> DateTime<Utc> {
        scheduled_at + self.confirm_start_offset
    }

    pub fn deadline(&self, scheduled_at: DateTime<Utc>) -> DateTime<Utc> {
        scheduled_at + self.miss_deadline
    }

    pub fn is_past_deadline(&self, scheduled_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - scheduled_at >= self.miss_deadline
    }

    /// Never re-arm a live dose beyond its deadline.
    pub fn clamp_to_deadline(
        &self,
        scheduled_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> DateTime<Utc> {
        at.min(self.deadline(scheduled_at))
    }
}

/// Scheduler runtime settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub policy: ReminderPolicy,

    /// Period of the background ticker
    pub tick_interval: StdDuration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            policy: ReminderPolicy::default(),
            tick_interval: StdDuration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn default_policy_matches_production_timings() {
        let policy = ReminderPolicy::default();
        assert_eq!(policy.pre_alert_offset, Duration::minutes(15));
        assert_eq!(policy.snooze_duration, Duration::minutes(10));
        assert_eq!(policy.confirm_interval, Duration::minutes(15));
        assert_eq!(policy.miss_deadline, Duration::minutes(90));
        assert_eq!(policy.max_retries, 6);
        assert!(!policy.enforce_retry_ceiling);
    }

    #[test]
    fn clamp_never_passes_deadline() {
        let policy = ReminderPolicy::default();
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let late = t + Duration::minutes(95);
        assert_eq!(policy.clamp_to_deadline(t, late), t + Duration::minutes(90));
        let early = t + Duration::minutes(30);
        assert_eq!(policy.clamp_to_deadline(t, early), early);
    }

    #[test]
    fn deadline_is_inclusive() {
        let policy = ReminderPolicy::default();
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        assert!(!policy.is_past_deadline(t, t + Duration::minutes(89)));
        assert!(policy.is_past_deadline(t, t + Duration::minutes(90)));
    }
}
