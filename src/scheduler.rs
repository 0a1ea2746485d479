//! Wake-up scheduling for alarms
//!
//! [`AlarmsScheduler`] answers "when should this alarm next wake up" and keeps
//! the ledger of wake-ups handed to the [`WakeupTimer`]. The ledger holds at
//! most one [`ScheduledWakeup`] per `(AlarmId, CalendarType)`; arranging a new
//! one for the same key supersedes the old one under the same lock.

use chrono::{Datelike, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::alarm::AlarmConfig;
use crate::calendar_type::CalendarType;
use crate::config::{FallbackPolicy, SchedulingConfig};
use crate::error::ScheduleError;
use crate::AlarmId;

/// Action of the event delivered when a normal or auto-silence wake-up is due
pub const ACTION_FIRED: &str = "alarmcore.action.FIRED";
/// Action of the event delivered when an inexact fallback wake-up is due
pub const ACTION_INEXACT_FIRED: &str = "alarmcore.action.INEXACT_FIRED";
/// Integer extra carrying the alarm id
pub const EXTRA_ID: &str = "alarmcore.extra.ID";
/// String extra carrying the [`CalendarType`] tag
pub const EXTRA_TYPE: &str = "alarmcore.extra.TYPE";

/// Ledger key
pub type WakeupKey = (AlarmId, CalendarType);

/// One outstanding request to the wake-up timer service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledWakeup {
    pub id: AlarmId,
    pub calendar_type: CalendarType,
    pub at: NaiveDateTime,
    pub exact: bool,
}

impl ScheduledWakeup {
    pub fn key(&self) -> WakeupKey {
        (self.id, self.calendar_type)
    }
}

/// The external wake-up timer service.
///
/// `arrange` must supersede any earlier registration for the same key and
/// must not block.
pub trait WakeupTimer: Send + Sync {
    fn arrange(&self, wakeup: &ScheduledWakeup);

    fn cancel(&self, id: AlarmId, calendar_type: CalendarType);

    /// Whether exact wake-ups are currently permitted
    fn can_schedule_exact(&self) -> bool {
        true
    }
}

/// Computes wake-up instants and arranges them with the timer service
pub struct AlarmsScheduler {
    timer: Arc<dyn WakeupTimer>,
    config: SchedulingConfig,
    outstanding: Mutex<BTreeMap<WakeupKey, ScheduledWakeup>>,
}

impl std::fmt::Debug for AlarmsScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlarmsScheduler")
            .field("config", &self.config)
            .field("outstanding", &self.ledger().len())
            .finish()
    }
}

impl AlarmsScheduler {
    pub fn new(timer: Arc<dyn WakeupTimer>, config: SchedulingConfig) -> Self {
        Self {
            timer,
            config,
            outstanding: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &SchedulingConfig {
        &self.config
    }

    /// Earliest instant strictly after `after` that satisfies the alarm's rule.
    ///
    /// One-shot alarms (no repeat days) may occur on any day.
    pub fn next_occurrence(
        config: &AlarmConfig,
        after: NaiveDateTime,
    ) -> Result<NaiveDateTime, ScheduleError> {
        let time = config.time_of_day()?;
        config.days.validate()?;

        let mut date = after.date();
        // Today plus the seven following days covers every weekday.
        for _ in 0..8 {
            let candidate = date.and_time(time);
            if candidate > after && config.days.allows(date.weekday()) {
                return Ok(candidate);
            }
            date = date.succ_opt().ok_or(ScheduleError::OutOfRange)?;
        }

        Err(ScheduleError::OutOfRange)
    }

    /// Arrange a wake-up, superseding any outstanding one for the same key.
    ///
    /// Normal wake-ups get an inexact fallback when the fallback policy asks
    /// for one; otherwise any stale fallback is cancelled.
    pub fn set_alarm(
        &self,
        id: AlarmId,
        calendar_type: CalendarType,
        at: NaiveDateTime,
    ) -> ScheduledWakeup {
        let exact = self.timer.can_schedule_exact();
        let wakeup = ScheduledWakeup {
            id,
            calendar_type,
            at,
            exact,
        };

        let mut ledger = self.ledger();
        self.arrange_locked(&mut ledger, wakeup);

        if calendar_type == CalendarType::Normal {
            let wants_fallback = match self.config.inexact_fallback {
                FallbackPolicy::Never => false,
                FallbackPolicy::WhenExactUnavailable => !exact,
                FallbackPolicy::Always => true,
            };
            if wants_fallback {
                let fallback = ScheduledWakeup {
                    id,
                    calendar_type: CalendarType::Inexact,
                    at: at + self.config.inexact_margin(),
                    exact: false,
                };
                self.arrange_locked(&mut ledger, fallback);
            } else {
                self.remove_locked(&mut ledger, id, CalendarType::Inexact);
            }
        }

        wakeup
    }

    /// Cancel one wake-up. Removing the normal wake-up also removes its fallback.
    pub fn remove(&self, id: AlarmId, calendar_type: CalendarType) {
        let mut ledger = self.ledger();
        self.remove_locked(&mut ledger, id, calendar_type);
        if calendar_type == CalendarType::Normal {
            self.remove_locked(&mut ledger, id, CalendarType::Inexact);
        }
    }

    /// Cancel every wake-up of an alarm
    pub fn remove_alarm(&self, id: AlarmId) {
        let mut ledger = self.ledger();
        for calendar_type in CalendarType::ALL {
            self.remove_locked(&mut ledger, id, calendar_type);
        }
    }

    /// Whether the wake-up is outstanding and due at `now`
    pub fn is_due(&self, id: AlarmId, calendar_type: CalendarType, now: NaiveDateTime) -> bool {
        self.ledger()
            .get(&(id, calendar_type))
            .is_some_and(|w| w.at <= now + self.config.delivery_tolerance())
    }

    /// Consume a delivered wake-up if it is outstanding and due.
    ///
    /// Returns `None` for stale or duplicate deliveries. Consuming the normal
    /// wake-up also retires its inexact fallback.
    pub fn take_due(
        &self,
        id: AlarmId,
        calendar_type: CalendarType,
        now: NaiveDateTime,
    ) -> Option<ScheduledWakeup> {
        let mut ledger = self.ledger();
        let due = ledger
            .get(&(id, calendar_type))
            .is_some_and(|w| w.at <= now + self.config.delivery_tolerance());
        if !due {
            return None;
        }

        let taken = ledger.remove(&(id, calendar_type));
        if calendar_type == CalendarType::Normal {
            self.remove_locked(&mut ledger, id, CalendarType::Inexact);
        }
        taken
    }

    /// Hand every outstanding wake-up of an alarm to the timer again
    pub fn rearm(&self, id: AlarmId) {
        let ledger = self.ledger();
        for (_, wakeup) in ledger.range((id, CalendarType::Normal)..=(id, CalendarType::Inexact)) {
            self.timer.arrange(wakeup);
        }
    }

    pub fn wakeup(&self, id: AlarmId, calendar_type: CalendarType) -> Option<ScheduledWakeup> {
        self.ledger().get(&(id, calendar_type)).copied()
    }

    pub fn outstanding_for(&self, id: AlarmId) -> Vec<ScheduledWakeup> {
        self.ledger()
            .range((id, CalendarType::Normal)..=(id, CalendarType::Inexact))
            .map(|(_, w)| *w)
            .collect()
    }

    /// Snapshot of the whole ledger, ordered by key
    pub fn outstanding(&self) -> Vec<ScheduledWakeup> {
        self.ledger().values().copied().collect()
    }

    fn arrange_locked(
        &self,
        ledger: &mut BTreeMap<WakeupKey, ScheduledWakeup>,
        wakeup: ScheduledWakeup,
    ) {
        tracing::debug!(
            id = wakeup.id,
            calendar_type = %wakeup.calendar_type,
            at = %wakeup.at,
            exact = wakeup.exact,
            "Arranging wake-up"
        );
        ledger.insert(wakeup.key(), wakeup);
        self.timer.arrange(&wakeup);
    }

    fn remove_locked(
        &self,
        ledger: &mut BTreeMap<WakeupKey, ScheduledWakeup>,
        id: AlarmId,
        calendar_type: CalendarType,
    ) {
        if ledger.remove(&(id, calendar_type)).is_some() {
            tracing::debug!(id, calendar_type = %calendar_type, "Cancelling wake-up");
            self.timer.cancel(id, calendar_type);
        }
    }

    fn ledger(&self) -> MutexGuard<'_, BTreeMap<WakeupKey, ScheduledWakeup>> {
        self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::DaysOfWeek;
    use crate::timer::SimulatedTimer;
    use chrono::{Duration, NaiveDate, Weekday};

    // 2024-03-04 is a Monday
    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn config(hour: u32, minutes: u32, days: DaysOfWeek) -> AlarmConfig {
        AlarmConfig {
            hour,
            minutes,
            days,
            ..AlarmConfig::default()
        }
    }

    fn scheduler(timer: Arc<SimulatedTimer>, policy: FallbackPolicy) -> AlarmsScheduler {
        let config = SchedulingConfig {
            inexact_fallback: policy,
            ..SchedulingConfig::default()
        };
        AlarmsScheduler::new(timer, config)
    }

    #[test]
    fn test_one_shot_later_today() {
        let next =
            AlarmsScheduler::next_occurrence(&config(7, 0, DaysOfWeek::NONE), at(4, 6, 0)).unwrap();
        assert_eq!(next, at(4, 7, 0));
    }

    #[test]
    fn test_occurrence_is_strictly_after() {
        let next = AlarmsScheduler::next_occurrence(&config(7, 0, DaysOfWeek::EVERY_DAY), at(4, 7, 0))
            .unwrap();
        assert_eq!(next, at(5, 7, 0));
    }

    #[test]
    fn test_repeat_days_skip_to_allowed_weekday() {
        let days = DaysOfWeek::from_days(&[Weekday::Fri]);
        // Monday 08:00 -> Friday 07:00
        let next = AlarmsScheduler::next_occurrence(&config(7, 0, days), at(4, 8, 0)).unwrap();
        assert_eq!(next, at(8, 7, 0));

        // Friday 07:30 -> next Friday
        let next = AlarmsScheduler::next_occurrence(&config(7, 0, days), at(8, 7, 30)).unwrap();
        assert_eq!(next, at(15, 7, 0));
    }

    #[test]
    fn test_malformed_rules() {
        assert_eq!(
            AlarmsScheduler::next_occurrence(&config(24, 0, DaysOfWeek::NONE), at(4, 6, 0)),
            Err(ScheduleError::InvalidTime { hour: 24, minutes: 0 })
        );
        assert_eq!(
            AlarmsScheduler::next_occurrence(&config(7, 60, DaysOfWeek::NONE), at(4, 6, 0)),
            Err(ScheduleError::InvalidTime { hour: 7, minutes: 60 })
        );
        assert_eq!(
            AlarmsScheduler::next_occurrence(&config(7, 0, DaysOfWeek::from_bits(0x81)), at(4, 6, 0)),
            Err(ScheduleError::InvalidRepeatRule(0x81))
        );
    }

    #[test]
    fn test_set_alarm_supersedes_same_key() {
        let timer = Arc::new(SimulatedTimer::new());
        let scheduler = scheduler(timer.clone(), FallbackPolicy::Never);

        scheduler.set_alarm(1, CalendarType::Normal, at(4, 7, 0));
        scheduler.set_alarm(1, CalendarType::Normal, at(5, 7, 0));
        scheduler.set_alarm(1, CalendarType::Autosilence, at(4, 7, 10));

        let outstanding = scheduler.outstanding();
        assert_eq!(outstanding.len(), 2);
        assert_eq!(
            scheduler.wakeup(1, CalendarType::Normal).map(|w| w.at),
            Some(at(5, 7, 0))
        );
        assert_eq!(timer.pending().len(), 2);
        assert_eq!(timer.arrange_count(), 3);
    }

    #[test]
    fn test_fallback_when_exact_unavailable() {
        let timer = Arc::new(SimulatedTimer::new());
        let scheduler = scheduler(timer.clone(), FallbackPolicy::WhenExactUnavailable);

        let wakeup = scheduler.set_alarm(1, CalendarType::Normal, at(4, 7, 0));
        assert!(wakeup.exact);
        assert!(scheduler.wakeup(1, CalendarType::Inexact).is_none());

        timer.set_exact_allowed(false);
        let wakeup = scheduler.set_alarm(1, CalendarType::Normal, at(5, 7, 0));
        assert!(!wakeup.exact);
        let fallback = scheduler.wakeup(1, CalendarType::Inexact).unwrap();
        assert_eq!(fallback.at, at(5, 7, 0) + Duration::minutes(5));
        assert!(!fallback.exact);

        // Exact permitted again: the stale fallback goes away
        timer.set_exact_allowed(true);
        scheduler.set_alarm(1, CalendarType::Normal, at(6, 7, 0));
        assert!(scheduler.wakeup(1, CalendarType::Inexact).is_none());
        assert!(timer.pending().iter().all(|w| w.calendar_type != CalendarType::Inexact));
    }

    #[test]
    fn test_always_fallback_only_for_normal() {
        let timer = Arc::new(SimulatedTimer::new());
        let scheduler = scheduler(timer, FallbackPolicy::Always);

        scheduler.set_alarm(1, CalendarType::Autosilence, at(4, 7, 10));
        assert!(scheduler.wakeup(1, CalendarType::Inexact).is_none());

        scheduler.set_alarm(1, CalendarType::Normal, at(4, 7, 0));
        assert!(scheduler.wakeup(1, CalendarType::Inexact).is_some());
    }

    #[test]
    fn test_take_due_consumes_once() {
        let timer = Arc::new(SimulatedTimer::new());
        let scheduler = scheduler(timer.clone(), FallbackPolicy::Always);
        scheduler.set_alarm(3, CalendarType::Normal, at(4, 7, 0));

        assert!(scheduler.take_due(3, CalendarType::Normal, at(4, 6, 59)).is_none());
        // Within delivery tolerance
        assert!(scheduler.is_due(3, CalendarType::Normal, at(4, 6, 59) + Duration::seconds(56)));

        let taken = scheduler.take_due(3, CalendarType::Normal, at(4, 7, 0)).unwrap();
        assert_eq!(taken.at, at(4, 7, 0));
        // The paired fallback is retired with it
        assert!(scheduler.outstanding_for(3).is_empty());
        assert!(timer.pending().is_empty());

        assert!(scheduler.take_due(3, CalendarType::Normal, at(4, 7, 0)).is_none());
    }

    #[test]
    fn test_remove_alarm_cancels_everything() {
        let timer = Arc::new(SimulatedTimer::new());
        let scheduler = scheduler(timer.clone(), FallbackPolicy::Always);
        scheduler.set_alarm(1, CalendarType::Normal, at(4, 7, 0));
        scheduler.set_alarm(1, CalendarType::Autosilence, at(4, 7, 10));
        scheduler.set_alarm(2, CalendarType::Normal, at(4, 8, 0));

        scheduler.remove_alarm(1);
        assert!(scheduler.outstanding_for(1).is_empty());
        assert_eq!(scheduler.outstanding_for(2).len(), 2);
        assert!(timer.pending().iter().all(|w| w.id == 2));
    }

    #[test]
    fn test_rearm_resends_entries() {
        let timer = Arc::new(SimulatedTimer::new());
        let scheduler = scheduler(timer.clone(), FallbackPolicy::Never);
        scheduler.set_alarm(1, CalendarType::Normal, at(4, 7, 0));

        timer.clear();
        assert!(timer.pending().is_empty());

        scheduler.rearm(1);
        assert_eq!(timer.pending(), scheduler.outstanding());
    }
}
