//! Per-alarm state machine
//!
//! Each [`Alarm`] owns its [`AlarmRecord`] behind its own mutex, so
//! transitions of one alarm are serialized while different alarms proceed
//! independently. Every transition persists the resulting record.

use chrono::{NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::calendar_type::CalendarType;
use crate::clock::Clock;
use crate::error::{AlarmError, ScheduleError};
use crate::scheduler::AlarmsScheduler;
use crate::store::AlarmStore;
use crate::AlarmId;

const ALL_DAYS_MASK: u8 = 0b0111_1111;

/// Repeat rule: a bit mask over Monday (bit 0) to Sunday (bit 6).
///
/// An empty mask is a one-shot alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DaysOfWeek(u8);

impl DaysOfWeek {
    pub const NONE: Self = Self(0);
    pub const EVERY_DAY: Self = Self(ALL_DAYS_MASK);
    pub const WEEKDAYS: Self = Self(0b0001_1111);

    /// Raw bits, unchecked. Use [`DaysOfWeek::validate`] before relying on them.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn from_days(days: &[Weekday]) -> Self {
        Self(
            days.iter()
                .fold(0, |bits, day| bits | 1 << day.num_days_from_monday()),
        )
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn is_repeating(&self) -> bool {
        self.0 & ALL_DAYS_MASK != 0
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    /// Whether an occurrence may fall on `day`
    pub fn allows(&self, day: Weekday) -> bool {
        !self.is_repeating() || self.contains(day)
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.0 & !ALL_DAYS_MASK != 0 {
            return Err(ScheduleError::InvalidRepeatRule(self.0));
        }
        Ok(())
    }

    pub fn days(&self) -> Vec<Weekday> {
        [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ]
        .into_iter()
        .filter(|day| self.contains(*day))
        .collect()
    }
}

/// User-facing alarm settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmConfig {
    pub hour: u32,
    pub minutes: u32,
    #[serde(default)]
    pub days: DaysOfWeek,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub label: String,
}

fn default_enabled() -> bool {
    true
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            hour: 7,
            minutes: 0,
            days: DaysOfWeek::NONE,
            enabled: true,
            label: String::new(),
        }
    }
}

impl AlarmConfig {
    pub fn new(hour: u32, minutes: u32, days: DaysOfWeek) -> Self {
        Self {
            hour,
            minutes,
            days,
            ..Self::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn time_of_day(&self) -> Result<NaiveTime, ScheduleError> {
        NaiveTime::from_hms_opt(self.hour, self.minutes, 0).ok_or(ScheduleError::InvalidTime {
            hour: self.hour,
            minutes: self.minutes,
        })
    }

    pub fn is_repeating(&self) -> bool {
        self.days.is_repeating()
    }
}

/// Lifecycle state of an alarm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmState {
    /// Turned off, nothing arranged
    Disabled,
    /// Waiting for the next normal occurrence
    Scheduled,
    /// Ringing, waiting for the user
    Fired,
    /// Postponed by the user, snooze wake-up pending
    Snoozed,
    /// Next normal occurrence will be consumed without ringing
    SkippedPending,
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disabled => "DISABLED",
            Self::Scheduled => "SCHEDULED",
            Self::Fired => "FIRED",
            Self::Snoozed => "SNOOZED",
            Self::SkippedPending => "SKIPPED_PENDING",
        })
    }
}

/// User actions that are only valid from some states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmAction {
    Snooze,
    Dismiss,
    RequestSkip,
}

impl fmt::Display for AlarmAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Snooze => "snooze",
            Self::Dismiss => "dismiss",
            Self::RequestSkip => "skip",
        })
    }
}

/// What a delivered wake-up did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// The alarm started ringing
    Rang,
    /// A skipped occurrence was consumed silently
    Skipped,
    /// A ringing alarm was silenced without user action
    Silenced,
    /// Stale, duplicate or redundant delivery; nothing user-visible happened
    Ignored,
}

/// Persisted view of one alarm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmRecord {
    pub id: AlarmId,
    pub config: AlarmConfig,
    pub state: AlarmState,
    /// Next normal occurrence (the skipped one while `SKIPPED_PENDING`)
    #[serde(default)]
    pub next_occurrence: Option<NaiveDateTime>,
    #[serde(default)]
    pub snoozed_until: Option<NaiveDateTime>,
    #[serde(default)]
    pub ringing_since: Option<NaiveDateTime>,
}

impl AlarmRecord {
    pub fn new(id: AlarmId, config: AlarmConfig) -> Self {
        Self {
            id,
            config,
            state: AlarmState::Disabled,
            next_occurrence: None,
            snoozed_until: None,
            ringing_since: None,
        }
    }
}

/// Collaborators shared by every alarm of a registry
pub(crate) struct AlarmContext {
    pub(crate) scheduler: Arc<AlarmsScheduler>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) store: Arc<dyn AlarmStore>,
}

/// One alarm and its state machine
pub struct Alarm {
    id: AlarmId,
    record: Mutex<AlarmRecord>,
    ctx: Arc<AlarmContext>,
}

impl fmt::Debug for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Alarm")
            .field("id", &self.id)
            .field("record", &*self.lock())
            .finish()
    }
}

impl Alarm {
    pub(crate) fn new(record: AlarmRecord, ctx: Arc<AlarmContext>) -> Self {
        Self {
            id: record.id,
            record: Mutex::new(record),
            ctx,
        }
    }

    pub fn id(&self) -> AlarmId {
        self.id
    }

    pub fn state(&self) -> AlarmState {
        self.lock().state
    }

    pub fn snapshot(&self) -> AlarmRecord {
        self.lock().clone()
    }

    /// Handle a delivered wake-up.
    ///
    /// Inexact wake-ups are resolved by [`Alarm::on_inexact_alarm_fired`].
    pub fn on_alarm_fired(&self, calendar_type: CalendarType) -> Result<FireOutcome, AlarmError> {
        match calendar_type {
            CalendarType::Inexact => self.on_inexact_alarm_fired(),
            CalendarType::Normal | CalendarType::Autosilence => {
                let mut record = self.lock();
                let now = self.ctx.clock.now();
                self.fire_locked(&mut record, calendar_type, now)
            }
        }
    }

    /// Handle the best-effort fallback wake-up.
    ///
    /// Rings only when it stands in for a normal wake-up that is due but was
    /// never delivered; an occurrence never rings twice.
    pub fn on_inexact_alarm_fired(&self) -> Result<FireOutcome, AlarmError> {
        let mut record = self.lock();
        let now = self.ctx.clock.now();
        let scheduler = &self.ctx.scheduler;

        if scheduler.take_due(self.id, CalendarType::Inexact, now).is_none() {
            tracing::debug!(id = self.id, "Dropping stale inexact wake-up");
            return Ok(FireOutcome::Ignored);
        }

        if scheduler.is_due(self.id, CalendarType::Normal, now) {
            tracing::warn!(
                id = self.id,
                "Exact wake-up was not delivered, handling occurrence from inexact fallback"
            );
            return self.fire_locked(&mut record, CalendarType::Normal, now);
        }

        tracing::debug!(id = self.id, state = %record.state, "Occurrence already delivered");
        Ok(FireOutcome::Ignored)
    }

    /// Postpone a ringing alarm. Returns when it rings again.
    pub fn snooze(&self) -> Result<NaiveDateTime, AlarmError> {
        let mut record = self.lock();
        if record.state != AlarmState::Fired {
            return Err(self.invalid(AlarmAction::Snooze, record.state));
        }

        let until = self.ctx.clock.now() + self.ctx.scheduler.config().snooze_duration();
        self.ctx.scheduler.remove(self.id, CalendarType::Autosilence);
        self.ctx
            .scheduler
            .set_alarm(self.id, CalendarType::Normal, until);

        record.state = AlarmState::Snoozed;
        record.snoozed_until = Some(until);
        record.ringing_since = None;
        tracing::info!(id = self.id, until = %until, "Alarm snoozed");
        self.persist(&record);
        Ok(until)
    }

    /// End the current occurrence of a ringing or snoozed alarm
    pub fn dismiss(&self) -> Result<(), AlarmError> {
        let mut record = self.lock();
        let state = record.state;
        match state {
            AlarmState::Fired | AlarmState::Snoozed => {
                let now = self.ctx.clock.now();
                self.finish_occurrence(&mut record, now)?;
                tracing::info!(id = self.id, state = %record.state, "Alarm dismissed");
                self.persist(&record);
                Ok(())
            }
            state => Err(self.invalid(AlarmAction::Dismiss, state)),
        }
    }

    /// Mark the next normal occurrence to pass without ringing.
    /// Returns the occurrence that will be skipped.
    pub fn request_skip(&self) -> Result<NaiveDateTime, AlarmError> {
        let mut record = self.lock();
        if record.state != AlarmState::Scheduled {
            return Err(self.invalid(AlarmAction::RequestSkip, record.state));
        }

        let skipped = match record.next_occurrence {
            Some(at) => at,
            None => self.compute_next(&record.config, self.ctx.clock.now())?,
        };
        record.state = AlarmState::SkippedPending;
        record.next_occurrence = Some(skipped);
        tracing::info!(id = self.id, occurrence = %skipped, "Next occurrence will be skipped");
        self.persist(&record);
        Ok(skipped)
    }

    /// Replace the alarm's settings and reschedule from now.
    ///
    /// A malformed rule is rejected and nothing changes.
    pub fn edit(&self, config: AlarmConfig) -> Result<(), AlarmError> {
        let mut record = self.lock();
        let now = self.ctx.clock.now();
        self.apply_config(&mut record, config, now)?;
        tracing::debug!(id = self.id, state = %record.state, "Alarm edited");
        self.persist(&record);
        Ok(())
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<(), AlarmError> {
        let config = AlarmConfig {
            enabled,
            ..self.lock().config.clone()
        };
        self.edit(config)
    }

    /// Recompute from scratch and hand every wake-up to the timer again
    pub(crate) fn refresh(&self) -> Result<(), AlarmError> {
        let mut record = self.lock();
        let now = self.ctx.clock.now();
        let scheduler = &self.ctx.scheduler;

        let state = record.state;
        match state {
            AlarmState::Disabled => scheduler.remove_alarm(self.id),
            AlarmState::Scheduled | AlarmState::SkippedPending => {
                self.reschedule_pending(&mut record, now)?
            }
            AlarmState::Snoozed => {
                if let Some(until) = record.snoozed_until {
                    scheduler.set_alarm(self.id, CalendarType::Normal, until);
                }
            }
            AlarmState::Fired => self.arm_next_normal(&mut record, now)?,
        }
        scheduler.rearm(self.id);

        tracing::debug!(id = self.id, state = %record.state, next = ?record.next_occurrence, "Alarm refreshed");
        self.persist(&record);
        Ok(())
    }

    /// Follow a manual wall-clock change without touching the configuration.
    ///
    /// Absolute snooze and auto-silence instants stay where they are, but every
    /// outstanding wake-up is handed to the timer again against the new clock.
    pub(crate) fn on_time_set(&self) -> Result<(), AlarmError> {
        let mut record = self.lock();
        let now = self.ctx.clock.now();

        let state = record.state;
        match state {
            AlarmState::Disabled => return Ok(()),
            AlarmState::Scheduled | AlarmState::SkippedPending => {
                self.reschedule_pending(&mut record, now)?
            }
            AlarmState::Fired => self.arm_next_normal(&mut record, now)?,
            AlarmState::Snoozed => {}
        }
        self.ctx.scheduler.rearm(self.id);

        tracing::debug!(id = self.id, state = %record.state, next = ?record.next_occurrence, "Alarm adjusted to new time");
        self.persist(&record);
        Ok(())
    }

    /// Cancel every wake-up, used when the alarm is deleted
    pub(crate) fn cancel_all(&self) {
        let _record = self.lock();
        self.ctx.scheduler.remove_alarm(self.id);
    }

    fn fire_locked(
        &self,
        record: &mut AlarmRecord,
        calendar_type: CalendarType,
        now: NaiveDateTime,
    ) -> Result<FireOutcome, AlarmError> {
        if self
            .ctx
            .scheduler
            .take_due(self.id, calendar_type, now)
            .is_none()
        {
            tracing::debug!(
                id = self.id,
                calendar_type = %calendar_type,
                state = %record.state,
                "Dropping stale wake-up"
            );
            return Ok(FireOutcome::Ignored);
        }

        let outcome = match calendar_type {
            CalendarType::Autosilence => self.on_autosilence(record, now)?,
            _ => self.on_normal(record, now)?,
        };
        self.persist(record);
        Ok(outcome)
    }

    fn on_normal(
        &self,
        record: &mut AlarmRecord,
        now: NaiveDateTime,
    ) -> Result<FireOutcome, AlarmError> {
        match record.state {
            AlarmState::Scheduled | AlarmState::Snoozed => {
                self.arm_next_normal(record, now)?;
                record.state = AlarmState::Fired;
                record.snoozed_until = None;
                record.ringing_since = Some(now);
                if let Some(after) = self.ctx.scheduler.config().autosilence_duration() {
                    self.ctx
                        .scheduler
                        .set_alarm(self.id, CalendarType::Autosilence, now + after);
                }
                tracing::info!(id = self.id, label = %record.config.label, "Alarm ringing");
                Ok(FireOutcome::Rang)
            }
            AlarmState::SkippedPending => {
                let skipped = record.next_occurrence.unwrap_or(now);
                if record.config.is_repeating() {
                    self.arm_next_normal(record, skipped.max(now))?;
                    record.state = AlarmState::Scheduled;
                } else {
                    self.retire_one_shot(record);
                }
                tracing::info!(id = self.id, occurrence = %skipped, "Skipped occurrence passed silently");
                Ok(FireOutcome::Skipped)
            }
            AlarmState::Fired => {
                self.arm_next_normal(record, now)?;
                tracing::debug!(id = self.id, "Already ringing, not ringing again");
                Ok(FireOutcome::Ignored)
            }
            AlarmState::Disabled => Ok(FireOutcome::Ignored),
        }
    }

    fn on_autosilence(
        &self,
        record: &mut AlarmRecord,
        now: NaiveDateTime,
    ) -> Result<FireOutcome, AlarmError> {
        if record.state != AlarmState::Fired {
            return Ok(FireOutcome::Ignored);
        }
        self.finish_occurrence(record, now)?;
        tracing::info!(id = self.id, "Alarm silenced after ringing unattended");
        Ok(FireOutcome::Silenced)
    }

    /// Back to `SCHEDULED` (repeating) or `DISABLED` (one-shot)
    fn finish_occurrence(&self, record: &mut AlarmRecord, now: NaiveDateTime) -> Result<(), AlarmError> {
        let scheduler = &self.ctx.scheduler;
        if record.config.is_repeating() {
            let next = self.compute_next(&record.config, now)?;
            scheduler.remove(self.id, CalendarType::Autosilence);
            scheduler.set_alarm(self.id, CalendarType::Normal, next);
            record.state = AlarmState::Scheduled;
            record.next_occurrence = Some(next);
        } else {
            self.retire_one_shot(record);
        }
        record.snoozed_until = None;
        record.ringing_since = None;
        Ok(())
    }

    /// A one-shot alarm whose only occurrence is spent turns itself off
    fn retire_one_shot(&self, record: &mut AlarmRecord) {
        self.ctx.scheduler.remove_alarm(self.id);
        record.config.enabled = false;
        record.state = AlarmState::Disabled;
        record.next_occurrence = None;
    }

    /// Arrange the normal occurrence following `after`; one-shot alarms have none
    fn arm_next_normal(&self, record: &mut AlarmRecord, after: NaiveDateTime) -> Result<(), AlarmError> {
        if record.config.is_repeating() {
            let next = self.compute_next(&record.config, after)?;
            self.ctx
                .scheduler
                .set_alarm(self.id, CalendarType::Normal, next);
            record.next_occurrence = Some(next);
        } else {
            self.ctx.scheduler.remove(self.id, CalendarType::Normal);
            record.next_occurrence = None;
        }
        Ok(())
    }

    /// Recompute the pending occurrence of a `SCHEDULED` or `SKIPPED_PENDING` alarm.
    ///
    /// Occurrences within the delivery tolerance of now are kept so a refresh
    /// racing the wake-up does not drop it. A skip whose occurrence has passed
    /// is consumed, which retires a one-shot alarm.
    fn reschedule_pending(&self, record: &mut AlarmRecord, now: NaiveDateTime) -> Result<(), AlarmError> {
        let after = now - self.ctx.scheduler.config().delivery_tolerance();

        let previous = record.next_occurrence;
        let passed = previous.map_or(true, |at| at <= after);
        if record.state == AlarmState::SkippedPending && passed {
            tracing::info!(id = self.id, occurrence = ?previous, "Skipped occurrence already passed");
            if !record.config.is_repeating() {
                self.retire_one_shot(record);
                return Ok(());
            }
            record.state = AlarmState::Scheduled;
        } else if record.state == AlarmState::Scheduled && passed && previous.is_some() {
            tracing::warn!(id = self.id, occurrence = ?previous, "Missed occurrence dropped");
        }

        let next = self.compute_next(&record.config, after)?;

        self.ctx
            .scheduler
            .set_alarm(self.id, CalendarType::Normal, next);
        record.next_occurrence = Some(next);
        Ok(())
    }

    fn apply_config(
        &self,
        record: &mut AlarmRecord,
        config: AlarmConfig,
        now: NaiveDateTime,
    ) -> Result<(), AlarmError> {
        let next = if config.enabled {
            Some(self.compute_next(&config, now)?)
        } else {
            None
        };

        self.ctx.scheduler.remove_alarm(self.id);
        match next {
            Some(at) => {
                self.ctx
                    .scheduler
                    .set_alarm(self.id, CalendarType::Normal, at);
                record.state = AlarmState::Scheduled;
            }
            None => record.state = AlarmState::Disabled,
        }
        record.config = config;
        record.next_occurrence = next;
        record.snoozed_until = None;
        record.ringing_since = None;
        Ok(())
    }

    fn compute_next(
        &self,
        config: &AlarmConfig,
        after: NaiveDateTime,
    ) -> Result<NaiveDateTime, AlarmError> {
        AlarmsScheduler::next_occurrence(config, after).map_err(|source| AlarmError::Schedule {
            id: self.id,
            source,
        })
    }

    fn invalid(&self, action: AlarmAction, state: AlarmState) -> AlarmError {
        tracing::debug!(id = self.id, %action, %state, "Rejected action in current state");
        AlarmError::InvalidState {
            id: self.id,
            action,
            state,
        }
    }

    fn persist(&self, record: &AlarmRecord) {
        if let Err(e) = self.ctx.store.save(record) {
            tracing::warn!(id = self.id, "Failed to persist alarm: {}", e);
        }
    }

    fn lock(&self) -> MutexGuard<'_, AlarmRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
