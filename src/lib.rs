//! alarmcore Library
//!
//! Alarm scheduling and event dispatch:
//! - Per-alarm state machine (ring, snooze, dismiss, skip, auto-silence)
//! - Wake-up scheduling with at most one outstanding wake-up per kind
//! - Decoding of boundary events and dispatch onto a single worker

pub mod alarm;
pub mod alarms;
pub mod calendar_type;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod logging;
pub mod scheduler;
pub mod store;
pub mod timer;

/// Alarm identifier, assigned by the registry
pub type AlarmId = i32;

pub use alarm::{Alarm, AlarmConfig, AlarmRecord, AlarmState, DaysOfWeek, FireOutcome};
pub use alarms::{Alarms, RefreshReport};
pub use calendar_type::CalendarType;
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{DispatchWorker, Dispatched, Dispatcher, EventQueue, EventSender};
pub use error::{AlarmCoreError, AlarmError, DecodeError, Result};
pub use event::{Event, RawEvent, SystemChange};
pub use scheduler::{AlarmsScheduler, ScheduledWakeup, WakeupTimer};
pub use store::{AlarmStore, JsonFileStore, MemoryStore};
pub use timer::{SimulatedTimer, TokioWakeupTimer};
