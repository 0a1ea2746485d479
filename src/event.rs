//! Inbound events
//!
//! Every event reaches the core as a [`RawEvent`]: an action string plus a
//! map of extras. [`Event::decode`] turns it into the closed [`Event`] union
//! exactly once, at the boundary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::calendar_type::CalendarType;
use crate::error::DecodeError;
use crate::scheduler::{ScheduledWakeup, ACTION_FIRED, ACTION_INEXACT_FIRED, EXTRA_ID, EXTRA_TYPE};
use crate::AlarmId;

pub const ACTION_BOOT_COMPLETED: &str = "system.BOOT_COMPLETED";
pub const ACTION_TIMEZONE_CHANGED: &str = "system.TIMEZONE_CHANGED";
pub const ACTION_LOCALE_CHANGED: &str = "system.LOCALE_CHANGED";
pub const ACTION_PACKAGE_REPLACED: &str = "system.PACKAGE_REPLACED";
pub const ACTION_TIME_SET: &str = "system.TIME_SET";

pub const ACTION_REQUEST_SNOOZE: &str = "alarmcore.request.SNOOZE";
pub const ACTION_REQUEST_DISMISS: &str = "alarmcore.request.DISMISS";
pub const ACTION_REQUEST_SKIP: &str = "alarmcore.request.SKIP";

/// System conditions after which every alarm is recomputed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemChange {
    BootCompleted,
    TimezoneChanged,
    LocaleChanged,
    PackageReplaced,
}

/// A decoded inbound event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Fired {
        id: AlarmId,
        calendar_type: CalendarType,
    },
    InexactFired {
        id: AlarmId,
    },
    SystemChanged(SystemChange),
    TimeSet,
    SnoozeRequested {
        id: AlarmId,
    },
    DismissRequested {
        id: AlarmId,
    },
    SkipRequested {
        id: AlarmId,
    },
}

impl Event {
    /// Decode a raw event.
    ///
    /// Returns `Ok(None)` for actions this core does not handle.
    pub fn decode(raw: &RawEvent) -> Result<Option<Self>, DecodeError> {
        let event = match raw.action.as_str() {
            ACTION_FIRED => Self::Fired {
                id: raw.alarm_id()?,
                calendar_type: raw.calendar_type()?,
            },
            ACTION_INEXACT_FIRED => Self::InexactFired { id: raw.alarm_id()? },
            ACTION_BOOT_COMPLETED => Self::SystemChanged(SystemChange::BootCompleted),
            ACTION_TIMEZONE_CHANGED => Self::SystemChanged(SystemChange::TimezoneChanged),
            ACTION_LOCALE_CHANGED => Self::SystemChanged(SystemChange::LocaleChanged),
            ACTION_PACKAGE_REPLACED => Self::SystemChanged(SystemChange::PackageReplaced),
            ACTION_TIME_SET => Self::TimeSet,
            ACTION_REQUEST_SNOOZE => Self::SnoozeRequested { id: raw.alarm_id()? },
            ACTION_REQUEST_DISMISS => Self::DismissRequested { id: raw.alarm_id()? },
            ACTION_REQUEST_SKIP => Self::SkipRequested { id: raw.alarm_id()? },
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// The boundary form of this event
    pub fn to_raw(&self) -> RawEvent {
        match *self {
            Self::Fired { id, calendar_type } => RawEvent::new(ACTION_FIRED)
                .with_extra(EXTRA_ID, id)
                .with_extra(EXTRA_TYPE, calendar_type.as_str()),
            Self::InexactFired { id } => RawEvent::new(ACTION_INEXACT_FIRED).with_extra(EXTRA_ID, id),
            Self::SystemChanged(change) => RawEvent::new(match change {
                SystemChange::BootCompleted => ACTION_BOOT_COMPLETED,
                SystemChange::TimezoneChanged => ACTION_TIMEZONE_CHANGED,
                SystemChange::LocaleChanged => ACTION_LOCALE_CHANGED,
                SystemChange::PackageReplaced => ACTION_PACKAGE_REPLACED,
            }),
            Self::TimeSet => RawEvent::new(ACTION_TIME_SET),
            Self::SnoozeRequested { id } => RawEvent::new(ACTION_REQUEST_SNOOZE).with_extra(EXTRA_ID, id),
            Self::DismissRequested { id } => {
                RawEvent::new(ACTION_REQUEST_DISMISS).with_extra(EXTRA_ID, id)
            }
            Self::SkipRequested { id } => RawEvent::new(ACTION_REQUEST_SKIP).with_extra(EXTRA_ID, id),
        }
    }
}

/// An event as it arrives at the boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub action: String,
    #[serde(default)]
    pub extras: Map<String, Value>,
}

impl RawEvent {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            extras: Map::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extras.insert(key.to_string(), value.into());
        self
    }

    /// The event a wake-up delivers when it comes due
    pub fn for_wakeup(wakeup: &ScheduledWakeup) -> Self {
        match wakeup.calendar_type {
            CalendarType::Inexact => {
                Self::new(ACTION_INEXACT_FIRED).with_extra(EXTRA_ID, wakeup.id)
            }
            calendar_type => Self::new(ACTION_FIRED)
                .with_extra(EXTRA_ID, wakeup.id)
                .with_extra(EXTRA_TYPE, calendar_type.as_str()),
        }
    }

    fn extra(&self, key: &'static str) -> Result<&Value, DecodeError> {
        self.extras.get(key).ok_or_else(|| DecodeError::MissingExtra {
            action: self.action.clone(),
            key,
        })
    }

    fn alarm_id(&self) -> Result<AlarmId, DecodeError> {
        let value = self.extra(EXTRA_ID)?;
        value
            .as_i64()
            .and_then(|id| AlarmId::try_from(id).ok())
            .ok_or_else(|| DecodeError::InvalidExtra {
                key: EXTRA_ID,
                value: value.to_string(),
            })
    }

    fn calendar_type(&self) -> Result<CalendarType, DecodeError> {
        match self.extra(EXTRA_TYPE)? {
            Value::String(tag) => tag.parse(),
            other => Err(DecodeError::InvalidExtra {
                key: EXTRA_TYPE,
                value: other.to_string(),
            }),
        }
    }
}
