//! `alarmcore` Error Types
//!
//! Centralized error handling using thiserror for type-safe errors.

use std::path::PathBuf;
use thiserror::Error;

use crate::alarm::{AlarmAction, AlarmState};
use crate::AlarmId;

/// Top-level error type for `alarmcore`
#[derive(Error, Debug)]
pub enum AlarmCoreError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Alarm error: {0}")]
    Alarm(#[from] AlarmError),

    #[error("Refresh incomplete, failed alarms: {failed:?}")]
    RefreshIncomplete { failed: Vec<AlarmId> },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Event queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors decoding an inbound event payload.
///
/// Fatal for the single event that carried the payload, never for the
/// dispatcher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Event '{action}' is missing required extra '{key}'")]
    MissingExtra { action: String, key: &'static str },

    #[error("Extra '{key}' has an invalid value: {value}")]
    InvalidExtra { key: &'static str, value: String },

    #[error("Unknown calendar type: {0:?}")]
    UnknownCalendarType(String),
}

/// Errors computing an occurrence from an alarm's rule
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid time of day {hour:02}:{minutes:02}")]
    InvalidTime { hour: u32, minutes: u32 },

    #[error("Invalid repeat rule bits {0:#010b}")]
    InvalidRepeatRule(u8),

    #[error("Occurrence falls outside the supported calendar range")]
    OutOfRange,
}

/// Errors raised by alarm state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AlarmError {
    /// The action is not valid from the alarm's current state; nothing changed.
    #[error("Alarm {id} cannot {action} while {state}")]
    InvalidState {
        id: AlarmId,
        action: AlarmAction,
        state: AlarmState,
    },

    #[error("Alarm {id} has a malformed schedule: {source}")]
    Schedule {
        id: AlarmId,
        #[source]
        source: ScheduleError,
    },
}

impl AlarmError {
    /// Identifier of the alarm the error belongs to
    pub fn alarm_id(&self) -> AlarmId {
        match self {
            Self::InvalidState { id, .. } | Self::Schedule { id, .. } => *id,
        }
    }
}

/// Persistence errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },
}

/// Errors handing an event to the dispatch queue
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("Event queue is full")]
    Full,
    #[error("Event queue is closed")]
    Closed,
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Serialize error: {0}")]
    SerializeError(String),
}

/// Result type alias for `alarmcore` operations
pub type Result<T> = std::result::Result<T, AlarmCoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_message() {
        let err = AlarmError::InvalidState {
            id: 7,
            action: AlarmAction::Snooze,
            state: AlarmState::Scheduled,
        };
        assert_eq!(err.to_string(), "Alarm 7 cannot snooze while SCHEDULED");
        assert_eq!(err.alarm_id(), 7);
    }

    #[test]
    fn test_decode_error_converts_to_top_level() {
        let err: AlarmCoreError = DecodeError::UnknownCalendarType("GARBAGE".into()).into();
        assert!(matches!(err, AlarmCoreError::Decode(_)));
        assert!(err.to_string().contains("GARBAGE"));
    }

    #[test]
    fn test_schedule_error_display() {
        let err = ScheduleError::InvalidTime { hour: 25, minutes: 3 };
        assert_eq!(err.to_string(), "Invalid time of day 25:03");
        let err = ScheduleError::InvalidRepeatRule(0x80);
        assert_eq!(err.to_string(), "Invalid repeat rule bits 0b10000000");
    }
}
