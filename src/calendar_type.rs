//! Calendar types tag which wake-up of an alarm an event refers to.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DecodeError;

/// Kind of wake-up arranged for an alarm.
///
/// Travels across the event boundary as its upper-case tag and must decode
/// back to exactly the same variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CalendarType {
    /// Regular occurrence, or the snooze wake-up that replaces it
    Normal,
    /// Silences a ringing alarm nobody attended to
    Autosilence,
    /// Best-effort fallback paired with the normal wake-up
    Inexact,
}

impl CalendarType {
    /// All variants, in ledger order
    pub const ALL: [CalendarType; 3] = [Self::Normal, Self::Autosilence, Self::Inexact];

    /// Wire tag of this calendar type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Autosilence => "AUTOSILENCE",
            Self::Inexact => "INEXACT",
        }
    }
}

impl fmt::Display for CalendarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CalendarType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ct| ct.as_str() == s)
            .ok_or_else(|| DecodeError::UnknownCalendarType(s.to_string()))
    }
}
