// 📟 Meter reading data model
// Candidate (parsed, unchecked) → Stored (admitted) → counted in BatchResult

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type AccountId = i32;

/// Upper bound of a meter register (5 digits)
pub const MAX_READING_VALUE: u32 = 99_999;

/// Input timestamp pattern: dd/MM/yyyy HH:mm, 24-hour clock
pub const READING_TIME_FORMAT: &str = "%d/%m/%Y %H:%M";

// ============================================================================
// READING VALUE
// ============================================================================

/// A meter register value in `0..=99999`
///
/// Numerically plain, but always rendered as 5 zero-padded digits
/// (`1002` displays as `01002`), which is how it appears in audit output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReadingValue(u32);

impl ReadingValue {
    /// Returns None when the value is outside the register range
    pub fn new(value: i64) -> Option<Self> {
        if (0..=MAX_READING_VALUE as i64).contains(&value) {
            Some(ReadingValue(value as u32))
        } else {
            None
        }
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    /// Fixed 5-digit textual form
    pub fn padded(&self) -> String {
        format!("{:05}", self.0)
    }
}

impl fmt::Display for ReadingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:05}", self.0)
    }
}

// ============================================================================
// READINGS
// ============================================================================

/// Output of the record parser, not yet checked against stored state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateReading {
    pub account_id: AccountId,
    pub reading_time: NaiveDateTime,
    pub value: ReadingValue,
}

/// A reading that passed every admission check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredReading {
    pub account_id: AccountId,
    pub reading_time: NaiveDateTime,
    pub value: ReadingValue,
}

impl From<CandidateReading> for StoredReading {
    fn from(candidate: CandidateReading) -> Self {
        StoredReading {
            account_id: candidate.account_id,
            reading_time: candidate.reading_time,
            value: candidate.value,
        }
    }
}

impl StoredReading {
    /// Human-readable line for CLI listings and logs
    pub fn summary(&self) -> String {
        format!(
            "{} | {} | {}",
            self.account_id,
            self.reading_time.format(READING_TIME_FORMAT),
            self.value
        )
    }
}

// ============================================================================
// BATCH RESULT
// ============================================================================

/// Count pair returned for one upload (wire names match the upload form)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub successful_readings: usize,
    pub failed_readings: usize,
}

impl BatchResult {
    pub fn total(&self) -> usize {
        self.successful_readings + self.failed_readings
    }
}
