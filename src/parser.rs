// 🏗️ Record Parser
// One CSV line → CandidateReading or a classified ParseFailure.
// Never touches storage.

use crate::error::ParseFailure;
use crate::reading::{AccountId, CandidateReading, ReadingValue, READING_TIME_FORMAT};
use chrono::NaiveDateTime;
use std::num::IntErrorKind;

/// Field layout of an upload row: AccountId,MeterReadingDateTime,MeterReadValue
const ACCOUNT_FIELD: usize = 0;
const TIMESTAMP_FIELD: usize = 1;
const VALUE_FIELD: usize = 2;
const REQUIRED_FIELDS: usize = 3;

/// Parse a single data line (header already stripped)
///
/// Extra fields after the third are ignored so the upload schema can grow
/// without breaking older clients.
///
/// # Example:
/// ```
/// use meter_readings::parser::parse_line;
///
/// let reading = parse_line("2344,22/04/2019 09:24,01002").unwrap();
/// assert_eq!(reading.account_id, 2344);
/// assert_eq!(reading.value.get(), 1002);
/// ```
pub fn parse_line(line: &str) -> Result<CandidateReading, ParseFailure> {
    if line.trim().is_empty() {
        return Err(ParseFailure::EmptyLine);
    }

    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() < REQUIRED_FIELDS {
        return Err(ParseFailure::MissingFields);
    }

    let account_id = parse_account_id(fields[ACCOUNT_FIELD])?;
    let reading_time = parse_reading_time(fields[TIMESTAMP_FIELD])?;
    let value = parse_reading_value(fields[VALUE_FIELD])?;

    Ok(CandidateReading {
        account_id,
        reading_time,
        value,
    })
}

fn parse_account_id(field: &str) -> Result<AccountId, ParseFailure> {
    field
        .trim()
        .parse::<AccountId>()
        .map_err(|_| ParseFailure::InvalidAccountId)
}

/// Exact `dd/MM/yyyy HH:mm`; chrono alone would also take single-digit
/// days and months, so the shape is checked first.
fn parse_reading_time(field: &str) -> Result<NaiveDateTime, ParseFailure> {
    if !has_timestamp_shape(field) {
        return Err(ParseFailure::InvalidTimestamp);
    }

    NaiveDateTime::parse_from_str(field, READING_TIME_FORMAT)
        .map_err(|_| ParseFailure::InvalidTimestamp)
}

fn has_timestamp_shape(field: &str) -> bool {
    let bytes = field.as_bytes();
    if bytes.len() != "dd/MM/yyyy HH:mm".len() {
        return false;
    }

    bytes.iter().enumerate().all(|(i, b)| match i {
        2 | 5 => *b == b'/',
        10 => *b == b' ',
        13 => *b == b':',
        _ => b.is_ascii_digit(),
    })
}

fn parse_reading_value(field: &str) -> Result<ReadingValue, ParseFailure> {
    let field = field.trim();
    let raw = field.parse::<i64>().map_err(|e| match e.kind() {
        // Still an integer, just too large to hold
        IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => {
            ParseFailure::ReadingValueOutOfRange
        }
        _ => ParseFailure::InvalidReadingValue,
    })?;

    ReadingValue::new(raw).ok_or(ParseFailure::ReadingValueOutOfRange)
}

// ============================================================================
// TESTS
// ============================================================================
