// 🚦 Admission Validator - decides which candidate readings become stored readings
//
// Checks run in a fixed order and the first failure wins:
//   1. account exists
//   2. no reading at exactly this timestamp
//   3. strictly newer than the most recent reading for the account
//   4. commit (storage may still refuse on its unique index)
//
// Rows are processed strictly in input order against the live store, so a
// reading admitted on line 3 is visible to the checks for line 7.

use crate::accounts::AccountLookup;
use crate::error::{AdmissionFailure, RowRejection};
use crate::parser::parse_line;
use crate::reading::{AccountId, BatchResult, CandidateReading, ReadingValue, StoredReading};
use anyhow::Result;
use chrono::NaiveDateTime;
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

// ============================================================================
// STORAGE INTERFACE
// ============================================================================

/// Result of asking storage to persist a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Unique (account, timestamp) constraint rejected the write
    Conflict,
}

/// Previously admitted readings, as seen by the validator
///
/// Implementations own persistence and must enforce uniqueness of
/// (account_id, reading_time) themselves; the validator's own duplicate check
/// is not a substitute for it.
pub trait ReadingStore {
    fn reading_exists(&self, account_id: AccountId, reading_time: NaiveDateTime) -> Result<bool>;

    /// Timestamp of the newest stored reading for the account, if any
    fn most_recent_reading(&self, account_id: AccountId) -> Result<Option<NaiveDateTime>>;

    fn insert(&mut self, reading: &StoredReading) -> Result<InsertOutcome>;
}

// ============================================================================
// SINGLE READING
// ============================================================================

/// Run the admission checks for one candidate and commit it on success
///
/// Storage errors never escape: they reject this row with `StorageConflict`.
pub fn admit<A, S>(
    candidate: CandidateReading,
    accounts: &A,
    store: &mut S,
) -> Result<StoredReading, AdmissionFailure>
where
    A: AccountLookup + ?Sized,
    S: ReadingStore + ?Sized,
{
    let account_id = candidate.account_id;

    if !accounts.account_exists(account_id) {
        return Err(AdmissionFailure::UnknownAccount);
    }

    if storage_query(store.reading_exists(account_id, candidate.reading_time))? {
        return Err(AdmissionFailure::DuplicateReading);
    }

    if let Some(latest) = storage_query(store.most_recent_reading(account_id))? {
        if latest >= candidate.reading_time {
            return Err(AdmissionFailure::NotNewerThanExisting);
        }
    }

    let reading = StoredReading::from(candidate);
    match storage_query(store.insert(&reading))? {
        InsertOutcome::Inserted => Ok(reading),
        InsertOutcome::Conflict => Err(AdmissionFailure::StorageConflict),
    }
}

fn storage_query<T>(result: Result<T>) -> Result<T, AdmissionFailure> {
    result.map_err(|e| {
        warn!(error = %format!("{:#}", e), "Storage failure while admitting reading");
        AdmissionFailure::StorageConflict
    })
}

// ============================================================================
// BATCH
// ============================================================================

/// What happened to one data row of an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowOutcome {
    /// 1-based line number in the uploaded text (header is line 1)
    pub line: usize,
    pub result: Result<StoredReading, RowRejection>,
}

impl RowOutcome {
    pub fn is_admitted(&self) -> bool {
        self.result.is_ok()
    }
}

/// Per-row outcomes of one upload, in input order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub outcomes: Vec<RowOutcome>,
}

impl BatchReport {
    /// The count pair exposed to upload clients
    pub fn result(&self) -> BatchResult {
        let successful_readings = self.outcomes.iter().filter(|o| o.is_admitted()).count();

        BatchResult {
            successful_readings,
            failed_readings: self.outcomes.len() - successful_readings,
        }
    }

    pub fn admitted(&self) -> impl Iterator<Item = &StoredReading> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().ok())
    }

    pub fn rejections(&self) -> impl Iterator<Item = (usize, RowRejection)> + '_ {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|r| (o.line, *r)))
    }

    /// Rejection counts keyed by reason code
    pub fn rejection_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for (_, rejection) in self.rejections() {
            *counts.entry(rejection.code()).or_insert(0) += 1;
        }
        counts
    }
}

/// Process an uploaded CSV body: skip the header, then parse and admit each
/// row in order.
///
/// Always completes; every row ends up counted as admitted or failed.
pub fn process_upload<A, S>(body: &str, accounts: &A, store: &mut S) -> BatchReport
where
    A: AccountLookup + ?Sized,
    S: ReadingStore + ?Sized,
{
    let mut report = BatchReport::default();

    for (index, raw) in upload_lines(body).enumerate().skip(1) {
        let line = index + 1;

        let result = parse_line(raw)
            .map_err(RowRejection::from)
            .and_then(|candidate| {
                let account_id = candidate.account_id;
                admit(candidate, accounts, &mut *store).map_err(|failure| {
                    warn!(line, account_id, reason = failure.code(), "{}", failure);
                    RowRejection::from(failure)
                })
            });

        if let Err(RowRejection::Parse(failure)) = &result {
            warn!(line, reason = failure.code(), input = raw, "{}", failure);
        }

        report.outcomes.push(RowOutcome { line, result });
    }

    let result = report.result();
    info!(
        successful = result.successful_readings,
        failed = result.failed_readings,
        "Processed meter reading upload"
    );

    report
}

/// Split on `\r\n`, `\n` or a lone `\r`; a trailing terminator does not
/// start another line
fn upload_lines(body: &str) -> impl Iterator<Item = &str> {
    let mut rest = body;

    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }

        let line = match rest.find(&['\r', '\n'][..]) {
            Some(end) => {
                let terminator = if rest[end..].starts_with("\r\n") { 2 } else { 1 };
                let line = &rest[..end];
                rest = &rest[end + terminator..];
                line
            }
            None => std::mem::take(&mut rest),
        };

        Some(line)
    })
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// Map-backed `ReadingStore`, for tests and throwaway runs
#[derive(Debug, Clone, Default)]
pub struct MemoryReadingStore {
    readings: HashMap<AccountId, BTreeMap<NaiveDateTime, ReadingValue>>,
}

impl MemoryReadingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored readings for one account, oldest first
    pub fn readings_for(&self, account_id: AccountId) -> Vec<StoredReading> {
        self.readings
            .get(&account_id)
            .map(|by_time| {
                by_time
                    .iter()
                    .map(|(time, value)| StoredReading {
                        account_id,
                        reading_time: *time,
                        value: *value,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.readings.values().map(|r| r.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReadingStore for MemoryReadingStore {
    fn reading_exists(&self, account_id: AccountId, reading_time: NaiveDateTime) -> Result<bool> {
        Ok(self
            .readings
            .get(&account_id)
            .is_some_and(|by_time| by_time.contains_key(&reading_time)))
    }

    fn most_recent_reading(&self, account_id: AccountId) -> Result<Option<NaiveDateTime>> {
        Ok(self
            .readings
            .get(&account_id)
            .and_then(|by_time| by_time.keys().next_back().copied()))
    }

    fn insert(&mut self, reading: &StoredReading) -> Result<InsertOutcome> {
        let by_time = self.readings.entry(reading.account_id).or_default();
        if by_time.contains_key(&reading.reading_time) {
            return Ok(InsertOutcome::Conflict);
        }
        by_time.insert(reading.reading_time, reading.value);
        Ok(InsertOutcome::Inserted)
    }
}

// ============================================================================
// TESTS
// ============================================================================
