use crate::accounts::{load_accounts_csv, Account};
use crate::admission::{InsertOutcome, ReadingStore};
use crate::reading::{AccountId, BatchResult, ReadingValue, StoredReading};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Column format for reading timestamps; sorts lexicographically in time order
const STORAGE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery (in-memory databases report "memory")
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    debug!(journal_mode = %mode, "Database journal mode");

    // ==========================================================================
    // Accounts Table (reference data, seeded once)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts (
            account_id INTEGER PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Meter Readings Table
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meter_readings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id INTEGER NOT NULL,
            reading_time TEXT NOT NULL,
            reading_value INTEGER NOT NULL CHECK (reading_value BETWEEN 0 AND 99999),
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================

    // Last line of defence for the one-reading-per-timestamp rule
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_readings_account_time
         ON meter_readings(account_id, reading_time)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
        [],
    )?;

    Ok(())
}

/// Open (or create) the database at `path`, or an in-memory one when `None`
pub fn open_database(path: Option<&Path>) -> Result<Connection> {
    let conn = match path {
        Some(p) => Connection::open(p)
            .with_context(|| format!("Failed to open database: {}", p.display()))?,
        None => Connection::open_in_memory().context("Failed to open in-memory database")?,
    };

    setup_database(&conn)?;
    Ok(conn)
}

// ============================================================================
// ACCOUNTS
// ============================================================================

/// Insert reference accounts, but only into an empty accounts table
///
/// Returns how many accounts were inserted (0 when already seeded).
pub fn seed_accounts(conn: &Connection, accounts: &[Account]) -> Result<usize> {
    if count_accounts(conn)? > 0 {
        debug!("Accounts already seeded, skipping");
        return Ok(0);
    }

    let mut inserted = 0;
    let mut duplicates = 0;

    for account in accounts {
        let result = conn.execute(
            "INSERT INTO accounts (account_id, first_name, last_name) VALUES (?1, ?2, ?3)",
            params![account.account_id, account.first_name, account.last_name],
        );

        match result {
            Ok(_) => inserted += 1,
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                duplicates += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!(inserted, duplicates, "Seeded reference accounts");

    Ok(inserted)
}

/// Load the reference CSV and seed it
pub fn seed_accounts_from_csv(conn: &Connection, csv_path: &Path) -> Result<usize> {
    let accounts = load_accounts_csv(csv_path)?;
    seed_accounts(conn, &accounts)
}

pub fn count_accounts(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;

    Ok(count)
}

/// Snapshot of known account ids, used as the lookup for one upload
pub fn load_account_ids(conn: &Connection) -> Result<HashSet<AccountId>> {
    let mut stmt = conn.prepare("SELECT account_id FROM accounts")?;

    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<HashSet<AccountId>, _>>()?;

    Ok(ids)
}

pub fn get_account(conn: &Connection, account_id: AccountId) -> Result<Option<Account>> {
    let account = conn
        .query_row(
            "SELECT account_id, first_name, last_name FROM accounts WHERE account_id = ?1",
            params![account_id],
            |row| {
                Ok(Account {
                    account_id: row.get(0)?,
                    first_name: row.get(1)?,
                    last_name: row.get(2)?,
                })
            },
        )
        .optional()?;

    Ok(account)
}

// ============================================================================
// READINGS
// ============================================================================

/// `ReadingStore` backed by the `meter_readings` table
///
/// Every admitted reading is also written to the audit trail.
pub struct SqliteReadingStore<'a> {
    conn: &'a Connection,
    actor: String,
}

impl<'a> SqliteReadingStore<'a> {
    pub fn new(conn: &'a Connection, actor: &str) -> Self {
        SqliteReadingStore {
            conn,
            actor: actor.to_string(),
        }
    }
}

impl ReadingStore for SqliteReadingStore<'_> {
    fn reading_exists(&self, account_id: AccountId, reading_time: NaiveDateTime) -> Result<bool> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM meter_readings WHERE account_id = ?1 AND reading_time = ?2
            )",
            params![account_id, format_time(reading_time)],
            |row| row.get(0),
        )?;

        Ok(exists)
    }

    fn most_recent_reading(&self, account_id: AccountId) -> Result<Option<NaiveDateTime>> {
        let latest: Option<String> = self.conn.query_row(
            "SELECT MAX(reading_time) FROM meter_readings WHERE account_id = ?1",
            params![account_id],
            |row| row.get(0),
        )?;

        latest.as_deref().map(parse_time).transpose()
    }

    fn insert(&mut self, reading: &StoredReading) -> Result<InsertOutcome> {
        let result = self.conn.execute(
            "INSERT INTO meter_readings (account_id, reading_time, reading_value)
             VALUES (?1, ?2, ?3)",
            params![
                reading.account_id,
                format_time(reading.reading_time),
                reading.value.get(),
            ],
        );

        match result {
            Ok(_) => {
                let event = AuditEvent::reading_admitted(reading, &self.actor);
                if let Err(e) = append_audit_event(self.conn, &event) {
                    warn!(error = %e, account_id = reading.account_id, "Failed to write audit event");
                }

                Ok(InsertOutcome::Inserted)
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(InsertOutcome::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Stored readings for one account, oldest first
pub fn get_readings_for_account(conn: &Connection, account_id: AccountId) -> Result<Vec<StoredReading>> {
    let mut stmt = conn.prepare(
        "SELECT account_id, reading_time, reading_value
         FROM meter_readings
         WHERE account_id = ?1
         ORDER BY reading_time ASC",
    )?;

    let rows = stmt
        .query_map(params![account_id], |row| {
            Ok((
                row.get::<_, AccountId>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(account_id, time, value)| {
            Ok(StoredReading {
                account_id,
                reading_time: parse_time(&time)?,
                value: ReadingValue::new(value)
                    .ok_or_else(|| anyhow!("Stored reading value out of range: {}", value))?,
            })
        })
        .collect()
}

pub fn verify_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM meter_readings", [], |row| row.get(0))?;

    Ok(count)
}

fn format_time(time: NaiveDateTime) -> String {
    time.format(STORAGE_TIME_FORMAT).to_string()
}

fn parse_time(text: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, STORAGE_TIME_FORMAT)
        .with_context(|| format!("Invalid stored reading time: {}", text))
}

// ============================================================================
// AUDIT TRAIL
// ============================================================================

/// What an audit event records; each kind is keyed by one entity type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// A reading passed admission (keyed by account id)
    ReadingAdmitted,
    /// An upload finished processing (keyed by payload digest)
    UploadProcessed,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::ReadingAdmitted => "reading_admitted",
            AuditKind::UploadProcessed => "upload_processed",
        }
    }

    pub fn entity_type(&self) -> &'static str {
        match self {
            AuditKind::ReadingAdmitted => "account",
            AuditKind::UploadProcessed => "upload",
        }
    }
}

impl ToSql for AuditKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for AuditKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "reading_admitted" => Ok(AuditKind::ReadingAdmitted),
            "upload_processed" => Ok(AuditKind::UploadProcessed),
            other => Err(FromSqlError::Other(
                format!("unknown audit event type: {}", other).into(),
            )),
        }
    }
}

/// Append-only audit trail entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub kind: AuditKind,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl AuditEvent {
    fn new(kind: AuditKind, entity_id: String, data: serde_json::Value, actor: &str) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            recorded_at: Utc::now(),
            kind,
            entity_id,
            data,
            actor: actor.to_string(),
        }
    }

    /// Audit entry for a committed reading; the value uses the 5-digit form
    pub fn reading_admitted(reading: &StoredReading, actor: &str) -> Self {
        Self::new(
            AuditKind::ReadingAdmitted,
            reading.account_id.to_string(),
            serde_json::json!({
                "readingTime": format_time(reading.reading_time),
                "readingValue": reading.value.padded(),
            }),
            actor,
        )
    }

    /// Audit entry for a processed upload, keyed by the payload digest
    pub fn upload_processed(body: &str, result: &BatchResult, actor: &str) -> Self {
        Self::new(
            AuditKind::UploadProcessed,
            payload_digest(body),
            serde_json::json!({
                "bytes": body.len(),
                "successfulReadings": result.successful_readings,
                "failedReadings": result.failed_readings,
            }),
            actor,
        )
    }

    pub fn entity_type(&self) -> &'static str {
        self.kind.entity_type()
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let event_id: String = row.get(0)?;
        let recorded_at: String = row.get(1)?;
        let data: String = row.get(4)?;

        Ok(Self {
            event_id: Uuid::parse_str(&event_id).map_err(conversion_failure(0))?,
            recorded_at: DateTime::parse_from_rfc3339(&recorded_at)
                .map_err(conversion_failure(1))?
                .with_timezone(&Utc),
            kind: row.get(2)?,
            entity_id: row.get(3)?,
            data: serde_json::from_str(&data).map_err(conversion_failure(4))?,
            actor: row.get(5)?,
        })
    }
}

/// Keeps the cause when a stored text column fails to decode
fn conversion_failure<E>(column: usize) -> impl FnOnce(E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    move |e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e))
}

pub fn append_audit_event(conn: &Connection, event: &AuditEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id.to_string(),
            event.recorded_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            event.kind,
            event.entity_type(),
            event.entity_id,
            serde_json::to_string(&event.data)?,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Audit entries of one kind for one entity, newest first
pub fn audit_trail(conn: &Connection, kind: AuditKind, entity_id: &str) -> Result<Vec<AuditEvent>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_id, data, actor
         FROM events
         WHERE event_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![kind, entity_id], AuditEvent::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

/// SHA-256 of an uploaded payload, hex encoded
pub fn payload_digest(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Record one processed upload in the audit trail
pub fn record_upload(
    conn: &Connection,
    body: &str,
    result: &BatchResult,
    actor: &str,
) -> Result<AuditEvent> {
    let event = AuditEvent::upload_processed(body, result, actor);
    append_audit_event(conn, &event)?;

    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::process_upload;
    use chrono::NaiveDate;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        seed_accounts(
            &conn,
            &[
                Account::new(2344, "Tommy", "Test"),
                Account::new(2233, "Barry", "Test"),
                Account::new(8766, "Sally", "Test"),
            ],
        )
        .unwrap();
        conn
    }

    fn reading(account_id: AccountId, day: u32, value: i64) -> StoredReading {
        StoredReading {
            account_id,
            reading_time: NaiveDate::from_ymd_opt(2019, 4, day)
                .unwrap()
                .and_hms_opt(9, 24, 0)
                .unwrap(),
            value: ReadingValue::new(value).unwrap(),
        }
    }

    #[test]
    fn test_seed_accounts_once() {
        let conn = test_db();

        let again = seed_accounts(&conn, &[Account::new(1, "New", "Person")]).unwrap();

        assert_eq!(again, 0);
        assert_eq!(count_accounts(&conn).unwrap(), 3);
        assert!(get_account(&conn, 1).unwrap().is_none());
        assert_eq!(get_account(&conn, 2344).unwrap().unwrap().first_name, "Tommy");
    }

    #[test]
    fn test_seed_skips_duplicate_ids_in_file() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let inserted = seed_accounts(
            &conn,
            &[Account::new(2344, "Tommy", "Test"), Account::new(2344, "Tommy", "Again")],
        )
        .unwrap();

        assert_eq!(inserted, 1);
    }

    #[test]
    fn test_load_account_ids() {
        let conn = test_db();
        let ids = load_account_ids(&conn).unwrap();

        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&8766));
    }

    #[test]
    fn test_store_queries() {
        let conn = test_db();
        let mut store = SqliteReadingStore::new(&conn, "test");

        assert_eq!(store.most_recent_reading(2344).unwrap(), None);

        assert_eq!(store.insert(&reading(2344, 22, 1002)).unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert(&reading(2344, 20, 900)).unwrap(), InsertOutcome::Inserted);

        let r = reading(2344, 22, 0);
        assert!(store.reading_exists(2344, r.reading_time).unwrap());
        assert!(!store.reading_exists(2233, r.reading_time).unwrap());
        assert_eq!(store.most_recent_reading(2344).unwrap(), Some(r.reading_time));
    }

    #[test]
    fn test_unique_index_reports_conflict() {
        let conn = test_db();
        let mut store = SqliteReadingStore::new(&conn, "test");

        assert_eq!(store.insert(&reading(2344, 22, 1002)).unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert(&reading(2344, 22, 2000)).unwrap(), InsertOutcome::Conflict);
        assert_eq!(verify_count(&conn).unwrap(), 1);
    }

    #[test]
    fn test_readings_round_trip_with_padding_in_audit() {
        let conn = test_db();
        let mut store = SqliteReadingStore::new(&conn, "test");
        store.insert(&reading(2344, 22, 1002)).unwrap();

        let readings = get_readings_for_account(&conn, 2344).unwrap();
        assert_eq!(readings, vec![reading(2344, 22, 1002)]);

        let events = audit_trail(&conn, AuditKind::ReadingAdmitted, "2344").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].entity_type(), "account");
        assert_eq!(events[0].data["readingValue"], "01002");
        assert_eq!(events[0].actor, "test");
    }

    #[test]
    fn test_upload_against_sqlite() {
        let conn = test_db();
        let accounts = load_account_ids(&conn).unwrap();
        let body = "AccountId,MeterReadingDateTime,MeterReadValue\n\
                    2344,22/04/2019 09:24,1002\n\
                    2233,22/04/2019 12:25,123456\n\
                    8766,22/04/2019 12:25,ABC\n\
                    9999,22/04/2019 12:25,1000\n\
                    2344,22/04/2019 09:24,1002\n";

        let result = {
            let mut store = SqliteReadingStore::new(&conn, "test");
            process_upload(body, &accounts, &mut store).result()
        };

        assert_eq!(result.successful_readings, 1);
        assert_eq!(result.failed_readings, 4);
        assert_eq!(verify_count(&conn).unwrap(), 1);

        let later = "AccountId,MeterReadingDateTime,MeterReadValue\n2344,21/04/2019 09:24,1002\n";
        let mut store = SqliteReadingStore::new(&conn, "test");
        let result = process_upload(later, &accounts, &mut store).result();
        assert_eq!((result.successful_readings, result.failed_readings), (0, 1));
    }

    #[test]
    fn test_record_upload_event() {
        let conn = test_db();
        let body = "AccountId,MeterReadingDateTime,MeterReadValue\n";
        let result = BatchResult::default();

        let event = record_upload(&conn, body, &result, "test").unwrap();

        assert_eq!(event.entity_id.len(), 64, "SHA-256 hash should be 64 hex characters");
        assert_eq!(event.entity_id, payload_digest(body));

        let events = audit_trail(&conn, AuditKind::UploadProcessed, &event.entity_id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["successfulReadings"], 0);
    }

    #[test]
    fn test_audit_trail_newest_first_and_scoped_by_kind() {
        let conn = test_db();
        let first = AuditEvent::reading_admitted(&reading(2344, 20, 900), "cli_import");
        let second = AuditEvent::reading_admitted(&reading(2344, 22, 1002), "upload_endpoint");
        append_audit_event(&conn, &first).unwrap();
        append_audit_event(&conn, &second).unwrap();
        // Same entity id under another kind stays out of the account's trail
        append_audit_event(
            &conn,
            &AuditEvent::new(AuditKind::UploadProcessed, "2344".to_string(), serde_json::json!({}), "x"),
        )
        .unwrap();

        let trail = audit_trail(&conn, AuditKind::ReadingAdmitted, "2344").unwrap();

        let ids: Vec<Uuid> = trail.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![second.event_id, first.event_id]);
        assert_eq!(trail[1].data["readingValue"], "00900");
    }

    #[test]
    fn test_corrupt_audit_row_keeps_cause() {
        let conn = test_db();
        conn.execute(
            "INSERT INTO events (event_id, timestamp, event_type, entity_type, entity_id, data, actor)
             VALUES ('not-a-uuid', '2019-04-22T09:24:00+00:00', 'reading_admitted', 'account', '2344', '{}', 'x')",
            [],
        )
        .unwrap();

        let err = audit_trail(&conn, AuditKind::ReadingAdmitted, "2344").unwrap_err();

        match err.downcast_ref::<rusqlite::Error>() {
            Some(rusqlite::Error::FromSqlConversionFailure(0, Type::Text, cause)) => {
                assert!(cause.downcast_ref::<uuid::Error>().is_some());
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_audit_kind_is_a_conversion_error() {
        let conn = test_db();
        conn.execute(
            "INSERT INTO events (event_id, timestamp, event_type, entity_type, entity_id, data, actor)
             VALUES (?1, '2019-04-22T09:24:00+00:00', 'legacy', 'account', '8766', '{}', 'x')",
            params![Uuid::new_v4().to_string()],
        )
        .unwrap();

        let mut stmt = conn.prepare("SELECT event_type FROM events").unwrap();
        let kind: rusqlite::Result<AuditKind> = stmt.query_row([], |row| row.get(0));

        assert!(matches!(kind, Err(rusqlite::Error::FromSqlConversionFailure(0, _, _))));
    }

    #[test]
    fn test_open_database_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readings.db");

        {
            let conn = open_database(Some(path.as_path())).unwrap();
            seed_accounts(&conn, &[Account::new(2344, "Tommy", "Test")]).unwrap();
        }

        let conn = open_database(Some(path.as_path())).unwrap();
        assert_eq!(count_accounts(&conn).unwrap(), 1);
    }
}
