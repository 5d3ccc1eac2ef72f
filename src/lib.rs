// Meter Readings - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod accounts;
pub mod admission;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod parser;
pub mod reading;

#[cfg(feature = "server")]
pub mod api;

// Re-export commonly used types
pub use accounts::{load_accounts_csv, Account, AccountLookup};
pub use admission::{
    admit, process_upload, BatchReport, InsertOutcome, MemoryReadingStore, ReadingStore,
    RowOutcome,
};
pub use config::{AppConfig, ServerConfig};
pub use db::{
    append_audit_event, audit_trail, get_readings_for_account, load_account_ids,
    open_database, record_upload, seed_accounts, seed_accounts_from_csv, setup_database,
    verify_count, AuditEvent, AuditKind, SqliteReadingStore,
};
pub use error::{AdmissionFailure, ParseFailure, RowRejection};
pub use parser::parse_line;
pub use reading::{
    AccountId, BatchResult, CandidateReading, ReadingValue, StoredReading, MAX_READING_VALUE,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
