//! Runtime configuration shared by the CLI and the server.
//!
//! Every setting can come from a flag or an environment variable; flags win.

use crate::db::{open_database, seed_accounts_from_csv};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Storage and logging settings
#[derive(Debug, Clone, Args)]
pub struct AppConfig {
    /// SQLite database file (in-memory when omitted, for one-shot imports)
    #[arg(long = "database", env = "METER_READINGS_DB")]
    pub database: Option<PathBuf>,

    /// Reference accounts CSV (AccountId,FirstName,LastName)
    #[arg(long, env = "METER_READINGS_ACCOUNTS", default_value = "data/Test_Accounts.csv")]
    pub accounts: PathBuf,

    /// Log level (error, warn, info, debug, trace); RUST_LOG overrides
    #[arg(long, env = "METER_READINGS_LOG", default_value = "info")]
    pub log_level: String,
}

impl AppConfig {
    /// Open the configured database and create the schema
    pub fn open_database(&self) -> Result<Connection> {
        match &self.database {
            Some(path) => debug!(path = %path.display(), "Opening database"),
            None => debug!("Opening in-memory database"),
        }
        open_database(self.database.as_deref())
    }

    /// The configured database file; commands whose effect must outlive the
    /// process refuse to run against an in-memory database
    pub fn require_database(&self) -> Result<&Path> {
        self.database.as_deref().ok_or_else(|| {
            anyhow!("No database configured: pass --database or set METER_READINGS_DB")
        })
    }

    /// Open the configured database file, failing when none is set
    pub fn open_persistent_database(&self) -> Result<Connection> {
        let path = self.require_database()?;
        debug!(path = %path.display(), "Opening database");
        open_database(Some(path))
    }

    /// Open the database and seed accounts from the reference file if empty
    pub fn open_seeded_database(&self) -> Result<Connection> {
        let conn = self.open_database()?;
        let seeded = seed_accounts_from_csv(&conn, &self.accounts)
            .with_context(|| format!("Failed to seed accounts from {}", self.accounts.display()))?;
        if seeded > 0 {
            info!(seeded, path = %self.accounts.display(), "Accounts seeded");
        }
        Ok(conn)
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Parser)]
#[command(name = "meter-server", about = "Meter reading upload server")]
pub struct ServerConfig {
    #[command(flatten)]
    pub app: AppConfig,

    /// Address to listen on
    #[arg(long, env = "METER_READINGS_BIND", default_value = "0.0.0.0:3000")]
    pub bind: String,

    /// Directory with the upload form assets
    #[arg(long, env = "METER_READINGS_WEB_DIR", default_value = "web")]
    pub web_dir: PathBuf,
}
