use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};

use meter_readings::db::{count_accounts, get_account};
use meter_readings::logging::init_logging;
use meter_readings::{
    get_readings_for_account, load_account_ids, process_upload, record_upload,
    seed_accounts_from_csv, verify_count, AccountId, AppConfig, SqliteReadingStore,
};

const IMPORT_ACTOR: &str = "cli_import";

#[derive(Parser)]
#[command(name = "meter-readings", version, about = "Validate and store meter reading uploads")]
struct Cli {
    #[command(flatten)]
    config: AppConfig,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Seed reference accounts (defaults to --accounts); needs --database
    Seed { file: Option<PathBuf> },

    /// Run a meter readings CSV through validation and store the valid rows
    Import { file: PathBuf },

    /// List stored readings for an account; needs --database
    Readings { account_id: AccountId },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.config.log_level)?;

    match &cli.command {
        Command::Seed { file } => run_seed(&cli.config, file.as_deref()),
        Command::Import { file } => run_import(&cli.config, file),
        Command::Readings { account_id } => run_readings(&cli.config, *account_id),
    }
}

fn run_seed(config: &AppConfig, file: Option<&Path>) -> Result<()> {
    let path = file.unwrap_or(config.accounts.as_path());
    let conn = config.open_persistent_database()?;

    println!("📂 Seeding accounts from {}", path.display());
    let inserted = seed_accounts_from_csv(&conn, path)?;
    if inserted == 0 {
        println!("✓ Accounts already present, nothing inserted");
    } else {
        println!("✓ Inserted {} accounts", inserted);
    }
    println!("✓ Database contains {} accounts", count_accounts(&conn)?);

    Ok(())
}

fn run_import(config: &AppConfig, file: &Path) -> Result<()> {
    let body = fs::read_to_string(file)
        .with_context(|| format!("Failed to read readings file: {}", file.display()))?;

    let conn = config.open_seeded_database()?;
    let accounts = load_account_ids(&conn)?;

    println!("📟 Importing meter readings from {}", file.display());
    let report = {
        let mut store = SqliteReadingStore::new(&conn, IMPORT_ACTOR);
        process_upload(&body, &accounts, &mut store)
    };
    let result = report.result();
    record_upload(&conn, &body, &result, IMPORT_ACTOR)?;

    for (line, rejection) in report.rejections() {
        println!("  ✗ line {}: {}", line, rejection);
    }

    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✓ Successful readings: {}", result.successful_readings);
    println!("✓ Failed readings:     {}", result.failed_readings);
    println!("✓ Database contains {} readings", verify_count(&conn)?);

    Ok(())
}

fn run_readings(config: &AppConfig, account_id: AccountId) -> Result<()> {
    let conn = config.open_persistent_database()?;

    match get_account(&conn, account_id)? {
        Some(account) => println!("💳 {} - {}", account.account_id, account.full_name()),
        None => println!("💳 {} (not a known account)", account_id),
    }

    let readings = get_readings_for_account(&conn, account_id)?;
    if readings.is_empty() {
        println!("  no stored readings");
    }
    for reading in &readings {
        println!("  {}", reading.summary());
    }

    Ok(())
}
