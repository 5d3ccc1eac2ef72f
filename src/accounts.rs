// 💳 Accounts - reference data for the account existence check
//
// Accounts are loaded once from a reference CSV and never change afterwards.
// The admission pipeline only ever asks "does this account id exist?".

use crate::reading::AccountId;
use anyhow::{Context, Result};
use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, warn};

/// Number of columns in the reference accounts file
const ACCOUNT_COLUMNS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    #[serde(rename = "AccountId")]
    pub account_id: AccountId,

    #[serde(rename = "FirstName")]
    pub first_name: String,

    #[serde(rename = "LastName")]
    pub last_name: String,
}

impl Account {
    pub fn new(account_id: AccountId, first_name: &str, last_name: &str) -> Self {
        Account {
            account_id,
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

// ============================================================================
// ACCOUNT LOOKUP
// ============================================================================

/// Existence lookup consumed by the admission validator
pub trait AccountLookup {
    fn account_exists(&self, account_id: AccountId) -> bool;
}

impl AccountLookup for HashSet<AccountId> {
    fn account_exists(&self, account_id: AccountId) -> bool {
        self.contains(&account_id)
    }
}

impl AccountLookup for HashMap<AccountId, Account> {
    fn account_exists(&self, account_id: AccountId) -> bool {
        self.contains_key(&account_id)
    }
}

impl AccountLookup for [Account] {
    fn account_exists(&self, account_id: AccountId) -> bool {
        self.iter().any(|a| a.account_id == account_id)
    }
}

// ============================================================================
// REFERENCE FILE LOADING
// ============================================================================

/// Load accounts from a reference CSV (`AccountId,FirstName,LastName`)
///
/// Rows that do not have exactly three columns, or whose id is not an
/// integer, are skipped with a warning rather than failing the load.
pub fn load_accounts_csv(csv_path: &Path) -> Result<Vec<Account>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(csv_path)
        .with_context(|| format!("Failed to open accounts file: {}", csv_path.display()))?;

    let headers = rdr
        .headers()
        .context("Failed to read accounts header")?
        .clone();

    let mut accounts = Vec::new();

    for (index, result) in rdr.records().enumerate() {
        // +2 because: 1-indexed + header row
        let line = index + 2;
        let record = result.with_context(|| format!("Failed to read accounts line {}", line))?;

        if record.len() != ACCOUNT_COLUMNS {
            warn!(line, columns = record.len(), "Skipping account row with wrong column count");
            continue;
        }

        match record.deserialize::<Account>(Some(&headers)) {
            Ok(account) => accounts.push(account),
            Err(e) => {
                warn!(line, error = %e, "Skipping malformed account row");
            }
        }
    }

    debug!(count = accounts.len(), path = %csv_path.display(), "Loaded reference accounts");

    Ok(accounts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_csv(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_accounts_csv() {
        let file = write_csv("AccountId,FirstName,LastName\n2344,Tommy,Test\n2233,Barry,Test\n");

        let accounts = load_accounts_csv(file.path()).unwrap();

        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0], Account::new(2344, "Tommy", "Test"));
        assert_eq!(accounts[1].full_name(), "Barry Test");
    }

    #[test]
    fn test_load_accounts_skips_bad_rows() {
        let file = write_csv(
            "AccountId,FirstName,LastName\n\
             2344,Tommy,Test\n\
             abc,Bad,Id\n\
             1234,Too,Many,Columns\n\
             8766,Sally,Test\n",
        );

        let accounts = load_accounts_csv(file.path()).unwrap();
        let ids: Vec<AccountId> = accounts.iter().map(|a| a.account_id).collect();

        assert_eq!(ids, vec![2344, 8766]);
    }

    #[test]
    fn test_load_accounts_missing_file() {
        let result = load_accounts_csv(Path::new("/nonexistent/accounts.csv"));
        assert!(result.is_err());
    }

    #[test]
    fn test_lookup_impls() {
        let ids: HashSet<AccountId> = [2344, 2233].into_iter().collect();
        assert!(ids.account_exists(2344));
        assert!(!ids.account_exists(9999));

        let accounts = vec![Account::new(8766, "Sally", "Test")];
        assert!(accounts.as_slice().account_exists(8766));

        let by_id: HashMap<AccountId, Account> =
            accounts.into_iter().map(|a| (a.account_id, a)).collect();
        assert!(by_id.account_exists(8766));
        assert!(!by_id.account_exists(2344));
    }
}
