// ⚠️ Row rejection taxonomy
// Every rejection is local to one row; none of these abort a batch.

use thiserror::Error;

/// Why a raw line could not become a candidate reading
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseFailure {
    #[error("Line is empty")]
    EmptyLine,

    #[error("Line does not contain enough values")]
    MissingFields,

    #[error("Account id is not an integer")]
    InvalidAccountId,

    #[error("Reading timestamp is not in dd/MM/yyyy HH:mm format")]
    InvalidTimestamp,

    #[error("Reading value is not an integer")]
    InvalidReadingValue,

    #[error("Reading value is outside 0..=99999")]
    ReadingValueOutOfRange,
}

/// Why a well-formed candidate reading was not admitted
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionFailure {
    #[error("Account does not exist")]
    UnknownAccount,

    #[error("Reading already exists for this account and timestamp")]
    DuplicateReading,

    #[error("Reading is not newer than the most recent stored reading")]
    NotNewerThanExisting,

    #[error("Storage refused the reading")]
    StorageConflict,
}

/// Any reason a row counted as failed
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowRejection {
    #[error(transparent)]
    Parse(#[from] ParseFailure),

    #[error(transparent)]
    Admission(#[from] AdmissionFailure),
}

impl ParseFailure {
    /// Stable snake_case code for structured logs
    pub fn code(&self) -> &'static str {
        match self {
            ParseFailure::EmptyLine => "empty_line",
            ParseFailure::MissingFields => "missing_fields",
            ParseFailure::InvalidAccountId => "invalid_account_id",
            ParseFailure::InvalidTimestamp => "invalid_timestamp",
            ParseFailure::InvalidReadingValue => "invalid_reading_value",
            ParseFailure::ReadingValueOutOfRange => "reading_value_out_of_range",
        }
    }
}

impl AdmissionFailure {
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionFailure::UnknownAccount => "unknown_account",
            AdmissionFailure::DuplicateReading => "duplicate_reading",
            AdmissionFailure::NotNewerThanExisting => "not_newer_than_existing",
            AdmissionFailure::StorageConflict => "storage_conflict",
        }
    }
}

impl RowRejection {
    pub fn code(&self) -> &'static str {
        match self {
            RowRejection::Parse(failure) => failure.code(),
            RowRejection::Admission(failure) => failure.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_wraps_both_taxonomies() {
        let parse: RowRejection = ParseFailure::MissingFields.into();
        let admission: RowRejection = AdmissionFailure::UnknownAccount.into();

        assert_eq!(parse.code(), "missing_fields");
        assert_eq!(admission.code(), "unknown_account");
        assert_eq!(parse.to_string(), "Line does not contain enough values");
    }
}
