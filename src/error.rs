// ⚠️ Error kinds for the ingestion pipeline
//
// Every failure is scoped to the smallest unit it affects:
// - a whole file (FormatDetectionError, MappingIncomplete, ManualMappingError)
// - a single row (AmountParseError, DateParseError)
// - a single late-bound field write (LateBindingError)
// None of them aborts a batch.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mapping::CanonicalField;

// ============================================================================
// FILE-LEVEL ERRORS
// ============================================================================

/// The file could not be turned into a table at all. The file is skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormatDetectionError {
    #[error("input is empty")]
    Empty,

    #[error("no candidate encoding decodes cleanly (best: {best_encoding}, {invalid_chars} invalid characters)")]
    Encoding {
        best_encoding: String,
        invalid_chars: usize,
    },

    #[error("no candidate delimiter yields a consistent column count across {sampled} records")]
    InconsistentColumns { sampled: usize },

    #[error("no header row found (no record with a majority of non-numeric tokens)")]
    NoHeader,
}

/// Headers could not be mapped to the canonical fields automatically.
///
/// Recoverable: a manual mapping for the file resolves it.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("column mapping incomplete (missing: {missing:?}, ambiguous: {ambiguous:?})")]
pub struct MappingIncomplete {
    /// Fingerprint of the header set, the bank profile key
    pub fingerprint: String,

    /// Headers as they appear in the file
    pub headers: Vec<String>,

    /// Required fields without any matching column
    pub missing: Vec<CanonicalField>,

    /// Fields whose best match is shared by several columns
    pub ambiguous: Vec<AmbiguousField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbiguousField {
    pub field: CanonicalField,
    pub columns: Vec<String>,
}

/// A manual mapping that does not fit the file it was supplied for.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManualMappingError {
    #[error("column \"{column}\" mapped to {field} does not exist in the file")]
    UnknownColumn {
        field: CanonicalField,
        column: String,
    },

    #[error("required field {0} is not mapped")]
    MissingRequired(CanonicalField),

    #[error("column \"{0}\" is mapped to more than one field")]
    DuplicateColumn(String),
}

// ============================================================================
// ROW-LEVEL ERRORS
// ============================================================================

/// A single row was excluded from the ledger.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowError {
    #[error("row {row}: cannot parse amount \"{value}\": {reason}")]
    AmountParse {
        row: usize,
        value: String,
        reason: String,
    },

    #[error("row {row}: cannot parse date \"{value}\"")]
    DateParse { row: usize, value: String },
}

impl RowError {
    pub fn row(&self) -> usize {
        match self {
            RowError::AmountParse { row, .. } | RowError::DateParse { row, .. } => *row,
        }
    }

    pub fn is_amount(&self) -> bool {
        matches!(self, RowError::AmountParse { .. })
    }

    pub fn is_date(&self) -> bool {
        matches!(self, RowError::DateParse { .. })
    }
}

// ============================================================================
// LATE-BOUND FIELD ERRORS
// ============================================================================

/// Write-once fields reject a second write.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LateBindingError {
    #[error("transaction {0} not found")]
    UnknownTransaction(String),

    #[error("transaction {0} already has a category")]
    CategoryAlreadySet(String),

    #[error("transaction {0} is already part of transfer group {1}")]
    AlreadyInTransferGroup(String, String),
}

// ============================================================================
// TESTS
// ============================================================================
