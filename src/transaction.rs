// 💶 Canonical Transaction - the one schema every source row is normalized into
//
// Core fields are fixed at normalization time. Only three late-bound fields
// exist (category, internal_transfer, transfer_group_id), and each of them can
// be written once.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::{Add, Neg, Sub};

use crate::error::LateBindingError;

// ============================================================================
// MINOR UNITS
// ============================================================================

/// Signed amount in integer minor currency units (cents).
///
/// Never floating point: transfer matching compares sums against a tolerance
/// and must not drift.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MinorUnits(i64);

impl MinorUnits {
    pub const ZERO: MinorUnits = MinorUnits(0);

    pub const fn new(value: i64) -> Self {
        MinorUnits(value)
    }

    pub const fn value(self) -> i64 {
        self.0
    }

    pub const fn abs(self) -> Self {
        MinorUnits(self.0.abs())
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Add for MinorUnits {
    type Output = MinorUnits;

    fn add(self, rhs: MinorUnits) -> MinorUnits {
        MinorUnits(self.0.saturating_add(rhs.0))
    }
}

impl Sub for MinorUnits {
    type Output = MinorUnits;

    fn sub(self, rhs: MinorUnits) -> MinorUnits {
        MinorUnits(self.0.saturating_sub(rhs.0))
    }
}

impl Neg for MinorUnits {
    type Output = MinorUnits;

    fn neg(self) -> MinorUnits {
        MinorUnits(self.0.saturating_neg())
    }
}

/// Formats as a plain decimal-point number with two fractional digits ("-500.00")
impl fmt::Display for MinorUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Stable transaction identity, derived from source file + row index.
///
/// Re-importing the same file yields the same ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn derive(source_file: &str, row_index: usize) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source_file.as_bytes());
        hasher.update([0x1f]);
        hasher.update((row_index as u64).to_le_bytes());
        let digest = format!("{:x}", hasher.finalize());
        TransactionId(format!("tx_{}", &digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TransactionId {
    fn from(value: &str) -> Self {
        TransactionId(value.to_string())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared id of the two sides of one internal transfer
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferGroupId(uuid::Uuid);

impl TransferGroupId {
    pub fn generate() -> Self {
        TransferGroupId(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for TransferGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// TRANSACTION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    // ========================================================================
    // CORE FIELDS (fixed at normalization)
    // ========================================================================
    id: TransactionId,
    date: NaiveDate,
    description: String,
    amount: MinorUnits,
    currency: String,

    /// Which account this row belongs to
    account: String,

    /// Other party's name, when the source has a column for it
    counterparty: Option<String>,

    // ========================================================================
    // PROVENANCE
    // ========================================================================
    source_file: String,

    /// 0-based index among the file's data rows
    row_index: usize,

    // ========================================================================
    // LATE-BOUND FIELDS (write-once)
    // ========================================================================
    category: Option<String>,
    internal_transfer: bool,
    transfer_group_id: Option<TransferGroupId>,
}

impl Transaction {
    pub fn new(
        source_file: &str,
        row_index: usize,
        date: NaiveDate,
        description: String,
        amount: MinorUnits,
        currency: String,
        account: String,
    ) -> Self {
        Transaction {
            id: TransactionId::derive(source_file, row_index),
            date,
            description,
            amount,
            currency,
            account,
            counterparty: None,
            source_file: source_file.to_string(),
            row_index,
            category: None,
            internal_transfer: false,
            transfer_group_id: None,
        }
    }

    pub fn with_counterparty(mut self, counterparty: Option<String>) -> Self {
        self.counterparty = counterparty.filter(|c| !c.trim().is_empty());
        self
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn amount(&self) -> MinorUnits {
        self.amount
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn counterparty(&self) -> Option<&str> {
        self.counterparty.as_deref()
    }

    pub fn source_file(&self) -> &str {
        &self.source_file
    }

    pub fn row_index(&self) -> usize {
        self.row_index
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    pub fn is_internal_transfer(&self) -> bool {
        self.internal_transfer
    }

    pub fn transfer_group_id(&self) -> Option<&TransferGroupId> {
        self.transfer_group_id.as_ref()
    }

    pub fn is_debit(&self) -> bool {
        self.amount.is_negative()
    }

    pub fn is_credit(&self) -> bool {
        self.amount.is_positive()
    }

    /// Set the category (labeling collaborator). Write-once.
    pub fn assign_category(&mut self, category: impl Into<String>) -> Result<(), LateBindingError> {
        if self.category.is_some() {
            return Err(LateBindingError::CategoryAlreadySet(self.id.to_string()));
        }
        self.category = Some(category.into());
        Ok(())
    }

    /// Mark as one side of an internal transfer. Write-once, matcher only.
    pub(crate) fn mark_transfer(&mut self, group: TransferGroupId) -> Result<(), LateBindingError> {
        if let Some(existing) = &self.transfer_group_id {
            return Err(LateBindingError::AlreadyInTransferGroup(
                self.id.to_string(),
                existing.to_string(),
            ));
        }
        self.internal_transfer = true;
        self.transfer_group_id = Some(group);
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
