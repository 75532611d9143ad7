// 📒 Unified Ledger - every normalized transaction of one batch, in one order
//
// Order: ascending date, ties kept in ingestion order (stable sort).
// Appending is the only structural mutation. Late-bound fields go through
// dedicated operations so the write-once rules live in one place.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::ops::Deref;
use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use tracing::warn;

use crate::error::LateBindingError;
use crate::transaction::{MinorUnits, Transaction, TransactionId, TransferGroupId};

/// Column order of the canonical CSV export
pub const EXPORT_COLUMNS: [&str; 9] = [
    "date",
    "description",
    "counterparty",
    "amount",
    "account",
    "currency",
    "category",
    "internal_transfer",
    "source_file",
];

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

// ============================================================================
// STORAGE
// ============================================================================

#[derive(Default)]
struct LedgerRows {
    rows: Vec<Transaction>,
    index: HashMap<TransactionId, usize>,
}

impl LedgerRows {
    fn reindex(&mut self) {
        self.index = self
            .rows
            .iter()
            .enumerate()
            .map(|(i, tx)| (tx.id().clone(), i))
            .collect();
    }

    fn get_mut(&mut self, id: &TransactionId) -> Result<&mut Transaction, LateBindingError> {
        match self.index.get(id) {
            Some(&i) => Ok(&mut self.rows[i]),
            None => Err(LateBindingError::UnknownTransaction(id.to_string())),
        }
    }
}

/// Read guard over the ordered transactions
pub struct LedgerView<'a> {
    guard: RwLockReadGuard<'a, LedgerRows>,
}

impl Deref for LedgerView<'_> {
    type Target = [Transaction];

    fn deref(&self) -> &[Transaction] {
        &self.guard.rows
    }
}

// ============================================================================
// UNIFIED LEDGER
// ============================================================================

#[derive(Default)]
pub struct UnifiedLedger {
    inner: RwLock<LedgerRows>,
}

impl UnifiedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one file's transactions; returns how many were added.
    ///
    /// Ids already in the ledger are skipped, so a file merged twice does not
    /// double its rows.
    pub fn append(&self, transactions: Vec<Transaction>) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        let before = inner.rows.len();
        for tx in transactions {
            if inner.index.contains_key(tx.id()) {
                warn!(id = %tx.id(), file = tx.source_file(), "duplicate transaction id skipped");
                continue;
            }
            let position = inner.rows.len();
            inner.index.insert(tx.id().clone(), position);
            inner.rows.push(tx);
        }
        let added = inner.rows.len() - before;

        if added > 0 {
            inner.rows.sort_by_key(|tx| tx.date());
            inner.reindex();
        }
        added
    }

    /// Guarded read-only view; holds the read lock while alive
    pub fn view(&self) -> LedgerView<'_> {
        LedgerView {
            guard: self.inner.read().unwrap_or_else(PoisonError::into_inner),
        }
    }

    pub fn snapshot(&self) -> Vec<Transaction> {
        self.view().to_vec()
    }

    pub fn len(&self) -> usize {
        self.view().len()
    }

    pub fn is_empty(&self) -> bool {
        self.view().is_empty()
    }

    pub fn get(&self, id: &TransactionId) -> Option<Transaction> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.index.get(id).map(|&i| inner.rows[i].clone())
    }

    // ========================================================================
    // LATE-BOUND WRITES
    // ========================================================================

    /// Labeling collaborator writes a category back (once per transaction)
    pub fn assign_category(
        &self,
        id: &TransactionId,
        category: impl Into<String>,
    ) -> Result<(), LateBindingError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.get_mut(id)?.assign_category(category)
    }

    /// Mark both sides of a transfer. Nothing is written unless both can be.
    pub(crate) fn mark_transfer(
        &self,
        debit: &TransactionId,
        credit: &TransactionId,
        group: &TransferGroupId,
    ) -> Result<(), LateBindingError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        for id in [debit, credit] {
            let tx = inner.get_mut(id)?;
            if let Some(existing) = tx.transfer_group_id() {
                return Err(LateBindingError::AlreadyInTransferGroup(
                    id.to_string(),
                    existing.to_string(),
                ));
            }
        }

        inner.get_mut(debit)?.mark_transfer(group.clone())?;
        inner.get_mut(credit)?.mark_transfer(group.clone())?;
        Ok(())
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// Transactions still waiting for a category. Transfers never need one.
    pub fn labeling_queue(&self) -> Vec<Transaction> {
        self.view()
            .iter()
            .filter(|tx| tx.category().is_none() && !tx.is_internal_transfer())
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> LedgerSummary {
        LedgerSummary::from_transactions(&self.view())
    }

    // ========================================================================
    // EXPORT
    // ========================================================================

    /// Canonical CSV: fixed columns, ISO dates, decimal-point amounts, UTF-8 BOM
    pub fn write_csv<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_all(UTF8_BOM).context("Failed to write BOM")?;

        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(EXPORT_COLUMNS)?;

        for tx in self.view().iter() {
            wtr.write_record([
                tx.date().format("%Y-%m-%d").to_string(),
                tx.description().to_string(),
                tx.counterparty().unwrap_or("").to_string(),
                tx.amount().to_string(),
                tx.account().to_string(),
                tx.currency().to_string(),
                tx.category().unwrap_or("").to_string(),
                tx.is_internal_transfer().to_string(),
                tx.source_file().to_string(),
            ])
            .with_context(|| format!("Failed to write transaction {}", tx.id()))?;
        }

        wtr.flush().context("Failed to flush CSV export")?;
        Ok(())
    }

    pub fn to_csv_bytes(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.write_csv(&mut buffer)?;
        Ok(buffer)
    }

    pub fn export_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())
            .with_context(|| format!("Failed to create export file: {:?}", path.as_ref()))?;
        self.write_csv(BufWriter::new(file))
    }
}

// ============================================================================
// SUMMARY
// ============================================================================

/// Income/expense totals of one currency. Internal transfers are not income
/// or expense; they only count towards the transfer volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CurrencyTotals {
    pub income: MinorUnits,
    pub expenses: MinorUnits,
    pub net: MinorUnits,

    /// Sum of the debit sides of internal transfers (absolute)
    pub transfer_volume: MinorUnits,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    pub transactions: usize,
    pub accounts: usize,
    pub internal_transfers: usize,
    pub transfer_groups: usize,
    pub uncategorized: usize,
    pub by_currency: BTreeMap<String, CurrencyTotals>,
}

impl LedgerSummary {
    pub fn from_transactions(transactions: &[Transaction]) -> Self {
        let mut summary = LedgerSummary {
            transactions: transactions.len(),
            ..Default::default()
        };
        let mut accounts = BTreeSet::new();
        let mut groups = BTreeSet::new();

        for tx in transactions {
            accounts.insert(tx.account());
            let totals = summary.by_currency.entry(tx.currency().to_string()).or_default();

            if tx.is_internal_transfer() {
                summary.internal_transfers += 1;
                if let Some(group) = tx.transfer_group_id() {
                    groups.insert(group.clone());
                }
                if tx.is_debit() {
                    totals.transfer_volume = totals.transfer_volume + tx.amount().abs();
                }
                continue;
            }

            if tx.category().is_none() {
                summary.uncategorized += 1;
            }
            if tx.is_credit() {
                totals.income = totals.income + tx.amount();
            } else {
                totals.expenses = totals.expenses + tx.amount().abs();
            }
            totals.net = totals.income - totals.expenses;
        }

        summary.accounts = accounts.len();
        summary.transfer_groups = groups.len();
        summary
    }
}

// ============================================================================
// TESTS
// ============================================================================
