// 🔁 Transfer Matcher - pairs a debit in one account with a credit in another
//
// Runs once over the complete ledger, after every file is merged.
//
// 1. Eligibility: non-zero, not yet marked, no excluded keyword
// 2. Candidate edges: |debit + credit| ≤ tolerance, |Δdays| ≤ window,
//    different accounts, same currency (date buckets keep this near-linear)
// 3. Score: exact amount + date proximity + text evidence
// 4. Greedy commit by score; deterministic tie-break on ids
//
// Greedy is an approximation of maximum-weight matching. That is accepted.

use chrono::Datelike;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::config::MatchConfig;
use crate::ledger::UnifiedLedger;
use crate::transaction::{MinorUnits, Transaction, TransactionId, TransferGroupId};

// ============================================================================
// SCORING
// ============================================================================

const EXACT_AMOUNT_POINTS: u32 = 100;
const DATE_PROXIMITY_POINTS: u32 = 50;
const TEXT_EVIDENCE_POINTS: u32 = 30;

/// Digit runs at least this long count as account numbers ("...1234")
const MIN_ACCOUNT_DIGITS: usize = 6;

// ============================================================================
// TYPES
// ============================================================================

/// An unconfirmed debit/credit pairing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferCandidate {
    pub debit: TransactionId,
    pub credit: TransactionId,
    pub score: u32,

    /// |date(debit) - date(credit)| in days
    pub day_gap: i64,
}

/// A committed transfer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferPair {
    pub group_id: TransferGroupId,
    pub debit: TransactionId,
    pub credit: TransactionId,
    pub from_account: String,
    pub to_account: String,

    /// Absolute amount of the debit side
    pub amount: MinorUnits,
    pub currency: String,
    pub score: u32,
    pub day_gap: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchReport {
    pub eligible_debits: usize,
    pub eligible_credits: usize,
    pub candidate_edges: usize,
    pub pairs: Vec<TransferPair>,
}

impl MatchReport {
    pub fn marked_transactions(&self) -> usize {
        self.pairs.len() * 2
    }
}

// ============================================================================
// TRANSFER MATCHER
// ============================================================================

pub struct TransferMatcher {
    config: MatchConfig,
    excluded_keywords: Vec<String>,
}

impl TransferMatcher {
    pub fn new(config: MatchConfig) -> Self {
        let excluded_keywords = config
            .excluded_keywords
            .iter()
            .map(|k| k.to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        TransferMatcher {
            config,
            excluded_keywords,
        }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Can this transaction take part in a transfer at all?
    pub fn is_eligible(&self, tx: &Transaction) -> bool {
        if tx.amount().is_zero() || tx.is_internal_transfer() {
            return false;
        }
        let description = tx.description().to_lowercase();
        !self
            .excluded_keywords
            .iter()
            .any(|keyword| description.contains(keyword.as_str()))
    }

    /// All candidate edges, best first
    pub fn candidates(&self, transactions: &[Transaction]) -> Vec<TransferCandidate> {
        let window = self.config.window_days.max(0);
        let bucket_size = window.max(1);
        let bucket_of = |tx: &Transaction| {
            i64::from(tx.date().num_days_from_ce()).div_euclid(bucket_size)
        };

        let mut credit_buckets: HashMap<i64, Vec<&Transaction>> = HashMap::new();
        for tx in transactions.iter().filter(|t| t.is_credit() && self.is_eligible(t)) {
            credit_buckets.entry(bucket_of(tx)).or_default().push(tx);
        }

        let mut edges = Vec::new();
        for debit in transactions.iter().filter(|t| t.is_debit() && self.is_eligible(t)) {
            let bucket = bucket_of(debit);
            for neighbour in [bucket - 1, bucket, bucket + 1] {
                let Some(credits) = credit_buckets.get(&neighbour) else {
                    continue;
                };
                for credit in credits {
                    if let Some(edge) = self.edge(debit, credit, window) {
                        edges.push(edge);
                    }
                }
            }
        }

        edges.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.debit.cmp(&b.debit))
                .then_with(|| a.credit.cmp(&b.credit))
        });
        edges
    }

    fn edge(&self, debit: &Transaction, credit: &Transaction, window: i64) -> Option<TransferCandidate> {
        if debit.account() == credit.account() || debit.currency() != credit.currency() {
            return None;
        }

        let residual = (debit.amount() + credit.amount()).abs();
        if residual > self.config.tolerance.abs() {
            return None;
        }

        let day_gap = (debit.date() - credit.date()).num_days().abs();
        if day_gap > window {
            return None;
        }

        let mut score = 0;
        if residual.is_zero() {
            score += EXACT_AMOUNT_POINTS;
        }
        score += if window == 0 {
            DATE_PROXIMITY_POINTS
        } else {
            // day_gap ≤ window, so this stays within 0..=50; i128 since window is unbounded
            let remaining = i128::from(window - day_gap);
            (i128::from(DATE_PROXIMITY_POINTS) * remaining / i128::from(window)) as u32
        };
        if self.has_text_evidence(debit, credit) {
            score += TEXT_EVIDENCE_POINTS;
        }

        Some(TransferCandidate {
            debit: debit.id().clone(),
            credit: credit.id().clone(),
            score,
            day_gap,
        })
    }

    /// User name, or the other side's account, mentioned in a description
    /// or counterparty
    fn has_text_evidence(&self, debit: &Transaction, credit: &Transaction) -> bool {
        let debit_text = evidence_text(debit);
        let credit_text = evidence_text(credit);

        if let Some(name) = self.config.user_name.as_deref() {
            let name = name.trim().to_lowercase();
            if !name.is_empty() && (debit_text.contains(&name) || credit_text.contains(&name)) {
                return true;
            }
        }

        mentions_account(&debit_text, credit.account()) || mentions_account(&credit_text, debit.account())
    }

    /// Greedy selection: best edge first, each transaction used at most once
    pub fn select(&self, candidates: &[TransferCandidate]) -> Vec<TransferCandidate> {
        let mut used: HashSet<&TransactionId> = HashSet::new();
        let mut selected = Vec::new();

        for edge in candidates {
            if used.contains(&edge.debit) || used.contains(&edge.credit) {
                continue;
            }
            used.insert(&edge.debit);
            used.insert(&edge.credit);
            selected.push(edge.clone());
        }

        selected
    }

    /// Match the whole ledger and mark the committed pairs
    pub fn run(&self, ledger: &UnifiedLedger) -> MatchReport {
        let transactions = ledger.snapshot();
        let by_id: HashMap<&TransactionId, &Transaction> =
            transactions.iter().map(|tx| (tx.id(), tx)).collect();

        let candidates = self.candidates(&transactions);
        let mut report = MatchReport {
            eligible_debits: transactions
                .iter()
                .filter(|t| t.is_debit() && self.is_eligible(t))
                .count(),
            eligible_credits: transactions
                .iter()
                .filter(|t| t.is_credit() && self.is_eligible(t))
                .count(),
            candidate_edges: candidates.len(),
            pairs: Vec::new(),
        };

        for edge in self.select(&candidates) {
            let (Some(debit), Some(credit)) = (by_id.get(&edge.debit), by_id.get(&edge.credit)) else {
                continue;
            };

            let group = TransferGroupId::generate();
            if let Err(err) = ledger.mark_transfer(&edge.debit, &edge.credit, &group) {
                warn!(%err, "transfer pair not marked");
                continue;
            }
            debug!(
                debit = %edge.debit,
                credit = %edge.credit,
                score = edge.score,
                "transfer matched"
            );

            report.pairs.push(TransferPair {
                group_id: group,
                debit: edge.debit,
                credit: edge.credit,
                from_account: debit.account().to_string(),
                to_account: credit.account().to_string(),
                amount: debit.amount().abs(),
                currency: debit.currency().to_string(),
                score: edge.score,
                day_gap: edge.day_gap,
            });
        }

        info!(
            candidates = report.candidate_edges,
            pairs = report.pairs.len(),
            "transfer matching done"
        );
        report
    }
}

impl Default for TransferMatcher {
    fn default() -> Self {
        Self::new(MatchConfig::default())
    }
}

// ============================================================================
// TEXT EVIDENCE
// ============================================================================

fn evidence_text(tx: &Transaction) -> String {
    match tx.counterparty() {
        Some(counterparty) => format!("{} {}", tx.description(), counterparty).to_lowercase(),
        None => tx.description().to_lowercase(),
    }
}

/// Does `text` (lowercase) mention `account` as a whole word, or the last
/// four digits of the account's longest digit run?
fn mentions_account(text: &str, account: &str) -> bool {
    let account = account.trim().to_lowercase();
    if account.is_empty() {
        return false;
    }

    let is_word_char = |c: char| c.is_alphanumeric();
    let whole_word = text.match_indices(account.as_str()).any(|(start, matched)| {
        let before = text[..start].chars().next_back();
        let after = text[start + matched.len()..].chars().next();
        !before.is_some_and(is_word_char) && !after.is_some_and(is_word_char)
    });
    if whole_word {
        return true;
    }

    let longest_run = account
        .split(|c: char| !c.is_ascii_digit())
        .max_by_key(|run| run.len())
        .unwrap_or("");
    if longest_run.len() < MIN_ACCOUNT_DIGITS {
        return false;
    }

    let tail = &longest_run[longest_run.len() - 4..];
    text.contains(tail)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn create_test_transaction(
        file: &str,
        row: usize,
        date: (u32, u32),
        amount: i64,
        description: &str,
        account: &str,
    ) -> Transaction {
        Transaction::new(
            file,
            row,
            NaiveDate::from_ymd_opt(2025, date.0, date.1).unwrap(),
            description.to_string(),
            MinorUnits::new(amount),
            "EUR".to_string(),
            account.to_string(),
        )
    }

    fn ledger_with(transactions: Vec<Transaction>) -> UnifiedLedger {
        let ledger = UnifiedLedger::new();
        ledger.append(transactions);
        ledger
    }

    #[test]
    fn test_basic_transfer_is_matched() {
        let a = create_test_transaction("a.csv", 0, (1, 5), -50000, "Transfer to B", "A");
        let b = create_test_transaction("b.csv", 0, (1, 6), 50000, "From A", "B");
        let (a_id, b_id) = (a.id().clone(), b.id().clone());
        let ledger = ledger_with(vec![a, b]);

        let report = TransferMatcher::default().run(&ledger);
        assert_eq!(report.pairs.len(), 1);
        assert_eq!(report.marked_transactions(), 2);

        let a = ledger.get(&a_id).unwrap();
        let b = ledger.get(&b_id).unwrap();
        assert!(a.is_internal_transfer());
        assert!(b.is_internal_transfer());
        assert!(a.transfer_group_id().is_some());
        assert_eq!(a.transfer_group_id(), b.transfer_group_id());

        // 100 exact + 50·(2-1)/2 date + 30 ("to b" / "from a" name the other account)
        let pair = &report.pairs[0];
        assert_eq!(pair.score, 155);
        assert_eq!(pair.from_account, "A");
        assert_eq!(pair.to_account, "B");
        assert_eq!(pair.amount, MinorUnits::new(50000));
    }

    #[test]
    fn test_amount_outside_tolerance_is_not_matched() {
        let ledger = ledger_with(vec![
            create_test_transaction("a.csv", 0, (1, 5), -50000, "Transfer to B", "A"),
            create_test_transaction("b.csv", 0, (1, 6), 49950, "From A", "B"),
        ]);

        let report = TransferMatcher::default().run(&ledger);
        assert!(report.pairs.is_empty());
        assert!(ledger.view().iter().all(|tx| !tx.is_internal_transfer()));
    }

    #[test]
    fn test_within_tolerance_scores_lower() {
        let ledger = ledger_with(vec![
            create_test_transaction("a.csv", 0, (1, 5), -50000, "Out", "A"),
            create_test_transaction("b.csv", 0, (1, 5), 49999, "In", "B"),
        ]);

        let report = TransferMatcher::default().run(&ledger);
        assert_eq!(report.pairs.len(), 1);
        assert_eq!(report.pairs[0].score, 50);
    }

    #[test]
    fn test_window_and_same_account_rules() {
        let ledger = ledger_with(vec![
            create_test_transaction("a.csv", 0, (1, 5), -50000, "Out", "A"),
            create_test_transaction("b.csv", 0, (1, 8), 50000, "Three days later", "B"),
            create_test_transaction("a.csv", 1, (1, 5), 50000, "Refund", "A"),
        ]);

        let report = TransferMatcher::default().run(&ledger);
        assert!(report.pairs.is_empty());
        assert_eq!(report.candidate_edges, 0);
    }

    #[test]
    fn test_huge_window_does_not_overflow() {
        let ledger = ledger_with(vec![
            create_test_transaction("a.csv", 0, (1, 5), -50000, "Out", "A"),
            create_test_transaction("b.csv", 0, (1, 6), 50000, "In", "B"),
        ]);
        let config = MatchConfig {
            window_days: i64::MAX / 10,
            ..MatchConfig::default()
        };

        let report = TransferMatcher::new(config).run(&ledger);
        assert_eq!(report.pairs.len(), 1);
        // 100 exact + 50·(W-1)/W rounds down to 49
        assert_eq!(report.pairs[0].score, 149);
    }

    #[test]
    fn test_window_crosses_month_boundary() {
        let ledger = ledger_with(vec![
            create_test_transaction("a.csv", 0, (1, 31), -20000, "Out", "A"),
            create_test_transaction("b.csv", 0, (2, 2), 20000, "In", "B"),
        ]);

        let report = TransferMatcher::default().run(&ledger);
        assert_eq!(report.pairs.len(), 1);
        assert_eq!(report.pairs[0].day_gap, 2);
    }

    #[test]
    fn test_zero_window_requires_same_day() {
        let matcher = TransferMatcher::new(MatchConfig::default().with_window_days(0));
        let ledger = ledger_with(vec![
            create_test_transaction("a.csv", 0, (1, 5), -100, "Out", "A"),
            create_test_transaction("b.csv", 0, (1, 5), 100, "In", "B"),
            create_test_transaction("a.csv", 1, (1, 6), -200, "Out", "A"),
            create_test_transaction("b.csv", 1, (1, 7), 200, "In", "B"),
        ]);

        let report = matcher.run(&ledger);
        assert_eq!(report.pairs.len(), 1);
        assert_eq!(report.pairs[0].score, 150);
    }

    #[test]
    fn test_greedy_prefers_best_score_and_uses_each_side_once() {
        // Two credits fit the debit; the same-day one wins, the other stays free
        let debit = create_test_transaction("a.csv", 0, (1, 5), -10000, "Out", "A");
        let near = create_test_transaction("b.csv", 0, (1, 5), 10000, "In", "B");
        let far = create_test_transaction("c.csv", 0, (1, 7), 10000, "In", "C");
        let (near_id, far_id) = (near.id().clone(), far.id().clone());
        let ledger = ledger_with(vec![debit, near, far]);

        let report = TransferMatcher::default().run(&ledger);
        assert_eq!(report.candidate_edges, 2);
        assert_eq!(report.pairs.len(), 1);
        assert_eq!(report.pairs[0].credit, near_id);
        assert!(!ledger.get(&far_id).unwrap().is_internal_transfer());
    }

    #[test]
    fn test_ties_break_on_ids() {
        let matcher = TransferMatcher::default();
        let debit = create_test_transaction("a.csv", 0, (1, 5), -10000, "Out", "A");
        let c1 = create_test_transaction("b.csv", 0, (1, 5), 10000, "In", "B");
        let c2 = create_test_transaction("c.csv", 0, (1, 5), 10000, "In", "C");
        let expected = std::cmp::min(c1.id().clone(), c2.id().clone());

        let candidates = matcher.candidates(&[debit.clone(), c2.clone(), c1.clone()]);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].score, candidates[1].score);
        assert_eq!(matcher.select(&candidates)[0].credit, expected);

        // Input order does not matter
        let reordered = matcher.candidates(&[c1, debit, c2]);
        assert_eq!(candidates, reordered);
    }

    #[test]
    fn test_exclusions() {
        let ledger = ledger_with(vec![
            create_test_transaction("a.csv", 0, (1, 5), -100000, "WP-Kauf ETF World", "A"),
            create_test_transaction("b.csv", 0, (1, 5), 100000, "Depot Eingang", "B"),
            create_test_transaction("a.csv", 1, (1, 6), 0, "Zero", "A"),
            create_test_transaction("b.csv", 1, (1, 6), 0, "Zero", "B"),
        ]);

        let matcher = TransferMatcher::default();
        assert!(ledger.view().iter().all(|tx| !matcher.is_eligible(tx) || tx.is_credit()));

        let report = matcher.run(&ledger);
        assert!(report.pairs.is_empty());
        assert_eq!(report.eligible_debits, 0);
        assert_eq!(report.eligible_credits, 1);
    }

    #[test]
    fn test_currency_must_agree() {
        let usd = Transaction::new(
            "b.csv",
            0,
            NaiveDate::from_ymd_opt(2025, 1, 5).unwrap(),
            "In".to_string(),
            MinorUnits::new(10000),
            "USD".to_string(),
            "B".to_string(),
        );
        let ledger = ledger_with(vec![
            create_test_transaction("a.csv", 0, (1, 5), -10000, "Out", "A"),
            usd,
        ]);

        assert!(TransferMatcher::default().run(&ledger).pairs.is_empty());
    }

    #[test]
    fn test_second_run_marks_nothing_new() {
        let ledger = ledger_with(vec![
            create_test_transaction("a.csv", 0, (1, 5), -50000, "Out", "A"),
            create_test_transaction("b.csv", 0, (1, 6), 50000, "In", "B"),
        ]);

        let matcher = TransferMatcher::default();
        assert_eq!(matcher.run(&ledger).pairs.len(), 1);
        let groups: Vec<_> = ledger.view().iter().map(|t| t.transfer_group_id().cloned()).collect();

        assert!(matcher.run(&ledger).pairs.is_empty());
        let again: Vec<_> = ledger.view().iter().map(|t| t.transfer_group_id().cloned()).collect();
        assert_eq!(groups, again);
    }

    #[test]
    fn test_user_name_evidence() {
        let matcher = TransferMatcher::new(MatchConfig::default().with_user_name("Max Mustermann"));
        let debit = create_test_transaction("a.csv", 0, (1, 5), -10000, "Überweisung MAX MUSTERMANN", "giro");
        let credit = create_test_transaction("b.csv", 0, (1, 7), 10000, "Gutschrift", "tagesgeld");

        let candidates = matcher.candidates(&[debit, credit]);
        // exact amount + name evidence, no date points at the window edge
        assert_eq!(candidates[0].score, 130);
    }

    #[test]
    fn test_user_name_in_counterparty_column() {
        let matcher = TransferMatcher::new(MatchConfig::default().with_user_name("Max Mustermann"));
        let debit = create_test_transaction("a.csv", 0, (1, 5), -10000, "Umbuchung", "giro")
            .with_counterparty(Some("Max Mustermann".to_string()));
        let credit = create_test_transaction("b.csv", 0, (1, 7), 10000, "Gutschrift", "tagesgeld");

        let candidates = matcher.candidates(&[debit.clone(), credit.clone()]);
        assert_eq!(candidates[0].score, 130);

        let without = create_test_transaction("a.csv", 0, (1, 5), -10000, "Umbuchung", "giro");
        assert_eq!(matcher.candidates(&[without, credit])[0].score, 100);
    }

    #[test]
    fn test_mentions_account() {
        assert!(mentions_account("transfer to b", "B"));
        assert!(!mentions_account("transfer to bob", "B"));
        assert!(mentions_account("umbuchung tagesgeld", "Tagesgeld"));
        assert!(mentions_account("an konto ****3000", "DE89 3704 0044 0532 013000"));
        assert!(!mentions_account("an konto 1234", "DE89 3704 0044 0532 013000"));
        assert!(!mentions_account("anything", "  "));
    }
}
