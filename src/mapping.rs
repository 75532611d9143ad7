// 🧭 Column Mapper - source headers → canonical fields
//
// Every source calls its columns something different ("Buchungstag",
// "Transaction Date", "Valuta"...). The mapper normalizes header text and looks
// it up in a synonym table per canonical field. Nothing is ever inferred from
// column position or cell content.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

use crate::error::{AmbiguousField, ManualMappingError, MappingIncomplete};

// ============================================================================
// CANONICAL FIELDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanonicalField {
    Date,
    Description,
    Amount,
    Account,
    Currency,
    /// Other party of the booking ("Auftraggeber/Empfänger", "Payee")
    Counterparty,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 6] = [
        CanonicalField::Date,
        CanonicalField::Description,
        CanonicalField::Amount,
        CanonicalField::Account,
        CanonicalField::Currency,
        CanonicalField::Counterparty,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CanonicalField::Date => "date",
            CanonicalField::Description => "description",
            CanonicalField::Amount => "amount",
            CanonicalField::Account => "account",
            CanonicalField::Currency => "currency",
            CanonicalField::Counterparty => "counterparty",
        }
    }

    /// Rows cannot be normalized without these
    pub fn is_required(&self) -> bool {
        matches!(
            self,
            CanonicalField::Date | CanonicalField::Description | CanonicalField::Amount
        )
    }

    /// Header synonyms, most specific first. Compared after normalization.
    pub fn synonyms(&self) -> &'static [&'static str] {
        match self {
            CanonicalField::Date => &[
                "buchungstag",
                "buchungsdatum",
                "datum",
                "date",
                "transaction date",
                "booking date",
                "posting date",
                "posted date",
                "valuta",
                "valutadatum",
                "wertstellung",
                "buchung",
            ],
            CanonicalField::Description => &[
                "verwendungszweck",
                "buchungstext",
                "beschreibung",
                "description",
                "transaction details",
                "details",
                "purpose",
                "memo",
                "text",
                "reference",
            ],
            CanonicalField::Amount => &[
                "betrag",
                "amount",
                "transaction amount",
                "betrag eur",
                "umsatz",
                "summe",
                "sum",
                "wert",
                "value",
            ],
            // Own account only. "Kontonummer" and "IBAN" columns usually hold
            // the other party's account and stay unmapped.
            CanonicalField::Account => &[
                "account",
                "konto",
                "account number",
                "account name",
                "auftragskonto",
            ],
            CanonicalField::Currency => &["wahrung", "waehrung", "currency", "ccy", "whrung"],
            CanonicalField::Counterparty => &[
                "auftraggeber empfanger",
                "auftraggeber begunstigter",
                "begunstigter zahlungspflichtiger",
                "zahlungsempfanger",
                "empfanger",
                "auftraggeber",
                "counterparty",
                "payee",
                "recipient",
                "name",
            ],
        }
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CanonicalField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        CanonicalField::ALL
            .into_iter()
            .find(|field| field.name() == wanted)
            .ok_or_else(|| format!("unknown field \"{}\" (expected one of date, description, amount, account, currency, counterparty)", s))
    }
}

// ============================================================================
// HEADER NORMALIZATION
// ============================================================================

/// Case-fold, strip diacritics, turn punctuation into single spaces.
///
/// "Währung" → "wahrung", "Transaction_Date" → "transaction date",
/// "Betrag (EUR)" → "betrag eur"
pub fn normalize_header(header: &str) -> String {
    let mut out = String::new();
    let mut pending_space = false;

    for ch in header.nfkd() {
        if is_combining_mark(ch) {
            continue;
        }
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
        } else {
            pending_space = true;
        }
    }

    out
}

/// Bank profile key: SHA-256 over the sorted, normalized header set
pub fn header_fingerprint(headers: &[String]) -> String {
    let mut normalized: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();
    normalized.sort();

    let mut hasher = Sha256::new();
    for header in &normalized {
        hasher.update(header.as_bytes());
        hasher.update([0x1f]);
    }
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// COLUMN MAPPING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingOrigin {
    Auto,
    Manual,
}

/// One canonical field bound to one source column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub field: CanonicalField,

    /// Source column, by header text
    pub column: String,

    /// 0.0 - 1.0 (manual = 1.0)
    pub confidence: f64,

    pub origin: MappingOrigin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub fingerprint: String,
    pub fields: Vec<FieldMapping>,
}

impl ColumnMapping {
    pub fn get(&self, field: CanonicalField) -> Option<&FieldMapping> {
        self.fields.iter().find(|m| m.field == field)
    }

    pub fn column(&self, field: CanonicalField) -> Option<&str> {
        self.get(field).map(|m| m.column.as_str())
    }

    pub fn is_manual(&self) -> bool {
        self.fields.iter().any(|m| m.origin == MappingOrigin::Manual)
    }

    /// Lowest confidence across mapped fields
    pub fn confidence(&self) -> f64 {
        self.fields
            .iter()
            .map(|m| m.confidence)
            .fold(1.0, f64::min)
    }

    /// Turn header names into column indexes for this file's header order.
    ///
    /// A profile is keyed by the header *set*, so the same format with columns
    /// in another order resolves correctly.
    pub fn resolve(&self, headers: &[String]) -> Result<ResolvedColumns, ManualMappingError> {
        let mut resolved = ResolvedColumns::default();

        for mapping in &self.fields {
            let wanted = normalize_header(&mapping.column);
            let index = headers
                .iter()
                .position(|h| h == &mapping.column)
                .or_else(|| headers.iter().position(|h| normalize_header(h) == wanted))
                .ok_or_else(|| ManualMappingError::UnknownColumn {
                    field: mapping.field,
                    column: mapping.column.clone(),
                })?;
            resolved.set(mapping.field, index);
        }

        for field in CanonicalField::ALL {
            if field.is_required() && resolved.get(field).is_none() {
                return Err(ManualMappingError::MissingRequired(field));
            }
        }

        Ok(resolved)
    }
}

/// Column indexes per canonical field, for one concrete file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolvedColumns {
    pub date: Option<usize>,
    pub description: Option<usize>,
    pub amount: Option<usize>,
    pub account: Option<usize>,
    pub currency: Option<usize>,
    pub counterparty: Option<usize>,
}

impl ResolvedColumns {
    pub fn get(&self, field: CanonicalField) -> Option<usize> {
        match field {
            CanonicalField::Date => self.date,
            CanonicalField::Description => self.description,
            CanonicalField::Amount => self.amount,
            CanonicalField::Account => self.account,
            CanonicalField::Currency => self.currency,
            CanonicalField::Counterparty => self.counterparty,
        }
    }

    fn set(&mut self, field: CanonicalField, index: usize) {
        let slot = match field {
            CanonicalField::Date => &mut self.date,
            CanonicalField::Description => &mut self.description,
            CanonicalField::Amount => &mut self.amount,
            CanonicalField::Account => &mut self.account,
            CanonicalField::Currency => &mut self.currency,
            CanonicalField::Counterparty => &mut self.counterparty,
        };
        *slot = Some(index);
    }
}

// ============================================================================
// MANUAL MAPPING (supplied by the UI collaborator)
// ============================================================================

/// Field → column name, as chosen by a person
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualMapping {
    pub columns: HashMap<CanonicalField, String>,
}

impl ManualMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern: bind a field to a column
    pub fn with(mut self, field: CanonicalField, column: impl Into<String>) -> Self {
        self.columns.insert(field, column.into());
        self
    }
}

// ============================================================================
// COLUMN MAPPER
// ============================================================================

const PARTIAL_MATCH_CONFIDENCE: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    column: usize,
    confidence: f64,
    exact: bool,
}

pub struct ColumnMapper;

impl ColumnMapper {
    pub fn new() -> Self {
        ColumnMapper
    }

    /// Detect a mapping from header text alone
    pub fn auto_map(&self, headers: &[String]) -> Result<ColumnMapping, MappingIncomplete> {
        let fingerprint = header_fingerprint(headers);
        let normalized: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();

        let candidates: HashMap<CanonicalField, Vec<Candidate>> = CanonicalField::ALL
            .iter()
            .map(|&field| (field, score_columns(field, &normalized)))
            .collect();

        // Columns an exact synonym already claims are off limits for partial matches
        let exact_claims: HashMap<usize, CanonicalField> = candidates
            .iter()
            .flat_map(|(&field, cands)| {
                cands.iter().filter(|c| c.exact).map(move |c| (c.column, field))
            })
            .collect();

        let mut fields = Vec::new();
        let mut missing = Vec::new();
        let mut ambiguous = Vec::new();
        let mut taken: Vec<usize> = Vec::new();

        for field in CanonicalField::ALL {
            let usable: Vec<Candidate> = candidates[&field]
                .iter()
                .copied()
                .filter(|c| {
                    c.exact || exact_claims.get(&c.column).map_or(true, |&owner| owner == field)
                })
                .filter(|c| !taken.contains(&c.column))
                .collect();

            let best = usable.iter().map(|c| c.confidence).fold(0.0, f64::max);
            let top: Vec<&Candidate> = usable
                .iter()
                .filter(|c| c.confidence > 0.0 && (c.confidence - best).abs() < f64::EPSILON)
                .collect();

            match top.as_slice() {
                [] => {
                    if field.is_required() {
                        missing.push(field);
                    }
                }
                [winner] => {
                    taken.push(winner.column);
                    fields.push(FieldMapping {
                        field,
                        column: headers[winner.column].clone(),
                        confidence: winner.confidence,
                        origin: MappingOrigin::Auto,
                    });
                }
                several if field.is_required() => ambiguous.push(AmbiguousField {
                    field,
                    columns: several.iter().map(|c| headers[c.column].clone()).collect(),
                }),
                // Optional fields are left unmapped rather than guessed
                several => debug!(%field, columns = several.len(), "optional field ambiguous, left unmapped"),
            }
        }

        if !missing.is_empty() || !ambiguous.is_empty() {
            debug!(?missing, ?ambiguous, "mapping incomplete");
            return Err(MappingIncomplete {
                fingerprint,
                headers: headers.to_vec(),
                missing,
                ambiguous,
            });
        }

        Ok(ColumnMapping { fingerprint, fields })
    }

    /// Validate a person's choice against the file's headers
    pub fn manual_map(
        &self,
        headers: &[String],
        manual: &ManualMapping,
    ) -> Result<ColumnMapping, ManualMappingError> {
        let mut fields = Vec::new();

        for field in CanonicalField::ALL {
            let Some(column) = manual.columns.get(&field) else {
                if field.is_required() {
                    return Err(ManualMappingError::MissingRequired(field));
                }
                continue;
            };

            if !headers.iter().any(|h| h == column) {
                return Err(ManualMappingError::UnknownColumn {
                    field,
                    column: column.clone(),
                });
            }
            if fields.iter().any(|m: &FieldMapping| &m.column == column) {
                return Err(ManualMappingError::DuplicateColumn(column.clone()));
            }

            fields.push(FieldMapping {
                field,
                column: column.clone(),
                confidence: 1.0,
                origin: MappingOrigin::Manual,
            });
        }

        Ok(ColumnMapping {
            fingerprint: header_fingerprint(headers),
            fields,
        })
    }
}

impl Default for ColumnMapper {
    fn default() -> Self {
        Self::new()
    }
}

/// Score every column against one field's synonyms.
///
/// Exact: normalized (or space-compacted) equality, `1.0 - 0.02 * rank`, floor 0.8.
/// Partial: the synonym's words appear as a contiguous run in the header.
fn score_columns(field: CanonicalField, normalized_headers: &[String]) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    for (column, header) in normalized_headers.iter().enumerate() {
        if header.is_empty() {
            continue;
        }
        let compact: String = header.split(' ').collect();
        let words: Vec<&str> = header.split(' ').collect();

        let mut best: Option<Candidate> = None;
        for (rank, synonym) in field.synonyms().iter().enumerate() {
            let synonym_compact: String = synonym.split(' ').collect();
            let synonym_words: Vec<&str> = synonym.split(' ').collect();

            let candidate = if header == synonym || compact == synonym_compact {
                Some(Candidate {
                    column,
                    confidence: (1.0 - 0.02 * rank as f64).max(0.8),
                    exact: true,
                })
            } else if words
                .windows(synonym_words.len())
                .any(|w| w == synonym_words.as_slice())
            {
                Some(Candidate {
                    column,
                    confidence: PARTIAL_MATCH_CONFIDENCE,
                    exact: false,
                })
            } else {
                None
            };

            if let Some(c) = candidate {
                if best.map_or(true, |b| c.confidence > b.confidence) {
                    best = Some(c);
                }
            }
        }

        if let Some(c) = best {
            candidates.push(c);
        }
    }

    candidates
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_normalize_header() {
        assert_eq!(normalize_header("Währung"), "wahrung");
        assert_eq!(normalize_header("Transaction_Date"), "transaction date");
        assert_eq!(normalize_header("  Betrag (EUR) "), "betrag eur");
        assert_eq!(normalize_header("Auftraggeber/Empfänger"), "auftraggeber empfanger");
        assert_eq!(normalize_header("---"), "");
    }

    #[test]
    fn test_field_from_str() {
        assert_eq!("Amount".parse::<CanonicalField>(), Ok(CanonicalField::Amount));
        assert_eq!(" date ".parse::<CanonicalField>(), Ok(CanonicalField::Date));
        assert!("balance".parse::<CanonicalField>().is_err());
    }

    #[test]
    fn test_fingerprint_ignores_order_and_case() {
        let a = header_fingerprint(&headers(&["Datum", "Betrag", "Text"]));
        let b = header_fingerprint(&headers(&["text", "DATUM", "Betrag"]));
        let c = header_fingerprint(&headers(&["Datum", "Betrag", "Verwendungszweck"]));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_auto_map_german_bank() {
        let h = headers(&[
            "Buchungstag",
            "Valutadatum",
            "Auftraggeber/Empfänger",
            "Verwendungszweck",
            "Betrag",
            "Währung",
        ]);
        let mapping = ColumnMapper::new().auto_map(&h).unwrap();

        assert_eq!(mapping.column(CanonicalField::Date), Some("Buchungstag"));
        assert_eq!(mapping.column(CanonicalField::Description), Some("Verwendungszweck"));
        assert_eq!(mapping.column(CanonicalField::Amount), Some("Betrag"));
        assert_eq!(mapping.column(CanonicalField::Currency), Some("Währung"));
        assert_eq!(mapping.column(CanonicalField::Account), None);
        assert_eq!(
            mapping.column(CanonicalField::Counterparty),
            Some("Auftraggeber/Empfänger")
        );
        assert!(!mapping.is_manual());
        assert_eq!(mapping.get(CanonicalField::Date).unwrap().confidence, 1.0);
    }

    #[test]
    fn test_auto_map_english_bank_with_partial_match() {
        let h = headers(&["Transaction Date", "Description", "Amount (USD)", "Balance"]);
        let mapping = ColumnMapper::new().auto_map(&h).unwrap();

        assert_eq!(mapping.column(CanonicalField::Date), Some("Transaction Date"));
        assert_eq!(mapping.column(CanonicalField::Amount), Some("Amount (USD)"));
        assert_eq!(
            mapping.get(CanonicalField::Amount).unwrap().confidence,
            PARTIAL_MATCH_CONFIDENCE
        );
        assert_eq!(mapping.confidence(), PARTIAL_MATCH_CONFIDENCE);
    }

    #[test]
    fn test_exact_match_beats_partial() {
        let h = headers(&["Wertstellung", "Text", "Betrag Fremdwährung", "Betrag"]);
        let mapping = ColumnMapper::new().auto_map(&h).unwrap();

        assert_eq!(mapping.column(CanonicalField::Date), Some("Wertstellung"));
        assert_eq!(mapping.column(CanonicalField::Amount), Some("Betrag"));
        assert!((mapping.get(CanonicalField::Date).unwrap().confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_value_date_is_not_an_amount() {
        // "Value Date" is only a partial hit for both amount and date
        let h = headers(&["Booking Date", "Memo", "Amount", "Value Date"]);
        let mapping = ColumnMapper::new().auto_map(&h).unwrap();

        assert_eq!(mapping.column(CanonicalField::Date), Some("Booking Date"));
        assert_eq!(mapping.column(CanonicalField::Amount), Some("Amount"));
    }

    #[test]
    fn test_unmatched_headers_are_incomplete() {
        let h = headers(&["Foo", "Bar", "Baz"]);
        let err = ColumnMapper::new().auto_map(&h).unwrap_err();

        assert_eq!(
            err.missing,
            vec![CanonicalField::Date, CanonicalField::Description, CanonicalField::Amount]
        );
        assert_eq!(err.headers, h);
        assert_eq!(err.fingerprint, header_fingerprint(&h));
    }

    #[test]
    fn test_ambiguous_columns_are_incomplete() {
        let h = headers(&["Date", "Description", "Amount", "Amount"]);
        let err = ColumnMapper::new().auto_map(&h).unwrap_err();

        assert!(err.missing.is_empty());
        assert_eq!(err.ambiguous.len(), 1);
        assert_eq!(err.ambiguous[0].field, CanonicalField::Amount);
        assert_eq!(err.ambiguous[0].columns, vec!["Amount", "Amount"]);
    }

    #[test]
    fn test_ambiguous_optional_field_is_left_unmapped() {
        // ING-DiBa exports carry two "Währung" columns
        let h = headers(&[
            "Buchung",
            "Valuta",
            "Auftraggeber/Empfänger",
            "Buchungstext",
            "Verwendungszweck",
            "Saldo",
            "Währung",
            "Betrag",
            "Währung",
        ]);
        let mapping = ColumnMapper::new().auto_map(&h).unwrap();

        assert_eq!(mapping.column(CanonicalField::Currency), None);
        assert_eq!(mapping.column(CanonicalField::Amount), Some("Betrag"));
        assert_eq!(mapping.column(CanonicalField::Description), Some("Verwendungszweck"));
        assert!(mapping.column(CanonicalField::Date).is_some());
    }

    #[test]
    fn test_counterparty_account_columns_are_not_own_account() {
        let h = headers(&[
            "Buchungstag",
            "Wertstellung",
            "Buchungstext",
            "Auftraggeber / Begünstigter",
            "Verwendungszweck",
            "Kontonummer",
            "BLZ",
            "Betrag (EUR)",
        ]);
        let mapping = ColumnMapper::new().auto_map(&h).unwrap();

        assert_eq!(mapping.column(CanonicalField::Account), None);
        assert_eq!(
            mapping.column(CanonicalField::Counterparty),
            Some("Auftraggeber / Begünstigter")
        );
        assert_eq!(mapping.column(CanonicalField::Amount), Some("Betrag (EUR)"));
    }

    #[test]
    fn test_manual_map() {
        let h = headers(&["Foo", "Bar", "Baz"]);
        let manual = ManualMapping::new()
            .with(CanonicalField::Date, "Foo")
            .with(CanonicalField::Description, "Bar")
            .with(CanonicalField::Amount, "Baz");

        let mapping = ColumnMapper::new().manual_map(&h, &manual).unwrap();
        assert!(mapping.is_manual());
        assert_eq!(mapping.column(CanonicalField::Amount), Some("Baz"));

        let resolved = mapping.resolve(&h).unwrap();
        assert_eq!(resolved.date, Some(0));
        assert_eq!(resolved.amount, Some(2));
        assert_eq!(resolved.currency, None);
    }

    #[test]
    fn test_manual_map_rejects_bad_input() {
        let h = headers(&["Foo", "Bar", "Baz"]);
        let mapper = ColumnMapper::new();

        let missing = ManualMapping::new()
            .with(CanonicalField::Date, "Foo")
            .with(CanonicalField::Description, "Bar");
        assert_eq!(
            mapper.manual_map(&h, &missing).unwrap_err(),
            ManualMappingError::MissingRequired(CanonicalField::Amount)
        );

        let unknown = missing.clone().with(CanonicalField::Amount, "Qux");
        assert!(matches!(
            mapper.manual_map(&h, &unknown).unwrap_err(),
            ManualMappingError::UnknownColumn { .. }
        ));

        let duplicate = missing.with(CanonicalField::Amount, "Bar");
        assert_eq!(
            mapper.manual_map(&h, &duplicate).unwrap_err(),
            ManualMappingError::DuplicateColumn("Bar".to_string())
        );
    }

    #[test]
    fn test_resolve_with_reordered_headers() {
        let original = headers(&["Datum", "Text", "Betrag"]);
        let reordered = headers(&["Betrag", "Datum", "Text"]);
        let mapping = ColumnMapper::new().auto_map(&original).unwrap();

        let resolved = mapping.resolve(&reordered).unwrap();
        assert_eq!(resolved.amount, Some(0));
        assert_eq!(resolved.date, Some(1));
        assert_eq!(resolved.description, Some(2));
    }
}
