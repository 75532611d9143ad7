// 🧮 Record Normalizer - raw cells → canonical Transaction values
//
// Conventions are decided per column, never per cell:
// - decimal comma vs decimal point by majority vote over the amount column
// - one date format for the whole date column
// A row that still fails to parse is excluded and reported; the file goes on.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::NormalizeConfig;
use crate::error::RowError;
use crate::mapping::{CanonicalField, ResolvedColumns};
use crate::sniffer::{RawRecord, SniffedTable};
use crate::transaction::{MinorUnits, Transaction};

/// Per-file sample of excluded rows kept for diagnostics
pub const MAX_ERROR_SAMPLES: usize = 5;

// ============================================================================
// DECIMAL CONVENTION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecimalConvention {
    /// 1,234.56
    DecimalPoint,
    /// 1.234,56
    DecimalComma,
}

impl DecimalConvention {
    pub fn decimal_separator(&self) -> char {
        match self {
            DecimalConvention::DecimalPoint => '.',
            DecimalConvention::DecimalComma => ',',
        }
    }

    pub fn group_separator(&self) -> char {
        match self {
            DecimalConvention::DecimalPoint => ',',
            DecimalConvention::DecimalComma => '.',
        }
    }

    fn with_decimal(separator: char) -> Self {
        if separator == ',' {
            DecimalConvention::DecimalComma
        } else {
            DecimalConvention::DecimalPoint
        }
    }
}

/// What a single value says about the convention, if anything.
///
/// "1.234,56" → comma (last separator is decimal)
/// "12,5"     → comma (not followed by exactly three digits)
/// "1,234,567"→ point (repeated separator is grouping)
/// "1,234"    → nothing (could be either)
fn convention_vote(value: &str) -> Option<DecimalConvention> {
    let separators: Vec<(usize, char)> = value
        .char_indices()
        .filter(|(_, c)| *c == '.' || *c == ',')
        .collect();

    let (last_pos, last) = *separators.last()?;

    if separators.iter().any(|(_, c)| *c != last) {
        return Some(DecimalConvention::with_decimal(last));
    }

    if separators.len() > 1 {
        // Same separator repeated: it can only be grouping
        let decimal = if last == ',' { '.' } else { ',' };
        return Some(DecimalConvention::with_decimal(decimal));
    }

    let digits_after = value[last_pos + 1..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .count();
    if digits_after == 3 {
        None
    } else {
        Some(DecimalConvention::with_decimal(last))
    }
}

/// Majority vote over a column sample; ties fall back to decimal point
pub fn detect_convention<'a, I>(values: I) -> DecimalConvention
where
    I: IntoIterator<Item = &'a str>,
{
    let mut point = 0usize;
    let mut comma = 0usize;

    for value in values {
        match convention_vote(value) {
            Some(DecimalConvention::DecimalPoint) => point += 1,
            Some(DecimalConvention::DecimalComma) => comma += 1,
            None => {}
        }
    }

    debug!(point, comma, "decimal convention votes");
    if comma > point {
        DecimalConvention::DecimalComma
    } else {
        DecimalConvention::DecimalPoint
    }
}

// ============================================================================
// AMOUNT PARSING
// ============================================================================

/// A parsed amount plus a currency found inside the amount text ("€", "USD")
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAmount {
    pub minor: MinorUnits,
    pub currency: Option<String>,
}

/// Map a currency symbol or three-letter code to an ISO code
pub fn currency_code(token: &str) -> Option<String> {
    let token = token.trim();
    match token {
        "€" => return Some("EUR".to_string()),
        "$" => return Some("USD".to_string()),
        "£" => return Some("GBP".to_string()),
        "¥" => return Some("JPY".to_string()),
        _ => {}
    }

    if token.len() == 3 && token.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(token.to_ascii_uppercase())
    } else {
        None
    }
}

/// Parse one amount cell into signed minor units.
///
/// Accepts currency symbols/codes, spaces, NBSP and apostrophes as grouping,
/// leading `+`/`-`, a trailing `-` and accounting parentheses.
pub fn parse_amount(raw: &str, convention: DecimalConvention) -> Result<ParsedAmount, String> {
    let mut text: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '\'' | '’' | '\u{a0}' | '\u{202f}'))
        .map(|c| if c == '−' { '-' } else { c })
        .collect();

    if text.is_empty() {
        return Err("empty value".to_string());
    }

    // Currency: symbol anywhere, or a three-letter code at either end
    let mut currency = None;
    for symbol in ['€', '$', '£', '¥'] {
        if text.contains(symbol) {
            currency = currency_code(&symbol.to_string());
            text = text.replace(symbol, "");
            break;
        }
    }
    if currency.is_none() {
        let letters_front = text.chars().take_while(|c| c.is_ascii_alphabetic()).count();
        let letters_back = text.chars().rev().take_while(|c| c.is_ascii_alphabetic()).count();
        if letters_front == 3 {
            currency = currency_code(&text[..3]);
            text = text[3..].to_string();
        } else if letters_back == 3 {
            let split = text.len() - 3;
            currency = currency_code(&text[split..]);
            text.truncate(split);
        }
    }

    // Sign
    let mut negative = false;
    if text.starts_with('(') && text.ends_with(')') && text.len() >= 2 {
        negative = true;
        text = text[1..text.len() - 1].to_string();
    }
    if let Some(rest) = text.strip_prefix('-') {
        negative = !negative;
        text = rest.to_string();
    } else if let Some(rest) = text.strip_prefix('+') {
        text = rest.to_string();
    } else if let Some(rest) = text.strip_suffix('-') {
        negative = !negative;
        text = rest.to_string();
    }

    if !text.chars().any(|c| c.is_ascii_digit()) {
        return Err("no digits".to_string());
    }
    if let Some(bad) = text.chars().find(|c| !c.is_ascii_digit() && *c != '.' && *c != ',') {
        return Err(format!("unexpected character '{}'", bad));
    }

    let decimal = convention.decimal_separator();
    let group = convention.group_separator();

    let mut parts = text.split(decimal);
    let integer_text = parts.next().unwrap_or("");
    let fraction_text = parts.next().unwrap_or("");
    if parts.next().is_some() {
        return Err(format!("more than one decimal separator '{}'", decimal));
    }
    if fraction_text.contains(group) {
        return Err(format!("grouping separator '{}' after the decimal separator", group));
    }

    let integer_digits = validate_grouping(integer_text, group)?;
    let fraction = parse_fraction(fraction_text)?;

    let units = integer_digits
        .chars()
        .try_fold(0i64, |acc, c| {
            acc.checked_mul(10)?.checked_add(i64::from(c.to_digit(10)?))
        })
        .ok_or_else(|| "amount out of range".to_string())?;

    let minor = units
        .checked_mul(100)
        .and_then(|v| v.checked_add(fraction))
        .ok_or_else(|| "amount out of range".to_string())?;

    Ok(ParsedAmount {
        minor: MinorUnits::new(if negative { -minor } else { minor }),
        currency,
    })
}

/// "1.234.567" → "1234567"; rejects "12.34.5" and friends
fn validate_grouping(integer_text: &str, group: char) -> Result<String, String> {
    if !integer_text.contains(group) {
        return Ok(integer_text.to_string());
    }

    let groups: Vec<&str> = integer_text.split(group).collect();
    let first_ok = (1..=3).contains(&groups[0].len());
    let rest_ok = groups[1..].iter().all(|g| g.len() == 3);
    if !first_ok || !rest_ok {
        return Err(format!("invalid thousands grouping \"{}\"", integer_text));
    }

    Ok(groups.concat())
}

/// Up to two digits; further digits must be zeros ("12,500" → 50)
fn parse_fraction(fraction_text: &str) -> Result<i64, String> {
    if fraction_text.len() > 2 && fraction_text[2..].chars().any(|c| c != '0') {
        return Err(format!("more than two fractional digits \"{}\"", fraction_text));
    }

    let mut digits: String = fraction_text.chars().take(2).collect();
    while digits.len() < 2 {
        digits.push('0');
    }
    digits
        .parse::<i64>()
        .map_err(|_| format!("invalid fraction \"{}\"", fraction_text))
}

// ============================================================================
// DATE PARSING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DateFormat {
    /// DD.MM.YYYY
    DayMonthYearDot,
    /// YYYY-MM-DD
    Iso,
    /// DD/MM/YYYY
    DayMonthYearSlash,
    /// MM/DD/YYYY
    MonthDayYearSlash,
    /// DD.MM.YY
    DayMonthShortYearDot,
    /// YYYYMMDD
    Compact,
    /// DD-MM-YYYY
    DayMonthYearDash,
    /// YYYY/MM/DD
    YearMonthDaySlash,
}

impl DateFormat {
    /// Priority order; earlier formats win when several fit a column
    pub const ALL: [DateFormat; 8] = [
        DateFormat::DayMonthYearDot,
        DateFormat::Iso,
        DateFormat::DayMonthYearSlash,
        DateFormat::MonthDayYearSlash,
        DateFormat::DayMonthShortYearDot,
        DateFormat::Compact,
        DateFormat::DayMonthYearDash,
        DateFormat::YearMonthDaySlash,
    ];

    pub fn pattern(&self) -> &'static str {
        match self {
            DateFormat::DayMonthYearDot => "%d.%m.%Y",
            DateFormat::Iso => "%Y-%m-%d",
            DateFormat::DayMonthYearSlash => "%d/%m/%Y",
            DateFormat::MonthDayYearSlash => "%m/%d/%Y",
            DateFormat::DayMonthShortYearDot => "%d.%m.%y",
            DateFormat::Compact => "%Y%m%d",
            DateFormat::DayMonthYearDash => "%d-%m-%Y",
            DateFormat::YearMonthDaySlash => "%Y/%m/%d",
        }
    }

    fn has_four_digit_year(&self) -> bool {
        !matches!(self, DateFormat::DayMonthShortYearDot)
    }

    /// Parse one cell; any time part after the date is ignored
    pub fn parse(&self, raw: &str) -> Option<NaiveDate> {
        let token = raw.split_whitespace().next()?;
        let token = token.split('T').next()?;

        let date = match self {
            // Fixed-width digit run without separators
            DateFormat::Compact => {
                if token.len() != 8 || !token.chars().all(|c| c.is_ascii_digit()) {
                    return None;
                }
                let year = token[..4].parse().ok()?;
                let month = token[4..6].parse().ok()?;
                let day = token[6..].parse().ok()?;
                NaiveDate::from_ymd_opt(year, month, day)?
            }
            _ => NaiveDate::parse_from_str(token, self.pattern()).ok()?,
        };

        if self.has_four_digit_year() && !(1900..=2100).contains(&date.year()) {
            return None;
        }
        Some(date)
    }
}

/// First format that parses every sample value; else the one parsing most
pub fn detect_date_format<'a, I>(values: I) -> Option<DateFormat>
where
    I: IntoIterator<Item = &'a str>,
{
    let sample: Vec<&str> = values
        .into_iter()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect();
    if sample.is_empty() {
        return None;
    }

    let mut best: Option<(DateFormat, usize)> = None;
    for format in DateFormat::ALL {
        let hits = sample.iter().filter(|v| format.parse(v).is_some()).count();
        if hits == sample.len() {
            return Some(format);
        }
        if hits > 0 && best.map_or(true, |(_, n)| hits > n) {
            best = Some((format, hits));
        }
    }

    best.map(|(format, _)| format)
}

// ============================================================================
// RECORD NORMALIZER
// ============================================================================

/// Everything one file contributes to the batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedFile {
    pub transactions: Vec<Transaction>,

    /// Data rows seen (blank rows excluded)
    pub rows_seen: usize,

    pub amount_errors: usize,
    pub date_errors: usize,

    /// First few excluded rows, for the diagnostics report
    pub error_samples: Vec<RowError>,

    pub convention: DecimalConvention,
    pub date_format: Option<DateFormat>,
}

impl NormalizedFile {
    pub fn excluded(&self) -> usize {
        self.amount_errors + self.date_errors
    }
}

pub struct RecordNormalizer {
    config: NormalizeConfig,
}

impl RecordNormalizer {
    pub fn new(config: NormalizeConfig) -> Self {
        RecordNormalizer { config }
    }

    /// Normalize every data row of a sniffed table.
    ///
    /// `account_label` is the upload's account; a non-empty account cell wins.
    pub fn normalize(
        &self,
        table: &SniffedTable,
        columns: &ResolvedColumns,
        account_label: &str,
    ) -> NormalizedFile {
        let records: Vec<&RawRecord> = table
            .records
            .iter()
            .filter(|r| r.fields.iter().any(|f| !f.trim().is_empty()))
            .collect();

        let convention = detect_convention(column_sample(
            &records,
            columns.get(CanonicalField::Amount),
            self.config.amount_sample,
        ));
        let date_format = detect_date_format(column_sample(
            &records,
            columns.get(CanonicalField::Date),
            self.config.date_sample,
        ));

        debug!(file = %table.source_file, ?convention, ?date_format, "column conventions");

        let mut result = NormalizedFile {
            transactions: Vec::with_capacity(records.len()),
            rows_seen: records.len(),
            amount_errors: 0,
            date_errors: 0,
            error_samples: Vec::new(),
            convention,
            date_format,
        };

        for record in records {
            match self.normalize_record(record, columns, convention, date_format, account_label) {
                Ok(tx) => result.transactions.push(tx),
                Err(err) => {
                    if err.is_amount() {
                        result.amount_errors += 1;
                    } else {
                        result.date_errors += 1;
                    }
                    if result.error_samples.len() < MAX_ERROR_SAMPLES {
                        result.error_samples.push(err);
                    }
                }
            }
        }

        if result.excluded() > 0 {
            warn!(
                file = %table.source_file,
                excluded = result.excluded(),
                amount_errors = result.amount_errors,
                date_errors = result.date_errors,
                "rows excluded"
            );
        }
        info!(
            file = %table.source_file,
            transactions = result.transactions.len(),
            "file normalized"
        );

        result
    }

    fn normalize_record(
        &self,
        record: &RawRecord,
        columns: &ResolvedColumns,
        convention: DecimalConvention,
        date_format: Option<DateFormat>,
        account_label: &str,
    ) -> Result<Transaction, RowError> {
        let cell = |field: CanonicalField| columns.get(field).map(|i| record.field(i).trim());

        let date_text = cell(CanonicalField::Date).unwrap_or("");
        let date = date_format
            .and_then(|format| format.parse(date_text))
            .ok_or_else(|| RowError::DateParse {
                row: record.line,
                value: date_text.to_string(),
            })?;

        let amount_text = cell(CanonicalField::Amount).unwrap_or("");
        let amount = parse_amount(amount_text, convention).map_err(|reason| RowError::AmountParse {
            row: record.line,
            value: amount_text.to_string(),
            reason,
        })?;

        let currency = cell(CanonicalField::Currency)
            .and_then(currency_code)
            .or(amount.currency)
            .unwrap_or_else(|| self.config.fallback_currency.clone());

        let account = cell(CanonicalField::Account)
            .filter(|a| !a.is_empty())
            .unwrap_or(account_label)
            .to_string();

        let description = cell(CanonicalField::Description).unwrap_or("").to_string();
        let counterparty = cell(CanonicalField::Counterparty).map(str::to_string);

        Ok(Transaction::new(
            &record.source_file,
            record.row_index,
            date,
            description,
            amount.minor,
            currency,
            account,
        )
        .with_counterparty(counterparty))
    }
}

fn column_sample<'a>(records: &[&'a RawRecord], index: Option<usize>, limit: usize) -> Vec<&'a str> {
    match index {
        Some(i) => records.iter().copied().take(limit).map(|r| r.field(i)).collect(),
        None => Vec::new(),
    }
}

impl Default for RecordNormalizer {
    fn default() -> Self {
        Self::new(NormalizeConfig::default())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::ColumnMapper;
    use crate::sniffer::FormatSniffer;

    fn amount(raw: &str, convention: DecimalConvention) -> i64 {
        parse_amount(raw, convention).unwrap().minor.value()
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_convention_votes() {
        assert_eq!(convention_vote("1.234,56"), Some(DecimalConvention::DecimalComma));
        assert_eq!(convention_vote("1,234.56"), Some(DecimalConvention::DecimalPoint));
        assert_eq!(convention_vote("-12,5"), Some(DecimalConvention::DecimalComma));
        assert_eq!(convention_vote("1,234,567"), Some(DecimalConvention::DecimalPoint));
        assert_eq!(convention_vote("1.234"), None);
        assert_eq!(convention_vote("42"), None);
    }

    #[test]
    fn test_detect_convention_majority_and_tie() {
        assert_eq!(
            detect_convention(["-12,50", "1.234", "3,99", "100"]),
            DecimalConvention::DecimalComma
        );
        assert_eq!(detect_convention(["1.234", "5.000"]), DecimalConvention::DecimalPoint);
        assert_eq!(detect_convention(["1,5", "2.5"]), DecimalConvention::DecimalPoint);
    }

    #[test]
    fn test_both_conventions_reach_the_same_minor_units() {
        assert_eq!(amount("1.234,56", DecimalConvention::DecimalComma), 123456);
        assert_eq!(amount("1,234.56", DecimalConvention::DecimalPoint), 123456);
    }

    #[test]
    fn test_amount_signs_and_decorations() {
        let comma = DecimalConvention::DecimalComma;
        let point = DecimalConvention::DecimalPoint;

        assert_eq!(amount("-500,00", comma), -50000);
        assert_eq!(amount("+500,00", comma), 50000);
        assert_eq!(amount("500,00-", comma), -50000);
        assert_eq!(amount("(1,234.50)", point), -123450);
        assert_eq!(amount("−7.5", point), -750);
        assert_eq!(amount("1 234,56", comma), 123456);
        assert_eq!(amount("1\u{a0}234,56", comma), 123456);
        assert_eq!(amount("1'234.56", point), 123456);
        assert_eq!(amount("12,500", comma), 1250);
        assert_eq!(amount("0,5", comma), 50);
        assert_eq!(amount("1.234", comma), 123400);
        assert_eq!(amount("17", point), 1700);
    }

    #[test]
    fn test_amount_currency_extraction() {
        let parsed = parse_amount("-12,99 €", DecimalConvention::DecimalComma).unwrap();
        assert_eq!(parsed.minor, MinorUnits::new(-1299));
        assert_eq!(parsed.currency.as_deref(), Some("EUR"));

        let parsed = parse_amount("USD 1,000.00", DecimalConvention::DecimalPoint).unwrap();
        assert_eq!(parsed.minor, MinorUnits::new(100000));
        assert_eq!(parsed.currency.as_deref(), Some("USD"));

        let parsed = parse_amount("$-3.50", DecimalConvention::DecimalPoint).unwrap();
        assert_eq!(parsed.minor, MinorUnits::new(-350));
        assert_eq!(parsed.currency.as_deref(), Some("USD"));
    }

    #[test]
    fn test_amount_rejects_garbage() {
        let comma = DecimalConvention::DecimalComma;

        assert!(parse_amount("", comma).is_err());
        assert!(parse_amount("abc", comma).is_err());
        assert!(parse_amount("12,345", comma).is_err());
        assert!(parse_amount("1.23.4", comma).is_err());
        assert!(parse_amount("1,2,3", comma).is_err());
        assert!(parse_amount("12x5", comma).is_err());
        assert!(parse_amount("99999999999999999999", comma).is_err());
    }

    #[test]
    fn test_date_formats() {
        assert_eq!(DateFormat::DayMonthYearDot.parse("05.01.2025"), Some(ymd(2025, 1, 5)));
        assert_eq!(DateFormat::Iso.parse("2025-01-05"), Some(ymd(2025, 1, 5)));
        assert_eq!(DateFormat::Iso.parse("2025-01-05T10:30:00"), Some(ymd(2025, 1, 5)));
        assert_eq!(DateFormat::DayMonthYearSlash.parse("05/01/2025 10:30"), Some(ymd(2025, 1, 5)));
        assert_eq!(DateFormat::MonthDayYearSlash.parse("01/05/2025"), Some(ymd(2025, 1, 5)));
        assert_eq!(DateFormat::DayMonthShortYearDot.parse("05.01.25"), Some(ymd(2025, 1, 5)));
        assert_eq!(DateFormat::Compact.parse("20250105"), Some(ymd(2025, 1, 5)));
        assert_eq!(DateFormat::DayMonthYearDash.parse("05-01-2025"), Some(ymd(2025, 1, 5)));
        assert_eq!(DateFormat::YearMonthDaySlash.parse("2025/01/05"), Some(ymd(2025, 1, 5)));

        // Two-digit years never slip through a four-digit format
        assert_eq!(DateFormat::DayMonthYearDot.parse("05.01.25"), None);
        assert_eq!(DateFormat::Compact.parse("2025015"), None);
        assert_eq!(DateFormat::DayMonthYearDot.parse("31.02.2025"), None);
    }

    #[test]
    fn test_detect_date_format() {
        assert_eq!(
            detect_date_format(["05.01.2025", "31.12.2024"]),
            Some(DateFormat::DayMonthYearDot)
        );
        assert_eq!(
            detect_date_format(["05.01.25", "31.12.24"]),
            Some(DateFormat::DayMonthShortYearDot)
        );
        // 13/01 rules out month-first, so day-first wins outright
        assert_eq!(
            detect_date_format(["13/01/2025", "05/01/2025"]),
            Some(DateFormat::DayMonthYearSlash)
        );
        // Only month-first parses 01/13
        assert_eq!(
            detect_date_format(["01/13/2025", "01/05/2025"]),
            Some(DateFormat::MonthDayYearSlash)
        );
        // No format parses all: the one with most hits
        assert_eq!(
            detect_date_format(["2025-01-05", "2025-01-06", "garbage"]),
            Some(DateFormat::Iso)
        );
        assert_eq!(detect_date_format(["", "  "]), None);
        assert_eq!(detect_date_format(["garbage"]), None);
    }

    #[test]
    fn test_currency_code() {
        assert_eq!(currency_code("€").as_deref(), Some("EUR"));
        assert_eq!(currency_code(" usd ").as_deref(), Some("USD"));
        assert_eq!(currency_code("£").as_deref(), Some("GBP"));
        assert_eq!(currency_code("Euro"), None);
        assert_eq!(currency_code(""), None);
    }

    fn normalize(csv: &str, account: &str) -> NormalizedFile {
        let table = FormatSniffer::default().sniff("giro.csv", csv.as_bytes()).unwrap();
        let mapping = ColumnMapper::new().auto_map(&table.headers).unwrap();
        let columns = mapping.resolve(&table.headers).unwrap();
        RecordNormalizer::default().normalize(&table, &columns, account)
    }

    #[test]
    fn test_normalize_german_export() {
        let csv = "Buchungstag;Verwendungszweck;Betrag;Währung\n\
                   05.01.2025;Transfer to B;-500,00;EUR\n\
                   06.01.2025;REWE Markt;-1.234,56;\n\
                   07.01.2025;Gehalt;2.500,00;eur\n";
        let result = normalize(csv, "giro");

        assert_eq!(result.convention, DecimalConvention::DecimalComma);
        assert_eq!(result.date_format, Some(DateFormat::DayMonthYearDot));
        assert_eq!(result.transactions.len(), 3);
        assert_eq!(result.excluded(), 0);

        let tx = &result.transactions[1];
        assert_eq!(tx.date(), ymd(2025, 1, 6));
        assert_eq!(tx.amount(), MinorUnits::new(-123456));
        assert_eq!(tx.currency(), "EUR");
        assert_eq!(tx.account(), "giro");
        assert_eq!(tx.row_index(), 1);
        assert_eq!(result.transactions[2].currency(), "EUR");
    }

    #[test]
    fn test_normalize_reports_bad_rows() {
        let csv = "Date,Description,Amount\n\
                   2025-01-05,Coffee,-3.50\n\
                   2025-13-40,Broken date,-1.00\n\
                   2025-01-07,Broken amount,abc\n\
                   2025-01-08,Lunch,-12.00\n";
        let result = normalize(csv, "card");

        assert_eq!(result.transactions.len(), 2);
        assert_eq!(result.date_errors, 1);
        assert_eq!(result.amount_errors, 1);
        assert_eq!(result.error_samples.len(), 2);
        assert!(result.error_samples[0].is_date());
        assert_eq!(result.error_samples[0].row(), 3);
        assert!(result.error_samples[1].is_amount());
    }

    #[test]
    fn test_error_samples_are_capped() {
        let mut csv = String::from("Date,Description,Amount\n");
        for i in 0..8 {
            csv.push_str(&format!("2025-01-0{},Row {},oops\n", i + 1, i));
        }
        csv.push_str("2025-01-09,Good,1.00\n");
        let result = normalize(&csv, "card");

        assert_eq!(result.amount_errors, 8);
        assert_eq!(result.error_samples.len(), MAX_ERROR_SAMPLES);
        assert_eq!(result.transactions.len(), 1);
    }

    #[test]
    fn test_account_and_currency_resolution() {
        let csv = "Date,Description,Amount,Account,Currency\n\
                   2025-01-05,A,$10.00,savings,\n\
                   2025-01-06,B,10.00,,GBP\n\
                   2025-01-07,C,10.00,,\n";
        let result = normalize(csv, "upload-label");

        let accounts: Vec<&str> = result.transactions.iter().map(|t| t.account()).collect();
        let currencies: Vec<&str> = result.transactions.iter().map(|t| t.currency()).collect();
        assert_eq!(accounts, vec!["savings", "upload-label", "upload-label"]);
        assert_eq!(currencies, vec!["USD", "GBP", "EUR"]);
    }

    #[test]
    fn test_counterparty_column() {
        let csv = "Buchungstag;Auftraggeber/Empfänger;Verwendungszweck;Betrag\n\
                   05.01.2025;Max Mustermann;Umbuchung;-500,00\n\
                   06.01.2025;;Kartenzahlung;-12,00\n";
        let result = normalize(csv, "giro");

        assert_eq!(result.transactions[0].counterparty(), Some("Max Mustermann"));
        assert_eq!(result.transactions[0].description(), "Umbuchung");
        assert_eq!(result.transactions[1].counterparty(), None);
    }
}
