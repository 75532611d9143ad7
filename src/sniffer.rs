// 🔎 Format Sniffer - encoding, delimiter and header detection
//
// Turns the raw bytes of one uploaded file into a table:
//   bytes → text (encoding) → records (delimiter) → headers + data rows
//
// Any failure here makes the whole file unusable; the caller skips it and
// keeps going with the rest of the batch.

use encoding_rs::{Encoding, ISO_8859_15, UTF_8, WINDOWS_1252};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::config::SniffConfig;
use crate::error::FormatDetectionError;

/// Delimiters tried, in priority order (earlier wins ties)
pub const CANDIDATE_DELIMITERS: [u8; 4] = [b';', b',', b'\t', b'|'];

/// UTF-8 read as Latin-1 (double encoding), as produced by spreadsheet round-trips
const MOJIBAKE_FIXES: [(&str, &str); 9] = [
    ("Ã¼", "ü"),
    ("Ã¶", "ö"),
    ("Ã¤", "ä"),
    ("ÃŸ", "ß"),
    ("Ãœ", "Ü"),
    ("Ã–", "Ö"),
    ("Ã„", "Ä"),
    ("Â°", "°"),
    ("Â€", "€"),
];

// ============================================================================
// CORE TYPES
// ============================================================================

/// One data row of a source file. Transient: dropped after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Originating file
    pub source_file: String,

    /// 0-based index among the file's data rows (header and preamble excluded)
    pub row_index: usize,

    /// 1-based line in the decoded text where the record starts
    pub line: usize,

    /// Cell values, padded or truncated to the header width
    pub fields: Vec<String>,

    /// Original record text for diagnostics
    pub raw: String,
}

impl RawRecord {
    pub fn field(&self, index: usize) -> &str {
        self.fields.get(index).map(|s| s.as_str()).unwrap_or("")
    }
}

/// Result of sniffing one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SniffedTable {
    pub source_file: String,

    /// Name of the encoding the bytes were decoded with
    pub encoding: String,

    pub delimiter: u8,

    /// 0-based record index of the header row (records above it are preamble)
    pub header_row: usize,

    pub headers: Vec<String>,
    pub records: Vec<RawRecord>,
}

impl SniffedTable {
    pub fn delimiter_name(&self) -> &'static str {
        delimiter_name(self.delimiter)
    }
}

pub fn delimiter_name(delimiter: u8) -> &'static str {
    match delimiter {
        b';' => "semicolon",
        b',' => "comma",
        b'\t' => "tab",
        b'|' => "pipe",
        _ => "other",
    }
}

/// Decoded file content
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedText {
    pub text: String,
    pub encoding: &'static str,
}

// ============================================================================
// FORMAT SNIFFER
// ============================================================================

pub struct FormatSniffer {
    config: SniffConfig,
}

impl FormatSniffer {
    pub fn new(config: SniffConfig) -> Self {
        FormatSniffer { config }
    }

    /// Decode, split and locate the header of one file
    pub fn sniff(&self, source_file: &str, bytes: &[u8]) -> Result<SniffedTable, FormatDetectionError> {
        let decoded = self.decode(bytes)?;
        let delimiter = self.detect_delimiter(&decoded.text)?;

        let records = read_records(&decoded.text, delimiter, usize::MAX);
        let (header_row, width) = self
            .detect_header(&records)
            .ok_or(FormatDetectionError::NoHeader)?;

        let header_fields = &records[header_row].0;
        let headers: Vec<String> = (0..width)
            .map(|i| {
                let raw = header_fields.get(i).map(String::as_str).unwrap_or("");
                let name = raw.trim().trim_start_matches('\u{feff}').trim();
                if name.is_empty() {
                    format!("Column {}", i + 1)
                } else {
                    name.to_string()
                }
            })
            .collect();

        let mut rows = Vec::new();
        for (fields, line) in records.iter().skip(header_row + 1) {
            if fields.iter().all(|f| f.trim().is_empty()) {
                continue;
            }

            let mut cells: Vec<String> = fields.iter().take(width).cloned().collect();
            cells.resize(width, String::new());

            rows.push(RawRecord {
                source_file: source_file.to_string(),
                row_index: rows.len(),
                line: *line,
                raw: fields.join(&char::from(delimiter).to_string()),
                fields: cells,
            });
        }

        debug!(
            file = source_file,
            encoding = decoded.encoding,
            delimiter = delimiter_name(delimiter),
            header_row,
            rows = rows.len(),
            "sniffed table"
        );

        Ok(SniffedTable {
            source_file: source_file.to_string(),
            encoding: decoded.encoding.to_string(),
            delimiter,
            header_row,
            headers,
            records: rows,
        })
    }

    /// Decode bytes with the first candidate encoding that stays under the
    /// invalid-character threshold. A byte-order mark wins outright.
    pub fn decode(&self, bytes: &[u8]) -> Result<DecodedText, FormatDetectionError> {
        if bytes.is_empty() {
            return Err(FormatDetectionError::Empty);
        }

        if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
            let (text, _) = encoding.decode_without_bom_handling(&bytes[bom_len..]);
            return Ok(DecodedText {
                text: repair_mojibake(&text),
                encoding: encoding.name(),
            });
        }

        let mut best: Option<(&'static str, usize)> = None;

        for encoding in [UTF_8, WINDOWS_1252, ISO_8859_15] {
            let (text, _) = encoding.decode_without_bom_handling(bytes);
            let total = text.chars().count();
            let invalid = count_invalid_chars(&text);
            let allowed = (total as f64 * self.config.max_invalid_ratio).floor() as usize;

            if invalid <= allowed {
                return Ok(DecodedText {
                    text: repair_mojibake(&text),
                    encoding: encoding.name(),
                });
            }

            debug!(encoding = encoding.name(), invalid, allowed, "encoding rejected");
            if best.map_or(true, |(_, n)| invalid < n) {
                best = Some((encoding.name(), invalid));
            }
        }

        let (best_encoding, invalid_chars) = best.unwrap_or(("none", 0));
        Err(FormatDetectionError::Encoding {
            best_encoding: best_encoding.to_string(),
            invalid_chars,
        })
    }

    /// Pick the delimiter whose per-record field count is most consistent
    /// (mode of the counts) across the leading sample.
    ///
    /// A candidate is viable when its mode is at least 2 columns and enough of
    /// the sample agrees with it. Best = most agreeing records, then more
    /// columns, then candidate order.
    pub fn detect_delimiter(&self, text: &str) -> Result<u8, FormatDetectionError> {
        let mut best: Option<(u8, usize, usize)> = None;
        let mut sampled = 0;

        for delimiter in CANDIDATE_DELIMITERS {
            let counts: Vec<usize> = read_records(text, delimiter, self.config.sample_lines)
                .into_iter()
                .map(|(fields, _)| fields.len())
                .collect();

            sampled = sampled.max(counts.len());
            if counts.is_empty() {
                continue;
            }

            let (mode, agree) = mode_of(&counts);
            let required = ((counts.len() as f64 * self.config.min_consistency).ceil() as usize)
                .max(counts.len().min(2));

            debug!(
                delimiter = delimiter_name(delimiter),
                mode,
                agree,
                required,
                "delimiter candidate"
            );

            if mode < 2 || agree < required {
                continue;
            }

            let better = match best {
                None => true,
                Some((_, best_agree, best_mode)) => {
                    agree > best_agree || (agree == best_agree && mode > best_mode)
                }
            };
            if better {
                best = Some((delimiter, agree, mode));
            }
        }

        best.map(|(delimiter, _, _)| delimiter)
            .ok_or(FormatDetectionError::InconsistentColumns { sampled })
    }

    /// First sampled record of at least two fields whose non-empty tokens are
    /// mostly non-numeric, and whose width fits the modal width. Returns
    /// (record index, table width).
    ///
    /// The header may be one field narrower than the data when every data row
    /// ends with a delimiter, or one wider when the header itself does.
    fn detect_header(&self, records: &[(Vec<String>, usize)]) -> Option<(usize, usize)> {
        let sample = &records[..records.len().min(self.config.sample_lines)];
        let counts: Vec<usize> = sample.iter().map(|(fields, _)| fields.len()).collect();
        if counts.is_empty() {
            return None;
        }
        let (width, _) = mode_of(&counts);

        let ends_empty = |fields: &[String]| fields.last().is_some_and(|f| f.trim().is_empty());
        let trailing_delimiter = sample
            .iter()
            .filter(|(fields, _)| fields.len() == width)
            .all(|(fields, _)| ends_empty(fields));

        let index = sample.iter().position(|(fields, _)| {
            let fits = fields.len() == width
                || (trailing_delimiter && fields.len() + 1 == width)
                || (fields.len() == width + 1 && ends_empty(fields));
            fields.len() >= 2 && fits && is_header_like(fields)
        })?;

        Some((index, width.max(sample[index].0.len())))
    }
}

impl Default for FormatSniffer {
    fn default() -> Self {
        Self::new(SniffConfig::default())
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Up to `limit` records of the text as (fields, 1-based line).
/// Quote-aware; rows may differ in width.
fn read_records(text: &str, delimiter: u8, limit: usize) -> Vec<(Vec<String>, usize)> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut records = Vec::new();
    for result in reader.records().take(limit) {
        match result {
            Ok(record) => {
                let line = record.position().map(|p| p.line() as usize).unwrap_or(0);
                records.push((record.iter().map(|f| f.to_string()).collect(), line));
            }
            Err(e) => debug!(error = %e, "unreadable record skipped"),
        }
    }
    records
}

/// Most frequent value and its frequency; ties go to the larger value
fn mode_of(counts: &[usize]) -> (usize, usize) {
    let mut freq: HashMap<usize, usize> = HashMap::new();
    for &c in counts {
        *freq.entry(c).or_insert(0) += 1;
    }
    freq.into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
        .unwrap_or((0, 0))
}

fn is_numeric_token(token: &str) -> bool {
    let t = token.trim();
    t.chars().any(|c| c.is_ascii_digit())
        && t.chars().all(|c| {
            c.is_ascii_digit() || c.is_whitespace() || "+-.,/:'()%€$£¥".contains(c)
        })
}

fn is_header_like(fields: &[String]) -> bool {
    let tokens: Vec<&str> = fields
        .iter()
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .collect();
    if tokens.is_empty() {
        return false;
    }
    let non_numeric = tokens.iter().filter(|t| !is_numeric_token(t)).count();
    non_numeric * 2 > tokens.len()
}

fn count_invalid_chars(text: &str) -> usize {
    text.chars()
        .filter(|&c| c == '\u{fffd}' || (c.is_control() && !matches!(c, '\t' | '\r' | '\n')))
        .count()
}

fn repair_mojibake(text: &str) -> String {
    if !text.contains('Ã') && !text.contains('Â') {
        return text.to_string();
    }
    let mut repaired = text.to_string();
    for (broken, fixed) in MOJIBAKE_FIXES {
        repaired = repaired.replace(broken, fixed);
    }
    repaired
}

// ============================================================================
// TESTS
// ============================================================================
