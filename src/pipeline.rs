// 🚚 Batch Pipeline - uploads in, one reconciled ledger out
//
// Per file (in parallel, one scoped thread each):
//   sniff → map (manual > stored profile > auto) → normalize
// Then, in upload order: append to the ledger.
// Then, after every file thread has joined: transfer matching.
//
// No file can fail the batch. Each file ends with exactly one status.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{FormatDetectionError, ManualMappingError, MappingIncomplete, RowError};
use crate::ledger::UnifiedLedger;
use crate::mapping::{header_fingerprint, ColumnMapper, ColumnMapping, ManualMapping, ResolvedColumns};
use crate::matcher::{MatchReport, TransferMatcher};
use crate::normalizer::{DateFormat, DecimalConvention, RecordNormalizer};
use crate::profiles::{MemoryProfileStore, ProfileStore, SqliteProfileStore};
use crate::sniffer::{FormatSniffer, SniffedTable};
use crate::transaction::Transaction;

// ============================================================================
// INPUT
// ============================================================================

/// One uploaded file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub name: String,

    /// Account label supplied with the upload
    pub account: Option<String>,

    pub bytes: Vec<u8>,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        SourceFile {
            name: name.into(),
            account: None,
            bytes,
        }
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        let account = account.into();
        self.account = if account.trim().is_empty() {
            None
        } else {
            Some(account.trim().to_string())
        };
        self
    }

    /// Upload label, or the file name without extension
    pub fn account_label(&self) -> String {
        if let Some(account) = &self.account {
            return account.clone();
        }
        Path::new(&self.name)
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| self.name.clone())
    }
}

/// Files of one upload session plus the manual mappings supplied for them
#[derive(Debug, Clone, Default)]
pub struct Batch {
    files: Vec<SourceFile>,
    overrides: HashMap<String, ManualMapping>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file; a file with the same name replaces the earlier upload.
    /// Returns true when an earlier upload was replaced.
    pub fn add_file(&mut self, file: SourceFile) -> bool {
        match self.files.iter_mut().find(|f| f.name == file.name) {
            Some(existing) => {
                warn!(file = %file.name, "upload replaces an earlier file of the same name");
                *existing = file;
                true
            }
            None => {
                self.files.push(file);
                false
            }
        }
    }

    pub fn set_mapping(&mut self, file_name: impl Into<String>, mapping: ManualMapping) {
        self.overrides.insert(file_name.into(), mapping);
    }

    pub fn files(&self) -> &[SourceFile] {
        &self.files
    }

    pub fn overrides(&self) -> &HashMap<String, ManualMapping> {
        &self.overrides
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn clear(&mut self) {
        self.files.clear();
        self.overrides.clear();
    }
}

// ============================================================================
// DIAGNOSTICS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingSource {
    Manual,
    Profile,
    Auto,
}

/// How one file ended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileStatus {
    Ingested,
    /// Unreadable as a table; skipped
    Skipped { error: FormatDetectionError },
    /// Waiting for a manual mapping
    PendingMapping { incomplete: MappingIncomplete },
    /// The manual mapping supplied does not fit the file
    MappingRejected { error: ManualMappingError },
    /// The worker for this file died
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileDiagnostics {
    pub file: String,
    pub account: String,
    pub status: FileStatus,

    // Sniffing
    pub encoding: Option<String>,
    pub delimiter: Option<String>,
    pub header_row: Option<usize>,
    pub headers: Vec<String>,

    // Mapping
    pub mapping: Option<ColumnMapping>,
    pub mapping_source: Option<MappingSource>,

    // Normalization
    pub convention: Option<DecimalConvention>,
    pub date_format: Option<DateFormat>,
    pub rows_seen: usize,
    pub transactions: usize,
    pub amount_errors: usize,
    pub date_errors: usize,
    pub error_samples: Vec<RowError>,
}

impl FileDiagnostics {
    fn new(file: &SourceFile, status: FileStatus) -> Self {
        FileDiagnostics {
            file: file.name.clone(),
            account: file.account_label(),
            status,
            encoding: None,
            delimiter: None,
            header_row: None,
            headers: Vec::new(),
            mapping: None,
            mapping_source: None,
            convention: None,
            date_format: None,
            rows_seen: 0,
            transactions: 0,
            amount_errors: 0,
            date_errors: 0,
            error_samples: Vec::new(),
        }
    }

    fn with_table(mut self, table: &SniffedTable) -> Self {
        self.encoding = Some(table.encoding.clone());
        self.delimiter = Some(table.delimiter_name().to_string());
        self.header_row = Some(table.header_row);
        self.headers = table.headers.clone();
        self
    }

    pub fn is_ingested(&self) -> bool {
        self.status == FileStatus::Ingested
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self.status,
            FileStatus::PendingMapping { .. } | FileStatus::MappingRejected { .. }
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub files: Vec<FileDiagnostics>,
    pub transactions: usize,
    pub matching: MatchReport,
}

impl BatchReport {
    pub fn ingested(&self) -> usize {
        self.files.iter().filter(|f| f.is_ingested()).count()
    }

    pub fn pending(&self) -> usize {
        self.files.iter().filter(|f| f.is_pending()).count()
    }

    pub fn skipped(&self) -> usize {
        self.files.len() - self.ingested() - self.pending()
    }

    pub fn file(&self, name: &str) -> Option<&FileDiagnostics> {
        self.files.iter().find(|f| f.file == name)
    }
}

/// Result of one file worker
struct FileOutcome {
    diagnostics: FileDiagnostics,
    transactions: Vec<Transaction>,
}

impl FileOutcome {
    fn without_rows(diagnostics: FileDiagnostics) -> Self {
        FileOutcome {
            diagnostics,
            transactions: Vec::new(),
        }
    }
}

// ============================================================================
// BATCH PROCESSOR
// ============================================================================

pub struct BatchProcessor {
    config: EngineConfig,
    profiles: Arc<dyn ProfileStore>,
}

impl BatchProcessor {
    pub fn new(config: EngineConfig, profiles: Arc<dyn ProfileStore>) -> Self {
        BatchProcessor { config, profiles }
    }

    /// Profiles from `config.profile_db` when set, else in memory
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let profiles: Arc<dyn ProfileStore> = match &config.profile_db {
            Some(path) => Arc::new(SqliteProfileStore::open(path)?),
            None => Arc::new(MemoryProfileStore::new()),
        };
        Ok(Self::new(config, profiles))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn profiles(&self) -> &Arc<dyn ProfileStore> {
        &self.profiles
    }

    /// Run a whole batch into a fresh ledger
    pub fn process(&self, batch: &Batch) -> (UnifiedLedger, BatchReport) {
        info!(files = batch.files().len(), "processing batch");

        let outcomes: Vec<FileOutcome> = thread::scope(|scope| {
            let handles: Vec<_> = batch
                .files()
                .iter()
                .map(|file| {
                    let manual = batch.overrides().get(&file.name);
                    scope.spawn(move || self.process_file(file, manual))
                })
                .collect();

            handles
                .into_iter()
                .zip(batch.files())
                .map(|(handle, file)| {
                    handle.join().unwrap_or_else(|_| {
                        warn!(file = %file.name, "file worker panicked");
                        FileOutcome::without_rows(FileDiagnostics::new(
                            file,
                            FileStatus::Failed {
                                reason: "worker panicked".to_string(),
                            },
                        ))
                    })
                })
                .collect()
        });

        // Every worker has joined: merge in upload order
        let ledger = UnifiedLedger::new();
        let mut report = BatchReport::default();
        for outcome in outcomes {
            let mut diagnostics = outcome.diagnostics;
            diagnostics.transactions = ledger.append(outcome.transactions);
            report.files.push(diagnostics);
        }
        report.transactions = ledger.len();

        report.matching = TransferMatcher::new(self.config.matching.clone()).run(&ledger);

        info!(
            ingested = report.ingested(),
            pending = report.pending(),
            skipped = report.skipped(),
            transactions = report.transactions,
            transfers = report.matching.pairs.len(),
            "batch done"
        );
        (ledger, report)
    }

    fn process_file(&self, file: &SourceFile, manual: Option<&ManualMapping>) -> FileOutcome {
        let table = match FormatSniffer::new(self.config.sniffing.clone()).sniff(&file.name, &file.bytes) {
            Ok(table) => table,
            Err(error) => {
                warn!(file = %file.name, %error, "file skipped");
                return FileOutcome::without_rows(FileDiagnostics::new(
                    file,
                    FileStatus::Skipped { error },
                ));
            }
        };
        debug!(
            file = %file.name,
            encoding = %table.encoding,
            delimiter = table.delimiter_name(),
            header_row = table.header_row,
            "file sniffed"
        );

        let (mapping, source, columns) = match self.choose_mapping(&table, manual) {
            Ok(chosen) => chosen,
            Err(status) => {
                return FileOutcome::without_rows(FileDiagnostics::new(file, status).with_table(&table));
            }
        };

        let normalized = RecordNormalizer::new(self.config.normalization.clone()).normalize(
            &table,
            &columns,
            &file.account_label(),
        );

        let mut diagnostics = FileDiagnostics::new(file, FileStatus::Ingested).with_table(&table);
        diagnostics.mapping = Some(mapping);
        diagnostics.mapping_source = Some(source);
        diagnostics.convention = Some(normalized.convention);
        diagnostics.date_format = normalized.date_format;
        diagnostics.rows_seen = normalized.rows_seen;
        diagnostics.transactions = normalized.transactions.len();
        diagnostics.amount_errors = normalized.amount_errors;
        diagnostics.date_errors = normalized.date_errors;
        diagnostics.error_samples = normalized.error_samples;

        FileOutcome {
            diagnostics,
            transactions: normalized.transactions,
        }
    }

    /// Manual override > stored bank profile > auto-detection
    fn choose_mapping(
        &self,
        table: &SniffedTable,
        manual: Option<&ManualMapping>,
    ) -> Result<(ColumnMapping, MappingSource, ResolvedColumns), FileStatus> {
        let mapper = ColumnMapper::new();

        if let Some(manual) = manual {
            let mapping = mapper
                .manual_map(&table.headers, manual)
                .map_err(|error| FileStatus::MappingRejected { error })?;
            let columns = mapping
                .resolve(&table.headers)
                .map_err(|error| FileStatus::MappingRejected { error })?;
            self.remember(table, &mapping);
            return Ok((mapping, MappingSource::Manual, columns));
        }

        let fingerprint = header_fingerprint(&table.headers);
        match self.profiles.lookup(&fingerprint) {
            Ok(Some(profile)) => match profile.mapping.resolve(&table.headers) {
                Ok(columns) => {
                    debug!(file = %table.source_file, %fingerprint, "bank profile reused");
                    return Ok((profile.mapping, MappingSource::Profile, columns));
                }
                Err(error) => {
                    warn!(file = %table.source_file, %error, "stored profile does not fit, re-detecting");
                }
            },
            Ok(None) => {}
            Err(error) => warn!(file = %table.source_file, %error, "profile lookup failed"),
        }

        let mapping = mapper.auto_map(&table.headers).map_err(|incomplete| {
            warn!(
                file = %table.source_file,
                missing = ?incomplete.missing,
                ambiguous = incomplete.ambiguous.len(),
                "mapping incomplete"
            );
            FileStatus::PendingMapping { incomplete }
        })?;
        let columns = mapping
            .resolve(&table.headers)
            .map_err(|error| FileStatus::MappingRejected { error })?;
        self.remember(table, &mapping);
        Ok((mapping, MappingSource::Auto, columns))
    }

    fn remember(&self, table: &SniffedTable, mapping: &ColumnMapping) {
        match self.profiles.remember(&table.headers, mapping) {
            Ok(write) => debug!(file = %table.source_file, ?write, "bank profile stored"),
            Err(error) => warn!(file = %table.source_file, %error, "bank profile not stored"),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::CanonicalField;

    fn processor() -> BatchProcessor {
        BatchProcessor::new(EngineConfig::default(), Arc::new(MemoryProfileStore::new()))
    }

    #[test]
    fn test_account_label() {
        let file = SourceFile::new("exports/giro_2025.csv", vec![]);
        assert_eq!(file.account_label(), "giro_2025");
        assert_eq!(file.clone().with_account("Giro").account_label(), "Giro");
        assert_eq!(file.with_account("  ").account_label(), "giro_2025");
    }

    #[test]
    fn test_batch_replaces_same_name() {
        let mut batch = Batch::new();
        assert!(!batch.add_file(SourceFile::new("a.csv", b"old".to_vec())));
        assert!(!batch.add_file(SourceFile::new("b.csv", b"b".to_vec())));
        assert!(batch.add_file(SourceFile::new("a.csv", b"new".to_vec())));

        assert_eq!(batch.files().len(), 2);
        assert_eq!(batch.files()[0].bytes, b"new");
    }

    #[test]
    fn test_process_mixed_batch() {
        let mut batch = Batch::new();
        batch.add_file(SourceFile::new(
            "giro.csv",
            "Buchungstag;Verwendungszweck;Betrag\n05.01.2025;Transfer to B;-500,00\n".as_bytes().to_vec(),
        ));
        batch.add_file(SourceFile::new("broken.csv", vec![0u8, 159, 146, 150, 0, 0, 1, 2]));
        batch.add_file(SourceFile::new(
            "odd.csv",
            "Foo,Bar,Baz\n1,2,3\n".as_bytes().to_vec(),
        ));

        let (ledger, report) = processor().process(&batch);

        assert_eq!(ledger.len(), 1);
        assert_eq!(report.ingested(), 1);
        assert_eq!(report.pending(), 1);
        assert_eq!(report.skipped(), 1);
        assert!(matches!(
            report.file("broken.csv").unwrap().status,
            FileStatus::Skipped { .. }
        ));
        assert!(matches!(
            report.file("odd.csv").unwrap().status,
            FileStatus::PendingMapping { .. }
        ));

        let giro = report.file("giro.csv").unwrap();
        assert_eq!(giro.delimiter.as_deref(), Some("semicolon"));
        assert_eq!(giro.mapping_source, Some(MappingSource::Auto));
        assert_eq!(giro.transactions, 1);
    }

    #[test]
    fn test_manual_mapping_resolves_pending_file() {
        let mut batch = Batch::new();
        batch.add_file(SourceFile::new(
            "odd.csv",
            "Foo,Bar,Baz\n2025-01-05,Coffee,-3.50\n".as_bytes().to_vec(),
        ));

        let processor = processor();
        let (_, report) = processor.process(&batch);
        assert_eq!(report.pending(), 1);

        batch.set_mapping(
            "odd.csv",
            ManualMapping::new()
                .with(CanonicalField::Date, "Foo")
                .with(CanonicalField::Description, "Bar")
                .with(CanonicalField::Amount, "Baz"),
        );
        let (ledger, report) = processor.process(&batch);
        assert_eq!(report.ingested(), 1);
        assert_eq!(ledger.snapshot()[0].description(), "Coffee");

        // The profile now carries the format without the override
        let mut fresh = Batch::new();
        fresh.add_file(SourceFile::new(
            "odd_february.csv",
            "Foo,Bar,Baz\n2025-02-05,Tea,-2.50\n".as_bytes().to_vec(),
        ));
        let (_, report) = processor.process(&fresh);
        assert_eq!(
            report.file("odd_february.csv").unwrap().mapping_source,
            Some(MappingSource::Profile)
        );
    }

    #[test]
    fn test_bad_manual_mapping_is_reported() {
        let mut batch = Batch::new();
        batch.add_file(SourceFile::new("odd.csv", "Foo,Bar,Baz\n1,2,3\n".as_bytes().to_vec()));
        batch.set_mapping(
            "odd.csv",
            ManualMapping::new().with(CanonicalField::Date, "Nope"),
        );

        let (_, report) = processor().process(&batch);
        assert!(matches!(
            report.file("odd.csv").unwrap().status,
            FileStatus::MappingRejected { .. }
        ));
    }
}
