// Transaction Unification Engine - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod config;       // Explicit engine settings (JSON + overrides)
pub mod error;        // Typed error kinds, scoped per file / row / field
pub mod transaction;  // Canonical Transaction + MinorUnits
pub mod sniffer;      // Encoding, delimiter, header detection
pub mod mapping;      // Header → canonical field mapping
pub mod profiles;     // Bank profiles (remembered mappings)
pub mod normalizer;   // Dates, amounts, currency → canonical values
pub mod ledger;       // Unified, ordered transaction set + export
pub mod matcher;      // Internal transfer detection
pub mod pipeline;     // Batch orchestration + diagnostics

// Re-export commonly used types
pub use config::{EngineConfig, MatchConfig, NormalizeConfig, SniffConfig};
pub use error::{
    AmbiguousField, FormatDetectionError, LateBindingError, ManualMappingError,
    MappingIncomplete, RowError,
};
pub use transaction::{MinorUnits, Transaction, TransactionId, TransferGroupId};
pub use sniffer::{FormatSniffer, RawRecord, SniffedTable};
pub use mapping::{
    CanonicalField, ColumnMapper, ColumnMapping, FieldMapping, ManualMapping, MappingOrigin,
    ResolvedColumns,
};
pub use profiles::{BankProfile, MemoryProfileStore, ProfileStore, ProfileWrite, SqliteProfileStore};
pub use normalizer::{DateFormat, DecimalConvention, NormalizedFile, RecordNormalizer};
pub use ledger::{CurrencyTotals, LedgerSummary, LedgerView, UnifiedLedger};
pub use matcher::{MatchReport, TransferCandidate, TransferMatcher, TransferPair};
pub use pipeline::{
    Batch, BatchProcessor, BatchReport, FileDiagnostics, FileStatus, MappingSource, SourceFile,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
