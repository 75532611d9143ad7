// Transaction Unification Engine - CLI
//
// txn-unify giro.csv tagesgeld.csv --user-name "Max Mustermann" --export ledger.csv

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use txn_unify::normalizer::{parse_amount, DecimalConvention};
use txn_unify::{
    Batch, BatchProcessor, BatchReport, CanonicalField, EngineConfig, FileStatus, LedgerSummary,
    ManualMapping, SourceFile,
};

#[derive(Debug, Parser)]
#[command(name = "txn-unify", version, about = "Normalize bank exports into one ledger and detect internal transfers")]
struct Args {
    /// Transaction exports to ingest (any delimiter, any encoding)
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Engine config file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Your name, as it appears in transfer descriptions
    #[arg(long, env = "TXN_UNIFY_USER_NAME")]
    user_name: Option<String>,

    /// Maximum amount difference for a transfer pair (e.g. 0.01)
    #[arg(long)]
    tolerance: Option<String>,

    /// Maximum days between the two sides of a transfer
    #[arg(long)]
    window: Option<i64>,

    /// Currency for files without a currency column
    #[arg(long)]
    fallback_currency: Option<String>,

    /// SQLite file for remembered bank profiles
    #[arg(long, env = "TXN_UNIFY_PROFILES")]
    profiles: Option<PathBuf>,

    /// Account label for a file
    #[arg(long = "account", value_name = "FILE=LABEL")]
    accounts: Vec<String>,

    /// Manual column mapping for a file
    #[arg(long = "map", value_name = "FILE:FIELD=COLUMN")]
    maps: Vec<String>,

    /// Write the unified ledger as CSV
    #[arg(long, value_name = "PATH")]
    export: Option<PathBuf>,

    /// Print the batch report as JSON instead of a summary
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;
    let batch = build_batch(&args)?;

    let processor = BatchProcessor::from_config(config)?;
    let (ledger, report) = processor.process(&batch);

    if args.json {
        let output = serde_json::json!({
            "report": report,
            "summary": ledger.summary(),
            "transactions": ledger.snapshot(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_report(&report, &ledger.summary());
    }

    if let Some(path) = &args.export {
        ledger.export_csv(path)?;
        if !args.json {
            println!("\n💾 Exported {} transactions to {:?}", ledger.len(), path);
        }
    }

    Ok(())
}

// ============================================================================
// ARGUMENTS → CONFIG / BATCH
// ============================================================================

fn build_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };

    if let Some(user_name) = &args.user_name {
        config.matching = config.matching.with_user_name(user_name.as_str());
    }
    if let Some(tolerance) = &args.tolerance {
        let parsed = parse_amount(tolerance, DecimalConvention::DecimalPoint)
            .map_err(|reason| anyhow!("Invalid --tolerance {:?}: {}", tolerance, reason))?;
        config.matching = config.matching.with_tolerance(parsed.minor);
    }
    if let Some(window) = args.window {
        config.matching = config.matching.with_window_days(window);
    }
    if let Some(currency) = &args.fallback_currency {
        config.normalization.fallback_currency = currency.trim().to_uppercase();
    }
    if let Some(path) = &args.profiles {
        config.profile_db = Some(path.clone());
    }

    Ok(config)
}

/// Files are keyed by file name, so `--account giro.csv=Giro` matches `exports/giro.csv`
fn file_key(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Upload name per input: the bare file name, or the path as given when
/// several inputs share a file name (`2025-01/giro.csv`, `2025-02/giro.csv`)
fn upload_names(paths: &[PathBuf]) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for path in paths {
        *seen.entry(file_key(path)).or_default() += 1;
    }
    paths
        .iter()
        .map(|path| {
            let key = file_key(path);
            if seen.get(&key).copied().unwrap_or(0) > 1 {
                path.display().to_string()
            } else {
                key
            }
        })
        .collect()
}

/// Does FILE of `--account` / `--map` refer to this input? A bare file name
/// only works while it is unambiguous.
fn refers_to(file: &str, path: &Path, name: &str) -> bool {
    let given = Path::new(file);
    given == path || file == name || (name == file_key(path) && file_key(given) == name)
}

fn build_batch(args: &Args) -> Result<Batch> {
    let inputs: Vec<(&PathBuf, String)> = args.files.iter().zip(upload_names(&args.files)).collect();

    let mut labels: Vec<(&str, &str)> = Vec::new();
    for spec in &args.accounts {
        let pair = spec
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid --account {:?}, expected FILE=LABEL", spec))?;
        labels.push(pair);
    }

    let mut mappings: HashMap<String, ManualMapping> = HashMap::new();
    for spec in &args.maps {
        let (file, field, column) = parse_map_spec(spec)?;
        let Some((_, name)) = inputs.iter().find(|(path, name)| refers_to(&file, path, name)) else {
            bail!("--map names {:?}, which is not among the input files", file);
        };
        let entry = mappings.entry(name.clone()).or_default();
        *entry = std::mem::take(entry).with(field, column);
    }

    let mut batch = Batch::new();
    for (path, name) in &inputs {
        let bytes = fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;

        let mut file = SourceFile::new(name.clone(), bytes);
        if let Some((_, label)) = labels.iter().rev().find(|(f, _)| refers_to(f, path, name)) {
            file = file.with_account(*label);
        }
        batch.add_file(file);
    }

    for (name, mapping) in mappings {
        batch.set_mapping(name, mapping);
    }

    Ok(batch)
}

/// "export.csv:amount=Umsatz (EUR)" → ("export.csv", Amount, "Umsatz (EUR)")
fn parse_map_spec(spec: &str) -> Result<(String, CanonicalField, String)> {
    let invalid = || anyhow!("Invalid --map {:?}, expected FILE:FIELD=COLUMN", spec);

    // Column names may contain ':' or '=', file paths may contain ':'
    let (target, column) = spec.split_once('=').ok_or_else(invalid)?;
    let (file, field) = target.rsplit_once(':').ok_or_else(invalid)?;

    let field: CanonicalField = field.parse().map_err(|e: String| anyhow!(e))?;
    Ok((file.to_string(), field, column.to_string()))
}

// ============================================================================
// OUTPUT
// ============================================================================

fn print_report(report: &BatchReport, summary: &LedgerSummary) {
    println!("🧾 Transaction Unification");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    println!("\n📂 Files");
    for file in &report.files {
        match &file.status {
            FileStatus::Ingested => {
                println!(
                    "✓ {} [{}] {} transactions ({}, {}, {} excluded)",
                    file.file,
                    file.account,
                    file.transactions,
                    file.encoding.as_deref().unwrap_or("?"),
                    file.delimiter.as_deref().unwrap_or("?"),
                    file.amount_errors + file.date_errors,
                );
                for sample in &file.error_samples {
                    println!("    ⚠️  {}", sample);
                }
            }
            FileStatus::Skipped { error } => println!("✗ {} skipped: {}", file.file, error),
            FileStatus::PendingMapping { incomplete } => {
                println!("⏸  {} needs a manual mapping: {}", file.file, incomplete);
                println!("    headers: {}", file.headers.join(" | "));
            }
            FileStatus::MappingRejected { error } => {
                println!("⏸  {} manual mapping rejected: {}", file.file, error)
            }
            FileStatus::Failed { reason } => println!("✗ {} failed: {}", file.file, reason),
        }
    }

    println!("\n🔁 Internal transfers");
    if report.matching.pairs.is_empty() {
        println!("   none found ({} candidate pairs)", report.matching.candidate_edges);
    }
    for pair in &report.matching.pairs {
        println!(
            "   {} → {}  {} {}  (score {}, {} days apart)",
            pair.from_account, pair.to_account, pair.amount, pair.currency, pair.score, pair.day_gap
        );
    }

    println!("\n📊 Summary");
    println!("   Transactions: {}", summary.transactions);
    println!("   Accounts:     {}", summary.accounts);
    println!("   Transfers:    {} ({} groups)", summary.internal_transfers, summary.transfer_groups);
    for (currency, totals) in &summary.by_currency {
        println!(
            "   {}: income {}  expenses {}  net {}",
            currency, totals.income, totals.expenses, totals.net
        );
    }

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!(
        "✅ {} ingested, {} pending, {} skipped",
        report.ingested(),
        report.pending(),
        report.skipped()
    );
}
