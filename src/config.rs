// ⚙️ Engine configuration - explicit values, passed into every stage
//
// Loaded from a JSON file (every field optional) and then overridden by the
// caller. There is no global settings object.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::transaction::MinorUnits;

// ============================================================================
// FORMAT SNIFFING
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SniffConfig {
    /// Leading records inspected for delimiter and header detection
    pub sample_lines: usize,

    /// Share of invalid characters an encoding may produce and still be accepted
    pub max_invalid_ratio: f64,

    /// Share of sampled records that must agree on the column count
    pub min_consistency: f64,
}

impl Default for SniffConfig {
    fn default() -> Self {
        SniffConfig {
            sample_lines: 20,
            max_invalid_ratio: 0.001,
            min_consistency: 0.6,
        }
    }
}

// ============================================================================
// RECORD NORMALIZATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeConfig {
    /// Currency used when the file has no currency column (or the cell is empty)
    pub fallback_currency: String,

    /// Values inspected to decide the decimal convention of the amount column
    pub amount_sample: usize,

    /// Values inspected to decide the date format of the date column
    pub date_sample: usize,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        NormalizeConfig {
            fallback_currency: "EUR".to_string(),
            amount_sample: 200,
            date_sample: 200,
        }
    }
}

// ============================================================================
// TRANSFER MATCHING
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Account holder's name; boosts a pair when found in a description
    pub user_name: Option<String>,

    /// Maximum |debit + credit|, in minor units (1 = 0.01)
    pub tolerance: MinorUnits,

    /// Maximum distance between the two dates, in calendar days
    pub window_days: i64,

    /// Descriptions containing any of these never take part in a transfer
    pub excluded_keywords: Vec<String>,
}

impl Default for MatchConfig {
    fn default() -> Self {
        MatchConfig {
            user_name: None,
            tolerance: MinorUnits::new(1),
            window_days: 2,
            excluded_keywords: [
                "WP-",
                "Wertpapier",
                "ETF",
                "ISIN",
                "Kauf",
                "Verkauf",
                "Dividende",
                "Zins",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl MatchConfig {
    pub fn with_user_name(mut self, user_name: impl Into<String>) -> Self {
        let name = user_name.into();
        self.user_name = if name.trim().is_empty() { None } else { Some(name) };
        self
    }

    pub fn with_tolerance(mut self, tolerance: MinorUnits) -> Self {
        self.tolerance = MinorUnits::new(tolerance.value().abs());
        self
    }

    pub fn with_window_days(mut self, window_days: i64) -> Self {
        self.window_days = window_days.max(0);
        self
    }
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sniffing: SniffConfig,
    pub normalization: NormalizeConfig,
    pub matching: MatchConfig,

    /// SQLite file holding bank profiles (None = in-memory profiles only)
    pub profile_db: Option<PathBuf>,
}

impl EngineConfig {
    /// Load configuration from a JSON file; missing keys keep their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: EngineConfig =
            serde_json::from_str(&content).context("Failed to parse config JSON")?;

        Ok(config)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();

        assert_eq!(config.sniffing.sample_lines, 20);
        assert_eq!(config.normalization.fallback_currency, "EUR");
        assert_eq!(config.matching.tolerance, MinorUnits::new(1));
        assert_eq!(config.matching.window_days, 2);
        assert!(config.matching.user_name.is_none());
        assert!(config.profile_db.is_none());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{ "matching": { "user_name": "Max Mustermann", "window_days": 3 } }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.matching.user_name.as_deref(), Some("Max Mustermann"));
        assert_eq!(config.matching.window_days, 3);
        assert_eq!(config.matching.tolerance, MinorUnits::new(1));
        assert_eq!(config.sniffing, SniffConfig::default());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "normalization": { "fallback_currency": "USD" } }"#).unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.normalization.fallback_currency, "USD");
        assert_eq!(config.normalization.amount_sample, 200);
    }

    #[test]
    fn test_from_file_missing() {
        assert!(EngineConfig::from_file("/nonexistent/config.json").is_err());
    }

    #[test]
    fn test_builders() {
        let config = MatchConfig::default()
            .with_user_name("  ")
            .with_tolerance(MinorUnits::new(-5))
            .with_window_days(-1);

        assert!(config.user_name.is_none());
        assert_eq!(config.tolerance, MinorUnits::new(5));
        assert_eq!(config.window_days, 0);
    }
}
