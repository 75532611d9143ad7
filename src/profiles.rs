// 🏦 Bank Profiles - remembered column mappings, keyed by header fingerprint
//
// The second upload of the same bank export is mapped without asking anyone.
// Two stores behind one trait:
// - MemoryProfileStore: process-local, used by tests and one-shot CLI runs
// - SqliteProfileStore: survives restarts (the only state the engine persists)
//
// Rule: a stored manual mapping is never replaced by an auto-detected one.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};
use tracing::debug;

use crate::mapping::ColumnMapping;

// ============================================================================
// BANK PROFILE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankProfile {
    /// SHA-256 of the sorted, normalized header set
    pub fingerprint: String,

    /// Headers as first seen
    pub headers: Vec<String>,

    pub mapping: ColumnMapping,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BankProfile {
    pub fn new(headers: Vec<String>, mapping: ColumnMapping) -> Self {
        let now = Utc::now();
        BankProfile {
            fingerprint: mapping.fingerprint.clone(),
            headers,
            mapping,
            created_at: now,
            updated_at: now,
        }
    }
}

/// What `remember` did with a confirmed mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileWrite {
    Created,
    Updated,
    Unchanged,
    /// A manual mapping was already stored; the auto-detected one was dropped
    KeptManual,
}

// ============================================================================
// PROFILE STORE TRAIT
// ============================================================================

pub trait ProfileStore: Send + Sync {
    fn lookup(&self, fingerprint: &str) -> Result<Option<BankProfile>>;

    /// Fails if a profile with this fingerprint exists
    fn create(&self, profile: BankProfile) -> Result<()>;

    /// Fails if no profile with this fingerprint exists
    fn update(&self, profile: BankProfile) -> Result<()>;

    fn all(&self) -> Result<Vec<BankProfile>>;

    /// Store a confirmed mapping, respecting manual > auto. Lookup and
    /// write happen under one lock, so concurrent files cannot race.
    fn remember(&self, headers: &[String], mapping: &ColumnMapping) -> Result<ProfileWrite>;
}

/// Decide what remembering `mapping` does to the stored profile, if any
fn plan_write(
    existing: Option<BankProfile>,
    headers: &[String],
    mapping: &ColumnMapping,
) -> (ProfileWrite, Option<BankProfile>) {
    match existing {
        None => (
            ProfileWrite::Created,
            Some(BankProfile::new(headers.to_vec(), mapping.clone())),
        ),
        Some(existing) if existing.mapping == *mapping => (ProfileWrite::Unchanged, None),
        Some(existing) if existing.mapping.is_manual() && !mapping.is_manual() => {
            (ProfileWrite::KeptManual, None)
        }
        Some(existing) => (
            ProfileWrite::Updated,
            Some(BankProfile {
                mapping: mapping.clone(),
                updated_at: Utc::now(),
                ..existing
            }),
        ),
    }
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

#[derive(Default)]
pub struct MemoryProfileStore {
    profiles: RwLock<HashMap<String, BankProfile>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl ProfileStore for MemoryProfileStore {
    fn lookup(&self, fingerprint: &str) -> Result<Option<BankProfile>> {
        let profiles = self.profiles.read().unwrap_or_else(PoisonError::into_inner);
        Ok(profiles.get(fingerprint).cloned())
    }

    fn create(&self, profile: BankProfile) -> Result<()> {
        let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
        if profiles.contains_key(&profile.fingerprint) {
            return Err(anyhow!("Bank profile {} already exists", profile.fingerprint));
        }
        profiles.insert(profile.fingerprint.clone(), profile);
        Ok(())
    }

    fn update(&self, profile: BankProfile) -> Result<()> {
        let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
        match profiles.get_mut(&profile.fingerprint) {
            Some(slot) => {
                *slot = profile;
                Ok(())
            }
            None => Err(anyhow!("Bank profile {} not found", profile.fingerprint)),
        }
    }

    fn all(&self) -> Result<Vec<BankProfile>> {
        let profiles = self.profiles.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<BankProfile> = profiles.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.fingerprint.cmp(&b.fingerprint)));
        Ok(all)
    }

    fn remember(&self, headers: &[String], mapping: &ColumnMapping) -> Result<ProfileWrite> {
        let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
        let (write, profile) = plan_write(profiles.get(&mapping.fingerprint).cloned(), headers, mapping);
        if let Some(profile) = profile {
            profiles.insert(profile.fingerprint.clone(), profile);
        }
        debug!(fingerprint = %mapping.fingerprint, ?write, "bank profile remembered");
        Ok(write)
    }
}

// ============================================================================
// SQLITE STORE
// ============================================================================

pub struct SqliteProfileStore {
    conn: Mutex<Connection>,
}

impl SqliteProfileStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open profile database: {:?}", path.as_ref()))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        setup_profile_table(&conn)?;
        Ok(SqliteProfileStore {
            conn: Mutex::new(conn),
        })
    }
}

fn setup_profile_table(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS bank_profiles (
            fingerprint TEXT PRIMARY KEY,
            headers TEXT NOT NULL,
            mapping TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

fn profile_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode_profile(raw: (String, String, String, String, String)) -> Result<BankProfile> {
    let (fingerprint, headers, mapping, created_at, updated_at) = raw;

    Ok(BankProfile {
        headers: serde_json::from_str(&headers)
            .with_context(|| format!("Corrupt headers for profile {}", fingerprint))?,
        mapping: serde_json::from_str(&mapping)
            .with_context(|| format!("Corrupt mapping for profile {}", fingerprint))?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .with_context(|| format!("Corrupt created_at for profile {}", fingerprint))?
            .with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .with_context(|| format!("Corrupt updated_at for profile {}", fingerprint))?
            .with_timezone(&Utc),
        fingerprint,
    })
}

fn select_profile(conn: &Connection, fingerprint: &str) -> Result<Option<BankProfile>> {
    let raw = conn
        .query_row(
            "SELECT fingerprint, headers, mapping, created_at, updated_at
             FROM bank_profiles WHERE fingerprint = ?1",
            params![fingerprint],
            profile_from_row,
        )
        .optional()?;

    raw.map(decode_profile).transpose()
}

fn insert_profile(conn: &Connection, profile: &BankProfile) -> Result<()> {
    conn.execute(
        "INSERT INTO bank_profiles (fingerprint, headers, mapping, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            profile.fingerprint,
            serde_json::to_string(&profile.headers)?,
            serde_json::to_string(&profile.mapping)?,
            profile.created_at.to_rfc3339(),
            profile.updated_at.to_rfc3339(),
        ],
    )
    .with_context(|| format!("Failed to create bank profile {}", profile.fingerprint))?;
    Ok(())
}

fn update_profile(conn: &Connection, profile: &BankProfile) -> Result<()> {
    let changed = conn.execute(
        "UPDATE bank_profiles SET headers = ?2, mapping = ?3, updated_at = ?4
         WHERE fingerprint = ?1",
        params![
            profile.fingerprint,
            serde_json::to_string(&profile.headers)?,
            serde_json::to_string(&profile.mapping)?,
            profile.updated_at.to_rfc3339(),
        ],
    )?;

    if changed == 0 {
        return Err(anyhow!("Bank profile {} not found", profile.fingerprint));
    }
    Ok(())
}

impl ProfileStore for SqliteProfileStore {
    fn lookup(&self, fingerprint: &str) -> Result<Option<BankProfile>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        select_profile(&conn, fingerprint)
    }

    fn create(&self, profile: BankProfile) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        insert_profile(&conn, &profile)
    }

    fn update(&self, profile: BankProfile) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        update_profile(&conn, &profile)
    }

    fn all(&self) -> Result<Vec<BankProfile>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT fingerprint, headers, mapping, created_at, updated_at
             FROM bank_profiles
             ORDER BY created_at, fingerprint",
        )?;

        let rows = stmt
            .query_map([], profile_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(decode_profile).collect()
    }

    fn remember(&self, headers: &[String], mapping: &ColumnMapping) -> Result<ProfileWrite> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        // IMMEDIATE takes the write lock up front, so another process sharing
        // the file cannot slip in between lookup and write
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (write, profile) = plan_write(select_profile(&tx, &mapping.fingerprint)?, headers, mapping);
        match (&write, &profile) {
            (ProfileWrite::Created, Some(profile)) => insert_profile(&tx, profile)?,
            (ProfileWrite::Updated, Some(profile)) => update_profile(&tx, profile)?,
            _ => {}
        }
        tx.commit().context("Failed to commit bank profile")?;

        debug!(fingerprint = %mapping.fingerprint, ?write, "bank profile remembered");
        Ok(write)
    }
}

// ============================================================================
// TESTS
// ============================================================================
