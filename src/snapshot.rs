//! Snapshot restore/persist and the restore-vs-fresh merge
//!
//! Stores treat the state as an opaque JSON blob tagged with a schema
//! version. A blob written under another version is ignored on restore.
//!
//! Init merge precedence (restored snapshot vs. freshly looked-up seed):
//!
//! | field                                           | winner                         |
//! |-------------------------------------------------|--------------------------------|
//! | addresses, bonded token, ppm, beneficiary, pct  | fresh                          |
//! | collateral balances                             | fresh when looked up           |
//! | collateral symbol/name/decimals                 | fresh when present             |
//! | collateral curve params, taps                   | restored                       |
//! | orders, cleared batches, returns                | restored                       |
//! | connected account                               | restored                       |
//! | sync flag                                       | reset to `false`               |

use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::events::InitData;
use crate::models::{Address, AppState};

pub const SNAPSHOT_VERSION: u32 = 1;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS snapshots (
    snapshot_key TEXT PRIMARY KEY,
    version INTEGER NOT NULL,
    state_json TEXT NOT NULL,
    saved_at INTEGER NOT NULL
) WITHOUT ROWID;
"#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    /// Unix seconds
    pub saved_at: i64,
    pub state: AppState,
}

impl Snapshot {
    pub fn new(state: AppState) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: chrono::Utc::now().timestamp(),
            state,
        }
    }

    fn into_current(self) -> Option<AppState> {
        if self.version == SNAPSHOT_VERSION {
            Some(self.state)
        } else {
            warn!(
                "Ignoring snapshot with schema version {} (expected {}), starting fresh",
                self.version, SNAPSHOT_VERSION
            );
            None
        }
    }
}

/// Host-provided persistence for the projected state.
pub trait SnapshotStore: Send + Sync {
    fn restore(&self) -> Result<Option<AppState>>;
    fn persist(&self, state: &AppState) -> Result<()>;
}

// =============================================================================
// SQLITE
// =============================================================================

pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
    key: String,
}

impl SqliteSnapshotStore {
    pub fn open(path: impl AsRef<Path>, key: &str) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open snapshot database at {}", path.display()))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize snapshot schema")?;
        info!("Snapshot store ready at {} (key {})", path.display(), key);
        Ok(Self {
            conn: Mutex::new(conn),
            key: key.to_string(),
        })
    }

    fn load(&self) -> Result<Option<Snapshot>> {
        let conn = self.conn.lock();
        let row: Option<(u32, String, i64)> = conn
            .query_row(
                "SELECT version, state_json, saved_at FROM snapshots WHERE snapshot_key = ?1",
                params![self.key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .context("Failed to read snapshot")?;

        let Some((version, state_json, saved_at)) = row else {
            return Ok(None);
        };
        if version != SNAPSHOT_VERSION {
            // the blob may not even parse under the current schema
            warn!(
                "Ignoring snapshot with schema version {} (expected {}), starting fresh",
                version, SNAPSHOT_VERSION
            );
            return Ok(None);
        }
        let state = serde_json::from_str(&state_json).context("Failed to decode snapshot")?;
        Ok(Some(Snapshot {
            version,
            saved_at,
            state,
        }))
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn restore(&self) -> Result<Option<AppState>> {
        Ok(self.load()?.and_then(Snapshot::into_current))
    }

    fn persist(&self, state: &AppState) -> Result<()> {
        let snapshot = Snapshot::new(state.clone());
        let state_json = serde_json::to_string(&snapshot.state)?;
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO snapshots (snapshot_key, version, state_json, saved_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![self.key, snapshot.version, state_json, snapshot.saved_at],
            )
            .context("Failed to write snapshot")?;
        debug!("Persisted snapshot {}", self.key);
        Ok(())
    }
}

// =============================================================================
// IN-MEMORY
// =============================================================================

#[derive(Default)]
pub struct MemorySnapshotStore {
    slot: Mutex<Option<Snapshot>>,
    writes: Mutex<u64>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            slot: Mutex::new(Some(snapshot)),
            writes: Mutex::new(0),
        }
    }

    pub fn latest(&self) -> Option<Snapshot> {
        self.slot.lock().clone()
    }

    pub fn writes(&self) -> u64 {
        *self.writes.lock()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn restore(&self) -> Result<Option<AppState>> {
        Ok(self.latest().and_then(Snapshot::into_current))
    }

    fn persist(&self, state: &AppState) -> Result<()> {
        *self.slot.lock() = Some(Snapshot::new(state.clone()));
        *self.writes.lock() += 1;
        Ok(())
    }
}

// =============================================================================
// MERGE
// =============================================================================

/// Folds the fresh `Init` seed over `restored` per the table in the module docs.
pub fn merge_init(restored: AppState, init: &InitData) -> AppState {
    let mut state = restored;

    state.addresses = Some(init.addresses.clone());
    state.bonded_token = Some(init.bonded_token.clone());
    state.ppm = init.ppm;
    state.beneficiary = init.beneficiary.clone();
    state.maximum_tap_increase_pct = init.maximum_tap_increase_pct.clone();
    for tap in &mut state.taps {
        tap.max_increase_pct = init.maximum_tap_increase_pct.clone();
    }

    for (token, balance) in &init.balances {
        if let Some(collateral) = state.collateral_token_mut(token) {
            collateral.balance = balance.clone();
        }
    }
    for (token, metadata) in &init.metadata {
        if let Some(collateral) = state.collateral_token_mut(token) {
            collateral.apply_metadata(metadata);
        }
    }

    for token in ratios_above_ppm(&state) {
        error!(
            "Restored collateral {} has a reserve ratio above the fresh ppm {}",
            token, state.ppm
        );
    }

    state.is_syncing = false;
    state
}

/// Collateral tokens whose reserve ratio no longer fits under `state.ppm`.
pub fn ratios_above_ppm(state: &AppState) -> Vec<&Address> {
    state
        .collateral_tokens
        .iter()
        .filter(|t| t.reserve_ratio > state.ppm)
        .map(|t| &t.address)
        .collect()
}
