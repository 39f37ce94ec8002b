use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::StateStore;
use crate::entity::Entity;
use crate::mapper::Snapshot;

/// Entity key -> JSON-encoded entity
const STATE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("state");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");
const VERSION_KEY: &str = "version";

const DB_FILE_NAME: &str = "state.redb";

pub struct RedbStore {
    db: Mutex<Database>,
    path: PathBuf,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").field("path", &self.path).finish()
    }
}

impl RedbStore {
    /// Open the database in the application data directory.
    pub fn new() -> Result<Self> {
        let path = crate::config::Config::data_dir()?.join(DB_FILE_NAME);
        Self::open(&path)
    }

    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)
            .with_context(|| format!("Failed to open state database {}", path.display()))?;
        // Ensure tables exist
        let txn = db.begin_write()?;
        {
            let _ = txn.open_table(STATE_TABLE)?;
            let _ = txn.open_table(META_TABLE)?;
        }
        txn.commit()?;
        Ok(Self {
            db: Mutex::new(db),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of stored entities.
    pub fn len(&self) -> Result<u64> {
        let db = self.db.lock().map_err(|e| anyhow!("lock poisoned: {e}"))?;
        let rtxn = db.begin_read()?;
        let table = rtxn.open_table(STATE_TABLE)?;
        Ok(table.len()?)
    }
}

#[async_trait]
impl StateStore for RedbStore {
    fn backend_name(&self) -> &str {
        "redb"
    }

    async fn load(&self) -> Result<Snapshot> {
        let db = self.db.lock().map_err(|e| anyhow!("lock poisoned: {e}"))?;
        let rtxn = db.begin_read()?;

        let version = rtxn
            .open_table(META_TABLE)?
            .get(VERSION_KEY)?
            .map(|v| v.value() as u32)
            .unwrap_or_default();

        let table = rtxn.open_table(STATE_TABLE)?;
        let mut entities = Vec::with_capacity(table.len()? as usize);
        for item in table.iter()? {
            let (key, val) = item?;
            match serde_json::from_slice::<Entity>(val.value()) {
                Ok(entity) => entities.push(entity),
                Err(e) => {
                    tracing::warn!(key = key.value(), error = %e, "Skipping unreadable state row");
                }
            }
        }

        tracing::debug!(entities = entities.len(), "Loaded state");
        Ok(Snapshot { version, entities })
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let rows = snapshot
            .entities
            .iter()
            .map(|entity| Ok((entity.key.as_str(), serde_json::to_vec(entity)?)))
            .collect::<Result<Vec<_>>>()
            .context("Failed to encode state")?;

        let db = self.db.lock().map_err(|e| anyhow!("lock poisoned: {e}"))?;
        let txn = db.begin_write()?;
        {
            txn.delete_table(STATE_TABLE)?;
            let mut table = txn.open_table(STATE_TABLE)?;
            let mut written = HashSet::new();
            for (key, json) in &rows {
                // Keys are fixed at creation, so a clash only happens between
                // entities created from identical guid sets.
                let mut stored_key = key.to_string();
                let mut n = 1;
                while !written.insert(stored_key.clone()) {
                    stored_key = format!("{}~{}", key, n);
                    n += 1;
                }
                table.insert(stored_key.as_str(), json.as_slice())?;
            }

            let mut meta = txn.open_table(META_TABLE)?;
            meta.insert(VERSION_KEY, u64::from(snapshot.version))?;
        }
        txn.commit().context("Failed to commit state")?;

        tracing::debug!(entities = rows.len(), "Saved state");
        Ok(())
    }

    async fn compact(&self) -> Result<bool> {
        let mut db = self.db.lock().map_err(|e| anyhow!("lock poisoned: {e}"))?;
        let compacted = db.compact().context("Failed to compact state database")?;
        Ok(compacted)
    }
}
