//! Persistence for the reconciled state.
//!
//! - [`RedbStore`]: single-file redb database (default)
//! - [`MemoryStore`]: in-process only, for dry runs and tests
//!
//! The orchestrator holds a `Box<dyn StateStore>` and loads the mapper from
//! it at the start of a run and saves it back at the end.

pub mod memory;
pub mod state_db;

use anyhow::Result;
use async_trait::async_trait;

use crate::mapper::Snapshot;

pub use self::memory::MemoryStore;
pub use self::state_db::RedbStore;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Human-readable backend name (e.g., "redb", "memory").
    fn backend_name(&self) -> &str;

    /// Load the last saved snapshot. Empty when nothing was saved yet.
    async fn load(&self) -> Result<Snapshot>;

    /// Replace the stored state with `snapshot`.
    async fn save(&self, snapshot: &Snapshot) -> Result<()>;

    /// Reclaim unused space. Returns true if anything was done.
    async fn compact(&self) -> Result<bool> {
        Ok(false)
    }
}
