use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Mutex;

use super::StateStore;
use crate::mapper::Snapshot;

#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: Mutex<Snapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    fn backend_name(&self) -> &str {
        "memory"
    }

    async fn load(&self) -> Result<Snapshot> {
        let snapshot = self.snapshot.lock().map_err(|e| anyhow!("lock poisoned: {e}"))?;
        Ok(snapshot.clone())
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let mut stored = self.snapshot.lock().map_err(|e| anyhow!("lock poisoned: {e}"))?;
        *stored = snapshot.clone();
        Ok(())
    }
}
