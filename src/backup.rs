use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::entity::{EpisodeInfo, GuidMap, MediaKind};
use crate::mapper::Mapper;

const BACKUP_DIR_NAME: &str = "backup";
const CURRENT_VERSION: u32 = 1;

/// Play state of one item as one backend holds it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub item_id: String,
    pub kind: MediaKind,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode: Option<EpisodeInfo>,
    pub guids: GuidMap,
    pub watched: bool,
    pub observed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendBackup {
    pub version: u32,
    pub backend: String,
    pub created_at: DateTime<Utc>,
    pub items: Vec<BackupEntry>,
}

impl BackendBackup {
    pub fn from_mapper(mapper: &Mapper, backend: &str, created_at: DateTime<Utc>) -> Self {
        let items = mapper
            .iter()
            .filter_map(|(_, entity)| {
                let meta = entity.metadata(backend)?;
                Some(BackupEntry {
                    item_id: meta.item_id.clone(),
                    kind: entity.kind,
                    title: entity.title.clone(),
                    year: entity.year,
                    episode: entity.episode.clone(),
                    guids: entity.guids.clone(),
                    watched: meta.watched,
                    observed_at: meta.observed_at,
                    progress_ms: meta.progress_ms,
                })
            })
            .collect();

        Self {
            version: CURRENT_VERSION,
            backend: backend.to_string(),
            created_at,
            items,
        }
    }
}

/// Default backup directory under the application data dir
pub fn backup_dir() -> Result<PathBuf> {
    Ok(crate::config::Config::data_dir()?.join(BACKUP_DIR_NAME))
}

/// `<dir>/<backend>.<YYYYMMDD>.json`
pub fn backup_path(dir: &Path, backend: &str, date: DateTime<Utc>) -> PathBuf {
    dir.join(format!("{}.{}.json", backend, date.format("%Y%m%d")))
}

/// Write one backup file per backend. A backend with nothing stored still
/// gets an (empty) file.
pub fn write_backups(mapper: &Mapper, backends: &[String], dir: &Path, now: DateTime<Utc>) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).context("Failed to create backup directory")?;

    let mut written = Vec::with_capacity(backends.len());
    for backend in backends {
        let backup = BackendBackup::from_mapper(mapper, backend, now);
        let path = backup_path(dir, backend, now);
        let contents = serde_json::to_string_pretty(&backup).context("Failed to serialize backup")?;
        fs::write(&path, contents)
            .with_context(|| format!("Failed to write backup {}", path.display()))?;

        tracing::info!(backend = %backend, items = backup.items.len(), path = %path.display(), "Wrote backup");
        written.push(path);
    }
    Ok(written)
}

pub fn read_backup(path: &Path) -> Result<BackendBackup> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read backup {}", path.display()))?;
    serde_json::from_str(&contents).context("Backup file is corrupt")
}
