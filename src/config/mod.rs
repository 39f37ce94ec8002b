pub mod env;
pub mod tasks;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::{BackendKind, DEFAULT_SEGMENT};
use crate::error::SyncError;
use crate::mapper::{MapperOptions, SyncPolicy};
use crate::queue::DEFAULT_CONCURRENCY;

pub use env::apply_env;
pub use tasks::{TaskConfig, TaskName, TaskOverride};

const APP_DIR_NAME: &str = "watchsync";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Plan exports without sending anything
    pub dry_run: bool,
    pub api: ApiConfig,
    pub trust: TrustConfig,
    pub library: LibraryConfig,
    pub export: ExportConfig,
    pub events: EventsConfig,
    pub push: PushConfig,
    pub sync: SyncConfig,
    pub dispatch: DispatchConfig,
    pub logs: LogsConfig,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tasks: BTreeMap<TaskName, TaskOverride>,
    pub backends: Vec<BackendConfig>,
}

/// Control surface settings, read by the HTTP front end
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub key: Option<String>,
    pub secure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    pub proxy: bool,
    pub header: String,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            proxy: false,
            header: "X-Forwarded-For".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Items requested per library page
    pub segment: usize,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            segment: DEFAULT_SEGMENT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Diff count at which export switches to a full resync; 0 disables
    pub threshold: usize,
    /// Seconds a missing backend record survives before prune removes it
    pub not_found: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            threshold: 1000,
            not_found: 259_200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub listeners_cache: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { listeners_cache: 60 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Also synchronize playback positions
    pub progress: bool,
    pub policy: SyncPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub concurrency: usize,
    /// Run-level deadline in seconds; 0 disables
    pub timeout: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    pub level: String,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// One configured media server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub name: String,
    /// `plex`, `jellyfin` or `emby`
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub token: String,
    /// User id, required by Jellyfin and Emby
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Overrides the global dry_run flag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
    /// Backend-local ids never imported
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ignore: Vec<String>,
    pub import: bool,
    pub export: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: String::new(),
            url: String::new(),
            token: String::new(),
            user: None,
            dry_run: None,
            ignore: Vec::new(),
            import: true,
            export: true,
        }
    }
}

impl BackendConfig {
    pub fn backend_kind(&self) -> Result<BackendKind, SyncError> {
        self.kind.parse().map_err(|e: anyhow::Error| {
            SyncError::config(format!("backends.{}.type", self.name), e.to_string())
        })
    }

    /// Check the fields needed to build a backend context.
    pub fn validate(&self) -> Result<BackendKind, SyncError> {
        let key = |field: &str| format!("backends.{}.{}", self.name, field);
        if self.name.trim().is_empty() {
            return Err(SyncError::config("backends.name", "backend name is empty"));
        }
        let kind = self.backend_kind()?;
        if self.url.trim().is_empty() {
            return Err(SyncError::config(key("url"), "url is empty"));
        }
        if kind != BackendKind::Plex && self.user.as_deref().map_or(true, |u| u.trim().is_empty()) {
            return Err(SyncError::config(key("user"), format!("{} backends need a user id", kind)));
        }
        Ok(kind)
    }
}

impl Config {
    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join(APP_DIR_NAME);

        fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir.join(CONFIG_FILE_NAME))
    }

    /// Directory holding the state database and backups
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .context("Failed to get data directory")?
            .join(APP_DIR_NAME);

        fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    /// Load the config file, creating a default one if missing. Environment
    /// overrides are applied separately with [`apply_env`].
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Config::default();
            config.save_to(&path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Validation problems that do not stop a run. Offending backends are
    /// skipped and invalid timers fall back to their defaults.
    pub fn validate(&self) -> Vec<SyncError> {
        let mut errors: Vec<SyncError> = self
            .backends
            .iter()
            .filter_map(|b| b.validate().err())
            .collect();

        for (name, overrides) in &self.tasks {
            if let Some(timer) = &overrides.timer {
                if let Err(e) = tasks::check_task_timer(*name, timer) {
                    errors.push(e);
                }
            }
        }
        errors
    }

    pub fn task(&self, name: TaskName) -> TaskConfig {
        TaskConfig::resolve(name, self.tasks.get(&name))
    }

    pub fn tasks(&self) -> Vec<TaskConfig> {
        TaskName::ALL.into_iter().map(|n| self.task(n)).collect()
    }

    pub fn mapper_options(&self) -> MapperOptions {
        MapperOptions {
            policy: self.sync.policy,
            track_progress: self.sync.progress,
        }
    }

    pub fn dispatch_timeout(&self) -> Option<Duration> {
        (self.dispatch.timeout > 0).then(|| Duration::from_secs(self.dispatch.timeout))
    }

    /// Grace period for records missing from their backend
    pub fn not_found_grace(&self) -> chrono::Duration {
        let secs = i64::try_from(self.export.not_found).unwrap_or(i64::MAX);
        chrono::Duration::seconds(secs.min(i64::MAX / 1000))
    }

    /// Generate example config content for documentation
    pub fn example_config() -> String {
        let mut config = Config::default();
        config.backends.push(BackendConfig {
            name: "home_plex".to_string(),
            kind: BackendKind::Plex.to_string(),
            url: "http://localhost:32400".to_string(),
            token: "<token>".to_string(),
            ..BackendConfig::default()
        });
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}
