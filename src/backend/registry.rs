use anyhow::{anyhow, Context as _, Result};
use reqwest::header::HeaderMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{Backend, BackendKind, Context, ContextOptions, EmbyBackend, PlexBackend};
use crate::config::{BackendConfig, Config};

const USER_AGENT: &str = concat!("watchsync/", env!("CARGO_PKG_VERSION"));
const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

/// Shared outbound HTTP client
pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")
}

/// The adapter implementing a backend family
pub fn adapter_for(kind: BackendKind) -> Arc<dyn Backend> {
    match kind {
        BackendKind::Plex => Arc::new(PlexBackend::new()),
        BackendKind::Jellyfin => Arc::new(EmbyBackend::jellyfin()),
        BackendKind::Emby => Arc::new(EmbyBackend::emby()),
    }
}

fn headers_for(kind: BackendKind, token: &str) -> Result<HeaderMap> {
    match kind {
        BackendKind::Plex => PlexBackend::headers(token),
        BackendKind::Jellyfin | BackendKind::Emby => EmbyBackend::headers(token),
    }
}

/// A configured backend ready for a run
#[derive(Clone)]
pub struct RegisteredBackend {
    pub context: Context,
    pub adapter: Arc<dyn Backend>,
    pub import: bool,
    pub export: bool,
}

impl RegisteredBackend {
    pub fn name(&self) -> &str {
        &self.context.backend_name
    }
}

impl std::fmt::Debug for RegisteredBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredBackend")
            .field("name", &self.context.backend_name)
            .field("kind", &self.adapter.kind())
            .field("import", &self.import)
            .field("export", &self.export)
            .finish()
    }
}

/// Holds every usable backend; configuration problems are kept per backend
/// instead of failing the whole registry.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: Vec<RegisteredBackend>,
    /// Backend initialization errors keyed by configured name
    init_errors: HashMap<String, String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every backend in `config`. Backends that fail validation are
    /// skipped and recorded in [`BackendRegistry::init_errors`].
    pub fn from_config(config: &Config, http: reqwest::Client) -> Self {
        let mut registry = Self::new();

        for backend in &config.backends {
            let result = Self::build(config, backend, http.clone())
                .and_then(|registered| registry.register(registered));
            if let Err(e) = result {
                tracing::warn!(backend = %backend.name, error = %format!("{:#}", e), "Skipping backend");
                registry.init_errors.insert(backend.name.clone(), e.to_string());
            }
        }

        tracing::debug!(
            backends = registry.backends.len(),
            skipped = registry.init_errors.len(),
            "Backend registry ready"
        );
        registry
    }

    fn build(config: &Config, backend: &BackendConfig, http: reqwest::Client) -> Result<RegisteredBackend> {
        let kind = backend.validate()?;
        let mut context = Context::new(backend.name.clone(), kind, &backend.url, http)?;
        context.backend_user = backend.user.clone();
        context.backend_headers = headers_for(kind, &backend.token)?;
        context.options = ContextOptions {
            dry_run: backend.dry_run.unwrap_or(config.dry_run),
            ignore: backend.ignore.iter().cloned().collect(),
            segment: config.library.segment.max(1),
        };

        Ok(RegisteredBackend {
            context,
            adapter: adapter_for(kind),
            import: backend.import,
            export: backend.export,
        })
    }

    /// Add a backend. Names are unique.
    pub fn register(&mut self, backend: RegisteredBackend) -> Result<()> {
        if self.get(backend.name()).is_some() {
            return Err(anyhow!("Duplicate backend name: {}", backend.name()));
        }
        self.backends.push(backend);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredBackend> {
        self.backends.iter().find(|b| b.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredBackend> {
        self.backends.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Get initialization errors
    pub fn init_errors(&self) -> &HashMap<String, String> {
        &self.init_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(name: &str, kind: &str) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            kind: kind.to_string(),
            url: "http://media.local:8096".to_string(),
            token: "token".to_string(),
            user: Some("u1".to_string()),
            ..BackendConfig::default()
        }
    }

    #[test]
    fn test_from_config_skips_invalid_backends() {
        let mut config = Config::default();
        config.dry_run = true;
        config.backends = vec![
            backend("plex", "plex"),
            backend("jelly", "jellyfin"),
            backend("kodi", "kodi"),
            backend("plex", "plex"),
        ];
        config.backends[1].dry_run = Some(false);
        config.backends[1].ignore = vec!["7".to_string()];

        let registry = BackendRegistry::from_config(&config, reqwest::Client::new());
        assert_eq!(registry.names(), vec!["plex".to_string(), "jelly".to_string()]);
        assert_eq!(registry.init_errors().len(), 2);
        assert!(registry.init_errors()["kodi"].contains("backends.kodi.type"));

        let plex = registry.get("plex").unwrap();
        assert_eq!(plex.adapter.kind(), BackendKind::Plex);
        assert!(plex.context.options.dry_run);
        assert!(plex.context.backend_headers.contains_key("X-Plex-Token"));

        let jelly = registry.get("jelly").unwrap();
        assert_eq!(jelly.adapter.kind(), BackendKind::Jellyfin);
        assert!(!jelly.context.options.dry_run);
        assert!(jelly.context.is_ignored("7"));
        assert_eq!(jelly.context.user().unwrap(), "u1");
    }

    #[test]
    fn test_http_client_builds() {
        assert!(http_client().is_ok());
        assert!(USER_AGENT.starts_with("watchsync/"));
    }
}
