use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Provider scheme (e.g. `imdb`) → external id.
pub type GuidMap = BTreeMap<String, String>;

/// What kind of media an entity describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Movie,
    Episode,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Movie => write!(f, "movie"),
            MediaKind::Episode => write!(f, "episode"),
        }
    }
}

impl std::str::FromStr for MediaKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "movie" | "movies" | "film" => Ok(MediaKind::Movie),
            "episode" | "episodes" => Ok(MediaKind::Episode),
            _ => Err(anyhow::anyhow!("Unknown media kind: {}", s)),
        }
    }
}

/// Show/season/episode numbers carried by episodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeInfo {
    pub show: String,
    pub season: u32,
    pub episode: u32,
}

/// Arena handle for an entity inside a [`crate::mapper::Mapper`].
///
/// Handles are only meaningful for the mapper that issued them and are not
/// persisted; snapshots identify entities by [`Entity::key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u64);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Last-known state of an entity on one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendMeta {
    /// Backend-local id. Opaque, never compared across backends.
    pub item_id: String,
    pub watched: bool,
    pub observed_at: DateTime<Utc>,
    /// Set when a full library listing no longer contained the item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Canonical playback position for an unwatched entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub position_ms: u64,
    pub updated_at: DateTime<Utc>,
}

/// Canonical, merged record of one media item across backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identifier, fixed when the entity is created.
    pub key: String,
    pub kind: MediaKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode: Option<EpisodeInfo>,
    pub guids: GuidMap,
    pub watched: bool,
    /// Time of the last change to `watched`.
    pub updated_at: DateTime<Utc>,
    /// Last time a backend actually went from watched to unwatched and
    /// that flip became canonical. Being first seen unwatched is not a flip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unwatched_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    /// Guids collided with an entity of another kind; never merged or diffed.
    #[serde(default)]
    pub detached: bool,
    pub per_backend: BTreeMap<String, BackendMeta>,
}

impl Entity {
    /// Whether the entity takes part in cross-backend identity resolution.
    pub fn is_matchable(&self) -> bool {
        !self.guids.is_empty() && !self.detached
    }

    pub fn metadata(&self, backend: &str) -> Option<&BackendMeta> {
        self.per_backend.get(backend)
    }

    /// Display name, `Show - S01E02` for episodes.
    pub fn name(&self) -> String {
        match &self.episode {
            Some(ep) => format!(
                "{} - S{:02}E{:02}",
                ep.show, ep.season, ep.episode
            ),
            None => match self.year {
                Some(year) => format!("{} ({})", self.title, year),
                None => self.title.clone(),
            },
        }
    }
}

/// Human label for a play state, used in logs and request context
pub fn play_state(watched: bool) -> &'static str {
    if watched {
        "played"
    } else {
        "unplayed"
    }
}

/// One backend's report of an item during a library scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub item_id: String,
    /// `None` marks a malformed item; the mapper skips it.
    pub kind: Option<MediaKind>,
    pub title: String,
    #[serde(default)]
    pub year: Option<u16>,
    #[serde(default)]
    pub episode: Option<EpisodeInfo>,
    #[serde(default)]
    pub guids: GuidMap,
    pub watched: bool,
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub progress_ms: Option<u64>,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Observation {
    pub fn new(item_id: impl Into<String>, kind: MediaKind, title: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            kind: Some(kind),
            title: title.into(),
            year: None,
            episode: None,
            guids: GuidMap::new(),
            watched: false,
            observed_at: Utc::now(),
            progress_ms: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_guid(mut self, scheme: &str, value: &str) -> Self {
        self.guids
            .insert(crate::guid::normalize_scheme(scheme), value.trim().to_string());
        self
    }

    pub fn watched_at(mut self, watched: bool, at: DateTime<Utc>) -> Self {
        self.watched = watched;
        self.observed_at = at;
        self
    }

    pub(crate) fn meta(&self) -> BackendMeta {
        BackendMeta {
            item_id: self.item_id.clone(),
            watched: self.watched,
            observed_at: self.observed_at,
            missing_since: None,
            progress_ms: self.progress_ms,
            extra: self.extra.clone(),
        }
    }
}
