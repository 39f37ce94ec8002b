use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::Deserialize;

use super::{
    queue_progress_updates, queue_state_updates, try_response, Backend, BackendKind, Context,
    FetchLibrary, LibraryPage, PageToken, Response, UpdateOptions, UpdateProgress, UpdateState,
};
use crate::entity::{EpisodeInfo, GuidMap, MediaKind, Observation};
use crate::guid::parse_guid_uri;
use crate::mapper::{ProgressChange, StateChange};
use crate::queue::RequestQueue;

const PLEX_IDENTIFIER: &str = "com.plexapp.plugins.library";

/// Plex lists movies (type 1) and episodes (type 4) separately.
const STAGES: [(u8, &str); 2] = [(1, "movies"), (4, "episodes")];

// API response models
#[derive(Debug, Deserialize)]
struct PlexEnvelope {
    #[serde(rename = "MediaContainer")]
    container: MediaContainer,
}

#[derive(Debug, Deserialize)]
struct MediaContainer {
    #[serde(rename = "totalSize")]
    total_size: Option<usize>,
    #[serde(rename = "Metadata", default)]
    metadata: Vec<PlexItem>,
}

#[derive(Debug, Deserialize)]
struct PlexItem {
    #[serde(rename = "ratingKey")]
    rating_key: Option<String>,
    #[serde(rename = "type")]
    item_type: Option<String>,
    title: Option<String>,
    year: Option<u16>,
    #[serde(rename = "grandparentTitle")]
    show: Option<String>,
    #[serde(rename = "parentIndex")]
    season: Option<u32>,
    index: Option<u32>,
    #[serde(rename = "viewCount")]
    view_count: Option<u32>,
    #[serde(rename = "viewOffset")]
    view_offset: Option<u64>,
    #[serde(rename = "lastViewedAt")]
    last_viewed_at: Option<i64>,
    #[serde(rename = "updatedAt")]
    updated_at: Option<i64>,
    #[serde(rename = "addedAt")]
    added_at: Option<i64>,
    /// Legacy agent guid, e.g. `com.plexapp.agents.imdb://tt0111161?lang=en`
    guid: Option<String>,
    #[serde(rename = "Guid", default)]
    guids: Vec<PlexGuid>,
}

#[derive(Debug, Deserialize)]
struct PlexGuid {
    id: String,
}

impl PlexItem {
    fn into_observation(self) -> Option<Observation> {
        let item_id = self.rating_key?;
        let kind = match self.item_type.as_deref() {
            Some("movie") => Some(MediaKind::Movie),
            Some("episode") => Some(MediaKind::Episode),
            _ => None,
        };

        let mut guids = GuidMap::new();
        for uri in self.guids.iter().map(|g| g.id.as_str()).chain(self.guid.as_deref()) {
            // plex:// guids are Plex-internal and never shared with other servers.
            if let Some((scheme, value)) = parse_guid_uri(uri).filter(|(s, _)| s != "plex") {
                guids.entry(scheme).or_insert(value);
            }
        }

        let episode = match (kind, &self.show) {
            (Some(MediaKind::Episode), Some(show)) => Some(EpisodeInfo {
                show: show.clone(),
                season: self.season.unwrap_or(0),
                episode: self.index.unwrap_or(0),
            }),
            _ => None,
        };

        let observed_at = [self.last_viewed_at, self.updated_at, self.added_at]
            .into_iter()
            .flatten()
            .max()
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .unwrap_or_else(Utc::now);

        let watched = self.view_count.unwrap_or(0) > 0;

        Some(Observation {
            item_id,
            kind,
            title: self.title.unwrap_or_default(),
            year: self.year,
            episode,
            guids,
            watched,
            observed_at,
            progress_ms: self.view_offset.filter(|_| !watched),
            extra: Default::default(),
        })
    }
}

/// Adapter for Plex Media Server
#[derive(Debug, Default, Clone, Copy)]
pub struct PlexBackend;

impl PlexBackend {
    pub fn new() -> Self {
        Self
    }

    pub fn headers(token: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Plex-Token",
            HeaderValue::from_str(token).context("Invalid Plex token")?,
        );
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn state_request(ctx: &Context, item_id: &str, watched: bool) -> Result<reqwest::RequestBuilder> {
        let path = if watched { "/:/scrobble" } else { "/:/unscrobble" };
        Ok(ctx
            .http
            .get(ctx.endpoint(path)?)
            .headers(ctx.backend_headers.clone())
            .query(&[("identifier", PLEX_IDENTIFIER), ("key", item_id)]))
    }

    fn progress_request(ctx: &Context, item_id: &str, position_ms: u64) -> Result<reqwest::RequestBuilder> {
        let time = position_ms.to_string();
        Ok(ctx
            .http
            .get(ctx.endpoint("/:/progress")?)
            .headers(ctx.backend_headers.clone())
            .query(&[
                ("identifier", PLEX_IDENTIFIER),
                ("key", item_id),
                ("time", time.as_str()),
                ("state", "stopped"),
            ]))
    }

    fn parse_page(body: &str, token: PageToken, page_size: usize) -> Result<LibraryPage> {
        let envelope: PlexEnvelope =
            serde_json::from_str(body).context("Failed to parse Plex library response")?;
        let container = envelope.container;
        let returned = container.metadata.len();

        let items = container
            .metadata
            .into_iter()
            .filter_map(PlexItem::into_observation)
            .collect();

        let fetched = token.offset + returned;
        let stage_done = match container.total_size {
            Some(total) => fetched >= total,
            None => returned < page_size,
        } || returned == 0;

        let next = if !stage_done {
            Some(PageToken {
                stage: token.stage,
                offset: fetched,
            })
        } else if token.stage + 1 < STAGES.len() {
            Some(PageToken {
                stage: token.stage + 1,
                offset: 0,
            })
        } else {
            None
        };

        Ok(LibraryPage { items, next })
    }
}

#[async_trait]
impl FetchLibrary for PlexBackend {
    async fn fetch_library(&self, ctx: &Context, page: PageToken) -> Result<LibraryPage> {
        let (plex_type, label) = STAGES
            .get(page.stage)
            .copied()
            .context("Plex page token out of range")?;
        let size = ctx.options.segment.max(1);

        tracing::debug!(
            backend = %ctx.backend_name,
            stage = label,
            offset = page.offset,
            size,
            "Requesting Plex library page"
        );

        let response = ctx
            .http
            .get(ctx.endpoint("/library/all")?)
            .headers(ctx.backend_headers.clone())
            .query(&[("type", plex_type.to_string()), ("includeGuids", "1".to_string())])
            .header("X-Plex-Container-Start", page.offset.to_string())
            .header("X-Plex-Container-Size", size.to_string())
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", ctx.backend_name))?
            .error_for_status()
            .with_context(|| format!("{} rejected library request", ctx.backend_name))?;

        let body = response.text().await?;
        Self::parse_page(&body, page, size)
    }
}

#[async_trait]
impl UpdateState for PlexBackend {
    async fn update_state(
        &self,
        ctx: &Context,
        changes: &[StateChange],
        queue: &mut RequestQueue,
        opts: &UpdateOptions,
    ) -> Response {
        try_response(ctx, "plex.updateState", async {
            queue_state_updates(ctx, changes, queue, opts, Self::state_request)
        })
        .await
    }
}

#[async_trait]
impl UpdateProgress for PlexBackend {
    async fn update_progress(
        &self,
        ctx: &Context,
        changes: &[ProgressChange],
        queue: &mut RequestQueue,
        opts: &UpdateOptions,
    ) -> Response {
        try_response(ctx, "plex.updateProgress", async {
            queue_progress_updates(ctx, changes, queue, opts, Self::progress_request)
        })
        .await
    }
}

impl Backend for PlexBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Plex
    }
}
