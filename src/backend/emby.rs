//! Jellyfin and Emby share one API shape; only the family label differs.

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::Deserialize;
use std::collections::HashMap;

use super::{
    queue_progress_updates, queue_state_updates, try_response, Backend, BackendKind, Context,
    FetchLibrary, LibraryPage, PageToken, Response, UpdateOptions, UpdateProgress, UpdateState,
};
use crate::entity::{EpisodeInfo, GuidMap, MediaKind, Observation};
use crate::guid::normalize_scheme;
use crate::mapper::{ProgressChange, StateChange};
use crate::queue::RequestQueue;

/// Emby timestamps are in 100ns ticks.
const TICKS_PER_MS: u64 = 10_000;

// API response models
#[derive(Debug, Deserialize)]
struct ItemsResponse {
    #[serde(rename = "Items", default)]
    items: Vec<EmbyItem>,
    #[serde(rename = "TotalRecordCount")]
    total: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbyItem {
    #[serde(rename = "Id")]
    id: Option<String>,
    #[serde(rename = "Name")]
    name: Option<String>,
    #[serde(rename = "Type")]
    item_type: Option<String>,
    #[serde(rename = "ProductionYear")]
    year: Option<u16>,
    #[serde(rename = "SeriesName")]
    series: Option<String>,
    #[serde(rename = "ParentIndexNumber")]
    season: Option<u32>,
    #[serde(rename = "IndexNumber")]
    index: Option<u32>,
    #[serde(rename = "ProviderIds", default)]
    provider_ids: HashMap<String, String>,
    #[serde(rename = "UserData")]
    user_data: Option<UserData>,
    #[serde(rename = "DateCreated")]
    created: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct UserData {
    #[serde(rename = "Played", default)]
    played: bool,
    #[serde(rename = "LastPlayedDate")]
    last_played: Option<DateTime<Utc>>,
    #[serde(rename = "PlaybackPositionTicks", default)]
    position_ticks: u64,
}

impl EmbyItem {
    fn into_observation(self) -> Option<Observation> {
        let item_id = self.id?;
        let kind = match self.item_type.as_deref() {
            Some("Movie") => Some(MediaKind::Movie),
            Some("Episode") => Some(MediaKind::Episode),
            _ => None,
        };

        let guids: GuidMap = self
            .provider_ids
            .into_iter()
            .filter(|(_, value)| !value.trim().is_empty())
            .map(|(scheme, value)| (normalize_scheme(&scheme), value.trim().to_string()))
            .collect();

        let episode = match (kind, self.series) {
            (Some(MediaKind::Episode), Some(show)) => Some(EpisodeInfo {
                show,
                season: self.season.unwrap_or(0),
                episode: self.index.unwrap_or(0),
            }),
            _ => None,
        };

        let user_data = self.user_data;
        let watched = user_data.as_ref().map_or(false, |u| u.played);
        let observed_at = user_data
            .as_ref()
            .and_then(|u| u.last_played)
            .into_iter()
            .chain(self.created)
            .max()
            .unwrap_or_else(Utc::now);
        let progress_ms = user_data
            .as_ref()
            .map(|u| u.position_ticks / TICKS_PER_MS)
            .filter(|ms| *ms > 0 && !watched);

        Some(Observation {
            item_id,
            kind,
            title: self.name.unwrap_or_default(),
            year: self.year,
            episode,
            guids,
            watched,
            observed_at,
            progress_ms,
            extra: Default::default(),
        })
    }
}

/// Adapter for the Emby API family (Jellyfin, Emby)
#[derive(Debug, Clone, Copy)]
pub struct EmbyBackend {
    kind: BackendKind,
}

impl EmbyBackend {
    pub fn jellyfin() -> Self {
        Self {
            kind: BackendKind::Jellyfin,
        }
    }

    pub fn emby() -> Self {
        Self {
            kind: BackendKind::Emby,
        }
    }

    pub fn headers(token: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Emby-Token",
            HeaderValue::from_str(token).context("Invalid API token")?,
        );
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn action(&self, name: &str) -> String {
        format!("{}.{}", self.kind, name)
    }

    fn state_request(ctx: &Context, item_id: &str, watched: bool) -> Result<reqwest::RequestBuilder> {
        let url = ctx.endpoint(&format!("/Users/{}/PlayedItems/{}", ctx.user()?, item_id))?;
        let builder = if watched {
            ctx.http.post(url)
        } else {
            ctx.http.delete(url)
        };
        Ok(builder.headers(ctx.backend_headers.clone()))
    }

    fn progress_request(ctx: &Context, item_id: &str, position_ms: u64) -> Result<reqwest::RequestBuilder> {
        let url = ctx.endpoint(&format!("/Users/{}/Items/{}/UserData", ctx.user()?, item_id))?;
        Ok(ctx
            .http
            .post(url)
            .headers(ctx.backend_headers.clone())
            .json(&serde_json::json!({
                "PlaybackPositionTicks": position_ms * TICKS_PER_MS,
            })))
    }

    fn parse_page(body: &str, token: PageToken, page_size: usize) -> Result<LibraryPage> {
        let response: ItemsResponse =
            serde_json::from_str(body).context("Failed to parse library response")?;
        let returned = response.items.len();

        let items = response
            .items
            .into_iter()
            .filter_map(EmbyItem::into_observation)
            .collect();

        let fetched = token.offset + returned;
        let done = returned == 0
            || match response.total {
                Some(total) => fetched >= total,
                None => returned < page_size,
            };

        Ok(LibraryPage {
            items,
            next: (!done).then_some(PageToken {
                stage: 0,
                offset: fetched,
            }),
        })
    }
}

#[async_trait]
impl FetchLibrary for EmbyBackend {
    async fn fetch_library(&self, ctx: &Context, page: PageToken) -> Result<LibraryPage> {
        let size = ctx.options.segment.max(1);
        let url = ctx.endpoint(&format!("/Users/{}/Items", ctx.user()?))?;

        tracing::debug!(
            backend = %ctx.backend_name,
            family = %self.kind,
            offset = page.offset,
            size,
            "Requesting library page"
        );

        let response = ctx
            .http
            .get(url)
            .headers(ctx.backend_headers.clone())
            .query(&[
                ("Recursive", "true".to_string()),
                ("IncludeItemTypes", "Movie,Episode".to_string()),
                ("Fields", "ProviderIds,DateCreated".to_string()),
                ("EnableUserData", "true".to_string()),
                ("StartIndex", page.offset.to_string()),
                ("Limit", size.to_string()),
            ])
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
impl UpdateState for EmbyBackend {
    async fn update_state(
        &self,
        ctx: &Context,
        changes: &[StateChange],
        queue: &mut RequestQueue,
        opts: &UpdateOptions,
    ) -> Response {
        let action = self.action("updateState");
        try_response(ctx, &action, async {
            queue_state_updates(ctx, changes, queue, opts, Self::state_request)
        })
        .await
    }
}

#[async_trait]
impl UpdateProgress for EmbyBackend {
    async fn update_progress(
        &self,
        ctx: &Context,
        changes: &[ProgressChange],
        queue: &mut RequestQueue,
        opts: &UpdateOptions,
    ) -> Response {
        let action = self.action("updateProgress");
        try_response(ctx, &action, async {
            queue_progress_updates(ctx, changes, queue, opts, Self::progress_request)
        })
        .await
    }
}

impl Backend for EmbyBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::change;

    fn context() -> Context {
        let mut ctx = Context::new(
            "jelly",
            BackendKind::Jellyfin,
            "http://jellyfin.local:8096",
            reqwest::Client::new(),
        )
        .unwrap();
        ctx.backend_user = Some("u1".to_string());
        ctx
    }

    const PAGE: &str = r#"{
        "Items": [
            {
                "Id": "abc",
                "Name": "Heat",
                "Type": "Movie",
                "ProductionYear": 1995,
                "ProviderIds": {"Imdb": "tt0113277", "Tmdb": "949", "Tvdb": ""},
                "UserData": {"Played": true, "LastPlayedDate": "2023-11-14T22:13:20Z", "PlaybackPositionTicks": 0},
                "DateCreated": "2020-01-01T00:00:00Z"
            },
            {
                "Id": "def",
                "Name": "Pilot",
                "Type": "Episode",
                "SeriesName": "Severance",
                "ParentIndexNumber": 1,
                "IndexNumber": 1,
                "ProviderIds": {"Tvdb": "8000000"},
                "UserData": {"Played": false, "PlaybackPositionTicks": 1200000000}
            },
            {"Name": "No id", "Type": "Movie"}
        ],
        "TotalRecordCount": 3
    }"#;

    #[test]
    fn test_parse_page() {
        let page = EmbyBackend::parse_page(PAGE, PageToken::default(), 100).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next, None);

        let movie = &page.items[0];
        assert_eq!(movie.item_id, "abc");
        assert!(movie.watched);
        assert_eq!(movie.guids.len(), 2);
        assert_eq!(movie.guids.get("imdb").map(String::as_str), Some("tt0113277"));
        assert_eq!(movie.observed_at.timestamp(), 1_700_000_000);

        let episode = &page.items[1];
        assert_eq!(episode.kind, Some(MediaKind::Episode));
        assert_eq!(episode.progress_ms, Some(120_000));
        assert_eq!(episode.episode.as_ref().unwrap().show, "Severance");
    }

    #[test]
    fn test_parse_page_continues() {
        let body = r#"{"Items": [{"Id": "1", "Type": "Movie"}], "TotalRecordCount": 10}"#;
        let page = EmbyBackend::parse_page(body, PageToken { stage: 0, offset: 4 }, 1).unwrap();
        assert_eq!(page.next, Some(PageToken { stage: 0, offset: 5 }));
    }

    #[test]
    fn test_state_requests() {
        let ctx = context();
        let mark = EmbyBackend::state_request(&ctx, "abc", true).unwrap().build().unwrap();
        assert_eq!(mark.method(), reqwest::Method::POST);
        assert_eq!(mark.url().path(), "/Users/u1/PlayedItems/abc");

        let unmark = EmbyBackend::state_request(&ctx, "abc", false).unwrap().build().unwrap();
        assert_eq!(unmark.method(), reqwest::Method::DELETE);
    }

    #[tokio::test]
    async fn test_missing_user_fails_the_batch() {
        let mut ctx = context();
        ctx.backend_user = None;
        let mut queue = RequestQueue::default();
        let changes = vec![change(1, "jelly", Some(false), true)];

        let response = EmbyBackend::jellyfin()
            .update_state(&ctx, &changes, &mut queue, &UpdateOptions::default())
            .await;
        assert!(!response.status);
        assert_eq!(response.error.unwrap().action, "jellyfin.updateState");
        assert!(queue.is_empty());
    }
}
