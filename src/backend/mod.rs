pub mod emby;
pub mod plex;
pub mod registry;

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use futures_util::FutureExt;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use crate::entity::{play_state, Observation};
use crate::mapper::{ProgressChange, StateChange};
use crate::queue::{panic_message, RequestAction, RequestFuture, RequestInfo, RequestQueue};

pub use emby::EmbyBackend;
pub use plex::PlexBackend;
pub use registry::{BackendRegistry, RegisteredBackend};

pub const DEFAULT_SEGMENT: usize = 1_000;

/// Which media-server family a backend belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Plex,
    Jellyfin,
    Emby,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Plex => write!(f, "plex"),
            BackendKind::Jellyfin => write!(f, "jellyfin"),
            BackendKind::Emby => write!(f, "emby"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "plex" => Ok(BackendKind::Plex),
            "jellyfin" | "jf" => Ok(BackendKind::Jellyfin),
            "emby" => Ok(BackendKind::Emby),
            _ => Err(anyhow!("Unknown backend type: {}", s)),
        }
    }
}

/// Per-run options attached to a backend context
#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub dry_run: bool,
    /// Backend-local ids that are never imported.
    pub ignore: HashSet<String>,
    /// Library page size.
    pub segment: usize,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            ignore: HashSet::new(),
            segment: DEFAULT_SEGMENT,
        }
    }
}

/// Everything an action needs to talk to one backend. Immutable for the
/// duration of a run.
#[derive(Debug, Clone)]
pub struct Context {
    pub backend_name: String,
    pub backend_kind: BackendKind,
    pub backend_url: reqwest::Url,
    /// User id for APIs scoped per user (Emby family).
    pub backend_user: Option<String>,
    pub backend_headers: HeaderMap,
    pub options: ContextOptions,
    pub http: reqwest::Client,
}

impl Context {
    pub fn new(
        backend_name: impl Into<String>,
        backend_kind: BackendKind,
        backend_url: &str,
        http: reqwest::Client,
    ) -> Result<Self> {
        let backend_url = reqwest::Url::parse(backend_url)
            .with_context(|| format!("Invalid backend url: {}", backend_url))?;
        Ok(Self {
            backend_name: backend_name.into(),
            backend_kind,
            backend_url,
            backend_user: None,
            backend_headers: HeaderMap::new(),
            options: ContextOptions::default(),
            http,
        })
    }

    /// Absolute URL for `path`, keeping any path prefix of the base URL.
    pub fn endpoint(&self, path: &str) -> Result<reqwest::Url> {
        let base = self.backend_url.as_str().trim_end_matches('/');
        let url = format!("{}/{}", base, path.trim_start_matches('/'));
        reqwest::Url::parse(&url).with_context(|| format!("Invalid endpoint: {}", url))
    }

    pub fn user(&self) -> Result<&str> {
        self.backend_user
            .as_deref()
            .ok_or_else(|| anyhow!("Backend {} has no user id configured", self.backend_name))
    }

    pub fn is_ignored(&self, item_id: &str) -> bool {
        self.options.ignore.contains(item_id)
    }
}

/// Failure details carried by a [`Response`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    pub action: String,
    /// Full error chain, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<String>,
}

/// Uniform result envelope returned by every backend action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            status: true,
            error: None,
            extra: Map::new(),
        }
    }

    pub fn failed(error: ErrorInfo) -> Self {
        Self {
            status: false,
            error: Some(error),
            extra: Map::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    pub fn is_successful(&self) -> bool {
        self.status
    }

    /// Integer counter from `extra`, zero when absent.
    pub fn count(&self, key: &str) -> u64 {
        self.extra.get(key).and_then(Value::as_u64).unwrap_or(0)
    }
}

/// Run an action body and turn any error or panic into a failed
/// [`Response`]. Callers branch on `status`, never on propagated faults.
pub async fn try_response<Fut>(context: &Context, action: &str, body: Fut) -> Response
where
    Fut: Future<Output = Result<Response>>,
{
    match AssertUnwindSafe(body).catch_unwind().await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            tracing::error!(
                backend = %context.backend_name,
                action,
                error = %format!("{:#}", e),
                "Action failed"
            );
            Response::failed(ErrorInfo {
                message: e.to_string(),
                action: action.to_string(),
                chain: e.chain().map(|c| c.to_string()).collect(),
            })
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(
                backend = %context.backend_name,
                action,
                error = %message,
                "Action panicked"
            );
            Response::failed(ErrorInfo {
                message,
                action: action.to_string(),
                chain: Vec::new(),
            })
        }
    }
}

/// One page of a library listing
#[derive(Debug, Clone, Default)]
pub struct LibraryPage {
    pub items: Vec<Observation>,
    pub next: Option<PageToken>,
}

/// Position inside a paginated listing. `stage` selects a sub-listing for
/// backends that list movies and episodes separately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageToken {
    pub stage: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    /// Overrides the context's dry-run flag when set.
    pub dry_run: Option<bool>,
    /// Push even when the backend's last-known state already matches.
    pub force: bool,
}

impl UpdateOptions {
    pub fn is_dry_run(&self, context: &Context) -> bool {
        self.dry_run.unwrap_or(context.options.dry_run)
    }
}

#[async_trait]
pub trait FetchLibrary: Send + Sync {
    /// Read one page of the backend's library.
    async fn fetch_library(&self, context: &Context, page: PageToken) -> Result<LibraryPage>;
}

#[async_trait]
pub trait UpdateState: Send + Sync {
    /// Enqueue play-state changes for this backend. Nothing is sent until
    /// the queue runs.
    async fn update_state(
        &self,
        context: &Context,
        changes: &[StateChange],
        queue: &mut RequestQueue,
        opts: &UpdateOptions,
    ) -> Response;
}

#[async_trait]
pub trait UpdateProgress: Send + Sync {
    async fn update_progress(
        &self,
        context: &Context,
        changes: &[ProgressChange],
        queue: &mut RequestQueue,
        opts: &UpdateOptions,
    ) -> Response;
}

/// A backend family adapter
pub trait Backend: FetchLibrary + UpdateState + UpdateProgress {
    fn kind(&self) -> BackendKind;
}

/// Send a prepared request; non-2xx statuses are errors.
pub fn send(request: reqwest::RequestBuilder) -> RequestFuture {
    Box::pin(async move {
        let response = request.send().await.context("Request failed")?;
        response
            .error_for_status()
            .context("Backend rejected the request")?;
        Ok(())
    })
}

/// Shared selection loop for play-state pushes. `build` produces the
/// backend-specific request for `(item id, watched)`.
pub fn queue_state_updates<F>(
    context: &Context,
    changes: &[StateChange],
    queue: &mut RequestQueue,
    opts: &UpdateOptions,
    build: F,
) -> Result<Response>
where
    F: Fn(&Context, &str, bool) -> Result<reqwest::RequestBuilder>,
{
    let dry_run = opts.is_dry_run(context);
    let (mut queued, mut unmatched, mut unchanged, mut planned) = (0u64, 0u64, 0u64, 0u64);

    for change in changes {
        let Some(meta) = change.entity.metadata(&context.backend_name) else {
            unmatched += 1;
            continue;
        };

        if !opts.force && meta.watched == change.watched {
            unchanged += 1;
            continue;
        }

        let info = RequestInfo {
            backend: context.backend_name.clone(),
            entity: change.id,
            item_id: meta.item_id.clone(),
            title: change.entity.name(),
            kind: change.entity.kind,
            action: RequestAction::SetWatched(change.watched),
        };

        if dry_run {
            tracing::info!(
                backend = %info.backend,
                item.id = %info.item_id,
                item.title = %info.title,
                item.kind = %info.kind,
                play_state = play_state(change.watched),
                "Would mark item"
            );
            planned += 1;
            continue;
        }

        let request = build(context, &meta.item_id, change.watched)?;
        queue.add(info, send(request));
        queued += 1;
    }

    Ok(Response::ok()
        .with_extra("queued", queued)
        .with_extra("dry_run", planned)
        .with_extra("unmatched", unmatched)
        .with_extra("unchanged", unchanged))
}

/// Shared selection loop for progress pushes.
pub fn queue_progress_updates<F>(
    context: &Context,
    changes: &[ProgressChange],
    queue: &mut RequestQueue,
    opts: &UpdateOptions,
    build: F,
) -> Result<Response>
where
    F: Fn(&Context, &str, u64) -> Result<reqwest::RequestBuilder>,
{
    let dry_run = opts.is_dry_run(context);
    let (mut queued, mut unmatched, mut planned) = (0u64, 0u64, 0u64);

    for change in changes {
        let Some(meta) = change.entity.metadata(&context.backend_name) else {
            unmatched += 1;
            continue;
        };

        let info = RequestInfo {
            backend: context.backend_name.clone(),
            entity: change.id,
            item_id: meta.item_id.clone(),
            title: change.entity.name(),
            kind: change.entity.kind,
            action: RequestAction::SetProgress(change.position_ms),
        };

        if dry_run {
            tracing::info!(
                backend = %info.backend,
                item.id = %info.item_id,
                item.title = %info.title,
                position_ms = change.position_ms,
                "Would update progress"
            );
            planned += 1;
            continue;
        }

        let request = build(context, &meta.item_id, change.position_ms)?;
        queue.add(info, send(request));
        queued += 1;
    }

    Ok(Response::ok()
        .with_extra("queued", queued)
        .with_extra("dry_run", planned)
        .with_extra("unmatched", unmatched))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::entity::{BackendMeta, Entity, EntityId, GuidMap, MediaKind};
    use chrono::Utc;
    use std::collections::BTreeMap;

    pub(crate) fn context(name: &str) -> Context {
        Context::new(name, BackendKind::Plex, "http://plex.local:32400", reqwest::Client::new())
            .unwrap()
    }

    pub(crate) fn change(id: u64, backend: &str, backend_watched: Option<bool>, desired: bool) -> StateChange {
        let mut per_backend = BTreeMap::new();
        if let Some(watched) = backend_watched {
            per_backend.insert(
                backend.to_string(),
                BackendMeta {
                    item_id: format!("item-{}", id),
                    watched,
                    observed_at: Utc::now(),
                    missing_since: None,
                    progress_ms: None,
                    extra: BTreeMap::new(),
                },
            );
        }
        let mut guids = GuidMap::new();
        guids.insert("imdb".to_string(), format!("tt{}", id));
        StateChange {
            id: EntityId(id),
            entity: Entity {
                key: format!("key-{}", id),
                kind: MediaKind::Movie,
                title: format!("Movie {}", id),
                year: None,
                episode: None,
                guids,
                watched: desired,
                updated_at: Utc::now(),
                unwatched_at: None,
                progress: None,
                detached: false,
                per_backend,
            },
            watched: desired,
        }
    }

    fn build(ctx: &Context, item_id: &str, watched: bool) -> Result<reqwest::RequestBuilder> {
        let path = if watched { "/mark" } else { "/unmark" };
        Ok(ctx.http.get(ctx.endpoint(path)?).query(&[("key", item_id)]))
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("Plex".parse::<BackendKind>().unwrap(), BackendKind::Plex);
        assert_eq!("jellyfin".parse::<BackendKind>().unwrap(), BackendKind::Jellyfin);
        assert_eq!("emby".parse::<BackendKind>().unwrap(), BackendKind::Emby);
        assert!("kodi".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_endpoint_keeps_prefix() {
        let mut ctx = context("plex");
        assert_eq!(
            ctx.endpoint("/:/scrobble").unwrap().as_str(),
            "http://plex.local:32400/:/scrobble"
        );
        ctx.backend_url = reqwest::Url::parse("https://proxy.local/plex/").unwrap();
        assert_eq!(
            ctx.endpoint("library/all").unwrap().as_str(),
            "https://proxy.local/plex/library/all"
        );
    }

    #[test]
    fn test_queue_state_updates_skips_unmatched_and_unchanged() {
        let ctx = context("plex");
        let changes = vec![
            change(1, "plex", Some(false), true),
            change(2, "plex", Some(true), true),
            change(3, "other", Some(false), true),
        ];
        let mut queue = RequestQueue::default();

        let response = queue_state_updates(&ctx, &changes, &mut queue, &UpdateOptions::default(), build).unwrap();
        assert!(response.status);
        assert_eq!(response.count("queued"), 1);
        assert_eq!(response.count("unchanged"), 1);
        assert_eq!(response.count("unmatched"), 1);
        assert_eq!(queue.len(), 1);
        let request = queue.requests().next().unwrap();
        assert_eq!(request.item_id, "item-1");
        assert_eq!(request.action, RequestAction::SetWatched(true));
    }

    #[test]
    fn test_force_pushes_unchanged() {
        let ctx = context("plex");
        let changes = vec![change(1, "plex", Some(true), true), change(2, "plex", None, true)];
        let mut queue = RequestQueue::default();
        let opts = UpdateOptions {
            dry_run: None,
            force: true,
        };

        let response = queue_state_updates(&ctx, &changes, &mut queue, &opts, build).unwrap();
        assert_eq!(response.count("queued"), 1);
        assert_eq!(response.count("unmatched"), 1);
    }

    #[test]
    fn test_dry_run_enqueues_nothing() {
        let mut ctx = context("plex");
        ctx.options.dry_run = true;
        let changes: Vec<_> = (0..4).map(|i| change(i, "plex", Some(false), true)).collect();
        let mut queue = RequestQueue::default();

        let response = queue_state_updates(&ctx, &changes, &mut queue, &UpdateOptions::default(), build).unwrap();
        assert!(queue.is_empty());
        assert_eq!(response.count("dry_run"), 4);
        assert_eq!(response.count("queued"), 0);

        // Option override beats the context flag.
        let opts = UpdateOptions {
            dry_run: Some(false),
            force: false,
        };
        queue_state_updates(&ctx, &changes, &mut queue, &opts, build).unwrap();
        assert_eq!(queue.len(), 4);
    }

    #[tokio::test]
    async fn test_try_response_captures_errors_and_panics() {
        let ctx = context("plex");

        let ok = try_response(&ctx, "test.ok", async { Ok(Response::ok().with_extra("n", 3u64)) }).await;
        assert!(ok.is_successful());
        assert_eq!(ok.count("n"), 3);

        let failed = try_response(&ctx, "test.err", async {
            Err(anyhow!("inner").context("outer"))
        })
        .await;
        assert!(!failed.status);
        let error = failed.error.unwrap();
        assert_eq!(error.message, "outer");
        assert_eq!(error.action, "test.err");
        assert_eq!(error.chain, vec!["outer".to_string(), "inner".to_string()]);

        let panicked = try_response(&ctx, "test.panic", async {
            if ctx.backend_name == "plex" {
                panic!("boom");
            }
            Ok(Response::ok())
        })
        .await;
        assert!(!panicked.status);
        assert_eq!(panicked.error.unwrap().message, "boom");
    }
}
