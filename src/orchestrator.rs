//! Run sequencing.
//!
//! A run moves through `Fetch → Merge → Diff → Dispatch → Commit → Done`.
//! Only dispatch is concurrent. Diffs for every target are planned before
//! anything is sent, all backends share one dispatch batch, and outcomes are
//! committed to the mapper after the whole batch has settled.

use anyhow::{anyhow, Context as _, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::{BackendRegistry, PageToken, RegisteredBackend, Response, UpdateOptions};
use crate::backup;
use crate::config::Config;
use crate::entity::Observation;
use crate::error::SyncError;
use crate::mapper::{ExportMode, Mapper, ProgressChange, PruneReport, StateChange};
use crate::queue::{Outcome, RequestAction, RequestQueue};
use crate::storage::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Import,
    Export,
    Sync,
}

impl RunMode {
    fn imports(&self) -> bool {
        matches!(self, RunMode::Import | RunMode::Sync)
    }

    fn exports(&self) -> bool {
        matches!(self, RunMode::Export | RunMode::Sync)
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Import => write!(f, "import"),
            RunMode::Export => write!(f, "export"),
            RunMode::Sync => write!(f, "sync"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "import" => Ok(RunMode::Import),
            "export" => Ok(RunMode::Export),
            "sync" => Ok(RunMode::Sync),
            _ => Err(anyhow!("Unknown run mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Fetch,
    Merge,
    Diff,
    Dispatch,
    Commit,
    Done,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Fetch => "fetch",
            Phase::Merge => "merge",
            Phase::Diff => "diff",
            Phase::Dispatch => "dispatch",
            Phase::Commit => "commit",
            Phase::Done => "done",
        };
        write!(f, "{}", name)
    }
}

/// Counters for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub backends_used: usize,
    pub backends_failed: Vec<String>,
    pub received: usize,
    pub created: usize,
    pub merged: usize,
    /// Malformed observations.
    pub skipped: usize,
    /// Observations dropped by a backend's ignore list.
    pub ignored: usize,
    pub detached: usize,
    /// Backend records newly flagged as missing.
    pub missing: usize,
    pub diffs: usize,
    pub full_resyncs: usize,
    pub unmatched: u64,
    pub unchanged: u64,
    pub dry_run: u64,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub progress_updates: usize,
}

impl RunReport {
    fn record_response(&mut self, response: &Response) {
        self.unmatched += response.count("unmatched");
        self.unchanged += response.count("unchanged");
        self.dry_run += response.count("dry_run");
    }

    fn record_outcomes(&mut self, outcomes: &[Outcome]) {
        for outcome in outcomes {
            if outcome.success {
                self.succeeded += 1;
            } else if outcome.cancelled {
                self.cancelled += 1;
            } else {
                self.failed += 1;
            }
        }
    }

    pub fn log(&self, mode: RunMode) {
        tracing::info!(
            mode = %mode,
            backends = self.backends_used,
            backends_failed = self.backends_failed.len(),
            received = self.received,
            created = self.created,
            merged = self.merged,
            skipped = self.skipped + self.ignored,
            detached = self.detached,
            diffs = self.diffs,
            succeeded = self.succeeded,
            failed = self.failed,
            cancelled = self.cancelled,
            dry_run = self.dry_run,
            "Run finished"
        );
    }
}

/// Outcome of an index rebuild
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub entities: usize,
    pub guid_pairs: usize,
    pub compacted: bool,
}

/// Planned updates for one target backend
struct BackendExport {
    backend: RegisteredBackend,
    changes: Vec<StateChange>,
    progress: Vec<ProgressChange>,
    opts: UpdateOptions,
}

pub struct Orchestrator {
    config: Arc<Config>,
    registry: BackendRegistry,
    store: Box<dyn StateStore>,
    mapper: Mapper,
    loaded: bool,
    phase: Phase,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, registry: BackendRegistry, store: Box<dyn StateStore>) -> Self {
        let mapper = Mapper::new(config.mapper_options());
        Self {
            config,
            registry,
            store,
            mapper,
            loaded: false,
            phase: Phase::Done,
        }
    }

    pub fn mapper(&self) -> &Mapper {
        &self.mapper
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!(from = %self.phase, to = %phase, "Run phase");
        self.phase = phase;
    }

    async fn load_state(&mut self) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        let snapshot = self.store.load().await.context("Failed to load state")?;
        tracing::debug!(
            store = self.store.backend_name(),
            entities = snapshot.entities.len(),
            "Loaded persisted state"
        );
        self.mapper.import(snapshot);
        self.loaded = true;
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        self.store
            .save(&self.mapper.export())
            .await
            .context("Failed to persist state")
    }

    /// Execute one import, export or sync pass.
    pub async fn run(&mut self, mode: RunMode) -> Result<RunReport> {
        self.load_state().await?;
        let mut report = RunReport::default();
        tracing::info!(mode = %mode, backends = self.registry.len(), "Starting run");

        let targets: Vec<String> = if mode.imports() {
            self.enter(Phase::Fetch);
            let fetched = self.fetch_all(&mut report).await;
            if fetched.is_empty() {
                self.enter(Phase::Done);
                return Err(SyncError::NoBackends.into());
            }

            self.enter(Phase::Merge);
            self.merge_all(fetched, &mut report)
        } else {
            let names: Vec<String> = self
                .registry
                .iter()
                .filter(|b| b.export)
                .map(|b| b.name().to_string())
                .collect();
            if names.is_empty() {
                self.enter(Phase::Done);
                return Err(SyncError::NoBackends.into());
            }
            report.backends_used = names.len();
            names
        };

        if mode.exports() {
            self.enter(Phase::Diff);
            let plans = self.plan_exports(&targets, &mut report);

            self.enter(Phase::Dispatch);
            let outcomes = self.dispatch(&plans, &mut report).await;

            self.enter(Phase::Commit);
            self.commit(&outcomes, &mut report);
        } else {
            self.enter(Phase::Commit);
        }

        self.persist().await?;
        self.enter(Phase::Done);

        report.log(mode);
        Ok(report)
    }

    /// Read every import-enabled backend. Failing backends drop out of the
    /// pass.
    async fn fetch_all(&self, report: &mut RunReport) -> Vec<(String, Vec<Observation>)> {
        let mut fetched = Vec::new();

        for backend in self.registry.iter().filter(|b| b.import) {
            match Self::fetch_backend(backend).await {
                Ok(items) => {
                    tracing::info!(backend = %backend.name(), items = items.len(), "Fetched library");
                    fetched.push((backend.name().to_string(), items));
                }
                Err(e) => {
                    let error = SyncError::BackendUnavailable {
                        backend: backend.name().to_string(),
                        message: format!("{:#}", e),
                    };
                    tracing::warn!(error = %error, "Excluding backend from this run");
                    report.backends_failed.push(backend.name().to_string());
                }
            }
        }

        report.backends_used = fetched.len();
        fetched
    }

    async fn fetch_backend(backend: &RegisteredBackend) -> Result<Vec<Observation>> {
        let mut page = PageToken::default();
        let mut items = Vec::new();

        loop {
            let result = backend
                .adapter
                .fetch_library(&backend.context, page)
                .await
                .with_context(|| format!("Failed to fetch library page at offset {}", page.offset))?;
            items.extend(result.items);

            match result.next {
                Some(next) if next == page => {
                    return Err(anyhow!("Backend returned the same page token twice"));
                }
                Some(next) => page = next,
                None => break,
            }
        }
        Ok(items)
    }

    /// Ingest fetched listings. Returns the names of the merged backends.
    fn merge_all(&mut self, fetched: Vec<(String, Vec<Observation>)>, report: &mut RunReport) -> Vec<String> {
        let now = Utc::now();
        let mut names = Vec::with_capacity(fetched.len());

        for (name, items) in fetched {
            let seen: HashSet<String> = items.iter().map(|o| o.item_id.clone()).collect();

            let listed = items.len();
            let items: Vec<Observation> = match self.registry.get(&name) {
                Some(backend) => items
                    .into_iter()
                    .filter(|o| !backend.context.is_ignored(&o.item_id))
                    .collect(),
                None => items,
            };
            report.ignored += listed - items.len();

            let ingest = self.mapper.ingest(&name, items);
            report.received += ingest.received;
            report.created += ingest.created;
            report.merged += ingest.merged;
            report.skipped += ingest.skipped;
            report.detached += ingest.detached;
            report.missing += self.mapper.mark_missing(&name, &seen, now);

            tracing::debug!(
                backend = %name,
                received = ingest.received,
                created = ingest.created,
                merged = ingest.merged,
                "Merged observations"
            );
            names.push(name);
        }
        names
    }

    /// Compute the update lists for every export-enabled target.
    fn plan_exports(&self, targets: &[String], report: &mut RunReport) -> Vec<BackendExport> {
        targets
            .iter()
            .filter_map(|name| self.registry.get(name))
            .filter(|backend| backend.export)
            .map(|backend| {
                let plan = self.mapper.plan_export(backend.name(), self.config.export.threshold);
                report.diffs += plan.diff_count;
                if plan.mode == ExportMode::Full {
                    report.full_resyncs += 1;
                }
                BackendExport {
                    backend: backend.clone(),
                    progress: self.mapper.diff_progress(backend.name()),
                    opts: UpdateOptions {
                        dry_run: None,
                        force: plan.mode == ExportMode::Full,
                    },
                    changes: plan.changes,
                }
            })
            .collect()
    }

    /// Let each backend enqueue its updates, then run one batch for all of
    /// them. A backend whose batch fails contributes no requests.
    async fn dispatch(&self, exports: &[BackendExport], report: &mut RunReport) -> Vec<Outcome> {
        let mut queue = RequestQueue::new(self.config.dispatch.concurrency, self.config.dispatch_timeout());

        for export in exports {
            let BackendExport {
                backend,
                changes,
                progress,
                opts,
            } = export;
            let mut staged = RequestQueue::default();

            if !changes.is_empty() {
                let response = backend
                    .adapter
                    .update_state(&backend.context, changes, &mut staged, opts)
                    .await;
                if !Self::accept(backend.name(), &response, &mut staged, report) {
                    continue;
                }
            }

            if !progress.is_empty() {
                let mut staged_progress = RequestQueue::default();
                let response = backend
                    .adapter
                    .update_progress(&backend.context, progress, &mut staged_progress, opts)
                    .await;
                if Self::accept(backend.name(), &response, &mut staged_progress, report) {
                    staged.append(&mut staged_progress);
                }
            }

            queue.append(&mut staged);
        }

        let outcomes = queue.run().await;
        report.record_outcomes(&outcomes);
        outcomes
    }

    fn accept(backend: &str, response: &Response, staged: &mut RequestQueue, report: &mut RunReport) -> bool {
        if response.status {
            report.record_response(response);
            return true;
        }
        let message = response.error.as_ref().map(|e| e.message.as_str()).unwrap_or_default();
        tracing::error!(backend = %backend, error = %message, "Backend rejected the batch");
        staged.reset();
        false
    }

    /// Apply successful outcomes to the mapper. Failed and cancelled
    /// requests leave the backend record as it was.
    fn commit(&mut self, outcomes: &[Outcome], report: &mut RunReport) {
        for outcome in outcomes.iter().filter(|o| o.success) {
            let request = &outcome.request;
            let committed = match request.action {
                RequestAction::SetWatched(watched) => {
                    self.mapper.commit(request.entity, &request.backend, watched)
                }
                RequestAction::SetProgress(position_ms) => {
                    report.progress_updates += 1;
                    self.mapper
                        .commit_progress(request.entity, &request.backend, position_ms)
                }
            };
            if !committed {
                tracing::debug!(
                    error = %SyncError::UnmatchedEntity(request.title.clone()),
                    "Dropped outcome for a record that no longer exists"
                );
            }
        }
    }

    /// Write one JSON backup per configured backend into `dir`.
    pub async fn backup(&mut self, dir: &Path) -> Result<Vec<PathBuf>> {
        self.load_state().await?;
        backup::write_backups(&self.mapper, &self.registry.names(), dir, Utc::now())
    }

    /// Remove stale backend records and persist the result.
    pub async fn prune(&mut self) -> Result<PruneReport> {
        self.load_state().await?;
        let configured: Vec<String> = self.config.backends.iter().map(|b| b.name.clone()).collect();
        let report = self
            .mapper
            .prune(&configured, Utc::now(), self.config.not_found_grace());
        self.persist().await?;
        Ok(report)
    }

    /// Rebuild the in-memory indices from the stored state and compact the
    /// database.
    pub async fn reindex(&mut self) -> Result<IndexReport> {
        self.loaded = false;
        self.load_state().await?;
        self.persist().await?;
        let compacted = self.store.compact().await?;

        let report = IndexReport {
            entities: self.mapper.len(),
            guid_pairs: self.mapper.guid_index_len(),
            compacted,
        };
        tracing::info!(
            entities = report.entities,
            guid_pairs = report.guid_pairs,
            compacted,
            "Rebuilt indexes"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        BackendKind, Context, FetchLibrary, LibraryPage, UpdateProgress, UpdateState,
    };
    use crate::config::BackendConfig;
    use crate::entity::MediaKind;
    use crate::queue::RequestInfo;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use futures_util::FutureExt;
    use std::sync::Mutex;

    /// Serves a fixed library in pages of one and records pushes.
    #[derive(Default)]
    struct FakeBackend {
        library: Vec<Observation>,
        unreachable: bool,
        failing_items: HashSet<String>,
        pushed: Arc<Mutex<Vec<(String, bool)>>>,
    }

    #[async_trait]
    impl FetchLibrary for FakeBackend {
        async fn fetch_library(&self, _ctx: &Context, page: PageToken) -> Result<LibraryPage> {
            if self.unreachable {
                return Err(anyhow!("connection refused"));
            }
            let items: Vec<Observation> = self.library.iter().skip(page.offset).take(1).cloned().collect();
            let next = (page.offset + 1 < self.library.len()).then_some(PageToken {
                stage: 0,
                offset: page.offset + 1,
            });
            Ok(LibraryPage { items, next })
        }
    }

    #[async_trait]
    impl UpdateState for FakeBackend {
        async fn update_state(
            &self,
            ctx: &Context,
            changes: &[StateChange],
            queue: &mut RequestQueue,
            opts: &UpdateOptions,
        ) -> Response {
            let (mut queued, mut planned) = (0u64, 0u64);
            for change in changes {
                let Some(meta) = change.entity.metadata(&ctx.backend_name) else {
                    continue;
                };
                if !opts.force && meta.watched == change.watched {
                    continue;
                }
                if opts.is_dry_run(ctx) {
                    planned += 1;
                    continue;
                }
                let pushed = self.pushed.clone();
                let fails = self.failing_items.contains(&meta.item_id);
                let item_id = meta.item_id.clone();
                let watched = change.watched;
                queue.add(
                    RequestInfo {
                        backend: ctx.backend_name.clone(),
                        entity: change.id,
                        item_id: meta.item_id.clone(),
                        title: change.entity.name(),
                        kind: change.entity.kind,
                        action: RequestAction::SetWatched(watched),
                    },
                    async move {
                        if fails {
                            return Err(anyhow!("HTTP 500"));
                        }
                        pushed.lock().unwrap().push((item_id, watched));
                        Ok(())
                    }
                    .boxed(),
                );
                queued += 1;
            }
            Response::ok()
                .with_extra("queued", queued)
                .with_extra("dry_run", planned)
        }
    }

    #[async_trait]
    impl UpdateProgress for FakeBackend {
        async fn update_progress(
            &self,
            _ctx: &Context,
            _changes: &[ProgressChange],
            _queue: &mut RequestQueue,
            _opts: &UpdateOptions,
        ) -> Response {
            Response::ok()
        }
    }

    impl crate::backend::Backend for FakeBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Plex
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn movie(item: &str, imdb: &str, watched: bool, when: i64) -> Observation {
        Observation::new(item, MediaKind::Movie, format!("Movie {}", imdb))
            .with_guid("imdb", imdb)
            .watched_at(watched, at(when))
    }

    fn register(registry: &mut BackendRegistry, name: &str, fake: FakeBackend) {
        let context = Context::new(name, BackendKind::Plex, "http://fake.local", reqwest::Client::new()).unwrap();
        registry
            .register(RegisteredBackend {
                context,
                adapter: Arc::new(fake),
                import: true,
                export: true,
            })
            .unwrap();
    }

    fn into_dry_run(registry: BackendRegistry) -> BackendRegistry {
        let mut dry = BackendRegistry::new();
        for backend in registry.iter() {
            let mut backend = backend.clone();
            backend.context.options.dry_run = true;
            dry.register(backend).unwrap();
        }
        dry
    }

    fn config(names: &[&str]) -> Arc<Config> {
        let mut config = Config::default();
        config.backends = names
            .iter()
            .map(|n| BackendConfig {
                name: n.to_string(),
                kind: "plex".to_string(),
                ..BackendConfig::default()
            })
            .collect();
        Arc::new(config)
    }

    #[tokio::test]
    async fn test_sync_pushes_newer_state_and_commits() {
        let b_pushed = Arc::new(Mutex::new(Vec::new()));
        let mut registry = BackendRegistry::new();
        register(
            &mut registry,
            "a",
            FakeBackend {
                library: vec![movie("a1", "tt1", true, 10)],
                ..FakeBackend::default()
            },
        );
        register(
            &mut registry,
            "b",
            FakeBackend {
                library: vec![movie("b1", "tt1", false, 0), movie("b2", "tt2", false, 0)],
                pushed: b_pushed.clone(),
                ..FakeBackend::default()
            },
        );

        let mut orchestrator = Orchestrator::new(config(&["a", "b"]), registry, Box::new(MemoryStore::new()));
        let report = orchestrator.run(RunMode::Sync).await.unwrap();

        assert_eq!(report.backends_used, 2);
        assert_eq!(report.created, 2);
        assert_eq!(report.merged, 1);
        assert_eq!(report.diffs, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(*b_pushed.lock().unwrap(), vec![("b1".to_string(), true)]);
        assert_eq!(orchestrator.phase(), Phase::Done);

        let id = orchestrator.mapper().find_local("b", "b1").unwrap();
        assert!(orchestrator.mapper().get(id).unwrap().metadata("b").unwrap().watched);
        assert!(orchestrator.mapper().diff("b").is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_sends_nothing_and_keeps_diff() {
        let b_pushed = Arc::new(Mutex::new(Vec::new()));
        let mut registry = BackendRegistry::new();
        register(
            &mut registry,
            "a",
            FakeBackend {
                library: vec![movie("a1", "tt1", true, 10)],
                ..FakeBackend::default()
            },
        );
        register(
            &mut registry,
            "b",
            FakeBackend {
                library: vec![movie("b1", "tt1", false, 0)],
                pushed: b_pushed.clone(),
                ..FakeBackend::default()
            },
        );

        let mut orchestrator =
            Orchestrator::new(config(&["a", "b"]), into_dry_run(registry), Box::new(MemoryStore::new()));
        let report = orchestrator.run(RunMode::Sync).await.unwrap();

        assert_eq!(report.diffs, 1);
        assert_eq!(report.dry_run, report.diffs as u64);
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failed, 0);
        assert!(b_pushed.lock().unwrap().is_empty());

        let remaining = orchestrator.mapper().diff("b");
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].watched);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_excluded() {
        let mut registry = BackendRegistry::new();
        register(
            &mut registry,
            "up",
            FakeBackend {
                library: vec![movie("1", "tt1", true, 0)],
                ..FakeBackend::default()
            },
        );
        register(
            &mut registry,
            "down",
            FakeBackend {
                unreachable: true,
                ..FakeBackend::default()
            },
        );

        let mut orchestrator = Orchestrator::new(config(&["up", "down"]), registry, Box::new(MemoryStore::new()));
        let report = orchestrator.run(RunMode::Import).await.unwrap();
        assert_eq!(report.backends_used, 1);
        assert_eq!(report.backends_failed, vec!["down".to_string()]);
        assert_eq!(orchestrator.mapper().len(), 1);
    }

    #[tokio::test]
    async fn test_no_available_backends_fails_the_run() {
        let mut registry = BackendRegistry::new();
        register(
            &mut registry,
            "down",
            FakeBackend {
                unreachable: true,
                ..FakeBackend::default()
            },
        );

        let mut orchestrator = Orchestrator::new(config(&["down"]), registry, Box::new(MemoryStore::new()));
        let err = orchestrator.run(RunMode::Sync).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<SyncError>(), Some(SyncError::NoBackends)));

        let mut empty = Orchestrator::new(config(&[]), BackendRegistry::new(), Box::new(MemoryStore::new()));
        assert!(empty.run(RunMode::Export).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_request_is_not_committed() {
        let mut registry = BackendRegistry::new();
        register(
            &mut registry,
            "a",
            FakeBackend {
                library: vec![movie("a1", "tt1", true, 10), movie("a2", "tt2", true, 10)],
                ..FakeBackend::default()
            },
        );
        register(
            &mut registry,
            "b",
            FakeBackend {
                library: vec![movie("b1", "tt1", false, 0), movie("b2", "tt2", false, 0)],
                failing_items: HashSet::from(["b2".to_string()]),
                ..FakeBackend::default()
            },
        );

        let mut orchestrator = Orchestrator::new(config(&["a", "b"]), registry, Box::new(MemoryStore::new()));
        let report = orchestrator.run(RunMode::Sync).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);

        let remaining = orchestrator.mapper().diff("b");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].entity.metadata("b").unwrap().item_id, "b2");
    }

    #[tokio::test]
    async fn test_state_survives_between_runs() {
        let store = Arc::new(MemoryStore::new());

        struct Shared(Arc<MemoryStore>);

        #[async_trait]
        impl StateStore for Shared {
            fn backend_name(&self) -> &str {
                "shared"
            }
            async fn load(&self) -> Result<crate::mapper::Snapshot> {
                self.0.load().await
            }
            async fn save(&self, snapshot: &crate::mapper::Snapshot) -> Result<()> {
                self.0.save(snapshot).await
            }
        }

        let build = || {
            let mut registry = BackendRegistry::new();
            register(
                &mut registry,
                "a",
                FakeBackend {
                    library: vec![movie("a1", "tt1", true, 0)],
                    ..FakeBackend::default()
                },
            );
            registry
        };

        let mut first = Orchestrator::new(config(&["a"]), build(), Box::new(Shared(store.clone())));
        let report = first.run(RunMode::Import).await.unwrap();
        assert_eq!(report.created, 1);

        let mut second = Orchestrator::new(config(&["a"]), build(), Box::new(Shared(store.clone())));
        let report = second.run(RunMode::Import).await.unwrap();
        assert_eq!(report.created, 0);
        assert_eq!(report.merged, 1);
    }

    #[tokio::test]
    async fn test_ignore_list_and_prune() {
        let mut registry = BackendRegistry::new();
        register(
            &mut registry,
            "a",
            FakeBackend {
                library: vec![movie("keep", "tt1", true, 0), movie("skip", "tt2", true, 0)],
                ..FakeBackend::default()
            },
        );
        let mut backend = registry.get("a").cloned().unwrap();
        backend.context.options.ignore.insert("skip".to_string());
        let mut registry = BackendRegistry::new();
        registry.register(backend).unwrap();

        // "gone" is no longer configured, so prune drops its records.
        let mut orchestrator = Orchestrator::new(config(&["gone"]), registry, Box::new(MemoryStore::new()));
        let report = orchestrator.run(RunMode::Import).await.unwrap();
        assert_eq!(report.ignored, 1);
        assert_eq!(orchestrator.mapper().len(), 1);

        let pruned = orchestrator.prune().await.unwrap();
        assert_eq!(pruned.entities_removed, 1);
        assert!(orchestrator.mapper().is_empty());
    }

    #[tokio::test]
    async fn test_backup_and_reindex() {
        let mut registry = BackendRegistry::new();
        register(
            &mut registry,
            "a",
            FakeBackend {
                library: vec![movie("1", "tt1", true, 0), movie("2", "tt2", false, 0)],
                ..FakeBackend::default()
            },
        );
        let mut orchestrator = Orchestrator::new(config(&["a"]), registry, Box::new(MemoryStore::new()));
        orchestrator.run(RunMode::Import).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let paths = orchestrator.backup(dir.path()).await.unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(backup::read_backup(&paths[0]).unwrap().items.len(), 2);

        let index = orchestrator.reindex().await.unwrap();
        assert_eq!(index.entities, 2);
        assert_eq!(index.guid_pairs, 2);
        assert!(!index.compacted);
    }

    #[test]
    fn test_run_mode_parse() {
        assert_eq!("Sync".parse::<RunMode>().unwrap(), RunMode::Sync);
        assert!("both".parse::<RunMode>().is_err());
        assert!(Phase::Fetch < Phase::Done);
    }
}
