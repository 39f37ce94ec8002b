//! In-memory reconciliation store.
//!
//! Entities live in an arena keyed by [`EntityId`]. Two auxiliary indices
//! point into it: the guid index for cross-backend identity and a
//! `(backend, item id)` index so re-imports land on the same record even
//! when an item has no guids. Neither index holds entity copies.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::entity::{Entity, EntityId, MediaKind, Observation, Progress};
use crate::error::SyncError;
use crate::guid::{self, GuidIndex};

const SNAPSHOT_VERSION: u32 = 1;

/// How disagreeing backends decide the canonical play state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// A state change wins if it is strictly newer than the last canonical
    /// flip. Ties keep the current state.
    #[default]
    MostRecent,
    /// Watched if any backend reports watched.
    WatchedWins,
}

impl std::fmt::Display for SyncPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPolicy::MostRecent => write!(f, "most_recent"),
            SyncPolicy::WatchedWins => write!(f, "watched_wins"),
        }
    }
}

impl std::str::FromStr for SyncPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "most_recent" | "recent" | "last_writer" => Ok(SyncPolicy::MostRecent),
            "watched_wins" | "watched" => Ok(SyncPolicy::WatchedWins),
            _ => Err(anyhow::anyhow!("Unknown sync policy: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MapperOptions {
    pub policy: SyncPolicy,
    pub track_progress: bool,
}

/// Counters for one `ingest` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub received: usize,
    pub created: usize,
    pub merged: usize,
    /// Malformed observations (no kind).
    pub skipped: usize,
    /// Kind conflicts stored as separate, unmatched records.
    pub detached: usize,
}

/// A backend that disagrees with canonical state for one entity.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub id: EntityId,
    pub entity: Entity,
    /// Desired play state on the target backend.
    pub watched: bool,
}

#[derive(Debug, Clone)]
pub struct ProgressChange {
    pub id: EntityId,
    pub entity: Entity,
    pub position_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportMode {
    Incremental,
    /// Diff volume reached the threshold; every matched entity is re-pushed.
    Full,
}

impl ExportMode {
    pub fn for_diff_count(count: usize, threshold: usize) -> Self {
        if threshold > 0 && count >= threshold {
            ExportMode::Full
        } else {
            ExportMode::Incremental
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportPlan {
    pub mode: ExportMode,
    /// Size of the incremental diff that decided the mode.
    pub diff_count: usize,
    pub changes: Vec<StateChange>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub records_removed: usize,
    pub entities_removed: usize,
}

/// Serializable form of the whole store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub entities: Vec<Entity>,
}

#[derive(Debug, Default)]
pub struct Mapper {
    entities: BTreeMap<EntityId, Entity>,
    guid_index: GuidIndex,
    local_index: HashMap<(String, String), EntityId>,
    next_id: u64,
    options: MapperOptions,
}

impl Mapper {
    pub fn new(options: MapperOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn options(&self) -> MapperOptions {
        self.options
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &Entity)> {
        self.entities.iter().map(|(id, e)| (*id, e))
    }

    /// Handle of the entity holding `item_id` for `backend`.
    pub fn find_local(&self, backend: &str, item_id: &str) -> Option<EntityId> {
        self.local_index
            .get(&(backend.to_string(), item_id.to_string()))
            .copied()
    }

    /// Feed one backend's scan results into the store.
    pub fn ingest<I>(&mut self, backend: &str, observations: I) -> IngestReport
    where
        I: IntoIterator<Item = Observation>,
    {
        let mut report = IngestReport::default();

        for obs in observations {
            report.received += 1;

            let Some(kind) = obs.kind else {
                let error = SyncError::Malformed {
                    backend: backend.to_string(),
                    message: format!("item {} has no media kind", obs.item_id),
                };
                tracing::warn!(item.title = %obs.title, error = %error, "Skipping observation");
                report.skipped += 1;
                continue;
            };

            if let Some(id) = self.find_local(backend, &obs.item_id) {
                if self.entities.get(&id).map(|e| e.kind) == Some(kind) {
                    self.merge(id, backend, obs);
                    report.merged += 1;
                    continue;
                }
                // Backend changed the item's kind; forget the old link.
                self.unlink(backend, id);
            }

            if obs.guids.is_empty() {
                let key = guid::local_key(backend, &obs.item_id);
                self.create(key, kind, backend, obs, false);
                report.created += 1;
                continue;
            }

            let candidates = self.guid_index.candidates(&obs.guids);
            let same_kind = candidates
                .iter()
                .copied()
                .find(|id| self.entities.get(id).map(|e| e.kind) == Some(kind));

            match same_kind {
                Some(id) => {
                    self.merge(id, backend, obs);
                    report.merged += 1;
                }
                None if !candidates.is_empty() => {
                    tracing::warn!(
                        backend = %backend,
                        item.id = %obs.item_id,
                        item.title = %obs.title,
                        item.kind = %kind,
                        "Guids collide with an entity of another kind; keeping it unmatched"
                    );
                    let key = guid::local_key(backend, &obs.item_id);
                    self.create(key, kind, backend, obs, true);
                    report.detached += 1;
                }
                None => {
                    let key = guid::entity_key(kind, &obs.guids);
                    self.create(key, kind, backend, obs, false);
                    report.created += 1;
                }
            }
        }

        tracing::debug!(
            backend = %backend,
            received = report.received,
            created = report.created,
            merged = report.merged,
            skipped = report.skipped,
            detached = report.detached,
            "Ingest complete"
        );
        report
    }

    fn create(
        &mut self,
        key: String,
        kind: MediaKind,
        backend: &str,
        obs: Observation,
        detached: bool,
    ) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;

        let progress = self.initial_progress(&obs);
        let mut per_backend = BTreeMap::new();
        per_backend.insert(backend.to_string(), obs.meta());

        let entity = Entity {
            key,
            kind,
            title: obs.title,
            year: obs.year,
            episode: obs.episode,
            guids: obs.guids,
            watched: obs.watched,
            updated_at: obs.observed_at,
            unwatched_at: None,
            progress,
            detached,
            per_backend,
        };

        if entity.is_matchable() {
            self.guid_index.register(id, &entity.guids);
        }
        self.local_index
            .insert((backend.to_string(), obs.item_id), id);
        self.entities.insert(id, entity);
        id
    }

    fn initial_progress(&self, obs: &Observation) -> Option<Progress> {
        if !self.options.track_progress || obs.watched {
            return None;
        }
        obs.progress_ms.filter(|ms| *ms > 0).map(|position_ms| Progress {
            position_ms,
            updated_at: obs.observed_at,
        })
    }

    /// Union guids, upsert the backend record, then re-derive canonical state.
    fn merge(&mut self, id: EntityId, backend: &str, obs: Observation) {
        let policy = self.options.policy;
        let track_progress = self.options.track_progress;
        let Some(entity) = self.entities.get_mut(&id) else {
            return;
        };

        guid::union_first_seen(&mut entity.guids, &obs.guids);
        if entity.title.is_empty() {
            entity.title = obs.title.clone();
        }
        if entity.year.is_none() {
            entity.year = obs.year;
        }
        if entity.episode.is_none() {
            entity.episode = obs.episode.clone();
        }

        let prior = entity
            .per_backend
            .insert(backend.to_string(), obs.meta())
            .map(|meta| meta.watched);

        let is_change = prior.map_or(true, |was| was != obs.watched);
        if is_change {
            apply_policy(entity, policy, prior, obs.watched, obs.observed_at);
        }

        if track_progress {
            update_progress(entity, &obs);
        }
        if entity.watched {
            entity.progress = None;
        }

        if entity.is_matchable() {
            self.guid_index.register(id, &entity.guids);
            self.guid_index.register(id, &obs.guids);
        }
        self.local_index
            .insert((backend.to_string(), obs.item_id), id);
    }

    fn unlink(&mut self, backend: &str, id: EntityId) {
        if let Some(entity) = self.entities.get_mut(&id) {
            if let Some(meta) = entity.per_backend.remove(backend) {
                self.local_index
                    .remove(&(backend.to_string(), meta.item_id));
            }
        }
    }

    /// Entities whose record on `target` disagrees with canonical state.
    pub fn diff(&self, target: &str) -> Vec<StateChange> {
        self.entities
            .iter()
            .filter(|(_, e)| e.is_matchable())
            .filter_map(|(id, e)| {
                let meta = e.metadata(target)?;
                (meta.watched != e.watched).then(|| StateChange {
                    id: *id,
                    entity: e.clone(),
                    watched: e.watched,
                })
            })
            .collect()
    }

    /// Every matched entity, including ones the target has never reported.
    pub fn full_diff(&self) -> Vec<StateChange> {
        self.entities
            .iter()
            .filter(|(_, e)| e.is_matchable())
            .map(|(id, e)| StateChange {
                id: *id,
                entity: e.clone(),
                watched: e.watched,
            })
            .collect()
    }

    /// Decide between incremental and full-resync export for `target`.
    pub fn plan_export(&self, target: &str, threshold: usize) -> ExportPlan {
        let changes = self.diff(target);
        let diff_count = changes.len();
        let mode = ExportMode::for_diff_count(diff_count, threshold);

        match mode {
            ExportMode::Incremental => ExportPlan {
                mode,
                diff_count,
                changes,
            },
            ExportMode::Full => {
                tracing::info!(
                    backend = %target,
                    diffs = diff_count,
                    threshold,
                    "Diff count reached threshold, switching to full export"
                );
                ExportPlan {
                    mode,
                    diff_count,
                    changes: self.full_diff(),
                }
            }
        }
    }

    /// Unwatched entities whose position on `target` lags canonical progress.
    pub fn diff_progress(&self, target: &str) -> Vec<ProgressChange> {
        if !self.options.track_progress {
            return Vec::new();
        }
        self.entities
            .iter()
            .filter(|(_, e)| e.is_matchable() && !e.watched)
            .filter_map(|(id, e)| {
                let progress = e.progress?;
                let meta = e.metadata(target)?;
                if meta.watched || meta.progress_ms == Some(progress.position_ms) {
                    return None;
                }
                Some(ProgressChange {
                    id: *id,
                    entity: e.clone(),
                    position_ms: progress.position_ms,
                })
            })
            .collect()
    }

    /// Record a successful push. Returns false if the entity or its backend
    /// record no longer exists.
    pub fn commit(&mut self, id: EntityId, backend: &str, watched: bool) -> bool {
        match self
            .entities
            .get_mut(&id)
            .and_then(|e| e.per_backend.get_mut(backend))
        {
            Some(meta) => {
                meta.watched = watched;
                meta.observed_at = Utc::now();
                if watched {
                    meta.progress_ms = None;
                }
                true
            }
            None => false,
        }
    }

    pub fn commit_progress(&mut self, id: EntityId, backend: &str, position_ms: u64) -> bool {
        match self
            .entities
            .get_mut(&id)
            .and_then(|e| e.per_backend.get_mut(backend))
        {
            Some(meta) => {
                meta.progress_ms = Some(position_ms);
                true
            }
            None => false,
        }
    }

    /// Flag records of `backend` absent from a complete listing; clear the
    /// flag on records that are present. Returns the number newly flagged.
    pub fn mark_missing(
        &mut self,
        backend: &str,
        seen: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> usize {
        let mut flagged = 0;
        for entity in self.entities.values_mut() {
            if let Some(meta) = entity.per_backend.get_mut(backend) {
                if seen.contains(&meta.item_id) {
                    meta.missing_since = None;
                } else if meta.missing_since.is_none() {
                    meta.missing_since = Some(now);
                    flagged += 1;
                }
            }
        }
        flagged
    }

    /// Drop records of unconfigured backends and records missing longer
    /// than `grace`. Entities left without any record are deleted.
    pub fn prune(&mut self, configured: &[String], now: DateTime<Utc>, grace: Duration) -> PruneReport {
        let mut report = PruneReport::default();
        let mut removed_links = Vec::new();

        for entity in self.entities.values_mut() {
            entity.per_backend.retain(|backend, meta| {
                let keep = configured.iter().any(|b| b == backend)
                    && meta
                        .missing_since
                        .map_or(true, |since| now.signed_duration_since(since) <= grace);
                if !keep {
                    removed_links.push((backend.clone(), meta.item_id.clone()));
                }
                keep
            });
        }
        report.records_removed = removed_links.len();
        for link in removed_links {
            self.local_index.remove(&link);
        }

        let empty: Vec<EntityId> = self
            .entities
            .iter()
            .filter(|(_, e)| e.per_backend.is_empty())
            .map(|(id, _)| *id)
            .collect();
        for id in &empty {
            self.entities.remove(id);
        }
        report.entities_removed = empty.len();
        // Survivors may hold pairs the deleted entities registered first.
        if !empty.is_empty() {
            self.rebuild_guid_index();
        }

        if report.records_removed > 0 {
            tracing::info!(
                records = report.records_removed,
                entities = report.entities_removed,
                "Pruned stale backend records"
            );
        }
        report
    }

    pub fn export(&self) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            entities: self.entities.values().cloned().collect(),
        }
    }

    /// Replace the store contents with `snapshot` and rebuild both indices.
    pub fn import(&mut self, snapshot: Snapshot) {
        self.entities.clear();
        self.guid_index.clear();
        self.local_index.clear();
        self.next_id = 0;

        for entity in snapshot.entities {
            let id = EntityId(self.next_id);
            self.next_id += 1;
            if entity.is_matchable() {
                self.guid_index.register(id, &entity.guids);
            }
            for (backend, meta) in &entity.per_backend {
                self.local_index
                    .insert((backend.clone(), meta.item_id.clone()), id);
            }
            self.entities.insert(id, entity);
        }
    }

    fn rebuild_guid_index(&mut self) {
        self.guid_index.clear();
        for (id, entity) in &self.entities {
            if entity.is_matchable() {
                self.guid_index.register(*id, &entity.guids);
            }
        }
    }

    pub fn guid_index_len(&self) -> usize {
        self.guid_index.len()
    }
}

/// `prior` is the backend's last known state, `None` on its first report.
fn apply_policy(
    entity: &mut Entity,
    policy: SyncPolicy,
    prior: Option<bool>,
    watched: bool,
    at: DateTime<Utc>,
) {
    match policy {
        SyncPolicy::MostRecent => {
            if entity.watched == watched {
                return;
            }
            if watched {
                if entity.unwatched_at.map_or(true, |flip| at > flip) {
                    entity.watched = true;
                    entity.updated_at = at;
                }
            } else if prior == Some(true) && at > entity.updated_at {
                // Only a real watched -> unwatched change on a backend can
                // clear canonical state.
                entity.watched = false;
                entity.updated_at = at;
                entity.unwatched_at = Some(at);
            }
        }
        SyncPolicy::WatchedWins => {
            let any_watched = entity.per_backend.values().any(|m| m.watched);
            if entity.watched != any_watched {
                entity.watched = any_watched;
                entity.updated_at = entity.updated_at.max(at);
                if !any_watched {
                    entity.unwatched_at = Some(entity.updated_at);
                }
            }
        }
    }
}

fn update_progress(entity: &mut Entity, obs: &Observation) {
    if obs.watched {
        return;
    }
    let Some(position_ms) = obs.progress_ms.filter(|ms| *ms > 0) else {
        return;
    };
    let newer = entity
        .progress
        .map_or(true, |p| obs.observed_at > p.updated_at);
    if newer {
        entity.progress = Some(Progress {
            position_ms,
            updated_at: obs.observed_at,
        });
    }
}
