//! Outbound request queue.
//!
//! Backend actions enqueue mutation requests here instead of executing them.
//! [`RequestQueue::run`] dispatches everything concurrently, keeps calls for
//! the same entity on the same backend in insertion order, and reports one
//! [`Outcome`] per request. A failing request never affects its siblings.

use anyhow::anyhow;
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use crate::entity::{play_state, EntityId, MediaKind};
use crate::error::SyncError;

pub const DEFAULT_CONCURRENCY: usize = 8;

/// A pending backend call. Resolves to `Ok(())` when the backend accepted it.
pub type RequestFuture = BoxFuture<'static, anyhow::Result<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAction {
    SetWatched(bool),
    SetProgress(u64),
}

/// Correlation metadata attached to every queued request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub backend: String,
    pub entity: EntityId,
    pub item_id: String,
    pub title: String,
    pub kind: MediaKind,
    pub action: RequestAction,
}

impl RequestInfo {
    pub fn play_state(&self) -> &'static str {
        match self.action {
            RequestAction::SetWatched(watched) => play_state(watched),
            RequestAction::SetProgress(_) => "in progress",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Outcome {
    pub request: RequestInfo,
    pub success: bool,
    pub error: Option<String>,
    /// The run deadline passed before the request completed.
    pub cancelled: bool,
}

impl Outcome {
    fn finished(request: RequestInfo, result: anyhow::Result<()>) -> Self {
        match result {
            Ok(()) => Self {
                request,
                success: true,
                error: None,
                cancelled: false,
            },
            Err(e) => {
                let error = SyncError::RequestFailure {
                    backend: request.backend.clone(),
                    item_id: request.item_id.clone(),
                    message: format!("{:#}", e),
                };
                Self {
                    request,
                    success: false,
                    error: Some(error.to_string()),
                    cancelled: false,
                }
            }
        }
    }

    fn cancelled(request: RequestInfo) -> Self {
        Self {
            request,
            success: false,
            error: Some(SyncError::Cancelled.to_string()),
            cancelled: true,
        }
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

struct Pending {
    seq: usize,
    info: RequestInfo,
    fut: RequestFuture,
}

pub struct RequestQueue {
    pending: Vec<Pending>,
    next_seq: usize,
    concurrency: usize,
    timeout: Option<Duration>,
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY, None)
    }
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("pending", &self.pending.len())
            .field("concurrency", &self.concurrency)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RequestQueue {
    pub fn new(concurrency: usize, timeout: Option<Duration>) -> Self {
        Self {
            pending: Vec::new(),
            next_seq: 0,
            concurrency: concurrency.max(1),
            timeout,
        }
    }

    pub fn add(&mut self, info: RequestInfo, fut: RequestFuture) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push(Pending { seq, info, fut });
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Move everything queued in `other` to the end of this queue.
    pub fn append(&mut self, other: &mut RequestQueue) {
        for p in other.pending.drain(..) {
            self.add(p.info, p.fut);
        }
    }

    /// Metadata of the queued requests, in insertion order.
    pub fn requests(&self) -> impl Iterator<Item = &RequestInfo> {
        self.pending.iter().map(|p| &p.info)
    }

    /// Drop everything queued without executing it.
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    /// Execute all queued requests and wait for them. Requests still running
    /// when the timeout hits are dropped and reported as cancelled.
    pub async fn run(&mut self) -> Vec<Outcome> {
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return Vec::new();
        }

        let infos: HashMap<usize, RequestInfo> = pending
            .iter()
            .map(|p| (p.seq, p.info.clone()))
            .collect();

        // One sequential lane per (backend, entity); lanes run concurrently.
        let mut lanes: Vec<Vec<Pending>> = Vec::new();
        let mut lane_of: HashMap<(String, EntityId), usize> = HashMap::new();
        for p in pending {
            let key = (p.info.backend.clone(), p.info.entity);
            let lane = *lane_of.entry(key).or_insert_with(|| {
                lanes.push(Vec::new());
                lanes.len() - 1
            });
            lanes[lane].push(p);
        }

        let total = infos.len();
        tracing::debug!(requests = total, lanes = lanes.len(), "Dispatching queued requests");

        let lane_streams = lanes.into_iter().map(|lane| -> BoxStream<'static, (usize, Outcome)> {
            stream::iter(lane)
                .then(|p| async move {
                    let result = match AssertUnwindSafe(p.fut).catch_unwind().await {
                        Ok(result) => result,
                        Err(panic) => Err(anyhow!("request panicked: {}", panic_message(panic.as_ref()))),
                    };
                    (p.seq, Outcome::finished(p.info, result))
                })
                .boxed()
        });
        let mut outcomes_stream = stream::iter(lane_streams)
            .flatten_unordered(self.concurrency)
            .boxed();

        let deadline = self.timeout.map(|t| tokio::time::Instant::now() + t);
        let mut finished: Vec<(usize, Outcome)> = Vec::with_capacity(total);

        loop {
            let next = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, outcomes_stream.next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            tracing::warn!(
                                completed = finished.len(),
                                outstanding = total - finished.len(),
                                "Dispatch timed out, cancelling outstanding requests"
                            );
                            break;
                        }
                    }
                }
                None => outcomes_stream.next().await,
            };
            match next {
                Some(item) => finished.push(item),
                None => break,
            }
        }
        drop(outcomes_stream);

        let done: HashSet<usize> = finished.iter().map(|(seq, _)| *seq).collect();
        for (seq, info) in infos {
            if !done.contains(&seq) {
                finished.push((seq, Outcome::cancelled(info)));
            }
        }
        finished.sort_by_key(|(seq, _)| *seq);

        for (_, outcome) in &finished {
            if !outcome.success && !outcome.cancelled {
                tracing::error!(
                    backend = %outcome.request.backend,
                    item.id = %outcome.request.item_id,
                    item.title = %outcome.request.title,
                    item.kind = %outcome.request.kind,
                    play_state = outcome.request.play_state(),
                    error = outcome.error.as_deref().unwrap_or_default(),
                    "Request failed"
                );
            }
        }

        finished.into_iter().map(|(_, outcome)| outcome).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::{Arc, Mutex};

    fn info(entity: u64, item: &str) -> RequestInfo {
        RequestInfo {
            backend: "plex".to_string(),
            entity: EntityId(entity),
            item_id: item.to_string(),
            title: format!("Item {}", item),
            kind: MediaKind::Movie,
            action: RequestAction::SetWatched(true),
        }
    }

    #[tokio::test]
    async fn test_empty_run() {
        let mut queue = RequestQueue::default();
        assert!(queue.run().await.is_empty());
    }

    #[tokio::test]
    async fn test_one_failure_does_not_affect_others() {
        let mut queue = RequestQueue::new(4, None);
        for i in 0..5u64 {
            let fut: RequestFuture = if i == 2 {
                async { Err(anyhow::anyhow!("HTTP 500")) }.boxed()
            } else {
                async { Ok(()) }.boxed()
            };
            queue.add(info(i, &i.to_string()), fut);
        }
        assert_eq!(queue.len(), 5);

        let outcomes = queue.run().await;
        assert!(queue.is_empty());
        assert_eq!(outcomes.len(), 5);
        assert_eq!(outcomes.iter().filter(|o| o.success).count(), 4);
        let failed = &outcomes[2];
        assert!(!failed.success);
        assert_eq!(failed.request.item_id, "2");
        assert!(failed.error.as_deref().unwrap().contains("HTTP 500"));
    }

    fn explode() -> anyhow::Result<()> {
        panic!("bad body")
    }

    #[tokio::test]
    async fn test_panicking_request_is_a_failed_outcome() {
        let mut queue = RequestQueue::new(4, None);
        for i in 0..3u64 {
            let fut: RequestFuture = if i == 1 {
                async { explode() }.boxed()
            } else {
                async { Ok(()) }.boxed()
            };
            queue.add(info(i, &i.to_string()), fut);
        }

        let outcomes = queue.run().await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].success);
        assert!(outcomes[2].success);
        assert!(!outcomes[1].success);
        assert!(!outcomes[1].cancelled);
        assert!(outcomes[1].error.as_deref().unwrap().contains("bad body"));
    }

    #[tokio::test]
    async fn test_same_entity_requests_keep_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = RequestQueue::new(8, None);
        for step in 0..3u64 {
            let log = log.clone();
            let fut = async move {
                // Earlier steps sleep longer; order must still hold.
                tokio::time::sleep(Duration::from_millis(15 - step * 5)).await;
                log.lock().unwrap().push(step);
                Ok(())
            }
            .boxed();
            queue.add(info(7, &step.to_string()), fut);
        }

        let outcomes = queue.run().await;
        assert!(outcomes.iter().all(|o| o.success));
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_timeout_cancels_outstanding() {
        let mut queue = RequestQueue::new(4, Some(Duration::from_millis(50)));
        queue.add(info(1, "fast"), async { Ok(()) }.boxed());
        queue.add(
            info(2, "slow"),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }
            .boxed(),
        );

        let outcomes = queue.run().await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);
        assert!(outcomes[1].cancelled);
    }

    #[tokio::test]
    async fn test_append_keeps_order() {
        let mut queue = RequestQueue::default();
        let mut staged = RequestQueue::default();
        queue.add(info(1, "first"), async { Ok(()) }.boxed());
        staged.add(info(2, "second"), async { Ok(()) }.boxed());
        staged.add(info(3, "third"), async { Ok(()) }.boxed());

        queue.append(&mut staged);
        assert!(staged.is_empty());
        let ids: Vec<_> = queue.requests().map(|r| r.item_id.clone()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
        assert_eq!(queue.run().await.len(), 3);
    }

    #[tokio::test]
    async fn test_reset_discards_pending() {
        let mut queue = RequestQueue::default();
        queue.add(info(1, "1"), async { Ok(()) }.boxed());
        assert_eq!(queue.requests().count(), 1);
        queue.reset();
        assert!(queue.run().await.is_empty());
    }
}
