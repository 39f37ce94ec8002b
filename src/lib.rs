//! Play-state reconciliation across Plex, Jellyfin and Emby servers.

pub mod backend;
pub mod backup;
pub mod config;
pub mod entity;
pub mod error;
pub mod guid;
pub mod logging;
pub mod mapper;
pub mod orchestrator;
pub mod queue;
pub mod storage;

pub use backend::{Backend, BackendKind, BackendRegistry, Context, Response};
pub use config::Config;
pub use entity::{Entity, EntityId, MediaKind, Observation};
pub use error::SyncError;
pub use mapper::{Mapper, MapperOptions, SyncPolicy};
pub use orchestrator::{Orchestrator, RunMode, RunReport};
pub use queue::{Outcome, RequestQueue};
