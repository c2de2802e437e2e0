//! Upload coordinator: the receiver side of chunked transfers.
//!
//! A [`Coordinator`] keeps a registry of in-flight tasks keyed by task id,
//! with a secondary index from content fingerprint to task id so repeated
//! initialization of the same file resumes the existing task. Chunks are
//! persisted one file per index and reassembled strictly in index order
//! once every index is present.

mod config;
mod coordinator;
mod error;
mod registry;
mod store;
mod sweeper;

pub use config::{
    CoordinatorConfig, DEFAULT_MAX_CHUNK_SIZE, DEFAULT_RETENTION, DEFAULT_SWEEP_INTERVAL,
};
pub use coordinator::{Coordinator, derive_task_id};
pub use error::CoordinatorError;
pub use registry::{TaskEntry, TaskRecord};
pub use sweeper::spawn_sweeper;
