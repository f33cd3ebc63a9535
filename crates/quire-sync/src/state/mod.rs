//! Sync state owned by the core: checkpoints, sync times and cached
//! endpoints, persisted in a small libSQL database.

mod database;
mod migrations;
mod repository;

pub use database::Database;
pub use repository::{Checkpoint, EndpointRecord, LibSqlSyncStateRepository, SyncStateRepository};
