//! quire-sync - two-way sync core for Quire
//!
//! Pulls remote changes into a local store, resolves conflicts with local
//! edits, and pushes local changes back, for an account and every notebook
//! shared into it. [`SyncCoordinator`] is the entry point; storage, the
//! remote service and credential storage are supplied by the embedder
//! through the [`store`], [`remote`] and [`auth`] traits.

pub mod applier;
pub mod auth;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod error;
pub mod models;
pub mod remote;
pub mod report;
pub mod retry;
pub mod sender;
pub mod session;
pub mod state;
pub mod store;
pub mod util;

#[cfg(test)]
mod test_support;

pub use config::SyncConfig;
pub use coordinator::SyncCoordinator;
pub use error::{Error, ErrorClass, ErrorContext, Result};
pub use report::{ItemError, SyncPhase, SyncProgress, SyncReport};
pub use session::CancelFlag;
