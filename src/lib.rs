#![forbid(unsafe_code)]

//! Session engine driving an external coding-agent CLI over line-delimited
//! stream-json on its standard streams.
//!
//! - [`transport`]: spawns one agent process per exchange and frames its I/O.
//! - [`protocol`]: decodes raw JSON objects into typed [`models::message::Message`]s.
//! - [`stream`]: rebuilds assistant messages from partial stream events.
//! - [`registry`]: owns sessions, runs exchanges and emits [`registry::SessionEvent`]s.
//! - [`persistence`]: optional `SQLite` store of session summaries.

pub mod config;
pub mod errors;
pub mod models;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod stream;
pub mod transport;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
