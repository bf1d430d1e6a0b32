//! Optional `SQLite` store for session metadata.
//!
//! Only session summaries are written; message history lives in memory.

pub mod db;
pub mod retention;
pub mod schema;
pub mod session_repo;

pub use session_repo::{SessionRecord, SessionRepo};
