//! Stream-json wire protocol.
//!
//! - `decoder`: raw JSON object → [`Message`](crate::models::message::Message).
//!
//! The outbound direction is a single line shape and lives with the
//! transport writer ([`crate::transport::writer`]).

pub mod decoder;

pub use decoder::parse;
