//! Domain model module declarations.

pub mod message;
pub mod session;
