//! Streaming content reconstruction.
//!
//! - `accumulator`: builds an in-progress assistant message from
//!   `content_block_*` events and tracks tool-use ids.

pub mod accumulator;

pub use accumulator::{BlockDelta, StreamAccumulator, StreamUpdate, ToolNameMap, UNKNOWN_TOOL};
