//! Structures to exchange messages between services using a persistent log
//!
//! Messages are appended to a log-like data structure per topic (usually of limited length where old
//! elements are evicted). Readers join a consumer group and the log store keeps track of which entries
//! have been delivered to which consumer. Every entry has to be acknowledged once processing concludes;
//! until then it remains in the group's pending entries list from where it may be reclaimed by another
//! consumer or, after too many attempts, moved to a dead-letter stream.
//!
//! The [`StreamGateway`] trait describes the operations required from such a log store. Two implementations
//! are provided in the [`implementation`] module: one backed by [Redis Streams](https://redis.io/topics/streams-intro)
//! and an in-memory emulation of the same consumer group semantics.

mod codec;
mod error;
mod gateway;
mod message;

pub mod implementation;

pub use codec::*;
pub use error::*;
pub use gateway::*;
pub use message::*;
