//! Implementations of the [`StreamGateway`](super::StreamGateway) trait

pub mod memory;
pub mod redis;
