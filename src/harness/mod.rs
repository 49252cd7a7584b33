//! Lifecycle management for long running background processors
//!
//! Every background activity of the engine, be it a consumer reading a topic or a periodic
//! maintenance task, is a [`Processor`]. Processors are handed to a [`ProcessorScheduler`] which
//! runs each of them in its own task, tracks their status and coordinates a graceful shutdown.
//! Processors observe the shutdown through their [`ProcessingContext`].

mod context;
mod processor;
mod scheduler;

pub use context::ProcessingContext;
pub use processor::{Processor, ProcessorError, ProcessorResult};
pub use scheduler::{ProcessorScheduler, ProcessorStatus};
