//! This library crate contains a reliable publish/subscribe layer on top of Redis streams.
//!
//! Submodules have been introduced to split responsibilities. They together form a chain of dependencies
//! from the low-level [`library`], over the executable [`harness`] which runs background processors,
//! up to the high-level delivery [`module`] that dispatches, retries and dead-letters messages.

#![warn(missing_docs)]

pub mod harness;
pub mod library;
pub mod module;
