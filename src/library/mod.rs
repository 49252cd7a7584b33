//! Independent and project agnostic libraries
//!
//! Ideally, any of the library submodules in this module can be extracted into their own crate
//! at any given time. Libraries in this module have been developed with reliable message delivery
//! in mind, however, they are in no way bound to it and everything engine specific lives in the
//! [`module`](super::module) tree.

pub mod communication;
pub mod helpers;
pub mod pool;

/// Generic error type
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result with no value and a [`BoxedError`]
pub type EmptyResult = Result<(), BoxedError>;
