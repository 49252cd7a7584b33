//! Engine level functionality built on top of the [`library`](crate::library) and [`harness`](crate::harness)
//!
//! Each submodule bundles the processors and types required for one concern. The option structs in
//! [`options`] can be flattened into the option sets of binaries embedding the engine.

pub mod delivery;
pub mod options;
