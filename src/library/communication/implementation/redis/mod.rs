//! Trait implementations using [`redis`](::redis)

const STREAM_ID_NEW: &str = "*";
const STREAM_ID_HEAD: &str = "0";
const STREAM_ID_TAIL: &str = "$";
const STREAM_ID_ADDITIONS: &str = ">";
const STREAM_ID_MIN: &str = "-";
const STREAM_ID_MAX: &str = "+";

mod connection;
mod gateway;
mod script;

pub use connection::*;
pub use gateway::*;
