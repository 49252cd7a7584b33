//! Lua scripts used for atomic stream operations

use crate::library::communication::{FIELD_BODY, FIELD_HEADERS};
use lazy_static::lazy_static;
use redis::Script;

lazy_static! {
    /// Acknowledges a pending entry and, only if it was still pending, appends the dead-letter record
    ///
    /// - `KEYS[1]`: topic
    /// - `KEYS[2]`: dead-letter stream
    /// - `ARGV[1]`: group
    /// - `ARGV[2]`: entry id
    /// - `ARGV[3]`: encoded headers
    /// - `ARGV[4]`: body
    ///
    /// Returns the number of acknowledged entries (0 or 1).
    pub(super) static ref MOVE_TO_DEAD_LETTER: Script = Script::new(&format!(
        r"
        local acked = redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
        if acked == 1 then
            redis.call('XADD', KEYS[2], '*', '{}', ARGV[3], '{}', ARGV[4])
        end
        return acked
        ",
        FIELD_HEADERS, FIELD_BODY
    ));
}
