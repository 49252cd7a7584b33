use super::{EntryId, GatewayError, StreamEntry, TransportMessage};
use async_trait::async_trait;
use std::time::Duration;

/// Location within a topic from where a newly created consumer group starts consuming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueLocation {
    /// Start of the topic (not necessarily the first entry ever appended as a topic may be trimmed)
    Head,
    /// End of the topic (exclusive of the last entry)
    Tail,
}

impl Default for QueueLocation {
    /// Uses [`QueueLocation::Head`] so that no entry published before the group existed is lost
    fn default() -> Self {
        QueueLocation::Head
    }
}

impl std::str::FromStr for QueueLocation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "head" => Ok(QueueLocation::Head),
            "tail" => Ok(QueueLocation::Tail),
            other => Err(format!("unknown queue location '{}'", other)),
        }
    }
}

/// Snapshot of an entry in a consumer group's pending entries list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    /// Id of the delivered entry
    pub id: EntryId,
    /// Consumer the entry has last been delivered to
    pub consumer: String,
    /// Time elapsed since the last delivery attempt
    pub idle: Duration,
    /// Number of times the entry has been delivered
    pub deliveries: u64,
}

/// Operation set over an append-only log store with consumer group semantics
///
/// Implementations have to guarantee the semantics of Redis consumer groups: every group keeps a
/// delivery cursor and a pending entries list per topic, an entry is pending from the moment it is
/// delivered until it is acknowledged, and claiming an entry only succeeds when it has been idle for
/// at least the requested time. These guarantees are what makes multiple cooperating processes safe,
/// nothing above this trait re-implements them.
#[async_trait]
pub trait StreamGateway: Send + Sync {
    /// Appends a message to a topic, optionally trimming it to approximately `max_len` entries
    async fn append(
        &self,
        topic: &str,
        message: &TransportMessage,
        max_len: Option<usize>,
    ) -> Result<EntryId, GatewayError>;

    /// Reads entries that have never been delivered to the group, waiting up to `block` for new ones
    ///
    /// Returned entries are added to the group's pending entries list under the given consumer.
    async fn read_new(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, GatewayError>;

    /// Re-reads entries already pending for `consumer` whose id is greater than `after`
    ///
    /// Used to resume work that has been delivered to a consumer of the same name before it
    /// restarted. Every returned entry counts as another delivery attempt.
    async fn read_pending(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        after: &EntryId,
    ) -> Result<Vec<StreamEntry>, GatewayError>;

    /// Removes an entry from the pending entries list, returns whether it was pending
    async fn acknowledge(&self, topic: &str, group: &str, id: &EntryId)
        -> Result<bool, GatewayError>;

    /// Lists pending entries that have been idle for at least `idle_threshold`
    async fn list_pending(
        &self,
        topic: &str,
        group: &str,
        idle_threshold: Duration,
    ) -> Result<Vec<PendingEntry>, GatewayError>;

    /// Transfers ownership of pending entries idle for at least `min_idle` to `consumer`
    ///
    /// Claiming counts as a delivery attempt. Entries that are no longer eligible are silently
    /// skipped, thus a claim that misses is not an error.
    async fn claim(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<StreamEntry>, GatewayError>;

    /// Retrieves the content of a single entry
    async fn fetch_entry(
        &self,
        topic: &str,
        group: &str,
        id: &EntryId,
    ) -> Result<Option<StreamEntry>, GatewayError>;

    /// Atomically acknowledges the pending entry and appends `message` to the topic's dead-letter stream
    ///
    /// The append only happens when the acknowledgement removed the entry from the pending list so
    /// an entry is never dead-lettered twice. Returns whether the transfer took place.
    async fn move_to_dead_letter(
        &self,
        topic: &str,
        group: &str,
        id: &EntryId,
        message: &TransportMessage,
    ) -> Result<bool, GatewayError>;

    /// Trims a topic to approximately `max_len` entries and returns how many were evicted
    async fn trim(&self, topic: &str, max_len: usize) -> Result<u64, GatewayError>;

    /// Ensures the group exists on every candidate topic and returns the topics it may consume
    async fn resolve_topics(
        &self,
        group: &str,
        candidates: &[String],
    ) -> Result<Vec<String>, GatewayError>;

    /// Checks that the log store is reachable
    async fn ping(&self) -> Result<(), GatewayError>;
}
