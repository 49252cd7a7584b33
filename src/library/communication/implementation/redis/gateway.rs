use super::script::MOVE_TO_DEAD_LETTER;
use super::{
    RedisConnector, STREAM_ID_ADDITIONS, STREAM_ID_HEAD, STREAM_ID_MAX, STREAM_ID_MIN,
    STREAM_ID_NEW, STREAM_ID_TAIL,
};
use crate::library::communication::{
    dead_letter_topic, EntryId, GatewayError, PendingEntry, QueueLocation, StreamEntry,
    StreamGateway, TransportMessage,
};
use crate::library::pool::{ConnectionPool, LeasePolicy, PoolStatus, Replenish};
use async_trait::async_trait;
use redis::streams::{
    StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamRangeReply,
    StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, RedisError, RedisResult};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, trace};

const PENDING_PAGE_SIZE: usize = 100;

/// Error code returned when a consumer group is missing
const NO_GROUP: &str = "NOGROUP";
/// Error code returned when a consumer group already exists
const BUSY_GROUP: &str = "BUSYGROUP";

/// [`StreamGateway`] backed by redis streams
///
/// Regular commands are spread over a command pool while blocking reads use a dedicated pool so
/// that a reader waiting for new entries never holds up acknowledgements or publishes.
pub struct RedisStreamGateway {
    commands: ConnectionPool<RedisConnector>,
    blocking: ConnectionPool<RedisConnector>,
    group_start: QueueLocation,
}

impl RedisStreamGateway {
    /// Creates a gateway from existing pools
    pub fn new(
        commands: ConnectionPool<RedisConnector>,
        blocking: ConnectionPool<RedisConnector>,
    ) -> Self {
        Self {
            commands,
            blocking,
            group_start: QueueLocation::default(),
        }
    }

    /// Creates a gateway with lazily connecting pools of the given sizes, both using `connector`
    pub fn open(
        connector: RedisConnector,
        pool_size: usize,
        blocking_pool_size: usize,
        policy: LeasePolicy,
    ) -> Self {
        let commands = ConnectionPool::new(connector.clone(), pool_size, policy);
        let blocking = ConnectionPool::new(connector, blocking_pool_size, policy);

        Self::new(commands, blocking)
    }

    /// Sets where consumer groups created by this gateway start consuming
    pub fn with_group_start(mut self, location: QueueLocation) -> Self {
        self.group_start = location;
        self
    }

    /// Pool used for regular commands
    pub fn pool(&self) -> &ConnectionPool<RedisConnector> {
        &self.commands
    }

    /// Pool used for blocking reads
    pub fn blocking_pool(&self) -> &ConnectionPool<RedisConnector> {
        &self.blocking
    }
}

#[async_trait]
impl Replenish for RedisStreamGateway {
    async fn replenish(&self) -> usize {
        self.commands.refill().await + self.blocking.refill().await
    }

    /// Status of both pools, commands first
    fn capacity(&self) -> Vec<PoolStatus> {
        vec![self.commands.status(), self.blocking.status()]
    }
}

fn classify(error: RedisError, topic: &str, group: &str) -> GatewayError {
    if error.code() == Some(NO_GROUP) {
        GatewayError::NoGroup {
            topic: topic.to_owned(),
            group: group.to_owned(),
        }
    } else {
        error.into()
    }
}

fn into_entry(stream_id: StreamId) -> Result<StreamEntry, GatewayError> {
    let id = stream_id.id.parse()?;
    let mut fields = HashMap::with_capacity(stream_id.map.len());

    for (field, value) in stream_id.map {
        let value: Vec<u8> = redis::from_redis_value(&value)?;
        fields.insert(field, value);
    }

    Ok(StreamEntry { id, fields })
}

fn into_entries(ids: Vec<StreamId>) -> Result<Vec<StreamEntry>, GatewayError> {
    ids.into_iter().map(into_entry).collect()
}

fn as_millis(duration: Duration) -> usize {
    duration.as_millis().min(usize::MAX as u128) as usize
}

#[async_trait]
impl StreamGateway for RedisStreamGateway {
    #[instrument(skip(self, message), fields(name = message.name()))]
    async fn append(
        &self,
        topic: &str,
        message: &TransportMessage,
        max_len: Option<usize>,
    ) -> Result<EntryId, GatewayError> {
        let fields = message.to_fields()?;
        let mut con = self.commands.lease().await?;

        let id: String = match max_len {
            Some(len) => {
                con.xadd_maxlen(topic, StreamMaxlen::Approx(len), STREAM_ID_NEW, &fields)
                    .await?
            }
            None => con.xadd(topic, STREAM_ID_NEW, &fields).await?,
        };

        trace!(%id, "Appended entry");
        Ok(id.parse()?)
    }

    async fn read_new(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, GatewayError> {
        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);

        // A block time of zero would wait indefinitely
        if !block.is_zero() {
            options = options.block(as_millis(block).max(1));
        }

        let mut con = self.blocking.lease().await?;
        let reply: Option<StreamReadReply> = con
            .xread_options(&[topic], &[STREAM_ID_ADDITIONS], options)
            .await
            .map_err(|e| classify(e, topic, group))?;

        match reply {
            Some(reply) => {
                let ids = reply.keys.into_iter().flat_map(|key| key.ids).collect();
                into_entries(ids)
            }
            None => Ok(Vec::new()),
        }
    }

    async fn read_pending(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        after: &EntryId,
    ) -> Result<Vec<StreamEntry>, GatewayError> {
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);

        let after = after.to_string();
        let mut con = self.commands.lease().await?;
        let reply: Option<StreamReadReply> = con
            .xread_options(&[topic], &[after.as_str()], options)
            .await
            .map_err(|e| classify(e, topic, group))?;

        match reply {
            Some(reply) => {
                let ids = reply.keys.into_iter().flat_map(|key| key.ids).collect();
                into_entries(ids)
            }
            None => Ok(Vec::new()),
        }
    }

    async fn acknowledge(
        &self,
        topic: &str,
        group: &str,
        id: &EntryId,
    ) -> Result<bool, GatewayError> {
        let mut con = self.commands.lease().await?;
        let acknowledged: u64 = con.xack(topic, group, &[id.to_string()]).await?;

        Ok(acknowledged > 0)
    }

    async fn list_pending(
        &self,
        topic: &str,
        group: &str,
        idle_threshold: Duration,
    ) -> Result<Vec<PendingEntry>, GatewayError> {
        let mut con = self.commands.lease().await?;
        let mut start = STREAM_ID_MIN.to_owned();
        let mut entries = Vec::new();

        loop {
            let reply: StreamPendingCountReply = con
                .xpending_count(topic, group, &start, STREAM_ID_MAX, PENDING_PAGE_SIZE)
                .await
                .map_err(|e| classify(e, topic, group))?;

            let page_size = reply.ids.len();
            let mut last = None;

            for pending in reply.ids {
                let id: EntryId = pending.id.parse()?;
                let idle = Duration::from_millis(pending.last_delivered_ms as u64);
                last = Some(id);

                if idle >= idle_threshold {
                    entries.push(PendingEntry {
                        id,
                        consumer: pending.consumer,
                        idle,
                        deliveries: pending.times_delivered as u64,
                    });
                }
            }

            match last {
                Some(last) if page_size == PENDING_PAGE_SIZE => {
                    start = last.successor().to_string()
                }
                _ => break,
            }
        }

        Ok(entries)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn claim(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<StreamEntry>, GatewayError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
        let mut con = self.commands.lease().await?;
        let reply: StreamClaimReply = con
            .xclaim(topic, group, consumer, as_millis(min_idle), &ids)
            .await
            .map_err(|e| classify(e, topic, group))?;

        into_entries(reply.ids)
    }

    async fn fetch_entry(
        &self,
        topic: &str,
        _group: &str,
        id: &EntryId,
    ) -> Result<Option<StreamEntry>, GatewayError> {
        let id = id.to_string();
        let mut con = self.commands.lease().await?;
        let reply: StreamRangeReply = con.xrange_count(topic, &id, &id, 1).await?;

        reply.ids.into_iter().next().map(into_entry).transpose()
    }

    #[instrument(skip(self, message))]
    async fn move_to_dead_letter(
        &self,
        topic: &str,
        group: &str,
        id: &EntryId,
        message: &TransportMessage,
    ) -> Result<bool, GatewayError> {
        let headers = message.encoded_headers()?;
        let mut con = self.commands.lease().await?;

        let acknowledged: u64 = MOVE_TO_DEAD_LETTER
            .key(topic)
            .key(dead_letter_topic(topic))
            .arg(group)
            .arg(id.to_string())
            .arg(headers)
            .arg(message.body())
            .invoke_async(&mut con)
            .await?;

        Ok(acknowledged == 1)
    }

    async fn trim(&self, topic: &str, max_len: usize) -> Result<u64, GatewayError> {
        let mut con = self.commands.lease().await?;
        let evicted: u64 = con.xtrim(topic, StreamMaxlen::Approx(max_len)).await?;

        Ok(evicted)
    }

    #[instrument(skip(self, candidates))]
    async fn resolve_topics(
        &self,
        group: &str,
        candidates: &[String],
    ) -> Result<Vec<String>, GatewayError> {
        let start = match self.group_start {
            QueueLocation::Head => STREAM_ID_HEAD,
            QueueLocation::Tail => STREAM_ID_TAIL,
        };

        let mut con = self.commands.lease().await?;
        let mut topics: Vec<String> = Vec::with_capacity(candidates.len());

        for topic in candidates {
            if topics.contains(topic) {
                continue;
            }

            let result: RedisResult<()> = con.xgroup_create_mkstream(topic, group, start).await;

            match result {
                Ok(()) => debug!(%topic, "Created consumer group"),
                Err(e) if e.code() == Some(BUSY_GROUP) => {}
                Err(e) => return Err(e.into()),
            }

            topics.push(topic.clone());
        }

        Ok(topics)
    }

    async fn ping(&self) -> Result<(), GatewayError> {
        let mut con = self.commands.lease().await?;
        let _: String = redis::cmd("PING").query_async(&mut con).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::communication::Headers;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    const GROUP: &str = "billing";
    const BLOCK: Duration = Duration::from_millis(10);

    /// Gateway connected to the server at `REDIS`, the tests are skipped when it is not set
    fn gateway() -> Option<RedisStreamGateway> {
        let url = std::env::var("REDIS").ok()?;
        let connector = RedisConnector::new(&url).unwrap();

        Some(RedisStreamGateway::open(connector, 2, 1, LeasePolicy::default()))
    }

    fn unique_topic() -> String {
        format!("redismq-test-{}", Uuid::new_v4())
    }

    fn message(topic: &str) -> TransportMessage {
        TransportMessage::new(topic, Headers::new(), b"{}".to_vec())
    }

    async fn remove(gateway: &RedisStreamGateway, topic: &str) {
        let mut con = gateway.pool().lease().await.unwrap();
        let keys = vec![topic.to_owned(), dead_letter_topic(topic)];
        let _: u64 = con.del(keys).await.unwrap();
    }

    #[tokio::test]
    async fn pending_entries_are_listed_across_pages() {
        let gateway = match gateway() {
            Some(gateway) => gateway,
            None => return,
        };
        let topic = unique_topic();
        gateway.resolve_topics(GROUP, &[topic.clone()]).await.unwrap();

        let count = PENDING_PAGE_SIZE + 5;
        for _ in 0..count {
            gateway.append(&topic, &message(&topic), None).await.unwrap();
        }

        let read = gateway
            .read_new(&topic, GROUP, "c1", count * 2, BLOCK)
            .await
            .unwrap();
        assert_eq!(read.len(), count);

        let pending = gateway
            .list_pending(&topic, GROUP, Duration::ZERO)
            .await
            .unwrap();
        let ids: Vec<EntryId> = pending.iter().map(|entry| entry.id).collect();
        let expected: Vec<EntryId> = read.iter().map(|entry| entry.id).collect();
        assert_eq!(ids, expected);

        remove(&gateway, &topic).await;
    }

    #[tokio::test]
    async fn pending_entries_are_read_back_by_their_consumer() {
        let gateway = match gateway() {
            Some(gateway) => gateway,
            None => return,
        };
        let topic = unique_topic();
        gateway.resolve_topics(GROUP, &[topic.clone()]).await.unwrap();

        let a = gateway.append(&topic, &message(&topic), None).await.unwrap();
        let b = gateway.append(&topic, &message(&topic), None).await.unwrap();
        gateway
            .read_new(&topic, GROUP, "c1", 10, BLOCK)
            .await
            .unwrap();

        let resumed = gateway
            .read_pending(&topic, GROUP, "c1", 10, &EntryId::MIN)
            .await
            .unwrap();
        let ids: Vec<EntryId> = resumed.iter().map(|entry| entry.id).collect();
        assert_eq!(ids, vec![a, b]);

        let after = gateway
            .read_pending(&topic, GROUP, "c1", 10, &b)
            .await
            .unwrap();
        assert!(after.is_empty());

        let other = gateway
            .read_pending(&topic, GROUP, "c2", 10, &EntryId::MIN)
            .await
            .unwrap();
        assert!(other.is_empty());

        remove(&gateway, &topic).await;
    }

    #[tokio::test]
    async fn entries_are_dead_lettered_at_most_once() {
        let gateway = match gateway() {
            Some(gateway) => gateway,
            None => return,
        };
        let topic = unique_topic();
        gateway.resolve_topics(GROUP, &[topic.clone()]).await.unwrap();

        let id = gateway.append(&topic, &message(&topic), None).await.unwrap();
        gateway
            .read_new(&topic, GROUP, "c1", 10, BLOCK)
            .await
            .unwrap();

        let letter = message(&topic);
        assert!(gateway
            .move_to_dead_letter(&topic, GROUP, &id, &letter)
            .await
            .unwrap());
        assert!(!gateway
            .move_to_dead_letter(&topic, GROUP, &id, &letter)
            .await
            .unwrap());

        let pending = gateway
            .list_pending(&topic, GROUP, Duration::ZERO)
            .await
            .unwrap();
        assert!(pending.is_empty());

        let letters: u64 = {
            let mut con = gateway.pool().lease().await.unwrap();
            con.xlen(dead_letter_topic(&topic)).await.unwrap()
        };
        assert_eq!(letters, 1);

        remove(&gateway, &topic).await;
    }

    #[tokio::test]
    async fn missing_groups_are_reported() {
        let gateway = match gateway() {
            Some(gateway) => gateway,
            None => return,
        };
        let topic = unique_topic();
        gateway.append(&topic, &message(&topic), None).await.unwrap();

        let result = gateway.list_pending(&topic, GROUP, Duration::ZERO).await;
        assert!(matches!(result, Err(GatewayError::NoGroup { .. })));

        remove(&gateway, &topic).await;
    }

    #[tokio::test]
    async fn existing_groups_are_resolved_again() {
        let gateway = match gateway() {
            Some(gateway) => gateway,
            None => return,
        };
        let topic = unique_topic();
        let candidates = vec![topic.clone()];

        let first = gateway.resolve_topics(GROUP, &candidates).await.unwrap();
        let second = gateway.resolve_topics(GROUP, &candidates).await.unwrap();
        assert_eq!(first, candidates);
        assert_eq!(second, candidates);

        remove(&gateway, &topic).await;
    }
}
