//! In-process implementation of the [`StreamGateway`] for tests and local development
//!
//! Mirrors the consumer group semantics of redis streams closely enough that the delivery
//! machinery above it can be exercised without a server. All state lives behind a single lock,
//! which makes every operation trivially atomic.

use crate::library::communication::{
    dead_letter_topic, EntryId, GatewayError, PendingEntry, QueueLocation, StreamEntry,
    StreamGateway, TransportMessage,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::time::Instant;

type Fields = HashMap<String, Vec<u8>>;

struct DeliveryState {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Default)]
struct Group {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, DeliveryState>,
}

#[derive(Default)]
struct Stream {
    entries: BTreeMap<EntryId, Fields>,
    last_id: EntryId,
    groups: HashMap<String, Group>,
}

impl Stream {
    fn next_id(&mut self) -> EntryId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        let id = if now > self.last_id.millis() {
            EntryId::new(now, 0)
        } else {
            self.last_id.successor()
        };

        self.last_id = id;
        id
    }

    fn append(&mut self, fields: Fields) -> EntryId {
        let id = self.next_id();
        self.entries.insert(id, fields);
        id
    }

    fn trim(&mut self, max_len: usize) -> u64 {
        let mut evicted = 0;

        while self.entries.len() > max_len {
            let oldest = match self.entries.keys().next() {
                Some(id) => *id,
                None => break,
            };

            self.entries.remove(&oldest);
            evicted += 1;
        }

        evicted
    }
}

fn encode(message: &TransportMessage) -> Result<Fields, GatewayError> {
    Ok(message
        .to_fields()?
        .into_iter()
        .map(|(field, value)| (field.to_owned(), value))
        .collect())
}

fn missing_group(topic: &str, group: &str) -> GatewayError {
    GatewayError::NoGroup {
        topic: topic.to_owned(),
        group: group.to_owned(),
    }
}

/// [`StreamGateway`] keeping all topics in memory
#[derive(Default)]
pub struct MemoryStreamGateway {
    streams: Mutex<HashMap<String, Stream>>,
    appended: Notify,
    group_start: QueueLocation,
    pings: AtomicU64,
}

impl MemoryStreamGateway {
    /// Creates an empty gateway
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets where consumer groups created by this gateway start consuming
    pub fn with_group_start(mut self, location: QueueLocation) -> Self {
        self.group_start = location;
        self
    }

    /// All entries currently stored in a topic, oldest first
    pub fn entries(&self, topic: &str) -> Vec<StreamEntry> {
        self.with_streams(|streams| {
            streams
                .get(topic)
                .map(|stream| {
                    stream
                        .entries
                        .iter()
                        .map(|(id, fields)| StreamEntry {
                            id: *id,
                            fields: fields.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    /// Number of entries pending for a group on a topic
    pub fn pending_count(&self, topic: &str, group: &str) -> usize {
        self.with_streams(|streams| {
            streams
                .get(topic)
                .and_then(|stream| stream.groups.get(group))
                .map(|group| group.pending.len())
                .unwrap_or_default()
        })
    }

    /// Number of successful [`StreamGateway::ping`] calls
    pub fn pings(&self) -> u64 {
        self.pings.load(Ordering::Relaxed)
    }

    fn with_streams<T>(&self, f: impl FnOnce(&mut HashMap<String, Stream>) -> T) -> T {
        let mut streams = match self.streams.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        f(&mut streams)
    }

    fn take_new(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, GatewayError> {
        self.with_streams(|streams| {
            let stream = streams
                .get_mut(topic)
                .ok_or_else(|| missing_group(topic, group))?;

            let Stream {
                entries, groups, ..
            } = stream;

            let state = groups
                .get_mut(group)
                .ok_or_else(|| missing_group(topic, group))?;

            let now = Instant::now();
            let delivered: Vec<StreamEntry> = entries
                .range(state.last_delivered.successor()..)
                .take(count.max(1))
                .map(|(id, fields)| StreamEntry {
                    id: *id,
                    fields: fields.clone(),
                })
                .collect();

            for entry in delivered.iter() {
                state.last_delivered = entry.id;
                state.pending.insert(
                    entry.id,
                    DeliveryState {
                        consumer: consumer.to_owned(),
                        delivered_at: now,
                        deliveries: 1,
                    },
                );
            }

            Ok(delivered)
        })
    }
}

#[async_trait]
impl StreamGateway for MemoryStreamGateway {
    async fn append(
        &self,
        topic: &str,
        message: &TransportMessage,
        max_len: Option<usize>,
    ) -> Result<EntryId, GatewayError> {
        let fields = encode(message)?;

        let id = self.with_streams(|streams| {
            let stream = streams.entry(topic.to_owned()).or_default();
            let id = stream.append(fields);

            if let Some(max_len) = max_len {
                stream.trim(max_len);
            }

            id
        });

        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_new(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, GatewayError> {
        let deadline = Instant::now() + block;

        loop {
            // Register interest before checking so that an append in between is not missed
            let appended = self.appended.notified();

            let entries = self.take_new(topic, group, consumer, count)?;
            if !entries.is_empty() || Instant::now() >= deadline {
                return Ok(entries);
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
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
        self.with_streams(|streams| {
            let stream = streams
                .get_mut(topic)
                .ok_or_else(|| missing_group(topic, group))?;

            let Stream {
                entries, groups, ..
            } = stream;

            let state = groups
                .get_mut(group)
                .ok_or_else(|| missing_group(topic, group))?;

            let now = Instant::now();
            let mut delivered = Vec::new();

            for (id, delivery) in state.pending.range_mut(after.successor()..) {
                if delivered.len() >= count {
                    break;
                }

                if delivery.consumer != consumer {
                    continue;
                }

                // Trimmed entries stay pending until claimed or acknowledged
                let fields = match entries.get(id) {
                    Some(fields) => fields.clone(),
                    None => continue,
                };

                delivery.delivered_at = now;
                delivery.deliveries += 1;

                delivered.push(StreamEntry { id: *id, fields });
            }

            Ok(delivered)
        })
    }

    async fn acknowledge(
        &self,
        topic: &str,
        group: &str,
        id: &EntryId,
    ) -> Result<bool, GatewayError> {
        Ok(self.with_streams(|streams| {
            streams
                .get_mut(topic)
                .and_then(|stream| stream.groups.get_mut(group))
                .map(|group| group.pending.remove(id).is_some())
                .unwrap_or(false)
        }))
    }

    async fn list_pending(
        &self,
        topic: &str,
        group: &str,
        idle_threshold: Duration,
    ) -> Result<Vec<PendingEntry>, GatewayError> {
        self.with_streams(|streams| {
            let state = streams
                .get(topic)
                .and_then(|stream| stream.groups.get(group))
                .ok_or_else(|| missing_group(topic, group))?;

            let now = Instant::now();

            Ok(state
                .pending
                .iter()
                .map(|(id, delivery)| PendingEntry {
                    id: *id,
                    consumer: delivery.consumer.clone(),
                    idle: now.saturating_duration_since(delivery.delivered_at),
                    deliveries: delivery.deliveries,
                })
                .filter(|entry| entry.idle >= idle_threshold)
                .collect())
        })
    }

    async fn claim(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<StreamEntry>, GatewayError> {
        self.with_streams(|streams| {
            let stream = streams
                .get_mut(topic)
                .ok_or_else(|| missing_group(topic, group))?;

            let Stream {
                entries, groups, ..
            } = stream;

            let state = groups
                .get_mut(group)
                .ok_or_else(|| missing_group(topic, group))?;

            let now = Instant::now();
            let mut claimed = Vec::new();

            for id in ids {
                let delivery = match state.pending.get_mut(id) {
                    Some(delivery) => delivery,
                    None => continue,
                };

                if now.saturating_duration_since(delivery.delivered_at) < min_idle {
                    continue;
                }

                // Entries trimmed away while pending are dropped from the list like redis does
                let fields = match entries.get(id) {
                    Some(fields) => fields.clone(),
                    None => {
                        state.pending.remove(id);
                        continue;
                    }
                };

                delivery.consumer = consumer.to_owned();
                delivery.delivered_at = now;
                delivery.deliveries += 1;

                claimed.push(StreamEntry { id: *id, fields });
            }

            Ok(claimed)
        })
    }

    async fn fetch_entry(
        &self,
        topic: &str,
        _group: &str,
        id: &EntryId,
    ) -> Result<Option<StreamEntry>, GatewayError> {
        Ok(self.with_streams(|streams| {
            streams
                .get(topic)
                .and_then(|stream| stream.entries.get(id))
                .map(|fields| StreamEntry {
                    id: *id,
                    fields: fields.clone(),
                })
        }))
    }

    async fn move_to_dead_letter(
        &self,
        topic: &str,
        group: &str,
        id: &EntryId,
        message: &TransportMessage,
    ) -> Result<bool, GatewayError> {
        let fields = encode(message)?;

        let moved = self.with_streams(|streams| {
            let acknowledged = streams
                .get_mut(topic)
                .and_then(|stream| stream.groups.get_mut(group))
                .map(|group| group.pending.remove(id).is_some())
                .unwrap_or(false);

            if acknowledged {
                streams
                    .entry(dead_letter_topic(topic))
                    .or_default()
                    .append(fields);
            }

            acknowledged
        });

        if moved {
            self.appended.notify_waiters();
        }

        Ok(moved)
    }

    async fn trim(&self, topic: &str, max_len: usize) -> Result<u64, GatewayError> {
        Ok(self.with_streams(|streams| {
            streams
                .get_mut(topic)
                .map(|stream| stream.trim(max_len))
                .unwrap_or_default()
        }))
    }

    async fn resolve_topics(
        &self,
        group: &str,
        candidates: &[String],
    ) -> Result<Vec<String>, GatewayError> {
        let start = self.group_start;

        Ok(self.with_streams(|streams| {
            let mut topics: Vec<String> = Vec::with_capacity(candidates.len());

            for topic in candidates {
                if topics.contains(topic) {
                    continue;
                }

                let stream = streams.entry(topic.clone()).or_default();
                let last_id = stream.last_id;

                stream
                    .groups
                    .entry(group.to_owned())
                    .or_insert_with(|| Group {
                        last_delivered: match start {
                            QueueLocation::Head => EntryId::MIN,
                            QueueLocation::Tail => last_id,
                        },
                        pending: BTreeMap::new(),
                    });

                topics.push(topic.clone());
            }

            topics
        }))
    }

    async fn ping(&self) -> Result<(), GatewayError> {
        self.pings.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
