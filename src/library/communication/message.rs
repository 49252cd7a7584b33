use super::MessageError;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Names of headers attached to messages by this crate
pub mod headers {
    /// Unique identifier assigned by the publisher
    pub const MESSAGE_ID: &str = "mq-msg-id";
    /// Name used to route a message to a handler, defaults to the topic
    pub const MESSAGE_NAME: &str = "mq-msg-name";
    /// Identifier correlating related messages
    pub const CORRELATION_ID: &str = "mq-correlation-id";
    /// Consumer group a message has been delivered to
    pub const GROUP: &str = "mq-group";
    /// RFC 3339 timestamp of publication
    pub const SENT_TIME: &str = "mq-sent-time";
    /// Codec used to serialize the body
    pub const CONTENT_TYPE: &str = "mq-content-type";
    /// Topic a dead-lettered message originally belonged to
    pub const ORIGIN_TOPIC: &str = "mq-origin-topic";
    /// Reason why a message has been dead-lettered
    pub const EXCEPTION: &str = "mq-exception";
}

/// Stream entry field holding the JSON encoded headers
pub const FIELD_HEADERS: &str = "headers";
/// Stream entry field holding the raw body
pub const FIELD_BODY: &str = "body";

const DEAD_LETTER_EXTENSION: &str = "dead-letter";

/// Name of the stream that holds messages of `topic` which exceeded their retry budget
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{}.{}", topic, DEAD_LETTER_EXTENSION)
}

/// Message metadata where keys are unique and values may be absent
pub type Headers = HashMap<String, Option<String>>;

/// Identifier assigned to an entry by the log store
///
/// Ids are monotonically increasing within a topic and rendered as `<millis>-<sequence>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EntryId {
    millis: u64,
    sequence: u64,
}

impl EntryId {
    /// Smallest possible id
    pub const MIN: EntryId = EntryId {
        millis: 0,
        sequence: 0,
    };

    /// Creates a new id from raw parts
    pub fn new(millis: u64, sequence: u64) -> Self {
        Self { millis, sequence }
    }

    /// Millisecond part of the id
    pub fn millis(&self) -> u64 {
        self.millis
    }

    /// Sequence number within the millisecond
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Smallest id that is strictly greater than this one
    pub fn successor(&self) -> Self {
        match self.sequence.checked_add(1) {
            Some(sequence) => Self::new(self.millis, sequence),
            None => Self::new(self.millis.saturating_add(1), 0),
        }
    }
}

impl Ord for EntryId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.millis, self.sequence).cmp(&(other.millis, other.sequence))
    }
}

impl PartialOrd for EntryId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for EntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.sequence)
    }
}

impl FromStr for EntryId {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MessageError::InvalidEntryId(s.to_owned());

        let (millis, sequence) = match s.split_once('-') {
            Some((millis, sequence)) => (millis, Some(sequence)),
            None => (s, None),
        };

        let millis = millis.parse().map_err(|_| invalid())?;
        let sequence = match sequence {
            Some(sequence) => sequence.parse().map_err(|_| invalid())?,
            None => 0,
        };

        Ok(Self { millis, sequence })
    }
}

/// Raw entry as it is stored in a topic's log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Id assigned by the log store
    pub id: EntryId,
    /// Field-value pairs of the entry
    pub fields: HashMap<String, Vec<u8>>,
}

/// Canonical envelope moving through the system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    headers: Headers,
    body: Vec<u8>,
    topic: String,
    id: Option<EntryId>,
}

impl TransportMessage {
    /// Creates a new outbound message which has not yet been assigned an id
    pub fn new(topic: impl Into<String>, headers: Headers, body: Vec<u8>) -> Self {
        Self {
            headers,
            body,
            topic: topic.into(),
            id: None,
        }
    }

    /// Reconstructs a message from a raw stream entry read from `topic`
    ///
    /// Entries without headers are treated as having none and missing bodies as empty ones.
    pub fn from_entry(entry: StreamEntry, topic: &str) -> Result<Self, MessageError> {
        let StreamEntry { id, mut fields } = entry;

        let headers = match fields.remove(FIELD_HEADERS) {
            Some(raw) => serde_json::from_slice(&raw).map_err(|source| {
                MessageError::MalformedHeaders {
                    id: id.to_string(),
                    source,
                }
            })?,
            None => Headers::new(),
        };

        let body = fields.remove(FIELD_BODY).unwrap_or_default();

        Ok(Self {
            headers,
            body,
            topic: topic.to_owned(),
            id: Some(id),
        })
    }

    /// Encodes the message into the field-value pairs stored in the log
    pub fn to_fields(&self) -> Result<Vec<(&'static str, Vec<u8>)>, MessageError> {
        Ok(vec![
            (FIELD_HEADERS, self.encoded_headers()?),
            (FIELD_BODY, self.body.clone()),
        ])
    }

    /// Headers in the wire format used for the [`FIELD_HEADERS`] field
    pub fn encoded_headers(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(&self.headers).map_err(MessageError::HeaderEncoding)
    }

    /// Metadata attached to the message
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Mutable access to the metadata
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Looks up a header which is present and has a value
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.as_deref())
    }

    /// Sets a header value, replacing any previous one
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), Some(value.into()));
    }

    /// Serialized payload
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Topic the message originates from
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Id assigned by the log store, absent for messages that have not been read from a log
    pub fn id(&self) -> Option<EntryId> {
        self.id
    }

    /// Name used for routing, falls back to the topic
    pub fn name(&self) -> &str {
        self.header(headers::MESSAGE_NAME).unwrap_or(&self.topic)
    }

    /// Publisher assigned message id
    pub fn message_id(&self) -> Option<&str> {
        self.header(headers::MESSAGE_ID)
    }

    /// Correlation id, if any
    pub fn correlation_id(&self) -> Option<&str> {
        self.header(headers::CORRELATION_ID)
    }

    /// Builds the record that is appended to the dead-letter stream of this message's topic
    pub fn to_dead_letter(&self, reason: &str) -> TransportMessage {
        let mut letter = TransportMessage::new(
            dead_letter_topic(&self.topic),
            self.headers.clone(),
            self.body.clone(),
        );

        letter.set_header(headers::ORIGIN_TOPIC, self.topic.clone());
        letter.set_header(headers::EXCEPTION, reason);

        letter
    }
}
