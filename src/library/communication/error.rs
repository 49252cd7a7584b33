use crate::library::pool::PoolError;
use thiserror::Error;

/// Errors raised while converting between stream entries and messages
#[derive(Debug, Error)]
pub enum MessageError {
    /// Entry id does not follow the `<millis>-<sequence>` format
    #[error("invalid entry id '{0}'")]
    InvalidEntryId(String),
    /// Headers field of an entry could not be decoded
    #[error("headers of entry {id} are malformed")]
    MalformedHeaders {
        /// Id of the offending entry
        id: String,
        /// Underlying decoding error
        #[source]
        source: serde_json::Error,
    },
    /// Headers could not be encoded
    #[error("unable to encode headers")]
    HeaderEncoding(#[source] serde_json::Error),
}

/// Errors raised by [`Codec`](super::Codec) implementations
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON (de-)serialization failed
    #[error("json codec failed")]
    Json(#[from] serde_json::Error),
    /// Binary (de-)serialization failed
    #[error("bincode codec failed")]
    Bincode(#[from] bincode::Error),
    /// Content type header names a codec which is not known
    #[error("unknown content type '{0}'")]
    UnknownContentType(String),
}

/// Errors raised by [`StreamGateway`](super::StreamGateway) implementations
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Command sent to the redis server failed
    #[error("redis command failed")]
    Redis(#[from] redis::RedisError),
    /// No connection could be leased to run the operation
    #[error("unable to lease connection")]
    Pool(#[from] PoolError),
    /// Entry read from the log could not be interpreted
    #[error("malformed stream entry")]
    Message(#[from] MessageError),
    /// Consumer group has not been created on the topic
    #[error("consumer group '{group}' does not exist on topic '{topic}'")]
    NoGroup {
        /// Topic that was addressed
        topic: String,
        /// Group that is missing
        group: String,
    },
}
