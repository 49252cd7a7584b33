//! Serialization and deserialization of message bodies
//!
//! Bodies are opaque to the log store. The codec used to produce a body is recorded in the
//! [`CONTENT_TYPE`](super::headers::CONTENT_TYPE) header so that consumers can pick the matching
//! one regardless of their own default.

use super::{headers, CodecError, TransportMessage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::str::FromStr;

/// Serialization format for message bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// [`serde_json`]
    Json,
    /// [`bincode`]
    Bincode,
}

impl Codec {
    /// Value stored in the content type header
    pub fn content_type(&self) -> &'static str {
        match self {
            Codec::Json => "application/json",
            Codec::Bincode => "application/x-bincode",
        }
    }

    /// Serializes a value into a body
    pub fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::to_vec(value)?),
            Codec::Bincode => Ok(bincode::serialize(value)?),
        }
    }

    /// Deserializes a body into a value
    pub fn deserialize<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(body)?),
            Codec::Bincode => Ok(bincode::deserialize(body)?),
        }
    }

    /// Codec to decode the given message with, preferring the one named in its headers
    pub fn for_message(&self, message: &TransportMessage) -> Result<Codec, CodecError> {
        match message.header(headers::CONTENT_TYPE) {
            Some(content_type) => content_type.parse(),
            None => Ok(*self),
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Codec::Json
    }
}

impl FromStr for Codec {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" | "application/json" => Ok(Codec::Json),
            "bincode" | "application/x-bincode" => Ok(Codec::Bincode),
            other => Err(CodecError::UnknownContentType(other.to_owned())),
        }
    }
}
