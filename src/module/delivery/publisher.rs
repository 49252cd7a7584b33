use crate::library::communication::{
    headers, Codec, CodecError, EntryId, GatewayError, Headers, StreamGateway, TransportMessage,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{instrument, trace};
use uuid::Uuid;

/// Errors raised while publishing
#[derive(Debug, Error)]
pub enum PublishError {
    /// Payload could not be serialized
    #[error("unable to serialize payload")]
    Codec(#[from] CodecError),
    /// Message could not be appended
    #[error("unable to append message")]
    Gateway(#[from] GatewayError),
}

/// Serializes payloads and appends them to topics
#[derive(Clone)]
pub struct Publisher {
    gateway: Arc<dyn StreamGateway>,
    codec: Codec,
    max_len: Option<usize>,
}

impl Publisher {
    /// Creates a new publisher encoding bodies with `codec`
    pub fn new(gateway: Arc<dyn StreamGateway>, codec: Codec) -> Self {
        Self {
            gateway,
            codec,
            max_len: None,
        }
    }

    /// Trims topics to approximately `max_len` entries on every publish
    pub fn with_max_len(mut self, max_len: Option<usize>) -> Self {
        self.max_len = max_len;
        self
    }

    /// Publishes a payload to a topic
    pub async fn publish<T>(&self, topic: &str, payload: &T) -> Result<EntryId, PublishError>
    where
        T: Serialize + ?Sized,
    {
        self.publish_with_headers(topic, payload, Headers::new())
            .await
    }

    /// Publishes a payload along with custom headers
    ///
    /// Message id, name and sent time are filled in unless already present. The content type
    /// always reflects the codec of this publisher.
    #[instrument(skip(self, payload, custom))]
    pub async fn publish_with_headers<T>(
        &self,
        topic: &str,
        payload: &T,
        custom: Headers,
    ) -> Result<EntryId, PublishError>
    where
        T: Serialize + ?Sized,
    {
        let body = self.codec.serialize(payload)?;
        let mut message = TransportMessage::new(topic, custom, body);

        if message.message_id().is_none() {
            message.set_header(headers::MESSAGE_ID, Uuid::new_v4().to_string());
        }

        if message.header(headers::MESSAGE_NAME).is_none() {
            message.set_header(headers::MESSAGE_NAME, topic);
        }

        if message.header(headers::SENT_TIME).is_none() {
            message.set_header(headers::SENT_TIME, Utc::now().to_rfc3339());
        }

        message.set_header(headers::CONTENT_TYPE, self.codec.content_type());

        self.publish_message(message).await
    }

    /// Appends a fully prepared message to its topic as-is
    pub async fn publish_message(&self, message: TransportMessage) -> Result<EntryId, PublishError> {
        let id = self
            .gateway
            .append(message.topic(), &message, self.max_len)
            .await?;

        trace!(topic = message.topic(), entry_id = %id, "Published message");
        Ok(id)
    }

    /// Trims a topic to approximately `max_len` entries
    pub async fn trim(&self, topic: &str, max_len: usize) -> Result<u64, PublishError> {
        Ok(self.gateway.trim(topic, max_len).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::communication::implementation::memory::MemoryStreamGateway;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        amount: u32,
    }

    #[tokio::test]
    async fn stamps_well_known_headers() {
        let gateway = Arc::new(MemoryStreamGateway::new());
        let publisher = Publisher::new(gateway.clone(), Codec::Bincode);

        let mut custom = Headers::new();
        custom.insert("k".into(), Some("v".into()));
        custom.insert(headers::MESSAGE_NAME.into(), Some("order-created".into()));

        let id = publisher
            .publish_with_headers("orders", &Order { amount: 7 }, custom)
            .await
            .unwrap();

        let entry = gateway.entries("orders").remove(0);
        assert_eq!(entry.id, id);

        let message = TransportMessage::from_entry(entry, "orders").unwrap();
        assert_eq!(message.header("k"), Some("v"));
        assert_eq!(message.name(), "order-created");
        assert!(message.message_id().is_some());
        assert!(message.header(headers::SENT_TIME).is_some());

        let codec = Codec::Json.for_message(&message).unwrap();
        assert_eq!(codec, Codec::Bincode);
        assert_eq!(
            codec.deserialize::<Order>(message.body()).unwrap(),
            Order { amount: 7 }
        );
    }

    #[tokio::test]
    async fn bounds_topic_length() {
        let gateway = Arc::new(MemoryStreamGateway::new());
        let publisher = Publisher::new(gateway.clone(), Codec::Json).with_max_len(Some(2));

        for amount in 0..5 {
            publisher.publish("orders", &Order { amount }).await.unwrap();
        }

        assert_eq!(gateway.entries("orders").len(), 2);
        assert_eq!(publisher.trim("orders", 1).await.unwrap(), 1);
    }
}
