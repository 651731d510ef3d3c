//! The pub/sub transport capability consumed by the client
//!
//! The client does not implement any MQTT mechanics itself. It drives a
//! [`PubSubTransport`] for outbound traffic and reads incoming publishes from
//! a channel supplied alongside it, so any MQTT client (3.1.1 or 5) can sit
//! underneath.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// MQTT quality-of-service level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    /// Fire and forget
    AtMostOnce,
    /// Acknowledged delivery
    AtLeastOnce,
    /// Assured delivery
    ExactlyOnce,
}

/// An incoming publish delivered by the transport for an active subscription
#[derive(Debug, Clone)]
pub struct IncomingPublish {
    /// Topic the message was published on
    pub topic: String,
    /// Serialized payload bytes
    pub payload: Vec<u8>,
}

/// Sender half used by transport implementations to deliver incoming
/// publishes; dropping it signals that the transport is gone
pub type IncomingPublishSender = mpsc::UnboundedSender<IncomingPublish>;

/// Receiver half handed to [`JobsClient::new`](crate::JobsClient::new)
pub type IncomingPublishReceiver = mpsc::UnboundedReceiver<IncomingPublish>;

/// Create the incoming-publish channel pair shared between a transport
/// implementation and the client
pub fn incoming_publish_channel() -> (IncomingPublishSender, IncomingPublishReceiver) {
    mpsc::unbounded_channel()
}

/// Abstract publish/subscribe transport
///
/// Implementations are expected to deliver every publish matching an active
/// subscription on the incoming-publish channel, in arrival order. All
/// methods resolve once the broker has acknowledged the operation (or the
/// transport has accepted it for QoS 0).
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Publish a payload to a topic
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), TransportError>;

    /// Subscribe to a topic filter
    async fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<(), TransportError>;

    /// Unsubscribe from a topic filter
    async fn unsubscribe(&self, topic_filter: &str) -> Result<(), TransportError>;
}

/// Error reported by a transport operation
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
