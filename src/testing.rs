//! Mock transport for testing without a broker
//!
//! Records every call made by the client and lets tests inject incoming
//! publishes, fail individual operations, and auto-respond to publishes the
//! instant they complete.

use crate::transport::{
    incoming_publish_channel, IncomingPublish, IncomingPublishReceiver, IncomingPublishSender,
    PubSubTransport, QoS, TransportError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// A recorded transport call
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
    },
    Subscribe {
        topic_filter: String,
        qos: QoS,
    },
    Unsubscribe {
        topic_filter: String,
    },
}

#[derive(Default)]
struct MockState {
    calls: Vec<MockCall>,
    fail_subscribe: Option<String>,
    fail_unsubscribe: Option<String>,
    fail_publish: Option<String>,
    subscribe_delay: Option<Duration>,
    // publish topic -> (response topic, response payload), delivered as an
    // incoming publish the moment the request publish completes
    auto_responses: HashMap<String, (String, Vec<u8>)>,
}

/// In-memory [`PubSubTransport`] that records calls and injects publishes
pub struct MockTransport {
    state: Mutex<MockState>,
    incoming: Mutex<Option<IncomingPublishSender>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            incoming: Mutex::new(None),
        }
    }

    /// Create a mock together with the incoming-publish receiver handed to
    /// the client
    pub fn with_incoming() -> (Self, IncomingPublishReceiver) {
        let (tx, rx) = incoming_publish_channel();
        let mock = Self::new();
        *mock.incoming.lock() = Some(tx);
        (mock, rx)
    }

    /// Deliver an incoming publish to the client
    pub fn deliver(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        if let Some(tx) = self.incoming.lock().as_ref() {
            let _ = tx.send(IncomingPublish {
                topic: topic.to_string(),
                payload: payload.into(),
            });
        }
    }

    /// Drop the incoming-publish sender, simulating a lost transport
    pub fn close_incoming(&self) {
        self.incoming.lock().take();
    }

    /// Respond with `payload` on `response_topic` as soon as anything is
    /// published to `publish_topic`
    pub fn respond_on_publish(
        &self,
        publish_topic: &str,
        response_topic: &str,
        payload: impl Into<Vec<u8>>,
    ) {
        self.state.lock().auto_responses.insert(
            publish_topic.to_string(),
            (response_topic.to_string(), payload.into()),
        );
    }

    /// Fail the next subscribe call with the given message
    pub fn fail_next_subscribe(&self, message: &str) {
        self.state.lock().fail_subscribe = Some(message.to_string());
    }

    /// Fail the next unsubscribe call with the given message
    pub fn fail_next_unsubscribe(&self, message: &str) {
        self.state.lock().fail_unsubscribe = Some(message.to_string());
    }

    /// Fail the next publish call with the given message
    pub fn fail_next_publish(&self, message: &str) {
        self.state.lock().fail_publish = Some(message.to_string());
    }

    /// Delay every subscribe call, for exercising concurrent acquirers
    pub fn delay_subscribes(&self, delay: Duration) {
        self.state.lock().subscribe_delay = Some(delay);
    }

    /// All recorded calls, in order
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    /// Number of subscribe calls for a topic filter
    pub fn subscribe_calls(&self, topic_filter: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| {
                matches!(call, MockCall::Subscribe { topic_filter: t, .. } if t == topic_filter)
            })
            .count()
    }

    /// Number of unsubscribe calls for a topic filter
    pub fn unsubscribe_calls(&self, topic_filter: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| {
                matches!(call, MockCall::Unsubscribe { topic_filter: t } if t == topic_filter)
            })
            .count()
    }

    /// Payloads published to a topic, in order
    pub fn published_payloads(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                MockCall::Publish {
                    topic: t, payload, ..
                } if t == topic => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSubTransport for MockTransport {
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), TransportError> {
        let response = {
            let mut state = self.state.lock();
            if let Some(message) = state.fail_publish.take() {
                return Err(TransportError::new(message));
            }
            state.calls.push(MockCall::Publish {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                qos,
            });
            state.auto_responses.get(topic).cloned()
        };

        if let Some((response_topic, response_payload)) = response {
            self.deliver(&response_topic, response_payload);
        }
        Ok(())
    }

    async fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<(), TransportError> {
        let delay = {
            let mut state = self.state.lock();
            state.calls.push(MockCall::Subscribe {
                topic_filter: topic_filter.to_string(),
                qos,
            });
            if let Some(message) = state.fail_subscribe.take() {
                return Err(TransportError::new(message));
            }
            state.subscribe_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic_filter: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.calls.push(MockCall::Unsubscribe {
            topic_filter: topic_filter.to_string(),
        });
        if let Some(message) = state.fail_unsubscribe.take() {
            return Err(TransportError::new(message));
        }
        Ok(())
    }
}
