//! Long-lived streaming subscriptions
//!
//! A streaming operation is caller-managed: construct it, `open()` to start
//! receiving every publish on its topic, `close()` to stop. Unlike a pending
//! request it applies no correlation filtering and survives any number of
//! request/response exchanges on the same topic.

use crate::error::{JobsError, Result};
use crate::request::{Dispatcher, StreamSink};
use crate::subscriptions::{SubscriptionManager, SubscriptionRef};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

enum StreamState {
    /// Constructed, nothing subscribed yet
    Created,
    /// Subscription acquire in flight
    Opening,
    /// Events flowing to the sink
    Open {
        stream_id: u64,
        _subscription: SubscriptionRef,
    },
    /// Terminal; no further events
    Closed,
}

pub(crate) struct StreamShared {
    topic_filter: String,
    sink: StreamSink,
    dispatcher: Arc<Dispatcher>,
    subscriptions: SubscriptionManager,
    state: Mutex<StreamState>,
}

/// A caller-controlled stream of events on one topic
pub struct StreamingOperation {
    shared: Arc<StreamShared>,
}

impl StreamingOperation {
    pub(crate) fn new(
        topic_filter: String,
        sink: StreamSink,
        dispatcher: Arc<Dispatcher>,
        subscriptions: SubscriptionManager,
    ) -> Self {
        Self {
            shared: Arc::new(StreamShared {
                topic_filter,
                sink,
                dispatcher,
                subscriptions,
                state: Mutex::new(StreamState::Created),
            }),
        }
    }

    pub(crate) fn shared(&self) -> Arc<StreamShared> {
        self.shared.clone()
    }

    /// Topic this stream listens on
    pub fn topic_filter(&self) -> &str {
        &self.shared.topic_filter
    }

    /// True while events are flowing
    pub fn is_open(&self) -> bool {
        matches!(*self.shared.state.lock(), StreamState::Open { .. })
    }

    /// Subscribe and start delivering events to the sink
    ///
    /// Valid only on a freshly constructed stream; opening an already-open
    /// or closed stream is an error. If the subscription cannot be
    /// established the stream returns to its initial state and may be
    /// opened again.
    pub async fn open(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            match *state {
                StreamState::Created => *state = StreamState::Opening,
                StreamState::Opening | StreamState::Open { .. } => {
                    return Err(JobsError::Validation("stream is already open".to_string()))
                }
                StreamState::Closed => {
                    return Err(JobsError::Validation("stream is closed".to_string()))
                }
            }
        }

        let subscription = match self
            .shared
            .subscriptions
            .acquire(&self.shared.topic_filter)
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                *self.shared.state.lock() = StreamState::Created;
                return Err(e);
            }
        };

        let stream_id = self
            .shared
            .dispatcher
            .register_stream(self.shared.topic_filter.clone(), self.shared.sink.clone());

        debug!(topic = %self.shared.topic_filter, "stream opened");
        *self.shared.state.lock() = StreamState::Open {
            stream_id,
            _subscription: subscription,
        };
        Ok(())
    }

    /// Stop delivering events and release the subscription
    ///
    /// Closing a stream that was never opened just marks it closed; closing
    /// twice is a no-op.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl StreamShared {
    pub(crate) fn close(&self) {
        let previous = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, StreamState::Closed)
        };

        if let StreamState::Open { stream_id, .. } = previous {
            self.dispatcher.remove_stream(stream_id);
            debug!(topic = %self.topic_filter, "stream closed");
            // The SubscriptionRef held in the previous state drops here,
            // releasing the last reference if no request shares the topic.
        }
    }
}

impl Drop for StreamShared {
    fn drop(&mut self) {
        // A stream abandoned while open must not leak its dispatcher entry.
        if let StreamState::Open { stream_id, .. } = *self.state.lock() {
            self.dispatcher.remove_stream(stream_id);
        }
    }
}
