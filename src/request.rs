//! Correlated request/response execution over the shared transport
//!
//! A single dispatcher task owns the transport's incoming-publish stream and
//! fans each publish out to at most one pending request (first registered
//! predicate wins) and to every open stream on the topic. Each `execute`
//! call is one logical exchange: acquire the response subscription, register
//! a pending entry, publish, then await exactly one completion.

use crate::error::{JobsError, Result};
use crate::subscriptions::SubscriptionManager;
use crate::topic::{topic_matches, CorrelationPredicate, RequestTopics};
use crate::transport::{IncomingPublish, IncomingPublishReceiver, PubSubTransport, QoS};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Everything needed to run one request/response exchange
#[derive(Debug, Clone)]
pub struct OperationDescriptor {
    /// Operation name, for logging only
    pub name: &'static str,
    /// Publish and response topics
    pub topics: RequestTopics,
    /// Client token to correlate on, when the request carries one
    pub correlation_token: Option<String>,
    /// Serialized request payload
    pub payload: Vec<u8>,
    /// Deadline for the correlated response, measured from publish
    /// completion
    pub timeout: Duration,
}

/// The raw publish that resolved a request
#[derive(Debug, Clone)]
pub struct ResponsePublish {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Sink receiving raw stream events; decoding happens per operation
pub(crate) type StreamSink = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

struct PendingEntry {
    id: u64,
    predicate: CorrelationPredicate,
    tx: oneshot::Sender<Result<ResponsePublish>>,
}

struct StreamEntry {
    topic_filter: String,
    sink: StreamSink,
}

/// Topic-to-listeners routing shared by all requests and streams of one
/// client
pub(crate) struct Dispatcher {
    // Insertion order doubles as match priority: the oldest matching
    // pending request receives the publish.
    pending: Mutex<Vec<PendingEntry>>,
    streams: Mutex<HashMap<u64, StreamEntry>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn register_pending(
        &self,
        predicate: CorrelationPredicate,
    ) -> (u64, oneshot::Receiver<Result<ResponsePublish>>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().push(PendingEntry { id, predicate, tx });
        (id, rx)
    }

    fn remove_pending(&self, id: u64) {
        self.pending.lock().retain(|entry| entry.id != id);
    }

    pub(crate) fn register_stream(&self, topic_filter: String, sink: StreamSink) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.streams.lock().insert(
            id,
            StreamEntry {
                topic_filter,
                sink,
            },
        );
        id
    }

    pub(crate) fn remove_stream(&self, id: u64) {
        self.streams.lock().remove(&id);
    }

    fn dispatch(&self, publish: IncomingPublish) {
        trace!(topic = %publish.topic, bytes = publish.payload.len(), "incoming publish");

        // At most one pending request claims the publish.
        let claimed = {
            let mut pending = self.pending.lock();
            pending
                .iter()
                .position(|entry| entry.predicate.matches(&publish.topic, &publish.payload))
                .map(|index| pending.remove(index))
        };
        if let Some(entry) = claimed {
            let _ = entry.tx.send(Ok(ResponsePublish {
                topic: publish.topic.clone(),
                payload: publish.payload.clone(),
            }));
        }

        // Streams see every publish on their topic, correlated or not.
        let sinks: Vec<StreamSink> = {
            let streams = self.streams.lock();
            streams
                .values()
                .filter(|entry| topic_matches(&entry.topic_filter, &publish.topic))
                .map(|entry| entry.sink.clone())
                .collect()
        };
        for sink in sinks {
            sink(&publish.topic, &publish.payload);
        }
    }

    /// Fail every pending request; used on shutdown and transport loss
    pub(crate) fn fail_all_pending(&self, error: impl Fn() -> JobsError) {
        let drained: Vec<PendingEntry> = self.pending.lock().drain(..).collect();
        for entry in drained {
            let _ = entry.tx.send(Err(error()));
        }
    }

    /// Mark the dispatcher closed and fail everything still waiting
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.fail_all_pending(|| JobsError::ClientClosed);
    }

    /// Drive dispatch from the transport's incoming-publish stream until it
    /// ends, then fail whatever is still pending
    pub(crate) async fn run(self: Arc<Self>, mut incoming: IncomingPublishReceiver) {
        while let Some(publish) = incoming.recv().await {
            self.dispatch(publish);
        }
        debug!("incoming publish stream ended");
        if !self.is_closed() {
            self.fail_all_pending(|| JobsError::Transport("connection lost".to_string()));
        }
    }
}

// Removes the pending entry if execute exits before a completion claimed it
// (timeout, publish failure, caller cancellation).
struct PendingGuard<'a> {
    dispatcher: &'a Dispatcher,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.dispatcher.remove_pending(self.id);
    }
}

/// Executes single request/response exchanges
pub(crate) struct RequestResponse {
    transport: Arc<dyn PubSubTransport>,
    subscriptions: SubscriptionManager,
    dispatcher: Arc<Dispatcher>,
    qos: QoS,
}

impl RequestResponse {
    pub(crate) fn new(
        transport: Arc<dyn PubSubTransport>,
        subscriptions: SubscriptionManager,
        dispatcher: Arc<Dispatcher>,
        qos: QoS,
    ) -> Self {
        Self {
            transport,
            subscriptions,
            dispatcher,
            qos,
        }
    }

    /// Run one exchange to completion
    ///
    /// The subscription is held for the whole call and released on every
    /// exit path. The timeout clock starts once the publish completes, so
    /// subscription setup does not count against the caller's deadline.
    pub(crate) async fn execute(&self, descriptor: OperationDescriptor) -> Result<ResponsePublish> {
        if self.dispatcher.is_closed() {
            return Err(JobsError::ClientClosed);
        }

        let _subscription = self
            .subscriptions
            .acquire(&descriptor.topics.subscribe)
            .await?;

        // Registered before the publish: a response arriving immediately
        // after the broker accepts the request must find the entry.
        let predicate =
            CorrelationPredicate::new(&descriptor.topics, descriptor.correlation_token.clone());
        let (id, rx) = self.dispatcher.register_pending(predicate);
        let _pending = PendingGuard {
            dispatcher: &self.dispatcher,
            id,
        };

        // close() may have drained the pending table between the entry
        // check and this registration; fail fast instead of waiting out
        // the timeout.
        if self.dispatcher.is_closed() {
            return Err(JobsError::ClientClosed);
        }

        debug!(
            operation = descriptor.name,
            topic = %descriptor.topics.publish,
            "publishing request"
        );
        self.transport
            .publish(&descriptor.topics.publish, &descriptor.payload, self.qos)
            .await
            .map_err(|e| JobsError::Transport(e.to_string()))?;

        match timeout(descriptor.timeout, rx).await {
            Ok(Ok(completion)) => completion,
            Ok(Err(_)) => Err(JobsError::ClientClosed),
            Err(_) => {
                debug!(operation = descriptor.name, "request timed out");
                Err(JobsError::Timeout)
            }
        }
    }
}
