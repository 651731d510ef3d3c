//! Reference-counted subscription lifecycle
//!
//! Many pending requests and open streams can share one transport
//! subscription on the same filter. The manager keeps a counted entry per
//! filter: the first acquirer performs the transport subscribe and signals
//! the outcome through a watch channel, later acquirers just bump the count
//! and wait on that signal, and the last release tears the subscription
//! down. Releases are RAII so a cancelled caller can never leak a
//! reference.

use crate::error::{JobsError, Result};
use crate::transport::{PubSubTransport, QoS};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
enum EntryState {
    /// Transport subscribe in flight
    Pending,
    /// Subscription active on the transport
    Ready,
    /// Transport subscribe failed; entry drains as waiters give up
    Failed(String),
}

struct Entry {
    refs: usize,
    state: watch::Sender<EntryState>,
}

struct ManagerInner {
    transport: Arc<dyn PubSubTransport>,
    qos: QoS,
    entries: Mutex<HashMap<String, Entry>>,
}

/// Shared, clonable subscription manager
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl SubscriptionManager {
    pub fn new(transport: Arc<dyn PubSubTransport>, qos: QoS) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                transport,
                qos,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Acquire a reference to the subscription for `topic_filter`,
    /// establishing it on the transport if this is the first reference
    ///
    /// Resolves only once the subscription is active, so a caller may
    /// publish immediately afterwards without racing the response. On
    /// failure no reference is recorded.
    pub async fn acquire(&self, topic_filter: &str) -> Result<SubscriptionRef> {
        enum Role {
            Establisher,
            Waiter(watch::Receiver<EntryState>),
        }

        let role = {
            let mut entries = self.inner.entries.lock();
            match entries.get_mut(topic_filter) {
                Some(entry) => {
                    if let EntryState::Failed(reason) = &*entry.state.borrow() {
                        return Err(JobsError::Subscription(reason.clone()));
                    }
                    entry.refs += 1;
                    Role::Waiter(entry.state.subscribe())
                }
                None => {
                    let (tx, _rx) = watch::channel(EntryState::Pending);
                    entries.insert(
                        topic_filter.to_string(),
                        Entry {
                            refs: 1,
                            state: tx,
                        },
                    );
                    Role::Establisher
                }
            }
        };

        // The guard exists before any await so cancellation releases the
        // reference we just recorded.
        let guard = SubscriptionRef {
            inner: self.inner.clone(),
            topic_filter: topic_filter.to_string(),
            establisher: matches!(&role, Role::Establisher),
        };

        match role {
            Role::Establisher => {
                debug!(topic = topic_filter, "subscribing");
                match self
                    .inner
                    .transport
                    .subscribe(topic_filter, self.inner.qos)
                    .await
                {
                    Ok(()) => {
                        self.set_state(topic_filter, EntryState::Ready);
                        Ok(guard)
                    }
                    Err(e) => {
                        self.set_state(topic_filter, EntryState::Failed(e.to_string()));
                        Err(JobsError::Subscription(e.to_string()))
                    }
                }
            }
            Role::Waiter(mut rx) => loop {
                let state = rx.borrow_and_update().clone();
                match state {
                    EntryState::Ready => return Ok(guard),
                    EntryState::Failed(reason) => return Err(JobsError::Subscription(reason)),
                    EntryState::Pending => {
                        if rx.changed().await.is_err() {
                            return Err(JobsError::Subscription(
                                "subscription abandoned".to_string(),
                            ));
                        }
                    }
                }
            },
        }
    }

    fn set_state(&self, topic_filter: &str, state: EntryState) {
        let entries = self.inner.entries.lock();
        if let Some(entry) = entries.get(topic_filter) {
            // send_replace: the new state must stick even when nobody is
            // waiting yet.
            entry.state.send_replace(state);
        }
    }

    /// Current reference count for a topic filter (zero when no entry)
    pub fn reference_count(&self, topic_filter: &str) -> usize {
        self.inner
            .entries
            .lock()
            .get(topic_filter)
            .map_or(0, |entry| entry.refs)
    }
}

/// A counted reference to an active subscription
///
/// Dropping the reference decrements the count; the last drop removes the
/// entry and issues a fire-and-forget unsubscribe.
pub struct SubscriptionRef {
    inner: Arc<ManagerInner>,
    topic_filter: String,
    establisher: bool,
}

impl SubscriptionRef {
    /// Topic filter this reference keeps alive
    pub fn topic_filter(&self) -> &str {
        &self.topic_filter
    }
}

impl Drop for SubscriptionRef {
    fn drop(&mut self) {
        let mut entries = self.inner.entries.lock();
        let Some(entry) = entries.get_mut(&self.topic_filter) else {
            return;
        };

        entry.refs -= 1;

        if entry.refs == 0 {
            let was_ready = *entry.state.borrow() == EntryState::Ready;
            entries.remove(&self.topic_filter);
            drop(entries);

            if was_ready {
                let transport = self.inner.transport.clone();
                let topic_filter = self.topic_filter.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            debug!(topic = %topic_filter, "unsubscribing");
                            if let Err(e) = transport.unsubscribe(&topic_filter).await {
                                warn!(topic = %topic_filter, error = %e, "unsubscribe failed");
                            }
                        });
                    }
                    Err(_) => {
                        warn!(topic = %self.topic_filter, "no runtime, skipping unsubscribe");
                    }
                }
            }
        } else if self.establisher && *entry.state.borrow() == EntryState::Pending {
            // The establishing acquire was cancelled mid-subscribe; unblock
            // any waiters still counting on it.
            entry
                .state
                .send_replace(EntryState::Failed("subscription abandoned".to_string()));
        }
    }
}
