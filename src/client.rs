//! Jobs client facade
//!
//! One method per service operation, each a thin binding: build and validate
//! the operation's topics, hand the serialized request to the
//! request/response engine, decode the publish that resolved it. Streaming
//! constructors wrap the raw dispatcher sinks with typed decoding. All
//! operations and streams of one client share a single subscription manager
//! and transport connection.

use crate::config::JobsClientConfig;
use crate::error::{JobsError, Result};
use crate::model::{
    DescribeJobExecutionRequest, DescribeJobExecutionResponse, GetPendingJobExecutionsRequest,
    GetPendingJobExecutionsResponse, JobExecutionsChangedEvent, NextJobExecutionChangedEvent,
    RejectedErrorResponse, StartNextJobExecutionResponse, StartNextPendingJobExecutionRequest,
    UpdateJobExecutionRequest, UpdateJobExecutionResponse,
};
use crate::request::{
    Dispatcher, OperationDescriptor, RequestResponse, ResponsePublish, StreamSink,
};
use crate::streaming::{StreamShared, StreamingOperation};
use crate::subscriptions::SubscriptionManager;
use crate::topic::{
    describe_topics, executions_changed_topic, get_pending_topics, next_execution_changed_topic,
    start_next_topics, update_topics, RequestTopics,
};
use crate::transport::{IncomingPublishReceiver, PubSubTransport};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct ClientInner {
    config: JobsClientConfig,
    subscriptions: SubscriptionManager,
    dispatcher: Arc<Dispatcher>,
    engine: RequestResponse,
    // Streams handed out by this client, closed with it.
    streams: Mutex<Vec<Weak<StreamShared>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

/// Client for the device-jobs service over an MQTT-shaped transport
///
/// Cheaply cloneable; all clones share one transport connection and one
/// subscription table.
#[derive(Clone)]
pub struct JobsClient {
    inner: Arc<ClientInner>,
}

impl JobsClient {
    /// Create a client over the given transport
    ///
    /// `incoming` is the receiving half of the transport's incoming-publish
    /// channel; the client spawns a dispatcher task that owns it.
    pub fn new(
        transport: Arc<dyn PubSubTransport>,
        incoming: IncomingPublishReceiver,
        config: JobsClientConfig,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new());
        let dispatch_task = tokio::spawn(dispatcher.clone().run(incoming));

        let subscriptions = SubscriptionManager::new(transport.clone(), config.qos);
        let engine = RequestResponse::new(
            transport,
            subscriptions.clone(),
            dispatcher.clone(),
            config.qos,
        );

        Self {
            inner: Arc::new(ClientInner {
                config,
                subscriptions,
                dispatcher,
                engine,
                streams: Mutex::new(Vec::new()),
                dispatch_task: Mutex::new(Some(dispatch_task)),
            }),
        }
    }

    /// Generate a client token for correlating concurrent identical
    /// requests
    ///
    /// The client never injects tokens on its own; put the token in the
    /// request's `client_token` field to correlate by payload instead of by
    /// topic alone.
    pub fn client_token() -> String {
        Uuid::new_v4().to_string()
    }

    /// List all pending executions for a thing
    pub async fn get_pending_job_executions(
        &self,
        request: GetPendingJobExecutionsRequest,
    ) -> Result<GetPendingJobExecutionsResponse> {
        let topics = get_pending_topics(&request.thing_name)?;
        self.run_request("get-pending-job-executions", topics, &request, request.client_token.clone())
            .await
    }

    /// Start the next queued execution, marking it in progress
    pub async fn start_next_pending_job_execution(
        &self,
        request: StartNextPendingJobExecutionRequest,
    ) -> Result<StartNextJobExecutionResponse> {
        let topics = start_next_topics(&request.thing_name)?;
        self.run_request(
            "start-next-pending-job-execution",
            topics,
            &request,
            request.client_token.clone(),
        )
        .await
    }

    /// Fetch the state of one execution (`job_id` may be `$next`)
    pub async fn describe_job_execution(
        &self,
        request: DescribeJobExecutionRequest,
    ) -> Result<DescribeJobExecutionResponse> {
        let topics = describe_topics(&request.thing_name, &request.job_id)?;
        self.run_request("describe-job-execution", topics, &request, request.client_token.clone())
            .await
    }

    /// Update the status of one execution
    pub async fn update_job_execution(
        &self,
        request: UpdateJobExecutionRequest,
    ) -> Result<UpdateJobExecutionResponse> {
        let topics = update_topics(&request.thing_name, &request.job_id)?;
        self.run_request("update-job-execution", topics, &request, request.client_token.clone())
            .await
    }

    /// Stream of changes to the set of pending executions for a thing
    ///
    /// The returned stream is created closed-over the handler but not yet
    /// subscribed; call [`StreamingOperation::open`] to start receiving.
    pub fn create_job_executions_changed_stream<F>(
        &self,
        thing_name: &str,
        handler: F,
    ) -> Result<StreamingOperation>
    where
        F: Fn(JobExecutionsChangedEvent) + Send + Sync + 'static,
    {
        let topic = executions_changed_topic(thing_name)?;
        Ok(self.create_stream::<JobExecutionsChangedEvent, F>(topic, handler))
    }

    /// Stream of changes to the next queued execution for a thing
    pub fn create_next_job_execution_changed_stream<F>(
        &self,
        thing_name: &str,
        handler: F,
    ) -> Result<StreamingOperation>
    where
        F: Fn(NextJobExecutionChangedEvent) + Send + Sync + 'static,
    {
        let topic = next_execution_changed_topic(thing_name)?;
        Ok(self.create_stream::<NextJobExecutionChangedEvent, F>(topic, handler))
    }

    /// Close the client
    ///
    /// Fails every in-flight request with [`JobsError::ClientClosed`],
    /// closes all still-open streams created by this client, and stops the
    /// dispatcher. Idempotent; subsequent operations fail fast.
    pub fn close(&self) {
        if self.inner.dispatcher.is_closed() {
            return;
        }
        info!("closing jobs client");
        self.inner.dispatcher.close();

        let streams: Vec<Weak<StreamShared>> = self.inner.streams.lock().drain(..).collect();
        for stream in streams {
            if let Some(stream) = stream.upgrade() {
                stream.close();
            }
        }

        if let Some(task) = self.inner.dispatch_task.lock().take() {
            task.abort();
        }
    }

    fn create_stream<T, F>(&self, topic: String, handler: F) -> StreamingOperation
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        // A malformed event is skipped, never fatal: the stream's value is
        // continuity.
        let sink: StreamSink = Arc::new(move |topic: &str, payload: &[u8]| {
            match serde_json::from_slice::<T>(payload) {
                Ok(event) => handler(event),
                Err(e) => warn!(topic, error = %e, "skipping malformed stream event"),
            }
        });

        let stream = StreamingOperation::new(
            topic,
            sink,
            self.inner.dispatcher.clone(),
            self.inner.subscriptions.clone(),
        );
        self.inner.streams.lock().push(Arc::downgrade(&stream.shared()));
        stream
    }

    async fn run_request<Req, Resp>(
        &self,
        name: &'static str,
        topics: RequestTopics,
        request: &Req,
        correlation_token: Option<String>,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_vec(request)
            .map_err(|e| JobsError::Validation(format!("failed to encode request: {e}")))?;

        let descriptor = OperationDescriptor {
            name,
            topics: topics.clone(),
            correlation_token,
            payload,
            timeout: self.inner.config.operation_timeout,
        };

        let response = self.inner.engine.execute(descriptor).await?;
        decode_response(&topics, response)
    }
}

fn decode_response<Resp: DeserializeOwned>(
    topics: &RequestTopics,
    response: ResponsePublish,
) -> Result<Resp> {
    if response.topic == topics.rejected {
        let rejected: RejectedErrorResponse = serde_json::from_slice(&response.payload)
            .map_err(|e| JobsError::Protocol(format!("undecodable rejection: {e}")))?;
        debug!(topic = %response.topic, "request rejected by service");
        return Err(JobsError::Rejected(rejected));
    }

    serde_json::from_slice(&response.payload)
        .map_err(|e| JobsError::Protocol(format!("undecodable response: {e}")))
}
