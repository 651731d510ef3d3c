//! MQTT request/response client for the device-jobs service
//!
//! Maps transient publish/subscribe exchanges onto correlated, awaitable
//! request/response calls, and manages long-lived streaming subscriptions
//! whose lifecycle is independent of any single request. The MQTT transport
//! itself is a supplied capability: implement [`PubSubTransport`] over any
//! MQTT client and hand the incoming-publish channel to the client.
//!
//! # Example
//!
//! ```no_run
//! use mqtt_jobs::{GetPendingJobExecutionsRequest, JobsClient, JobsClientConfig};
//! use mqtt_jobs::transport::{incoming_publish_channel, PubSubTransport};
//! use std::sync::Arc;
//!
//! # async fn demo(transport: Arc<dyn PubSubTransport>) -> Result<(), Box<dyn std::error::Error>> {
//! let (incoming_tx, incoming_rx) = incoming_publish_channel();
//! // Wire incoming_tx into your MQTT client's message callback, then:
//! let client = JobsClient::new(transport, incoming_rx, JobsClientConfig::new());
//!
//! let response = client
//!     .get_pending_job_executions(GetPendingJobExecutionsRequest {
//!         thing_name: "my-thing".to_string(),
//!         client_token: None,
//!     })
//!     .await?;
//! println!("{} queued jobs", response.queued_jobs.len());
//!
//! let stream = client.create_job_executions_changed_stream("my-thing", |event| {
//!     println!("pending set changed at {:?}", event.timestamp);
//! })?;
//! stream.open().await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;
pub mod model;
mod request;
mod streaming;
mod subscriptions;
pub mod testing;
pub mod topic;
pub mod transport;

pub use client::JobsClient;
pub use config::JobsClientConfig;
pub use error::{JobsError, Result};
pub use model::{
    DescribeJobExecutionRequest, DescribeJobExecutionResponse, GetPendingJobExecutionsRequest,
    GetPendingJobExecutionsResponse, JobExecutionData, JobExecutionState, JobExecutionSummary,
    JobExecutionsChangedEvent, JobStatus, NextJobExecutionChangedEvent, RejectedErrorCode,
    RejectedErrorResponse, StartNextJobExecutionResponse, StartNextPendingJobExecutionRequest,
    UpdateJobExecutionRequest, UpdateJobExecutionResponse,
};
pub use request::{OperationDescriptor, ResponsePublish};
pub use streaming::StreamingOperation;
pub use subscriptions::{SubscriptionManager, SubscriptionRef};
pub use transport::{IncomingPublish, PubSubTransport, QoS};
