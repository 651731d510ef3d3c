//! Payload models for the device-jobs service
//!
//! These mirror the service-side wire shapes (camelCase JSON). Topic-path
//! parameters such as the thing name never appear in a payload; they are
//! marked `#[serde(skip)]` so an otherwise-empty request serializes as `{}`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Lifecycle status of a job execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    InProgress,
    TimedOut,
    Failed,
    Succeeded,
    Canceled,
    Rejected,
    Removed,
}

/// Service error codes carried on rejected responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectedErrorCode {
    InvalidTopic,
    InvalidJson,
    InvalidRequest,
    InvalidStateTransition,
    ResourceNotFound,
    VersionMismatch,
    InternalError,
    RequestThrottled,
    TerminalStateReached,
}

/// Compact description of a job execution, as carried in pending lists and
/// change events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecutionSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<i64>,
}

/// Full job execution state as returned by describe/start-next
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecutionData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thing_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_document: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_details: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_number: Option<i64>,
}

/// Status portion of an execution, returned by update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecutionState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_details: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_number: Option<i64>,
}

/// Request to list all pending executions for a thing
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPendingJobExecutionsRequest {
    /// Thing to query; topic path parameter, not part of the payload
    #[serde(skip)]
    pub thing_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPendingJobExecutionsResponse {
    #[serde(default)]
    pub in_progress_jobs: Vec<JobExecutionSummary>,
    #[serde(default)]
    pub queued_jobs: Vec<JobExecutionSummary>,
    pub timestamp: Option<i64>,
    pub client_token: Option<String>,
}

/// Request to start the next queued execution for a thing
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartNextPendingJobExecutionRequest {
    #[serde(skip)]
    pub thing_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_timeout_in_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartNextJobExecutionResponse {
    /// Absent when no execution was queued
    pub execution: Option<JobExecutionData>,
    pub timestamp: Option<i64>,
    pub client_token: Option<String>,
}

/// Request to describe one execution (`job_id` may be `$next`)
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeJobExecutionRequest {
    #[serde(skip)]
    pub thing_name: String,
    #[serde(skip)]
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_job_document: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeJobExecutionResponse {
    pub execution: Option<JobExecutionData>,
    pub timestamp: Option<i64>,
    pub client_token: Option<String>,
}

/// Request to update the status of one execution
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateJobExecutionRequest {
    #[serde(skip)]
    pub thing_name: String,
    #[serde(skip)]
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_details: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_job_execution_state: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_job_document: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_timeout_in_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateJobExecutionResponse {
    pub execution_state: Option<JobExecutionState>,
    pub job_document: Option<serde_json::Value>,
    pub timestamp: Option<i64>,
    pub client_token: Option<String>,
}

/// Event pushed whenever the set of pending executions changes
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecutionsChangedEvent {
    #[serde(default)]
    pub jobs: HashMap<JobStatus, Vec<JobExecutionSummary>>,
    pub timestamp: Option<i64>,
}

/// Event pushed whenever the next queued execution changes
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextJobExecutionChangedEvent {
    pub execution: Option<JobExecutionData>,
    pub timestamp: Option<i64>,
}

/// Service error body delivered on a rejected topic
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedErrorResponse {
    pub client_token: Option<String>,
    pub code: Option<RejectedErrorCode>,
    pub message: Option<String>,
    pub timestamp: Option<i64>,
    pub execution_state: Option<JobExecutionState>,
}

impl fmt::Display for RejectedErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => write!(f, "{:?}: {}", code, message),
            (Some(code), None) => write!(f, "{:?}", code),
            (None, Some(message)) => write!(f, "{}", message),
            (None, None) => write!(f, "rejected without detail"),
        }
    }
}
