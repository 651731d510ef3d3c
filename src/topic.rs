//! Jobs topic construction and correlation
//!
//! All jobs traffic lives under `$aws/things/{thingName}/jobs/...`. Request
//! topics get a response pair by appending `accepted` / `rejected`; the
//! subscription covers both with a single `+` filter. Path parameters are
//! validated before any transport call so a bad thing name can never turn
//! into a malformed subscription.

use crate::error::{JobsError, Result};

/// Topics for one request/response operation
#[derive(Debug, Clone, PartialEq)]
pub struct RequestTopics {
    /// Topic the request payload is published on
    pub publish: String,
    /// Single filter covering both response topics
    pub subscribe: String,
    /// Topic carrying successful responses
    pub accepted: String,
    /// Topic carrying service rejections
    pub rejected: String,
}

fn request_topics(base: String) -> RequestTopics {
    RequestTopics {
        subscribe: format!("{base}/+"),
        accepted: format!("{base}/accepted"),
        rejected: format!("{base}/rejected"),
        publish: base,
    }
}

/// Validate a topic path parameter such as a thing name or job id
///
/// Rejects empty values and anything that would break out of its topic
/// level (`/`) or be taken for a wildcard (`+`, `#`).
pub fn validate_param(name: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(JobsError::Validation(format!("{name} must not be empty")));
    }
    if value.contains(['/', '+', '#', '\0']) {
        return Err(JobsError::Validation(format!(
            "{name} must not contain '/', '+', '#' or NUL: {value:?}"
        )));
    }
    Ok(())
}

/// Topics for the get-pending-job-executions operation
pub fn get_pending_topics(thing_name: &str) -> Result<RequestTopics> {
    validate_param("thing_name", thing_name)?;
    Ok(request_topics(format!("$aws/things/{thing_name}/jobs/get")))
}

/// Topics for the start-next-pending-job-execution operation
pub fn start_next_topics(thing_name: &str) -> Result<RequestTopics> {
    validate_param("thing_name", thing_name)?;
    Ok(request_topics(format!(
        "$aws/things/{thing_name}/jobs/start-next"
    )))
}

/// Topics for the describe-job-execution operation
pub fn describe_topics(thing_name: &str, job_id: &str) -> Result<RequestTopics> {
    validate_param("thing_name", thing_name)?;
    if job_id != "$next" {
        validate_param("job_id", job_id)?;
    }
    Ok(request_topics(format!(
        "$aws/things/{thing_name}/jobs/{job_id}/get"
    )))
}

/// Topics for the update-job-execution operation
pub fn update_topics(thing_name: &str, job_id: &str) -> Result<RequestTopics> {
    validate_param("thing_name", thing_name)?;
    validate_param("job_id", job_id)?;
    Ok(request_topics(format!(
        "$aws/things/{thing_name}/jobs/{job_id}/update"
    )))
}

/// Topic for the job-executions-changed stream
pub fn executions_changed_topic(thing_name: &str) -> Result<String> {
    validate_param("thing_name", thing_name)?;
    Ok(format!("$aws/things/{thing_name}/jobs/notify"))
}

/// Topic for the next-job-execution-changed stream
pub fn next_execution_changed_topic(thing_name: &str) -> Result<String> {
    validate_param("thing_name", thing_name)?;
    Ok(format!("$aws/things/{thing_name}/jobs/notify-next"))
}

/// Check whether a concrete topic matches an MQTT topic filter
///
/// `+` matches exactly one level, `#` matches the remainder of the topic.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Decides whether an incoming publish resolves a specific pending request
///
/// A publish correlates when its topic is one of the request's response
/// topics and, if the request carried a client token, the payload decodes as
/// JSON with an equal `clientToken`. Requests without a token correlate by
/// topic but decline any payload that carries a `clientToken`, so a tokened
/// sibling pending on the same topic keeps its response. Untokened requests
/// on one topic remain indistinguishable from each other and are claimed in
/// registration order; callers that need to tell concurrent identical
/// operations apart supply a token.
#[derive(Debug, Clone)]
pub struct CorrelationPredicate {
    accepted_topic: String,
    rejected_topic: String,
    token: Option<String>,
}

impl CorrelationPredicate {
    pub fn new(topics: &RequestTopics, token: Option<String>) -> Self {
        Self {
            accepted_topic: topics.accepted.clone(),
            rejected_topic: topics.rejected.clone(),
            token,
        }
    }

    /// True when the publish is the response to this request
    pub fn matches(&self, topic: &str, payload: &[u8]) -> bool {
        if topic != self.accepted_topic && topic != self.rejected_topic {
            return false;
        }

        match &self.token {
            // A tokened response belongs to whichever request sent that
            // token, never to an untokened one.
            None => extract_client_token(payload).is_none(),
            Some(token) => extract_client_token(payload).as_deref() == Some(token),
        }
    }

    /// True when the topic is the rejected response topic
    pub fn is_rejection(&self, topic: &str) -> bool {
        topic == self.rejected_topic
    }
}

fn extract_client_token(payload: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    value
        .get("clientToken")
        .and_then(|token| token.as_str())
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_pending_topics() {
        let topics = get_pending_topics("t1").unwrap();

        assert_eq!(topics.publish, "$aws/things/t1/jobs/get");
        assert_eq!(topics.subscribe, "$aws/things/t1/jobs/get/+");
        assert_eq!(topics.accepted, "$aws/things/t1/jobs/get/accepted");
        assert_eq!(topics.rejected, "$aws/things/t1/jobs/get/rejected");
    }

    #[test]
    fn test_job_scoped_topics() {
        let describe = describe_topics("t1", "job-9").unwrap();
        assert_eq!(describe.publish, "$aws/things/t1/jobs/job-9/get");

        let update = update_topics("t1", "job-9").unwrap();
        assert_eq!(update.publish, "$aws/things/t1/jobs/job-9/update");
        assert_eq!(update.subscribe, "$aws/things/t1/jobs/job-9/update/+");
    }

    #[test]
    fn test_describe_allows_next_sentinel() {
        let topics = describe_topics("t1", "$next").unwrap();
        assert_eq!(topics.publish, "$aws/things/t1/jobs/$next/get");
    }

    #[test]
    fn test_param_validation_rejects_empty_and_wildcards() {
        assert!(matches!(
            get_pending_topics(""),
            Err(JobsError::Validation(_))
        ));
        assert!(matches!(
            get_pending_topics("a/b"),
            Err(JobsError::Validation(_))
        ));
        assert!(matches!(
            update_topics("t1", "job+1"),
            Err(JobsError::Validation(_))
        ));
        assert!(matches!(
            describe_topics("t1", "#"),
            Err(JobsError::Validation(_))
        ));
    }

    #[test]
    fn test_topic_matches_exact() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b"));
        assert!(!topic_matches("a/b", "a/b/c"));
    }

    #[test]
    fn test_topic_matches_single_level_wildcard() {
        assert!(topic_matches(
            "$aws/things/t1/jobs/get/+",
            "$aws/things/t1/jobs/get/accepted"
        ));
        assert!(topic_matches(
            "$aws/things/t1/jobs/get/+",
            "$aws/things/t1/jobs/get/rejected"
        ));
        assert!(!topic_matches(
            "$aws/things/t1/jobs/get/+",
            "$aws/things/t1/jobs/get/accepted/extra"
        ));
        assert!(!topic_matches(
            "$aws/things/t1/jobs/get/+",
            "$aws/things/t2/jobs/get/accepted"
        ));
    }

    #[test]
    fn test_topic_matches_multi_level_wildcard() {
        assert!(topic_matches("a/#", "a/b"));
        assert!(topic_matches("a/#", "a/b/c/d"));
        assert!(!topic_matches("a/#", "b/c"));
    }

    #[test]
    fn test_predicate_matches_by_topic_without_token() {
        let topics = get_pending_topics("t1").unwrap();
        let predicate = CorrelationPredicate::new(&topics, None);

        assert!(predicate.matches("$aws/things/t1/jobs/get/accepted", b"{}"));
        assert!(predicate.matches("$aws/things/t1/jobs/get/rejected", b"{}"));
        assert!(!predicate.matches("$aws/things/t1/jobs/notify", b"{}"));
    }

    #[test]
    fn test_untokened_predicate_declines_tokened_payloads() {
        let topics = get_pending_topics("t1").unwrap();
        let predicate = CorrelationPredicate::new(&topics, None);

        // A response echoing someone's token belongs to that request.
        assert!(!predicate.matches(
            "$aws/things/t1/jobs/get/accepted",
            br#"{"clientToken":"tok-9","inProgressJobs":[]}"#
        ));
        // Tokenless and non-JSON payloads still correlate by topic.
        assert!(predicate.matches("$aws/things/t1/jobs/get/accepted", b"{}"));
        assert!(predicate.matches("$aws/things/t1/jobs/get/accepted", b"not json"));
    }

    #[test]
    fn test_predicate_requires_matching_token() {
        let topics = get_pending_topics("t1").unwrap();
        let predicate = CorrelationPredicate::new(&topics, Some("tok-1".to_string()));

        assert!(predicate.matches(
            "$aws/things/t1/jobs/get/accepted",
            br#"{"clientToken":"tok-1"}"#
        ));
        assert!(!predicate.matches(
            "$aws/things/t1/jobs/get/accepted",
            br#"{"clientToken":"tok-2"}"#
        ));
        // Token set, payload has none: not ours.
        assert!(!predicate.matches("$aws/things/t1/jobs/get/accepted", b"{}"));
        // Unparseable payloads never correlate to a tokened request.
        assert!(!predicate.matches("$aws/things/t1/jobs/get/accepted", b"not json"));
    }

    #[test]
    fn test_predicate_rejection_topic() {
        let topics = start_next_topics("t1").unwrap();
        let predicate = CorrelationPredicate::new(&topics, None);

        assert!(predicate.is_rejection("$aws/things/t1/jobs/start-next/rejected"));
        assert!(!predicate.is_rejection("$aws/things/t1/jobs/start-next/accepted"));
    }
}
