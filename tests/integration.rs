//! End-to-end scenarios for the jobs client over the mock transport

use mqtt_jobs::testing::{MockCall, MockTransport};
use mqtt_jobs::{
    GetPendingJobExecutionsRequest, JobsClient, JobsClientConfig, JobsError,
    StartNextPendingJobExecutionRequest,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn new_client(timeout: Duration) -> (JobsClient, Arc<MockTransport>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let (transport, incoming) = MockTransport::with_incoming();
    let transport = Arc::new(transport);
    let config = JobsClientConfig::new().operation_timeout(timeout);
    let client = JobsClient::new(transport.clone(), incoming, config);
    (client, transport)
}

async fn wait_for_publish(transport: &MockTransport, topic: &str, count: usize) {
    for _ in 0..200 {
        if transport.published_payloads(topic).len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("publish on {topic} never observed");
}

#[tokio::test]
async fn test_get_pending_job_executions_end_to_end() {
    let (client, transport) = new_client(Duration::from_secs(1));
    transport.respond_on_publish(
        "$aws/things/t1/jobs/get",
        "$aws/things/t1/jobs/get/accepted",
        br#"{"queuedJobs":[],"inProgressJobs":[]}"#.to_vec(),
    );

    let response = client
        .get_pending_job_executions(GetPendingJobExecutionsRequest {
            thing_name: "t1".to_string(),
            client_token: None,
        })
        .await
        .unwrap();

    assert!(response.queued_jobs.is_empty());
    assert!(response.in_progress_jobs.is_empty());

    // The exchange went over exactly the documented topics, subscribe
    // before publish, with an empty JSON object as the request body.
    let calls = transport.calls();
    assert_eq!(
        calls[0],
        MockCall::Subscribe {
            topic_filter: "$aws/things/t1/jobs/get/+".to_string(),
            qos: mqtt_jobs::QoS::AtLeastOnce,
        }
    );
    assert!(matches!(
        &calls[1],
        MockCall::Publish { topic, payload, .. }
            if topic == "$aws/things/t1/jobs/get" && payload == b"{}"
    ));
}

#[tokio::test]
async fn test_job_executions_changed_stream_receives_in_order() {
    let (client, transport) = new_client(Duration::from_secs(1));

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let stream = client
        .create_job_executions_changed_stream("t1", move |event| {
            let ids: Vec<String> = event
                .jobs
                .values()
                .flatten()
                .filter_map(|summary| summary.job_id.clone())
                .collect();
            sink.lock().extend(ids);
        })
        .unwrap();
    stream.open().await.unwrap();

    transport.deliver(
        "$aws/things/t1/jobs/notify",
        br#"{"jobs":{"QUEUED":[{"jobId":"job-a"}]},"timestamp":1}"#.to_vec(),
    );
    transport.deliver(
        "$aws/things/t1/jobs/notify",
        br#"{"jobs":{"QUEUED":[{"jobId":"job-b"}]},"timestamp":2}"#.to_vec(),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*seen.lock(), vec!["job-a".to_string(), "job-b".to_string()]);
    stream.close();
}

#[tokio::test]
async fn test_stream_skips_malformed_events_and_continues() {
    let (client, transport) = new_client(Duration::from_secs(1));

    let count = Arc::new(Mutex::new(0usize));
    let sink = count.clone();
    let stream = client
        .create_next_job_execution_changed_stream("t1", move |_event| {
            *sink.lock() += 1;
        })
        .unwrap();
    stream.open().await.unwrap();

    transport.deliver("$aws/things/t1/jobs/notify-next", b"garbage".to_vec());
    transport.deliver(
        "$aws/things/t1/jobs/notify-next",
        br#"{"execution":null,"timestamp":3}"#.to_vec(),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The malformed event is skipped, the stream keeps delivering.
    assert_eq!(*count.lock(), 1);
    stream.close();
}

#[tokio::test]
async fn test_stream_and_request_topics_tear_down_independently() {
    let (client, transport) = new_client(Duration::from_millis(300));

    // A stream on the notify topic and a request on the get topic each
    // get exactly one subscribe/unsubscribe pair of their own.
    let stream = client
        .create_job_executions_changed_stream("t1", |_event| {})
        .unwrap();
    stream.open().await.unwrap();

    let request = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .get_pending_job_executions(GetPendingJobExecutionsRequest {
                    thing_name: "t1".to_string(),
                    client_token: None,
                })
                .await
        }
    });
    wait_for_publish(&transport, "$aws/things/t1/jobs/get", 1).await;
    transport.deliver(
        "$aws/things/t1/jobs/get/accepted",
        br#"{"queuedJobs":[],"inProgressJobs":[]}"#.to_vec(),
    );
    request.await.unwrap().unwrap();

    stream.close();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(transport.subscribe_calls("$aws/things/t1/jobs/get/+"), 1);
    assert_eq!(transport.unsubscribe_calls("$aws/things/t1/jobs/get/+"), 1);
    assert_eq!(transport.subscribe_calls("$aws/things/t1/jobs/notify"), 1);
    assert_eq!(transport.unsubscribe_calls("$aws/things/t1/jobs/notify"), 1);
}

#[tokio::test]
async fn test_concurrent_tokened_requests_on_one_topic() {
    let (client, transport) = new_client(Duration::from_secs(1));

    let mut handles = Vec::new();
    for i in 0..4 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let token = format!("token-{i}");
            let response = client
                .get_pending_job_executions(GetPendingJobExecutionsRequest {
                    thing_name: "t1".to_string(),
                    client_token: Some(token.clone()),
                })
                .await?;
            Ok::<_, JobsError>((token, response))
        }));
    }
    wait_for_publish(&transport, "$aws/things/t1/jobs/get", 4).await;

    // Answer in reverse submission order; each call must still get its own
    // response back.
    for i in (0..4).rev() {
        transport.deliver(
            "$aws/things/t1/jobs/get/accepted",
            format!(r#"{{"clientToken":"token-{i}","timestamp":{i},"queuedJobs":[],"inProgressJobs":[]}}"#)
                .into_bytes(),
        );
    }

    for handle in handles {
        let (token, response) = handle.await.unwrap().unwrap();
        assert_eq!(response.client_token.as_deref(), Some(token.as_str()));
    }

    // All four shared one subscription, torn down exactly once.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.subscribe_calls("$aws/things/t1/jobs/get/+"), 1);
    assert_eq!(transport.unsubscribe_calls("$aws/things/t1/jobs/get/+"), 1);
}

#[tokio::test]
async fn test_timeout_produces_error_and_no_leaked_subscription() {
    let (client, transport) = new_client(Duration::from_millis(50));

    let result = client
        .start_next_pending_job_execution(StartNextPendingJobExecutionRequest {
            thing_name: "t1".to_string(),
            ..Default::default()
        })
        .await;
    assert!(matches!(result, Err(JobsError::Timeout)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        transport.subscribe_calls("$aws/things/t1/jobs/start-next/+"),
        1
    );
    assert_eq!(
        transport.unsubscribe_calls("$aws/things/t1/jobs/start-next/+"),
        1
    );

    // A late response after the timeout is silently dropped.
    transport.deliver(
        "$aws/things/t1/jobs/start-next/accepted",
        br#"{"timestamp":9}"#.to_vec(),
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn test_close_interrupts_everything() {
    let (client, transport) = new_client(Duration::from_secs(30));

    let stream = client
        .create_job_executions_changed_stream("t1", |_event| {})
        .unwrap();
    stream.open().await.unwrap();

    let inflight = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .get_pending_job_executions(GetPendingJobExecutionsRequest {
                    thing_name: "t1".to_string(),
                    client_token: None,
                })
                .await
        }
    });
    wait_for_publish(&transport, "$aws/things/t1/jobs/get", 1).await;

    client.close();

    assert!(matches!(
        inflight.await.unwrap(),
        Err(JobsError::ClientClosed)
    ));
    assert!(!stream.is_open());
}
