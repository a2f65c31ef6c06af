//! End-to-end scenarios over real sockets and real child processes, with
//! the tests playing the part of the Lambda runtime inside the child.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crie_tester::{spawn_echo_runtime, spawn_emulator, spawn_failing_runtime};

#[tokio::test]
async fn invoke_round_trips_through_a_worker() {
    let em = spawn_emulator(19100, &[("CRIE_MAX_CONCURRENCY", "1")])
        .await
        .unwrap();
    let polls = Arc::new(AtomicU32::new(0));
    let runtime = spawn_echo_runtime(em.rapi_url(0), Arc::clone(&polls), Duration::ZERO);

    let client = reqwest::Client::new();
    let response = client
        .post(em.invoke_url())
        .body("{\"x\":1}")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"{\"x\":1}");

    em.stop().await;
    runtime.abort();
}

#[tokio::test]
async fn event_invocations_are_accepted_and_still_reach_the_worker_once() {
    let em = spawn_emulator(19150, &[("CRIE_MAX_CONCURRENCY", "1")])
        .await
        .unwrap();
    let polls = Arc::new(AtomicU32::new(0));
    let runtime = spawn_echo_runtime(em.rapi_url(0), Arc::clone(&polls), Duration::ZERO);

    let client = reqwest::Client::new();
    let response = client
        .post(em.invoke_url())
        .header("X-Amz-Invocation-Type", "Event")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    assert!(response.bytes().await.unwrap().is_empty());

    let deadline = Instant::now() + Duration::from_secs(2);
    while polls.load(Ordering::SeqCst) < 1 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // Exactly one poll served for exactly one event invocation.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(polls.load(Ordering::SeqCst), 1);

    em.stop().await;
    runtime.abort();
}

#[tokio::test]
async fn a_silent_worker_hits_the_runtime_deadline() {
    let em = spawn_emulator(
        19200,
        &[
            ("CRIE_MAX_CONCURRENCY", "1"),
            ("CRIE_LAMBDA_RUNTIME_DEADLINE", "200ms"),
            ("CRIE_RAPI_SERVER_SHUTDOWN_TIMEOUT", "1s"),
            ("CRIE_SERVER_SHUTDOWN_TIMEOUT", "2s"),
        ],
    )
    .await
    .unwrap();
    // No runtime client: the invocation is bound but never answered.

    let client = reqwest::Client::new();
    let response = client
        .post(em.invoke_url())
        .body("{}")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
    let value: serde_json::Value = response.json().await.unwrap();
    assert_eq!(value["message"], "lambda timeout after 200ms");

    em.stop().await;
}

#[tokio::test]
async fn a_child_error_payload_is_passed_through_as_bad_gateway() {
    let em = spawn_emulator(19250, &[("CRIE_MAX_CONCURRENCY", "1")])
        .await
        .unwrap();
    let polls = Arc::new(AtomicU32::new(0));
    let runtime = spawn_failing_runtime(
        em.rapi_url(0),
        Arc::clone(&polls),
        "{\"errorMessage\":\"boom\"}",
    );

    let client = reqwest::Client::new();
    let response = client
        .post(em.invoke_url())
        .body("{}")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
    assert_eq!(
        response.bytes().await.unwrap().as_ref(),
        b"{\"errorMessage\":\"boom\"}"
    );

    em.stop().await;
    runtime.abort();
}

#[tokio::test]
async fn graceful_shutdown_finishes_in_flight_work_and_fails_queued_work() {
    let em = spawn_emulator(
        19300,
        &[
            ("CRIE_MAX_CONCURRENCY", "1"),
            ("CRIE_RAPI_SERVER_SHUTDOWN_TIMEOUT", "2s"),
            ("CRIE_SERVER_SHUTDOWN_TIMEOUT", "3s"),
        ],
    )
    .await
    .unwrap();
    let polls = Arc::new(AtomicU32::new(0));
    let runtime = spawn_echo_runtime(
        em.rapi_url(0),
        Arc::clone(&polls),
        Duration::from_millis(400),
    );

    let client = reqwest::Client::new();

    let in_flight = {
        let client = client.clone();
        let url = em.invoke_url();
        tokio::spawn(async move { client.post(url).body("{\"a\":1}").send().await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;

    let queued = {
        let client = client.clone();
        let url = em.invoke_url();
        tokio::spawn(async move { client.post(url).body("{\"b\":2}").send().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    em.trigger_shutdown();

    let started = Instant::now();
    let in_flight = in_flight.await.unwrap().unwrap();
    assert_eq!(in_flight.status(), reqwest::StatusCode::OK);
    assert_eq!(in_flight.bytes().await.unwrap().as_ref(), b"{\"a\":1}");

    let queued = queued.await.unwrap().unwrap();
    assert_eq!(queued.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    let value: serde_json::Value = queued.json().await.unwrap();
    assert_eq!(value["message"], "server shutdown");

    em.stop().await;
    assert!(started.elapsed() < Duration::from_secs(10));
    runtime.abort();
}

#[tokio::test]
async fn admission_is_bounded_by_the_queue_capacity() {
    let em = spawn_emulator(
        19350,
        &[
            ("CRIE_MAX_CONCURRENCY", "1"),
            ("CRIE_QUEUE_SIZE", "1"),
            ("CRIE_WAIT_FOR_QUEUE_CAPACITY", "10ms"),
            ("CRIE_LAMBDA_RUNTIME_DEADLINE", "500ms"),
            ("CRIE_RAPI_SERVER_SHUTDOWN_TIMEOUT", "1s"),
            ("CRIE_SERVER_SHUTDOWN_TIMEOUT", "2s"),
        ],
    )
    .await
    .unwrap();
    // No runtime client, so every admitted invocation parks until its
    // deadline and the pipeline stays saturated.

    let client = reqwest::Client::new();
    let mut requests = Vec::new();
    for _ in 0..4 {
        let client = client.clone();
        let url = em.invoke_url();
        requests.push(tokio::spawn(async move {
            client.post(url).body("{}").send().await
        }));
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    let mut rejected = Vec::new();
    for request in requests {
        let response = request.await.unwrap().unwrap();
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let value: serde_json::Value = response.json().await.unwrap();
            rejected.push(value["message"].as_str().unwrap().to_string());
        }
    }

    assert!(!rejected.is_empty(), "expected at least one 429");
    for message in rejected {
        assert!(message.starts_with("invocation queue is full: "));
    }

    em.stop().await;
}
