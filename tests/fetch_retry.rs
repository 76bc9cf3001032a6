mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use amanakshar::fetch::{
    ApiClient, ApiQuery, ApiRequestError, Mutation, RequestState, RetryOptions, error_message,
    fetch_with_retry, fetch_with_retry_cancellable,
};
use amanakshar::net::FetchRequest;
use axum::http::{Method, StatusCode};
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use common::{FakeNetwork, Reply, origin, url};

const FEATURED: &str = "/api/poems/featured";

fn options(retries: u32) -> RetryOptions {
    RetryOptions {
        retries,
        retry_delay: Duration::from_millis(100),
        ..RetryOptions::default()
    }
}

fn featured() -> FetchRequest {
    FetchRequest::get(origin().join(FEATURED).expect("url"))
}

fn exclusive<T>(state: &RequestState<T>) -> bool {
    [state.is_loading(), state.is_error(), state.is_success()]
        .into_iter()
        .filter(|flag| *flag)
        .count()
        <= 1
}

#[tokio::test(start_paused = true)]
async fn retries_are_bounded_and_surface_the_last_status() {
    for retries in [0, 1, 3] {
        let network = FakeNetwork::new();
        network.always(
            &url(FEATURED),
            Reply::status(StatusCode::SERVICE_UNAVAILABLE, "{\"error\":\"busy\"}"),
        );

        let error = fetch_with_retry(&network, &featured(), &options(retries))
            .await
            .expect_err("always 503");

        assert_eq!(network.calls_to(&url(FEATURED)), retries as usize + 1);
        assert_eq!(error.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(error.to_string(), "busy");
    }
}

#[tokio::test(start_paused = true)]
async fn success_and_non_retryable_statuses_return_after_one_call() {
    let network = FakeNetwork::new();
    network.always(&url(FEATURED), Reply::ok("[]"));
    let response = fetch_with_retry(&network, &featured(), &options(3))
        .await
        .expect("ok");
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(network.calls_to(&url(FEATURED)), 1);

    let network = FakeNetwork::new();
    network.always(&url(FEATURED), Reply::status(StatusCode::NOT_FOUND, "gone"));
    let response = fetch_with_retry(&network, &featured(), &options(3))
        .await
        .expect("404 is returned, not thrown");
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(network.calls_to(&url(FEATURED)), 1);
}

#[tokio::test(start_paused = true)]
async fn backoff_doubles_between_attempts() {
    let network = FakeNetwork::new();
    network.always(&url(FEATURED), Reply::Fail);
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&attempts);
    let options = options(3).with_on_retry(move |attempt, err| {
        recorded
            .lock()
            .expect("attempts lock")
            .push((attempt, err.clone()));
    });

    let error = fetch_with_retry(&network, &featured(), &options)
        .await
        .expect_err("offline");
    assert!(matches!(error, ApiRequestError::Network(_)));

    let times = network.call_times(&url(FEATURED));
    let gaps: Vec<Duration> = times.windows(2).map(|pair| pair[1] - pair[0]).collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400),
        ]
    );

    let attempts = attempts.lock().expect("attempts lock");
    let numbers: Vec<u32> = attempts.iter().map(|(attempt, _)| *attempt).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn slow_attempts_time_out_as_408() {
    let network = FakeNetwork::new();
    network.always(
        &url(FEATURED),
        Reply::after(Duration::from_secs(30), Reply::ok("[]")),
    );
    let options = RetryOptions {
        retries: 1,
        retry_delay: Duration::from_millis(10),
        timeout: Duration::from_secs(1),
        ..RetryOptions::default()
    };

    let error = fetch_with_retry(&network, &featured(), &options)
        .await
        .expect_err("timeout");

    assert_eq!(error, ApiRequestError::Timeout);
    assert_eq!(error.status(), Some(StatusCode::REQUEST_TIMEOUT));
    assert_eq!(network.calls_to(&url(FEATURED)), 2);
}

#[tokio::test(start_paused = true)]
async fn cancellation_aborts_during_backoff_without_retrying() {
    let network = FakeNetwork::new();
    network.always(&url(FEATURED), Reply::status(StatusCode::BAD_GATEWAY, ""));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let error = fetch_with_retry_cancellable(&network, &featured(), &options(3), &cancel)
        .await
        .expect_err("aborted");

    assert_eq!(error, ApiRequestError::Aborted);
    assert_eq!(network.calls_to(&url(FEATURED)), 1);
    assert_eq!(error_message(&error), error_message(&ApiRequestError::Network(String::new())));
}

#[tokio::test(start_paused = true)]
async fn client_helpers_decode_json_and_report_status_errors() {
    let network = Arc::new(FakeNetwork::new());
    network.always(&url(FEATURED), Reply::ok("[{\"id\":1}]"));
    network.always(
        &url("/api/poems/404"),
        Reply::status(StatusCode::NOT_FOUND, "{\"error\":\"nahi mila\"}"),
    );
    let client = ApiClient::new(origin(), network.clone()).with_options(options(2));

    let poems: Value = client.get(FEATURED).await.expect("json");
    assert_eq!(poems, json!([{ "id": 1 }]));

    let error = client
        .get::<Value>("/api/poems/404")
        .await
        .expect_err("404");
    assert_eq!(error.status(), Some(StatusCode::NOT_FOUND));
    assert_eq!(error.data(), Some(&json!({ "error": "nahi mila" })));
    assert_eq!(network.calls_to(&url("/api/poems/404")), 1);
}

#[tokio::test(start_paused = true)]
async fn a_second_execute_supersedes_the_first() {
    let network = Arc::new(FakeNetwork::new());
    network.once(
        &url(FEATURED),
        Reply::after(Duration::from_millis(200), Reply::ok("1")),
    );
    network.once(
        &url(FEATURED),
        Reply::after(Duration::from_millis(20), Reply::ok("2")),
    );
    let client = ApiClient::new(origin(), network.clone());
    let query: ApiQuery<u32> = ApiQuery::new(client, FEATURED);

    let (first, second) = tokio::join!(query.execute(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        query.execute().await
    });

    assert_eq!(first, None);
    assert_eq!(second, Some(2));
    let state = query.state();
    assert!(state.is_success());
    assert_eq!(state.data, Some(2));
}

#[tokio::test(start_paused = true)]
async fn immediate_queries_execute_on_mount() {
    let network = Arc::new(FakeNetwork::new());
    network.always(&url(FEATURED), Reply::ok("7"));
    let seen = Arc::new(Mutex::new(None));
    let hook = Arc::clone(&seen);
    let query: ApiQuery<u32> = ApiQuery::new(ApiClient::new(origin(), network.clone()), FEATURED)
        .immediate(true)
        .on_success(move |value| *hook.lock().expect("seen lock") = Some(*value));

    assert_eq!(query.mount().await, Some(7));
    assert_eq!(*seen.lock().expect("seen lock"), Some(7));

    query.unmount();
    assert_eq!(query.execute().await, None);
    assert_eq!(network.calls_to(&url(FEATURED)), 1);
}

#[tokio::test]
async fn mutation_states_are_exclusive_through_the_lifecycle() {
    let gate = Arc::new(Notify::new());
    let release = Arc::clone(&gate);
    let mutation = Arc::new(Mutation::new(move |liked: bool| {
        let gate = Arc::clone(&gate);
        async move {
            gate.notified().await;
            if liked {
                Ok(1_u32)
            } else {
                Err(ApiRequestError::Status {
                    status: StatusCode::TOO_MANY_REQUESTS,
                    status_text: "Too Many Requests".to_string(),
                    data: None,
                })
            }
        }
    }));
    let mut states = mutation.subscribe();
    assert!(mutation.state().is_idle());

    for (liked, expect_success) in [(true, true), (false, false)] {
        let running = Arc::clone(&mutation);
        let task = tokio::spawn(async move { running.mutate(liked).await });

        states.changed().await.expect("loading published");
        let loading = states.borrow_and_update().clone();
        assert!(loading.is_loading());
        assert!(exclusive(&loading));

        release.notify_one();
        let result = task.await.expect("mutation task");
        assert_eq!(result.is_some(), expect_success);

        let settled = mutation.state();
        assert!(exclusive(&settled));
        assert_eq!(settled.is_success(), expect_success);
        assert_eq!(settled.is_error(), !expect_success);
        states.borrow_and_update();
    }

    mutation.reset();
    let reset = mutation.state();
    assert!(reset.is_idle());
    assert!(exclusive(&reset));
}

#[tokio::test]
async fn json_mutations_make_a_single_attempt() {
    let network = Arc::new(FakeNetwork::new());
    network.always(
        &url("/api/poems/7/like"),
        Reply::status(StatusCode::SERVICE_UNAVAILABLE, ""),
    );
    let client = ApiClient::new(origin(), network.clone());
    let mutation: Mutation<Value, Value> =
        Mutation::json(client, Method::POST, "/api/poems/7/like");

    let error = mutation
        .mutate_async(json!({ "liked": true }))
        .await
        .expect_err("503");

    assert_eq!(error.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
    assert_eq!(network.calls_to(&url("/api/poems/7/like")), 1);
    assert!(mutation.state().is_error());
}
