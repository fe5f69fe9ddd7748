use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use http::{HeaderMap, StatusCode};
use http::header::{HeaderName, HeaderValue};
use reqflow::stub::{StubEvent, StubMatcher, StubResponse, StubTransport};
use reqflow::{
    CachePolicy, DefaultValidator, DependencyError, DependencyQueue, Error, ErrorCode,
    ExchangeContext, HttpClient, Observer, OperationHandle, Payload, PreparedRequest, Request,
    RequestPhase, Response, ResponseMetadata, Transport, TransportErrorKind, TransportEvents,
    ValidationOutcome,
};
use serde_json::{Value, json};

const BASE_URL: &str = "http://stub.local";

fn direct_client(stub: &StubTransport) -> HttpClient {
    HttpClient::builder(BASE_URL).build(stub.clone())
}

fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn invalid_response_source(
    response: &Response,
) -> &(dyn std::error::Error + Send + Sync + 'static) {
    match response.error() {
        Some(Error::InvalidResponse { source, .. }) => &**source,
        other => panic!("expected invalid response error, got {other:?}"),
    }
}

/// Sends `/token` (and `/session` for a 401 on `/token`) before retrying a 401.
fn refresh_validator(
    token: Request,
    session: Request,
) -> impl Fn(&Response) -> ValidationOutcome + Send + Sync + 'static {
    move |response: &Response| {
        if response.status() != Some(StatusCode::UNAUTHORIZED) {
            return ValidationOutcome::Passed;
        }
        match response.request().as_ref().map(Request::path) {
            Some("/orders") => ValidationOutcome::RetryAfter(token.clone()),
            Some("/token") => ValidationOutcome::RetryAfter(session.clone()),
            _ => ValidationOutcome::Passed,
        }
    }
}

#[derive(Clone, Default)]
struct RecordingObserver {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingObserver {
    fn record(&self, kind: &str, context: &ExchangeContext) {
        self.events
            .lock()
            .expect("lock observer events")
            .push(format!("{kind} {}", context.uri()));
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().expect("lock observer events").clone()
    }
}

impl Observer for RecordingObserver {
    fn on_dispatch(&self, context: &ExchangeContext) {
        self.record("dispatch", context);
    }

    fn on_retry_scheduled(&self, context: &ExchangeContext) {
        self.record("retry", context);
    }

    fn on_chain_scheduled(&self, context: &ExchangeContext, _alt: &Request) {
        self.record("chain", context);
    }

    fn on_delivered(&self, context: &ExchangeContext, _response: &Response) {
        self.record("delivered", context);
    }

    fn on_cancelled(&self, context: &ExchangeContext) {
        self.record("cancelled", context);
    }
}

#[test]
fn single_pass_delivers_exactly_once() {
    let stub = StubTransport::new();
    stub.on(
        StubMatcher::get("/items"),
        StubResponse::ok().json(json!({ "items": [1, 2] })),
    );
    let client = direct_client(&stub);

    let request = Request::get("/items").build();
    let callbacks = Arc::new(AtomicUsize::new(0));
    let callbacks_in_listener = Arc::clone(&callbacks);
    request.on_response(move |_| {
        callbacks_in_listener.fetch_add(1, Ordering::SeqCst);
    });

    let response = client.send(request.clone()).wait().expect("response delivered");
    assert!(response.is_success());
    assert_eq!(response.status(), Some(StatusCode::OK));
    let body: Value = response.json().expect("json body");
    assert_eq!(body["items"], json!([1, 2]));

    assert_eq!(callbacks.load(Ordering::SeqCst), 1);
    assert_eq!(request.phase(), RequestPhase::Delivered);
    assert_eq!(request.current_retry(), 0);
    assert_eq!(stub.started_count(), 1);

    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.requests_submitted, 1);
    assert_eq!(metrics.exchanges_dispatched, 1);
    assert_eq!(metrics.delivered_ok, 1);
    assert_eq!(metrics.in_flight, 0);
    assert_eq!(metrics.status_counts.get(&200), Some(&1));
}

#[test]
fn retryable_status_exhausts_budget_after_max_retries_dispatches() {
    let stub = StubTransport::new();
    stub.on(
        StubMatcher::get("/flaky"),
        StubResponse::status(StatusCode::SERVICE_UNAVAILABLE).body("busy"),
    );
    let client = direct_client(&stub);

    let request = Request::get("/flaky").max_retries(3).build();
    let response = client.send(request.clone()).wait().expect("response delivered");

    assert_eq!(stub.started_count(), 3);
    assert_eq!(request.current_retry(), 3);
    assert_eq!(response.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
    assert_eq!(response.body(), "busy");
    match response.error() {
        Some(Error::MaxRetryAttemptsReached { attempts, uri, .. }) => {
            assert_eq!(*attempts, 3);
            assert_eq!(uri, "http://stub.local/flaky");
        }
        other => panic!("expected retry exhaustion, got {other:?}"),
    }

    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.retries, 2);
    assert_eq!(metrics.retries_exhausted, 1);
    assert_eq!(metrics.status_counts.get(&503), Some(&3));
    assert_eq!(
        metrics.error_counts.get("max_retry_attempts_reached"),
        Some(&1)
    );
}

#[test]
fn retry_then_success_keeps_counter() {
    let stub = StubTransport::new();
    stub.on_sequence(
        StubMatcher::get("/flaky"),
        [
            StubResponse::status(StatusCode::BAD_GATEWAY),
            StubResponse::status(StatusCode::TOO_MANY_REQUESTS),
            StubResponse::ok().body("done"),
        ],
    );
    let observer = RecordingObserver::default();
    let client = HttpClient::builder(BASE_URL)
        .observer(observer.clone())
        .build(stub.clone());

    let request = Request::get("/flaky").max_retries(5).build();
    let response = client.send(request.clone()).wait().expect("response delivered");

    assert!(response.is_success());
    assert_eq!(response.attempt(), 2);
    assert_eq!(request.current_retry(), 2);
    assert_eq!(stub.started_count(), 3);
    assert_eq!(
        observer.events(),
        vec![
            "dispatch http://stub.local/flaky",
            "retry http://stub.local/flaky",
            "dispatch http://stub.local/flaky",
            "retry http://stub.local/flaky",
            "dispatch http://stub.local/flaky",
            "delivered http://stub.local/flaky",
        ]
    );
}

#[test]
fn zero_max_retries_dispatches_once() {
    let stub = StubTransport::new();
    stub.on(
        StubMatcher::get("/flaky"),
        StubResponse::status(StatusCode::INTERNAL_SERVER_ERROR),
    );
    let client = direct_client(&stub);

    let response = client
        .send(Request::get("/flaky"))
        .wait()
        .expect("response delivered");

    assert_eq!(stub.started_count(), 1);
    assert!(matches!(
        response.error(),
        Some(Error::MaxRetryAttemptsReached { attempts: 1, .. })
    ));
}

#[test]
fn build_failure_is_delivered_without_dispatch() {
    let stub = StubTransport::new();
    let client = direct_client(&stub);

    let request = Request::get("/items").try_header("bad header", "value").build();
    let response = client.send(request.clone()).wait().expect("response delivered");

    assert_eq!(stub.started_count(), 0);
    assert_eq!(request.phase(), RequestPhase::Delivered);
    let error = response.error().expect("build error");
    assert_eq!(error.code(), ErrorCode::FailedBuildingRequest);
    assert_eq!(client.metrics_snapshot().build_failures, 1);
}

#[test]
fn client_error_is_retried_by_default() {
    let stub = StubTransport::new();
    stub.on(
        StubMatcher::get("/missing"),
        StubResponse::status(StatusCode::NOT_FOUND).body("nope"),
    );
    let client = direct_client(&stub);

    let response = client
        .send(Request::get("/missing").max_retries(3))
        .wait()
        .expect("response delivered");

    assert_eq!(stub.started_count(), 3);
    assert!(matches!(
        response.error(),
        Some(Error::MaxRetryAttemptsReached { attempts: 3, .. })
    ));
}

#[test]
fn narrowed_status_set_fails_client_errors_with_status_cause() {
    let stub = StubTransport::new();
    stub.on(
        StubMatcher::get("/missing"),
        StubResponse::status(StatusCode::NOT_FOUND).body("nope"),
    );
    let client = HttpClient::builder(BASE_URL)
        .default_validator(DefaultValidator::standard().retryable_status_codes([503]))
        .build(stub.clone());

    let response = client
        .send(Request::get("/missing").max_retries(3))
        .wait()
        .expect("response delivered");

    assert_eq!(stub.started_count(), 1);
    let cause = invalid_response_source(&response)
        .downcast_ref::<Error>()
        .expect("status error cause");
    assert!(matches!(
        cause,
        Error::HttpStatus { status: 404, method, uri, body, .. }
            if *method == http::Method::GET
                && uri == "http://stub.local/missing"
                && body == "nope"
    ));
}

#[test]
fn transport_errors_are_retried_by_default() {
    let stub = StubTransport::new();
    stub.on(
        StubMatcher::get("/tls"),
        StubResponse::transport_error(TransportErrorKind::Tls, "bad certificate"),
    );
    stub.on(
        StubMatcher::get("/refused"),
        StubResponse::transport_error(TransportErrorKind::Connect, "connection refused"),
    );
    let client = direct_client(&stub);

    let tls = client
        .send(Request::get("/tls").max_retries(3))
        .wait()
        .expect("response delivered");
    assert!(tls.metadata().is_none());
    assert!(matches!(
        tls.error(),
        Some(Error::MaxRetryAttemptsReached { attempts: 3, .. })
    ));

    let refused = client
        .send(Request::get("/refused").max_retries(2))
        .wait()
        .expect("response delivered");
    assert!(matches!(
        refused.error(),
        Some(Error::MaxRetryAttemptsReached { attempts: 2, .. })
    ));
    assert_eq!(stub.started_count(), 5);
}

#[test]
fn narrowed_transport_kinds_fail_other_errors_without_retry() {
    let stub = StubTransport::new();
    stub.on(
        StubMatcher::get("/tls"),
        StubResponse::transport_error(TransportErrorKind::Tls, "bad certificate"),
    );
    let client = HttpClient::builder(BASE_URL)
        .default_validator(
            DefaultValidator::standard().retryable_transport_error_kinds([
                TransportErrorKind::Connect,
            ]),
        )
        .build(stub.clone());

    let tls = client
        .send(Request::get("/tls").max_retries(3))
        .wait()
        .expect("response delivered");

    assert_eq!(stub.started_count(), 1);
    let cause = invalid_response_source(&tls)
        .downcast_ref::<Arc<Error>>()
        .expect("transport error cause");
    assert_eq!(cause.transport_kind(), Some(TransportErrorKind::Tls));
}

fn refresh_stub() -> StubTransport {
    let stub = StubTransport::new();
    stub.on_sequence(
        StubMatcher::get("/orders"),
        [
            StubResponse::status(StatusCode::UNAUTHORIZED),
            StubResponse::ok().json(json!({ "orders": [] })),
        ],
    );
    stub.on(
        StubMatcher::post("/token"),
        StubResponse::ok()
            .json(json!({ "token": "fresh" }))
            .delay(Duration::from_millis(20)),
    );
    stub
}

fn assert_refresh_ordering(stub: &StubTransport) {
    assert_eq!(stub.started_paths(), vec!["/orders", "/token", "/orders"]);
    let events = stub.events();
    let token_completed = events
        .iter()
        .position(|event| matches!(event, StubEvent::Completed { path, .. } if path == "/token"))
        .expect("token exchange completed");
    let orders_restarted = events
        .iter()
        .enumerate()
        .filter(|(_, event)| matches!(event, StubEvent::Started { path, .. } if path == "/orders"))
        .map(|(index, _)| index)
        .nth(1)
        .expect("orders re-dispatched");
    assert!(token_completed < orders_restarted);
}

#[test]
fn retry_after_runs_alt_first_in_direct_mode() {
    let stub = refresh_stub();
    let token = Request::post("/token").build();
    let session = Request::post("/session").build();
    let observer = RecordingObserver::default();
    let client = HttpClient::builder(BASE_URL)
        .validator(refresh_validator(token.clone(), session))
        .observer(observer.clone())
        .build(stub.clone());

    let original = Request::get("/orders").max_retries(1).build();
    let response = client.send(original.clone()).wait().expect("response delivered");

    assert!(response.is_success());
    assert_eq!(original.current_retry(), 0);
    assert_eq!(token.phase(), RequestPhase::Delivered);
    assert_refresh_ordering(&stub);
    assert_eq!(client.metrics_snapshot().chains, 1);
    assert_eq!(
        observer.events(),
        vec![
            "dispatch http://stub.local/orders",
            "chain http://stub.local/orders",
            "dispatch http://stub.local/token",
            "delivered http://stub.local/token",
            "dispatch http://stub.local/orders",
            "delivered http://stub.local/orders",
        ]
    );
}

#[test]
fn retry_after_links_alt_first_in_queued_mode() {
    let stub = refresh_stub();
    let token = Request::post("/token").build();
    let session = Request::post("/session").build();
    let client = HttpClient::builder(BASE_URL)
        .validator(refresh_validator(token.clone(), session))
        .queue(DependencyQueue::new(4))
        .build(stub.clone());

    let original = Request::get("/orders").build();
    let response = client.send(original.clone()).wait().expect("response delivered");

    assert!(response.is_success());
    assert_eq!(original.current_retry(), 0);
    assert_refresh_ordering(&stub);
    let queue = client.queue().expect("queue configured");
    assert!(wait_until(|| queue.is_empty()));
}

#[test]
fn retry_then_chain_leaves_counter_at_one() {
    for queue in [None, Some(DependencyQueue::new(4))] {
        let stub = StubTransport::new();
        stub.on_sequence(
            StubMatcher::get("/orders"),
            [
                StubResponse::status(StatusCode::SERVICE_UNAVAILABLE),
                StubResponse::status(StatusCode::UNAUTHORIZED),
                StubResponse::ok(),
            ],
        );
        stub.on(StubMatcher::post("/token"), StubResponse::ok());
        let token = Request::post("/token").build();
        let session = Request::post("/session").build();
        let mut builder =
            HttpClient::builder(BASE_URL).validator(refresh_validator(token, session));
        if let Some(queue) = queue {
            builder = builder.queue(queue);
        }
        let client = builder.build(stub.clone());

        let original = Request::get("/orders").max_retries(3).build();
        let response = client.send(original.clone()).wait().expect("response delivered");

        assert!(response.is_success());
        assert_eq!(original.current_retry(), 1);
        assert_eq!(response.attempt(), 1);
        assert_eq!(
            stub.started_paths(),
            vec!["/orders", "/orders", "/token", "/orders"]
        );
    }
}

fn second_start(events: &[StubEvent], wanted: &str) -> usize {
    events
        .iter()
        .enumerate()
        .filter(|(_, event)| matches!(event, StubEvent::Started { path, .. } if path == wanted))
        .map(|(index, _)| index)
        .nth(1)
        .unwrap_or_else(|| panic!("{wanted} was not re-dispatched"))
}

#[test]
fn shared_refresh_runs_once_for_concurrent_originals() {
    for queue in [None, Some(DependencyQueue::new(4))] {
        let stub = StubTransport::new();
        for path in ["/a", "/b"] {
            stub.on_sequence(
                StubMatcher::get(path),
                [
                    StubResponse::status(StatusCode::UNAUTHORIZED)
                        .delay(Duration::from_millis(20)),
                    StubResponse::ok(),
                ],
            );
        }
        stub.on(
            StubMatcher::post("/token"),
            StubResponse::ok().delay(Duration::from_millis(100)),
        );
        let token = Request::post("/token").build();
        let refresh = token.clone();
        let mut builder = HttpClient::builder(BASE_URL).validator(move |response: &Response| {
            if response.status() == Some(StatusCode::UNAUTHORIZED) {
                ValidationOutcome::RetryAfter(refresh.clone())
            } else {
                ValidationOutcome::Passed
            }
        });
        if let Some(queue) = queue {
            builder = builder.queue(queue);
        }
        let client = builder.build(stub.clone());

        let first = client.send(Request::get("/a"));
        let second = client.send(Request::get("/b"));
        assert!(first.wait().expect("/a delivered").is_success());
        assert!(second.wait().expect("/b delivered").is_success());

        let started = stub.started_paths();
        assert_eq!(started.iter().filter(|path| *path == "/token").count(), 1);
        assert_eq!(started.len(), 5);
        let events = stub.events();
        let token_completed = events
            .iter()
            .position(|event| {
                matches!(event, StubEvent::Completed { path, .. } if path == "/token")
            })
            .expect("token exchange completed");
        assert!(token_completed < second_start(&events, "/a"));
        assert!(token_completed < second_start(&events, "/b"));
        assert_eq!(token.phase(), RequestPhase::Delivered);
    }
}

#[test]
fn queued_original_waits_for_alt_running_on_another_client() {
    let token_stub = StubTransport::new();
    token_stub.on(
        StubMatcher::post("/token"),
        StubResponse::ok().delay(Duration::from_millis(100)),
    );
    let orders_stub = StubTransport::new();
    orders_stub.on_sequence(
        StubMatcher::get("/orders"),
        [
            StubResponse::status(StatusCode::UNAUTHORIZED),
            StubResponse::ok(),
        ],
    );
    let observer = RecordingObserver::default();
    let refresher = HttpClient::builder(BASE_URL)
        .observer(observer.clone())
        .build(token_stub.clone());
    let token = Request::post("/token").build();
    let refresh = token.clone();
    let client = HttpClient::builder(BASE_URL)
        .validator(move |response: &Response| {
            if response.status() == Some(StatusCode::UNAUTHORIZED) {
                ValidationOutcome::RetryAfter(refresh.clone())
            } else {
                ValidationOutcome::Passed
            }
        })
        .observer(observer.clone())
        .queue(DependencyQueue::new(4))
        .build(orders_stub.clone());

    refresher.execute(token.clone());
    let response = client
        .send(Request::get("/orders"))
        .wait()
        .expect("response delivered");

    assert!(response.is_success());
    assert_eq!(token_stub.started_count(), 1);
    assert_eq!(
        observer.events(),
        vec![
            "dispatch http://stub.local/token",
            "dispatch http://stub.local/orders",
            "chain http://stub.local/orders",
            "delivered http://stub.local/token",
            "dispatch http://stub.local/orders",
            "delivered http://stub.local/orders",
        ]
    );
    let queue = client.queue().expect("queue configured");
    assert!(wait_until(|| queue.is_empty()));
}

#[test]
fn queued_original_is_released_when_outside_alt_is_cancelled() {
    let token_stub = StubTransport::new();
    token_stub.on(
        StubMatcher::post("/token"),
        StubResponse::ok().delay(Duration::from_millis(300)),
    );
    let orders_stub = StubTransport::new();
    orders_stub.on_sequence(
        StubMatcher::get("/orders"),
        [
            StubResponse::status(StatusCode::UNAUTHORIZED),
            StubResponse::ok(),
        ],
    );
    let refresher = direct_client(&token_stub);
    let token = Request::post("/token").build();
    let refresh = token.clone();
    let client = HttpClient::builder(BASE_URL)
        .validator(move |response: &Response| {
            if response.status() == Some(StatusCode::UNAUTHORIZED) {
                ValidationOutcome::RetryAfter(refresh.clone())
            } else {
                ValidationOutcome::Passed
            }
        })
        .queue(DependencyQueue::serial())
        .build(orders_stub.clone());

    refresher.execute(token.clone());
    let future = client.send(Request::get("/orders"));
    assert!(wait_until(|| client.metrics_snapshot().chains == 1));
    assert!(refresher.cancel(&token));

    assert!(future.wait().expect("response delivered").is_success());
    assert_eq!(orders_stub.started_paths(), vec!["/orders", "/orders"]);
}

fn nested_stub() -> StubTransport {
    let stub = StubTransport::new();
    stub.on_sequence(
        StubMatcher::get("/orders"),
        [
            StubResponse::status(StatusCode::UNAUTHORIZED),
            StubResponse::ok(),
        ],
    );
    stub.on_sequence(
        StubMatcher::post("/token"),
        [
            StubResponse::status(StatusCode::UNAUTHORIZED),
            StubResponse::ok(),
        ],
    );
    stub.on(StubMatcher::post("/session"), StubResponse::ok());
    stub
}

#[test]
fn nested_chains_complete_innermost_first() {
    for queue in [None, Some(DependencyQueue::serial())] {
        let stub = nested_stub();
        let token = Request::post("/token").build();
        let session = Request::post("/session").build();
        let mut builder =
            HttpClient::builder(BASE_URL).validator(refresh_validator(token, session));
        if let Some(queue) = queue {
            builder = builder.queue(queue);
        }
        let client = builder.build(stub.clone());

        let response = client
            .send(Request::get("/orders"))
            .wait()
            .expect("response delivered");

        assert!(response.is_success());
        assert_eq!(
            stub.started_paths(),
            vec!["/orders", "/token", "/session", "/token", "/orders"]
        );
        assert_eq!(
            stub.completed_paths(),
            vec!["/orders", "/token", "/session", "/token", "/orders"]
        );
        assert_eq!(client.metrics_snapshot().chains, 2);
    }
}

#[test]
fn chaining_to_self_is_rejected() {
    for queue in [None, Some(DependencyQueue::serial())] {
        let stub = StubTransport::new();
        stub.on(
            StubMatcher::get("/orders"),
            StubResponse::status(StatusCode::UNAUTHORIZED),
        );
        let mut builder = HttpClient::builder(BASE_URL).validator(|response: &Response| {
            match response.request() {
                Some(request) => ValidationOutcome::RetryAfter(request),
                None => ValidationOutcome::Passed,
            }
        });
        if let Some(queue) = queue {
            builder = builder.queue(queue);
        }
        let client = builder.build(stub.clone());

        let original = Request::get("/orders").build();
        let response = client.send(original.clone()).wait().expect("response delivered");

        assert_eq!(stub.started_count(), 1);
        let cause = invalid_response_source(&response)
            .downcast_ref::<DependencyError>()
            .expect("dependency error cause");
        assert_eq!(
            cause,
            &DependencyError::SelfDependency {
                request: original.id()
            }
        );
    }
}

#[test]
fn chain_cycle_fails_the_inner_request_and_resumes_the_outer() {
    for queue in [None, Some(DependencyQueue::serial())] {
        let stub = StubTransport::new();
        stub.on_sequence(
            StubMatcher::get("/orders"),
            [
                StubResponse::status(StatusCode::UNAUTHORIZED),
                StubResponse::ok(),
            ],
        );
        stub.on(
            StubMatcher::post("/token"),
            StubResponse::status(StatusCode::UNAUTHORIZED),
        );

        let original = Request::get("/orders").build();
        let token = Request::post("/token").build();
        let token_response = token.response();
        let validator = {
            let original = original.clone();
            let token = token.clone();
            move |response: &Response| {
                if response.status() != Some(StatusCode::UNAUTHORIZED) {
                    return ValidationOutcome::Passed;
                }
                match response.request() {
                    Some(request) if request.same_as(&original) => {
                        ValidationOutcome::RetryAfter(token.clone())
                    }
                    Some(_) => ValidationOutcome::RetryAfter(original.clone()),
                    None => ValidationOutcome::Passed,
                }
            }
        };
        let mut builder = HttpClient::builder(BASE_URL).validator(validator);
        if let Some(queue) = queue {
            builder = builder.queue(queue);
        }
        let client = builder.build(stub.clone());

        let response = client.send(original.clone()).wait().expect("orders delivered");
        assert!(response.is_success());

        let token_response = token_response.wait().expect("token delivered");
        let cause = invalid_response_source(&token_response)
            .downcast_ref::<DependencyError>()
            .expect("dependency error cause");
        assert!(matches!(cause, DependencyError::Cycle { .. }));
        assert_eq!(stub.started_paths(), vec!["/orders", "/token", "/orders"]);
    }
}

#[test]
fn alt_build_failure_fails_the_original() {
    let stub = StubTransport::new();
    stub.on(
        StubMatcher::get("/orders"),
        StubResponse::status(StatusCode::UNAUTHORIZED),
    );
    let broken = Request::post("/token").try_header("bad header", "x").build();
    let client = HttpClient::builder(BASE_URL)
        .validator(move |_: &Response| ValidationOutcome::RetryAfter(broken.clone()))
        .build(stub.clone());

    let response = client
        .send(Request::get("/orders"))
        .wait()
        .expect("response delivered");

    assert_eq!(stub.started_paths(), vec!["/orders"]);
    let cause = invalid_response_source(&response)
        .downcast_ref::<Error>()
        .expect("build error cause");
    assert_eq!(cause.code(), ErrorCode::FailedBuildingRequest);
}

#[test]
fn cancel_suppresses_delivery() {
    let stub = StubTransport::new();
    stub.on(
        StubMatcher::get("/slow"),
        StubResponse::ok().delay(Duration::from_millis(200)),
    );
    let observer = RecordingObserver::default();
    let client = HttpClient::builder(BASE_URL)
        .observer(observer.clone())
        .build(stub.clone());

    let request = Request::get("/slow").build();
    let delivered = Arc::new(AtomicUsize::new(0));
    let delivered_in_listener = Arc::clone(&delivered);
    request.on_response(move |_| {
        delivered_in_listener.fetch_add(1, Ordering::SeqCst);
    });
    let future = request.response();
    client.execute(request.clone());
    assert_eq!(client.in_flight(), 1);

    assert!(client.cancel(&request));
    assert!(!client.cancel(&request));
    assert!(matches!(future.wait(), Err(Error::Cancelled)));

    thread::sleep(Duration::from_millis(300));
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
    assert_eq!(request.phase(), RequestPhase::Cancelled);
    assert_eq!(client.in_flight(), 0);
    assert!(
        stub.events()
            .iter()
            .any(|event| matches!(event, StubEvent::Cancelled { .. }))
    );
    assert!(stub.completed_paths().is_empty());
    assert_eq!(client.metrics_snapshot().cancelled, 1);
    assert_eq!(
        observer.events().last().map(String::as_str),
        Some("cancelled http://stub.local/slow")
    );
}

#[test]
fn cancel_removes_queued_operation() {
    let stub = StubTransport::new();
    stub.on(
        StubMatcher::any(),
        StubResponse::ok().delay(Duration::from_millis(50)),
    );
    let client = HttpClient::builder(BASE_URL)
        .queue(DependencyQueue::serial())
        .build(stub.clone());

    let first = client.execute(Request::get("/first"));
    let second = client.execute(Request::get("/second"));
    let third = client.execute(Request::get("/third"));
    assert_eq!(second.phase(), RequestPhase::Queued);

    assert!(client.cancel(&second));
    third.response().wait().expect("third delivered");

    assert_eq!(first.phase(), RequestPhase::Delivered);
    assert_eq!(stub.started_paths(), vec!["/first", "/third"]);
}

#[test]
fn serial_queue_never_overlaps_exchanges() {
    let stub = StubTransport::new();
    stub.on(
        StubMatcher::any(),
        StubResponse::ok().delay(Duration::from_millis(10)),
    );
    let client = HttpClient::builder(BASE_URL)
        .queue(DependencyQueue::serial())
        .build(stub.clone());

    let futures: Vec<_> = ["/a", "/b", "/c", "/d"]
        .into_iter()
        .map(|path| client.send(Request::get(path)))
        .collect();
    for future in futures {
        future.wait().expect("response delivered");
    }

    let events = stub.events();
    assert_eq!(events.len(), 8);
    for pair in events.chunks(2) {
        assert!(matches!(pair[0], StubEvent::Started { .. }));
        assert!(matches!(pair[1], StubEvent::Completed { .. }));
        assert_eq!(pair[0].handle(), pair[1].handle());
    }
    assert_eq!(stub.started_paths(), vec!["/a", "/b", "/c", "/d"]);
}

#[test]
fn duplicate_execute_while_in_flight_is_ignored() {
    let stub = StubTransport::new();
    stub.on(
        StubMatcher::get("/slow"),
        StubResponse::ok().delay(Duration::from_millis(100)),
    );
    let client = direct_client(&stub);

    let request = Request::get("/slow").build();
    let future = client.send(request.clone());
    client.execute(request.clone());
    future.wait().expect("response delivered");

    assert_eq!(stub.started_count(), 1);
    assert_eq!(client.metrics_snapshot().requests_submitted, 1);
}

#[test]
fn new_episode_after_delivery_resets_counter() {
    let stub = StubTransport::new();
    stub.on_sequence(
        StubMatcher::get("/flaky"),
        [
            StubResponse::status(StatusCode::SERVICE_UNAVAILABLE),
            StubResponse::ok(),
        ],
    );
    let client = direct_client(&stub);
    let request = Request::get("/flaky").max_retries(3).build();

    client.send(request.clone()).wait().expect("first episode");
    assert_eq!(request.current_retry(), 1);

    client.send(request.clone()).wait().expect("second episode");
    assert_eq!(request.current_retry(), 0);
    assert_eq!(stub.started_count(), 3);
}

/// Completes every exchange before `start` returns.
struct InlineTransport {
    started: AtomicUsize,
}

impl Transport for InlineTransport {
    fn start(
        &self,
        handle: OperationHandle,
        _request: PreparedRequest,
        events: Arc<dyn TransportEvents>,
    ) {
        self.started.fetch_add(1, Ordering::SeqCst);
        events.on_exchange_complete(
            handle,
            Some(ResponseMetadata::new(StatusCode::OK, HeaderMap::new())),
            None,
        );
    }
}

#[test]
fn listeners_registered_after_inline_delivery_resolve_immediately() {
    let transport = Arc::new(InlineTransport {
        started: AtomicUsize::new(0),
    });
    let client = HttpClient::builder(BASE_URL).build(Arc::clone(&transport));

    let request = client.execute(Request::get("/inline"));
    assert_eq!(request.phase(), RequestPhase::Delivered);

    let response = request.response().wait().expect("last delivery");
    assert_eq!(response.status(), Some(StatusCode::OK));

    let callbacks = Arc::new(AtomicUsize::new(0));
    let callbacks_in_listener = Arc::clone(&callbacks);
    request.on_response(move |response| {
        assert_eq!(response.status(), Some(StatusCode::OK));
        callbacks_in_listener.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(callbacks.load(Ordering::SeqCst), 1);

    let again = client.send(request.clone()).wait().expect("second episode");
    assert_eq!(again.status(), Some(StatusCode::OK));
    assert_eq!(transport.started.load(Ordering::SeqCst), 2);
    assert_eq!(client.metrics_snapshot().requests_submitted, 2);
}

#[test]
fn response_after_cancel_resolves_cancelled() {
    let stub = StubTransport::new();
    stub.on(
        StubMatcher::get("/slow"),
        StubResponse::ok().delay(Duration::from_millis(200)),
    );
    let client = direct_client(&stub);

    let request = client.execute(Request::get("/slow"));
    assert!(client.cancel(&request));

    assert!(matches!(request.response().wait(), Err(Error::Cancelled)));
}

#[test]
fn streamed_chunks_accumulate_in_order() {
    let stub = StubTransport::new();
    stub.on(
        StubMatcher::get("/stream"),
        StubResponse::ok().chunks(["hel", "lo ", "world"]),
    );
    let client = direct_client(&stub);

    let response = client
        .send(Request::get("/stream"))
        .wait()
        .expect("response delivered");
    assert_eq!(
        response.payload(),
        Some(&Payload::Data("hello world".into()))
    );
}

#[test]
fn file_completion_replaces_buffered_payload() {
    let location = std::env::temp_dir().join(format!(
        "reqflow-download-{}-{}.bin",
        std::process::id(),
        line!()
    ));
    std::fs::write(&location, b"downloaded").expect("write download fixture");

    let stub = StubTransport::new();
    stub.on(
        StubMatcher::get("/download"),
        StubResponse::ok().chunks(["partial"]).file(location.clone()),
    );
    let client = direct_client(&stub);

    let response = client
        .send(Request::get("/download"))
        .wait()
        .expect("response delivered");

    assert_eq!(response.payload(), Some(&Payload::File(location.clone())));
    assert_eq!(response.body(), "downloaded");
    let _ = std::fs::remove_file(location);
}

#[test]
fn prepared_request_carries_client_and_request_settings() {
    let stub = StubTransport::new();
    stub.on(StubMatcher::any(), StubResponse::ok());
    let client = HttpClient::builder("http://stub.local/api/")
        .try_default_header("x-client", "reqflow-tests")
        .expect("valid default header")
        .default_header(
            HeaderName::from_static("accept"),
            HeaderValue::from_static("text/plain"),
        )
        .request_timeout(Duration::from_secs(3))
        .cache_policy(CachePolicy::ReturnCacheDataElseLoad)
        .build(stub.clone());

    client
        .send(
            Request::post("/items")
                .header(
                    HeaderName::from_static("accept"),
                    HeaderValue::from_static("application/json"),
                )
                .query_pair("dry_run", "true")
                .json(&json!({ "name": "demo" }))
                .timeout(Duration::from_millis(750)),
        )
        .wait()
        .expect("response delivered");
    client
        .send(Request::get("/items"))
        .wait()
        .expect("response delivered");

    let received = stub.received();
    assert_eq!(received.len(), 2);
    let post = &received[0];
    assert_eq!(
        post.uri.to_string(),
        "http://stub.local/api/items?dry_run=true"
    );
    assert_eq!(post.headers.get("x-client").expect("default header"), "reqflow-tests");
    assert_eq!(post.headers.get("accept").expect("accept header"), "application/json");
    assert_eq!(
        post.headers.get("content-type").expect("content type"),
        "application/json"
    );
    assert_eq!(post.body.as_ref(), br#"{"name":"demo"}"#);
    assert_eq!(post.timeout, Duration::from_millis(750));
    assert_eq!(post.cache_policy, CachePolicy::ReturnCacheDataElseLoad);

    let get = &received[1];
    assert_eq!(get.headers.get("accept").expect("accept header"), "text/plain");
    assert_eq!(get.timeout, Duration::from_secs(3));
}

#[tokio::test]
async fn response_future_resolves_inside_async_runtime() {
    let stub = StubTransport::new();
    stub.on(StubMatcher::get("/async"), StubResponse::ok().body("ready"));
    let client = direct_client(&stub);

    let response = client
        .send(Request::get("/async"))
        .await
        .expect("response delivered");
    assert_eq!(response.text_lossy(), "ready");
}

#[tokio::test]
async fn custom_validator_can_pass_what_default_would_retry() {
    let stub = StubTransport::new();
    stub.on(
        StubMatcher::get("/maintenance"),
        StubResponse::status(StatusCode::SERVICE_UNAVAILABLE),
    );
    let client = HttpClient::builder(BASE_URL)
        .without_default_validator()
        .build(stub.clone());

    let response = client
        .send(Request::get("/maintenance").max_retries(3))
        .await
        .expect("response delivered");
    assert!(response.is_success());
    assert_eq!(response.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
    assert_eq!(stub.started_count(), 1);
}
