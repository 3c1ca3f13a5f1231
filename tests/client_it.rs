mod common;

// std
use std::time::Duration as StdDuration;
// crates.io
use httpmock::prelude::*;
use serde::Deserialize;
use serde_json::{Value, json};
// self
use common::{state, token_body};
use tradegate::{
	client::{ApiClient, ApiRequest},
	error::{Error, TransientError},
};

fn client(server: &MockServer) -> ApiClient {
	common::client(server, common::seeded_store(state("access-ok", "refresh-ok", 600, 3600)))
}

#[tokio::test]
async fn success_returns_the_parsed_body_and_feeds_the_tracker() {
	let server = MockServer::start_async().await;
	let client = client(&server);
	let mock = server
		.mock_async(|when, then| {
			when.method(GET)
				.path("/openapi/port/v1/positions")
				.header("authorization", "Bearer access-ok")
				.query_param("FieldGroups", "PositionBase");
			then.status(200)
				.header("content-type", "application/json")
				.header("x-ratelimit-sessionminute-remaining", "118")
				.header("x-ratelimit-sessionminute-reset", "45")
				.body(r#"{"Data":[{"NetPositionId":"EURUSD__FxSpot"}]}"#);
		})
		.await;
	let body = client
		.send(&ApiRequest::get("/port/v1/positions").query("FieldGroups", "PositionBase"))
		.await
		.expect("A 2xx response should yield a parsed body.");

	mock.assert_async().await;

	assert_eq!(body["Data"][0]["NetPositionId"], "EURUSD__FxSpot");
	assert_eq!(client.rate().headroom(), Some(118));
	assert_eq!(client.stats().successes(), 1);
}

#[tokio::test]
async fn empty_success_body_parses_as_null() {
	let server = MockServer::start_async().await;
	let client = client(&server);

	server
		.mock_async(|when, then| {
			when.method(DELETE).path("/openapi/trade/v2/orders/42");
			then.status(204);
		})
		.await;

	let body = client
		.send(&ApiRequest::delete("/trade/v2/orders/42"))
		.await
		.expect("An empty 2xx body should be accepted.");

	assert_eq!(body, Value::Null);
}

#[tokio::test]
async fn retry_after_wins_over_reset_headers_and_bounds_hold() {
	let server = MockServer::start_async().await;
	let client = client(&server);
	let mock = server
		.mock_async(|when, then| {
			when.method(GET).path("/openapi/trade/v1/infoprices");
			then.status(429)
				.header("retry-after", "1")
				.header("x-ratelimit-sessionminute-remaining", "0")
				.header("x-ratelimit-sessionminute-reset", "55");
		})
		.await;
	let err = client
		.send(&ApiRequest::get("/trade/v1/infoprices"))
		.await
		.expect_err("Persistent throttling must exhaust the retry budget.");

	// The 1s Retry-After governed both sleeps; the 55s reset hint would have
	// blown way past this test's runtime.
	mock.assert_calls_async(3).await;

	match err {
		Error::RateLimitExceeded { attempts, retry_after } => {
			assert_eq!(attempts, 3);
			assert_eq!(retry_after, Some(StdDuration::from_secs(1)));
		},
		other => panic!("Expected RateLimitExceeded, got {other:?}"),
	}

	assert_eq!(client.stats().throttles(), 3);
}

#[tokio::test]
async fn exhausted_quota_dimension_paces_retries_until_its_window_resets() {
	let server = MockServer::start_async().await;
	let client = client(&server);
	let mock = server
		.mock_async(|when, then| {
			when.method(GET).path("/openapi/port/v1/balances");
			then.status(503)
				.header("x-ratelimit-sessionminute-remaining", "0")
				.header("x-ratelimit-sessionminute-reset", "1");
		})
		.await;
	let started = std::time::Instant::now();
	let err = client
		.send(&ApiRequest::get("/port/v1/balances"))
		.await
		.expect_err("A persistent 503 must exhaust the retry budget.");

	mock.assert_calls_async(3).await;

	// Both retries had to wait out the exhausted 1s window advertised by the
	// previous response, not just the millisecond backoff.
	let elapsed = started.elapsed();

	assert!(elapsed >= StdDuration::from_millis(1500), "retries dispatched too eagerly: {elapsed:?}");
	assert!(matches!(
		err,
		Error::Transient(TransientError::Exhausted { status: Some(503), attempts: 3 }),
	));
}

#[tokio::test]
async fn server_errors_retry_exactly_max_attempts_times() {
	let server = MockServer::start_async().await;
	let client = client(&server);
	let mock = server
		.mock_async(|when, then| {
			when.method(GET).path("/openapi/port/v1/balances");
			then.status(503).body("maintenance");
		})
		.await;
	let err = client
		.send(&ApiRequest::get("/port/v1/balances"))
		.await
		.expect_err("A persistent 503 must exhaust the retry budget.");

	mock.assert_calls_async(3).await;

	assert!(matches!(
		err,
		Error::Transient(TransientError::Exhausted { status: Some(503), attempts: 3 }),
	));
}

#[tokio::test]
async fn client_errors_are_never_retried() {
	let server = MockServer::start_async().await;
	let client = client(&server);
	let mock = server
		.mock_async(|when, then| {
			when.method(POST).path("/openapi/trade/v2/orders");
			then.status(400).body(r#"{"ErrorCode":"InvalidModelState"}"#);
		})
		.await;
	let err = client
		.send(&ApiRequest::post("/trade/v2/orders").json(json!({ "Amount": -1 })))
		.await
		.expect_err("A 400 is the caller's bug and must surface immediately.");

	mock.assert_calls_async(1).await;

	match err {
		Error::Client { status, message } => {
			assert_eq!(status, 400);
			assert!(message.contains("InvalidModelState"));
		},
		other => panic!("Expected Client, got {other:?}"),
	}
}

#[tokio::test]
async fn post_timeout_without_reference_is_ambiguous_after_one_call() {
	let server = MockServer::start_async().await;
	// Per-attempt timeout shorter than the mock delay so every call times out.
	let mut retry = common::fast_retry();

	retry.request_timeout = StdDuration::from_millis(250);

	let client = ApiClient::new(
		common::test_config_with(&server, retry),
		common::seeded_store(state("access-ok", "refresh-ok", 600, 3600)),
	)
	.expect("Test client should build.");
	let mock = server
		.mock_async(|when, then| {
			when.method(POST).path("/openapi/trade/v2/orders");
			then.status(201).delay(StdDuration::from_secs(2)).body("{}");
		})
		.await;
	let err = client
		.send(&ApiRequest::post("/trade/v2/orders").json(json!({ "Amount": 10000 })))
		.await
		.expect_err("A timed-out order without a dedup reference must not be resent.");

	mock.assert_calls_async(1).await;

	assert!(matches!(err, Error::Transient(TransientError::AmbiguousOutcome { .. })));
}

#[tokio::test]
async fn post_timeout_with_reference_is_retried() {
	let server = MockServer::start_async().await;
	let mut retry = common::fast_retry();

	retry.request_timeout = StdDuration::from_millis(250);

	let client = ApiClient::new(
		common::test_config_with(&server, retry),
		common::seeded_store(state("access-ok", "refresh-ok", 600, 3600)),
	)
	.expect("Test client should build.");
	let mock = server
		.mock_async(|when, then| {
			when.method(POST).path("/openapi/trade/v2/orders");
			then.status(201).delay(StdDuration::from_secs(2)).body("{}");
		})
		.await;
	let err = client
		.send(
			&ApiRequest::post("/trade/v2/orders")
				.json(json!({ "Amount": 10000, "ExternalReference": "bot-42" }))
				.external_reference("bot-42"),
		)
		.await
		.expect_err("Every resend also times out, so the budget runs dry.");

	mock.assert_calls_async(3).await;

	assert!(matches!(
		err,
		Error::Transient(TransientError::Exhausted { status: None, attempts: 3 }),
	));
}

#[tokio::test]
async fn rejected_bearer_token_forces_one_free_refresh() {
	let server = MockServer::start_async().await;
	let client = common::client(
		&server,
		// Clock-valid but revoked server-side.
		common::seeded_store(state("access-revoked", "refresh-ok", 600, 3600)),
	);
	let rejected = server
		.mock_async(|when, then| {
			when.method(GET)
				.path("/openapi/port/v1/accounts")
				.header("authorization", "Bearer access-revoked");
			then.status(401);
		})
		.await;
	let refresh = server
		.mock_async(|when, then| {
			when.method(POST).path("/auth/token");
			then.status(200)
				.header("content-type", "application/json")
				.body(token_body("access-fresh", Some("refresh-fresh")));
		})
		.await;
	let accepted = server
		.mock_async(|when, then| {
			when.method(GET)
				.path("/openapi/port/v1/accounts")
				.header("authorization", "Bearer access-fresh");
			then.status(200)
				.header("content-type", "application/json")
				.body(r#"{"Data":[]}"#);
		})
		.await;
	let body = client
		.send(&ApiRequest::get("/port/v1/accounts"))
		.await
		.expect("The forced refresh should rescue the request.");

	rejected.assert_async().await;
	refresh.assert_async().await;
	accepted.assert_async().await;

	assert_eq!(body["Data"], json!([]));
}

#[tokio::test]
async fn second_bearer_rejection_is_an_authentication_error() {
	let server = MockServer::start_async().await;
	let client = client(&server);
	let rejected = server
		.mock_async(|when, then| {
			when.method(GET).path("/openapi/port/v1/accounts");
			then.status(403);
		})
		.await;
	let refresh = server
		.mock_async(|when, then| {
			when.method(POST).path("/auth/token");
			then.status(200)
				.header("content-type", "application/json")
				.body(token_body("access-fresh", Some("refresh-fresh")));
		})
		.await;
	let err = client
		.send(&ApiRequest::get("/port/v1/accounts"))
		.await
		.expect_err("Two bearer rejections in a row mean authentication is broken.");

	rejected.assert_calls_async(2).await;
	refresh.assert_calls_async(1).await;

	match err {
		Error::Authentication { reauthorize, .. } => assert!(!reauthorize),
		other => panic!("Expected Authentication, got {other:?}"),
	}
}

#[tokio::test]
async fn deadline_is_checked_before_sleeping() {
	let server = MockServer::start_async().await;
	let mut retry = common::fast_retry();

	retry.base_backoff = StdDuration::from_millis(100);

	let client = ApiClient::new(
		common::test_config_with(&server, retry),
		common::seeded_store(state("access-ok", "refresh-ok", 600, 3600)),
	)
	.expect("Test client should build.");
	let mock = server
		.mock_async(|when, then| {
			when.method(GET).path("/openapi/port/v1/balances");
			then.status(503);
		})
		.await;
	let err = client
		.send(
			&ApiRequest::get("/port/v1/balances").deadline(StdDuration::from_millis(50)),
		)
		.await
		.expect_err("The deadline leaves no room for the first backoff sleep.");

	mock.assert_calls_async(1).await;

	assert!(matches!(err, Error::Transient(TransientError::DeadlineExceeded { .. })));
}

#[tokio::test]
async fn malformed_success_body_is_a_protocol_error() {
	let server = MockServer::start_async().await;
	let client = client(&server);

	server
		.mock_async(|when, then| {
			when.method(GET).path("/openapi/port/v1/balances");
			then.status(200).body("<html>not json</html>");
		})
		.await;

	let err = client
		.send(&ApiRequest::get("/port/v1/balances"))
		.await
		.expect_err("A 2xx body that is not JSON cannot be returned.");

	assert!(matches!(err, Error::Protocol(_)));
}

#[tokio::test]
async fn send_as_decodes_into_the_requested_type() {
	#[derive(Debug, Deserialize)]
	struct Balance {
		#[serde(rename = "CashBalance")]
		cash_balance: f64,
		#[serde(rename = "Currency")]
		currency: String,
	}

	let server = MockServer::start_async().await;
	let client = client(&server);

	server
		.mock_async(|when, then| {
			when.method(GET).path("/openapi/port/v1/balances/me");
			then.status(200)
				.header("content-type", "application/json")
				.body(r#"{"CashBalance":10000.5,"Currency":"EUR"}"#);
		})
		.await;

	let balance: Balance = client
		.send_as(&ApiRequest::get("/port/v1/balances/me"))
		.await
		.expect("The body should decode into the typed shape.");

	assert_eq!(balance.currency, "EUR");
	assert!((balance.cash_balance - 10000.5).abs() < f64::EPSILON);

	let err = client
		.send_as::<Vec<String>>(&ApiRequest::get("/port/v1/balances/me"))
		.await
		.expect_err("A shape mismatch must surface as a protocol error.");

	assert!(matches!(err, Error::Protocol(_)));
}
