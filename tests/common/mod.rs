#![allow(dead_code)]

// std
use std::{sync::Arc, time::Duration as StdDuration};
// crates.io
use httpmock::MockServer;
use time::{Duration, OffsetDateTime};
use url::Url;
// self
use tradegate::{
	client::ApiClient,
	config::{GatewayConfig, RatePolicy, RetryPolicy},
	store::MemoryStore,
	token::{TokenSecret, TokenState},
};

pub const CLIENT_ID: &str = "client-bot";
pub const CLIENT_SECRET: &str = "secret-bot";

/// Retry policy tuned so tests spend milliseconds, not seconds, backing off.
pub fn fast_retry() -> RetryPolicy {
	RetryPolicy {
		max_attempts: 3,
		base_backoff: StdDuration::from_millis(50),
		max_backoff: StdDuration::from_millis(200),
		jitter_factor: 0.,
		request_timeout: StdDuration::from_secs(2),
		refresh_timeout: StdDuration::from_secs(2),
		default_deadline: None,
	}
}

/// Rate policy with no proactive spacing so requests dispatch immediately.
pub fn unspaced_rate() -> RatePolicy {
	RatePolicy {
		low_water_mark: 0,
		quote_interval: StdDuration::ZERO,
		bar_interval: StdDuration::ZERO,
		default_interval: StdDuration::ZERO,
	}
}

pub fn test_config(server: &MockServer) -> GatewayConfig {
	test_config_with(server, fast_retry())
}

pub fn test_config_with(server: &MockServer, retry: RetryPolicy) -> GatewayConfig {
	let parse = |url: String| Url::parse(&url).expect("Mock server URL should parse.");

	GatewayConfig::builder(CLIENT_ID, CLIENT_SECRET)
		.redirect_uri(parse("http://localhost:9321/callback".into()))
		.auth_base_url(parse(server.url("/auth")))
		.api_base_url(parse(server.url("/openapi")))
		.retry(retry)
		.rate(unspaced_rate())
		.build()
		.expect("Test configuration should build.")
}

/// Token state with expiries relative to now; negative offsets mean expired.
pub fn state(access: &str, refresh: &str, access_secs: i64, refresh_secs: i64) -> TokenState {
	let now = OffsetDateTime::now_utc();

	TokenState {
		access_token: TokenSecret::new(access),
		refresh_token: TokenSecret::new(refresh),
		access_expires_at: now + Duration::seconds(access_secs),
		refresh_expires_at: now + Duration::seconds(refresh_secs),
	}
}

pub fn seeded_store(state: TokenState) -> Arc<MemoryStore> {
	Arc::new(MemoryStore::seeded(state))
}

pub fn client(server: &MockServer, store: Arc<MemoryStore>) -> ApiClient {
	ApiClient::new(test_config(server), store).expect("Test client should build.")
}

/// Token endpoint response body in the broker's dialect.
pub fn token_body(access: &str, refresh: Option<&str>) -> String {
	match refresh {
		Some(refresh) => format!(
			"{{\"access_token\":\"{access}\",\"refresh_token\":\"{refresh}\",\"token_type\":\"Bearer\",\"expires_in\":1200,\"refresh_token_expires_in\":3600}}",
		),
		None => format!(
			"{{\"access_token\":\"{access}\",\"token_type\":\"Bearer\",\"expires_in\":1200}}",
		),
	}
}
