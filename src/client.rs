//! Rate-limit-aware retrying requester for the broker's REST surface.
//!
//! [`ApiClient::send`] owns the whole retry story: callers describe a logical
//! request once and receive either a parsed body or a fully classified error.
//! Retryable conditions (429, 5xx, timeouts, connection failures) are resolved
//! inside `send` under a bounded attempt budget; nothing above this layer
//! loops.

// std
use std::sync::atomic::{AtomicU64, Ordering};
// crates.io
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};
// self
use crate::{
	_prelude::*,
	config::{GatewayConfig, RequestCategory},
	error::{ConfigError, ProtocolError, TransientError},
	oauth::OAuthManager,
	rate::{QuotaSnapshot, RateTracker},
	store::TokenStore,
	token::TokenSecret,
};

/// Description of one logical API request.
///
/// The `idempotent` flag decides whether a timed-out attempt may be resent;
/// constructors default it by method (GET/DELETE yes, POST/PUT no) and order
/// placement overrides it by attaching an
/// [`external_reference`](Self::external_reference) the broker deduplicates on.
#[derive(Clone, Debug)]
pub struct ApiRequest {
	method: Method,
	path: String,
	query: Vec<(String, String)>,
	body: Option<Value>,
	idempotent: bool,
	external_reference: Option<String>,
	category: RequestCategory,
	deadline: Option<StdDuration>,
}
impl ApiRequest {
	fn new(method: Method, path: impl Into<String>, idempotent: bool) -> Self {
		Self {
			method,
			path: path.into(),
			query: Vec::new(),
			body: None,
			idempotent,
			external_reference: None,
			category: RequestCategory::Default,
			deadline: None,
		}
	}

	/// Builds a GET request; idempotent by default.
	pub fn get(path: impl Into<String>) -> Self {
		Self::new(Method::GET, path, true)
	}

	/// Builds a DELETE request; idempotent by default.
	pub fn delete(path: impl Into<String>) -> Self {
		Self::new(Method::DELETE, path, true)
	}

	/// Builds a POST request; not idempotent unless marked otherwise.
	pub fn post(path: impl Into<String>) -> Self {
		Self::new(Method::POST, path, false)
	}

	/// Builds a PUT request; not idempotent unless marked otherwise.
	pub fn put(path: impl Into<String>) -> Self {
		Self::new(Method::PUT, path, false)
	}

	/// Appends a query pair.
	pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.query.push((key.into(), value.into()));

		self
	}

	/// Sets the JSON body.
	pub fn json(mut self, body: Value) -> Self {
		self.body = Some(body);

		self
	}

	/// Overrides the idempotency flag.
	pub fn idempotent(mut self, idempotent: bool) -> Self {
		self.idempotent = idempotent;

		self
	}

	/// Attaches the deduplication reference the caller put in the body.
	///
	/// Its presence makes an otherwise non-idempotent call safe to resend after
	/// a timeout, because the broker collapses duplicates on this key.
	pub fn external_reference(mut self, reference: impl Into<String>) -> Self {
		self.external_reference = Some(reference.into());

		self
	}

	/// Assigns the pacing category.
	pub fn category(mut self, category: RequestCategory) -> Self {
		self.category = category;

		self
	}

	/// Caps the total wall-clock time `send` may spend, sleeps included.
	pub fn deadline(mut self, deadline: StdDuration) -> Self {
		self.deadline = Some(deadline);

		self
	}

	fn resendable_after_timeout(&self) -> bool {
		self.idempotent || self.external_reference.is_some()
	}
}

/// Thread-safe counters for request outcomes.
#[derive(Debug, Default)]
pub struct RetryStats {
	attempts: AtomicU64,
	success: AtomicU64,
	retries: AtomicU64,
	throttles: AtomicU64,
}
impl RetryStats {
	/// Returns the total number of HTTP calls dispatched.
	pub fn attempts(&self) -> u64 {
		self.attempts.load(Ordering::Relaxed)
	}

	/// Returns the number of logical requests that completed successfully.
	pub fn successes(&self) -> u64 {
		self.success.load(Ordering::Relaxed)
	}

	/// Returns the number of retries taken after transient failures.
	pub fn retries(&self) -> u64 {
		self.retries.load(Ordering::Relaxed)
	}

	/// Returns the number of 429 responses observed.
	pub fn throttles(&self) -> u64 {
		self.throttles.load(Ordering::Relaxed)
	}

	fn record_attempt(&self) {
		self.attempts.fetch_add(1, Ordering::Relaxed);
	}

	fn record_success(&self) {
		self.success.fetch_add(1, Ordering::Relaxed);
	}

	fn record_retry(&self) {
		self.retries.fetch_add(1, Ordering::Relaxed);
	}

	fn record_throttle(&self) {
		self.throttles.fetch_add(1, Ordering::Relaxed);
	}
}

/// Retrying API client over one broker gateway.
pub struct ApiClient {
	config: GatewayConfig,
	http: ReqwestClient,
	oauth: Arc<OAuthManager>,
	tracker: RateTracker,
	stats: RetryStats,
}
impl ApiClient {
	/// Builds a client, its token manager, and the shared rate tracker.
	pub fn new(config: GatewayConfig, store: Arc<dyn TokenStore>) -> Result<Self, ConfigError> {
		let tracker = RateTracker::new(config.rate.clone());
		let oauth = Arc::new(OAuthManager::new(&config, store, tracker.clone())?);
		let http = ReqwestClient::builder().timeout(config.retry.request_timeout).build()?;

		Ok(Self { config, http, oauth, tracker, stats: RetryStats::default() })
	}

	/// Token lifecycle manager backing this client.
	pub fn oauth(&self) -> &Arc<OAuthManager> {
		&self.oauth
	}

	/// Shared view of the broker's quota budgets.
	pub fn rate(&self) -> &RateTracker {
		&self.tracker
	}

	/// Request outcome counters.
	pub fn stats(&self) -> &RetryStats {
		&self.stats
	}

	/// Sends a logical request and returns the parsed JSON body.
	///
	/// Empty 2xx bodies yield [`Value::Null`]. Every retryable condition is
	/// handled internally; the returned error is final.
	pub async fn send(&self, request: &ApiRequest) -> Result<Value> {
		let url = self.config.api_url(&request.path)?;
		let started = Instant::now();
		let deadline = request.deadline.or(self.config.retry.default_deadline);
		let backoff = self.config.retry.backoff();
		let max_attempts = self.config.retry.max_attempts;
		let mut attempt: u32 = 0;
		let mut auth_retry_used = false;
		// Delay demanded by the previous attempt's outcome. An explicit
		// Retry-After is obeyed verbatim; everything else still yields to the
		// quota advisory, which the previous response may have tightened.
		let mut retry_delay = StdDuration::ZERO;
		let mut broker_directed = false;

		loop {
			let pace = if broker_directed {
				retry_delay
			} else {
				self.tracker.minimum_delay(request.category).max(retry_delay)
			};

			if !pace.is_zero() {
				debug!(?pace, attempt, category = ?request.category, "Pacing dispatch to respect quota.");
				self.wait(pace, started, deadline).await?;
			}

			retry_delay = StdDuration::ZERO;
			broker_directed = false;
			attempt += 1;
			self.stats.record_attempt();
			self.tracker.mark_dispatch(request.category);

			let token = self.oauth.valid_access_token().await?;

			match self.dispatch(&url, request, &token).await {
				Ok(response) => {
					let status = response.status();
					let quota = QuotaSnapshot::from_headers(response.headers());

					self.tracker.observe(&quota);

					if status.is_success() {
						self.stats.record_success();

						return parse_body(response).await;
					}

					match status.as_u16() {
						401 | 403 => {
							if auth_retry_used {
								return Err(Error::Authentication {
									reason: format!(
										"Broker rejected the bearer token twice (HTTP {}).",
										status.as_u16(),
									),
									reauthorize: false,
								});
							}

							auth_retry_used = true;
							// The forced-refresh retry does not spend the
							// attempt budget.
							attempt -= 1;

							warn!(status = status.as_u16(), "Bearer token rejected; forcing a refresh.");
							self.oauth.refresh_now().await?;
						},
						429 => {
							self.stats.record_throttle();

							let delay = quota
								.retry_delay()
								.or_else(|| {
									self.tracker
										.tightest_reset()
										.map(|reset| reset + StdDuration::from_secs(1))
								})
								.unwrap_or_else(|| backoff.delay_for(attempt));

							if attempt >= max_attempts {
								return Err(Error::RateLimitExceeded {
									attempts: attempt,
									retry_after: Some(delay),
								});
							}

							warn!(?delay, attempt, "Throttled by the broker; backing off.");

							retry_delay = delay;
							broker_directed = quota.retry_after.is_some();
						},
						code if status.is_server_error() => {
							self.stats.record_retry();

							if attempt >= max_attempts {
								return Err(TransientError::Exhausted {
									status: Some(code),
									attempts: attempt,
								}
								.into());
							}

							let delay = backoff.delay_for(attempt);

							warn!(status = code, ?delay, attempt, "Broker error; retrying.");

							retry_delay = delay;
						},
						code => {
							let message = response.text().await.unwrap_or_default();

							return Err(Error::Client { status: code, message });
						},
					}
				},
				Err(err) => {
					let timeout = err.is_timeout();

					if timeout && !request.resendable_after_timeout() {
						return Err(TransientError::AmbiguousOutcome {
							method: request.method.to_string(),
							path: request.path.clone(),
						}
						.into());
					}
					if !timeout && !err.is_connect() {
						return Err(TransientError::Network { source: Box::new(err) }.into());
					}

					self.stats.record_retry();

					if attempt >= max_attempts {
						return Err(
							TransientError::Exhausted { status: None, attempts: attempt }.into()
						);
					}

					let delay = backoff.delay_for(attempt);

					warn!(timeout, ?delay, attempt, "Transport failure; retrying.");

					retry_delay = delay;
				},
			}
		}
	}

	/// Sends a logical request and decodes the body into `T`.
	pub async fn send_as<T>(&self, request: &ApiRequest) -> Result<T>
	where
		T: DeserializeOwned,
	{
		let value = self.send(request).await?;

		serde_path_to_error::deserialize(value)
			.map_err(|source| ProtocolError::BodyDecode { source, status: None }.into())
	}

	async fn dispatch(
		&self,
		url: &Url,
		request: &ApiRequest,
		token: &TokenSecret,
	) -> Result<reqwest::Response, ReqwestError> {
		let mut builder =
			self.http.request(request.method.clone(), url.clone()).bearer_auth(token.expose());

		if !request.query.is_empty() {
			builder = builder.query(&request.query);
		}
		if let Some(body) = &request.body {
			builder = builder.json(body);
		}

		builder.send().await
	}

	// Sleeps are the only place the deadline is spent; an attempt already in
	// flight is never cancelled by it.
	async fn wait(
		&self,
		delay: StdDuration,
		started: Instant,
		deadline: Option<StdDuration>,
	) -> Result<()> {
		if let Some(deadline) = deadline {
			let elapsed = started.elapsed();

			if elapsed + delay > deadline {
				return Err(TransientError::DeadlineExceeded { elapsed }.into());
			}
		}

		tokio::time::sleep(delay).await;

		Ok(())
	}
}

async fn parse_body(response: reqwest::Response) -> Result<Value> {
	let status = response.status().as_u16();
	let text = response
		.text()
		.await
		.map_err(|e| TransientError::Network { source: Box::new(e) })?;

	if text.trim().is_empty() {
		return Ok(Value::Null);
	}

	let mut deserializer = serde_json::Deserializer::from_str(&text);

	serde_path_to_error::deserialize(&mut deserializer)
		.map_err(|source| ProtocolError::BodyDecode { source, status: Some(status) }.into())
}
