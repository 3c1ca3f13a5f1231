//! Gateway configuration assembled once by the host application and injected
//! into every collaborator.
//!
//! Nothing in this crate reads the process environment; credentials and
//! endpoints arrive through [`GatewayConfig`] so the host decides where they
//! come from (env, vault, flags). The builder validates endpoints and policy
//! knobs up front, which keeps misconfiguration failures out of the hot path.

// self
use crate::{_prelude::*, error::ConfigError, rate::BackoffPolicy, token::TokenSecret};

/// Request categories with distinct polling cadences.
///
/// The broker throttles market-data endpoints harder than the rest, so the
/// rate tracker spaces dispatches per category instead of globally.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RequestCategory {
	/// Price snapshot polling.
	Quotes,
	/// Historical bar/chart polling.
	Bars,
	/// Order placement and management.
	Orders,
	/// Everything else.
	#[default]
	Default,
}

/// Retry and timeout policy for the requester and the token refresher.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
	/// Maximum HTTP calls per logical request, forced refreshes excluded.
	pub max_attempts: u32,
	/// First-retry backoff delay.
	pub base_backoff: StdDuration,
	/// Backoff ceiling after doubling.
	pub max_backoff: StdDuration,
	/// Multiplicative jitter factor in `[0, 1)`.
	pub jitter_factor: f64,
	/// Per-attempt timeout for API calls.
	pub request_timeout: StdDuration,
	/// Timeout for token-endpoint calls; kept tighter than `request_timeout`
	/// so a hung refresh releases waiting callers quickly.
	pub refresh_timeout: StdDuration,
	/// Overall deadline applied to logical requests that do not set their own.
	pub default_deadline: Option<StdDuration>,
}
impl RetryPolicy {
	/// Derives the jittered exponential backoff policy.
	pub fn backoff(&self) -> BackoffPolicy {
		BackoffPolicy { base: self.base_backoff, max: self.max_backoff, jitter: self.jitter_factor }
	}
}
impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			base_backoff: StdDuration::from_secs(1),
			max_backoff: StdDuration::from_secs(60),
			jitter_factor: 0.2,
			request_timeout: StdDuration::from_secs(30),
			refresh_timeout: StdDuration::from_secs(10),
			default_deadline: None,
		}
	}
}

/// Quota-awareness policy for the rate tracker.
#[derive(Clone, Debug)]
pub struct RatePolicy {
	/// Remaining-call threshold below which dispatches are proactively spaced.
	pub low_water_mark: u64,
	/// Minimum spacing between quote polls.
	pub quote_interval: StdDuration,
	/// Minimum spacing between bar polls.
	pub bar_interval: StdDuration,
	/// Minimum spacing for every other category.
	pub default_interval: StdDuration,
}
impl RatePolicy {
	/// Minimum spacing between two dispatches of the given category.
	pub fn min_interval(&self, category: RequestCategory) -> StdDuration {
		match category {
			RequestCategory::Quotes => self.quote_interval,
			RequestCategory::Bars => self.bar_interval,
			RequestCategory::Orders | RequestCategory::Default => self.default_interval,
		}
	}
}
impl Default for RatePolicy {
	fn default() -> Self {
		Self {
			low_water_mark: 10,
			quote_interval: StdDuration::from_secs(5),
			bar_interval: StdDuration::from_secs(10),
			default_interval: StdDuration::from_secs(1),
		}
	}
}

/// Validated configuration for one broker gateway.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
	/// OAuth client identifier issued by the broker.
	pub client_id: String,
	/// OAuth client secret issued by the broker.
	pub client_secret: TokenSecret,
	/// Redirect URI registered with the broker for the interactive login.
	pub redirect_uri: Url,
	/// Base URL serving the `/authorize` and `/token` endpoints.
	pub auth_base_url: Url,
	/// Base URL of the REST API surface, including any environment prefix.
	pub api_base_url: Url,
	/// Retry and timeout policy.
	pub retry: RetryPolicy,
	/// Quota-awareness policy.
	pub rate: RatePolicy,
	/// Buffer subtracted from token lifetimes so refreshes land before the
	/// broker-side cutoff.
	pub token_safety_margin: Duration,
}
impl GatewayConfig {
	/// Starts a builder with the mandatory credentials.
	pub fn builder(
		client_id: impl Into<String>,
		client_secret: impl Into<String>,
	) -> GatewayConfigBuilder {
		GatewayConfigBuilder {
			client_id: client_id.into(),
			client_secret: TokenSecret::new(client_secret),
			redirect_uri: None,
			auth_base_url: None,
			api_base_url: None,
			retry: RetryPolicy::default(),
			rate: RatePolicy::default(),
			token_safety_margin: Duration::seconds(30),
		}
	}

	/// Resolves a request path against the API base URL.
	///
	/// Concatenation instead of [`Url::join`] so environment prefixes on the
	/// base URL (`/sim/openapi`) survive; `join` would discard them for paths
	/// with a leading slash.
	pub fn api_url(&self, path: &str) -> Result<Url, ConfigError> {
		let base = self.api_base_url.as_str().trim_end_matches('/');
		let path = path.trim_start_matches('/');
		let joined = format!("{base}/{path}");

		Url::parse(&joined)
			.map_err(|e| ConfigError::InvalidPath { path: path.to_owned(), source: e })
	}

	/// Full URL of the authorization endpoint.
	pub fn authorize_endpoint(&self) -> String {
		format!("{}/authorize", self.auth_base_url.as_str().trim_end_matches('/'))
	}

	/// Full URL of the token endpoint.
	pub fn token_endpoint(&self) -> String {
		format!("{}/token", self.auth_base_url.as_str().trim_end_matches('/'))
	}
}

/// Builder for [`GatewayConfig`] values.
#[derive(Clone, Debug)]
pub struct GatewayConfigBuilder {
	client_id: String,
	client_secret: TokenSecret,
	redirect_uri: Option<Url>,
	auth_base_url: Option<Url>,
	api_base_url: Option<Url>,
	retry: RetryPolicy,
	rate: RatePolicy,
	token_safety_margin: Duration,
}
impl GatewayConfigBuilder {
	/// Sets the redirect URI for the interactive login.
	pub fn redirect_uri(mut self, url: Url) -> Self {
		self.redirect_uri = Some(url);

		self
	}

	/// Sets the authorization-server base URL.
	pub fn auth_base_url(mut self, url: Url) -> Self {
		self.auth_base_url = Some(url);

		self
	}

	/// Sets the REST API base URL.
	pub fn api_base_url(mut self, url: Url) -> Self {
		self.api_base_url = Some(url);

		self
	}

	/// Overrides the retry and timeout policy.
	pub fn retry(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;

		self
	}

	/// Overrides the quota-awareness policy.
	pub fn rate(mut self, rate: RatePolicy) -> Self {
		self.rate = rate;

		self
	}

	/// Overrides the token safety margin.
	pub fn token_safety_margin(mut self, margin: Duration) -> Self {
		self.token_safety_margin = margin;

		self
	}

	/// Consumes the builder and validates the resulting configuration.
	pub fn build(self) -> Result<GatewayConfig, ConfigError> {
		let redirect_uri = self
			.redirect_uri
			.ok_or(ConfigError::InvalidEndpoint { endpoint: "redirect", url: "<unset>".into() })?;
		let auth_base_url = self.auth_base_url.ok_or(ConfigError::InvalidEndpoint {
			endpoint: "authorization",
			url: "<unset>".into(),
		})?;
		let api_base_url = self
			.api_base_url
			.ok_or(ConfigError::InvalidEndpoint { endpoint: "api", url: "<unset>".into() })?;
		let config = GatewayConfig {
			client_id: self.client_id,
			client_secret: self.client_secret,
			redirect_uri,
			auth_base_url,
			api_base_url,
			retry: self.retry,
			rate: self.rate,
			token_safety_margin: self.token_safety_margin,
		};

		config.validate()?;

		Ok(config)
	}
}

impl GatewayConfig {
	fn validate(&self) -> Result<(), ConfigError> {
		validate_endpoint("authorization", &self.auth_base_url)?;
		validate_endpoint("api", &self.api_base_url)?;
		validate_endpoint("redirect", &self.redirect_uri)?;

		if self.retry.max_attempts == 0 {
			return Err(ConfigError::OutOfRange {
				field: "retry.max_attempts",
				detail: "must be at least 1",
			});
		}
		if !(0.0..1.0).contains(&self.retry.jitter_factor) {
			return Err(ConfigError::OutOfRange {
				field: "retry.jitter_factor",
				detail: "must lie in [0, 1)",
			});
		}
		if self.retry.base_backoff > self.retry.max_backoff {
			return Err(ConfigError::OutOfRange {
				field: "retry.base_backoff",
				detail: "must not exceed retry.max_backoff",
			});
		}
		if self.token_safety_margin.is_negative() {
			return Err(ConfigError::OutOfRange {
				field: "token_safety_margin",
				detail: "must not be negative",
			});
		}

		Ok(())
	}
}

// HTTPS everywhere credentials travel; loopback is exempt so local redirect
// listeners and mock servers keep working.
fn validate_endpoint(name: &'static str, url: &Url) -> Result<(), ConfigError> {
	if url.scheme() == "https" || is_loopback(url) {
		Ok(())
	} else {
		Err(ConfigError::InsecureEndpoint { endpoint: name, url: url.to_string() })
	}
}

fn is_loopback(url: &Url) -> bool {
	match url.host() {
		Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
		Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
		Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
		None => false,
	}
}
