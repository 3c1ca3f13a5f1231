//! Error taxonomy shared by the token lifecycle and the retrying requester.
//!
//! The five caller-facing kinds map onto how a trading bot must react:
//! [`Error::Authentication`] halts trade-affecting operations until the operator
//! re-authorizes, [`Error::RateLimitExceeded`] and [`Error::Transient`] degrade the
//! current polling cycle, [`Error::Client`] and [`Error::Protocol`] point at a bug
//! on one side of the wire and are never retried.

// self
use crate::_prelude::*;

/// Crate-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Canonical error exposed by the client facade.
///
/// Retryable conditions are fully resolved (retried or exhausted) before any value
/// of this type reaches a caller; collaborators never run their own retry loop.
#[derive(Debug, ThisError)]
pub enum Error {
	/// Token-store failure.
	#[error("{0}")]
	Storage(
		#[from]
		#[source]
		crate::store::StoreError,
	),
	/// Local configuration problem.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// Bearer credentials are unusable for this call.
	#[error("Authentication failed: {reason}")]
	Authentication {
		/// Redacted description of the failure.
		reason: String,
		/// True when the stored refresh token is spent and the operator must run the
		/// interactive login flow again.
		reauthorize: bool,
	},
	/// Every bounded retry against HTTP 429 responses was consumed.
	#[error("Rate limit exceeded after {attempts} attempts.")]
	RateLimitExceeded {
		/// Number of HTTP calls issued for the logical request.
		attempts: u32,
		/// Delay the broker last suggested before the next call, if any.
		retry_after: Option<StdDuration>,
	},
	/// Temporary failure; bounded retries are already included.
	#[error(transparent)]
	Transient(#[from] TransientError),
	/// Caller-side mistake the broker rejected; never retried.
	#[error("Broker rejected the request (HTTP {status}): {message}")]
	Client {
		/// HTTP status returned by the broker.
		status: u16,
		/// Broker-supplied error message, if any.
		message: String,
	},
	/// Response shape is incompatible with what this client expects.
	#[error(transparent)]
	Protocol(#[from] ProtocolError),
}
impl Error {
	/// Returns `true` when the operator must redo the interactive authorization flow
	/// before any further trade-affecting call can succeed.
	pub fn requires_reauthorization(&self) -> bool {
		matches!(self, Self::Authentication { reauthorize: true, .. })
	}
}

/// Configuration and validation failures raised while assembling the client.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// HTTP client could not be constructed.
	#[error("HTTP client could not be constructed.")]
	HttpClientBuild {
		/// Underlying transport builder failure.
		#[source]
		source: BoxError,
	},
	/// An OAuth or API endpoint URL failed to parse or validate.
	#[error("The {endpoint} endpoint is invalid: {url}.")]
	InvalidEndpoint {
		/// Which endpoint failed validation.
		endpoint: &'static str,
		/// Offending URL rendition.
		url: String,
	},
	/// Endpoints that carry credentials must use HTTPS (loopback exempt).
	#[error("The {endpoint} endpoint must use HTTPS: {url}.")]
	InsecureEndpoint {
		/// Which endpoint failed validation.
		endpoint: &'static str,
		/// Offending URL rendition.
		url: String,
	},
	/// A numeric policy knob was outside its supported range.
	#[error("Configuration field `{field}` is out of range: {detail}.")]
	OutOfRange {
		/// Name of the offending field.
		field: &'static str,
		/// Human-readable constraint description.
		detail: &'static str,
	},
	/// A request path could not be appended to the API base URL.
	#[error("Request path `{path}` cannot be joined to the API base URL.")]
	InvalidPath {
		/// Offending request path.
		path: String,
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
}
impl ConfigError {
	/// Wraps a transport builder failure inside [`ConfigError`].
	pub fn http_client_build(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::HttpClientBuild { source: Box::new(src) }
	}
}
impl From<ReqwestError> for ConfigError {
	fn from(e: ReqwestError) -> Self {
		Self::http_client_build(e)
	}
}

/// Temporary failure variants; safe for the *core* to retry, already exhausted by the
/// time a caller sees them.
#[derive(Debug, ThisError)]
pub enum TransientError {
	/// Underlying HTTP transport reported a network failure.
	#[error("Network error while calling the broker.")]
	Network {
		/// Transport-specific failure.
		#[source]
		source: BoxError,
	},
	/// Bounded retries were consumed without a conclusive response.
	#[error("Request gave up after {attempts} attempts (last HTTP status: {status:?}).")]
	Exhausted {
		/// Last observed HTTP status, if any response arrived.
		status: Option<u16>,
		/// Number of HTTP calls issued.
		attempts: u32,
	},
	/// A non-idempotent call timed out with unknown server-side effect; the caller must
	/// reconcile instead of the core blindly resubmitting.
	#[error("{method} {path} timed out with unknown server-side effect; not retried.")]
	AmbiguousOutcome {
		/// HTTP method of the ambiguous call.
		method: String,
		/// Request path of the ambiguous call.
		path: String,
	},
	/// The caller-supplied overall deadline elapsed before the next retry could run.
	#[error("Deadline exceeded after {elapsed:?}; aborting instead of sleeping further.")]
	DeadlineExceeded {
		/// Time spent on the logical request so far.
		elapsed: StdDuration,
	},
	/// The token endpoint returned an unexpected but non-fatal response.
	#[error("Token endpoint returned an unexpected response: {message}")]
	TokenEndpoint {
		/// Redacted message summarizing the failure.
		message: String,
		/// HTTP status code, when available.
		status: Option<u16>,
	},
}

/// Response-shape failures; the broker answered, but not in a form this client speaks.
#[derive(Debug, ThisError)]
pub enum ProtocolError {
	/// A response body could not be decoded into the expected shape.
	#[error("Response body could not be decoded (HTTP status: {status:?}).")]
	BodyDecode {
		/// Structured decode failure with the JSON path that diverged.
		#[source]
		source: serde_path_to_error::Error<serde_json::Error>,
		/// HTTP status code, when available.
		status: Option<u16>,
	},
	/// The token endpoint omitted `expires_in`.
	#[error("Token response is missing expires_in.")]
	MissingExpiresIn,
	/// The token endpoint returned an `expires_in` outside the supported range.
	#[error("Token response expires_in exceeds the supported range.")]
	ExpiresInOutOfRange,
	/// The initial code exchange did not issue a refresh token.
	#[error("Token response is missing the refresh token required for unattended operation.")]
	MissingRefreshToken,
}
