//! Persisted token lifecycle state for the single broker session.

// self
use crate::{_prelude::*, token::TokenSecret};

/// Lifecycle phase of the stored token pair at a given instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenPhase {
	/// The access token is usable as-is.
	Valid,
	/// The access token is stale; the refresh token can still mint a new one.
	AccessExpired,
	/// The refresh token is spent; interactive re-authorization is required.
	RefreshExpired,
}

/// Token pair persisted between runs.
///
/// Replaced wholesale on every successful refresh—fields are never patched
/// individually, so a loaded state is always internally consistent. Expiry
/// instants already carry the safety margin subtracted at issuance, which means
/// staleness is detected here before the broker would actually reject the token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
	/// Short-lived bearer credential attached to API calls.
	pub access_token: TokenSecret,
	/// Longer-lived rotating credential used to mint new access tokens.
	pub refresh_token: TokenSecret,
	/// Absolute instant the access token stops being trusted.
	#[serde(with = "time::serde::timestamp")]
	pub access_expires_at: OffsetDateTime,
	/// Absolute instant the refresh token stops being trusted.
	#[serde(with = "time::serde::timestamp")]
	pub refresh_expires_at: OffsetDateTime,
}
impl TokenState {
	/// Builds a state from relative lifetimes as reported by the token endpoint.
	///
	/// `safety_margin` is subtracted from both expiries so the manager refreshes
	/// shortly before the broker-side cutoff.
	pub fn issue(
		access_token: impl Into<String>,
		refresh_token: impl Into<String>,
		issued_at: OffsetDateTime,
		expires_in: Duration,
		refresh_expires_in: Duration,
		safety_margin: Duration,
	) -> Self {
		Self {
			access_token: TokenSecret::new(access_token),
			refresh_token: TokenSecret::new(refresh_token),
			access_expires_at: issued_at + expires_in - safety_margin,
			refresh_expires_at: issued_at + refresh_expires_in - safety_margin,
		}
	}

	/// Computes the lifecycle phase at the provided instant.
	pub fn phase_at(&self, instant: OffsetDateTime) -> TokenPhase {
		if instant < self.access_expires_at {
			TokenPhase::Valid
		} else if instant < self.refresh_expires_at {
			TokenPhase::AccessExpired
		} else {
			TokenPhase::RefreshExpired
		}
	}

	/// Convenience helper evaluating the phase against the current UTC clock.
	pub fn phase(&self) -> TokenPhase {
		self.phase_at(OffsetDateTime::now_utc())
	}

	/// Returns `true` if the access token is usable at the provided instant.
	pub fn is_access_valid_at(&self, instant: OffsetDateTime) -> bool {
		matches!(self.phase_at(instant), TokenPhase::Valid)
	}
}
impl Debug for TokenState {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenState")
			.field("access_token", &"<redacted>")
			.field("refresh_token", &"<redacted>")
			.field("access_expires_at", &self.access_expires_at)
			.field("refresh_expires_at", &self.refresh_expires_at)
			.finish()
	}
}
