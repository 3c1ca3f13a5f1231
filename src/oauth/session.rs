//! Token lifecycle manager with singleflight refresh.

// std
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
// crates.io
use tracing::{debug, warn};
// self
use crate::{
	_prelude::*,
	config::GatewayConfig,
	error::ConfigError,
	oauth::facade::TokenFacade,
	rate::RateTracker,
	store::TokenStore,
	token::{TokenPhase, TokenSecret, TokenState},
};

/// In-flight interactive authorization attempt.
///
/// Produced by [`OAuthManager::begin_authorization`]; the host opens
/// [`authorize_url`](Self::authorize_url) in a browser and hands the resulting
/// `code` and `state` query parameters back to
/// [`OAuthManager::complete_authorization`].
#[derive(Debug)]
pub struct AuthorizationSession {
	authorize_url: Url,
	state: String,
}
impl AuthorizationSession {
	/// URL the operator must visit to grant access.
	pub fn authorize_url(&self) -> &Url {
		&self.authorize_url
	}

	/// Anti-forgery state embedded in the authorization URL.
	pub fn state(&self) -> &str {
		&self.state
	}
}

/// Keeps a valid bearer token available to concurrent callers.
///
/// Expiry-triggered refreshes are singleflighted: when N callers find the
/// cached token stale at once, exactly one token-endpoint call happens and the
/// rest inherit its outcome. A spent refresh token latches the manager into an
/// unauthenticated state that only a new interactive authorization clears;
/// callers never see the manager retry its way out of that condition.
pub struct OAuthManager {
	facade: TokenFacade,
	store: Arc<dyn TokenStore>,
	cached: RwLock<Option<TokenState>>,
	refresh_guard: AsyncMutex<()>,
	reauth_required: AtomicBool,
	stats: RefreshStats,
}
impl OAuthManager {
	/// Builds a manager over the provided store and shared rate tracker.
	pub fn new(
		config: &GatewayConfig,
		store: Arc<dyn TokenStore>,
		tracker: RateTracker,
	) -> Result<Self, ConfigError> {
		Ok(Self {
			facade: TokenFacade::new(config, tracker)?,
			store,
			cached: RwLock::new(None),
			refresh_guard: AsyncMutex::new(()),
			reauth_required: AtomicBool::new(false),
			stats: RefreshStats::default(),
		})
	}

	/// Starts an interactive authorization attempt.
	pub fn begin_authorization(&self) -> AuthorizationSession {
		let (authorize_url, state) = self.facade.authorization_request();

		AuthorizationSession { authorize_url, state }
	}

	/// Finishes an interactive authorization attempt.
	///
	/// The returned `state` must match the one issued by
	/// [`begin_authorization`](Self::begin_authorization); a mismatch is treated
	/// as a forged redirect and rejected without contacting the broker.
	pub async fn complete_authorization(
		&self,
		session: &AuthorizationSession,
		code: &str,
		returned_state: &str,
	) -> Result<TokenState> {
		if returned_state != session.state {
			return Err(Error::Authentication {
				reason: "Authorization redirect carried an unexpected state parameter.".into(),
				reauthorize: true,
			});
		}

		let state = self.facade.exchange_code(code.to_owned()).await?;

		self.store.save(state.clone()).await?;
		*self.cached.write() = Some(state.clone());
		self.reauth_required.store(false, Ordering::Relaxed);

		debug!(
			access_expires_at = %state.access_expires_at,
			refresh_expires_at = %state.refresh_expires_at,
			"Interactive authorization completed.",
		);

		Ok(state)
	}

	/// Returns a bearer token valid at the time of the call.
	///
	/// Serves from cache without I/O when the cached token is still inside its
	/// safety margin; otherwise performs (or joins) a singleflighted refresh.
	pub async fn valid_access_token(&self) -> Result<TokenSecret> {
		self.ensure_not_latched()?;

		if let Some(token) = self.cached_valid_access(OffsetDateTime::now_utc()) {
			return Ok(token);
		}

		self.hydrate_from_store().await;

		if let Some(token) = self.cached_valid_access(OffsetDateTime::now_utc()) {
			return Ok(token);
		}

		self.refresh_under_guard(false).await
	}

	/// Forces a refresh regardless of the cached token's apparent validity.
	///
	/// Used when the broker rejects a token the clock still considers valid
	/// (revoked server-side, clock skew). Forced callers serialize behind the
	/// same guard as expiry-triggered refreshes.
	pub async fn refresh_now(&self) -> Result<TokenSecret> {
		self.ensure_not_latched()?;
		self.hydrate_from_store().await;
		self.refresh_under_guard(true).await
	}

	/// Refresh outcome counters.
	pub fn stats(&self) -> &RefreshStats {
		&self.stats
	}

	/// Returns `true` while a new interactive authorization is required.
	pub fn needs_authorization(&self) -> bool {
		self.reauth_required.load(Ordering::Relaxed)
	}

	fn ensure_not_latched(&self) -> Result<()> {
		if self.reauth_required.load(Ordering::Relaxed) {
			Err(Self::reauthorization_error())
		} else {
			Ok(())
		}
	}

	fn reauthorization_error() -> Error {
		Error::Authentication {
			reason: "Stored credentials are unusable; run the interactive authorization flow."
				.into(),
			reauthorize: true,
		}
	}

	fn cached_valid_access(&self, now: OffsetDateTime) -> Option<TokenSecret> {
		let guard = self.cached.read();
		let state = guard.as_ref()?;

		state.is_access_valid_at(now).then(|| state.access_token.clone())
	}

	async fn hydrate_from_store(&self) {
		if self.cached.read().is_some() {
			return;
		}

		match self.store.load().await {
			Ok(Some(state)) => {
				let mut guard = self.cached.write();

				// A concurrent hydration may have won the race.
				if guard.is_none() {
					*guard = Some(state);
				}
			},
			Ok(None) => {},
			Err(e) => warn!("Token store could not be read; treating it as empty: {e}"),
		}
	}

	async fn refresh_under_guard(&self, forced: bool) -> Result<TokenSecret> {
		let _singleflight = self.refresh_guard.lock().await;
		let now = OffsetDateTime::now_utc();

		// Another caller may have refreshed while this one waited for the guard.
		if !forced
			&& let Some(token) = self.cached_valid_access(now)
		{
			return Ok(token);
		}

		let Some(current) = self.cached.read().clone() else {
			return Err(self.latch("No stored credentials are available."));
		};

		if !forced && matches!(current.phase_at(now), TokenPhase::RefreshExpired) {
			*self.cached.write() = None;

			return Err(self.latch("The stored refresh token has expired."));
		}

		self.stats.record_attempt();

		match self.facade.refresh(&current).await {
			Ok(state) => {
				self.store.save(state.clone()).await?;
				*self.cached.write() = Some(state.clone());
				self.stats.record_success();

				debug!(
					forced,
					access_expires_at = %state.access_expires_at,
					"Access token refreshed.",
				);

				Ok(state.access_token)
			},
			Err(err) => {
				self.stats.record_failure();

				if err.requires_reauthorization() {
					*self.cached.write() = None;
					self.reauth_required.store(true, Ordering::Relaxed);

					warn!("Refresh token was rejected; interactive authorization required.");
				} else {
					warn!("Token refresh failed transiently; credentials retained: {err}");
				}

				Err(err)
			},
		}
	}

	fn latch(&self, reason: &str) -> Error {
		self.reauth_required.store(true, Ordering::Relaxed);

		warn!("{reason} Interactive authorization required.");

		Error::Authentication { reason: reason.into(), reauthorize: true }
	}
}

/// Refresh outcome counters kept by the manager for host-side monitoring.
///
/// Only refreshes that actually reach the token endpoint are counted; callers
/// that join an in-flight singleflight do not inflate the numbers.
#[derive(Debug, Default)]
pub struct RefreshStats {
	dispatched: AtomicU64,
	renewed: AtomicU64,
	failed: AtomicU64,
}
impl RefreshStats {
	/// Token-endpoint refresh calls dispatched so far.
	pub fn attempts(&self) -> u64 {
		self.dispatched.load(Ordering::Relaxed)
	}

	/// Refreshes that produced and persisted a replacement token state.
	pub fn successes(&self) -> u64 {
		self.renewed.load(Ordering::Relaxed)
	}

	/// Refreshes rejected by the token endpoint or lost in transit.
	pub fn failures(&self) -> u64 {
		self.failed.load(Ordering::Relaxed)
	}

	fn record_attempt(&self) {
		self.dispatched.fetch_add(1, Ordering::Relaxed);
	}

	fn record_success(&self) {
		self.renewed.fetch_add(1, Ordering::Relaxed);
	}

	fn record_failure(&self) {
		self.failed.fetch_add(1, Ordering::Relaxed);
	}
}
