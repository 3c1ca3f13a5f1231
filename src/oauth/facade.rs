//! Thin facade over the `oauth2` crate for this broker's token endpoint.
//!
//! The broker speaks standard authorization-code and refresh-token grants with
//! one extension: token responses carry a non-standard
//! `refresh_token_expires_in` field reporting the rotating refresh token's
//! lifetime. The facade deserializes it through a custom extra-fields type and
//! folds every response into a [`TokenState`] with the safety margin applied.

// crates.io
use oauth2::{
	AuthUrl, AuthorizationCode, Client, ClientId, ClientSecret, CsrfToken, EndpointNotSet,
	EndpointSet, ExtraTokenFields, HttpClientError, RedirectUrl, RefreshToken, RequestTokenError,
	StandardRevocableToken, StandardTokenResponse, TokenResponse, TokenUrl,
	basic::{
		BasicErrorResponse, BasicErrorResponseType, BasicRevocationErrorResponse,
		BasicTokenIntrospectionResponse, BasicTokenType,
	},
};
use rand::{Rng, distr::Alphanumeric};
// self
use crate::{
	_prelude::*,
	config::GatewayConfig,
	error::{ConfigError, ProtocolError, TransientError},
	http::{ResponseMetadata, ResponseMetadataSlot, TokenTransport},
	rate::RateTracker,
	token::{TokenSecret, TokenState},
};

// Lifetime assumed for a rotated refresh token when the broker omits
// `refresh_token_expires_in`; short enough that the next refresh lands well
// before any plausible server-side cutoff.
const FALLBACK_REFRESH_LIFETIME: Duration = Duration::hours(1);
const STATE_LEN: usize = 32;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct RefreshLifetimeFields {
	refresh_token_expires_in: Option<u64>,
}
impl ExtraTokenFields for RefreshLifetimeFields {}

type BrokerTokenResponse = StandardTokenResponse<RefreshLifetimeFields, BasicTokenType>;
type BrokerClient<
	HasAuthUrl = EndpointSet,
	HasDeviceAuthUrl = EndpointNotSet,
	HasIntrospectionUrl = EndpointNotSet,
	HasRevocationUrl = EndpointNotSet,
	HasTokenUrl = EndpointSet,
> = Client<
	BasicErrorResponse,
	BrokerTokenResponse,
	BasicTokenIntrospectionResponse,
	StandardRevocableToken,
	BasicRevocationErrorResponse,
	HasAuthUrl,
	HasDeviceAuthUrl,
	HasIntrospectionUrl,
	HasRevocationUrl,
	HasTokenUrl,
>;
type UnconfiguredClient =
	BrokerClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet>;
type BrokerRequestTokenError = RequestTokenError<HttpClientError<ReqwestError>, BasicErrorResponse>;

pub(crate) struct TokenFacade {
	oauth_client: BrokerClient,
	transport: TokenTransport,
	tracker: RateTracker,
	safety_margin: Duration,
}
impl TokenFacade {
	pub(crate) fn new(config: &GatewayConfig, tracker: RateTracker) -> Result<Self, ConfigError> {
		let auth_url = AuthUrl::new(config.authorize_endpoint()).map_err(|_| {
			ConfigError::InvalidEndpoint { endpoint: "authorization", url: config.authorize_endpoint() }
		})?;
		let token_url = TokenUrl::new(config.token_endpoint()).map_err(|_| {
			ConfigError::InvalidEndpoint { endpoint: "token", url: config.token_endpoint() }
		})?;
		let redirect_url = RedirectUrl::new(config.redirect_uri.to_string()).map_err(|_| {
			ConfigError::InvalidEndpoint { endpoint: "redirect", url: config.redirect_uri.to_string() }
		})?;
		let oauth_client = UnconfiguredClient::new(ClientId::new(config.client_id.clone()))
			.set_client_secret(ClientSecret::new(config.client_secret.expose().to_owned()))
			.set_redirect_uri(redirect_url)
			.set_auth_uri(auth_url)
			.set_token_uri(token_url);

		Ok(Self {
			oauth_client,
			transport: TokenTransport::new(config.retry.refresh_timeout)?,
			tracker,
			safety_margin: config.token_safety_margin,
		})
	}

	/// Builds the authorization URL with a fresh random anti-forgery state.
	pub(crate) fn authorization_request(&self) -> (Url, String) {
		let state: String =
			rand::rng().sample_iter(Alphanumeric).take(STATE_LEN).map(char::from).collect();
		let (url, _) = {
			let state = state.clone();

			self.oauth_client.authorize_url(move || CsrfToken::new(state)).url()
		};

		(url, state)
	}

	/// Exchanges an authorization code for the initial token state.
	pub(crate) async fn exchange_code(&self, code: String) -> Result<TokenState> {
		let slot = ResponseMetadataSlot::default();
		let instrumented = self.transport.instrumented(slot.clone());
		let result = self
			.oauth_client
			.exchange_code(AuthorizationCode::new(code))
			.request_async(&instrumented)
			.await;
		let meta = self.observe(&slot);
		let response = result.map_err(|err| map_token_error(err, meta.as_ref()))?;

		self.state_from_response(&response, None)
	}

	/// Redeems the refresh token of `previous` for a replacement state.
	pub(crate) async fn refresh(&self, previous: &TokenState) -> Result<TokenState> {
		let slot = ResponseMetadataSlot::default();
		let instrumented = self.transport.instrumented(slot.clone());
		let refresh_secret = RefreshToken::new(previous.refresh_token.expose().to_owned());
		let result = self
			.oauth_client
			.exchange_refresh_token(&refresh_secret)
			.request_async(&instrumented)
			.await;
		let meta = self.observe(&slot);
		let response = result.map_err(|err| map_token_error(err, meta.as_ref()))?;

		self.state_from_response(&response, Some(previous))
	}

	// Token calls spend broker quota like any other request, so their headers
	// feed the shared tracker as well.
	fn observe(&self, slot: &ResponseMetadataSlot) -> Option<ResponseMetadata> {
		let meta = slot.take();

		if let Some(meta) = &meta {
			self.tracker.observe(&meta.quota);
		}

		meta
	}

	fn state_from_response(
		&self,
		response: &BrokerTokenResponse,
		previous: Option<&TokenState>,
	) -> Result<TokenState> {
		let expires_in = response.expires_in().ok_or(ProtocolError::MissingExpiresIn)?.as_secs();
		let expires_in = i64::try_from(expires_in).map_err(|_| ProtocolError::ExpiresInOutOfRange)?;

		if expires_in <= 0 {
			return Err(ProtocolError::ExpiresInOutOfRange.into());
		}

		let issued_at = OffsetDateTime::now_utc();
		let refresh_expires_in = response
			.extra_fields()
			.refresh_token_expires_in
			.and_then(|secs| i64::try_from(secs).ok())
			.map(Duration::seconds)
			.unwrap_or(FALLBACK_REFRESH_LIFETIME);

		match response.refresh_token() {
			Some(refresh) => Ok(TokenState::issue(
				response.access_token().secret().clone(),
				refresh.secret().clone(),
				issued_at,
				Duration::seconds(expires_in),
				refresh_expires_in,
				self.safety_margin,
			)),
			// Rotation is optional on the wire; a response without a new refresh
			// token keeps the previous secret and its expiry.
			None => match previous {
				Some(previous) => Ok(TokenState {
					access_token: TokenSecret::new(response.access_token().secret().clone()),
					refresh_token: previous.refresh_token.clone(),
					access_expires_at: issued_at + Duration::seconds(expires_in)
						- self.safety_margin,
					refresh_expires_at: previous.refresh_expires_at,
				}),
				None => Err(ProtocolError::MissingRefreshToken.into()),
			},
		}
	}
}

fn map_token_error(err: BrokerRequestTokenError, meta: Option<&ResponseMetadata>) -> Error {
	let status = meta.and_then(|meta| meta.status);

	match err {
		RequestTokenError::ServerResponse(response) => map_server_error(&response, status),
		RequestTokenError::Request(error) => map_transport_error(error, status),
		// A 429 or 5xx body rarely parses as an OAuth error document; classify
		// by status before blaming the payload shape.
		RequestTokenError::Parse(source, _body) =>
			if matches!(status, Some(code) if code == 429 || code >= 500) {
				TransientError::TokenEndpoint {
					message: "Token endpoint returned a non-OAuth error payload.".into(),
					status,
				}
				.into()
			} else {
				ProtocolError::BodyDecode { source, status }.into()
			},
		RequestTokenError::Other(message) =>
			TransientError::TokenEndpoint { message, status }.into(),
	}
}

fn map_server_error(response: &BasicErrorResponse, status: Option<u16>) -> Error {
	let code = response.error();
	let message = response
		.error_description()
		.cloned()
		.unwrap_or_else(|| code.as_ref().to_owned());

	if matches!(code, BasicErrorResponseType::InvalidGrant | BasicErrorResponseType::InvalidClient)
		|| matches!(status, Some(400) | Some(401))
	{
		return Error::Authentication {
			reason: format!("Token endpoint rejected the credentials: {message}"),
			reauthorize: true,
		};
	}

	TransientError::TokenEndpoint { message, status }.into()
}

fn map_transport_error(err: HttpClientError<ReqwestError>, status: Option<u16>) -> Error {
	match err {
		HttpClientError::Reqwest(inner) =>
			if inner.is_timeout() {
				TransientError::TokenEndpoint {
					message: "Request timed out while calling the token endpoint.".into(),
					status,
				}
				.into()
			} else {
				TransientError::Network { source: inner }.into()
			},
		HttpClientError::Http(inner) => TransientError::TokenEndpoint {
			message: format!("HTTP protocol error while calling the token endpoint: {inner}."),
			status,
		}
		.into(),
		HttpClientError::Io(inner) => TransientError::Network { source: Box::new(inner) }.into(),
		HttpClientError::Other(message) =>
			TransientError::TokenEndpoint { message, status }.into(),
		_ => TransientError::TokenEndpoint {
			message: "HTTP client error occurred while calling the token endpoint.".into(),
			status,
		}
		.into(),
	}
}
