//! Transport adapter between `oauth2` token exchanges and the reqwest stack.
//!
//! `oauth2` reports endpoint failures without surfacing raw response headers, so
//! the adapter captures the HTTP status and quota headers of every token call in
//! a [`ResponseMetadataSlot`] before handing the body back. The session layer
//! reads the slot right after the exchange resolves to classify failures and to
//! feed the shared rate tracker, since token calls spend broker quota too.

// crates.io
use oauth2::{AsyncHttpClient, HttpClientError, HttpRequest, HttpResponse};
use reqwest::redirect::Policy;
// self
use crate::{_prelude::*, error::ConfigError, rate::QuotaSnapshot};

/// Metadata captured from the most recent token-endpoint response.
#[derive(Clone, Debug, Default)]
pub struct ResponseMetadata {
	/// HTTP status code returned by the token endpoint, if a response arrived.
	pub status: Option<u16>,
	/// Quota headers attached to the response, including any `Retry-After` hint.
	pub quota: QuotaSnapshot,
}

/// Thread-safe slot sharing [`ResponseMetadata`] between the transport and the session.
///
/// A fresh value is stored per request; [`take`](Self::take) is called before
/// dispatch so stale metadata never leaks across retries.
#[derive(Clone, Debug, Default)]
pub struct ResponseMetadataSlot(Arc<Mutex<Option<ResponseMetadata>>>);
impl ResponseMetadataSlot {
	/// Stores new metadata for the current request.
	pub fn store(&self, meta: ResponseMetadata) {
		*self.0.lock() = Some(meta);
	}

	/// Returns the captured metadata, if any, consuming it from the slot.
	pub fn take(&self) -> Option<ResponseMetadata> {
		self.0.lock().take()
	}
}

/// Dedicated no-redirect HTTP client for token-endpoint traffic.
///
/// Token exchanges carry credentials in the body, so redirect following stays
/// off, and the transport gets its own timeout so a hung refresh cannot stall
/// API callers longer than the configured window.
#[derive(Clone, Debug)]
pub struct TokenTransport(ReqwestClient);
impl TokenTransport {
	/// Builds the transport with the provided request timeout.
	pub fn new(timeout: StdDuration) -> Result<Self, ConfigError> {
		Ok(Self(
			ReqwestClient::builder().redirect(Policy::none()).timeout(timeout).build()?,
		))
	}

	/// Builds an instrumented handle that records outcomes in `slot`.
	pub(crate) fn instrumented(&self, slot: ResponseMetadataSlot) -> InstrumentedHandle {
		InstrumentedHandle(Arc::new(InstrumentedInner { client: self.0.clone(), slot }))
	}
}

struct InstrumentedInner {
	client: ReqwestClient,
	slot: ResponseMetadataSlot,
}

/// [`AsyncHttpClient`] handle that mirrors response metadata into its slot.
#[derive(Clone)]
pub(crate) struct InstrumentedHandle(Arc<InstrumentedInner>);
impl<'c> AsyncHttpClient<'c> for InstrumentedHandle {
	type Error = HttpClientError<ReqwestError>;
	type Future =
		Pin<Box<dyn Future<Output = Result<HttpResponse, Self::Error>> + 'c + Send + Sync>>;

	fn call(&'c self, request: HttpRequest) -> Self::Future {
		let inner = Arc::clone(&self.0);

		Box::pin(async move {
			inner.slot.take();

			let response = inner
				.client
				.execute(request.try_into().map_err(Box::new)?)
				.await
				.map_err(Box::new)?;
			let status = response.status();
			let headers = response.headers().to_owned();

			inner.slot.store(ResponseMetadata {
				status: Some(status.as_u16()),
				quota: QuotaSnapshot::from_headers(&headers),
			});

			let mut response_new =
				HttpResponse::new(response.bytes().await.map_err(Box::new)?.to_vec());

			*response_new.status_mut() = status;
			*response_new.headers_mut() = headers;

			Ok(response_new)
		})
	}
}
