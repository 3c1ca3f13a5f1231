//! Interactive login collaborator: walks the operator through the browser-based
//! authorization flow and persists the resulting token state for the bot.
//!
//! This binary is the only place with stdio interaction; the library itself
//! never prompts. Configure via environment variables:
//!
//! - `BROKER_APP_KEY` / `BROKER_APP_SECRET` — OAuth client credentials.
//! - `BROKER_AUTH_URL` — base URL serving `/authorize` and `/token`.
//! - `BROKER_API_URL` — REST API base URL (environment prefix included).
//! - `BROKER_TOKEN_FILE` — token snapshot path (default `tokens.json`).

// std
use std::{
	env,
	io::{BufRead, BufReader, Write},
	net::TcpListener,
	sync::Arc,
};
// crates.io
use color_eyre::{Result, eyre::eyre};
use url::Url;
// self
use tradegate::{
	client::ApiClient,
	config::GatewayConfig,
	store::FileStore,
};

const REDIRECT_ADDR: &str = "127.0.0.1:9321";

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.init();

	let config = GatewayConfig::builder(env::var("BROKER_APP_KEY")?, env::var("BROKER_APP_SECRET")?)
		.redirect_uri(Url::parse(&format!("http://{REDIRECT_ADDR}/callback"))?)
		.auth_base_url(Url::parse(&env::var("BROKER_AUTH_URL")?)?)
		.api_base_url(Url::parse(&env::var("BROKER_API_URL")?)?)
		.build()?;
	let token_file = env::var("BROKER_TOKEN_FILE").unwrap_or_else(|_| "tokens.json".into());
	let store = Arc::new(FileStore::open(&token_file)?);
	let client = ApiClient::new(config, store)?;
	let oauth = client.oauth();
	let session = oauth.begin_authorization();

	println!("Open this URL in your browser and approve access:");
	println!();
	println!("    {}", session.authorize_url());
	println!();
	println!("Waiting for the redirect on http://{REDIRECT_ADDR}/callback ...");

	let (code, returned_state) = wait_for_redirect()?;
	let state = oauth.complete_authorization(&session, &code, &returned_state).await?;

	println!("Authorization complete.");
	println!("Access token valid until {}.", state.access_expires_at);
	println!("Refresh token valid until {}.", state.refresh_expires_at);
	println!("Token state saved to {token_file}.");

	Ok(())
}

/// Accepts exactly one redirect request and extracts `code` and `state`.
fn wait_for_redirect() -> Result<(String, String)> {
	let listener = TcpListener::bind(REDIRECT_ADDR)?;
	let (mut stream, _) = listener.accept()?;
	let request_line = {
		let mut reader = BufReader::new(&stream);
		let mut line = String::new();

		reader.read_line(&mut line)?;

		line
	};
	let path = request_line
		.split_whitespace()
		.nth(1)
		.ok_or_else(|| eyre!("Malformed redirect request: {request_line:?}"))?;
	let url = Url::parse(&format!("http://{REDIRECT_ADDR}{path}"))?;
	let mut code = None;
	let mut state = None;

	for (key, value) in url.query_pairs() {
		match key.as_ref() {
			"code" => code = Some(value.into_owned()),
			"state" => state = Some(value.into_owned()),
			_ => {},
		}
	}

	stream.write_all(
		b"HTTP/1.1 200 OK\r\ncontent-type: text/html\r\n\r\n\
		<html><body><h3>Login captured.</h3>You can close this tab.</body></html>",
	)?;

	match (code, state) {
		(Some(code), Some(state)) => Ok((code, state)),
		_ => Err(eyre!("Redirect did not carry both `code` and `state`: {url}")),
	}
}
