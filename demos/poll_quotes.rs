//! Polls price snapshots in a loop, letting the client pace dispatches against
//! the broker's quota headers. Run `login` first to persist a token state.
//!
//! Environment variables as in `login`, plus `BROKER_UICS` (comma-separated
//! instrument identifiers, default `21`).

// std
use std::{env, sync::Arc};
// crates.io
use color_eyre::Result;
use url::Url;
// self
use tradegate::{
	client::{ApiClient, ApiRequest},
	config::{GatewayConfig, RequestCategory},
	store::FileStore,
};

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.init();

	let config = GatewayConfig::builder(env::var("BROKER_APP_KEY")?, env::var("BROKER_APP_SECRET")?)
		.redirect_uri(Url::parse("http://127.0.0.1:9321/callback")?)
		.auth_base_url(Url::parse(&env::var("BROKER_AUTH_URL")?)?)
		.api_base_url(Url::parse(&env::var("BROKER_API_URL")?)?)
		.build()?;
	let token_file = env::var("BROKER_TOKEN_FILE").unwrap_or_else(|_| "tokens.json".into());
	let store = Arc::new(FileStore::open(token_file)?);
	let client = ApiClient::new(config, store)?;
	let uics = env::var("BROKER_UICS").unwrap_or_else(|_| "21".into());

	for round in 1..=10 {
		let request = ApiRequest::get("/trade/v1/infoprices/list")
			.query("AssetType", "FxSpot")
			.query("Uics", &uics)
			.category(RequestCategory::Quotes);
		let body = client.send(&request).await?;

		for quote in body["Data"].as_array().into_iter().flatten() {
			println!(
				"[{round:02}] uic={} bid={} ask={}",
				quote["Uic"], quote["Quote"]["Bid"], quote["Quote"]["Ask"],
			);
		}

		if let Some(headroom) = client.rate().headroom() {
			println!("[{round:02}] quota headroom: {headroom} calls");
		}
	}

	println!(
		"Done: {} HTTP calls for {} requests ({} retries, {} throttles).",
		client.stats().attempts(),
		client.stats().successes(),
		client.stats().retries(),
		client.stats().throttles(),
	);

	Ok(())
}
