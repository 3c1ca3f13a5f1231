//! Storage contracts and built-in store implementations for the persisted token state.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

// self
use crate::{_prelude::*, token::TokenState};

/// Boxed future returned by [`TokenStore`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + 'a + Send>>;

/// Persistence contract for the single broker token state.
///
/// The state is saved and loaded as one unit. A missing state is a normal
/// condition (first run, or the operator wiped the credentials) and is reported
/// as `Ok(None)`, never as an error.
pub trait TokenStore
where
	Self: Send + Sync,
{
	/// Fetches the persisted state, if any.
	fn load(&self) -> StoreFuture<'_, Option<TokenState>>;

	/// Persists the state, replacing whatever was stored before.
	fn save(&self, state: TokenState) -> StoreFuture<'_, ()>;

	/// Removes the persisted state so the next run starts unauthenticated.
	fn clear(&self) -> StoreFuture<'_, ()>;
}

/// Error type produced by [`TokenStore`] implementations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum StoreError {
	/// Serialization failures surfaced by the backend.
	#[error("Serialization error: {message}.")]
	Serialization {
		/// Human-readable error payload.
		message: String,
	},
	/// Backend-level failure for the storage engine.
	#[error("Backend failure: {message}.")]
	Backend {
		/// Human-readable error payload.
		message: String,
	},
}
