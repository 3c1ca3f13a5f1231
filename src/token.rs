//! Token state and secret-redaction primitives.

pub mod secret;
pub mod state;

pub use secret::TokenSecret;
pub use state::{TokenPhase, TokenState};
