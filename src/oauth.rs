//! OAuth token lifecycle: interactive authorization and unattended refresh.

pub use oauth2;

pub(crate) mod facade;

pub mod session;

pub use session::{AuthorizationSession, OAuthManager, RefreshStats};
