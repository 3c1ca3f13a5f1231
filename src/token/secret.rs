//! Redacting wrapper for bearer and refresh secrets.

// self
use crate::_prelude::*;

/// Opaque credential wrapper that keeps secret material out of logs.
///
/// Both `Debug` and `Display` render `<redacted>`; the only way to reach the raw
/// value is an explicit [`expose`](TokenSecret::expose) call, which makes every
/// leak site grep-able.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSecret(String);
impl TokenSecret {
	/// Wraps a secret string.
	pub fn new(value: impl Into<String>) -> Self {
		Self(value.into())
	}

	/// Returns the raw secret. Callers must never pass this to a log sink.
	pub fn expose(&self) -> &str {
		&self.0
	}
}
impl AsRef<str> for TokenSecret {
	fn as_ref(&self) -> &str {
		self.expose()
	}
}
impl Debug for TokenSecret {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_tuple("TokenSecret").field(&"<redacted>").finish()
	}
}
impl Display for TokenSecret {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("<redacted>")
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn formatters_never_leak_the_inner_value() {
		let secret = TokenSecret::new("bearer-material");

		assert_eq!(format!("{secret:?}"), "TokenSecret(\"<redacted>\")");
		assert_eq!(format!("{secret}"), "<redacted>");
		assert_eq!(secret.expose(), "bearer-material");
	}

	#[test]
	fn serde_uses_the_plain_string_form() {
		let secret = TokenSecret::new("abc");
		let payload = serde_json::to_string(&secret).expect("Secret should serialize to JSON.");

		assert_eq!(payload, "\"abc\"");

		let round_trip: TokenSecret =
			serde_json::from_str(&payload).expect("Secret should deserialize from JSON.");

		assert_eq!(round_trip, secret);
	}
}
