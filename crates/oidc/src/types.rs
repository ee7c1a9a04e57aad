use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// The token record persisted in the cache file.
///
/// `expires_at` is an absolute instant in Unix epoch milliseconds, never a
/// lifetime.
#[derive(Clone, Serialize, Deserialize)]
pub struct CachedTokenRecord {
    #[serde(serialize_with = "serialize_secret")]
    pub access_token: Secret<String>,
    #[serde(
        default,
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub refresh_token: Option<Secret<String>>,
    /// Unix timestamp (milliseconds) when the access token expires.
    pub expires_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

impl std::fmt::Debug for CachedTokenRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedTokenRecord")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Successful response body of the token endpoint.
#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: Secret<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime of the access token in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<Secret<String>>,
    #[serde(default)]
    pub id_token: Option<Secret<String>>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("id_token", &self.id_token.as_ref().map(|_| "[REDACTED]"))
            .field("scope", &self.scope)
            .finish()
    }
}

/// Terminal result of one call to [`crate::Authenticator::authenticate`].
#[derive(Debug, Clone)]
pub enum FlowOutcome {
    /// A usable access token, from the cache or a fresh exchange.
    TokenObtained(Secret<String>),
    /// The attempt ran and failed (discovery, bind, callback, exchange).
    AuthenticationFailed(String),
    /// No authorization callback arrived before the listener timed out.
    TimedOut,
    /// Configuration could not be loaded; the flow never started.
    Disabled(String),
}

impl FlowOutcome {
    /// The access token, when one was obtained.
    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        match self {
            Self::TokenObtained(token) => Some(token.expose_secret().as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::TokenObtained(_))
    }
}

impl std::fmt::Display for FlowOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TokenObtained(_) => f.write_str("access token obtained"),
            Self::AuthenticationFailed(reason) => write!(f, "authentication failed: {reason}"),
            Self::TimedOut => f.write_str("timed out waiting for the authorization callback"),
            Self::Disabled(reason) => write!(f, "authentication disabled: {reason}"),
        }
    }
}

// ── Serde helpers for Secret<String> ────────────────────────────────────────

/// Serialize a `Secret<String>` by exposing its inner value.
/// Only used for the cache file, which must round-trip the token.
pub fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

/// Serialize an `Option<Secret<String>>` by exposing its inner value.
pub fn serialize_option_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}
