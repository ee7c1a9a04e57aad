//! PKCE verifier/challenge (RFC 7636, S256) and per-attempt random values.

use {
    base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD},
    rand::RngCore,
    secrecy::{ExposeSecret, Secret},
    sha2::{Digest, Sha256},
};

/// Bytes of entropy behind every generated value (43 chars once encoded).
const RANDOM_BYTES: usize = 32;

fn random_urlsafe() -> String {
    let mut bytes = [0u8; RANDOM_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// A fresh PKCE code verifier.
#[must_use]
pub fn generate_verifier() -> String {
    random_urlsafe()
}

/// `BASE64URL(SHA256(verifier))` without padding.
#[must_use]
pub fn challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

#[must_use]
pub fn generate_state() -> String {
    random_urlsafe()
}

#[must_use]
pub fn generate_nonce() -> String {
    random_urlsafe()
}

/// Secrets bound to a single authorization attempt. Never persisted.
pub struct FlowSecrets {
    code_verifier: Secret<String>,
    pub state: String,
    pub nonce: String,
}

impl FlowSecrets {
    #[must_use]
    pub fn generate() -> Self {
        Self {
            code_verifier: Secret::new(generate_verifier()),
            state: generate_state(),
            nonce: generate_nonce(),
        }
    }

    #[must_use]
    pub fn code_verifier(&self) -> &str {
        self.code_verifier.expose_secret()
    }

    #[must_use]
    pub fn code_challenge(&self) -> String {
        challenge(self.code_verifier())
    }
}

impl std::fmt::Debug for FlowSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowSecrets")
            .field("code_verifier", &"[REDACTED]")
            .field("state", &self.state)
            .field("nonce", &self.nonce)
            .finish()
    }
}
