use {
    async_trait::async_trait,
    base64::{
        Engine,
        engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    },
    secrecy::ExposeSecret,
    serde::Deserialize,
    tracing::{debug, info},
    url::{Url, form_urlencoded},
};

use crate::{
    Error, Result,
    discovery::{ResolvedProviderConfig, TokenEndpointAuth},
    pkce::FlowSecrets,
    types::{CachedTokenRecord, TokenResponse},
};

/// Turns an authorization code into tokens for one attempt.
///
/// The callback listener only sees this seam, so tests can stand in for the
/// token endpoint.
#[async_trait]
pub trait CodeExchanger: Send + Sync {
    /// The `state` value the callback must echo back.
    fn expected_state(&self) -> &str;

    async fn exchange(&self, code: &str) -> Result<TokenResponse>;
}

/// Everything one authorization attempt needs, owned in one place and handed
/// to the callback listener. Dropped when the attempt ends.
pub struct AttemptContext {
    http: reqwest::Client,
    provider: ResolvedProviderConfig,
    redirect_uri: Url,
    scope: String,
    secrets: FlowSecrets,
}

impl AttemptContext {
    pub fn new(
        http: reqwest::Client,
        provider: ResolvedProviderConfig,
        redirect_uri: Url,
        scope: impl Into<String>,
        secrets: FlowSecrets,
    ) -> Self {
        Self {
            http,
            provider,
            redirect_uri,
            scope: scope.into(),
            secrets,
        }
    }

    pub fn secrets(&self) -> &FlowSecrets {
        &self.secrets
    }

    /// The URL the user visits to authorize this attempt.
    pub fn authorization_url(&self) -> Url {
        let mut url = self.provider.authorization_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.provider.client_id)
            .append_pair("redirect_uri", self.redirect_uri.as_str())
            .append_pair("scope", &self.scope)
            .append_pair("response_type", "code")
            .append_pair("code_challenge", &self.secrets.code_challenge())
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", &self.secrets.state)
            .append_pair("nonce", &self.secrets.nonce);
        url
    }

    async fn request_tokens(&self, code: &str) -> Result<TokenResponse> {
        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", self.redirect_uri.to_string()),
            ("code_verifier", self.secrets.code_verifier().to_string()),
        ];

        let mut request = self.http.post(self.provider.token_endpoint.as_str());
        match self.provider.token_auth {
            TokenEndpointAuth::ClientSecretBasic => {
                let encode =
                    |s: &str| form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>();
                request = request.basic_auth(
                    encode(&self.provider.client_id),
                    Some(encode(self.provider.client_secret.expose_secret())),
                );
            },
            TokenEndpointAuth::ClientSecretPost => {
                form.push(("client_id", self.provider.client_id.clone()));
                form.push((
                    "client_secret",
                    self.provider.client_secret.expose_secret().clone(),
                ));
            },
            TokenEndpointAuth::None => {
                form.push(("client_id", self.provider.client_id.clone()));
            },
        }

        debug!(
            token_endpoint = %self.provider.token_endpoint,
            auth = ?self.provider.token_auth,
            "exchanging authorization code"
        );

        let resp = request
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::exchange(format!("token request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::exchange(describe_token_error(status, &body)));
        }

        resp.json::<TokenResponse>()
            .await
            .map_err(|e| Error::exchange(format!("malformed token response: {e}")))
    }
}

#[async_trait]
impl CodeExchanger for AttemptContext {
    fn expected_state(&self) -> &str {
        &self.secrets.state
    }

    async fn exchange(&self, code: &str) -> Result<TokenResponse> {
        let tokens = self.request_tokens(code).await?;
        if let Some(id_token) = &tokens.id_token {
            validate_nonce(id_token.expose_secret(), &self.secrets.nonce)?;
        }
        info!(issuer = %self.provider.issuer, "authorization code exchanged");
        Ok(tokens)
    }
}

#[derive(Deserialize)]
struct TokenErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

fn describe_token_error(status: reqwest::StatusCode, body: &str) -> String {
    match serde_json::from_str::<TokenErrorBody>(body) {
        Ok(TokenErrorBody {
            error,
            error_description: Some(description),
        }) => format!("token endpoint returned HTTP {status}: {error} ({description})"),
        Ok(TokenErrorBody { error, .. }) => {
            format!("token endpoint returned HTTP {status}: {error}")
        },
        Err(_) => format!("token endpoint returned HTTP {status}: {body}"),
    }
}

/// Check the `nonce` claim of an ID token. The signature is not verified.
pub fn validate_nonce(id_token: &str, expected: &str) -> Result<()> {
    let claims = parse_jwt_claims(id_token)
        .ok_or_else(|| Error::exchange("id_token is not a decodable JWT"))?;
    match claims.get("nonce").and_then(serde_json::Value::as_str) {
        Some(nonce) if nonce == expected => Ok(()),
        Some(_) => Err(Error::exchange("id_token nonce does not match this attempt")),
        None => Err(Error::exchange("id_token carries no nonce claim")),
    }
}

/// Build the cache record for a token response received at `now_ms`.
///
/// `expires_in` is converted into an absolute instant. Without it the
/// access token's `exp` claim is used, and failing that the record is
/// written already expired.
#[must_use]
pub fn token_record(resp: TokenResponse, now_ms: u64) -> CachedTokenRecord {
    let expires_at = match resp.expires_in {
        Some(secs) => now_ms.saturating_add(secs.saturating_mul(1000)),
        None => parse_jwt_claims(resp.access_token.expose_secret())
            .and_then(|claims| claims.get("exp").and_then(serde_json::Value::as_u64))
            .map_or(now_ms, |exp| exp.saturating_mul(1000)),
    };

    CachedTokenRecord {
        access_token: resp.access_token,
        refresh_token: resp.refresh_token,
        expires_at,
        token_type: resp.token_type,
    }
}

fn parse_jwt_claims(token: &str) -> Option<serde_json::Value> {
    let payload_b64 = token.split('.').nth(1)?;
    let payload = URL_SAFE_NO_PAD.decode(payload_b64).or_else(|_| {
        let padded = match payload_b64.len() % 4 {
            2 => format!("{payload_b64}=="),
            3 => format!("{payload_b64}="),
            _ => payload_b64.to_string(),
        };
        STANDARD.decode(padded)
    });
    let payload = payload.ok()?;
    serde_json::from_slice(&payload).ok()
}

impl std::fmt::Debug for AttemptContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptContext")
            .field("issuer", &self.provider.issuer)
            .field("redirect_uri", &self.redirect_uri.as_str())
            .field("scope", &self.scope)
            .field("secrets", &self.secrets)
            .finish_non_exhaustive()
    }
}
