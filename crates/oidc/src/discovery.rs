//! OpenID Connect discovery (OpenID Connect Discovery 1.0, section 4).
//!
//! Callers may configure either the bare issuer or the full metadata URL; both
//! normalize to the same issuer before the metadata document is fetched.

use {
    reqwest::Client,
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    tracing::{debug, info},
    url::Url,
};

use crate::{Error, Result};

/// Path suffix of the provider metadata document.
pub const WELL_KNOWN_SUFFIX: &str = "/.well-known/openid-configuration";

/// Provider metadata, restricted to the fields this flow reads.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub token_endpoint_auth_methods_supported: Vec<String>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

/// How the client authenticates at the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenEndpointAuth {
    /// HTTP Basic with the form-urlencoded client id and secret.
    ClientSecretBasic,
    /// `client_id` and `client_secret` in the request body.
    ClientSecretPost,
    /// Public client: only `client_id` in the request body.
    None,
}

impl TokenEndpointAuth {
    fn select(advertised: &[String], has_secret: bool) -> Self {
        if !has_secret {
            return Self::None;
        }
        let supports = |method: &str| advertised.iter().any(|m| m == method);
        if advertised.is_empty() || supports("client_secret_basic") {
            Self::ClientSecretBasic
        } else if supports("client_secret_post") {
            Self::ClientSecretPost
        } else {
            Self::ClientSecretBasic
        }
    }
}

/// Endpoints and client credentials for one authorization attempt.
#[derive(Debug, Clone)]
pub struct ResolvedProviderConfig {
    pub issuer: String,
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub token_auth: TokenEndpointAuth,
}

/// Derive the issuer from a configured discovery URL.
///
/// A path ending in [`WELL_KNOWN_SUFFIX`] loses exactly that suffix; any other
/// path is kept verbatim. Query and fragment are dropped.
#[must_use]
pub fn issuer_from_discovery_url(discovery_url: &Url) -> String {
    let path = discovery_url.path();
    let issuer_path = path.strip_suffix(WELL_KNOWN_SUFFIX).unwrap_or(path);
    format!(
        "{}{issuer_path}",
        discovery_url.origin().ascii_serialization()
    )
}

/// The metadata document URL for an issuer.
pub fn metadata_url(issuer: &str) -> Result<Url> {
    let raw = format!("{}{WELL_KNOWN_SUFFIX}", issuer.trim_end_matches('/'));
    Url::parse(&raw)
        .map_err(|e| Error::discovery(format!("invalid metadata URL {raw}: {e}")))
}

fn same_issuer(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}

/// Fetch and validate the provider metadata for `issuer`.
pub async fn fetch_metadata(client: &Client, issuer: &str) -> Result<ProviderMetadata> {
    let url = metadata_url(issuer)?;
    debug!(url = %url, "fetching provider metadata");

    let resp = client
        .get(url.as_str())
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(|e| Error::discovery(format!("failed to fetch {url}: {e}")))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::discovery(format!(
            "provider metadata returned HTTP {status}: {body}"
        )));
    }

    let meta: ProviderMetadata = resp
        .json()
        .await
        .map_err(|e| Error::discovery(format!("malformed provider metadata: {e}")))?;

    if !same_issuer(&meta.issuer, issuer) {
        return Err(Error::discovery(format!(
            "issuer mismatch: expected {issuer}, metadata declares {}",
            meta.issuer
        )));
    }

    Ok(meta)
}

/// Resolve a discovery URL into endpoints bound to the given client.
///
/// Not memoized: every attempt rediscovers, since the client credentials may
/// differ between attempts.
pub async fn resolve(
    client: &Client,
    discovery_url: &Url,
    client_id: &str,
    client_secret: &Secret<String>,
) -> Result<ResolvedProviderConfig> {
    let issuer = issuer_from_discovery_url(discovery_url);
    info!(issuer = %issuer, "discovering OIDC configuration");

    let meta = fetch_metadata(client, &issuer).await?;

    let authorization_endpoint = Url::parse(&meta.authorization_endpoint)
        .map_err(|e| Error::discovery(format!("invalid authorization_endpoint: {e}")))?;
    let token_endpoint = Url::parse(&meta.token_endpoint)
        .map_err(|e| Error::discovery(format!("invalid token_endpoint: {e}")))?;

    if !meta.code_challenge_methods_supported.is_empty()
        && !meta.code_challenge_methods_supported.iter().any(|m| m == "S256")
    {
        debug!(
            methods = ?meta.code_challenge_methods_supported,
            "provider does not advertise S256, sending it anyway"
        );
    }

    let has_secret = !client_secret.expose_secret().is_empty();
    let token_auth =
        TokenEndpointAuth::select(&meta.token_endpoint_auth_methods_supported, has_secret);

    info!(
        issuer = %meta.issuer,
        authorization_endpoint = %authorization_endpoint,
        token_endpoint = %token_endpoint,
        "resolved provider endpoints"
    );

    Ok(ResolvedProviderConfig {
        issuer: meta.issuer,
        authorization_endpoint,
        token_endpoint,
        client_id: client_id.to_string(),
        client_secret: client_secret.clone(),
        token_auth,
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn issuer(raw: &str) -> String {
        issuer_from_discovery_url(&Url::parse(raw).unwrap())
    }

    // ── Issuer normalization ───────────────────────────────────────────

    #[test]
    fn strips_well_known_suffix() {
        assert_eq!(
            issuer("https://idp.example.com/realms/dev/.well-known/openid-configuration"),
            "https://idp.example.com/realms/dev"
        );
    }

    #[test]
    fn strips_suffix_at_root() {
        assert_eq!(
            issuer("https://idp.example.com/.well-known/openid-configuration"),
            "https://idp.example.com"
        );
    }

    #[test]
    fn keeps_bare_issuer_path() {
        assert_eq!(
            issuer("https://idp.example.com/realms/dev"),
            "https://idp.example.com/realms/dev"
        );
    }

    #[test]
    fn strips_only_the_suffix() {
        assert_eq!(
            issuer("https://idp.example.com/.well-known/openid-configuration/.well-known/openid-configuration"),
            "https://idp.example.com/.well-known/openid-configuration"
        );
        // Not a suffix match: left alone.
        assert_eq!(
            issuer("https://idp.example.com/.well-known/openid-configuration-x"),
            "https://idp.example.com/.well-known/openid-configuration-x"
        );
    }

    #[test]
    fn keeps_port_and_drops_query() {
        assert_eq!(
            issuer("http://localhost:8080/tenant/.well-known/openid-configuration?x=1"),
            "http://localhost:8080/tenant"
        );
    }

    #[test]
    fn metadata_url_tolerates_trailing_slash() {
        assert_eq!(
            metadata_url("https://idp.example.com/").unwrap().as_str(),
            "https://idp.example.com/.well-known/openid-configuration"
        );
    }

    // ── Token endpoint auth selection ──────────────────────────────────

    #[test]
    fn auth_defaults_to_basic() {
        assert_eq!(
            TokenEndpointAuth::select(&[], true),
            TokenEndpointAuth::ClientSecretBasic
        );
    }

    #[test]
    fn auth_uses_post_when_only_post_advertised() {
        assert_eq!(
            TokenEndpointAuth::select(&["client_secret_post".into()], true),
            TokenEndpointAuth::ClientSecretPost
        );
    }

    #[test]
    fn auth_is_none_without_secret() {
        assert_eq!(
            TokenEndpointAuth::select(&["client_secret_basic".into()], false),
            TokenEndpointAuth::None
        );
    }

    // ── HTTP (mockito) ─────────────────────────────────────────────────

    fn metadata_body(base: &str) -> String {
        serde_json::json!({
            "issuer": base,
            "authorization_endpoint": format!("{base}/authorize"),
            "token_endpoint": format!("{base}/token"),
            "code_challenge_methods_supported": ["S256"],
        })
        .to_string()
    }

    #[tokio::test]
    async fn resolve_from_metadata_url() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/.well-known/openid-configuration")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(metadata_body(&server.url()))
            .create_async()
            .await;

        let discovery =
            Url::parse(&format!("{}/.well-known/openid-configuration", server.url())).unwrap();
        let resolved = resolve(
            &Client::new(),
            &discovery,
            "client",
            &Secret::new("secret".into()),
        )
        .await
        .unwrap();

        assert_eq!(resolved.issuer, server.url());
        assert_eq!(
            resolved.authorization_endpoint.as_str(),
            format!("{}/authorize", server.url())
        );
        assert_eq!(
            resolved.token_endpoint.as_str(),
            format!("{}/token", server.url())
        );
        assert_eq!(resolved.client_id, "client");
        assert_eq!(resolved.token_auth, TokenEndpointAuth::ClientSecretBasic);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn resolve_from_bare_issuer_with_path() {
        let mut server = mockito::Server::new_async().await;
        let issuer = format!("{}/realms/dev", server.url());
        let mock = server
            .mock("GET", "/realms/dev/.well-known/openid-configuration")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(metadata_body(&issuer))
            .create_async()
            .await;

        let resolved = resolve(
            &Client::new(),
            &Url::parse(&issuer).unwrap(),
            "client",
            &Secret::new(String::new()),
        )
        .await
        .unwrap();

        assert_eq!(resolved.issuer, issuer);
        assert_eq!(resolved.token_auth, TokenEndpointAuth::None);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_status_is_discovery_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/.well-known/openid-configuration")
            .with_status(404)
            .with_body("not found")
            .create_async()
            .await;

        let err = fetch_metadata(&Client::new(), &server.url())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Discovery { .. }));
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn malformed_metadata_is_discovery_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/.well-known/openid-configuration")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"issuer":"x"}"#)
            .create_async()
            .await;

        let err = fetch_metadata(&Client::new(), &server.url())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Discovery { .. }));
    }

    #[tokio::test]
    async fn issuer_mismatch_is_discovery_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/.well-known/openid-configuration")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(metadata_body("https://someone-else.example.com"))
            .create_async()
            .await;

        let err = fetch_metadata(&Client::new(), &server.url())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("issuer mismatch"));
    }

    #[tokio::test]
    async fn network_failure_is_discovery_error() {
        let client = Client::builder()
            .timeout(std::time::Duration::from_millis(200))
            .build()
            .unwrap();
        let err = fetch_metadata(&client, "http://127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, Error::Discovery { .. }));
    }
}
