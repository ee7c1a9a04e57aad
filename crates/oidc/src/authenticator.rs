use std::{sync::Arc, time::Duration};

use tracing::{error, info, warn};

use crate::{
    Error, Result,
    browser::{BrowserLauncher, SystemBrowser},
    callback_server::CallbackListener,
    config::{FlowConfig, PluginOptions, load_settings},
    discovery, expiry,
    flow::{AttemptContext, token_record},
    pkce::FlowSecrets,
    storage::TokenCache,
    types::{CachedTokenRecord, FlowOutcome},
};

/// Timeout for discovery and token requests.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs the authorization-code flow and reports exactly one outcome per call.
pub struct Authenticator {
    http: reqwest::Client,
    browser: Arc<dyn BrowserLauncher>,
}

impl Authenticator {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client, using defaults");
                reqwest::Client::new()
            });
        Self {
            http,
            browser: Arc::new(SystemBrowser),
        }
    }

    #[must_use]
    pub fn with_browser(mut self, browser: Arc<dyn BrowserLauncher>) -> Self {
        self.browser = browser;
        self
    }

    #[must_use]
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Resolve configuration, then run [`Authenticator::run`].
    ///
    /// Configuration problems disable the flow instead of failing the host.
    pub async fn authenticate(&self, options: &PluginOptions) -> FlowOutcome {
        let settings = match &options.oidc {
            Some(settings) => settings.clone(),
            None => match load_settings(options.env_file.as_deref()) {
                Ok(settings) => settings,
                Err(e) => {
                    error!(error = %e, "failed to load OIDC configuration");
                    warn!("authentication disabled; set the OIDC_* variables in your .env file");
                    return FlowOutcome::Disabled(e.to_string());
                },
            },
        };

        let config = match FlowConfig::new(settings, options) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "invalid OIDC configuration, authentication disabled");
                return FlowOutcome::Disabled(e.to_string());
            },
        };

        info!(
            auto_browser = config.auto_open_browser,
            "OIDC authentication initialized"
        );
        self.run(&config).await
    }

    /// Serve a usable cached token, or run the full flow and cache its result.
    pub async fn run(&self, config: &FlowConfig) -> FlowOutcome {
        let cache = TokenCache::new(&config.cache_file);
        if let Some(record) = cache.load() {
            if expiry::is_usable(&record, config.expiry_buffer) {
                info!(path = %cache.path().display(), "using cached access token");
                return FlowOutcome::TokenObtained(record.access_token);
            }
            info!("cached access token expired, re-authenticating");
        }

        match self.authorize(config).await {
            Ok(record) => {
                if let Err(e) = cache.save(&record) {
                    warn!(error = %e, "failed to cache access token");
                }
                info!("access token obtained");
                FlowOutcome::TokenObtained(record.access_token)
            },
            Err(Error::Timeout(after)) => {
                warn!(timeout_secs = after.as_secs(), "authentication timed out");
                FlowOutcome::TimedOut
            },
            Err(e) => {
                error!(error = %e, "authentication failed");
                FlowOutcome::AuthenticationFailed(e.to_string())
            },
        }
    }

    async fn authorize(&self, config: &FlowConfig) -> Result<CachedTokenRecord> {
        let secrets = FlowSecrets::generate();
        let provider = discovery::resolve(
            &self.http,
            &config.discovery_url,
            &config.client_id,
            &config.client_secret,
        )
        .await?;

        let context = Arc::new(AttemptContext::new(
            self.http.clone(),
            provider,
            config.redirect_uri.clone(),
            config.scope.clone(),
            secrets,
        ));
        let url = context.authorization_url();

        let listener = CallbackListener::bind(&config.redirect_uri).await?;
        info!(addr = %listener.local_addr(), "waiting for the authorization callback");

        self.present(config, url.as_str());

        let tokens = listener.wait(context, config.server_timeout).await?;
        Ok(token_record(tokens, expiry::now_millis()))
    }

    fn present(&self, config: &FlowConfig, url: &str) {
        info!(url = %url, "authorization URL generated");
        if config.auto_open_browser {
            self.browser.open(url);
        } else {
            info!("open the URL above in your browser to authenticate");
        }
    }
}

impl Default for Authenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator").finish_non_exhaustive()
    }
}

/// Authenticate with the system browser and default HTTP settings.
pub async fn authenticate(options: &PluginOptions) -> FlowOutcome {
    Authenticator::new().authenticate(options).await
}
