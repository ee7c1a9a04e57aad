//! Local OIDC authorization-code flow with PKCE for development servers.
//!
//! [`Authenticator::authenticate`] returns a cached access token when one is
//! still usable; otherwise it discovers the provider, binds a one-shot
//! callback listener on the redirect URI, sends the user to the provider and
//! exchanges the returned code. The token is handed back as data; where it
//! ends up is the caller's business.

pub mod authenticator;
pub mod browser;
pub mod callback_server;
pub mod config;
pub mod discovery;
pub mod error;
pub mod expiry;
pub mod flow;
pub mod pkce;
pub mod storage;
pub mod templates;
pub mod types;

pub use {
    authenticator::{Authenticator, authenticate},
    browser::{BrowserLauncher, SystemBrowser},
    callback_server::{CallbackListener, DEFAULT_CALLBACK_TIMEOUT},
    config::{FlowConfig, OidcSettings, PluginOptions, load_settings},
    discovery::{ResolvedProviderConfig, issuer_from_discovery_url},
    expiry::{DEFAULT_EXPIRY_BUFFER, is_usable},
    flow::{AttemptContext, CodeExchanger},
    pkce::FlowSecrets,
    storage::{DEFAULT_CACHE_FILE, TokenCache},
    types::{CachedTokenRecord, FlowOutcome, TokenResponse},
};

pub use error::{Error, Result};
