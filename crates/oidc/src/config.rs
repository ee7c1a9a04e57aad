//! OIDC client settings and per-flow configuration.
//!
//! Settings come from `OIDC_*` variables. The process environment is read but
//! never modified: `.env` files are parsed into a private map layered over it.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use {
    secrecy::Secret,
    tracing::{debug, info},
    url::Url,
};

use crate::{
    Error, Result, callback_server::DEFAULT_CALLBACK_TIMEOUT, expiry::DEFAULT_EXPIRY_BUFFER,
    storage::DEFAULT_CACHE_FILE,
};

pub const ENV_DISCOVERY_URL: &str = "OIDC_DISCOVERY_URL";
pub const ENV_CLIENT_ID: &str = "OIDC_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "OIDC_CLIENT_SECRET";
pub const ENV_REDIRECT_URI: &str = "OIDC_REDIRECT_URI";
pub const ENV_SCOPE: &str = "OIDC_SCOPE";

/// Credentials and endpoints of the OIDC client.
#[derive(Debug, Clone)]
pub struct OidcSettings {
    pub discovery_url: String,
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub redirect_uri: String,
    pub scope: String,
}

/// Options of the embedding layer.
#[derive(Debug, Clone)]
pub struct PluginOptions {
    /// Explicit settings; loaded from the environment when `None`.
    pub oidc: Option<OidcSettings>,
    pub open_browser: bool,
    /// Single env file to read instead of `.env` + `.env.local`.
    pub env_file: Option<PathBuf>,
    pub cache_file: PathBuf,
    pub server_timeout: Duration,
    pub expiry_buffer: Duration,
}

impl Default for PluginOptions {
    fn default() -> Self {
        Self {
            oidc: None,
            open_browser: true,
            env_file: None,
            cache_file: PathBuf::from(DEFAULT_CACHE_FILE),
            server_timeout: DEFAULT_CALLBACK_TIMEOUT,
            expiry_buffer: DEFAULT_EXPIRY_BUFFER,
        }
    }
}

/// Validated, immutable configuration of one flow.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    pub discovery_url: Url,
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub redirect_uri: Url,
    pub scope: String,
    pub cache_file: PathBuf,
    pub server_timeout: Duration,
    pub expiry_buffer: Duration,
    pub auto_open_browser: bool,
}

impl FlowConfig {
    pub fn new(settings: OidcSettings, options: &PluginOptions) -> Result<Self> {
        let discovery_url = Url::parse(settings.discovery_url.trim()).map_err(|e| {
            Error::configuration(format!(
                "discovery URL {:?} is not an absolute URL: {e}",
                settings.discovery_url
            ))
        })?;
        if !matches!(discovery_url.scheme(), "http" | "https") {
            return Err(Error::configuration(format!(
                "discovery URL must use http or https, got {}",
                discovery_url.scheme()
            )));
        }

        let redirect_uri = Url::parse(settings.redirect_uri.trim()).map_err(|e| {
            Error::configuration(format!(
                "redirect URI {:?} is invalid: {e}",
                settings.redirect_uri
            ))
        })?;
        if redirect_uri.host_str().is_none() {
            return Err(Error::configuration(format!(
                "redirect URI {redirect_uri} has no host"
            )));
        }
        if redirect_uri.port_or_known_default().is_none() {
            return Err(Error::configuration(format!(
                "redirect URI {redirect_uri} has no port"
            )));
        }

        if settings.client_id.trim().is_empty() {
            return Err(Error::configuration("client id is empty"));
        }

        Ok(Self {
            discovery_url,
            client_id: settings.client_id,
            client_secret: settings.client_secret,
            redirect_uri,
            scope: settings.scope,
            cache_file: options.cache_file.clone(),
            server_timeout: options.server_timeout,
            expiry_buffer: options.expiry_buffer,
            auto_open_browser: options.open_browser,
        })
    }
}

/// Load settings from the process environment and env files.
///
/// With `env_file`, that file only fills in variables the process lacks.
/// Without it, `.env` fills in missing variables and `.env.local` overrides
/// everything.
pub fn load_settings(env_file: Option<&Path>) -> Result<OidcSettings> {
    let vars = collect_env(Path::new("."), env_file, std::env::vars().collect())?;
    let settings = settings_from_vars(&vars)?;
    info!(
        discovery_url = %settings.discovery_url,
        client_id = %settings.client_id,
        redirect_uri = %settings.redirect_uri,
        "OIDC configuration loaded"
    );
    Ok(settings)
}

/// Layer env files over `base` without touching the process environment.
///
/// `.env` and `.env.local` are looked up in `dir`; an explicit `env_file` is
/// used as given.
pub fn collect_env(
    dir: &Path,
    env_file: Option<&Path>,
    mut base: HashMap<String, String>,
) -> Result<HashMap<String, String>> {
    match env_file {
        Some(path) => {
            let file = read_env_file(path)?.ok_or_else(|| {
                Error::configuration(format!("env file {} not found", path.display()))
            })?;
            for (key, value) in file {
                base.entry(key).or_insert(value);
            }
        },
        None => {
            if let Some(file) = read_env_file(&dir.join(".env"))? {
                for (key, value) in file {
                    base.entry(key).or_insert(value);
                }
            }
            if let Some(file) = read_env_file(&dir.join(".env.local"))? {
                base.extend(file);
            }
        },
    }
    Ok(base)
}

fn read_env_file(path: &Path) -> Result<Option<Vec<(String, String)>>> {
    let iter = match dotenvy::from_path_iter(path) {
        Ok(iter) => iter,
        Err(e) if e.not_found() => {
            debug!(path = %path.display(), "env file not present");
            return Ok(None);
        },
        Err(e) => {
            return Err(Error::configuration(format!(
                "failed to read {}: {e}",
                path.display()
            )));
        },
    };
    let pairs = iter
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::configuration(format!("failed to parse {}: {e}", path.display())))?;
    debug!(path = %path.display(), vars = pairs.len(), "env file read");
    Ok(Some(pairs))
}

/// Build settings from a variable map. Every `OIDC_*` variable is required.
pub fn settings_from_vars(vars: &HashMap<String, String>) -> Result<OidcSettings> {
    let get = |key: &str| -> Result<String> {
        vars.get(key)
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .ok_or_else(|| {
                Error::configuration(format!(
                    "environment variable {key} is not set; add it to your .env file"
                ))
            })
    };

    Ok(OidcSettings {
        discovery_url: get(ENV_DISCOVERY_URL)?,
        client_id: get(ENV_CLIENT_ID)?,
        client_secret: Secret::new(get(ENV_CLIENT_SECRET)?),
        redirect_uri: get(ENV_REDIRECT_URI)?,
        scope: get(ENV_SCOPE)?,
    })
}
