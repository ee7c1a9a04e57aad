use std::{ffi::OsString, process::ExitCode, time::Duration};

use {
    anyhow::Result,
    devauth_oidc::{Authenticator, FlowOutcome, PluginOptions, TokenCache, expiry},
};

use crate::inject;

async fn obtain(options: &PluginOptions) -> FlowOutcome {
    Authenticator::new().authenticate(options).await
}

pub async fn login(options: &PluginOptions) -> Result<ExitCode> {
    let outcome = obtain(options).await;
    eprintln!("{outcome}");
    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Print only the token so the output can be captured by scripts.
pub async fn token(options: &PluginOptions) -> Result<ExitCode> {
    match obtain(options).await.access_token() {
        Some(token) => {
            println!("{token}");
            Ok(ExitCode::SUCCESS)
        },
        None => Ok(ExitCode::FAILURE),
    }
}

pub async fn defines(options: &PluginOptions) -> Result<ExitCode> {
    let outcome = obtain(options).await;
    let table = inject::define_table(outcome.access_token());
    println!("{}", serde_json::to_string_pretty(&table)?);
    Ok(ExitCode::SUCCESS)
}

/// Authenticate, then start the dev server. A missing token never blocks it.
pub async fn run(options: &PluginOptions, command: &[OsString]) -> Result<ExitCode> {
    let outcome = obtain(options).await;
    if !outcome.is_success() {
        eprintln!("{outcome}; starting without {}", inject::TOKEN_ENV_VAR);
    }
    inject::run_child(command, outcome.access_token()).await
}

pub fn status(options: &PluginOptions) -> Result<ExitCode> {
    let cache = TokenCache::new(&options.cache_file);
    let Some(record) = cache.load() else {
        println!("No cached token at {}", cache.path().display());
        return Ok(ExitCode::FAILURE);
    };

    let remaining = expiry::remaining(&record, options.expiry_buffer, expiry::now_millis());
    println!("{} [{}]", cache.path().display(), describe_remaining(remaining));
    Ok(if remaining.is_some() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

pub fn logout(options: &PluginOptions) -> Result<ExitCode> {
    let cache = TokenCache::new(&options.cache_file);
    cache.clear()?;
    println!("Removed cached token at {}", cache.path().display());
    Ok(ExitCode::SUCCESS)
}

fn describe_remaining(remaining: Option<Duration>) -> String {
    match remaining {
        Some(left) => {
            let secs = left.as_secs();
            let hours = secs / 3600;
            let mins = (secs % 3600) / 60;
            format!("valid ({hours}h {mins}m remaining)")
        },
        None => "expired".to_string(),
    }
}
