//! How an obtained token reaches the dev server.

use std::{collections::BTreeMap, ffi::OsString, process::ExitCode};

use {
    anyhow::{Context, Result, bail},
    tracing::{debug, info},
};

/// Environment variable the child process receives.
pub const TOKEN_ENV_VAR: &str = "VITE_API_TOKEN";

/// Compile-time replacement key for bundlers.
pub const DEFINE_KEY: &str = "import.meta.env.VITE_API_TOKEN";

/// The define value: the token as a JSON string literal, or `null`.
#[must_use]
pub fn define_literal(token: Option<&str>) -> String {
    match token {
        Some(token) => serde_json::Value::from(token).to_string(),
        None => "null".to_string(),
    }
}

/// Build-time replacement table with a single entry.
#[must_use]
pub fn define_table(token: Option<&str>) -> BTreeMap<&'static str, String> {
    BTreeMap::from([(DEFINE_KEY, define_literal(token))])
}

/// Environment additions for the child. Empty when there is no token.
#[must_use]
pub fn child_env(token: Option<&str>) -> Vec<(&'static str, String)> {
    token
        .map(|token| vec![(TOKEN_ENV_VAR, token.to_string())])
        .unwrap_or_default()
}

/// Spawn `command` with the token in its environment and wait for it.
///
/// Returns the child's exit code; a child killed by a signal maps to 1.
pub async fn run_child(command: &[OsString], token: Option<&str>) -> Result<ExitCode> {
    let Some((program, args)) = command.split_first() else {
        bail!("no command given; usage: devauth run -- <command> [args...]");
    };

    let mut child = tokio::process::Command::new(program);
    child.args(args).envs(child_env(token));
    if token.is_none() {
        child.env_remove(TOKEN_ENV_VAR);
    }

    info!(
        program = %program.to_string_lossy(),
        token_injected = token.is_some(),
        "starting dev server"
    );
    let status = child
        .status()
        .await
        .with_context(|| format!("failed to run {}", program.to_string_lossy()))?;
    debug!(status = %status, "dev server exited");

    let code = status
        .code()
        .and_then(|code| u8::try_from(code).ok())
        .unwrap_or(1);
    Ok(ExitCode::from(code))
}
