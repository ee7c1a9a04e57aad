mod auth_commands;
mod inject;

use std::{ffi::OsString, path::PathBuf, process::ExitCode, time::Duration};

use {
    clap::{Parser, Subcommand},
    devauth_oidc::{DEFAULT_CACHE_FILE, PluginOptions},
    tracing::debug,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(
    name = "devauth",
    about = "OIDC login for local development servers",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Read OIDC_* settings from this file instead of .env and .env.local.
    #[arg(long, global = true, env = "DEVAUTH_ENV_FILE")]
    env_file: Option<PathBuf>,

    /// Where the access token is cached between runs.
    #[arg(long, global = true, env = "DEVAUTH_CACHE_FILE", default_value = DEFAULT_CACHE_FILE)]
    cache_file: PathBuf,

    /// Only log the authorization URL; do not open a browser.
    #[arg(long, global = true, env = "DEVAUTH_NO_BROWSER", default_value_t = false)]
    no_browser: bool,

    /// Seconds to wait for the authorization callback.
    #[arg(long, global = true, env = "DEVAUTH_TIMEOUT", default_value_t = 30)]
    timeout: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Obtain a token and report the outcome (default).
    Login,
    /// Print the access token on stdout.
    Token,
    /// Print the build-time define table as JSON.
    Defines,
    /// Start a command with VITE_API_TOKEN in its environment.
    Run {
        /// The dev server command, e.g. `devauth run -- npm run dev`.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<OsString>,
    },
    /// Show whether the cache holds a usable token.
    Status,
    /// Delete the cached token.
    Logout,
}

impl Cli {
    fn plugin_options(&self) -> PluginOptions {
        PluginOptions {
            open_browser: !self.no_browser,
            env_file: self.env_file.clone(),
            cache_file: self.cache_file.clone(),
            server_timeout: Duration::from_secs(self.timeout),
            ..PluginOptions::default()
        }
    }
}

/// Logs go to stderr; stdout carries the token and define table.
fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_telemetry(&cli);

    debug!(version = env!("CARGO_PKG_VERSION"), "devauth starting");

    let options = cli.plugin_options();
    match cli.command {
        None | Some(Commands::Login) => auth_commands::login(&options).await,
        Some(Commands::Token) => auth_commands::token(&options).await,
        Some(Commands::Defines) => auth_commands::defines(&options).await,
        Some(Commands::Run { command }) => auth_commands::run(&options, &command).await,
        Some(Commands::Status) => auth_commands::status(&options),
        Some(Commands::Logout) => auth_commands::logout(&options),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_map_to_plugin_options() {
        let cli = Cli::try_parse_from(["devauth"]).unwrap();
        let options = cli.plugin_options();
        assert!(cli.command.is_none());
        assert!(options.open_browser);
        assert_eq!(options.cache_file, PathBuf::from(".oidc-cache"));
        assert_eq!(options.server_timeout, Duration::from_secs(30));
        assert!(options.oidc.is_none());
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "devauth",
            "token",
            "--no-browser",
            "--timeout",
            "5",
            "--cache-file",
            "/tmp/tok",
            "--env-file",
            "dev.env",
        ])
        .unwrap();
        let options = cli.plugin_options();
        assert!(matches!(cli.command, Some(Commands::Token)));
        assert!(!options.open_browser);
        assert_eq!(options.server_timeout, Duration::from_secs(5));
        assert_eq!(options.cache_file, PathBuf::from("/tmp/tok"));
        assert_eq!(options.env_file, Some(PathBuf::from("dev.env")));
    }

    #[test]
    fn run_keeps_child_arguments_verbatim() {
        let cli = Cli::try_parse_from(["devauth", "run", "--", "vite", "--port", "5173"]).unwrap();
        match cli.command {
            Some(Commands::Run { command }) => {
                assert_eq!(command, vec!["vite", "--port", "5173"]);
            },
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn run_requires_a_command() {
        assert!(Cli::try_parse_from(["devauth", "run"]).is_err());
    }
}
