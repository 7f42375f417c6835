//! Latchkey - capture OAuth 2.0 PKCE redirects for native apps
//!
//! Main entry point for the latchkey CLI.

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;

mod commands;

use commands::{callback, login, register, status, unregister};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Latchkey - capture OAuth 2.0 PKCE redirects for native apps
#[derive(Parser)]
#[command(name = "latchkey")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Redirect URI handed over by the OS scheme handler
    #[arg(long = "oauth-callback", value_name = "URI", hide = true)]
    pub oauth_callback: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an authorization flow and print the code and verifier
    Login(login::LoginArgs),

    /// Register this executable as the custom scheme handler
    Register(register::RegisterArgs),

    /// Remove the custom scheme association
    Unregister(unregister::UnregisterArgs),

    /// Show resolved configuration and scheme registration
    Status(status::StatusArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _guard = init_tracing(cli.verbose);

    let loaded = latchkey_config::load_config(None)?;
    for warning in &loaded.warnings {
        tracing::warn!("{}", warning);
    }

    let ctx = commands::Context {
        config: loaded.config.clone(),
        sources: loaded
            .loaded_from()
            .into_iter()
            .map(|p| p.to_path_buf())
            .collect(),
        json_output: cli.json,
        verbose: cli.verbose,
    };

    if let Some(uri) = cli.oauth_callback {
        return callback::run(uri, &ctx).await;
    }

    match cli.command {
        Some(Commands::Login(args)) => login::run(args, &ctx).await,
        Some(Commands::Register(args)) => register::run(args, &ctx).await,
        Some(Commands::Unregister(args)) => unregister::run(args, &ctx).await,
        Some(Commands::Status(args)) => status::run(args, &ctx).await,
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    }
}

/// Console (human-readable, stderr) + rotating JSON file.
///
/// Stdout is reserved for command output.
fn init_tracing(verbose: bool) -> Option<WorkerGuard> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    let filter = if verbose {
        "latchkey=debug,latchkey_oauth=debug,latchkey_config=debug,info"
    } else {
        "latchkey=info,latchkey_oauth=info,warn"
    };

    let log_dir = latchkey_config::xdg_config_dir()
        .map(|d| d.join("logs"))
        .unwrap_or_else(|| std::path::PathBuf::from("logs"));
    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("latchkey")
        .filename_suffix("log")
        .build(&log_dir)
        .ok();
    let (file_layer, guard) = match file_appender {
        Some(appender) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new(
                    "latchkey=trace,latchkey_oauth=trace,latchkey_config=trace,info",
                ));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
                ),
        )
        .with(file_layer)
        .init();

    guard
}
