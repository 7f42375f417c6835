//! Status command - shows resolved configuration and scheme registration.

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use super::{Context, scheme_backend};

/// Arguments for the status command.
#[derive(Args, Debug)]
pub struct StatusArgs {}

/// Status for JSON output.
#[derive(Debug, Serialize)]
struct StatusOutput {
    config_sources: Vec<String>,
    client_id: Option<String>,
    authorize_endpoint: Option<String>,
    backend: String,
    timeout_secs: u64,
    loopback_callback_path: String,
    scheme_redirect_uri: String,
    /// `None` when the check itself failed.
    scheme_registered: Option<bool>,
}

/// Run the status command.
pub async fn run(_args: StatusArgs, ctx: &Context) -> Result<()> {
    let config = &ctx.config;
    let client = config.client.clone().unwrap_or_default();
    let flow = config.flow();
    let backend = scheme_backend(&config.scheme())?;

    let scheme_registered = match backend.is_registered() {
        Ok(registered) => Some(registered),
        Err(e) => {
            tracing::debug!(error = %e, "Could not check scheme registration");
            None
        }
    };

    let output = StatusOutput {
        config_sources: ctx
            .sources
            .iter()
            .map(|p| p.display().to_string())
            .collect(),
        client_id: client.client_id,
        authorize_endpoint: client.authorize_endpoint,
        backend: flow.backend.to_string(),
        timeout_secs: flow.timeout_secs,
        loopback_callback_path: config.loopback().callback_path,
        scheme_redirect_uri: backend.redirect_uri(),
        scheme_registered,
    };

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Latchkey Status");
    println!("---------------");
    if output.config_sources.is_empty() {
        println!("Config:       (defaults only)");
    } else {
        for source in &output.config_sources {
            println!("Config:       {}", source);
        }
    }
    println!(
        "Client ID:    {}",
        output.client_id.as_deref().unwrap_or("not set")
    );
    println!(
        "Endpoint:     {}",
        output.authorize_endpoint.as_deref().unwrap_or("not set")
    );
    println!("Backend:      {}", output.backend);
    println!("Timeout:      {}s", output.timeout_secs);
    println!("Scheme URI:   {}", output.scheme_redirect_uri);
    match output.scheme_registered {
        Some(true) => println!("Registered:   yes"),
        Some(false) => {
            println!("Registered:   no");
            println!("  Run 'latchkey register' to install the scheme handler");
        }
        None => println!("Registered:   unknown"),
    }

    Ok(())
}
