//! Login command - run one authorization flow and hand off the grant.

use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use clap::Args;
use latchkey_config::BackendKind;
use latchkey_oauth::{
    AuthorizationCoordinator, AuthorizationGrant, AuthorizationOutcome, BackendChoice,
    SingletonOutcome,
};

use super::{Context, authorize_config, loopback_config, scheme_backend};

/// Arguments for the login command.
#[derive(Args, Debug)]
pub struct LoginArgs {
    /// Capture backend (loopback or scheme)
    #[arg(long)]
    pub backend: Option<BackendKind>,

    /// Seconds to wait for the redirect (at most one day)
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Print the URL without opening a browser
    #[arg(long)]
    pub no_browser: bool,

    /// OAuth client identifier
    #[arg(long)]
    pub client_id: Option<String>,

    /// Authorization endpoint URL
    #[arg(long, value_name = "URL")]
    pub authorize_endpoint: Option<String>,

    /// Requested scope
    #[arg(long)]
    pub scope: Option<String>,
}

/// Run the login command.
pub async fn run(args: LoginArgs, ctx: &Context) -> Result<()> {
    let mut client = ctx.config.client.clone().unwrap_or_default();
    if args.client_id.is_some() {
        client.client_id = args.client_id;
    }
    if args.authorize_endpoint.is_some() {
        client.authorize_endpoint = args.authorize_endpoint;
    }
    if args.scope.is_some() {
        client.scope = args.scope;
    }
    let mut config = ctx.config.clone();
    config.client = Some(client);
    let client = config.require_client()?;

    let mut flow = config.flow();
    if let Some(secs) = args.timeout {
        flow.timeout_secs = secs;
    }
    let backend = args.backend.unwrap_or(flow.backend);
    let timeout = flow.timeout()?;

    let choice = match backend {
        BackendKind::Loopback => BackendChoice::Loopback(loopback_config(&config.loopback())),
        BackendKind::Scheme => {
            let backend = Arc::new(scheme_backend(&config.scheme())?);
            match backend.acquire_singleton(std::iter::empty::<&str>())? {
                SingletonOutcome::Primary(primary) => BackendChoice::Scheme { backend, primary },
                SingletonOutcome::Secondary(_) => {
                    bail!("Another latchkey login is already waiting for a redirect")
                }
            }
        }
    };

    let mut coordinator = AuthorizationCoordinator::new(authorize_config(&client));
    let url = coordinator.begin(choice, timeout).await?;

    if ctx.json_output {
        eprintln!("{}", url);
    } else {
        println!("Open this URL in your browser:");
        println!();
        println!("  {}", url);
        println!();
        println!("Waiting up to {}s for the redirect...", timeout.as_secs());
    }

    if !args.no_browser && open_url(&url).is_err() {
        eprintln!("(Could not open browser automatically)");
    }

    let interrupt = coordinator.cancel_handle().map(|cancel| {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    });

    let outcome = coordinator.result().await;
    if let Some(handle) = interrupt {
        handle.abort();
    }

    match outcome? {
        AuthorizationOutcome::Validated(grant) => print_grant(&grant, ctx),
        AuthorizationOutcome::Failed(reason) => Err(anyhow!("Authorization failed: {}", reason)),
        AuthorizationOutcome::TimedOut => Err(anyhow!(
            "Authorization timed out after {}s without a redirect",
            timeout.as_secs()
        )),
        AuthorizationOutcome::Cancelled => Err(anyhow!("Authorization cancelled")),
    }
}

fn print_grant(grant: &AuthorizationGrant, ctx: &Context) -> Result<()> {
    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(grant)?);
    } else {
        println!();
        println!("Authorization successful. Exchange these at the token endpoint:");
        println!();
        println!("  code:          {}", grant.code);
        println!("  code_verifier: {}", grant.verifier);
        println!("  redirect_uri:  {}", grant.redirect_uri);
    }
    Ok(())
}

/// Try to open a URL in the default browser.
fn open_url(url: &str) -> std::io::Result<()> {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg(url).spawn()?;
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        std::process::Command::new("xdg-open").arg(url).spawn()?;
    }
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("rundll32")
            .args(["url.dll,FileProtocolHandler", url])
            .spawn()?;
    }
    Ok(())
}
