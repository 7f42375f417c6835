//! Scheme-handler entry point: relay a launch URI to the waiting login.
//!
//! The OS starts a fresh process for every `<scheme>:` URI it opens. That
//! process forwards the URI to the primary instance and exits.

use anyhow::{Result, bail};
use latchkey_oauth::SingletonOutcome;

use super::{Context, scheme_backend};

/// Run the callback relay.
pub async fn run(uri: String, ctx: &Context) -> Result<()> {
    let backend = scheme_backend(&ctx.config.scheme())?;

    match backend.acquire_singleton(std::env::args())? {
        SingletonOutcome::Secondary(launch_uri) => {
            let uri = launch_uri.unwrap_or(uri);
            backend.relay(&uri).await?;
            if ctx.verbose {
                eprintln!("Redirect handed to the waiting login");
            }
            Ok(())
        }
        SingletonOutcome::Primary(primary) => {
            // Dropping releases the lock and the relay endpoint.
            drop(primary);
            bail!(
                "No login is in progress to receive this redirect. Run 'latchkey login --backend scheme' first."
            )
        }
    }
}
