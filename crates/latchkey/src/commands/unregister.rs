//! Unregister command - remove the custom scheme association.

use anyhow::Result;
use clap::Args;

use super::{Context, scheme_backend};

/// Arguments for the unregister command.
#[derive(Args, Debug)]
pub struct UnregisterArgs {}

/// Run the unregister command.
pub async fn run(_args: UnregisterArgs, ctx: &Context) -> Result<()> {
    let backend = scheme_backend(&ctx.config.scheme())?;
    let scheme = backend.registration().scheme_name.clone();

    backend.unregister()?;

    if ctx.json_output {
        println!("{}", serde_json::json!({ "scheme": scheme, "registered": false }));
    } else {
        println!("Removed '{}:' association", scheme);
    }
    Ok(())
}
