//! Register command - associate the custom scheme with this executable.

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use super::{Context, scheme_backend};

/// Arguments for the register command.
#[derive(Args, Debug)]
pub struct RegisterArgs {
    /// Rewrite the association even if it already points here
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
struct RegisterOutput {
    scheme: String,
    executable: String,
    /// False when an existing association was left as is.
    changed: bool,
}

/// Run the register command.
pub async fn run(args: RegisterArgs, ctx: &Context) -> Result<()> {
    let backend = scheme_backend(&ctx.config.scheme())?;

    let changed = if args.force {
        backend.register()?;
        true
    } else {
        backend.ensure_registered()?
    };

    let registration = backend.registration();
    let output = RegisterOutput {
        scheme: registration.scheme_name.clone(),
        executable: registration.executable_path.display().to_string(),
        changed,
    };

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if changed {
        println!("Registered '{}:' -> {}", output.scheme, output.executable);
    } else {
        println!("'{}:' is already registered to {}", output.scheme, output.executable);
    }

    Ok(())
}
