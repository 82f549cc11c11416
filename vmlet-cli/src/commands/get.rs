use anyhow::Context;
use clap::Args;

#[derive(Args, Debug)]
pub struct GetArgs {
    /// Key to look up
    pub key: String,
}

/// Prints the descriptor count, then the info blob.
///
/// The received descriptors are closed on exit; this is only a probe.
pub async fn execute(args: GetArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let (fds, info) = global
        .client()
        .get_fds(&args.key)
        .await
        .with_context(|| format!("get {:?}", args.key))?;

    println!("{}: {} fd(s)", args.key, fds.len());
    println!("{}", String::from_utf8_lossy(&info));
    Ok(())
}
