use std::time::Duration;

use anyhow::Context;
use clap::Args;

#[derive(Args, Debug)]
pub struct PingArgs {
    /// Connection attempts before giving up
    #[arg(long, default_value_t = 1)]
    pub retries: u32,

    /// Delay between attempts, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub delay_ms: u64,
}

pub async fn execute(args: PingArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let socket = global.socket_path();
    global
        .client()
        .wait_until_running(args.retries.max(1), Duration::from_millis(args.delay_ms))
        .await
        .with_context(|| format!("descriptor server at {} is not running", socket.display()))?;

    println!("{}: ok", socket.display());
    Ok(())
}
