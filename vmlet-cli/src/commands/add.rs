use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Key to create resources for (a pod UID for vmlet-netd)
    pub key: String,

    /// JSON payload passed to the resource source
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,

    /// Read the JSON payload from a file
    #[arg(long)]
    pub file: Option<PathBuf>,
}

pub async fn execute(args: AddArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let raw = match (&args.data, &args.file) {
        (Some(data), _) => data.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("can't read {}", path.display()))?,
        (None, None) => anyhow::bail!("either --data or --file is required"),
    };
    let payload: serde_json::Value =
        serde_json::from_str(&raw).context("payload is not valid JSON")?;

    let response = global
        .client()
        .add_fds(&args.key, &payload)
        .await
        .with_context(|| format!("add {:?}", args.key))?;

    println!("{}", String::from_utf8_lossy(&response));
    Ok(())
}
