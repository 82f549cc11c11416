use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use vmlet::SqliteMetadataStore;
use vmlet::runtime::recover_networks;

#[derive(Args, Debug)]
pub struct RecoverArgs {
    /// Metadata database (default: <home>/db/vmlet.db)
    #[arg(long)]
    pub db: Option<PathBuf>,
}

pub async fn execute(args: RecoverArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let db_path = args.db.unwrap_or_else(|| global.layout().db_path());
    if !db_path.exists() {
        anyhow::bail!("no metadata database at {}", db_path.display());
    }
    let store = SqliteMetadataStore::open(&db_path)
        .with_context(|| format!("can't open {}", db_path.display()))?;

    let report = recover_networks(&store, &global.client()).await?;
    for id in &report.recovered {
        println!("{}", id);
    }

    if !report.errors.is_empty() {
        let errors: Vec<String> = report
            .errors
            .iter()
            .map(|(id, e)| format!("{}: {}", id, e))
            .collect();
        anyhow::bail!(
            "Failed to recover {} of {} sandbox(es)\nErrors:\n  {}",
            errors.len(),
            errors.len() + report.recovered.len(),
            errors.join("\n  ")
        );
    }
    Ok(())
}
