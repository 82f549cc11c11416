mod cli;
mod commands;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.global.debug);

    let result = match cli.command {
        Commands::Ping(args) => commands::ping::execute(args, &cli.global).await,
        Commands::Add(args) => commands::add::execute(args, &cli.global).await,
        Commands::Get(args) => commands::get::execute(args, &cli.global).await,
        Commands::Release(args) => commands::release::execute(args, &cli.global).await,
        Commands::Recover(args) => commands::recover::execute(args, &cli.global).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
