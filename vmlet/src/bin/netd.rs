//! Privileged descriptor server.
//!
//! Owns pod network namespaces, taps and DHCP responders, and hands tap
//! descriptors to clients over a Unix socket. Runs until SIGINT or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use vmlet::fdserver::FdServer;
use vmlet::net::{CniClient, ExecCniClient, TapFdSource};
use vmlet::runtime::NetdOptions;
use vmlet::util;
use vmlet_shared::errors::{VmletError, VmletResult};

/// vmlet network daemon - creates and owns pod network resources
#[derive(Parser, Debug)]
#[command(author, version, about = "vmlet network daemon")]
struct NetdArgs {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Socket to listen on (overrides the config file)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Hand SR-IOV virtual functions to VMs through vfio
    #[arg(long)]
    sriov: bool,

    /// Log to stderr instead of the rotating log file
    #[arg(long)]
    foreground: bool,
}

fn load_options(args: &NetdArgs) -> VmletResult<NetdOptions> {
    let mut options = match &args.config {
        Some(path) => NetdOptions::from_file(path)?,
        None => NetdOptions::default(),
    };
    if let Some(socket) = &args.socket {
        options.socket_path = socket.clone();
    }
    options.sriov_enabled |= args.sriov;
    Ok(options)
}

async fn wait_for_shutdown() -> VmletResult<()> {
    let mut term = signal(SignalKind::terminate())
        .map_err(|e| VmletError::Internal(format!("can't install SIGTERM handler: {}", e)))?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
        _ = term.recv() => tracing::info!("Received SIGTERM"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> VmletResult<()> {
    let args = NetdArgs::parse();
    let options = load_options(&args)?;

    let _guard = if args.foreground {
        tracing_subscriber::fmt()
            .with_env_filter(util::env_filter()?)
            .with_writer(std::io::stderr)
            .init();
        None
    } else {
        Some(util::init_logging(&options.log_dir, "vmlet-netd.log")?)
    };

    tracing::info!(
        socket = %options.socket_path.display(),
        netns_dir = %options.netns_dir.display(),
        sriov = options.sriov_enabled,
        calico_subnet = options.calico_subnet,
        "vmlet-netd starting"
    );

    let cni: Arc<dyn CniClient> = Arc::new(ExecCniClient::new(
        &options.cni_plugins_dir,
        &options.cni_configs_dir,
        &options.netns_dir,
    )?);
    let source = Arc::new(TapFdSource::new(cni, options.tap_source_options()));
    let server = FdServer::new(&options.socket_path, source);

    server.serve().await?;
    let outcome = wait_for_shutdown().await;

    if let Err(e) = server.stop().await {
        tracing::error!(error = %e, "Error stopping fd server");
    }
    tracing::info!("vmlet-netd exited");
    outcome
}
