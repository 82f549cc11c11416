use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use vmlet::FdClient;
use vmlet::runtime::layout::FilesystemLayout;
use vmlet::runtime::options::default_home_dir;

use crate::commands;

#[derive(Parser, Debug)]
#[command(
    name = "vmletctl",
    version,
    about = "Inspect and drive a running vmlet-netd descriptor server"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check that the descriptor server accepts connections
    Ping(commands::ping::PingArgs),

    /// Create the resources for a key
    Add(commands::add::AddArgs),

    /// Fetch the descriptors and info of a key
    Get(commands::get::GetArgs),

    /// Release the resources of one or more keys
    Release(commands::release::ReleaseArgs),

    /// Re-add the networks still recorded in the metadata database
    Recover(commands::recover::RecoverArgs),
}

/// Flags shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct GlobalFlags {
    /// vmlet home directory
    #[arg(long, global = true, env = "VMLET_HOME")]
    pub home: Option<PathBuf>,

    /// Descriptor server socket (default: <home>/sockets/netd.sock)
    #[arg(long, global = true)]
    pub socket: Option<PathBuf>,

    /// Verbose logging to stderr
    #[arg(long, global = true)]
    pub debug: bool,
}

impl GlobalFlags {
    pub fn layout(&self) -> FilesystemLayout {
        FilesystemLayout::new(self.home.clone().unwrap_or_else(default_home_dir))
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket
            .clone()
            .unwrap_or_else(|| self.layout().netd_socket_path())
    }

    pub fn client(&self) -> FdClient {
        FdClient::new(self.socket_path())
    }
}
