use std::path::{Path, PathBuf};

use vmlet_shared::errors::{VmletError, VmletResult};

/// Directory structure constants
pub mod dirs {
    /// Base directory name for vmlet data
    pub const VMLET_DIR: &str = ".vmlet";

    pub const DB_DIR: &str = "db";

    /// Subdirectory for log files
    pub const LOGS_DIR: &str = "logs";

    /// Subdirectory for Unix domain sockets
    pub const SOCKETS_DIR: &str = "sockets";
}

/// File naming
pub mod filenames {
    pub const DB_FILE: &str = "vmlet.db";

    pub const NETD_SOCKET: &str = "netd.sock";
}

// ============================================================================
// FILESYSTEM LAYOUT (home directory)
// ============================================================================

#[derive(Clone, Debug)]
pub struct FilesystemLayout {
    home_dir: PathBuf,
}

impl FilesystemLayout {
    pub fn new(home_dir: PathBuf) -> Self {
        Self { home_dir }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn db_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::DB_DIR)
    }

    /// Metadata database: ~/.vmlet/db/vmlet.db
    pub fn db_path(&self) -> PathBuf {
        self.db_dir().join(filenames::DB_FILE)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::LOGS_DIR)
    }

    pub fn sockets_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::SOCKETS_DIR)
    }

    /// Descriptor server socket: ~/.vmlet/sockets/netd.sock
    pub fn netd_socket_path(&self) -> PathBuf {
        self.sockets_dir().join(filenames::NETD_SOCKET)
    }

    /// Create every directory of the layout.
    pub fn prepare(&self) -> VmletResult<()> {
        for dir in [self.db_dir(), self.logs_dir(), self.sockets_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                VmletError::Storage(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = FilesystemLayout::new(PathBuf::from("/var/lib/vmlet"));
        assert_eq!(layout.db_path(), PathBuf::from("/var/lib/vmlet/db/vmlet.db"));
        assert_eq!(
            layout.netd_socket_path(),
            PathBuf::from("/var/lib/vmlet/sockets/netd.sock")
        );
        assert_eq!(layout.logs_dir(), PathBuf::from("/var/lib/vmlet/logs"));
    }

    #[test]
    fn test_prepare_creates_dirs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let layout = FilesystemLayout::new(tmp.path().join("home"));
        layout.prepare().unwrap();
        assert!(layout.db_dir().is_dir());
        assert!(layout.logs_dir().is_dir());
        assert!(layout.sockets_dir().is_dir());
    }
}
