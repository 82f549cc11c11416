//! Descriptor server.
//!
//! Accepts connections on a Unix socket and serves Add/Release/Get requests,
//! keeping the registered descriptor sets in memory and delegating resource
//! work to an [`FdSource`].

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vmlet_shared::constants::protocol::{HEADER_SIZE, MAX_FDS, MAX_PAYLOAD};
use vmlet_shared::errors::{VmletError, VmletResult};
use vmlet_shared::wire::{FdCommand, FdHeader};

use super::passfd;
use super::source::FdSource;

const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

// ============================================================================
// Registered descriptor sets
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Source is creating resources; invisible to Get/Release.
    Creating,
    Ready,
    /// Source is tearing resources down; invisible to Get.
    Releasing,
}

struct Slot {
    state: SlotState,
    fds: Vec<OwnedFd>,
}

/// Key to descriptor-set map shared by all connection tasks.
#[derive(Default)]
struct FdTable {
    slots: Mutex<HashMap<String, Slot>>,
}

impl FdTable {
    fn reserve(&self, key: &str) -> VmletResult<()> {
        let mut slots = self.slots.lock();
        if slots.contains_key(key) {
            return Err(VmletError::AlreadyExists(format!(
                "fd key already exists: {:?}",
                key
            )));
        }
        slots.insert(
            key.to_string(),
            Slot {
                state: SlotState::Creating,
                fds: Vec::new(),
            },
        );
        Ok(())
    }

    fn fill(&self, key: &str, fds: Vec<OwnedFd>) {
        if let Some(slot) = self.slots.lock().get_mut(key) {
            slot.state = SlotState::Ready;
            slot.fds = fds;
        }
    }

    fn forget(&self, key: &str) {
        self.slots.lock().remove(key);
    }

    fn begin_release(&self, key: &str) -> VmletResult<()> {
        let mut slots = self.slots.lock();
        match slots.get_mut(key) {
            Some(slot) if slot.state == SlotState::Ready => {
                slot.state = SlotState::Releasing;
                Ok(())
            }
            Some(_) => Err(VmletError::InvalidState(format!(
                "fd key {:?} is busy",
                key
            ))),
            None => Err(bad_key(key)),
        }
    }

    fn abort_release(&self, key: &str) {
        if let Some(slot) = self.slots.lock().get_mut(key) {
            slot.state = SlotState::Ready;
        }
    }

    /// Duplicate the descriptors of a ready slot.
    fn dup(&self, key: &str) -> VmletResult<Vec<OwnedFd>> {
        let slots = self.slots.lock();
        match slots.get(key) {
            Some(slot) if slot.state == SlotState::Ready => slot
                .fds
                .iter()
                .map(|fd| fd.try_clone())
                .collect::<io::Result<Vec<_>>>()
                .map_err(|e| VmletError::Internal(format!("can't duplicate fds: {}", e))),
            _ => Err(bad_key(key)),
        }
    }

    fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

fn bad_key(key: &str) -> VmletError {
    VmletError::NotFound(format!("bad fd key: {:?}", key))
}

struct Reply {
    data: Vec<u8>,
    fds: Vec<OwnedFd>,
}

struct ServerInner {
    source: Arc<dyn FdSource>,
    table: FdTable,
}

struct Running {
    cancel: CancellationToken,
    done: mpsc::Receiver<()>,
}

// ============================================================================
// Server
// ============================================================================

/// Serves descriptor requests on a Unix socket.
///
/// # Example
///
/// ```no_run
/// # use std::sync::Arc;
/// # use vmlet::fdserver::{FdServer, FdSource};
/// # async fn demo(source: Arc<dyn FdSource>) -> vmlet_shared::VmletResult<()> {
/// let server = FdServer::new("/run/vmlet/netd.sock", source);
/// server.serve().await?;
/// // ...
/// server.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct FdServer {
    socket_path: PathBuf,
    inner: Arc<ServerInner>,
    running: Mutex<Option<Running>>,
}

impl FdServer {
    pub fn new(socket_path: impl Into<PathBuf>, source: Arc<dyn FdSource>) -> Self {
        Self {
            socket_path: socket_path.into(),
            inner: Arc::new(ServerInner {
                source,
                table: FdTable::default(),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of keys currently known to the server, including keys that are
    /// being created or released.
    pub fn key_count(&self) -> usize {
        self.inner.table.len()
    }

    /// Bind the socket and start accepting connections in the background.
    ///
    /// A stale socket file left by a previous process is removed first.
    ///
    /// # Errors
    /// `InvalidState` if already serving, `Storage` if the socket can't be bound.
    pub async fn serve(&self) -> VmletResult<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(VmletError::InvalidState(
                "fd server is already running".to_string(),
            ));
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                VmletError::Storage(format!("can't create {}: {}", parent.display(), e))
            })?;
        }
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => tracing::debug!(path = %self.socket_path.display(), "Removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(VmletError::Storage(format!(
                    "can't remove stale socket {}: {}",
                    self.socket_path.display(),
                    e
                )));
            }
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            VmletError::Storage(format!(
                "failed to listen on {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = mpsc::channel(1);
        tokio::spawn(accept_loop(
            listener,
            self.inner.clone(),
            cancel.clone(),
            done_tx,
        ));

        *running = Some(Running {
            cancel,
            done: done_rx,
        });
        tracing::info!(path = %self.socket_path.display(), "FD server listening");
        Ok(())
    }

    /// Close the listening socket and wait for the accept loop to exit.
    ///
    /// Connections already being served finish their current request. The
    /// resource source is stopped afterwards.
    pub async fn stop(&self) -> VmletResult<()> {
        let running = self.running.lock().take();
        let Some(mut running) = running else {
            return Ok(());
        };

        running.cancel.cancel();
        // Channel closes when the accept loop drops its sender.
        while running.done.recv().await.is_some() {}

        let _ = std::fs::remove_file(&self.socket_path);
        tracing::info!(path = %self.socket_path.display(), "FD server stopped");

        let source = self.inner.source.clone();
        tokio::task::spawn_blocking(move || source.stop())
            .await
            .map_err(|e| VmletError::Internal(format!("source stop task failed: {}", e)))?
    }
}

async fn accept_loop(
    listener: UnixListener,
    inner: Arc<ServerInner>,
    cancel: CancellationToken,
    _done: mpsc::Sender<()>,
) {
    let mut backoff: Option<Duration> = None;

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            r = listener.accept() => r,
        };

        match accepted {
            Ok((stream, _)) => {
                backoff = None;
                let inner = inner.clone();
                tokio::spawn(async move {
                    if let Err(e) = inner.serve_conn(stream).await {
                        tracing::warn!(error = %e, "Closing fd connection");
                    }
                });
            }
            Err(e) if is_transient(&e) => {
                let delay = next_backoff(backoff);
                backoff = Some(delay);
                tracing::warn!(error = %e, delay_ms = delay.as_millis() as u64, "Accept error, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Accept failed, stopping fd server");
                break;
            }
        }
    }

    tracing::debug!("Accept loop exited");
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::ConnectionAborted
    ) || matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM | libc::EINTR)
    )
}

fn next_backoff(current: Option<Duration>) -> Duration {
    match current {
        None => ACCEPT_BACKOFF_START,
        Some(d) => (d * 2).min(ACCEPT_BACKOFF_MAX),
    }
}

impl ServerInner {
    /// Serve requests on one connection until EOF or a protocol error.
    async fn serve_conn(&self, mut stream: UnixStream) -> VmletResult<()> {
        loop {
            let mut buf = [0u8; HEADER_SIZE];
            match stream.read_exact(&mut buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }

            let hdr = FdHeader::decode(&buf)?;
            let command = match hdr.command() {
                Ok(c) if c.is_request() => c,
                _ => {
                    let msg = format!("bad command 0x{:02x}", hdr.command);
                    write_error(&mut stream, &hdr.key, &msg).await?;
                    return Err(VmletError::Protocol(msg));
                }
            };
            if hdr.data_size > MAX_PAYLOAD {
                return Err(VmletError::Protocol(format!(
                    "payload too large: {} bytes",
                    hdr.data_size
                )));
            }

            let mut data = vec![0u8; hdr.data_size as usize];
            stream.read_exact(&mut data).await?;

            tracing::debug!(key = %hdr.key, ?command, "FD request");
            match self.dispatch(command, &hdr.key, data).await {
                Ok(reply) => {
                    // request commands always have a response code
                    let code = command.response().unwrap_or(FdCommand::Error);
                    write_reply(&mut stream, code, &hdr.key, reply).await?;
                }
                Err(e) => {
                    tracing::warn!(key = %hdr.key, ?command, error = %e, "FD request failed");
                    write_error(&mut stream, &hdr.key, &e.to_string()).await?;
                }
            }
        }
    }

    async fn dispatch(&self, command: FdCommand, key: &str, data: Vec<u8>) -> VmletResult<Reply> {
        match command {
            FdCommand::Add => self.add(key, data).await,
            FdCommand::Release => self.release(key).await,
            FdCommand::Get => self.get(key).await,
            other => Err(VmletError::Protocol(format!("unexpected command {:?}", other))),
        }
    }

    async fn add(&self, key: &str, data: Vec<u8>) -> VmletResult<Reply> {
        self.table.reserve(key)?;

        let source = self.source.clone();
        let k = key.to_string();
        let created = tokio::task::spawn_blocking(move || source.get_fds(&k, &data))
            .await
            .map_err(|e| VmletError::Internal(format!("add task failed: {}", e)))
            .and_then(|r| r);

        match created {
            Ok((fds, response)) => {
                if fds.len() > MAX_FDS {
                    let count = fds.len();
                    drop(fds);
                    // the resources exist, so undo them before freeing the key
                    let source = self.source.clone();
                    let k = key.to_string();
                    let undone = tokio::task::spawn_blocking(move || source.release(&k))
                        .await
                        .map_err(|e| VmletError::Internal(format!("release task failed: {}", e)))
                        .and_then(|r| r);
                    if let Err(e) = undone {
                        tracing::error!(key = %key, error = %e, "Error releasing rejected resources");
                    }
                    self.table.forget(key);
                    return Err(VmletError::Internal(format!(
                        "source returned {} fds, limit is {}",
                        count, MAX_FDS
                    )));
                }
                tracing::info!(key = %key, fds = fds.len(), "Registered fds");
                self.table.fill(key, fds);
                Ok(Reply {
                    data: response,
                    fds: Vec::new(),
                })
            }
            Err(e) => {
                self.table.forget(key);
                Err(e)
            }
        }
    }

    async fn release(&self, key: &str) -> VmletResult<Reply> {
        self.table.begin_release(key)?;

        let source = self.source.clone();
        let k = key.to_string();
        let released = tokio::task::spawn_blocking(move || source.release(&k))
            .await
            .map_err(|e| VmletError::Internal(format!("release task failed: {}", e)))
            .and_then(|r| r);

        match released {
            Ok(()) => {
                self.table.forget(key);
                tracing::info!(key = %key, "Released fds");
                Ok(Reply {
                    data: Vec::new(),
                    fds: Vec::new(),
                })
            }
            Err(e) => {
                self.table.abort_release(key);
                Err(e)
            }
        }
    }

    async fn get(&self, key: &str) -> VmletResult<Reply> {
        let fds = self.table.dup(key)?;

        let source = self.source.clone();
        let k = key.to_string();
        let info = tokio::task::spawn_blocking(move || source.get_info(&k))
            .await
            .map_err(|e| VmletError::Internal(format!("get task failed: {}", e)))??;

        Ok(Reply { data: info, fds })
    }
}

async fn write_reply(
    stream: &mut UnixStream,
    command: FdCommand,
    key: &str,
    reply: Reply,
) -> VmletResult<()> {
    let raw: Vec<RawFd> = reply.fds.iter().map(|fd| fd.as_raw_fd()).collect();
    let hdr = FdHeader::new(command, key)
        .with_data_size(reply.data.len())
        .with_oob_size(passfd::oob_space(raw.len()));

    stream.write_all(&hdr.encode()).await?;
    passfd::send_with_fds(stream, &reply.data, &raw).await?;
    // reply.fds (our duplicates) close here, after the kernel took its references
    Ok(())
}

async fn write_error(stream: &mut UnixStream, key: &str, msg: &str) -> VmletResult<()> {
    let hdr = FdHeader::new(FdCommand::Error, key).with_data_size(msg.len());
    stream.write_all(&hdr.encode()).await?;
    stream.write_all(msg.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_ceiling() {
        let mut d = None;
        let mut seen = Vec::new();
        for _ in 0..10 {
            let next = next_backoff(d);
            seen.push(next.as_millis());
            d = Some(next);
        }
        assert_eq!(&seen[..4], &[5, 10, 20, 40]);
        assert_eq!(*seen.last().unwrap(), 1000);
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(!is_transient(&io::Error::from_raw_os_error(libc::EBADF)));
    }

    #[test]
    fn test_table_reserve_blocks_duplicates() {
        let table = FdTable::default();
        table.reserve("k").unwrap();
        let err = table.reserve("k").unwrap_err();
        assert_eq!(err.to_string(), "already exists: fd key already exists: \"k\"");

        // still creating: invisible to Get and Release
        assert!(table.dup("k").is_err());
        assert!(table.begin_release("k").is_err());

        table.fill("k", Vec::new());
        assert!(table.dup("k").unwrap().is_empty());
        table.begin_release("k").unwrap();
        assert!(table.dup("k").is_err());
        table.abort_release("k");
        assert!(table.dup("k").is_ok());
    }

    #[test]
    fn test_bad_key_message() {
        assert_eq!(
            bad_key("k_foo").to_string(),
            "not found: bad fd key: \"k_foo\""
        );
    }
}
