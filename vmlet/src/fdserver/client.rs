//! Descriptor client.

use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use vmlet_shared::constants::protocol::{HEADER_SIZE, MAX_PAYLOAD};
use vmlet_shared::errors::{VmletError, VmletResult};
use vmlet_shared::wire::{FdCommand, FdHeader, wire_key};

use super::passfd;

/// Talks to an [`FdServer`](super::FdServer) over its Unix socket.
///
/// Every call opens its own connection, so a client can be shared freely
/// between tasks.
#[derive(Debug, Clone)]
pub struct FdClient {
    socket_path: PathBuf,
}

impl FdClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Check that the server accepts connections.
    pub async fn ping(&self) -> VmletResult<()> {
        let stream = self.connect().await?;
        drop(stream);
        Ok(())
    }

    /// Wait for the server to come up, trying `retries` times `delay` apart.
    ///
    /// # Errors
    /// The last connection error once all attempts failed.
    pub async fn wait_until_running(&self, retries: u32, delay: Duration) -> VmletResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.ping().await {
                Ok(()) => {
                    tracing::debug!(attempt, path = %self.socket_path.display(), "FD server is up");
                    return Ok(());
                }
                Err(e) if attempt >= retries.max(1) => return Err(e),
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "FD server not ready yet");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Ask the server to create resources for `key`.
    ///
    /// `data` is serialized to JSON and handed to the server's resource
    /// source. Returns the source's response payload.
    pub async fn add_fds<T: Serialize + ?Sized>(&self, key: &str, data: &T) -> VmletResult<Vec<u8>> {
        let payload = serde_json::to_vec(data)?;
        let (resp, _) = self.request(FdCommand::Add, key, &payload).await?;
        Ok(resp)
    }

    /// Ask the server to destroy the resources registered under `key`.
    pub async fn release_fds(&self, key: &str) -> VmletResult<()> {
        self.request(FdCommand::Release, key, &[]).await?;
        Ok(())
    }

    /// Fetch the descriptors registered under `key` and their description.
    pub async fn get_fds(&self, key: &str) -> VmletResult<(Vec<OwnedFd>, Vec<u8>)> {
        let (info, fds) = self.request(FdCommand::Get, key, &[]).await?;
        Ok((fds, info))
    }

    async fn connect(&self) -> VmletResult<UnixStream> {
        UnixStream::connect(&self.socket_path).await.map_err(|e| {
            VmletError::Network(format!(
                "can't connect to {:?}: {}",
                self.socket_path.display().to_string(),
                e
            ))
        })
    }

    async fn request(
        &self,
        command: FdCommand,
        key: &str,
        data: &[u8],
    ) -> VmletResult<(Vec<u8>, Vec<OwnedFd>)> {
        let mut stream = self.connect().await?;

        let hdr = FdHeader::new(command, key).with_data_size(data.len());
        stream.write_all(&hdr.encode()).await?;
        if !data.is_empty() {
            stream.write_all(data).await?;
        }

        let mut buf = [0u8; HEADER_SIZE];
        stream.read_exact(&mut buf).await.map_err(|e| {
            VmletError::Protocol(format!("error reading response header: {}", e))
        })?;
        let resp = FdHeader::decode(&buf)?;
        if resp.key != wire_key(key) {
            return Err(VmletError::Protocol(format!(
                "response key {:?} doesn't match request key {:?}",
                resp.key, key
            )));
        }
        if resp.data_size > MAX_PAYLOAD {
            return Err(VmletError::Protocol(format!(
                "response payload too large: {} bytes",
                resp.data_size
            )));
        }

        let (payload, fds) =
            passfd::recv_with_fds(&mut stream, resp.data_size as usize, resp.oob_size > 0).await?;

        let resp_command = resp.command()?;
        if resp_command == FdCommand::Error {
            return Err(VmletError::Remote(format!(
                "server returned error: {}",
                String::from_utf8_lossy(&payload)
            )));
        }
        if Some(resp_command) != command.response() {
            return Err(VmletError::Protocol(format!(
                "unexpected response command {:?} for {:?}",
                resp_command, command
            )));
        }

        Ok((payload, fds))
    }
}
