//! `SCM_RIGHTS` transfer over tokio Unix streams.
//!
//! The header is written and read with ordinary stream I/O. The payload of a
//! descriptor-carrying response goes out in a single `sendmsg` with the
//! descriptors attached, so the receiver picks them up with its first
//! `recvmsg` of the payload.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr, recvmsg, sendmsg};
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::UnixStream;
use vmlet_shared::constants::protocol::MAX_FDS;
use vmlet_shared::errors::{VmletError, VmletResult};

/// Ancillary buffer size needed to carry `count` descriptors.
pub fn oob_space(count: usize) -> usize {
    if count == 0 {
        return 0;
    }
    let payload = (count * std::mem::size_of::<RawFd>()) as u32;
    // SAFETY: CMSG_SPACE is a pure size computation.
    unsafe { libc::CMSG_SPACE(payload) as usize }
}

/// Write `data` with `fds` attached.
///
/// An empty payload with descriptors is sent as a single filler byte, since
/// ancillary data on a stream socket must ride on at least one byte.
pub async fn send_with_fds(stream: &mut UnixStream, data: &[u8], fds: &[RawFd]) -> VmletResult<()> {
    if fds.is_empty() {
        stream.write_all(data).await?;
        return Ok(());
    }

    let filler = [0u8; 1];
    let body: &[u8] = if data.is_empty() { &filler } else { data };
    let rights = [ControlMessage::ScmRights(fds)];
    let raw = stream.as_raw_fd();
    let mut sent = 0;

    while sent < body.len() {
        stream.writable().await?;
        let chunk = &body[sent..];
        let cmsgs: &[ControlMessage] = if sent == 0 { &rights } else { &[] };
        let res = stream.try_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(chunk)];
            sendmsg::<UnixAddr>(
                raw,
                &iov,
                cmsgs,
                MsgFlags::MSG_NOSIGNAL,
                None,
            )
            .map_err(io::Error::from)
        });
        match res {
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                return Err(VmletError::Protocol(format!(
                    "error sending descriptors: {}",
                    e
                )));
            }
        }
    }

    tracing::trace!(count = fds.len(), bytes = body.len(), "Sent descriptors");
    Ok(())
}

/// Read a `len` byte payload together with any descriptors attached to it.
///
/// `expect_fds` tells the receiver that the sender announced ancillary data,
/// which also means a zero length payload arrives as one filler byte.
pub async fn recv_with_fds(
    stream: &mut UnixStream,
    len: usize,
    expect_fds: bool,
) -> VmletResult<(Vec<u8>, Vec<OwnedFd>)> {
    if !expect_fds {
        let mut data = vec![0u8; len];
        stream.read_exact(&mut data).await?;
        return Ok((data, Vec::new()));
    }

    let wire_len = len.max(1);
    let mut buf = vec![0u8; wire_len];

    let raw = stream.as_raw_fd();
    let (received, fds) = loop {
        stream.readable().await?;
        let res = stream.try_io(Interest::READABLE, || recv_once(raw, &mut buf));
        match res {
            Ok(r) => break r,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                return Err(VmletError::Protocol(format!(
                    "error receiving descriptors: {}",
                    e
                )));
            }
        }
    };

    if received == 0 {
        return Err(VmletError::Protocol(
            "connection closed while reading payload".to_string(),
        ));
    }
    if received < wire_len {
        stream.read_exact(&mut buf[received..]).await?;
    }

    if len == 0 {
        buf.clear();
    }
    tracing::trace!(count = fds.len(), bytes = len, "Received descriptors");
    Ok((buf, fds))
}

/// One `recvmsg` call; descriptors are wrapped into `OwnedFd` before returning.
fn recv_once(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_FDS]);

    let msg = recvmsg::<UnixAddr>(
        fd,
        &mut iov,
        Some(&mut cmsg_space),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )
    .map_err(io::Error::from)?;

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs().into_iter().flatten() {
        if let ControlMessageOwned::ScmRights(raw) = cmsg {
            // SAFETY: the kernel installed these descriptors for us.
            fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
        }
    }

    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        return Err(io::Error::other("ancillary data truncated"));
    }

    Ok((msg.bytes, fds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn test_oob_space() {
        assert_eq!(oob_space(0), 0);
        let mut prev = 0;
        for n in 1..=MAX_FDS {
            let payload = (n * std::mem::size_of::<RawFd>()) as u32;
            // SAFETY: CMSG_LEN is a pure size computation.
            let len = unsafe { libc::CMSG_LEN(payload) } as usize;
            let space = oob_space(n);
            assert!(space >= len, "{} fds need {} bytes, got {}", n, len, space);
            // CMSG_SPACE pads to the word size, so neighbours can be equal
            assert!(space >= prev);
            prev = space;
        }
    }

    #[tokio::test]
    async fn test_descriptor_survives_transfer() {
        let (mut a, mut b) = UnixStream::pair().unwrap();

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"payload-in-file").unwrap();

        send_with_fds(&mut a, b"hello", &[file.as_raw_fd()])
            .await
            .unwrap();
        let (data, fds) = recv_with_fds(&mut b, 5, true).await.unwrap();

        assert_eq!(data, b"hello");
        assert_eq!(fds.len(), 1);

        let mut received = std::fs::File::from(fds.into_iter().next().unwrap());
        received.seek(SeekFrom::Start(0)).unwrap();
        let mut content = String::new();
        received.read_to_string(&mut content).unwrap();
        assert_eq!(content, "payload-in-file");
    }

    #[tokio::test]
    async fn test_empty_payload_uses_filler_byte() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let file = tempfile::tempfile().unwrap();

        send_with_fds(&mut a, b"", &[file.as_raw_fd()]).await.unwrap();
        let (data, fds) = recv_with_fds(&mut b, 0, true).await.unwrap();

        assert!(data.is_empty());
        assert_eq!(fds.len(), 1);
    }

    #[tokio::test]
    async fn test_plain_payload_without_fds() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        send_with_fds(&mut a, b"abc", &[]).await.unwrap();
        let (data, fds) = recv_with_fds(&mut b, 3, false).await.unwrap();
        assert_eq!(data, b"abc");
        assert!(fds.is_empty());
    }
}
