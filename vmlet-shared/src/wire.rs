//! Descriptor protocol header codec.
//!
//! Every message on the descriptor socket starts with a fixed 77 byte header:
//!
//! ```text
//! +-------+-----+-----------+----------+-------------------+
//! | magic | cmd | data size | oob size | key (64, space    |
//! | u32   | u8  | u32       | u32      | padded)           |
//! +-------+-----+-----------+----------+-------------------+
//! ```
//!
//! Numeric fields are big-endian. The payload (`data size` bytes) follows the
//! header on the stream; descriptors travel as `SCM_RIGHTS` ancillary data
//! attached to the payload.

use crate::constants::protocol::{FD_MAGIC, HEADER_SIZE, KEY_SIZE};
use crate::errors::{VmletError, VmletResult};

/// Bit set on the command byte of every successful response.
pub const RESPONSE_FLAG: u8 = 0x80;

/// Command codes carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FdCommand {
    Add,
    Release,
    Get,
    AddResponse,
    ReleaseResponse,
    GetResponse,
    Error,
}

impl FdCommand {
    pub fn code(self) -> u8 {
        match self {
            FdCommand::Add => 0x00,
            FdCommand::Release => 0x01,
            FdCommand::Get => 0x02,
            FdCommand::AddResponse => RESPONSE_FLAG,
            FdCommand::ReleaseResponse => 0x01 | RESPONSE_FLAG,
            FdCommand::GetResponse => 0x02 | RESPONSE_FLAG,
            FdCommand::Error => 0xff,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(FdCommand::Add),
            0x01 => Some(FdCommand::Release),
            0x02 => Some(FdCommand::Get),
            0x80 => Some(FdCommand::AddResponse),
            0x81 => Some(FdCommand::ReleaseResponse),
            0x82 => Some(FdCommand::GetResponse),
            0xff => Some(FdCommand::Error),
            _ => None,
        }
    }

    /// Response code matching a request code.
    ///
    /// Returns `None` for codes that are already responses.
    pub fn response(self) -> Option<Self> {
        match self {
            FdCommand::Add => Some(FdCommand::AddResponse),
            FdCommand::Release => Some(FdCommand::ReleaseResponse),
            FdCommand::Get => Some(FdCommand::GetResponse),
            _ => None,
        }
    }

    pub fn is_request(self) -> bool {
        self.code() & RESPONSE_FLAG == 0
    }
}

/// Decoded descriptor protocol header.
///
/// `command` is kept as the raw byte so that a server can tell a bad magic
/// (drop the connection silently) from an unknown command (report it first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdHeader {
    pub magic: u32,
    pub command: u8,
    pub data_size: u32,
    pub oob_size: u32,
    pub key: String,
}

impl FdHeader {
    pub fn new(command: FdCommand, key: &str) -> Self {
        Self {
            magic: FD_MAGIC,
            command: command.code(),
            data_size: 0,
            oob_size: 0,
            key: key.to_string(),
        }
    }

    pub fn with_data_size(mut self, size: usize) -> Self {
        self.data_size = size as u32;
        self
    }

    pub fn with_oob_size(mut self, size: usize) -> Self {
        self.oob_size = size as u32;
        self
    }

    /// Parsed command.
    ///
    /// # Errors
    /// `VmletError::Protocol` for a code outside the command table.
    pub fn command(&self) -> VmletResult<FdCommand> {
        FdCommand::from_code(self.command)
            .ok_or_else(|| VmletError::Protocol(format!("bad command 0x{:02x}", self.command)))
    }

    /// Encode into the fixed wire layout.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4] = self.command;
        buf[5..9].copy_from_slice(&self.data_size.to_be_bytes());
        buf[9..13].copy_from_slice(&self.oob_size.to_be_bytes());
        buf[13..].copy_from_slice(&encode_key(&self.key));
        buf
    }

    /// Decode a header, rejecting a wrong magic value.
    ///
    /// # Errors
    /// `VmletError::Protocol` when the magic does not match [`FD_MAGIC`] or the
    /// key is not valid UTF-8.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> VmletResult<Self> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != FD_MAGIC {
            return Err(VmletError::Protocol(format!("bad magic 0x{:08x}", magic)));
        }
        Ok(Self {
            magic,
            command: buf[4],
            data_size: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]),
            oob_size: u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]),
            key: decode_key(&buf[13..])?,
        })
    }
}

/// Space-pad (or truncate) a key to the fixed key width.
pub fn encode_key(key: &str) -> [u8; KEY_SIZE] {
    let mut out = [b' '; KEY_SIZE];
    let bytes = key.as_bytes();
    let mut n = bytes.len().min(KEY_SIZE);
    while !key.is_char_boundary(n) {
        n -= 1;
    }
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Strip the space padding from a fixed-width key.
///
/// Only trailing spaces are padding: a key's own trailing spaces are lost on
/// the wire, leading spaces are kept. See [`wire_key`].
pub fn decode_key(raw: &[u8]) -> VmletResult<String> {
    let key = std::str::from_utf8(raw)
        .map_err(|e| VmletError::Protocol(format!("key is not valid UTF-8: {}", e)))?;
    Ok(key.trim_end_matches(' ').to_string())
}

/// The key as the peer decodes it: truncated to the key width on a char
/// boundary, with trailing spaces dropped.
pub fn wire_key(key: &str) -> String {
    let mut n = key.len().min(KEY_SIZE);
    while !key.is_char_boundary(n) {
        n -= 1;
    }
    key[..n].trim_end_matches(' ').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_layout_is_big_endian_and_packed() {
        let hdr = FdHeader::new(FdCommand::GetResponse, "pod")
            .with_data_size(0x0102_0304)
            .with_oob_size(24);
        let buf = hdr.encode();

        assert_eq!(buf.len(), 77);
        assert_eq!(&buf[0..4], &[0x42, 0x42, 0x42, 0x42]);
        assert_eq!(buf[4], 0x82);
        assert_eq!(&buf[5..9], &[1, 2, 3, 4]);
        assert_eq!(&buf[9..13], &[0, 0, 0, 24]);
        assert_eq!(&buf[13..16], b"pod");
        assert!(buf[16..].iter().all(|b| *b == b' '));

        assert_eq!(FdHeader::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut buf = FdHeader::new(FdCommand::Add, "k").encode();
        buf[0] = 0x41;
        let err = FdHeader::decode(&buf).unwrap_err();
        assert!(matches!(err, VmletError::Protocol(_)));
    }

    #[test]
    fn test_unknown_command_is_protocol_error() {
        let mut buf = FdHeader::new(FdCommand::Add, "k").encode();
        buf[4] = 0x03;
        let hdr = FdHeader::decode(&buf).unwrap();
        assert!(hdr.command().is_err());
    }

    #[test]
    fn test_response_codes() {
        assert_eq!(FdCommand::Add.response(), Some(FdCommand::AddResponse));
        assert_eq!(FdCommand::Release.response().map(|c| c.code()), Some(0x81));
        assert_eq!(FdCommand::Error.code(), 0xff);
        assert!(FdCommand::Get.is_request());
        assert!(!FdCommand::Error.is_request());
        assert_eq!(FdCommand::GetResponse.response(), None);
    }

    #[test]
    fn test_only_trailing_spaces_are_padding() {
        let hdr = FdHeader::new(FdCommand::Get, "  pod a  ");
        let decoded = FdHeader::decode(&hdr.encode()).unwrap();
        assert_eq!(decoded.key, "  pod a");
        assert_eq!(wire_key("  pod a  "), decoded.key);
        assert_eq!(wire_key("   "), "");
    }

    proptest! {
        #[test]
        fn test_wire_key_matches_decoded(key in "[ a-zé0-9]{0,80}") {
            let decoded = decode_key(&encode_key(&key)).unwrap();
            prop_assert_eq!(decoded, wire_key(&key));
        }

        #[test]
        fn test_key_padding_keeps_prefix(key in "[a-z0-9_-]{0,100}") {
            let raw = encode_key(&key);
            let decoded = decode_key(&raw).unwrap();
            let expected: String = key.chars().take(KEY_SIZE).collect();
            prop_assert_eq!(decoded, expected);
        }
    }
}
