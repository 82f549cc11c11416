//! DHCPv4 message codec (RFC 2131 / RFC 2132).

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::net::types::{IpNet, MacAddr};

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

const FIXED_LEN: usize = 236;
const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;
const HTYPE_ETHERNET: u8 = 1;

/// Option codes
pub mod opt {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const ROUTER: u8 = 3;
    pub const DNS: u8 = 6;
    pub const DOMAIN_NAME: u8 = 15;
    pub const INTERFACE_MTU: u8 = 26;
    pub const REQUESTED_IP: u8 = 50;
    pub const LEASE_TIME: u8 = 51;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_ID: u8 = 54;
    pub const RENEWAL_TIME: u8 = 58;
    pub const REBINDING_TIME: u8 = 59;
    pub const CLIENT_UUID: u8 = 97;
    pub const CLASSLESS_ROUTES: u8 = 121;
    pub const END: u8 = 255;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),

    #[error("bad magic cookie")]
    BadCookie,

    #[error("option {0} truncated")]
    TruncatedOption(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    /// Options in wire order; repeated codes are concatenated (RFC 3396).
    pub options: Vec<(u8, Vec<u8>)>,
}

fn ip_at(buf: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(buf[at], buf[at + 1], buf[at + 2], buf[at + 3])
}

impl Packet {
    pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < FIXED_LEN + MAGIC_COOKIE.len() {
            return Err(PacketError::TooShort(buf.len()));
        }
        if buf[FIXED_LEN..FIXED_LEN + 4] != MAGIC_COOKIE {
            return Err(PacketError::BadCookie);
        }

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&buf[28..44]);

        let mut pkt = Packet {
            op: buf[0],
            htype: buf[1],
            hlen: buf[2],
            hops: buf[3],
            xid: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            secs: u16::from_be_bytes([buf[8], buf[9]]),
            flags: u16::from_be_bytes([buf[10], buf[11]]),
            ciaddr: ip_at(buf, 12),
            yiaddr: ip_at(buf, 16),
            siaddr: ip_at(buf, 20),
            giaddr: ip_at(buf, 24),
            chaddr,
            options: Vec::new(),
        };

        let mut rest = &buf[FIXED_LEN + 4..];
        while let Some((&code, tail)) = rest.split_first() {
            match code {
                opt::PAD => rest = tail,
                opt::END => break,
                _ => {
                    let (&len, tail) = tail.split_first().ok_or(PacketError::TruncatedOption(code))?;
                    let len = usize::from(len);
                    if tail.len() < len {
                        return Err(PacketError::TruncatedOption(code));
                    }
                    let (value, tail) = tail.split_at(len);
                    match pkt.options.iter_mut().find(|(c, _)| *c == code) {
                        Some((_, existing)) => existing.extend_from_slice(value),
                        None => pkt.options.push((code, value.to_vec())),
                    }
                    rest = tail;
                }
            }
        }
        Ok(pkt)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; FIXED_LEN];
        buf[0] = self.op;
        buf[1] = self.htype;
        buf[2] = self.hlen;
        buf[3] = self.hops;
        buf[4..8].copy_from_slice(&self.xid.to_be_bytes());
        buf[8..10].copy_from_slice(&self.secs.to_be_bytes());
        buf[10..12].copy_from_slice(&self.flags.to_be_bytes());
        buf[12..16].copy_from_slice(&self.ciaddr.octets());
        buf[16..20].copy_from_slice(&self.yiaddr.octets());
        buf[20..24].copy_from_slice(&self.siaddr.octets());
        buf[24..28].copy_from_slice(&self.giaddr.octets());
        buf[28..44].copy_from_slice(&self.chaddr);
        buf.extend_from_slice(&MAGIC_COOKIE);

        for (code, value) in &self.options {
            if value.is_empty() {
                buf.extend_from_slice(&[*code, 0]);
            }
            for chunk in value.chunks(255) {
                buf.push(*code);
                buf.push(chunk.len() as u8);
                buf.extend_from_slice(chunk);
            }
        }
        buf.push(opt::END);
        buf
    }

    pub fn option(&self, code: u8) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| v.as_slice())
    }

    pub fn set_option(&mut self, code: u8, value: Vec<u8>) {
        match self.options.iter_mut().find(|(c, _)| *c == code) {
            Some((_, existing)) => *existing = value,
            None => self.options.push((code, value)),
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        match self.option(opt::MESSAGE_TYPE)? {
            [v] => MessageType::from_u8(*v),
            _ => None,
        }
    }

    pub fn client_mac(&self) -> Option<MacAddr> {
        if self.htype != HTYPE_ETHERNET || self.hlen != 6 {
            return None;
        }
        MacAddr::from_slice(&self.chaddr[..6])
    }

    /// Address the client asks for: option 50, else `ciaddr`.
    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        if let Some([a, b, c, d]) = self.option(opt::REQUESTED_IP) {
            return Some(Ipv4Addr::new(*a, *b, *c, *d));
        }
        (!self.ciaddr.is_unspecified()).then_some(self.ciaddr)
    }

    /// Empty reply skeleton addressed to the same client and transaction.
    pub fn reply(&self, kind: MessageType) -> Packet {
        Packet {
            op: BOOTREPLY,
            htype: self.htype,
            hlen: self.hlen,
            hops: 0,
            xid: self.xid,
            secs: 0,
            flags: self.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: self.giaddr,
            chaddr: self.chaddr,
            options: vec![(opt::MESSAGE_TYPE, vec![kind as u8])],
        }
    }
}

/// Encode option 121 (RFC 3442): prefix length, significant destination
/// octets, then the router.
pub fn classless_routes(routes: &[(IpNet, Ipv4Addr)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (dst, router) in routes {
        let Some(net) = dst.network_v4() else {
            continue;
        };
        let significant = usize::from(dst.prefix).div_ceil(8);
        out.push(dst.prefix);
        out.extend_from_slice(&net.octets()[..significant]);
        out.extend_from_slice(&router.octets());
    }
    out
}

#[cfg(test)]
pub(crate) fn request(kind: MessageType, mac: MacAddr) -> Packet {
    let mut chaddr = [0u8; 16];
    chaddr[..6].copy_from_slice(&mac.octets());
    Packet {
        op: BOOTREQUEST,
        htype: HTYPE_ETHERNET,
        hlen: 6,
        hops: 0,
        xid: 0x1234_5678,
        secs: 0,
        flags: 0x8000,
        ciaddr: Ipv4Addr::UNSPECIFIED,
        yiaddr: Ipv4Addr::UNSPECIFIED,
        siaddr: Ipv4Addr::UNSPECIFIED,
        giaddr: Ipv4Addr::UNSPECIFIED,
        chaddr,
        options: vec![(opt::MESSAGE_TYPE, vec![kind as u8])],
    }
}
