//! DHCP responder serving one fixed lease per pod bridge.

use std::ffi::OsString;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use nix::sys::socket::{
    AddressFamily, SockFlag, SockType, SockaddrIn, bind, setsockopt, socket, sockopt,
};
use tokio_util::sync::CancellationToken;
use vmlet_shared::errors::{VmletError, VmletResult};

use super::packet::{self, MessageType, Packet, opt};
use crate::net::csn;
use crate::net::types::{ContainerSideNetwork, IpNet, MacAddr};

const LEASE_SECS: u32 = 86_400;
const RENEWAL_SECS: u32 = 43_200;
const REBINDING_SECS: u32 = 64_800;
const DEFAULT_DNS: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Configuration handed to one VM interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    pub address: IpNet,
    pub gateway: Option<Ipv4Addr>,
    /// Routes sent as option 121, default route included.
    pub routes: Vec<(IpNet, Ipv4Addr)>,
    pub dns: Vec<Ipv4Addr>,
    pub domain: Option<String>,
    pub mtu: u16,
}

/// One bridge to listen on and the single client it serves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhcpEndpoint {
    pub bridge: String,
    pub server_ip: Ipv4Addr,
    pub client_mac: MacAddr,
    pub lease: Lease,
}

/// Derive one endpoint per tap interface of `csn`.
pub fn endpoints_from_csn(csn: &ContainerSideNetwork) -> VmletResult<Vec<DhcpEndpoint>> {
    let result = &csn.result;
    let dns: Vec<Ipv4Addr> = result
        .dns
        .nameservers
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();
    let domain = result
        .dns
        .search
        .first()
        .cloned()
        .or_else(|| result.dns.domain.clone());

    let mut endpoints = Vec::new();
    for (n, desc) in csn::taps(csn) {
        let idx = result.interface_index(&desc.name).ok_or_else(|| {
            VmletError::Dhcp(format!("interface {} missing from CNI result", desc.name))
        })?;
        let ip = result
            .ips_for(idx)
            .find(|ip| ip.address.ipv4().is_some())
            .ok_or_else(|| VmletError::Dhcp(format!("no IPv4 config for {}", desc.name)))?;
        let gateway = match ip.gateway {
            Some(IpAddr::V4(gw)) => Some(gw),
            _ => None,
        };

        let routes = result
            .routes
            .iter()
            .filter(|r| r.dst.ipv4().is_some())
            .filter_map(|r| {
                let via = match r.gw {
                    Some(IpAddr::V4(gw)) => Some(gw),
                    Some(IpAddr::V6(_)) => None,
                    None => gateway,
                }?;
                Some((r.dst, via))
            })
            .collect();

        let server_ip = csn::bridge_addr(n).ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED);
        endpoints.push(DhcpEndpoint {
            bridge: csn::bridge_name(n),
            server_ip,
            client_mac: desc.hardware_addr,
            lease: Lease {
                address: ip.address,
                gateway,
                routes,
                dns: if dns.is_empty() { vec![DEFAULT_DNS] } else { dns.clone() },
                domain: domain.clone(),
                mtu: desc.mtu,
            },
        });
    }
    Ok(endpoints)
}

fn ipv4_list(addrs: &[Ipv4Addr]) -> Vec<u8> {
    addrs.iter().flat_map(|a| a.octets()).collect()
}

/// Build the reply for `request`, or `None` when it must be ignored.
pub fn respond(endpoint: &DhcpEndpoint, request: &Packet) -> Option<Packet> {
    if request.op != packet::BOOTREQUEST || request.client_mac() != Some(endpoint.client_mac) {
        return None;
    }
    let lease = &endpoint.lease;
    let addr = lease.address.ipv4()?;

    let kind = match request.message_type()? {
        MessageType::Discover => MessageType::Offer,
        MessageType::Request => match request.requested_ip() {
            Some(asked) if asked != addr => MessageType::Nak,
            _ => MessageType::Ack,
        },
        _ => return None,
    };

    let mut reply = request.reply(kind);
    reply.set_option(opt::SERVER_ID, endpoint.server_ip.octets().to_vec());
    if kind == MessageType::Nak {
        return Some(reply);
    }

    reply.yiaddr = addr;
    reply.siaddr = endpoint.server_ip;
    if let Some(mask) = lease.address.netmask_v4() {
        reply.set_option(opt::SUBNET_MASK, mask.octets().to_vec());
    }
    if let Some(gw) = lease.gateway {
        reply.set_option(opt::ROUTER, gw.octets().to_vec());
    }
    reply.set_option(opt::DNS, ipv4_list(&lease.dns));
    if let Some(domain) = &lease.domain {
        reply.set_option(opt::DOMAIN_NAME, domain.as_bytes().to_vec());
    }
    reply.set_option(opt::INTERFACE_MTU, lease.mtu.to_be_bytes().to_vec());
    reply.set_option(opt::LEASE_TIME, LEASE_SECS.to_be_bytes().to_vec());
    reply.set_option(opt::RENEWAL_TIME, RENEWAL_SECS.to_be_bytes().to_vec());
    reply.set_option(opt::REBINDING_TIME, REBINDING_SECS.to_be_bytes().to_vec());
    if !lease.routes.is_empty() {
        reply.set_option(opt::CLASSLESS_ROUTES, packet::classless_routes(&lease.routes));
    }
    if let Some(uuid) = request.option(opt::CLIENT_UUID) {
        reply.set_option(opt::CLIENT_UUID, uuid.to_vec());
    }
    Some(reply)
}

fn listen(bridge: &str) -> VmletResult<UdpSocket> {
    let err = |what: &str, e: nix::Error| VmletError::Dhcp(format!("{} on {}: {}", what, bridge, e));

    let fd = socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(|e| err("socket", e))?;
    setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(|e| err("SO_REUSEADDR", e))?;
    setsockopt(&fd, sockopt::Broadcast, &true).map_err(|e| err("SO_BROADCAST", e))?;
    setsockopt(&fd, sockopt::BindToDevice, &OsString::from(bridge))
        .map_err(|e| err("SO_BINDTODEVICE", e))?;
    bind(fd.as_raw_fd(), &SockaddrIn::new(0, 0, 0, 0, packet::SERVER_PORT))
        .map_err(|e| err("bind", e))?;

    let sock = UdpSocket::from(fd);
    sock.set_read_timeout(Some(POLL_INTERVAL))?;
    Ok(sock)
}

fn serve(sock: UdpSocket, endpoint: DhcpEndpoint, token: CancellationToken) -> VmletResult<()> {
    let broadcast = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, packet::CLIENT_PORT));
    let mut buf = [0u8; 1500];

    while !token.is_cancelled() {
        let n = match sock.recv_from(&mut buf) {
            Ok((n, _)) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(VmletError::Dhcp(format!(
                    "receive on {} failed: {}",
                    endpoint.bridge, e
                )));
            }
        };

        let request = match Packet::parse(&buf[..n]) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(bridge = %endpoint.bridge, error = %e, "Dropping malformed DHCP packet");
                continue;
            }
        };
        let Some(reply) = respond(&endpoint, &request) else {
            continue;
        };

        tracing::debug!(
            bridge = %endpoint.bridge,
            mac = %endpoint.client_mac,
            reply = ?reply.message_type(),
            "Sending DHCP reply"
        );
        if let Err(e) = sock.send_to(&reply.encode(), broadcast) {
            tracing::warn!(bridge = %endpoint.bridge, error = %e, "Failed to send DHCP reply");
        }
    }
    Ok(())
}

/// Running responder threads for one pod.
pub struct DhcpServer {
    token: CancellationToken,
    done: mpsc::Receiver<VmletResult<()>>,
    workers: usize,
}

impl DhcpServer {
    /// Bind one socket per endpoint and start serving.
    ///
    /// Sockets are created in the calling thread's network namespace, so
    /// call this inside the pod namespace.
    pub fn start(endpoints: Vec<DhcpEndpoint>) -> VmletResult<Self> {
        let sockets = endpoints
            .iter()
            .map(|ep| listen(&ep.bridge))
            .collect::<VmletResult<Vec<_>>>()?;

        let token = CancellationToken::new();
        let (tx, done) = mpsc::channel();
        let workers = endpoints.len();

        for (sock, endpoint) in sockets.into_iter().zip(endpoints) {
            let worker_token = token.clone();
            let tx = tx.clone();
            let name = format!("vmlet-dhcp-{}", endpoint.bridge);
            let bridge = endpoint.bridge.clone();
            let spawned = thread::Builder::new().name(name).spawn(move || {
                let result = serve(sock, endpoint, worker_token);
                if let Err(e) = &result {
                    tracing::error!(error = %e, "DHCP responder failed");
                }
                let _ = tx.send(result);
            });
            if let Err(e) = spawned {
                token.cancel();
                return Err(VmletError::Dhcp(format!(
                    "can't start responder for {}: {}",
                    bridge, e
                )));
            }
            tracing::debug!(bridge = %bridge, "DHCP responder started");
        }

        Ok(Self {
            token,
            done,
            workers,
        })
    }

    /// Stop all responders and wait until each has exited.
    pub fn stop(self) -> VmletResult<()> {
        self.token.cancel();
        let mut first_err = None;
        for _ in 0..self.workers {
            match self.done.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(_) => break,
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
