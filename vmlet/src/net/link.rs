//! Link, address and route manipulation over rtnetlink.
//!
//! A [`Netlink`] session owns a single-threaded tokio runtime and a netlink
//! socket opened in the namespace of the thread that created it. Create it on
//! the thread that will use it (see [`super::netns::run_in`]) and drop it
//! before that thread exits.

use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::RawFd;

use futures::stream::TryStreamExt;
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{InfoKind, LinkAttribute, LinkInfo, LinkMessage};
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage, RouteScope};
use rtnetlink::{Handle, IpVersion};
use vmlet_shared::errors::{VmletError, VmletResult};

use super::types::{IpNet, MacAddr};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkKind {
    Veth,
    Bridge,
    Tun,
    Other(String),
    Unknown,
}

/// Subset of link attributes vmlet cares about.
#[derive(Clone, Debug)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub mac: Option<MacAddr>,
    pub mtu: u32,
    pub kind: LinkKind,
}

impl Link {
    fn from_message(msg: &LinkMessage) -> Self {
        let mut link = Link {
            index: msg.header.index,
            name: String::new(),
            mac: None,
            mtu: 0,
            kind: LinkKind::Unknown,
        };
        for attr in &msg.attributes {
            match attr {
                LinkAttribute::IfName(name) => link.name = name.clone(),
                LinkAttribute::Address(raw) => link.mac = MacAddr::from_slice(raw),
                LinkAttribute::Mtu(mtu) => link.mtu = *mtu,
                LinkAttribute::LinkInfo(infos) => {
                    for info in infos {
                        if let LinkInfo::Kind(kind) = info {
                            link.kind = match kind {
                                InfoKind::Veth => LinkKind::Veth,
                                InfoKind::Bridge => LinkKind::Bridge,
                                InfoKind::Tun => LinkKind::Tun,
                                other => LinkKind::Other(format!("{:?}", other)),
                            };
                        }
                    }
                }
                _ => {}
            }
        }
        link
    }
}

/// IPv4 route as read from the kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub dst: IpNet,
    pub gateway: Option<Ipv4Addr>,
    pub oif: Option<u32>,
    pub link_scope: bool,
}

impl Route {
    fn from_message(msg: &RouteMessage) -> Self {
        let mut dst = Ipv4Addr::UNSPECIFIED;
        let mut gateway = None;
        let mut oif = None;
        for attr in &msg.attributes {
            match attr {
                RouteAttribute::Destination(RouteAddress::Inet(a)) => dst = *a,
                RouteAttribute::Gateway(RouteAddress::Inet(a)) => gateway = Some(*a),
                RouteAttribute::Oif(i) => oif = Some(*i),
                _ => {}
            }
        }
        Route {
            dst: IpNet::v4(dst, msg.header.destination_prefix_length),
            gateway,
            oif,
            link_scope: msg.header.scope == RouteScope::Link,
        }
    }
}

fn nl_err(what: &str, e: rtnetlink::Error) -> VmletError {
    VmletError::Network(format!("{}: {}", what, e))
}

fn exists(e: &rtnetlink::Error) -> bool {
    e.to_string().contains("File exists")
}

/// Blocking netlink session bound to the current thread's namespace.
pub struct Netlink {
    rt: tokio::runtime::Runtime,
    handle: Handle,
}

impl Netlink {
    pub fn new() -> VmletResult<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(|e| VmletError::Internal(format!("can't build netlink runtime: {}", e)))?;

        let handle = rt.block_on(async {
            let (connection, handle, _) = rtnetlink::new_connection().map_err(|e| {
                VmletError::Network(format!("failed to create netlink connection: {}", e))
            })?;
            tokio::spawn(connection);
            Ok::<_, VmletError>(handle)
        })?;

        Ok(Self { rt, handle })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Links
    // ─────────────────────────────────────────────────────────────────────

    pub fn links(&self) -> VmletResult<Vec<Link>> {
        self.rt.block_on(async {
            let mut stream = self.handle.link().get().execute();
            let mut links = Vec::new();
            while let Some(msg) = stream
                .try_next()
                .await
                .map_err(|e| nl_err("failed to list links", e))?
            {
                links.push(Link::from_message(&msg));
            }
            Ok(links)
        })
    }

    pub fn link_by_name(&self, name: &str) -> VmletResult<Option<Link>> {
        Ok(self.links()?.into_iter().find(|l| l.name == name))
    }

    pub fn require_link(&self, name: &str) -> VmletResult<Link> {
        self.link_by_name(name)?
            .ok_or_else(|| VmletError::NotFound(format!("link {:?} not found", name)))
    }

    pub fn set_up(&self, index: u32) -> VmletResult<()> {
        self.rt.block_on(async {
            self.handle
                .link()
                .set(index)
                .up()
                .execute()
                .await
                .map_err(|e| nl_err("failed to bring link up", e))
        })
    }

    pub fn set_down(&self, index: u32) -> VmletResult<()> {
        self.rt.block_on(async {
            self.handle
                .link()
                .set(index)
                .down()
                .execute()
                .await
                .map_err(|e| nl_err("failed to bring link down", e))
        })
    }

    pub fn set_mtu(&self, index: u32, mtu: u32) -> VmletResult<()> {
        self.rt.block_on(async {
            self.handle
                .link()
                .set(index)
                .mtu(mtu)
                .execute()
                .await
                .map_err(|e| nl_err("failed to set mtu", e))
        })
    }

    pub fn set_mac(&self, index: u32, mac: MacAddr) -> VmletResult<()> {
        self.rt.block_on(async {
            self.handle
                .link()
                .set(index)
                .address(mac.octets().to_vec())
                .execute()
                .await
                .map_err(|e| nl_err("failed to set hardware address", e))
        })
    }

    pub fn set_master(&self, index: u32, master: u32) -> VmletResult<()> {
        self.rt.block_on(async {
            self.handle
                .link()
                .set(index)
                .master(master)
                .execute()
                .await
                .map_err(|e| nl_err("failed to enslave link", e))
        })
    }

    pub fn rename(&self, index: u32, name: &str) -> VmletResult<()> {
        self.rt.block_on(async {
            self.handle
                .link()
                .set(index)
                .name(name.to_string())
                .execute()
                .await
                .map_err(|e| nl_err("failed to rename link", e))
        })
    }

    /// Move a link into the namespace referred to by `ns_fd`.
    pub fn move_to_netns(&self, index: u32, ns_fd: RawFd) -> VmletResult<()> {
        self.rt.block_on(async {
            self.handle
                .link()
                .set(index)
                .setns_by_fd(ns_fd)
                .execute()
                .await
                .map_err(|e| nl_err("failed to move link to namespace", e))
        })
    }

    pub fn delete(&self, index: u32) -> VmletResult<()> {
        self.rt.block_on(async {
            self.handle
                .link()
                .del(index)
                .execute()
                .await
                .map_err(|e| nl_err("failed to delete link", e))
        })
    }

    /// Delete the link called `name` if present.
    pub fn delete_by_name(&self, name: &str) -> VmletResult<()> {
        if let Some(link) = self.link_by_name(name)? {
            self.delete(link.index)?;
        }
        Ok(())
    }

    /// Create a bridge and return it.
    pub fn add_bridge(&self, name: &str) -> VmletResult<Link> {
        self.rt.block_on(async {
            self.handle
                .link()
                .add()
                .bridge(name.to_string())
                .execute()
                .await
                .map_err(|e| nl_err("failed to create bridge", e))
        })?;
        self.require_link(name)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Addresses
    // ─────────────────────────────────────────────────────────────────────

    fn address_messages(&self, index: u32) -> VmletResult<Vec<AddressMessage>> {
        self.rt.block_on(async {
            let mut stream = self
                .handle
                .address()
                .get()
                .set_link_index_filter(index)
                .execute();
            let mut out = Vec::new();
            while let Some(msg) = stream
                .try_next()
                .await
                .map_err(|e| nl_err("failed to list addresses", e))?
            {
                out.push(msg);
            }
            Ok(out)
        })
    }

    /// IPv4 addresses assigned to a link.
    pub fn ipv4_addrs(&self, index: u32) -> VmletResult<Vec<IpNet>> {
        let msgs = self.address_messages(index)?;
        Ok(msgs
            .iter()
            .filter_map(|msg| {
                msg.attributes.iter().find_map(|attr| match attr {
                    AddressAttribute::Address(IpAddr::V4(a)) => {
                        Some(IpNet::v4(a.clone(), msg.header.prefix_len))
                    }
                    _ => None,
                })
            })
            .collect())
    }

    pub fn add_addr(&self, index: u32, addr: IpNet) -> VmletResult<()> {
        self.rt.block_on(async {
            match self
                .handle
                .address()
                .add(index, addr.addr, addr.prefix)
                .execute()
                .await
            {
                Ok(()) => Ok(()),
                Err(e) if exists(&e) => {
                    tracing::debug!(%addr, "Address already assigned");
                    Ok(())
                }
                Err(e) => Err(nl_err(&format!("failed to add address {}", addr), e)),
            }
        })
    }

    /// Remove every IPv4 address from a link.
    pub fn flush_ipv4(&self, index: u32) -> VmletResult<()> {
        let msgs = self.address_messages(index)?;
        self.rt.block_on(async {
            for msg in msgs {
                let is_v4 = msg
                    .attributes
                    .iter()
                    .any(|a| matches!(a, AddressAttribute::Address(IpAddr::V4(_))));
                if !is_v4 {
                    continue;
                }
                self.handle
                    .address()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(|e| nl_err("failed to delete address", e))?;
            }
            Ok(())
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Routes
    // ─────────────────────────────────────────────────────────────────────

    /// IPv4 routes of the main table, optionally restricted to one link.
    pub fn ipv4_routes(&self, oif: Option<u32>) -> VmletResult<Vec<Route>> {
        let routes: Vec<Route> = self.rt.block_on(async {
            let mut stream = self.handle.route().get(IpVersion::V4).execute();
            let mut out = Vec::new();
            while let Some(msg) = stream
                .try_next()
                .await
                .map_err(|e| nl_err("failed to list routes", e))?
            {
                out.push(Route::from_message(&msg));
            }
            Ok::<_, VmletError>(out)
        })?;
        Ok(routes
            .into_iter()
            .filter(|r| oif.is_none() || r.oif == oif)
            .collect())
    }

    /// Add an IPv4 route through `oif`; routes without a gateway get link scope.
    pub fn add_route(&self, dst: IpNet, gateway: Option<Ipv4Addr>, oif: u32) -> VmletResult<()> {
        let dst_addr = dst.ipv4().ok_or_else(|| {
            VmletError::InvalidArgument(format!("not an IPv4 destination: {}", dst))
        })?;
        self.rt.block_on(async {
            let req = self
                .handle
                .route()
                .add()
                .v4()
                .destination_prefix(dst_addr, dst.prefix)
                .output_interface(oif);
            let req = match gateway {
                Some(gw) => req.gateway(gw),
                None => req.scope(RouteScope::Link),
            };
            match req.execute().await {
                Ok(()) => Ok(()),
                Err(e) if exists(&e) => Ok(()),
                Err(e) => Err(nl_err(&format!("failed to add route {}", dst), e)),
            }
        })
    }
}
