pub mod tc;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use futures::{StreamExt, TryStreamExt};
use ipnetwork::IpNetwork;
use netlink_packet_core::{
    NLM_F_ACK, NLM_F_CREATE, NLM_F_REPLACE, NLM_F_REQUEST, NetlinkMessage, NetlinkPayload,
};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_packet_route::address::AddressMessage;
use netlink_packet_route::link::{
    InfoData, InfoIpVlan, InfoKind, InfoMacVlan, InfoVeth, IpVlanMode, LinkAttribute, LinkInfo,
    LinkMessage, MacVlanMode,
};
use netlink_packet_route::neighbour::{
    NeighbourAddress, NeighbourAttribute, NeighbourFlags, NeighbourMessage, NeighbourState,
};
use netlink_packet_route::route::{RouteProtocol, RouteScope};
use netlink_packet_core::DefaultNla;
use netlink_proto::ConnectionHandle;
use netlink_sys::SocketAddr;
use netlink_sys::protocols::NETLINK_ROUTE;
use rtnetlink::{Handle, LinkMessageBuilder, LinkUnspec, RouteMessageBuilder};
use tracing::debug;

use crate::config::AddrLabel;
use crate::netns::{NetnsFd, run_in_netns, run_in_new_netns};
use crate::{NetError, Result};

/// IFLA_INFO_DATA, for link kinds the route packet crate has no typed
/// representation of.
const IFLA_INFO_DATA: u16 = 2;

const IFLA_IPTUN_LOCAL: u16 = 2;
const IFLA_IPTUN_REMOTE: u16 = 3;
const IFLA_IPTUN_TTL: u16 = 4;
const IFLA_IPTUN_ENCAP_LIMIT: u16 = 6;
const IFLA_IPTUN_PROTO: u16 = 9;

/// Typed netlink client of one network namespace: a high-level rtnetlink
/// handle for link/address/route/neighbour work plus a raw route-netlink
/// channel for traffic-control messages. Both sockets are opened while the
/// creating thread sits inside the target namespace, so every request they
/// ever carry is scoped to it.
#[derive(Clone)]
pub struct NetlinkClient {
    handle: Handle,
    raw: ConnectionHandle<RouteNetlinkMessage>,
}

impl std::fmt::Debug for NetlinkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("NetlinkClient")
    }
}

impl NetlinkClient {
    /// Connect in the caller's current namespace.
    pub fn connect() -> Result<Self> {
        let rt = tokio::runtime::Handle::current();
        Self::connect_with(&rt)
    }

    fn connect_with(rt: &tokio::runtime::Handle) -> Result<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        rt.spawn(conn);
        let (raw_conn, raw, _) =
            netlink_proto::new_connection::<RouteNetlinkMessage>(NETLINK_ROUTE)?;
        rt.spawn(raw_conn);
        Ok(NetlinkClient { handle, raw })
    }

    /// Connect inside an existing namespace.
    pub async fn connect_netns(netns: &NetnsFd) -> Result<Self> {
        let rt = tokio::runtime::Handle::current();
        let target = netns.try_clone()?;
        run_in_netns(target, move || Self::connect_with(&rt)).await
    }

    /// Create a fresh namespace, connect inside it, publish the configured
    /// address labels there, and hand both back.
    pub async fn connect_new(labels: Vec<AddrLabel>) -> Result<(Self, NetnsFd)> {
        let rt = tokio::runtime::Handle::current();
        let (ns, client) = run_in_new_netns(move |_| {
            let client = Self::connect_with(&rt)?;
            apply_addr_labels(&labels)?;
            Ok(client)
        })
        .await?;
        Ok((client, ns))
    }

    pub fn rtnl(&self) -> &Handle {
        &self.handle
    }

    /// Send one raw route-netlink request and collect the typed replies.
    /// Kernel NACKs are mapped to `NetError::Netlink` with the errno.
    pub(crate) async fn request(
        &self,
        message: RouteNetlinkMessage,
        flags: u16,
    ) -> Result<Vec<RouteNetlinkMessage>> {
        let mut req = NetlinkMessage::from(message);
        req.header.flags = flags;

        let mut raw = self.raw.clone();
        let mut response = raw
            .request(req, SocketAddr::new(0, 0))
            .map_err(|e| NetError::Unknown(format!("netlink request failed: {e}")))?;

        let mut replies = Vec::new();
        while let Some(msg) = response.next().await {
            match msg.payload {
                NetlinkPayload::InnerMessage(inner) => replies.push(inner),
                NetlinkPayload::Error(err) => {
                    if err.code.is_some() {
                        return Err(NetError::Netlink {
                            errno: -err.raw_code(),
                            msg: format!("{err:?}"),
                        });
                    }
                }
                NetlinkPayload::Done(_) => break,
                _ => {}
            }
        }
        Ok(replies)
    }

    // ------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------

    pub async fn dump_links(&self) -> Result<Vec<LinkMessage>> {
        let links = self.handle.link().get().execute();
        links.try_collect().await.map_err(NetError::from)
    }

    pub async fn link_by_name(&self, name: &str) -> Result<LinkMessage> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(link)) => Ok(link),
            Ok(None) => Err(NetError::NotFound(format!("link {name}"))),
            Err(e) => {
                let e = NetError::from(e);
                if e.is_enoent() {
                    Err(NetError::NotFound(format!("link {name}")))
                } else {
                    Err(e)
                }
            }
        }
    }

    pub async fn link_exists(&self, name: &str) -> Result<bool> {
        match self.link_by_name(name).await {
            Ok(_) => Ok(true),
            Err(NetError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn set_link_up(&self, index: u32) -> Result<()> {
        let msg = LinkMessageBuilder::<LinkUnspec>::new()
            .index(index)
            .up()
            .build();
        self.handle.link().set(msg).execute().await?;
        Ok(())
    }

    pub async fn set_link_mtu(&self, index: u32, mtu: u32) -> Result<()> {
        let mut msg = LinkMessage::default();
        msg.header.index = index;
        msg.attributes.push(LinkAttribute::Mtu(mtu));
        self.handle.link().set(msg).execute().await?;
        Ok(())
    }

    pub async fn del_link(&self, index: u32) -> Result<()> {
        self.handle.link().del(index).execute().await?;
        Ok(())
    }

    /// Attach `slave` under `master` (bridge enslavement).
    pub async fn enslave(&self, master: u32, slave: u32) -> Result<()> {
        let mut msg = LinkMessage::default();
        msg.header.index = slave;
        msg.attributes.push(LinkAttribute::Controller(master));
        self.handle.link().set(msg).execute().await?;
        Ok(())
    }

    /// Rename a link and move it into another namespace in one request.
    pub async fn change_ns(&self, index: u32, new_name: &str, netns: &NetnsFd) -> Result<()> {
        let mut msg = LinkMessage::default();
        msg.header.index = index;
        msg.attributes
            .push(LinkAttribute::IfName(new_name.to_string()));
        msg.attributes.push(LinkAttribute::NetNsFd(netns.raw_fd()));
        self.handle.link().set(msg).execute().await?;
        Ok(())
    }

    /// Create a veth pair: `name` lands inside `netns`, the peer stays in
    /// this client's namespace.
    pub async fn add_veth(
        &self,
        name: &str,
        peer: &str,
        hw: Option<[u8; 6]>,
        mtu: Option<u32>,
        group: u32,
        netns: &NetnsFd,
    ) -> Result<()> {
        let mut peer_msg = LinkMessage::default();
        peer_msg
            .attributes
            .push(LinkAttribute::IfName(peer.to_string()));

        let mut msg = LinkMessage::default();
        msg.attributes.push(LinkAttribute::IfName(name.to_string()));
        if let Some(hw) = hw {
            msg.attributes.push(LinkAttribute::Address(hw.to_vec()));
        }
        if let Some(mtu) = mtu {
            msg.attributes.push(LinkAttribute::Mtu(mtu));
        }
        if group != 0 {
            msg.attributes.push(LinkAttribute::Group(group));
        }
        msg.attributes.push(LinkAttribute::NetNsFd(netns.raw_fd()));
        msg.attributes.push(LinkAttribute::LinkInfo(vec![
            LinkInfo::Kind(InfoKind::Veth),
            LinkInfo::Data(InfoData::Veth(InfoVeth::Peer(peer_msg))),
        ]));

        debug!(name, peer, "adding veth pair");
        self.handle.link().add(msg).execute().await?;
        Ok(())
    }

    pub async fn add_macvlan(
        &self,
        name: &str,
        master: u32,
        mode: MacVlanMode,
        hw: Option<[u8; 6]>,
        mtu: Option<u32>,
    ) -> Result<()> {
        let mut msg = LinkMessage::default();
        msg.attributes.push(LinkAttribute::IfName(name.to_string()));
        msg.attributes.push(LinkAttribute::Link(master));
        if let Some(hw) = hw {
            msg.attributes.push(LinkAttribute::Address(hw.to_vec()));
        }
        if let Some(mtu) = mtu {
            msg.attributes.push(LinkAttribute::Mtu(mtu));
        }
        msg.attributes.push(LinkAttribute::LinkInfo(vec![
            LinkInfo::Kind(InfoKind::MacVlan),
            LinkInfo::Data(InfoData::MacVlan(vec![InfoMacVlan::Mode(mode)])),
        ]));

        debug!(name, master, "adding macvlan");
        self.handle.link().add(msg).execute().await?;
        Ok(())
    }

    pub async fn add_ipvlan(
        &self,
        name: &str,
        master: u32,
        mode: IpVlanMode,
        mtu: Option<u32>,
    ) -> Result<()> {
        let mut msg = LinkMessage::default();
        msg.attributes.push(LinkAttribute::IfName(name.to_string()));
        msg.attributes.push(LinkAttribute::Link(master));
        if let Some(mtu) = mtu {
            msg.attributes.push(LinkAttribute::Mtu(mtu));
        }
        msg.attributes.push(LinkAttribute::LinkInfo(vec![
            LinkInfo::Kind(InfoKind::IpVlan),
            LinkInfo::Data(InfoData::IpVlan(vec![InfoIpVlan::Mode(mode)])),
        ]));

        debug!(name, master, "adding ipvlan");
        self.handle.link().add(msg).execute().await?;
        Ok(())
    }

    /// Create an ipip6 tunnel (IPv4-in-IPv6, `ip6tnl` with proto ipip).
    pub async fn add_ipip6(
        &self,
        name: &str,
        remote: Ipv6Addr,
        local: Ipv6Addr,
        mtu: u32,
        encap_limit: u8,
        ttl: u8,
    ) -> Result<()> {
        let mut data = Vec::new();
        data.extend_from_slice(&nla(IFLA_IPTUN_LOCAL, &local.octets()));
        data.extend_from_slice(&nla(IFLA_IPTUN_REMOTE, &remote.octets()));
        data.extend_from_slice(&nla(IFLA_IPTUN_TTL, &[ttl]));
        data.extend_from_slice(&nla(IFLA_IPTUN_ENCAP_LIMIT, &[encap_limit]));
        data.extend_from_slice(&nla(IFLA_IPTUN_PROTO, &[libc::IPPROTO_IPIP as u8]));

        let mut msg = LinkMessage::default();
        msg.attributes.push(LinkAttribute::IfName(name.to_string()));
        msg.attributes.push(LinkAttribute::Mtu(mtu));
        msg.attributes.push(LinkAttribute::LinkInfo(vec![
            LinkInfo::Kind(InfoKind::Other("ip6tnl".to_string())),
            LinkInfo::Other(DefaultNla::new(IFLA_INFO_DATA, data)),
        ]));

        debug!(name, %remote, %local, "adding ipip6 tunnel");
        self.handle.link().add(msg).execute().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Addresses and routes
    // ------------------------------------------------------------------

    pub async fn add_address(&self, index: u32, addr: IpNetwork) -> Result<()> {
        self.handle
            .address()
            .add(index, addr.ip(), addr.prefix())
            .execute()
            .await?;
        Ok(())
    }

    pub async fn dump_addresses(&self) -> Result<Vec<AddressMessage>> {
        let addrs = self.handle.address().get().execute();
        addrs.try_collect().await.map_err(NetError::from)
    }

    /// Add a scope-link route to `dst` out of `index`.
    pub async fn add_direct_route(&self, index: u32, dst: IpNetwork) -> Result<()> {
        let msg = match dst {
            IpNetwork::V4(net) => RouteMessageBuilder::<Ipv4Addr>::new()
                .output_interface(index)
                .protocol(RouteProtocol::Boot)
                .scope(RouteScope::Link)
                .destination_prefix(net.network(), net.prefix())
                .build(),
            IpNetwork::V6(net) => RouteMessageBuilder::<Ipv6Addr>::new()
                .output_interface(index)
                .protocol(RouteProtocol::Boot)
                .scope(RouteScope::Link)
                .destination_prefix(net.network(), net.prefix())
                .build(),
        };
        self.handle.route().add(msg).execute().await?;
        Ok(())
    }

    /// Install a default route via `gw` out of `index`.
    pub async fn add_default_gw(&self, index: u32, gw: IpAddr) -> Result<()> {
        let msg = match gw {
            IpAddr::V4(v4) => RouteMessageBuilder::<Ipv4Addr>::new()
                .output_interface(index)
                .gateway(v4)
                .build(),
            IpAddr::V6(v6) => RouteMessageBuilder::<Ipv6Addr>::new()
                .output_interface(index)
                .gateway(v6)
                .build(),
        };
        self.handle.route().add(msg).execute().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Neighbours
    // ------------------------------------------------------------------

    /// Add or remove a proxy neighbour entry (proxy-NDP / proxy-ARP
    /// announcement) for `addr` on device `index`.
    pub async fn proxy_neighbour(&self, index: u32, addr: IpAddr, add: bool) -> Result<()> {
        if add {
            let mut req = self.handle.neighbours().add(index, addr);
            req.message_mut()
                .header
                .flags
                .insert(NeighbourFlags::Proxy);
            req.message_mut().header.state = NeighbourState::Permanent;
            req.execute().await?;
        } else {
            let mut msg = NeighbourMessage::default();
            msg.header.ifindex = index;
            msg.header.family = match addr {
                IpAddr::V4(_) => netlink_packet_route::AddressFamily::Inet,
                IpAddr::V6(_) => netlink_packet_route::AddressFamily::Inet6,
            };
            msg.header.flags.insert(NeighbourFlags::Proxy);
            msg.attributes
                .push(NeighbourAttribute::Destination(neighbour_address(addr)));
            match self.handle.neighbours().del(msg).execute().await {
                Ok(()) => {}
                Err(e) => {
                    let e = NetError::from(e);
                    if !e.is_enoent() {
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Install a permanent neighbour entry mapping `addr` to `lladdr`.
    pub async fn permanent_neighbour(&self, index: u32, addr: IpAddr, lladdr: &[u8]) -> Result<()> {
        let mut req = self
            .handle
            .neighbours()
            .add(index, addr)
            .link_local_address(lladdr);
        req.message_mut().header.state = NeighbourState::Permanent;
        req.execute().await?;
        Ok(())
    }
}

/// Hardware address reported in a link message, if any.
pub fn link_address(msg: &LinkMessage) -> Vec<u8> {
    for attr in &msg.attributes {
        if let LinkAttribute::Address(bytes) = attr {
            return bytes.clone();
        }
    }
    Vec::new()
}

fn neighbour_address(addr: IpAddr) -> NeighbourAddress {
    match addr {
        IpAddr::V4(v4) => NeighbourAddress::Inet(v4),
        IpAddr::V6(v6) => NeighbourAddress::Inet6(v6),
    }
}

/// Request flags for create-or-replace object installs.
pub(crate) const fn replace_flags() -> u16 {
    NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE
}

/// Encode one netlink attribute with 4-byte alignment.
pub(crate) fn nla(kind: u16, payload: &[u8]) -> Vec<u8> {
    let len = 4 + payload.len();
    let mut out = Vec::with_capacity((len + 3) & !3);
    out.extend_from_slice(&(len as u16).to_ne_bytes());
    out.extend_from_slice(&kind.to_ne_bytes());
    out.extend_from_slice(payload);
    while out.len() % 4 != 0 {
        out.push(0);
    }
    out
}

/// `AA:BB:..` rendering of a raw hardware address.
pub fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse a colon-separated 48-bit hardware address.
pub fn parse_mac(text: &str) -> Result<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut count = 0;
    for part in text.split(':') {
        if count == 6 || part.len() != 2 {
            return Err(NetError::InvalidValue(format!("invalid mac {text}")));
        }
        out[count] = u8::from_str_radix(part, 16)
            .map_err(|_| NetError::InvalidValue(format!("invalid mac {text}")))?;
        count += 1;
    }
    if count != 6 {
        return Err(NetError::InvalidValue(format!("invalid mac {text}")));
    }
    Ok(out)
}

pub fn valid_mac(text: &str) -> bool {
    parse_mac(text).is_ok()
}

pub fn parse_macvlan_mode(text: &str) -> Result<MacVlanMode> {
    match text {
        "private" => Ok(MacVlanMode::Private),
        "vepa" => Ok(MacVlanMode::Vepa),
        "bridge" => Ok(MacVlanMode::Bridge),
        "passthru" => Ok(MacVlanMode::Passthrough),
        other => Err(NetError::InvalidValue(format!(
            "invalid macvlan type {other}"
        ))),
    }
}

pub fn parse_ipvlan_mode(text: &str) -> Result<IpVlanMode> {
    match text {
        "l2" => Ok(IpVlanMode::L2),
        "l3" => Ok(IpVlanMode::L3),
        "l3s" => Ok(IpVlanMode::L3S),
        other => Err(NetError::InvalidValue(format!(
            "invalid ipvlan mode {other}"
        ))),
    }
}

/// RTM_NEWADDRLABEL is not modeled by the route packet crate; frame it by
/// hand on a short-lived blocking socket in the caller's namespace.
pub fn apply_addr_labels(labels: &[AddrLabel]) -> Result<()> {
    if labels.is_empty() {
        return Ok(());
    }

    const RTM_NEWADDRLABEL: u16 = 72;
    const IFAL_ADDRESS: u16 = 1;
    const IFAL_LABEL: u16 = 2;

    let socket = netlink_sys::Socket::new(NETLINK_ROUTE)?;
    socket.connect(&SocketAddr::new(0, 0))?;

    for (seq, label) in labels.iter().enumerate() {
        let prefix: IpNetwork = label
            .prefix
            .parse()
            .map_err(|_| NetError::InvalidValue(format!("invalid addrlabel {}", label.prefix)))?;
        let (family, addr_bytes): (u8, Vec<u8>) = match prefix {
            IpNetwork::V4(net) => (libc::AF_INET as u8, net.ip().octets().to_vec()),
            IpNetwork::V6(net) => (libc::AF_INET6 as u8, net.ip().octets().to_vec()),
        };

        let mut payload = Vec::new();
        // struct ifaddrlblmsg
        payload.push(family);
        payload.push(0);
        payload.push(prefix.prefix());
        payload.push(0);
        payload.extend_from_slice(&0u32.to_ne_bytes()); // ifindex
        payload.extend_from_slice(&0u32.to_ne_bytes()); // seq
        payload.extend_from_slice(&nla(IFAL_ADDRESS, &addr_bytes));
        payload.extend_from_slice(&nla(IFAL_LABEL, &label.label.to_ne_bytes()));

        let mut msg = Vec::with_capacity(16 + payload.len());
        msg.extend_from_slice(&((16 + payload.len()) as u32).to_ne_bytes());
        msg.extend_from_slice(&RTM_NEWADDRLABEL.to_ne_bytes());
        msg.extend_from_slice(&replace_flags().to_ne_bytes());
        msg.extend_from_slice(&(seq as u32 + 1).to_ne_bytes());
        msg.extend_from_slice(&0u32.to_ne_bytes()); // port
        msg.extend_from_slice(&payload);

        socket.send(&msg, 0)?;

        let mut reply: Vec<u8> = Vec::with_capacity(4096);
        socket.recv(&mut reply, 0)?;
        // nlmsghdr + nlmsgerr: error code at offset 16
        if reply.len() >= 20 {
            let code = i32::from_ne_bytes([reply[16], reply[17], reply[18], reply[19]]);
            if code != 0 {
                return Err(NetError::Netlink {
                    errno: -code,
                    msg: format!("addrlabel {} rejected", label.prefix),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_round_trip() {
        let mac = parse_mac("02:00:aB:00:00:01").unwrap();
        assert_eq!(mac, [0x02, 0x00, 0xab, 0x00, 0x00, 0x01]);
        assert_eq!(format_mac(&mac), "02:00:AB:00:00:01");
    }

    #[test]
    fn mac_validation() {
        assert!(valid_mac("02:00:00:00:00:01"));
        assert!(!valid_mac("02:00:00:00:00"));
        assert!(!valid_mac("02:00:00:00:00:01:02"));
        assert!(!valid_mac("02:00:00:00:00:zz"));
        assert!(!valid_mac("0200:00:00:00:01"));
    }

    #[test]
    fn vlan_mode_parsing() {
        assert!(matches!(
            parse_macvlan_mode("bridge"),
            Ok(MacVlanMode::Bridge)
        ));
        assert!(parse_macvlan_mode("loop").is_err());
        assert!(matches!(parse_ipvlan_mode("l2"), Ok(IpVlanMode::L2)));
        assert!(parse_ipvlan_mode("l4").is_err());
    }

    #[test]
    fn nla_alignment_and_header() {
        let attr = nla(7, &[1, 2, 3]);
        assert_eq!(attr.len(), 8);
        assert_eq!(u16::from_ne_bytes([attr[0], attr[1]]), 7); // len excludes padding
        assert_eq!(u16::from_ne_bytes([attr[2], attr[3]]), 7); // kind
        assert_eq!(&attr[4..7], &[1, 2, 3]);
        assert_eq!(attr[7], 0);

        let attr = nla(1, &[0u8; 4]);
        assert_eq!(attr.len(), 8);
        assert_eq!(u16::from_ne_bytes([attr[0], attr[1]]), 8);
    }
}
