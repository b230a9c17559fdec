use std::net::{IpAddr, Ipv6Addr};
use std::path::Path;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use tracing::{info, warn};

use crate::config::NetworkConfig;
use crate::container::{ContainerNet, ContainerTree};
use crate::net::{Network, device_index};
use crate::netlink::{
    NetlinkClient, link_address, parse_ipvlan_mode, parse_mac, parse_macvlan_mode, valid_mac,
};
use crate::netns::{NETNS_RUN_DIR, NetnsFd};
use crate::registry::NetRegistry;
use crate::{NetError, Result};

/// ETH_DATA_LEN - sizeof(struct ip6_hdr) - 8: payload left for IPv4 inside
/// an encap-limited ipip6 tunnel.
const IPIP6_MTU: u32 = 1500 - 40 - 8;

/// Multi-value property: one tuple per declared item.
pub type MultiTuple = Vec<Vec<String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacVlanCfg {
    pub master: String,
    pub name: String,
    pub mode: String,
    pub mtu: Option<u32>,
    pub hw: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpVlanCfg {
    pub master: String,
    pub name: String,
    pub mode: String,
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethCfg {
    pub name: String,
    pub bridge: String,
    pub mtu: Option<u32>,
    pub hw: Option<String>,
    /// Host-side peer, named at parse time from the container id.
    pub peer: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L3Cfg {
    pub name: String,
    pub master: Option<String>,
    pub nat: bool,
    pub mtu: Option<u32>,
    pub group: u32,
    pub addrs: Vec<IpNetwork>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpIp6Cfg {
    pub name: String,
    pub remote: Ipv6Addr,
    pub local: Ipv6Addr,
    pub mtu: u32,
    pub ttl: u8,
    pub encap_limit: u8,
    pub default_route: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceAddr {
    pub iface: String,
    pub addr: IpNetwork,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceGw {
    pub iface: String,
    pub addr: IpAddr,
}

/// Declarative network recipe of one container: parsed from the `net`,
/// `ip` and `gw` properties, then driven through namespace construction.
#[derive(Debug, Clone, PartialEq)]
pub struct NetCfg {
    pub id: u64,
    pub hostname: String,

    pub new_netns: bool,
    pub inherited: bool,
    pub l3_only: bool,
    /// Bring devices up even when no address or gateway references them.
    pub net_up: bool,

    pub steal: Vec<String>,
    pub macvlan: Vec<MacVlanCfg>,
    pub ipvlan: Vec<IpVlanCfg>,
    pub veth: Vec<VethCfg>,
    pub l3: Vec<L3Cfg>,
    pub ipip6: Vec<IpIp6Cfg>,
    pub autoconf: Vec<String>,
    pub netns_name: Option<String>,
    pub net_ct_name: Option<String>,

    pub ip: Vec<IfaceAddr>,
    pub gw: Vec<IfaceGw>,
    /// NAT allocation changed the `ip` property; the caller must persist it.
    pub save_ip: bool,
}

/// Collaborators injected from the composition root.
pub struct NetEnv {
    pub config: Arc<NetworkConfig>,
    pub registry: Arc<NetRegistry>,
    pub tree: Arc<dyn ContainerTree>,
}

fn invalid(what: &str, settings: &[String]) -> NetError {
    NetError::InvalidValue(format!("invalid {what} in: {}", settings.join(" ")))
}

impl NetCfg {
    pub fn new(id: u64, hostname: impl Into<String>) -> Self {
        NetCfg {
            id,
            hostname: hostname.into(),
            new_netns: true,
            inherited: false,
            l3_only: true,
            net_up: false,
            steal: Vec::new(),
            macvlan: Vec::new(),
            ipvlan: Vec::new(),
            veth: Vec::new(),
            l3: Vec::new(),
            ipip6: Vec::new(),
            autoconf: Vec::new(),
            netns_name: None,
            net_ct_name: None,
            ip: Vec::new(),
            gw: Vec::new(),
            save_ip: false,
        }
    }

    fn reset(&mut self) {
        let id = self.id;
        let hostname = std::mem::take(&mut self.hostname);
        let ip = std::mem::take(&mut self.ip);
        let gw = std::mem::take(&mut self.gw);
        *self = NetCfg::new(id, hostname);
        self.ip = ip;
        self.gw = gw;
    }

    // ------------------------------------------------------------------
    // Parsing and formatting
    // ------------------------------------------------------------------

    pub fn parse_net(&mut self, tuples: &MultiTuple, cfg: &NetworkConfig) -> Result<()> {
        self.reset();

        if tuples.is_empty() {
            return Err(NetError::InvalidValue(
                "configuration is not specified".into(),
            ));
        }

        let mut none = false;
        let mut veth_idx = 0u64;

        for settings in tuples {
            let Some(first) = settings.first() else {
                return Err(invalid("net", settings));
            };
            let mut kind = first.trim();
            if kind == "host" && settings.len() == 1 {
                kind = "inherited";
            }

            match kind {
                "none" => none = true,
                "inherited" => {
                    self.new_netns = false;
                    self.inherited = true;
                }
                // "host <device>" is the legacy spelling of steal
                "steal" | "host" => {
                    if settings.len() != 2 {
                        return Err(invalid("net", settings));
                    }
                    self.l3_only = false;
                    self.steal.push(settings[1].trim().to_string());
                }
                "container" => {
                    if settings.len() != 2 {
                        return Err(invalid("net", settings));
                    }
                    self.new_netns = false;
                    self.l3_only = false;
                    self.net_ct_name = Some(settings[1].trim().to_string());
                }
                "macvlan" => {
                    if settings.len() < 3 {
                        return Err(invalid("macvlan", settings));
                    }
                    let mut mvlan = MacVlanCfg {
                        master: settings[1].trim().to_string(),
                        name: settings[2].trim().to_string(),
                        mode: "bridge".to_string(),
                        mtu: None,
                        hw: None,
                    };
                    if settings.len() > 3 {
                        let mode = settings[3].trim();
                        parse_macvlan_mode(mode)?;
                        mvlan.mode = mode.to_string();
                    }
                    if settings.len() > 4 {
                        mvlan.mtu = Some(settings[4].trim().parse().map_err(|_| {
                            NetError::InvalidValue(format!("invalid macvlan mtu {}", settings[4]))
                        })?);
                    }
                    if settings.len() > 5 {
                        let hw = settings[5].trim();
                        if !valid_mac(hw) {
                            return Err(NetError::InvalidValue(format!(
                                "invalid macvlan address {hw}"
                            )));
                        }
                        mvlan.hw = Some(hw.to_string());
                    }
                    self.l3_only = false;
                    self.macvlan.push(mvlan);
                }
                "ipvlan" => {
                    if settings.len() < 3 {
                        return Err(invalid("ipvlan", settings));
                    }
                    let mut ipvlan = IpVlanCfg {
                        master: settings[1].trim().to_string(),
                        name: settings[2].trim().to_string(),
                        mode: "l2".to_string(),
                        mtu: None,
                    };
                    if settings.len() > 3 {
                        let mode = settings[3].trim();
                        parse_ipvlan_mode(mode)?;
                        ipvlan.mode = mode.to_string();
                    }
                    if settings.len() > 4 {
                        ipvlan.mtu = Some(settings[4].trim().parse().map_err(|_| {
                            NetError::InvalidValue(format!("invalid ipvlan mtu {}", settings[4]))
                        })?);
                    }
                    self.l3_only = false;
                    self.ipvlan.push(ipvlan);
                }
                "veth" => {
                    if settings.len() < 3 {
                        return Err(invalid("veth", settings));
                    }
                    let mut veth = VethCfg {
                        name: settings[1].trim().to_string(),
                        bridge: settings[2].trim().to_string(),
                        mtu: None,
                        hw: None,
                        peer: format!("portove-{}-{}", self.id, veth_idx),
                    };
                    veth_idx += 1;
                    if settings.len() > 3 {
                        veth.mtu = Some(settings[3].trim().parse().map_err(|_| {
                            NetError::InvalidValue(format!("invalid veth mtu {}", settings[3]))
                        })?);
                    }
                    if settings.len() > 4 {
                        let hw = settings[4].trim();
                        if !valid_mac(hw) {
                            return Err(NetError::InvalidValue(format!(
                                "invalid veth address {hw}"
                            )));
                        }
                        veth.hw = Some(hw.to_string());
                    }
                    self.l3_only = false;
                    self.veth.push(veth);
                }
                "L3" => {
                    let mut l3 = L3Cfg {
                        name: "eth0".to_string(),
                        master: None,
                        nat: false,
                        mtu: None,
                        group: 0,
                        addrs: Vec::new(),
                    };
                    if settings.len() > 1 {
                        l3.name = settings[1].trim().to_string();
                    }
                    if settings.len() > 2 {
                        l3.master = Some(settings[2].trim().to_string());
                    }
                    self.l3.push(l3);
                }
                "NAT" => {
                    let mut nat = L3Cfg {
                        name: "eth0".to_string(),
                        master: None,
                        nat: true,
                        mtu: None,
                        group: 0,
                        addrs: Vec::new(),
                    };
                    if settings.len() > 1 {
                        nat.name = settings[1].trim().to_string();
                    }
                    self.l3.push(nat);
                }
                "ipip6" => {
                    if settings.len() != 4 {
                        return Err(invalid("ipip6", settings));
                    }
                    let name = settings[1].trim().to_string();
                    if name == "ip6tnl0" {
                        return Err(NetError::InvalidValue(
                            "cannot modify default fallback tunnel".into(),
                        ));
                    }
                    let remote: Ipv6Addr = settings[2].trim().parse().map_err(|_| {
                        NetError::InvalidValue(format!("invalid ipip6 remote {}", settings[2]))
                    })?;
                    let local: Ipv6Addr = settings[3].trim().parse().map_err(|_| {
                        NetError::InvalidValue(format!("invalid ipip6 local {}", settings[3]))
                    })?;
                    self.ipip6.push(IpIp6Cfg {
                        name,
                        remote,
                        local,
                        mtu: IPIP6_MTU,
                        ttl: cfg.ipip6_ttl,
                        encap_limit: cfg.ipip6_encap_limit,
                        default_route: false,
                    });
                }
                "MTU" => {
                    if settings.len() != 3 {
                        return Err(invalid("MTU", settings));
                    }
                    let name = settings[1].trim();
                    let mtu: u32 = settings[2].trim().parse().map_err(|_| {
                        NetError::InvalidValue(format!("invalid MTU {}", settings[2]))
                    })?;
                    self.set_mtu(name, mtu)?;
                }
                "autoconf" => {
                    if settings.len() != 2 {
                        return Err(invalid("autoconf", settings));
                    }
                    self.autoconf.push(settings[1].trim().to_string());
                }
                "netns" => {
                    if settings.len() != 2 {
                        return Err(invalid("netns", settings));
                    }
                    let name = settings[1].trim().to_string();
                    if !Path::new(NETNS_RUN_DIR).join(&name).exists() {
                        return Err(NetError::InvalidValue(format!(
                            "net namespace not found: {name}"
                        )));
                    }
                    self.new_netns = false;
                    self.l3_only = false;
                    self.netns_name = Some(name);
                }
                _ => {
                    return Err(NetError::InvalidValue(
                        "configuration is not specified".into(),
                    ));
                }
            }
        }

        let single = none as usize + self.inherited as usize;
        let mixed = self.steal.len()
            + self.macvlan.len()
            + self.ipvlan.len()
            + self.veth.len()
            + self.l3.len()
            + self.ipip6.len();

        if single > 1 || (single == 1 && mixed > 0) {
            return Err(NetError::InvalidValue(
                "none/host/inherited can't be mixed with other types".into(),
            ));
        }

        self.net_up = mixed > 0;

        Ok(())
    }

    fn set_mtu(&mut self, name: &str, mtu: u32) -> Result<()> {
        if let Some(link) = self.l3.iter_mut().find(|l| l.name == name) {
            link.mtu = Some(mtu);
            return Ok(());
        }
        if let Some(link) = self.veth.iter_mut().find(|l| l.name == name) {
            link.mtu = Some(mtu);
            return Ok(());
        }
        if let Some(link) = self.macvlan.iter_mut().find(|l| l.name == name) {
            link.mtu = Some(mtu);
            return Ok(());
        }
        if let Some(link) = self.ipvlan.iter_mut().find(|l| l.name == name) {
            link.mtu = Some(mtu);
            return Ok(());
        }
        if let Some(link) = self.ipip6.iter_mut().find(|l| l.name == name) {
            link.mtu = mtu;
            return Ok(());
        }
        Err(NetError::InvalidValue(format!("link not found: {name}")))
    }

    pub fn format_net(&self) -> MultiTuple {
        let mut tuples = MultiTuple::new();

        if self.inherited {
            tuples.push(vec!["inherited".into()]);
        }
        for dev in &self.steal {
            tuples.push(vec!["steal".into(), dev.clone()]);
        }
        for mvlan in &self.macvlan {
            let mut tuple = vec![
                "macvlan".into(),
                mvlan.master.clone(),
                mvlan.name.clone(),
                mvlan.mode.clone(),
            ];
            if let Some(mtu) = mvlan.mtu {
                tuple.push(mtu.to_string());
                if let Some(hw) = &mvlan.hw {
                    tuple.push(hw.clone());
                }
            }
            tuples.push(tuple);
        }
        for ipvlan in &self.ipvlan {
            let mut tuple = vec![
                "ipvlan".into(),
                ipvlan.master.clone(),
                ipvlan.name.clone(),
                ipvlan.mode.clone(),
            ];
            if let Some(mtu) = ipvlan.mtu {
                tuple.push(mtu.to_string());
            }
            tuples.push(tuple);
        }
        for veth in &self.veth {
            let mut tuple = vec!["veth".into(), veth.name.clone(), veth.bridge.clone()];
            if let Some(mtu) = veth.mtu {
                tuple.push(mtu.to_string());
                if let Some(hw) = &veth.hw {
                    tuple.push(hw.clone());
                }
            }
            tuples.push(tuple);
        }
        for l3 in &self.l3 {
            let mut tuple = vec![if l3.nat { "NAT" } else { "L3" }.to_string()];
            tuple.push(l3.name.clone());
            if let Some(master) = &l3.master {
                tuple.push(master.clone());
            }
            tuples.push(tuple);
            if let Some(mtu) = l3.mtu {
                tuples.push(vec!["MTU".into(), l3.name.clone(), mtu.to_string()]);
            }
        }
        for tunnel in &self.ipip6 {
            tuples.push(vec![
                "ipip6".into(),
                tunnel.name.clone(),
                tunnel.remote.to_string(),
                tunnel.local.to_string(),
            ]);
            if tunnel.mtu != IPIP6_MTU {
                tuples.push(vec!["MTU".into(), tunnel.name.clone(), tunnel.mtu.to_string()]);
            }
        }
        for dev in &self.autoconf {
            tuples.push(vec!["autoconf".into(), dev.clone()]);
        }
        if let Some(name) = &self.netns_name {
            tuples.push(vec!["netns".into(), name.clone()]);
        }
        if let Some(name) = &self.net_ct_name {
            tuples.push(vec!["container".into(), name.clone()]);
        }

        if tuples.is_empty() {
            tuples.push(vec!["none".into()]);
        }
        tuples
    }

    pub fn parse_ip(&mut self, tuples: &MultiTuple) -> Result<()> {
        self.ip.clear();
        for settings in tuples {
            if settings.len() != 2 {
                return Err(invalid("ip address/prefix", settings));
            }
            let iface = settings[0].trim().to_string();
            let addr: IpNetwork = settings[1].trim().parse().map_err(|_| {
                NetError::InvalidValue(format!("invalid address {}", settings[1]))
            })?;

            for l3 in self.l3.iter_mut().filter(|l| l.name == iface) {
                if !is_host_addr(&addr) {
                    return Err(NetError::InvalidValue(
                        "invalid ip prefix for L3 network".into(),
                    ));
                }
                l3.addrs.push(addr);
            }
            for tunnel in self.ipip6.iter_mut().filter(|t| t.name == iface) {
                tunnel.default_route = is_host_addr(&addr);
            }

            self.ip.push(IfaceAddr { iface, addr });
        }
        Ok(())
    }

    pub fn format_ip(&self) -> MultiTuple {
        self.ip
            .iter()
            .map(|ip| vec![ip.iface.clone(), ip.addr.to_string()])
            .collect()
    }

    pub fn parse_gw(&mut self, tuples: &MultiTuple) -> Result<()> {
        self.gw.clear();
        for settings in tuples {
            if settings.len() != 2 {
                return Err(invalid("gateway address", settings));
            }
            let addr: IpAddr = settings[1].trim().parse().map_err(|_| {
                NetError::InvalidValue(format!("invalid gateway {}", settings[1]))
            })?;
            self.gw.push(IfaceGw {
                iface: settings[0].trim().to_string(),
                addr,
            });
        }
        Ok(())
    }

    pub fn format_gw(&self) -> MultiTuple {
        self.gw
            .iter()
            .map(|gw| vec![gw.iface.clone(), gw.addr.to_string()])
            .collect()
    }

    /// Stable `02:..` hardware address derived from names and hostname.
    pub fn generate_hw(&self, name: &str) -> String {
        let n = crc32(name.as_bytes());
        let h = crc32(self.hostname.as_bytes());
        format!(
            "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            n & 0xff,
            (h >> 24) & 0xff,
            (h >> 16) & 0xff,
            (h >> 8) & 0xff,
            h & 0xff,
        )
    }

    // ------------------------------------------------------------------
    // Namespace construction
    // ------------------------------------------------------------------

    /// Build or resolve the namespace and network handle this recipe
    /// describes.
    pub async fn prepare_network(
        &mut self,
        env: &NetEnv,
        parent: Option<&Arc<ContainerNet>>,
    ) -> Result<(Arc<Network>, Arc<NetnsFd>)> {
        if self.new_netns
            && self.l3_only
            && env.config.l3_migration_hack
            && !self.l3.is_empty()
            && !self.l3[0].addrs.is_empty()
        {
            if let Some(shared) = self.reuse_l3_network(env).await {
                return Ok(shared);
            }
        }

        if self.new_netns {
            let (client, netns) =
                NetlinkClient::connect_new(env.config.addrlabel.clone()).await?;
            let netns = Arc::new(netns);
            let net = Network::new_managed(client, env.config.clone(), netns.inode());

            if let Err(e) = self.configure_interfaces(env, &net, &netns).await {
                let _ = self.destroy_network(env).await;
                return Err(e);
            }

            env.registry.insert(&net);
            return Ok((net, netns));
        }

        if self.inherited {
            let parent = parent.ok_or_else(|| {
                NetError::InvalidValue("no parent network to inherit".into())
            })?;
            let params = parent.params.lock().await;
            let (net, netns) = params
                .net
                .clone()
                .zip(params.netns.clone())
                .ok_or_else(|| NetError::Unknown("parent network not prepared".into()))?;
            return Ok((net, netns));
        }

        if let Some(name) = self.netns_name.clone() {
            let netns = Arc::new(NetnsFd::open_name(&name)?);
            if let Some(net) = env.registry.get(netns.inode()) {
                return Ok((net, netns));
            }
            let client = NetlinkClient::connect_netns(&netns).await?;
            let net = Network::new(client, env.config.clone(), netns.inode());
            {
                let mut st = net.lock().await;
                net.refresh_devices(&mut st, false).await?;
                st.new_managed = false;
            }
            env.registry.insert(&net);
            return Ok((net, netns));
        }

        if let Some(name) = self.net_ct_name.clone() {
            for ct in env.tree.subtree() {
                if ct.name != name {
                    continue;
                }
                let params = ct.params.lock().await;
                return params
                    .net
                    .clone()
                    .zip(params.netns.clone())
                    .ok_or_else(|| {
                        NetError::Unknown(format!("net container {name} not prepared"))
                    });
            }
            return Err(NetError::NotFound(format!("net container {name}")));
        }

        Err(NetError::InvalidValue("configuration is not specified".into()))
    }

    /// L3 migration fast path: reuse the network of a container that
    /// already holds the first requested address. Assumes that container's
    /// addressing is still valid; gated by `l3_migration_hack`.
    async fn reuse_l3_network(&self, env: &NetEnv) -> Option<(Arc<Network>, Arc<NetnsFd>)> {
        let target = self.l3[0].addrs[0];
        for ct in env.tree.subtree() {
            let params = ct.params.lock().await;
            let (Some(net), Some(netns)) = (params.net.clone(), params.netns.clone()) else {
                continue;
            };
            if params.addresses.iter().any(|a| a.ip() == target.ip()) {
                info!(container = %ct.name, addr = %target, "reusing L3 network");
                return Some((net, netns));
            }
        }
        None
    }

    /// Bootstrap the host network in the caller's namespace. The root
    /// container's limit/guarantee maps mirror host device rates.
    pub async fn prepare_host(
        env: &NetEnv,
        root_ct: &Arc<ContainerNet>,
    ) -> Result<(Arc<Network>, Arc<NetnsFd>)> {
        let client = NetlinkClient::connect()?;
        let netns = Arc::new(NetnsFd::current()?);
        let net = Network::new_host(client, env.config.clone(), netns.inode(), root_ct.clone());

        {
            let mut st = net.lock().await;
            net.refresh_devices(&mut st, false).await?;
            st.new_managed = false;
        }

        env.registry.insert(&net);
        env.registry.set_host(net.clone());
        root_ct.attach(net.clone(), netns.clone()).await;
        Ok((net, netns))
    }

    async fn configure_interfaces(
        &mut self,
        env: &NetEnv,
        net: &Arc<Network>,
        netns: &Arc<NetnsFd>,
    ) -> Result<()> {
        let parent_net = env
            .registry
            .host()
            .ok_or_else(|| NetError::Unknown("host network not prepared".into()))?;
        let mut links: Vec<String> = Vec::new();

        {
            let mut pst = parent_net.lock().await;
            let pclient = parent_net.client();

            for dev in &self.steal {
                let link = pclient.link_by_name(dev).await?;
                pclient.change_ns(link.header.index, dev, netns).await?;
                links.push(dev.clone());
            }

            for ipvlan in &self.ipvlan {
                let master = Network::match_device(&pst, &ipvlan.master);
                let midx = pclient.link_by_name(&master).await?.header.index;
                let tmp = parent_net.new_device_name(&mut pst, "piv").await;

                pclient
                    .add_ipvlan(&tmp, midx, parse_ipvlan_mode(&ipvlan.mode)?, ipvlan.mtu)
                    .await?;
                let idx = pclient.link_by_name(&tmp).await?.header.index;
                if let Err(e) = pclient.change_ns(idx, &ipvlan.name, netns).await {
                    let _ = pclient.del_link(idx).await;
                    return Err(e);
                }
                links.push(ipvlan.name.clone());
            }

            for mvlan in &self.macvlan {
                let master = Network::match_device(&pst, &mvlan.master);
                let midx = pclient.link_by_name(&master).await?.header.index;
                let tmp = parent_net.new_device_name(&mut pst, "pmv").await;

                let hw = match &mvlan.hw {
                    Some(hw) => Some(parse_mac(hw)?),
                    None if !self.hostname.is_empty() => {
                        Some(parse_mac(&self.generate_hw(&format!("{master}{}", mvlan.name)))?)
                    }
                    None => None,
                };
                pclient
                    .add_macvlan(&tmp, midx, parse_macvlan_mode(&mvlan.mode)?, hw, mvlan.mtu)
                    .await?;
                let idx = pclient.link_by_name(&tmp).await?.header.index;
                if let Err(e) = pclient.change_ns(idx, &mvlan.name, netns).await {
                    let _ = pclient.del_link(idx).await;
                    return Err(e);
                }
                links.push(mvlan.name.clone());
            }

            for veth in &self.veth {
                let hw = match &veth.hw {
                    Some(hw) => Some(parse_mac(hw)?),
                    None if !self.hostname.is_empty() => Some(parse_mac(
                        &self.generate_hw(&format!("{}{}", veth.name, veth.peer)),
                    )?),
                    None => None,
                };
                pclient
                    .add_veth(&veth.name, &veth.peer, hw, veth.mtu, 0, netns)
                    .await?;

                if !veth.bridge.is_empty() {
                    let bridge = pclient.link_by_name(&veth.bridge).await?;
                    let peer = pclient.link_by_name(&veth.peer).await?;
                    pclient
                        .enslave(bridge.header.index, peer.header.index)
                        .await?;
                }
                links.push(veth.name.clone());
            }
        }

        let mut l3lan = std::mem::take(&mut self.l3);
        let mut l3_result = Ok(());
        for l3 in &mut l3lan {
            l3_result = self.configure_l3(env, net, netns, l3).await;
            if l3_result.is_err() {
                break;
            }
            links.push(l3.name.clone());
        }
        self.l3 = l3lan;
        l3_result?;

        for tunnel in &self.ipip6 {
            net.client()
                .add_ipip6(
                    &tunnel.name,
                    tunnel.remote,
                    tunnel.local,
                    tunnel.mtu,
                    tunnel.encap_limit,
                    tunnel.ttl,
                )
                .await?;
            links.push(tunnel.name.clone());
        }

        let loopback = net.client().link_by_name("lo").await?;
        net.client().set_link_up(loopback.header.index).await?;

        let mut st = net.lock().await;
        net.refresh_devices(&mut st, false).await?;
        st.new_managed = false;

        for name in &links {
            if device_index(&st, name).is_none() {
                return Err(NetError::Unknown(format!(
                    "network device {name} not found"
                )));
            }
        }

        let devices: Vec<(u32, String)> = st
            .devices
            .iter()
            .map(|d| (d.index, d.name.clone()))
            .collect();

        for (idx, name) in devices {
            if !self.net_up {
                let referenced = self.ip.iter().any(|ip| ip.iface == name)
                    || self.gw.iter().any(|gw| gw.iface == name)
                    || self.autoconf.contains(&name);
                if !referenced {
                    continue;
                }
            }

            net.client().set_link_up(idx).await?;

            for ip in self.ip.iter().filter(|ip| ip.iface == name) {
                net.client().add_address(idx, ip.addr).await?;
            }
            for gw in self.gw.iter().filter(|gw| gw.iface == name) {
                net.client().add_default_gw(idx, gw.addr).await?;
            }
        }

        for tunnel in self.ipip6.iter().filter(|t| t.default_route) {
            if let Some(idx) = device_index(&st, &tunnel.name) {
                let any: IpNetwork = "0.0.0.0/0"
                    .parse()
                    .map_err(|_| NetError::Unknown("default route prefix".into()))?;
                net.client().add_direct_route(idx, any).await?;
            }
        }

        Ok(())
    }

    /// Create the host-side L3 veth, elect gateways, wire neighbour
    /// entries and routes in both directions, and publish announces.
    async fn configure_l3(
        &mut self,
        env: &NetEnv,
        net: &Arc<Network>,
        netns: &Arc<NetnsFd>,
        l3: &mut L3Cfg,
    ) -> Result<()> {
        let host = env
            .registry
            .host()
            .ok_or_else(|| NetError::Unknown("host network not prepared".into()))?;
        let mut hst = host.lock().await;

        let peer_name = host.new_device_name(&mut hst, "L3-").await;

        if l3.nat && l3.addrs.is_empty() {
            l3.addrs = host.get_nat_address(&mut hst).await?;
            for addr in &l3.addrs {
                self.ip.push(IfaceAddr {
                    iface: l3.name.clone(),
                    addr: *addr,
                });
            }
            self.save_ip = true;
        }

        let gate = host.get_gate_address(&l3.addrs).await?;
        for addr in &l3.addrs {
            match addr {
                IpNetwork::V4(_) if gate.gate4.is_none() => {
                    return Err(NetError::InvalidValue("ipv4 gateway not found".into()));
                }
                IpNetwork::V6(_) if gate.gate6.is_none() => {
                    return Err(NetError::InvalidValue("ipv6 gateway not found".into()));
                }
                _ => {}
            }
        }

        if l3.mtu.is_none() && gate.mtu != 0 {
            l3.mtu = Some(gate.mtu);
        }
        if l3.group == 0 {
            l3.group = gate.group;
        }

        host.client()
            .add_veth(&l3.name, &peer_name, None, l3.mtu, l3.group, netns)
            .await?;

        let peer = host.client().link_by_name(&peer_name).await?;
        let peer_hw = link_address(&peer);

        let link = net.client().link_by_name(&l3.name).await?;
        let idx = link.header.index;
        net.client().set_link_up(idx).await?;

        if let Some(gate4) = gate.gate4 {
            let gate4 = IpAddr::V4(gate4);
            net.client().permanent_neighbour(idx, gate4, &peer_hw).await?;
            net.client()
                .add_direct_route(idx, IpNetwork::from(gate4))
                .await?;
            net.client().add_default_gw(idx, gate4).await?;
        }
        if let Some(gate6) = gate.gate6 {
            let gate6 = IpAddr::V6(gate6);
            net.client().permanent_neighbour(idx, gate6, &peer_hw).await?;
            net.client()
                .add_direct_route(idx, IpNetwork::from(gate6))
                .await?;
            net.client().add_default_gw(idx, gate6).await?;
        }

        for addr in &l3.addrs {
            host.client()
                .add_direct_route(peer.header.index, *addr)
                .await?;

            if env.config.proxy_ndp {
                let master = l3
                    .master
                    .as_ref()
                    .map(|m| Network::match_device(&hst, m));
                host.add_announce(&hst, *addr, master.as_deref()).await?;
            }
        }

        Ok(())
    }

    /// Undo externally visible allocations: proxy-NDP announces and NAT
    /// addresses. Interfaces inside the pending namespace die with its fd.
    pub async fn destroy_network(&mut self, env: &NetEnv) -> Result<()> {
        let Some(host) = env.registry.host() else {
            return Ok(());
        };
        let mut result = Ok(());

        for l3 in &self.l3 {
            let mut hst = host.lock().await;

            if env.config.proxy_ndp {
                for addr in &l3.addrs {
                    if let Err(e) = host.del_announce(&hst, *addr).await {
                        warn!(addr = %addr, error = %e, "cannot remove announce");
                        result = Err(e);
                    }
                }
            }

            if l3.nat {
                if let Err(e) = host.put_nat_address(&mut hst, &l3.addrs).await {
                    warn!(error = %e, "cannot put NAT address");
                    result = Err(e);
                }
                self.ip.retain(|ip| ip.iface != l3.name);
                self.save_ip = true;
            }
        }

        result
    }
}

fn is_host_addr(addr: &IpNetwork) -> bool {
    match addr {
        IpNetwork::V4(net) => net.prefix() == 32,
        IpNetwork::V6(net) => net.prefix() == 128,
    }
}

/// CRC-32 (IEEE), bitwise.
fn crc32(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            crc = (crc >> 1) ^ (0xedb88320 & (0u32.wrapping_sub(crc & 1)));
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuples(text: &[&[&str]]) -> MultiTuple {
        text.iter()
            .map(|t| t.iter().map(|s| s.to_string()).collect())
            .collect()
    }

    fn cfg() -> NetworkConfig {
        NetworkConfig::default()
    }

    #[test]
    fn parse_none_keeps_new_namespace() {
        let mut net = NetCfg::new(1, "host");
        net.parse_net(&tuples(&[&["none"]]), &cfg()).unwrap();
        assert!(net.new_netns);
        assert!(!net.inherited);
        assert!(!net.net_up);
    }

    #[test]
    fn parse_bare_host_is_inherited() {
        let mut net = NetCfg::new(1, "host");
        net.parse_net(&tuples(&[&["host"]]), &cfg()).unwrap();
        assert!(net.inherited);
        assert!(!net.new_netns);
    }

    #[test]
    fn parse_host_with_device_is_steal() {
        let mut net = NetCfg::new(1, "host");
        net.parse_net(&tuples(&[&["host", "eth1"]]), &cfg()).unwrap();
        assert_eq!(net.steal, vec!["eth1"]);
        assert!(!net.l3_only);
    }

    #[test]
    fn parse_veth_assigns_peer_names() {
        let mut net = NetCfg::new(12, "host");
        net.parse_net(
            &tuples(&[
                &["veth", "eth0", "br0", "1500", "02:00:00:00:00:01"],
                &["veth", "eth1", "br0"],
            ]),
            &cfg(),
        )
        .unwrap();
        assert_eq!(net.veth[0].peer, "portove-12-0");
        assert_eq!(net.veth[1].peer, "portove-12-1");
        assert_eq!(net.veth[0].mtu, Some(1500));
        assert_eq!(net.veth[0].hw.as_deref(), Some("02:00:00:00:00:01"));
        assert!(net.net_up);
    }

    #[test]
    fn parse_rejects_mixing_none_with_devices() {
        let mut net = NetCfg::new(1, "host");
        let err = net
            .parse_net(&tuples(&[&["none"], &["veth", "eth0", "br0"]]), &cfg())
            .unwrap_err();
        assert!(matches!(err, NetError::InvalidValue(_)));
    }

    #[test]
    fn parse_rejects_bad_macvlan_type() {
        let mut net = NetCfg::new(1, "host");
        assert!(
            net.parse_net(&tuples(&[&["macvlan", "eth0", "mv0", "loop"]]), &cfg())
                .is_err()
        );
    }

    #[test]
    fn parse_mtu_retargets_declared_links() {
        let mut net = NetCfg::new(1, "host");
        net.parse_net(
            &tuples(&[&["veth", "eth0", "br0"], &["MTU", "eth0", "1450"]]),
            &cfg(),
        )
        .unwrap();
        assert_eq!(net.veth[0].mtu, Some(1450));

        let err = net
            .parse_net(
                &tuples(&[&["veth", "eth0", "br0"], &["MTU", "eth9", "1450"]]),
                &cfg(),
            )
            .unwrap_err();
        assert!(matches!(err, NetError::InvalidValue(_)));
    }

    #[test]
    fn parse_ipip6_computes_tunnel_mtu() {
        let mut net = NetCfg::new(1, "host");
        net.parse_net(
            &tuples(&[&["ipip6", "tun0", "2001:db8::1", "2001:db8::2"]]),
            &cfg(),
        )
        .unwrap();
        assert_eq!(net.ipip6[0].mtu, 1452);
        assert_eq!(net.ipip6[0].ttl, 64);

        assert!(
            net.parse_net(
                &tuples(&[&["ipip6", "ip6tnl0", "2001:db8::1", "2001:db8::2"]]),
                &cfg()
            )
            .is_err()
        );
    }

    #[test]
    fn net_round_trip() {
        let mut net = NetCfg::new(7, "host");
        net.parse_net(
            &tuples(&[
                &["steal", "eth5"],
                &["macvlan", "eth0", "mv0", "vepa", "1400"],
                &["ipvlan", "eth0", "iv0", "l3"],
                &["veth", "eth0", "br0", "1500", "02:00:00:00:00:01"],
                &["L3", "eth1"],
                &["NAT", "eth2"],
                &["ipip6", "tun0", "2001:db8::1", "2001:db8::2"],
                &["autoconf", "eth1"],
            ]),
            &cfg(),
        )
        .unwrap();

        let mut reparsed = NetCfg::new(7, "host");
        reparsed.parse_net(&net.format_net(), &cfg()).unwrap();
        assert_eq!(net, reparsed);
    }

    #[test]
    fn ip_and_gw_round_trip() {
        let mut net = NetCfg::new(1, "host");
        net.parse_net(&tuples(&[&["L3", "eth0"]]), &cfg()).unwrap();
        net.parse_ip(&tuples(&[&["eth0", "192.0.2.5/32"]])).unwrap();
        net.parse_gw(&tuples(&[&["eth0", "192.0.2.1"]])).unwrap();

        let mut reparsed = NetCfg::new(1, "host");
        reparsed.parse_net(&net.format_net(), &cfg()).unwrap();
        reparsed.parse_ip(&net.format_ip()).unwrap();
        reparsed.parse_gw(&net.format_gw()).unwrap();
        assert_eq!(net.ip, reparsed.ip);
        assert_eq!(net.gw, reparsed.gw);
        assert_eq!(net.l3[0].addrs, reparsed.l3[0].addrs);
    }

    #[test]
    fn l3_addresses_must_be_host_addresses() {
        let mut net = NetCfg::new(1, "host");
        net.parse_net(&tuples(&[&["L3", "eth0"]]), &cfg()).unwrap();
        let err = net
            .parse_ip(&tuples(&[&["eth0", "192.0.2.0/24"]]))
            .unwrap_err();
        assert!(matches!(err, NetError::InvalidValue(_)));
    }

    #[test]
    fn generated_hw_is_stable_and_local() {
        let net = NetCfg::new(1, "myhost");
        let a = net.generate_hw("eth0portove-1-0");
        let b = net.generate_hw("eth0portove-1-0");
        assert_eq!(a, b);
        assert!(a.starts_with("02:"));
        assert!(valid_mac(&a));
        assert_ne!(a, net.generate_hw("eth1portove-1-1"));
    }

    #[test]
    fn crc32_reference_values() {
        assert_eq!(crc32(b""), 0);
        assert_eq!(crc32(b"123456789"), 0xcbf43926);
    }

    #[test]
    fn empty_net_property_is_invalid() {
        let mut net = NetCfg::new(1, "host");
        assert!(net.parse_net(&MultiTuple::new(), &cfg()).is_err());
    }
}
