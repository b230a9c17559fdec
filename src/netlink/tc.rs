//! Traffic-control programming over raw route-netlink messages: qdisc,
//! class and filter installs, shape checks, and class statistics dumps.
//! Option payloads (htb, hfsc, sfq, fifo, police) are encoded by hand the
//! way iproute2 lays them out; rates are converted to scheduler ticks via
//! `/proc/net/psched`.

use std::sync::LazyLock;

use netlink_packet_core::{NLM_F_ACK, NLM_F_DUMP, NLM_F_REQUEST};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_packet_route::tc::{TcAttribute, TcHandle, TcMessage, TcStats2};
use netlink_packet_core::DefaultNla;
use tracing::debug;

use super::{NetlinkClient, nla, replace_flags};
use crate::device::NetStats;
use crate::{NetError, Result};

pub const TC_H_ROOT: u32 = 0xffff_ffff;
pub const TC_H_INGRESS: u32 = 0xffff_fff1;
/// Handle of the ingress qdisc (major ffff:, minor 0).
pub const INGRESS_HANDLE: u32 = 0xffff_0000;

const TCA_OPTIONS: u16 = 2;

const TCA_HTB_PARMS: u16 = 1;
const TCA_HTB_INIT: u16 = 2;
const TCA_HTB_RATE64: u16 = 7;
const TCA_HTB_CEIL64: u16 = 8;

const TCA_HFSC_RSC: u16 = 1;
const TCA_HFSC_FSC: u16 = 2;
const TCA_HFSC_USC: u16 = 3;

const TCA_BASIC_POLICE: u16 = 4;
const TCA_POLICE_TBF: u16 = 1;
const TCA_POLICE_RATE: u16 = 2;

/// tc_police.action: drop the packet.
const TC_POLICE_SHOT: i32 = 2;
const TC_LINKLAYER_ETHERNET: u8 = 1;

const ETH_P_ALL: u16 = 0x0003;

/// Scheduler clock calibration from `/proc/net/psched`.
struct Psched {
    tick_in_usec: f64,
}

static PSCHED: LazyLock<Psched> = LazyLock::new(|| {
    let text = std::fs::read_to_string("/proc/net/psched").unwrap_or_default();
    Psched::parse(&text)
});

impl Psched {
    fn parse(text: &str) -> Self {
        let fields: Vec<u64> = text
            .split_whitespace()
            .take(3)
            .filter_map(|f| u64::from_str_radix(f, 16).ok())
            .collect();
        let tick_in_usec = match fields.as_slice() {
            [t2us, us2t, clock_res] if *us2t != 0 => {
                let clock_factor = *clock_res as f64 / 1_000_000.0;
                *t2us as f64 / *us2t as f64 * clock_factor
            }
            // modern kernels: 1000ns/us, 64ns/tick, usec clock
            _ => 15.625,
        };
        Psched { tick_in_usec }
    }

    /// Transmission time of `size` bytes at `rate` bytes/s, in ticks.
    fn xmittime(&self, rate: u64, size: u64) -> u32 {
        if rate == 0 {
            return 0;
        }
        let usec = 1_000_000.0 * size as f64 / rate as f64;
        (usec * self.tick_in_usec).min(u32::MAX as f64) as u32
    }
}

pub(crate) fn xmittime(rate: u64, size: u64) -> u32 {
    PSCHED.xmittime(rate, size)
}

/// struct tc_ratespec, 12 bytes.
fn ratespec(rate: u64, mtu: u32) -> Vec<u8> {
    let mut cell_log: u8 = 0;
    while (mtu.max(1) >> cell_log) > 255 {
        cell_log += 1;
    }
    let mut out = Vec::with_capacity(12);
    out.push(cell_log);
    out.push(TC_LINKLAYER_ETHERNET);
    out.extend_from_slice(&0i16.to_ne_bytes()); // overhead
    out.extend_from_slice(&0i16.to_ne_bytes()); // cell_align
    out.extend_from_slice(&0u16.to_ne_bytes()); // mpu
    out.extend_from_slice(&(rate.min(u32::MAX as u64) as u32).to_ne_bytes());
    out
}

/// 256-slot transmission-time table matching a ratespec's cell_log.
fn rate_table(rate: u64, mtu: u32) -> Vec<u8> {
    let mut cell_log: u8 = 0;
    while (mtu.max(1) >> cell_log) > 255 {
        cell_log += 1;
    }
    let mut out = Vec::with_capacity(256 * 4);
    for i in 0..256u64 {
        let size = (i + 1) << cell_log;
        out.extend_from_slice(&xmittime(rate, size).to_ne_bytes());
    }
    out
}

/// struct tc_service_curve { m1, d, m2 }.
fn service_curve(m2: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&0u32.to_ne_bytes());
    out.extend_from_slice(&0u32.to_ne_bytes());
    out.extend_from_slice(&(m2.min(u32::MAX as u64) as u32).to_ne_bytes());
    out
}

fn tc_message(index: u32, parent: u32, handle: u32) -> TcMessage {
    let mut msg = TcMessage::with_index(index as i32);
    msg.header.parent = TcHandle::from(parent);
    msg.header.handle = TcHandle::from(handle);
    msg
}

async fn tc_ack(
    client: &NetlinkClient,
    message: RouteNetlinkMessage,
    flags: u16,
) -> Result<()> {
    client.request(message, flags).await.map(|_| ())
}

/// One queueing discipline to install, check or remove.
#[derive(Debug, Clone)]
pub struct TcQdisc {
    pub index: u32,
    pub parent: u32,
    pub handle: u32,
    pub kind: String,
    /// Minor of the class unclassified traffic falls into (htb/hfsc).
    pub default_minor: u16,
    /// htb rate-to-quantum divisor.
    pub r2q: u32,
    pub limit: u64,
    pub quantum: u64,
}

impl TcQdisc {
    pub fn new(index: u32, parent: u32, handle: u32) -> Self {
        TcQdisc {
            index,
            parent,
            handle,
            kind: String::new(),
            default_minor: 0,
            r2q: 10,
            limit: 0,
            quantum: 0,
        }
    }

    fn options(&self) -> Option<Vec<u8>> {
        match self.kind.as_str() {
            "htb" => {
                // struct tc_htb_glob
                let mut glob = Vec::with_capacity(20);
                glob.extend_from_slice(&3u32.to_ne_bytes()); // version
                glob.extend_from_slice(&self.r2q.to_ne_bytes());
                glob.extend_from_slice(&(self.default_minor as u32).to_ne_bytes());
                glob.extend_from_slice(&0u32.to_ne_bytes()); // debug
                glob.extend_from_slice(&0u32.to_ne_bytes()); // direct_pkts
                Some(nla(TCA_HTB_INIT, &glob))
            }
            "hfsc" => {
                // struct tc_hfsc_qopt, bare payload
                Some((self.default_minor).to_ne_bytes().to_vec())
            }
            "sfq" => {
                if self.limit == 0 && self.quantum == 0 {
                    return None;
                }
                // struct tc_sfq_qopt
                let mut opt = Vec::with_capacity(20);
                opt.extend_from_slice(&(self.quantum.min(u32::MAX as u64) as u32).to_ne_bytes());
                opt.extend_from_slice(&10i32.to_ne_bytes()); // perturb_period
                opt.extend_from_slice(&(self.limit.min(u32::MAX as u64) as u32).to_ne_bytes());
                opt.extend_from_slice(&0u32.to_ne_bytes()); // divisor
                opt.extend_from_slice(&0u32.to_ne_bytes()); // flows
                Some(opt)
            }
            "pfifo" | "bfifo" => {
                // struct tc_fifo_qopt
                Some((self.limit.min(u32::MAX as u64) as u32).to_ne_bytes().to_vec())
            }
            _ => None,
        }
    }

    pub async fn create(&self, client: &NetlinkClient) -> Result<()> {
        let mut msg = tc_message(self.index, self.parent, self.handle);
        msg.attributes.push(TcAttribute::Kind(self.kind.clone()));
        if let Some(options) = self.options() {
            msg.attributes
                .push(TcAttribute::Other(DefaultNla::new(TCA_OPTIONS, options)));
        }
        debug!(index = self.index, kind = %self.kind, handle = self.handle, "creating qdisc");
        tc_ack(
            client,
            RouteNetlinkMessage::NewQueueDiscipline(msg),
            replace_flags(),
        )
        .await
    }

    pub async fn delete(&self, client: &NetlinkClient) -> Result<()> {
        let msg = tc_message(self.index, self.parent, self.handle);
        tc_ack(
            client,
            RouteNetlinkMessage::DelQueueDiscipline(msg),
            NLM_F_REQUEST | NLM_F_ACK,
        )
        .await
    }

    /// True when a qdisc of the configured kind sits at this handle.
    pub async fn check(&self, client: &NetlinkClient) -> Result<bool> {
        let dump = TcMessage::with_index(self.index as i32);
        let replies = client
            .request(
                RouteNetlinkMessage::GetQueueDiscipline(dump),
                NLM_F_REQUEST | NLM_F_DUMP,
            )
            .await?;

        for reply in replies {
            let RouteNetlinkMessage::NewQueueDiscipline(qdisc) = reply else {
                continue;
            };
            if qdisc.header.index != self.index as i32
                || u32::from(qdisc.header.handle) != self.handle
            {
                continue;
            }
            let kind = qdisc.attributes.iter().find_map(|attr| match attr {
                TcAttribute::Kind(kind) => Some(kind.as_str()),
                _ => None,
            });
            return Ok(kind == Some(self.kind.as_str()));
        }
        Ok(false)
    }
}

/// One traffic class to install or remove.
#[derive(Debug, Clone, Default)]
pub struct TcClass {
    pub index: u32,
    pub parent: u32,
    pub handle: u32,
    pub kind: String,
    pub prio: u64,
    pub rate: u64,
    pub ceil: u64,
    /// Rate backing hfsc service curves when no guarantee is configured.
    pub def_rate: u64,
    pub quantum: u64,
    pub rate_burst: u64,
    pub ceil_burst: u64,
    pub mtu: u32,
}

impl TcClass {
    fn options(&self) -> Result<Vec<u8>> {
        match self.kind.as_str() {
            "htb" => {
                let rate = self.rate.max(1);
                let ceil = if self.ceil == 0 {
                    crate::NET_MAX_RATE
                } else {
                    self.ceil
                };

                // struct tc_htb_opt: rate, ceil, buffer, cbuffer, quantum,
                // level, prio
                let mut parms = Vec::with_capacity(44);
                parms.extend_from_slice(&ratespec(rate, self.mtu));
                parms.extend_from_slice(&ratespec(ceil, self.mtu));
                parms.extend_from_slice(&xmittime(rate, self.rate_burst).to_ne_bytes());
                parms.extend_from_slice(&xmittime(ceil, self.ceil_burst).to_ne_bytes());
                parms.extend_from_slice(
                    &(self.quantum.min(u32::MAX as u64) as u32).to_ne_bytes(),
                );
                parms.extend_from_slice(&0u32.to_ne_bytes()); // level
                parms.extend_from_slice(
                    &(self.prio.min(u32::MAX as u64) as u32).to_ne_bytes(),
                );

                let mut options = nla(TCA_HTB_PARMS, &parms);
                if rate > u32::MAX as u64 {
                    options.extend_from_slice(&nla(TCA_HTB_RATE64, &rate.to_ne_bytes()));
                }
                if ceil > u32::MAX as u64 {
                    options.extend_from_slice(&nla(TCA_HTB_CEIL64, &ceil.to_ne_bytes()));
                }
                Ok(options)
            }
            "hfsc" => {
                let guarantee = if self.rate != 0 { self.rate } else { self.def_rate };
                let mut options = nla(TCA_HFSC_RSC, &service_curve(guarantee));
                options.extend_from_slice(&nla(TCA_HFSC_FSC, &service_curve(guarantee)));
                if self.ceil != 0 {
                    options.extend_from_slice(&nla(TCA_HFSC_USC, &service_curve(self.ceil)));
                }
                Ok(options)
            }
            other => Err(NetError::InvalidValue(format!(
                "unsupported class discipline {other}"
            ))),
        }
    }

    pub async fn create(&self, client: &NetlinkClient) -> Result<()> {
        let mut msg = tc_message(self.index, self.parent, self.handle);
        msg.attributes.push(TcAttribute::Kind(self.kind.clone()));
        msg.attributes
            .push(TcAttribute::Other(DefaultNla::new(TCA_OPTIONS, self.options()?)));
        debug!(
            index = self.index,
            handle = self.handle,
            parent = self.parent,
            rate = self.rate,
            ceil = self.ceil,
            "creating tc class"
        );
        tc_ack(
            client,
            RouteNetlinkMessage::NewTrafficClass(msg),
            replace_flags(),
        )
        .await
    }

    pub async fn delete(client: &NetlinkClient, index: u32, handle: u32) -> Result<()> {
        let msg = tc_message(index, 0, handle);
        tc_ack(
            client,
            RouteNetlinkMessage::DelTrafficClass(msg),
            NLM_F_REQUEST | NLM_F_ACK,
        )
        .await
    }
}

/// Cgroup classifier on the root qdisc: containers mark their traffic via
/// net_cls, the filter maps it onto their class.
#[derive(Debug, Clone)]
pub struct TcCgroupFilter {
    pub index: u32,
    pub parent: u32,
}

impl TcCgroupFilter {
    const PRIO: u16 = 10;

    fn message(&self, info: u32) -> TcMessage {
        let mut msg = tc_message(self.index, self.parent, 0);
        msg.header.info = info;
        msg
    }

    fn filter_info(prio: u16) -> u32 {
        ((prio as u32) << 16) | ETH_P_ALL.to_be() as u32
    }

    pub async fn create(&self, client: &NetlinkClient) -> Result<()> {
        let mut msg = self.message(Self::filter_info(Self::PRIO));
        msg.attributes.push(TcAttribute::Kind("cgroup".to_string()));
        tc_ack(
            client,
            RouteNetlinkMessage::NewTrafficFilter(msg),
            replace_flags(),
        )
        .await
    }

    /// Remove every filter at this parent; prio 0 matches all preferences.
    pub async fn delete(&self, client: &NetlinkClient) -> Result<()> {
        let msg = self.message(0);
        tc_ack(
            client,
            RouteNetlinkMessage::DelTrafficFilter(msg),
            NLM_F_REQUEST | NLM_F_ACK,
        )
        .await
    }
}

/// Ingress policer: a basic filter carrying a police action that drops
/// traffic above the configured rate.
#[derive(Debug, Clone)]
pub struct TcPoliceFilter {
    pub index: u32,
    pub mtu: u32,
    pub rate: u64,
    pub burst: u64,
}

impl TcPoliceFilter {
    const PRIO: u16 = 10;

    pub async fn create(&self, client: &NetlinkClient) -> Result<()> {
        // struct tc_police
        let mut police = Vec::with_capacity(56);
        police.extend_from_slice(&0u32.to_ne_bytes()); // index
        police.extend_from_slice(&TC_POLICE_SHOT.to_ne_bytes());
        police.extend_from_slice(&0u32.to_ne_bytes()); // limit
        police.extend_from_slice(&xmittime(self.rate, self.burst).to_ne_bytes());
        police.extend_from_slice(&self.mtu.to_ne_bytes());
        police.extend_from_slice(&ratespec(self.rate, self.mtu));
        police.extend_from_slice(&[0u8; 12]); // peakrate
        police.extend_from_slice(&0i32.to_ne_bytes()); // refcnt
        police.extend_from_slice(&0i32.to_ne_bytes()); // bindcnt
        police.extend_from_slice(&0u32.to_ne_bytes()); // capab

        let mut police_nest = nla(TCA_POLICE_TBF, &police);
        police_nest.extend_from_slice(&nla(TCA_POLICE_RATE, &rate_table(self.rate, self.mtu)));

        let options = nla(TCA_BASIC_POLICE, &police_nest);

        let mut msg = tc_message(self.index, TC_H_INGRESS, 0);
        msg.header.info = ((Self::PRIO as u32) << 16) | ETH_P_ALL.to_be() as u32;
        msg.attributes.push(TcAttribute::Kind("basic".to_string()));
        msg.attributes
            .push(TcAttribute::Other(DefaultNla::new(TCA_OPTIONS, options)));

        debug!(index = self.index, rate = self.rate, burst = self.burst, "creating policer");
        tc_ack(
            client,
            RouteNetlinkMessage::NewTrafficFilter(msg),
            replace_flags(),
        )
        .await
    }

    pub async fn delete(client: &NetlinkClient, index: u32) -> Result<()> {
        let msg = tc_message(index, TC_H_INGRESS, 0);
        tc_ack(
            client,
            RouteNetlinkMessage::DelTrafficFilter(msg),
            NLM_F_REQUEST | NLM_F_ACK,
        )
        .await
    }
}

/// One kernel-reported traffic class.
#[derive(Debug, Clone)]
pub struct TcClassInfo {
    pub handle: u32,
    pub parent: u32,
    pub kind: String,
    pub stats: NetStats,
}

/// Dump every class installed on a device.
pub async fn dump_classes(client: &NetlinkClient, index: u32) -> Result<Vec<TcClassInfo>> {
    let dump = TcMessage::with_index(index as i32);
    let replies = client
        .request(
            RouteNetlinkMessage::GetTrafficClass(dump),
            NLM_F_REQUEST | NLM_F_DUMP,
        )
        .await?;

    let mut classes = Vec::new();
    for reply in replies {
        let RouteNetlinkMessage::NewTrafficClass(msg) = reply else {
            continue;
        };
        if msg.header.index != index as i32 {
            continue;
        }

        let mut info = TcClassInfo {
            handle: msg.header.handle.into(),
            parent: msg.header.parent.into(),
            kind: String::new(),
            stats: NetStats::default(),
        };
        for attr in &msg.attributes {
            match attr {
                TcAttribute::Kind(kind) => info.kind = kind.clone(),
                TcAttribute::Stats(stats) => {
                    info.stats.bytes = stats.bytes;
                    info.stats.packets = stats.packets as u64;
                    info.stats.drops = stats.drops as u64;
                    info.stats.overlimits = stats.overlimits as u64;
                }
                TcAttribute::Stats2(stats) => {
                    for section in stats {
                        match section {
                            TcStats2::Basic(basic) => {
                                info.stats.bytes = basic.bytes;
                                info.stats.packets = basic.packets as u64;
                            }
                            TcStats2::Queue(queue) => {
                                info.stats.drops = queue.drops as u64;
                                info.stats.overlimits = queue.overlimits as u64;
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
        classes.push(info);
    }
    Ok(classes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratespec_layout() {
        let spec = ratespec(125_000_000, 1500);
        assert_eq!(spec.len(), 12);
        assert_eq!(spec[0], 3); // 1500 >> 3 == 187 < 256
        assert_eq!(spec[1], TC_LINKLAYER_ETHERNET);
        assert_eq!(
            u32::from_ne_bytes([spec[8], spec[9], spec[10], spec[11]]),
            125_000_000
        );
    }

    #[test]
    fn ratespec_saturates_32bit_rate() {
        let spec = ratespec(10_000_000_000, 1500);
        assert_eq!(
            u32::from_ne_bytes([spec[8], spec[9], spec[10], spec[11]]),
            u32::MAX
        );
    }

    #[test]
    fn rate_table_has_256_slots() {
        let table = rate_table(125_000, 1500);
        assert_eq!(table.len(), 1024);
        // transmission time grows with packet size
        let first = u32::from_ne_bytes(table[0..4].try_into().unwrap());
        let last = u32::from_ne_bytes(table[1020..1024].try_into().unwrap());
        assert!(last > first);
    }

    #[test]
    fn htb_qdisc_options_layout() {
        let mut qdisc = TcQdisc::new(2, TC_H_ROOT, crate::tc_handle(1, 0));
        qdisc.kind = "htb".into();
        qdisc.default_minor = 2;
        let opts = qdisc.options().unwrap();
        // one nla: 4-byte header + 20-byte tc_htb_glob
        assert_eq!(opts.len(), 24);
        assert_eq!(u16::from_ne_bytes([opts[2], opts[3]]), TCA_HTB_INIT);
        assert_eq!(u32::from_ne_bytes(opts[4..8].try_into().unwrap()), 3);
        assert_eq!(u32::from_ne_bytes(opts[8..12].try_into().unwrap()), 10);
        assert_eq!(u32::from_ne_bytes(opts[12..16].try_into().unwrap()), 2);
    }

    #[test]
    fn hfsc_qdisc_options_are_bare_defcls() {
        let mut qdisc = TcQdisc::new(2, TC_H_ROOT, crate::tc_handle(1, 0));
        qdisc.kind = "hfsc".into();
        qdisc.default_minor = 2;
        assert_eq!(qdisc.options().unwrap(), 2u16.to_ne_bytes().to_vec());
    }

    #[test]
    fn fifo_and_unknown_options() {
        let mut qdisc = TcQdisc::new(2, crate::tc_handle(1, 2), crate::tc_handle(2, 0));
        qdisc.kind = "pfifo".into();
        qdisc.limit = 30000;
        assert_eq!(qdisc.options().unwrap(), 30000u32.to_ne_bytes().to_vec());

        qdisc.kind = "pfifo_fast".into();
        assert!(qdisc.options().is_none());
    }

    #[test]
    fn htb_class_options_layout() {
        let class = TcClass {
            index: 2,
            parent: crate::tc_handle(1, 1),
            handle: crate::tc_handle(1, 0x100),
            kind: "htb".into(),
            prio: 3,
            rate: 100_000,
            ceil: 1_000_000,
            def_rate: 0,
            quantum: 3000,
            rate_burst: 15_000,
            ceil_burst: 15_000,
            mtu: 1500,
        };
        let opts = class.options().unwrap();
        // single TCA_HTB_PARMS nla: 4 + 44 bytes
        assert_eq!(opts.len(), 48);
        assert_eq!(u16::from_ne_bytes([opts[2], opts[3]]), TCA_HTB_PARMS);
        // rate at parms offset 8, ceil ratespec rate at offset 20
        assert_eq!(u32::from_ne_bytes(opts[12..16].try_into().unwrap()), 100_000);
        assert_eq!(
            u32::from_ne_bytes(opts[24..28].try_into().unwrap()),
            1_000_000
        );
        // quantum sits after the two ratespecs and two buffers
        assert_eq!(u32::from_ne_bytes(opts[36..40].try_into().unwrap()), 3000);
        // prio is the last field
        assert_eq!(u32::from_ne_bytes(opts[44..48].try_into().unwrap()), 3);
    }

    #[test]
    fn htb_class_zero_ceil_means_unlimited() {
        let class = TcClass {
            index: 2,
            parent: crate::tc_handle(1, 0x100),
            handle: crate::tc_handle(1, 0x4100),
            kind: "htb".into(),
            rate: 100_000,
            ceil: 0,
            rate_burst: 15_000,
            ceil_burst: 15_000,
            mtu: 1500,
            ..Default::default()
        };
        let opts = class.options().unwrap();
        let ceil = u32::from_ne_bytes(opts[24..28].try_into().unwrap());
        assert_eq!(ceil as u64, crate::NET_MAX_RATE.min(u32::MAX as u64));
    }

    #[test]
    fn htb_class_wide_rate_gets_rate64() {
        let class = TcClass {
            index: 2,
            parent: crate::tc_handle(1, 1),
            handle: crate::tc_handle(1, 0x100),
            kind: "htb".into(),
            rate: 10_000_000_000,
            ceil: 10_000_000_000,
            rate_burst: 15_000,
            ceil_burst: 15_000,
            mtu: 1500,
            ..Default::default()
        };
        let opts = class.options().unwrap();
        // parms + RATE64 + CEIL64
        assert_eq!(opts.len(), 48 + 12 + 12);
        assert_eq!(u16::from_ne_bytes([opts[50], opts[51]]), TCA_HTB_RATE64);
        assert_eq!(
            u64::from_ne_bytes(opts[52..60].try_into().unwrap()),
            10_000_000_000
        );
    }

    #[test]
    fn hfsc_class_uses_def_rate_without_guarantee() {
        let class = TcClass {
            index: 2,
            parent: crate::tc_handle(1, 1),
            handle: crate::tc_handle(1, 0x100),
            kind: "hfsc".into(),
            rate: 0,
            ceil: 1_000_000,
            def_rate: 250_000,
            mtu: 1500,
            ..Default::default()
        };
        let opts = class.options().unwrap();
        // RSC + FSC + USC, each 4 + 12 bytes
        assert_eq!(opts.len(), 48);
        assert_eq!(
            u32::from_ne_bytes(opts[12..16].try_into().unwrap()),
            250_000
        );
        assert_eq!(u16::from_ne_bytes([opts[34], opts[35]]), TCA_HFSC_USC);
    }

    #[test]
    fn unsupported_class_kind_is_invalid_value() {
        let class = TcClass {
            kind: "cbq".into(),
            ..Default::default()
        };
        assert!(matches!(
            class.options(),
            Err(NetError::InvalidValue(_))
        ));
    }

    #[test]
    fn filter_info_packs_prio_and_protocol() {
        let info = TcCgroupFilter::filter_info(10);
        assert_eq!(info >> 16, 10);
        assert_eq!(info & 0xffff, ETH_P_ALL.to_be() as u32);
    }

    #[test]
    fn police_xmittime_monotonic_in_size() {
        let psched = Psched { tick_in_usec: 15.625 };
        assert_eq!(psched.xmittime(0, 1500), 0);
        let small = psched.xmittime(125_000, 1500);
        let large = psched.xmittime(125_000, 15_000);
        assert!(large > small);
        assert!(psched.xmittime(1, u64::MAX / 2) == u32::MAX);
    }

    #[test]
    fn psched_parse_falls_back_on_garbage() {
        assert_eq!(Psched::parse("").tick_in_usec, 15.625);
        let parsed = Psched::parse("000003e8 00000040 000f4240 3b9aca00");
        assert!((parsed.tick_in_usec - 15.625).abs() < 1e-9);
    }
}
