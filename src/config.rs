use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Path of the iproute2 device group table.
const GROUP_FILE: &str = "/etc/iproute2/group";

/// Shell-style glob match over `*` and `?`.
pub fn glob_match(name: &str, pattern: &str) -> bool {
    let n = name.as_bytes();
    let p = pattern.as_bytes();
    let (mut ni, mut pi) = (0usize, 0usize);
    let (mut star, mut mark) = (None, 0usize);

    while ni < n.len() {
        if pi < p.len() && (p[pi] == b'?' || p[pi] == n[ni]) {
            ni += 1;
            pi += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            mark = ni;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ni = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

/// Insertion-ordered configuration map keyed by device glob,
/// `"group <name>"` or `"default"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CfgMap<V>(pub Vec<(String, V)>);

pub type UintMap = CfgMap<u64>;
pub type StringMap = CfgMap<String>;

impl<V> CfgMap<V> {
    pub fn new() -> Self {
        CfgMap(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Exact-key lookup (no globbing).
    pub fn get(&self, key: &str) -> Option<&V> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Insert or overwrite an exact key, keeping first-insertion order.
    pub fn set(&mut self, key: impl Into<String>, value: V) {
        let key = key.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.0.retain(|(k, _)| k != key);
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, V)> {
        self.0.iter()
    }

    /// First entry whose key glob-matches `name`, in insertion order.
    pub fn glob_lookup(&self, name: &str) -> Option<&V> {
        self.0
            .iter()
            .find(|(k, _)| glob_match(name, k))
            .map(|(_, v)| v)
    }
}

impl<V, K: Into<String>> FromIterator<(K, V)> for CfgMap<V> {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        CfgMap(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// `/etc/iproute2/group` id <-> name table, loaded once at initialization.
#[derive(Debug, Clone, Default)]
pub struct GroupTable {
    by_id: HashMap<u32, String>,
    by_name: HashMap<String, u32>,
}

impl GroupTable {
    pub fn load() -> Self {
        match std::fs::read_to_string(Path::new(GROUP_FILE)) {
            Ok(text) => Self::parse(&text),
            Err(_) => Self::default(),
        }
    }

    /// Whitespace-delimited `id name` pairs, `#` starts a line comment.
    pub fn parse(text: &str) -> Self {
        let mut table = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(id), Some(name)) = (fields.next(), fields.next()) else {
                continue;
            };
            let Ok(id) = id.parse::<u32>() else { continue };
            info!(id, name, "network device group");
            table.by_id.insert(id, name.to_string());
            table.by_name.insert(name.to_string(), id);
        }
        table
    }

    /// Group name for an id, falling back to the numeric form.
    pub fn name(&self, id: u32) -> String {
        self.by_id
            .get(&id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }

    pub fn id(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddrLabel {
    /// Address prefix in `addr/len` form, parsed when applied.
    pub prefix: String,
    pub label: u32,
}

/// Network subsystem configuration, owned by the composition root and
/// shared as `Arc<NetworkConfig>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Globs of devices the subsystem must leave alone.
    pub unmanaged_device: Vec<String>,
    /// Device groups (names or numeric ids) the subsystem must leave alone.
    pub unmanaged_group: Vec<String>,

    pub device_qdisc: StringMap,
    pub device_rate: UintMap,
    pub device_ceil: UintMap,
    pub device_rate_burst: UintMap,
    pub device_ceil_burst: UintMap,
    pub device_quantum: UintMap,

    pub default_rate: UintMap,
    pub default_qdisc: StringMap,
    pub default_qdisc_limit: UintMap,
    pub default_qdisc_quantum: UintMap,

    pub container_rate: UintMap,
    pub container_qdisc: StringMap,
    pub container_qdisc_limit: UintMap,
    pub container_qdisc_quantum: UintMap,

    pub porto_rate: UintMap,
    pub ingress_burst: UintMap,

    /// Reconciliation worker period in milliseconds.
    pub watchdog_ms: u64,

    pub nat_first_ipv4: Option<Ipv4Addr>,
    pub nat_first_ipv6: Option<Ipv6Addr>,
    pub nat_count: u64,

    pub ipip6_ttl: u8,
    pub ipip6_encap_limit: u8,

    /// Address labels published into each new namespace.
    pub addrlabel: Vec<AddrLabel>,

    pub proxy_ndp: bool,
    pub l3_migration_hack: bool,

    #[serde(skip)]
    pub groups: GroupTable,
    /// Numeric ids resolved from `unmanaged_group` at init.
    #[serde(skip)]
    pub unmanaged_gids: Vec<u32>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            unmanaged_device: Vec::new(),
            unmanaged_group: Vec::new(),
            device_qdisc: [("default", "htb".to_string())].into_iter().collect(),
            device_rate: CfgMap::new(),
            device_ceil: CfgMap::new(),
            device_rate_burst: CfgMap::new(),
            device_ceil_burst: CfgMap::new(),
            device_quantum: CfgMap::new(),
            default_rate: [("default", 125_000_000u64)].into_iter().collect(),
            default_qdisc: [("default", "sfq".to_string())].into_iter().collect(),
            default_qdisc_limit: CfgMap::new(),
            default_qdisc_quantum: CfgMap::new(),
            container_rate: [("default", 1_250_000u64)].into_iter().collect(),
            container_qdisc: [("default", "pfifo".to_string())].into_iter().collect(),
            container_qdisc_limit: CfgMap::new(),
            container_qdisc_quantum: CfgMap::new(),
            porto_rate: [("default", 12_500_000u64)].into_iter().collect(),
            ingress_burst: CfgMap::new(),
            watchdog_ms: 60_000,
            nat_first_ipv4: None,
            nat_first_ipv6: None,
            nat_count: 0,
            ipip6_ttl: 64,
            ipip6_encap_limit: 4,
            addrlabel: Vec::new(),
            proxy_ndp: false,
            l3_migration_hack: false,
            groups: GroupTable::default(),
            unmanaged_gids: Vec::new(),
        }
    }
}

impl NetworkConfig {
    /// Resolve runtime tables: the group file and the unmanaged group ids.
    /// Called once by the composition root before any network is built.
    pub fn init(&mut self) {
        self.groups = GroupTable::load();
        self.resolve_unmanaged_groups();
    }

    fn resolve_unmanaged_groups(&mut self) {
        self.unmanaged_gids.clear();
        for group in &self.unmanaged_group {
            let id = match self.groups.id(group) {
                Some(id) => id,
                None => match group.parse::<u32>() {
                    Ok(id) => id,
                    Err(_) => {
                        info!(group, "unknown network device group");
                        continue;
                    }
                },
            };
            info!(id, group, "unmanaged network device group");
            self.unmanaged_gids.push(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_literal_and_wildcards() {
        assert!(glob_match("eth0", "eth0"));
        assert!(glob_match("eth0", "eth*"));
        assert!(glob_match("eth10", "eth*"));
        assert!(glob_match("eth0", "eth?"));
        assert!(!glob_match("eth10", "eth?"));
        assert!(glob_match("anything", "*"));
        assert!(!glob_match("eth0", "en*"));
        assert!(glob_match("veth-ab-3", "veth-*-?"));
    }

    #[test]
    fn glob_star_backtracking() {
        assert!(glob_match("abcbcd", "a*bcd"));
        assert!(glob_match("aaa", "a*a"));
        assert!(!glob_match("ab", "a*b*c"));
        assert!(glob_match("", "*"));
        assert!(!glob_match("", "?"));
    }

    #[test]
    fn cfg_map_keeps_insertion_order() {
        let mut map = UintMap::new();
        map.set("eth*", 10);
        map.set("eth0", 20);
        // first inserted glob wins even though "eth0" is more specific
        assert_eq!(map.glob_lookup("eth0"), Some(&10));
        map.set("eth*", 30);
        assert_eq!(map.glob_lookup("eth0"), Some(&30));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn cfg_map_exact_get_does_not_glob() {
        let map: UintMap = [("eth*", 1u64)].into_iter().collect();
        assert_eq!(map.get("eth0"), None);
        assert_eq!(map.get("eth*"), Some(&1));
    }

    #[test]
    fn group_table_parses_comments_and_garbage() {
        let table = GroupTable::parse("# comment\n0 default\n10 uplink\nbogus line\n");
        assert_eq!(table.name(0), "default");
        assert_eq!(table.name(10), "uplink");
        assert_eq!(table.name(99), "99");
        assert_eq!(table.id("uplink"), Some(10));
        assert_eq!(table.id("nope"), None);
    }

    #[test]
    fn unmanaged_groups_resolve_names_and_ids() {
        let mut cfg = NetworkConfig {
            unmanaged_group: vec!["uplink".into(), "7".into(), "junk".into()],
            ..Default::default()
        };
        cfg.groups = GroupTable::parse("10 uplink\n");
        cfg.resolve_unmanaged_groups();
        assert_eq!(cfg.unmanaged_gids, vec![10, 7]);
    }

    #[test]
    fn config_serde_round_trip() {
        let mut cfg = NetworkConfig::default();
        cfg.device_rate.set("eth*", 125_000_000);
        cfg.nat_first_ipv4 = Some("10.0.0.0".parse().unwrap());
        cfg.nat_count = 3;
        let text = serde_json::to_string(&cfg).unwrap();
        let back: NetworkConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.device_rate.glob_lookup("eth0"), Some(&125_000_000));
        assert_eq!(back.nat_count, 3);
    }
}
