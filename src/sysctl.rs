use std::collections::HashSet;
use std::path::PathBuf;

use tracing::debug;

/// Per-namespace network sysctls and their upstream defaults. Anything on
/// this list is exposed as namespace-local; host values are harvested into
/// the container configuration at startup unless the operator overrode
/// them.
pub const NET_SYSCTLS: &[(&str, &str)] = &[
    ("net.core.somaxconn", "128"),
    ("net.unix.max_dgram_qlen", "10"),
    ("net.ipv4.icmp_echo_ignore_all", "0"),
    ("net.ipv4.icmp_echo_ignore_broadcasts", "1"),
    ("net.ipv4.icmp_ignore_bogus_error_responses", "1"),
    ("net.ipv4.icmp_errors_use_inbound_ifaddr", "0"),
    ("net.ipv4.icmp_ratelimit", "1000"),
    ("net.ipv4.icmp_ratemask", "6168"),
    ("net.ipv4.ping_group_range", "1\t0"),
    ("net.ipv4.tcp_ecn", "2"),
    ("net.ipv4.tcp_ecn_fallback", "1"),
    ("net.ipv4.ip_dynaddr", "0"),
    ("net.ipv4.ip_early_demux", "1"),
    ("net.ipv4.ip_default_ttl", "64"),
    ("net.ipv4.ip_local_port_range", "32768\t60999"),
    ("net.ipv4.ip_local_reserved_ports", ""),
    ("net.ipv4.ip_no_pmtu_disc", "0"),
    ("net.ipv4.ip_forward_use_pmtu", "0"),
    ("net.ipv4.ip_nonlocal_bind", "0"),
    ("net.ipv4.tcp_mtu_probing", "0"),
    ("net.ipv4.tcp_base_mss", "1024"),
    ("net.ipv4.tcp_probe_threshold", "8"),
    ("net.ipv4.tcp_probe_interval", "600"),
    ("net.ipv4.tcp_keepalive_time", "7200"),
    ("net.ipv4.tcp_keepalive_probes", "9"),
    ("net.ipv4.tcp_keepalive_intvl", "75"),
    ("net.ipv4.tcp_syn_retries", "6"),
    ("net.ipv4.tcp_synack_retries", "5"),
    ("net.ipv4.tcp_syncookies", "1"),
    ("net.ipv4.tcp_reordering", "3"),
    ("net.ipv4.tcp_retries1", "3"),
    ("net.ipv4.tcp_retries2", "15"),
    ("net.ipv4.tcp_orphan_retries", "0"),
    ("net.ipv4.tcp_fin_timeout", "60"),
    ("net.ipv4.tcp_notsent_lowat", "-1"),
    ("net.ipv4.tcp_tw_reuse", "0"),
    ("net.ipv6.bindv6only", "0"),
    ("net.ipv6.ip_nonlocal_bind", "0"),
    ("net.ipv6.icmp.ratelimit", "1000"),
    ("net.ipv6.route.gc_thresh", "1024"),
    ("net.ipv6.route.max_size", "4096"),
    ("net.ipv6.route.gc_min_interval", "0"),
    ("net.ipv6.route.gc_timeout", "60"),
    ("net.ipv6.route.gc_interval", "30"),
    ("net.ipv6.route.gc_elasticity", "9"),
    ("net.ipv6.route.mtu_expires", "600"),
    ("net.ipv6.route.min_adv_mss", "1220"),
    ("net.ipv6.route.gc_min_interval_ms", "500"),
];

/// Whether a sysctl key is namespace-local: the fixed list above plus all
/// per-interface conf trees and non-default neighbour tables.
pub fn namespace_sysctl(key: &str) -> bool {
    if NET_SYSCTLS.iter().any(|(k, _)| *k == key) {
        return true;
    }
    if key.starts_with("net.ipv4.conf.") || key.starts_with("net.ipv6.conf.") {
        return true;
    }
    if key.starts_with("net.ipv4.neigh.") && !key.starts_with("net.ipv4.neigh.default.") {
        return true;
    }
    if key.starts_with("net.ipv6.neigh.") && !key.starts_with("net.ipv6.neigh.default.") {
        return true;
    }
    false
}

fn sysctl_path(key: &str) -> PathBuf {
    let mut path = PathBuf::from("/proc/sys");
    path.push(key.replace('.', "/"));
    path
}

pub fn get_sysctl(key: &str) -> Option<String> {
    std::fs::read_to_string(sysctl_path(key))
        .ok()
        .map(|text| text.trim_end_matches('\n').to_string())
}

/// Harvest host sysctl values differing from the upstream defaults, for
/// keys the operator has not already overridden. The result seeds the
/// container configuration so new namespaces inherit host policy.
pub fn harvest_defaults(overridden: &HashSet<String>) -> Vec<(String, String)> {
    let mut harvested = Vec::new();
    for (key, default) in NET_SYSCTLS {
        if overridden.contains(*key) {
            continue;
        }
        if let Some(value) = get_sysctl(key) {
            if value != *default {
                debug!(key, value, default, "harvested host sysctl");
                harvested.push((key.to_string(), value));
            }
        }
    }
    harvested
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_list_is_namespace_local() {
        assert!(namespace_sysctl("net.core.somaxconn"));
        assert!(namespace_sysctl("net.ipv4.tcp_syncookies"));
        assert!(!namespace_sysctl("net.core.rmem_max"));
        assert!(!namespace_sysctl("kernel.hostname"));
    }

    #[test]
    fn conf_trees_are_namespace_local() {
        assert!(namespace_sysctl("net.ipv4.conf.eth0.forwarding"));
        assert!(namespace_sysctl("net.ipv6.conf.all.disable_ipv6"));
    }

    #[test]
    fn neighbour_tables_exclude_default() {
        assert!(namespace_sysctl("net.ipv4.neigh.eth0.gc_stale_time"));
        assert!(!namespace_sysctl("net.ipv4.neigh.default.gc_thresh1"));
        assert!(namespace_sysctl("net.ipv6.neigh.eth0.base_reachable_time_ms"));
        assert!(!namespace_sysctl("net.ipv6.neigh.default.gc_thresh2"));
    }

    #[test]
    fn sysctl_paths_map_dots_to_slashes() {
        assert_eq!(
            sysctl_path("net.ipv4.tcp_ecn"),
            PathBuf::from("/proc/sys/net/ipv4/tcp_ecn")
        );
    }

    #[test]
    fn harvest_skips_overridden_keys() {
        let mut overridden = HashSet::new();
        for (key, _) in NET_SYSCTLS {
            overridden.insert(key.to_string());
        }
        assert!(harvest_defaults(&overridden).is_empty());
    }
}
