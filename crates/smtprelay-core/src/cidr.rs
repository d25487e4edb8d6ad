//! CIDR membership for user-edited range lists
//!
//! Range lists come from free-text configuration, so entries that are
//! blank or not of the form `a.b.c.d` or `a.b.c.d/n` are discarded
//! before evaluation. Membership over an empty or entirely invalid
//! list is `false`, never an error.

use ipnet::Ipv4Net;
use std::net::{IpAddr, Ipv4Addr};

/// Whether `ip` falls inside any of the configured ranges.
pub fn contains(ip: IpAddr, ranges: &[String]) -> bool {
    let Some(v4) = canonical_v4(ip) else {
        return false;
    };
    ranges
        .iter()
        .filter_map(|entry| parse_entry(entry))
        .any(|net| net.contains(&v4))
}

/// IPv4 address, unwrapping the v6-mapped form listeners report for
/// v4 peers on dual-stack sockets.
fn canonical_v4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

fn parse_entry(entry: &str) -> Option<Ipv4Net> {
    let entry = entry.trim();
    if entry.is_empty() {
        return None;
    }
    if entry.contains('/') {
        entry.parse::<Ipv4Net>().ok()
    } else {
        entry
            .parse::<Ipv4Addr>()
            .ok()
            .and_then(|addr| Ipv4Net::new(addr, 32).ok())
    }
}
