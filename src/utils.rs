use std::net::Ipv4Addr;

use ipnetwork::{IpNetwork, NetworkSize};
use itertools::Itertools;

// Determine if a given IpNetwork is a single IPv4 host
// If so, return the address
pub fn host_address(network: &IpNetwork) -> Option<Ipv4Addr> {
    let is_host = match network.size() {
        NetworkSize::V4(size) => size == 1,
        NetworkSize::V6(_) => false,
    };
    match (is_host, network) {
        (true, IpNetwork::V4(net)) => Some(net.ip()),
        _ => None,
    }
}

/// Split a `wg` allowed-ips field (comma or space delimited) into CIDRs,
/// dropping anything that doesn't parse
pub fn parse_allowed_ips(field: &str) -> Vec<IpNetwork> {
    field
        .split(|c| c == ',' || c == ' ')
        .filter(|chunk| !chunk.is_empty())
        .filter_map(|chunk| chunk.parse().ok())
        .collect()
}

/// Serialize CIDRs back into the comma-delimited form `wg set` expects
pub fn join_allowed_ips(networks: &[IpNetwork]) -> String {
    networks.iter().join(",")
}
