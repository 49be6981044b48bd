//! Network groups are a coarse notion of "who operates this address". We use them to limit
//! how much of our tables a single network can take over: addresses in the same group share
//! a handful of buckets, so an attacker with a large IP range still only gets a small slice
//! of our address manager.
//!
//! By default a group is an IP prefix (/16 for IPv4, /32 for most of IPv6). If an [`AsMap`]
//! is loaded, addresses it knows about are grouped by their autonomous system instead.

use std::fs::read_to_string;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::path::Path;
use std::str::FromStr;

use bitcoin::hashes::sha256;
use bitcoin::hashes::Hash;
use ipnet::IpNet;

use crate::error::AddrManError;

/// An opaque network group identifier. Two addresses with the same group are considered to be
/// under the same operator.
pub type NetGroup = Vec<u8>;

/// Group class for addresses we can't route to
const NET_UNROUTABLE: u8 = 0;

/// Group class for IPv4 prefixes, including IPv4 embedded into IPv6
const NET_IPV4: u8 = 1;

/// Group class for IPv6 prefixes
const NET_IPV6: u8 = 2;

/// Group class for addresses grouped by their autonomous system
const NET_ASN: u8 = 3;

/// Group class for our own machine
const NET_LOCAL: u8 = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
/// A table mapping IP prefixes to autonomous system numbers.
///
/// Lookups return the ASN of the longest matching prefix. The map also carries a checksum
/// that identifies it, we persist it alongside the address manager so we can tell whether
/// the buckets on disk were computed with the same grouping we are using now.
pub struct AsMap {
    /// Prefixes and their ASNs, longest prefixes first
    entries: Vec<(IpNet, u32)>,

    /// sha256 of the canonical encoding of `entries`
    checksum: [u8; 32],
}

impl AsMap {
    /// Builds a map from a list of prefixes and their ASNs
    pub fn new(entries: impl IntoIterator<Item = (IpNet, u32)>) -> Self {
        let mut entries: Vec<(IpNet, u32)> = entries
            .into_iter()
            .map(|(net, asn)| (net.trunc(), asn))
            .collect();

        entries.sort_by(|(net_a, asn_a), (net_b, asn_b)| {
            net_b
                .prefix_len()
                .cmp(&net_a.prefix_len())
                .then(net_a.cmp(net_b))
                .then(asn_a.cmp(asn_b))
        });
        entries.dedup();

        let mut canonical = Vec::with_capacity(entries.len() * 22);
        for (net, asn) in entries.iter() {
            match net {
                IpNet::V4(net) => {
                    canonical.push(4);
                    canonical.extend_from_slice(&net.network().octets());
                }
                IpNet::V6(net) => {
                    canonical.push(6);
                    canonical.extend_from_slice(&net.network().octets());
                }
            }
            canonical.push(net.prefix_len());
            canonical.extend_from_slice(&asn.to_le_bytes());
        }

        let checksum = sha256::Hash::hash(&canonical).to_byte_array();
        AsMap { entries, checksum }
    }

    /// Parses a map from text, one `<prefix> <asn>` pair per line.
    ///
    /// The ASN may be written as `AS1234` or just `1234`. Empty lines and lines starting
    /// with `#` are ignored.
    pub fn parse(text: &str) -> Result<Self, AddrManError> {
        let mut entries = Vec::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split_whitespace();
            let (Some(prefix), Some(asn), None) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(AddrManError::InvalidAsMap(format!(
                    "line {}: expected `<prefix> <asn>`",
                    number + 1
                )));
            };

            let net = IpNet::from_str(prefix).map_err(|e| {
                AddrManError::InvalidAsMap(format!("line {}: {prefix}: {e}", number + 1))
            })?;

            let asn = asn.trim_start_matches("AS").parse::<u32>().map_err(|e| {
                AddrManError::InvalidAsMap(format!("line {}: {asn}: {e}", number + 1))
            })?;

            entries.push((net, asn));
        }

        Ok(AsMap::new(entries))
    }

    /// Reads and parses a map from a file
    pub fn from_file(path: &Path) -> Result<Self, AddrManError> {
        let text = read_to_string(path)?;
        AsMap::parse(&text)
    }

    /// Returns the ASN announcing this address, if we know about it
    pub fn lookup(&self, ip: &IpAddr) -> Option<u32> {
        let ip = ip.to_canonical();
        self.entries
            .iter()
            .find(|(net, _)| net.contains(&ip))
            .map(|(_, asn)| *asn)
    }

    /// The identity of this map
    pub fn checksum(&self) -> [u8; 32] {
        self.checksum
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
/// Computes network groups, using an [`AsMap`] when one is loaded
pub struct NetGroupManager {
    asmap: Option<AsMap>,
}

impl NetGroupManager {
    pub fn new(asmap: Option<AsMap>) -> Self {
        NetGroupManager { asmap }
    }

    /// Whether we are grouping by ASN
    pub fn has_asmap(&self) -> bool {
        self.asmap.is_some()
    }

    /// The identity of the grouping in use, all zeros if we use plain prefixes
    pub fn asmap_checksum(&self) -> [u8; 32] {
        self.asmap
            .as_ref()
            .map(AsMap::checksum)
            .unwrap_or([0; 32])
    }

    /// The ASN this address belongs to, if we have a map and it knows the address
    pub fn mapped_asn(&self, ip: &IpAddr) -> Option<u32> {
        let ip = ip.to_canonical();
        if is_local(&ip) || !is_routable(&ip) {
            return None;
        }

        self.asmap.as_ref()?.lookup(&ip)
    }

    /// Returns the network group for this address
    pub fn group(&self, ip: &IpAddr) -> NetGroup {
        let ip = ip.to_canonical();
        if let Some(asn) = self.mapped_asn(&ip) {
            let mut group = vec![NET_ASN];
            group.extend_from_slice(&asn.to_le_bytes());
            return group;
        }

        if is_local(&ip) {
            return vec![NET_LOCAL];
        }

        if !is_routable(&ip) {
            return vec![NET_UNROUTABLE];
        }

        match ip {
            IpAddr::V4(ipv4) => prefix_group(NET_IPV4, &ipv4.octets(), 16),
            IpAddr::V6(ipv6) => Self::ipv6_group(&ipv6),
        }
    }

    fn ipv6_group(ip: &Ipv6Addr) -> NetGroup {
        let octets = ip.octets();
        match octets {
            // RFC 3964 - 6to4 - 2002::/16, the IPv4 address follows the prefix
            [0x20, 0x02, a, b, ..] => prefix_group(NET_IPV4, &[a, b], 16),

            // RFC 4380 - Teredo - 2001::/32, the client IPv4 is the last four bytes, inverted
            [0x20, 0x01, 0x00, 0x00, .., a, b, _, _] => {
                vec![NET_IPV4, a ^ 0xff, b ^ 0xff]
            }

            // Hurricane Electric hands out /48s from 2001:470::/32, look a little deeper
            [0x20, 0x01, 0x04, 0x70, ..] => prefix_group(NET_IPV6, &octets, 36),

            _ => prefix_group(NET_IPV6, &octets, 32),
        }
    }
}

/// Takes the first `bits` bits of `octets`, with the remaining bits of a partial byte set to one
fn prefix_group(class: u8, octets: &[u8], bits: usize) -> NetGroup {
    let mut group = vec![class];
    let mut remaining = bits;

    for byte in octets {
        if remaining == 0 {
            break;
        }

        if remaining >= 8 {
            group.push(*byte);
            remaining -= 8;
        } else {
            group.push(byte | ((1u8 << (8 - remaining)) - 1));
            remaining = 0;
        }
    }

    group
}

/// Whether this address points to our own machine
pub fn is_local(ip: &IpAddr) -> bool {
    match ip.to_canonical() {
        IpAddr::V4(ipv4) => ipv4.is_loopback() || ipv4.octets()[0] == 0,
        IpAddr::V6(ipv6) => ipv6.is_loopback(),
    }
}

/// Whether this address is reachable over the public internet
pub fn is_routable(ip: &IpAddr) -> bool {
    match ip.to_canonical() {
        IpAddr::V4(ipv4) => is_routable_ipv4(&ipv4),
        IpAddr::V6(ipv6) => is_routable_ipv6(&ipv6),
    }
}

const fn is_routable_ipv4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();

    // 0.0.0.0/8 - "This" network
    if octets[0] == 0 {
        return false;
    }

    // Loopback, broadcast, private (RFC 1918)
    if ip.is_loopback() || ip.is_broadcast() || ip.is_private() {
        return false;
    }

    // RFC 2544 - Benchmarking - 198.18.0.0/15
    if octets[0] == 198 && (octets[1] == 18 || octets[1] == 19) {
        return false;
    }

    // RFC 3927 - Link-Local - 169.254.0.0/16
    if ip.is_link_local() {
        return false;
    }

    // RFC 6598 - Shared Address Space (CGNAT) - 100.64.0.0/10
    if octets[0] == 100 && (octets[1] >= 64 && octets[1] <= 127) {
        return false;
    }

    // RFC 5737 - Documentation (TEST-NET-1, TEST-NET-2, TEST-NET-3)
    if ip.is_documentation() {
        return false;
    }

    true
}

const fn is_routable_ipv6(ip: &Ipv6Addr) -> bool {
    let octets = ip.octets();

    // Unspecified, loopback, unique local (RFC 4193 - fc00::/7)
    if ip.is_unspecified() || ip.is_loopback() || ip.is_unique_local() {
        return false;
    }

    // RFC 3849 - Documentation - 2001:db8::/32
    if octets[0] == 0x20 && octets[1] == 0x01 && octets[2] == 0x0d && octets[3] == 0xb8 {
        return false;
    }

    // RFC 4843 - ORCHID - 2001:10::/28
    if octets[0] == 0x20 && octets[1] == 0x01 && octets[2] == 0x00 && (octets[3] & 0xF0) == 0x10
    {
        return false;
    }

    // RFC 4862 - Link-local - fe80::/64
    if octets[0] == 0xFE && (octets[1] & 0xC0) == 0x80 {
        return false;
    }

    // RFC 7343 - ORCHIDv2 - 2001:20::/28
    if octets[0] == 0x20 && octets[1] == 0x01 && octets[2] == 0x00 && (octets[3] & 0xf0) == 0x20
    {
        return false;
    }

    true
}
