//! The address record, and everything we remember about an address

use std::net::IpAddr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;
use std::str::FromStr;

use bitcoin::consensus::encode;
use bitcoin::consensus::Decodable;
use bitcoin::consensus::Encodable;
use bitcoin::p2p::ServiceFlags;

/// After this long without hearing about an address, we consider it gone
pub const HORIZON: u64 = 30 * 24 * 60 * 60; // 30 days

/// How many failed attempts, without a single success, before we give up on an address
pub const RETRIES: u32 = 3;

/// How many failed attempts since the last success before we give up on an address
pub const MAX_FAILURES: u32 = 10;

/// How old the last success must be before [`MAX_FAILURES`] kicks in
pub const MIN_FAIL: u64 = 7 * 24 * 60 * 60; // 7 days

/// Addresses we tried this recently are never terrible, give them a chance to connect
const RECENT_TRY: u64 = 60;

/// Timestamps this far in the future are bogus
const MAX_FUTURE_DRIFT: u64 = 10 * 60; // 10 minutes

/// Addresses we tried this recently are much less likely to be selected again
const SELECTION_COOLDOWN: u64 = 10 * 60; // 10 minutes

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// An address as someone announced it to us
pub struct PeerAddress {
    /// Where this peer listens
    pub addr: SocketAddr,

    /// Which services it claims to provide
    pub services: ServiceFlags,

    /// When the announcer last saw it, unix seconds
    pub time: u64,
}

impl PeerAddress {
    pub fn new(addr: SocketAddr, services: ServiceFlags, time: u64) -> Self {
        PeerAddress {
            addr: canonical(&addr),
            services,
            time,
        }
    }
}

// Only works for <IP:PORT>, there's no default port here. The address gets no
// services and no timestamp.
impl FromStr for PeerAddress {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr = s.parse::<SocketAddr>()?;
        Ok(PeerAddress::new(addr, ServiceFlags::NONE, 0))
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Everything we know about an address, and where it lives inside the address manager
pub struct AddrInfo {
    /// The address itself. IPv4-mapped IPv6 addresses are always stored as IPv4.
    pub addr: SocketAddr,

    /// Services this address claims to provide
    pub services: ServiceFlags,

    /// When this address was last seen, as told by whoever announced it
    pub time: u64,

    /// Who first told us about this address
    pub source: IpAddr,

    /// Last time we connected to it successfully
    pub last_success: u64,

    /// Last time we tried connecting to it
    pub last_try: u64,

    /// Last time an attempt counted as a failure
    pub(crate) last_count_attempt: u64,

    /// Failed attempts since the last success
    pub attempts: u32,

    /// How many new buckets point to this record
    pub(crate) ref_count: u8,

    /// Whether this record lives in the tried table
    pub(crate) in_tried: bool,

    /// Where this record is, inside the random ordering
    pub(crate) random_pos: usize,
}

impl AddrInfo {
    pub fn new(address: &PeerAddress, source: IpAddr) -> Self {
        AddrInfo {
            addr: canonical(&address.addr),
            services: address.services,
            time: address.time,
            source: source.to_canonical(),
            last_success: 0,
            last_try: 0,
            last_count_attempt: 0,
            attempts: 0,
            ref_count: 0,
            in_tried: false,
            random_pos: 0,
        }
    }

    /// Whether we ever connected to this address
    pub fn in_tried(&self) -> bool {
        self.in_tried
    }

    /// How many new buckets this record is in
    pub fn ref_count(&self) -> u8 {
        self.ref_count
    }

    /// The address, in the shape we gossip it
    pub fn peer_address(&self) -> PeerAddress {
        PeerAddress {
            addr: self.addr,
            services: self.services,
            time: self.time,
        }
    }

    /// Whether this address is not worth keeping around or sharing.
    ///
    /// An address is terrible if it was announced with a timestamp from the future, it
    /// wasn't seen in [`HORIZON`], or it keeps failing. Addresses we tried in the last minute
    /// get the benefit of the doubt.
    pub fn is_terrible(&self, now: u64) -> bool {
        if self.last_try != 0 && self.last_try >= now.saturating_sub(RECENT_TRY) {
            return false;
        }

        if self.time > now.saturating_add(MAX_FUTURE_DRIFT) {
            return true;
        }

        if self.time == 0 || now.saturating_sub(self.time) > HORIZON {
            return true;
        }

        // tried N times and never a success
        if self.last_success == 0 && self.attempts >= RETRIES {
            return true;
        }

        // N successive failures in the last week
        if now.saturating_sub(self.last_success) > MIN_FAIL && self.attempts >= MAX_FAILURES {
            return true;
        }

        false
    }

    /// The relative probability of picking this address during selection
    pub fn chance(&self, now: u64) -> f64 {
        let mut chance = 1.0;

        if now.saturating_sub(self.last_try) < SELECTION_COOLDOWN {
            chance *= 0.01;
        }

        // each failure makes it 34% less likely, capped at 8 failures
        chance * 0.66f64.powi(self.attempts.min(8) as i32)
    }
}

impl Encodable for AddrInfo {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        writer: &mut W,
    ) -> Result<usize, bitcoin::io::Error> {
        let mut len = 0;
        len += self.time.consensus_encode(writer)?;
        len += self.services.to_u64().consensus_encode(writer)?;
        len += ip_to_bytes(&self.addr.ip()).consensus_encode(writer)?;
        len += self.addr.port().consensus_encode(writer)?;
        len += ip_to_bytes(&self.source).consensus_encode(writer)?;
        len += self.last_success.consensus_encode(writer)?;
        len += self.last_try.consensus_encode(writer)?;
        len += self.attempts.consensus_encode(writer)?;

        Ok(len)
    }
}

impl Decodable for AddrInfo {
    fn consensus_decode<R: bitcoin::io::Read + ?Sized>(
        reader: &mut R,
    ) -> Result<Self, encode::Error> {
        let time = u64::consensus_decode(reader)?;
        let services = ServiceFlags::from(u64::consensus_decode(reader)?);
        let ip = ip_from_bytes(<[u8; 16]>::consensus_decode(reader)?);
        let port = u16::consensus_decode(reader)?;
        let source = ip_from_bytes(<[u8; 16]>::consensus_decode(reader)?);
        let last_success = u64::consensus_decode(reader)?;
        let last_try = u64::consensus_decode(reader)?;
        let attempts = u32::consensus_decode(reader)?;

        Ok(AddrInfo {
            addr: SocketAddr::new(ip, port),
            services,
            time,
            source,
            last_success,
            last_try,
            last_count_attempt: 0,
            attempts,
            ref_count: 0,
            in_tried: false,
            random_pos: 0,
        })
    }
}

/// Returns the address with IPv4-mapped IPv6 turned into plain IPv4, so both spellings
/// refer to the same record
pub fn canonical(addr: &SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

/// The 16-byte form of an address, IPv4 is mapped into IPv6
pub(crate) fn ip_to_bytes(ip: &IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(ipv4) => ipv4.to_ipv6_mapped().octets(),
        IpAddr::V6(ipv6) => ipv6.octets(),
    }
}

pub(crate) fn ip_from_bytes(bytes: [u8; 16]) -> IpAddr {
    IpAddr::V6(Ipv6Addr::from(bytes)).to_canonical()
}

/// The identity of an address: its IP followed by its port
pub(crate) fn address_key(addr: &SocketAddr) -> [u8; 18] {
    let mut key = [0; 18];
    key[..16].copy_from_slice(&ip_to_bytes(&addr.ip()));
    key[16..].copy_from_slice(&addr.port().to_be_bytes());
    key
}
