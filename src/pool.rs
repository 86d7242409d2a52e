//! DHCP address pools declared with `dhcp-range`.
//!
//! Accepted shape (dnsmasq syntax, IPv4 only):
//!
//! ```text
//! dhcp-range=[<tag>|set:<tag>|net:<tag>,][tag:<tag>,...]<start>,<end>[,<mode>][,<netmask>[,<broadcast>]][,<lease-time>]
//! ```
//!
//! The pool is named by a bare leading tag or a `set:`/`net:` tag; pools
//! without one are named `default`. IPv6 ranges and
//! single-address `static`/`proxy` declarations describe no dynamic pool and
//! are ignored.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Serialize, Serializer};
use tracing::{debug, warn};

use crate::conf::directives;
use crate::error::Error;
use crate::fragment::FragmentSet;

/// Pool name used when a `dhcp-range` carries no tag.
pub const DEFAULT_POOL_NAME: &str = "default";

const RANGE_KEY: &str = "dhcp-range";

/// Prefixes whose value names the pool. `net:` is the deprecated spelling.
const NAME_PREFIXES: [&str; 2] = ["set:", "net:"];

/// Prefixes that may lead a `dhcp-range` value without naming the pool.
const SKIPPED_PREFIXES: [&str; 2] = ["tag:", "constructor:"];

/// Mode keywords that may appear between the addresses and the lease time.
const MODE_KEYWORDS: [&str; 8] = [
    "static",
    "proxy",
    "ra-only",
    "ra-names",
    "ra-stateless",
    "ra-advrouter",
    "slaac",
    "off-link",
];

/// How long leases from a pool last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseDuration {
    Seconds(u64),
    Infinite,
}

impl LeaseDuration {
    /// Parses a dnsmasq lease time: seconds, a number with an `s`, `m`, `h`,
    /// `d` or `w` suffix, or `infinite`.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("infinite") {
            return Some(LeaseDuration::Infinite);
        }

        let (digits, multiplier) = match value.char_indices().last()? {
            (index, unit) if unit.is_ascii_alphabetic() => {
                let multiplier = match unit.to_ascii_lowercase() {
                    's' => 1,
                    'm' => 60,
                    'h' => 3600,
                    'd' => 86_400,
                    'w' => 604_800,
                    _ => return None,
                };
                (&value[..index], multiplier)
            }
            _ => (value, 1),
        };

        if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
            return None;
        }
        let amount: u64 = digits.parse().ok()?;
        amount.checked_mul(multiplier).map(LeaseDuration::Seconds)
    }
}

impl fmt::Display for LeaseDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseDuration::Seconds(seconds) => write!(f, "{}s", seconds),
            LeaseDuration::Infinite => write!(f, "infinite"),
        }
    }
}

impl Serialize for LeaseDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            LeaseDuration::Seconds(seconds) => serializer.serialize_u64(*seconds),
            LeaseDuration::Infinite => serializer.serialize_str("infinite"),
        }
    }
}

/// A contiguous IPv4 range handed out by dnsmasq.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pool {
    pub pool_name: String,
    pub start_ip: Ipv4Addr,
    pub end_ip: Ipv4Addr,
    pub netmask: Option<Ipv4Addr>,
    pub lease_duration: Option<LeaseDuration>,
    /// `end - start + 1`.
    pub total_addresses: u64,
}

impl Pool {
    /// Creates a pool, or `None` if `start_ip > end_ip`.
    pub fn new(
        pool_name: impl Into<String>,
        start_ip: Ipv4Addr,
        end_ip: Ipv4Addr,
        netmask: Option<Ipv4Addr>,
        lease_duration: Option<LeaseDuration>,
    ) -> Option<Self> {
        let start = u32::from(start_ip);
        let end = u32::from(end_ip);
        if start > end {
            return None;
        }
        Some(Self {
            pool_name: pool_name.into(),
            start_ip,
            end_ip,
            netmask,
            lease_duration,
            total_addresses: u64::from(end - start) + 1,
        })
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        addr >= u32::from(self.start_ip) && addr <= u32::from(self.end_ip)
    }
}

/// A bare leading network id, such as `lan` in `lan,10.0.0.10,10.0.0.50`.
///
/// Anything made only of digits and dots is a (possibly malformed) IPv4
/// address, and anything with `:` is IPv6 or an unknown prefix.
fn is_network_id(field: &str) -> bool {
    !field.contains(':') && !field.bytes().all(|byte| byte.is_ascii_digit() || byte == b'.')
}

/// Parses the value of one `dhcp-range` directive.
///
/// Returns `Ok(None)` for declarations that describe no IPv4 dynamic pool,
/// and `Err(reason)` for malformed ones.
pub fn parse_dhcp_range(value: &str) -> std::result::Result<Option<Pool>, String> {
    let mut name = DEFAULT_POOL_NAME.to_string();
    let mut fields = value
        .split(',')
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .peekable();

    while let Some(&field) = fields.peek() {
        if let Some(&prefix) = NAME_PREFIXES.iter().find(|prefix| field.starts_with(**prefix)) {
            name = field[prefix.len()..].to_string();
        } else if SKIPPED_PREFIXES.iter().any(|prefix| field.starts_with(prefix)) {
            // Matches against other tags; does not name the pool.
        } else if is_network_id(field) {
            name = field.to_string();
        } else {
            break;
        }
        fields.next();
    }

    let start = fields.next().ok_or("missing start address")?;
    if start.contains(':') {
        return Ok(None);
    }
    let start_ip: Ipv4Addr = start
        .parse()
        .map_err(|_| format!("invalid start address {:?}", start))?;

    let end = fields.next().ok_or("missing end address")?;
    if MODE_KEYWORDS.contains(&end) {
        return Ok(None);
    }
    let end_ip: Ipv4Addr = end
        .parse()
        .map_err(|_| format!("invalid end address {:?}", end))?;

    let mut netmask = None;
    let mut lease_duration = None;
    for field in fields {
        if MODE_KEYWORDS.contains(&field) {
            continue;
        }
        if let Ok(address) = field.parse::<Ipv4Addr>() {
            // The second address after the range is the broadcast address.
            if netmask.is_none() {
                netmask = Some(address);
            }
            continue;
        }
        match LeaseDuration::parse(field) {
            Some(duration) => lease_duration = Some(duration),
            None => return Err(format!("unrecognized field {:?}", field)),
        }
    }

    Pool::new(name, start_ip, end_ip, netmask, lease_duration)
        .map(Some)
        .ok_or_else(|| format!("start {} is after end {}", start_ip, end_ip))
}

/// All pools declared across a configuration tree, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolRegistry {
    pools: Vec<Pool>,
}

impl PoolRegistry {
    pub fn from_pools(pools: Vec<Pool>) -> Self {
        Self { pools }
    }

    /// Scans the root file and every fragment for `dhcp-range` directives.
    ///
    /// Malformed entries are logged and skipped.
    pub fn from_fragments(fragments: &FragmentSet) -> Self {
        let mut registry = Self::default();
        for fragment in fragments.iter() {
            registry.scan_text(&fragment.origin(), &fragment.contents);
        }
        debug!("Discovered {} DHCP pools", registry.pools.len());
        registry
    }

    fn scan_text(&mut self, origin: &str, text: &str) {
        for directive in directives(text).filter(|directive| directive.key == RANGE_KEY) {
            match parse_dhcp_range(directive.value) {
                Ok(Some(pool)) => {
                    debug!(
                        "Pool {}: {} - {} ({} addresses)",
                        pool.pool_name, pool.start_ip, pool.end_ip, pool.total_addresses
                    );
                    self.pools.push(pool);
                }
                Ok(None) => debug!(
                    "{}:{}: dhcp-range declares no IPv4 pool",
                    origin, directive.line
                ),
                Err(reason) => warn!(
                    "{}",
                    Error::ParseSkipped {
                        origin: origin.to_string(),
                        line: directive.line,
                        reason,
                    }
                ),
            }
        }
    }

    pub fn pools(&self) -> &[Pool] {
        &self.pools
    }

    /// Returns the first pool declared with this name.
    pub fn get(&self, name: &str) -> Option<&Pool> {
        self.pools.iter().find(|pool| pool.pool_name == name)
    }

    /// Returns the first declared pool whose range contains `ip`.
    pub fn pool_for(&self, ip: Ipv4Addr) -> Option<&Pool> {
        self.pools.iter().find(|pool| pool.contains(ip))
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}
