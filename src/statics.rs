//! Static host assignments declared with `dhcp-host`.
//!
//! dnsmasq's `dhcp-host` grammar is wide; this index only cares about
//! MAC↔IPv4 bindings:
//!
//! ```text
//! dhcp-host=<mac-or-hostname>,<ip>[,<hostname>]
//! ```
//!
//! Tokens prefixed `set:`, `tag:` or `id:`, lease times, and bracketed IPv6
//! addresses are tolerated and skipped. Hosts identified only by name are
//! recorded separately and never used to classify leases, since leases are
//! keyed by MAC and IP.
//!
//! Each IP binds to one MAC. A `dhcp-host` listing several MACs for one
//! address (wired and wireless interfaces of one machine) binds only the
//! first; leases held by the others are classified dynamic.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use serde::Serialize;
use tracing::{debug, warn};

use crate::conf::directives;
use crate::error::Error;
use crate::fragment::FragmentSet;
use crate::lease::normalize_mac;
use crate::pool::LeaseDuration;

const HOST_KEY: &str = "dhcp-host";
const SKIPPED_PREFIXES: [&str; 3] = ["set:", "tag:", "id:"];

/// One MAC↔IP binding from the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaticAssignment {
    pub mac_address: String,
    pub ip_address: Ipv4Addr,
    pub hostname: Option<String>,
}

/// The parts of a `dhcp-host` value this index uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDirective {
    pub macs: Vec<String>,
    pub ip: Ipv4Addr,
    /// Plain tokens in order: identifier (when no MAC is given), then hostname.
    pub names: Vec<String>,
}

/// Parses the value of one `dhcp-host` directive.
///
/// Returns `Ok(None)` for `ignore` declarations.
pub fn parse_dhcp_host(value: &str) -> std::result::Result<Option<HostDirective>, String> {
    let mut macs = Vec::new();
    let mut ip = None;
    let mut names = Vec::new();

    for token in value.split(',').map(str::trim).filter(|token| !token.is_empty()) {
        if SKIPPED_PREFIXES.iter().any(|prefix| token.starts_with(prefix)) {
            continue;
        }
        if token == "ignore" {
            return Ok(None);
        }
        if token.starts_with('[') {
            continue;
        }
        if let Ok(address) = token.parse::<Ipv4Addr>() {
            if let Some(previous) = ip {
                return Err(format!("multiple IPv4 addresses {} and {}", previous, address));
            }
            ip = Some(address);
            continue;
        }
        if let Some(mac) = normalize_mac(token) {
            macs.push(mac);
            continue;
        }
        if token.contains(':') {
            // Wildcard MACs and hardware-type prefixed MACs cannot match a lease.
            debug!("Ignoring unmatched hardware address {:?}", token);
            continue;
        }
        if LeaseDuration::parse(token).is_some() {
            continue;
        }
        names.push(token.to_string());
    }

    let ip = ip.ok_or("no IPv4 address")?;
    if macs.is_empty() && names.is_empty() {
        return Err("no MAC address or hostname".to_string());
    }
    Ok(Some(HostDirective { macs, ip, names }))
}

/// Bidirectional lookup of static MAC↔IP bindings.
#[derive(Debug, Clone, Default)]
pub struct StaticAssignmentIndex {
    mac_to_ip: HashMap<String, Ipv4Addr>,
    ip_to_mac: HashMap<Ipv4Addr, String>,
    hostnames: HashMap<String, String>,
    by_name: HashMap<String, Ipv4Addr>,
}

impl StaticAssignmentIndex {
    /// Scans the root file and every fragment for `dhcp-host` directives.
    pub fn from_fragments(fragments: &FragmentSet) -> Self {
        let mut index = Self::default();
        for fragment in fragments.iter() {
            index.scan_text(&fragment.origin(), &fragment.contents);
        }
        debug!(
            "Indexed {} static MAC bindings and {} named hosts",
            index.mac_to_ip.len(),
            index.by_name.len()
        );
        index
    }

    fn scan_text(&mut self, origin: &str, text: &str) {
        for directive in directives(text).filter(|directive| directive.key == HOST_KEY) {
            match parse_dhcp_host(directive.value) {
                Ok(Some(host)) => self.insert_directive(host),
                Ok(None) => {}
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

    fn insert_directive(&mut self, host: HostDirective) {
        let Some((mac, extra)) = host.macs.split_first() else {
            if let Some(name) = host.names.first() {
                self.insert_name(name, host.ip);
            }
            return;
        };
        if !extra.is_empty() {
            warn!(
                "Static host {} lists {} more MAC addresses ({}); only {} is bound",
                host.ip,
                extra.len(),
                extra.join(", "),
                mac
            );
        }
        self.insert(mac, host.ip, host.names.first().cloned());
    }

    /// Records a MAC↔IP binding. Later bindings replace earlier conflicting
    /// ones for either the MAC or the IP.
    pub fn insert(&mut self, mac: &str, ip: Ipv4Addr, hostname: Option<String>) {
        let mac = normalize_mac(mac).unwrap_or_else(|| mac.to_lowercase());

        if let Some(old_ip) = self.mac_to_ip.get(&mac).copied()
            && old_ip != ip
        {
            warn!(
                "Static host {} declared for both {} and {}, using {}",
                mac, old_ip, ip, ip
            );
            self.ip_to_mac.remove(&old_ip);
        }

        if let Some(old_mac) = self.ip_to_mac.get(&ip).cloned()
            && old_mac != mac
        {
            warn!(
                "Static address {} declared for both {} and {}, using {}",
                ip, old_mac, mac, mac
            );
            self.mac_to_ip.remove(&old_mac);
            self.hostnames.remove(&old_mac);
        }

        self.mac_to_ip.insert(mac.clone(), ip);
        self.ip_to_mac.insert(ip, mac.clone());
        match hostname {
            Some(hostname) => {
                self.hostnames.insert(mac, hostname);
            }
            None => {
                self.hostnames.remove(&mac);
            }
        }
    }

    fn insert_name(&mut self, name: &str, ip: Ipv4Addr) {
        let key = name.to_lowercase();
        if let Some(old_ip) = self.by_name.insert(key, ip)
            && old_ip != ip
        {
            warn!(
                "Static host name {} declared for both {} and {}, using {}",
                name, old_ip, ip, ip
            );
        }
    }

    /// Returns true iff the configuration binds exactly this MAC to this IP.
    ///
    /// A MAC-only or IP-only match is logged as an inconsistency between the
    /// configuration and the lease table and classified dynamic.
    pub fn is_static_lease(&self, mac: &str, ip: Ipv4Addr) -> bool {
        let mac_binding = self.mac_to_ip.get(mac).copied();
        let ip_binding = self.ip_to_mac.get(&ip);

        match (mac_binding, ip_binding) {
            (Some(bound_ip), _) if bound_ip == ip => true,
            (Some(bound_ip), _) => {
                warn!(
                    "Lease {} for {} contradicts static binding to {}",
                    ip, mac, bound_ip
                );
                false
            }
            (None, Some(bound_mac)) => {
                warn!(
                    "Lease {} held by {} but statically bound to {}",
                    ip, mac, bound_mac
                );
                false
            }
            (None, None) => false,
        }
    }

    pub fn ip_for_mac(&self, mac: &str) -> Option<Ipv4Addr> {
        self.mac_to_ip.get(mac).copied()
    }

    pub fn mac_for_ip(&self, ip: Ipv4Addr) -> Option<&str> {
        self.ip_to_mac.get(&ip).map(String::as_str)
    }

    /// IP of a host declared by name only.
    pub fn ip_for_name(&self, name: &str) -> Option<Ipv4Addr> {
        self.by_name.get(&name.to_lowercase()).copied()
    }

    /// All MAC bindings, sorted by IP.
    pub fn assignments(&self) -> Vec<StaticAssignment> {
        let mut assignments: Vec<StaticAssignment> = self
            .mac_to_ip
            .iter()
            .map(|(mac, ip)| StaticAssignment {
                mac_address: mac.clone(),
                ip_address: *ip,
                hostname: self.hostnames.get(mac).cloned(),
            })
            .collect();
        assignments.sort_by_key(|assignment| assignment.ip_address);
        assignments
    }

    /// Number of MAC bindings.
    pub fn len(&self) -> usize {
        self.mac_to_ip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mac_to_ip.is_empty()
    }

    /// Number of hosts declared by name only.
    pub fn named_len(&self) -> usize {
        self.by_name.len()
    }
}
