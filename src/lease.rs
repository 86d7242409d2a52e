//! dnsmasq lease file parsing.
//!
//! dnsmasq writes one lease per line:
//!
//! ```text
//! <expiry-epoch> <mac> <ip> <hostname|*> [<client-id|*>]
//! ```
//!
//! An expiry of `0` means the lease never expires. Such leases are static
//! whether or not the configuration declares a `dhcp-host` for them. When
//! DHCPv6 is enabled the file also carries a `duid` line, which is skipped.
//!
//! Each parse produces fresh, immutable [`Lease`] values; nothing here keeps
//! state between scans.

use std::net::Ipv4Addr;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pool::PoolRegistry;
use crate::statics::StaticAssignmentIndex;

/// Marker dnsmasq writes for an unknown hostname or client id.
const UNKNOWN_FIELD: &str = "*";

/// Expiry value meaning "never expires".
const INFINITE_EXPIRY: i64 = 0;

const MIN_LEASE_FIELDS: usize = 4;

/// Normalizes a MAC address to lowercase, colon-separated form.
///
/// Accepts `:` or `-` separated octets (one or two hex digits each) and the
/// bare 12-digit form. Returns `None` for anything else, including wildcards.
pub fn normalize_mac(value: &str) -> Option<String> {
    let value = value.trim();
    let octets: Vec<u8> = if value.contains([':', '-']) {
        let parts: Vec<&str> = value.split([':', '-']).collect();
        if parts.len() != 6 {
            return None;
        }
        parts
            .iter()
            .map(|part| {
                if part.is_empty() || part.len() > 2 || !is_hex(part) {
                    return None;
                }
                u8::from_str_radix(part, 16).ok()
            })
            .collect::<Option<Vec<u8>>>()?
    } else {
        if value.len() != 12 || !is_hex(value) {
            return None;
        }
        (0..12)
            .step_by(2)
            .map(|index| u8::from_str_radix(&value[index..index + 2], 16).ok())
            .collect::<Option<Vec<u8>>>()?
    };

    Some(
        octets
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect::<Vec<_>>()
            .join(":"),
    )
}

fn is_hex(value: &str) -> bool {
    value.bytes().all(|byte| byte.is_ascii_hexdigit())
}

/// One allocation from the dnsmasq lease file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Key of the lease within a snapshot.
    pub ip_address: Ipv4Addr,

    /// Normalized lowercase, colon-separated MAC.
    pub mac_address: String,

    /// `None` when dnsmasq recorded `*`.
    pub hostname: Option<String>,

    /// When this lease expires (UTC). `None` means never.
    #[serde(rename = "lease_time")]
    pub expires_at: Option<DateTime<Utc>>,

    pub client_id: Option<String>,

    /// Whether the lease was live at the time it was parsed.
    pub is_active: bool,

    /// Declared by `dhcp-host` for this exact MAC and IP, or never expiring.
    pub is_static: bool,

    /// First configured pool containing the address.
    pub pool_name: Option<String>,
}

impl Lease {
    /// Returns true if the lease never expires.
    pub fn is_infinite(&self) -> bool {
        self.expires_at.is_none()
    }

    /// Returns true if the lease is live at `now`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            None => true,
            Some(expires_at) => expires_at > now,
        }
    }

    /// Seconds remaining at `now`, clamped at 0. `None` for infinite leases.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expires_at
            .map(|expires_at| (expires_at - now).num_seconds().max(0))
    }

    /// Returns true if any attribute tracked for change detection differs.
    ///
    /// Activity is not compared; a lease running out is reported separately.
    pub fn differs_from(&self, other: &Lease) -> bool {
        self.mac_address != other.mac_address
            || self.hostname != other.hostname
            || self.expires_at != other.expires_at
            || self.client_id != other.client_id
            || self.is_static != other.is_static
    }
}

/// Parses lease files against one configuration scan.
#[derive(Debug, Clone, Copy)]
pub struct LeaseFileParser<'a> {
    statics: &'a StaticAssignmentIndex,
    pools: &'a PoolRegistry,
    now: DateTime<Utc>,
}

impl<'a> LeaseFileParser<'a> {
    /// Creates a parser evaluating activity against `now`.
    pub fn new(
        statics: &'a StaticAssignmentIndex,
        pools: &'a PoolRegistry,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            statics,
            pools,
            now,
        }
    }

    /// Reads and parses a lease file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LeaseFileUnreadable`] if the file cannot be read.
    /// Malformed lines are logged and skipped.
    pub fn parse_file(&self, path: &Path) -> Result<Vec<Lease>> {
        let content =
            std::fs::read_to_string(path).map_err(|source| Error::LeaseFileUnreadable {
                path: path.to_path_buf(),
                source,
            })?;
        let leases = self.parse_str(&path.display().to_string(), &content);
        debug!("Parsed {} leases from {}", leases.len(), path.display());
        Ok(leases)
    }

    /// Parses lease file contents. `origin` names the source in log messages.
    pub fn parse_str(&self, origin: &str, content: &str) -> Vec<Lease> {
        let mut leases = Vec::new();
        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("duid ") {
                continue;
            }
            match self.parse_line(line) {
                Ok(lease) => leases.push(lease),
                Err(reason) => warn!(
                    "{}",
                    Error::ParseSkipped {
                        origin: origin.to_string(),
                        line: index + 1,
                        reason,
                    }
                ),
            }
        }
        leases
    }

    /// Parses one non-empty lease line.
    pub fn parse_line(&self, line: &str) -> std::result::Result<Lease, String> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < MIN_LEASE_FIELDS {
            return Err(format!(
                "expected at least {} fields, found {}",
                MIN_LEASE_FIELDS,
                fields.len()
            ));
        }

        let epoch: i64 = fields[0]
            .parse()
            .map_err(|_| format!("invalid expiry {:?}", fields[0]))?;
        let mac_address =
            normalize_mac(fields[1]).ok_or_else(|| format!("invalid MAC {:?}", fields[1]))?;
        let ip_address: Ipv4Addr = fields[2]
            .parse()
            .map_err(|_| format!("invalid IPv4 address {:?}", fields[2]))?;
        let hostname = known_field(fields[3]);
        let client_id = fields.get(4).copied().and_then(known_field);

        let expires_at = if epoch == INFINITE_EXPIRY {
            None
        } else {
            Some(
                DateTime::<Utc>::from_timestamp(epoch, 0)
                    .ok_or_else(|| format!("expiry {} out of range", epoch))?,
            )
        };

        let is_active = match expires_at {
            None => true,
            Some(expires_at) => expires_at > self.now,
        };
        let is_static =
            expires_at.is_none() || self.statics.is_static_lease(&mac_address, ip_address);
        let pool_name = self
            .pools
            .pool_for(ip_address)
            .map(|pool| pool.pool_name.clone());

        Ok(Lease {
            ip_address,
            mac_address,
            hostname,
            expires_at,
            client_id,
            is_active,
            is_static,
            pool_name,
        })
    }
}

fn known_field(value: &str) -> Option<String> {
    if value == UNKNOWN_FIELD {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;
    use chrono::TimeDelta;

    fn fixtures() -> (StaticAssignmentIndex, PoolRegistry) {
        let mut statics = StaticAssignmentIndex::default();
        statics.insert("aa:bb:cc:dd:ee:01", Ipv4Addr::new(10, 1, 1, 5), Some("nas".to_string()));
        let pools = PoolRegistry::from_pools(vec![
            Pool::new(
                "intranet",
                Ipv4Addr::new(10, 1, 1, 10),
                Ipv4Addr::new(10, 1, 1, 199),
                None,
                None,
            )
            .unwrap(),
        ]);
        (statics, pools)
    }

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_normalize_mac() {
        assert_eq!(normalize_mac("AA:BB:CC:DD:EE:FF").as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(normalize_mac("aa-bb-cc-dd-ee-ff").as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(normalize_mac("AABBCCDDEEFF").as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(normalize_mac("a:b:c:d:e:f").as_deref(), Some("0a:0b:0c:0d:0e:0f"));
        assert_eq!(normalize_mac("11:22:33:*:*:*"), None);
        assert_eq!(normalize_mac("aa:bb:cc:dd:ee"), None);
        assert_eq!(normalize_mac("printer"), None);
        assert_eq!(normalize_mac("aabbccddeeffé"), None);
        assert_eq!(normalize_mac("+a:bb:cc:dd:ee:ff"), None);
    }

    #[test]
    fn test_lease_struct() {
        let (statics, pools) = fixtures();
        let parser = LeaseFileParser::new(&statics, &pools, now());
        let expiry = now() + TimeDelta::seconds(3600);
        let line = format!(
            "{} AA:BB:CC:DD:EE:02 10.1.1.50 laptop 01:aa:bb:cc:dd:ee:02",
            expiry.timestamp()
        );

        let lease = parser.parse_line(&line).unwrap();
        assert_eq!(lease.ip_address, Ipv4Addr::new(10, 1, 1, 50));
        assert_eq!(lease.mac_address, "aa:bb:cc:dd:ee:02");
        assert_eq!(lease.hostname.as_deref(), Some("laptop"));
        assert_eq!(lease.client_id.as_deref(), Some("01:aa:bb:cc:dd:ee:02"));
        assert_eq!(lease.expires_at, Some(expiry));
        assert!(lease.is_active);
        assert!(!lease.is_static);
        assert_eq!(lease.pool_name.as_deref(), Some("intranet"));
        assert_eq!(lease.remaining_seconds(now()), Some(3600));
        assert!(!lease.is_active_at(expiry));
    }

    #[test]
    fn test_unknown_fields_and_expired() {
        let (statics, pools) = fixtures();
        let parser = LeaseFileParser::new(&statics, &pools, now());
        let line = format!("{} aa:bb:cc:dd:ee:03 10.9.9.9 * *", now().timestamp() - 1);

        let lease = parser.parse_line(&line).unwrap();
        assert_eq!(lease.hostname, None);
        assert_eq!(lease.client_id, None);
        assert!(!lease.is_active);
        assert_eq!(lease.pool_name, None);
        assert_eq!(lease.remaining_seconds(now()), Some(0));
    }

    #[test]
    fn test_expiry_equal_to_now_is_inactive() {
        let (statics, pools) = fixtures();
        let parser = LeaseFileParser::new(&statics, &pools, now());
        let line = format!("{} aa:bb:cc:dd:ee:03 10.1.1.60 host", now().timestamp());
        assert!(!parser.parse_line(&line).unwrap().is_active);
    }

    #[test]
    fn test_infinite_lease_is_static_and_active() {
        let (statics, pools) = fixtures();
        let parser = LeaseFileParser::new(&statics, &pools, now());

        let lease = parser.parse_line("0 aa:bb:cc:dd:ee:09 10.1.1.70 tv").unwrap();
        assert!(lease.is_infinite());
        assert!(lease.is_active);
        assert!(lease.is_static);
        assert_eq!(lease.remaining_seconds(now()), None);
    }

    #[test]
    fn test_static_classification() {
        let (statics, pools) = fixtures();
        let parser = LeaseFileParser::new(&statics, &pools, now());
        let expiry = now().timestamp() + 600;

        let matching = parser
            .parse_line(&format!("{} aa:bb:cc:dd:ee:01 10.1.1.5 nas", expiry))
            .unwrap();
        assert!(matching.is_static);

        let moved = parser
            .parse_line(&format!("{} aa:bb:cc:dd:ee:01 10.1.1.6 nas", expiry))
            .unwrap();
        assert!(!moved.is_static);

        let squatter = parser
            .parse_line(&format!("{} aa:bb:cc:dd:ee:77 10.1.1.5 other", expiry))
            .unwrap();
        assert!(!squatter.is_static);
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let (statics, pools) = fixtures();
        let parser = LeaseFileParser::new(&statics, &pools, now());
        let content = "\
# comment
duid 00:01:00:01:2c:1f:0a:3b:aa:bb:cc:dd:ee:ff

1700003600 aa:bb:cc:dd:ee:10 10.1.1.11 one *
notanumber aa:bb:cc:dd:ee:11 10.1.1.12 two *
1700003600 zz:bb:cc:dd:ee:12 10.1.1.13 three *
1700003600 aa:bb:cc:dd:ee:13 10.1.1.300 four *
1700003600 aa:bb:cc:dd:ee:14 10.1.1.14
1700003600 aa:bb:cc:dd:ee:15 10.1.1.15 five
";
        let leases = parser.parse_str("dnsmasq.leases", content);
        let addresses: Vec<Ipv4Addr> = leases.iter().map(|lease| lease.ip_address).collect();
        assert_eq!(
            addresses,
            vec![Ipv4Addr::new(10, 1, 1, 11), Ipv4Addr::new(10, 1, 1, 15)]
        );
    }

    #[test]
    fn test_parse_file_unreadable() {
        let (statics, pools) = fixtures();
        let parser = LeaseFileParser::new(&statics, &pools, now());
        let dir = tempfile::tempdir().unwrap();
        let result = parser.parse_file(&dir.path().join("missing.leases"));
        assert!(matches!(result, Err(Error::LeaseFileUnreadable { .. })));
    }

    #[test]
    fn test_parse_file() {
        let (statics, pools) = fixtures();
        let parser = LeaseFileParser::new(&statics, &pools, now());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dnsmasq.leases");
        std::fs::write(&path, "0 aa:bb:cc:dd:ee:01 10.1.1.5 nas *\n").unwrap();

        let leases = parser.parse_file(&path).unwrap();
        assert_eq!(leases.len(), 1);
        assert!(leases[0].is_static);
    }

    #[test]
    fn test_serialization_field_names() {
        let (statics, pools) = fixtures();
        let parser = LeaseFileParser::new(&statics, &pools, now());
        let lease = parser.parse_line("1700003600 aa:bb:cc:dd:ee:20 10.1.1.20 * *").unwrap();

        let value = serde_json::to_value(&lease).unwrap();
        assert_eq!(value["ip_address"], "10.1.1.20");
        assert_eq!(value["lease_time"], "2023-11-14T23:13:20Z");
        assert_eq!(value["hostname"], serde_json::Value::Null);
        assert_eq!(value["is_active"], true);
    }

    #[test]
    fn test_differs_from_ignores_activity() {
        let (statics, pools) = fixtures();
        let parser = LeaseFileParser::new(&statics, &pools, now());
        let lease = parser.parse_line("1700003600 aa:bb:cc:dd:ee:20 10.1.1.20 x").unwrap();

        let mut inactive = lease.clone();
        inactive.is_active = false;
        assert!(!lease.differs_from(&inactive));

        let mut renamed = lease.clone();
        renamed.hostname = Some("y".to_string());
        assert!(lease.differs_from(&renamed));
    }
}
