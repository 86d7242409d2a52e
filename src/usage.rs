use std::collections::HashSet;
use std::net::Ipv4Addr;

use serde::Serialize;

use crate::lease::Lease;
use crate::pool::{Pool, PoolRegistry};

/// Occupancy of one pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolUsage {
    #[serde(flatten)]
    pub pool: Pool,
    pub used_addresses: u64,
    pub available_addresses: u64,
    /// Percentage of the pool in use, rounded to two decimals.
    pub usage_percentage: f64,
}

impl PoolUsage {
    fn new(pool: &Pool, used_addresses: u64) -> Self {
        let usage_percentage = if pool.total_addresses == 0 {
            0.0
        } else {
            let raw = used_addresses as f64 * 100.0 / pool.total_addresses as f64;
            (raw * 100.0).round() / 100.0
        };
        Self {
            pool: pool.clone(),
            used_addresses,
            available_addresses: pool.total_addresses.saturating_sub(used_addresses),
            usage_percentage,
        }
    }
}

/// Computes usage for every pool, in registry order.
///
/// Only active leases count. Each address is counted once even if the lease
/// file repeats it. Overlapping pools are computed independently.
pub fn calculate_usage(pools: &PoolRegistry, leases: &[Lease]) -> Vec<PoolUsage> {
    let active: HashSet<Ipv4Addr> = leases
        .iter()
        .filter(|lease| lease.is_active)
        .map(|lease| lease.ip_address)
        .collect();

    pools
        .pools()
        .iter()
        .map(|pool| {
            let used = active.iter().filter(|ip| pool.contains(**ip)).count() as u64;
            PoolUsage::new(pool, used)
        })
        .collect()
}
