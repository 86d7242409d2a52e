//! Snapshot-to-snapshot lease change detection.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::lease::Lease;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
    Updated,
    Expired,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::Added => "added",
            ChangeKind::Removed => "removed",
            ChangeKind::Updated => "updated",
            ChangeKind::Expired => "expired",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    /// The current lease, or the previous one for `Removed`.
    pub lease: Lease,
    pub timestamp: DateTime<Utc>,
}

/// Compares each lease snapshot with the one before it.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    previous: Option<Arc<Vec<Lease>>>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once a snapshot has been recorded.
    pub fn is_primed(&self) -> bool {
        self.previous.is_some()
    }

    /// Diffs `current` against the stored snapshot and stores `current`.
    ///
    /// The first call only records the snapshot. Events come out grouped
    /// by kind in the order added, removed, updated, expired, each group
    /// sorted by IP.
    pub fn detect(&mut self, current: Arc<Vec<Lease>>, now: DateTime<Utc>) -> Vec<ChangeEvent> {
        let Some(previous) = self.previous.replace(Arc::clone(&current)) else {
            return Vec::new();
        };

        let before = by_address(&previous);
        let after = by_address(&current);
        let mut events = Vec::new();

        for (ip, lease) in &after {
            if !before.contains_key(ip) {
                events.push(event(ChangeKind::Added, lease, now));
            }
        }
        for (ip, lease) in &before {
            if !after.contains_key(ip) {
                events.push(event(ChangeKind::Removed, lease, now));
            }
        }
        for (ip, lease) in &after {
            if let Some(old) = before.get(ip)
                && old.differs_from(lease)
            {
                events.push(event(ChangeKind::Updated, lease, now));
            }
        }
        for (ip, lease) in &after {
            if let Some(old) = before.get(ip)
                && !old.differs_from(lease)
                && old.is_active
                && !lease.is_active
            {
                events.push(event(ChangeKind::Expired, lease, now));
            }
        }

        events
    }

    /// Forgets the stored snapshot; the next call primes again.
    pub fn reset(&mut self) {
        self.previous = None;
    }
}

// Later duplicates of an address win, as they do in the lease file.
fn by_address(leases: &[Lease]) -> BTreeMap<Ipv4Addr, &Lease> {
    leases.iter().map(|lease| (lease.ip_address, lease)).collect()
}

fn event(kind: ChangeKind, lease: &Lease, timestamp: DateTime<Utc>) -> ChangeEvent {
    ChangeEvent {
        kind,
        lease: lease.clone(),
        timestamp,
    }
}
