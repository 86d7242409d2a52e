//! # leasewatch
//!
//! Live view of a dnsmasq DHCP server, read from its configuration and lease
//! files.
//!
//! ## Features
//!
//! - Configuration tree discovery: `conf-dir` with suffix filters, `conf-file`
//! - Address pools from `dhcp-range`, static hosts from `dhcp-host`
//! - Lease file parsing with static and activity classification
//! - Per-pool usage statistics
//! - Snapshot diffing into added, removed, updated and expired events
//! - Non-blocking fan-out to streaming clients as Server-Sent Events frames
//!
//! ## Quick Start
//!
//! ```no_run
//! use leasewatch::{Config, LeaseMonitor};
//!
//! #[tokio::main]
//! async fn main() -> leasewatch::Result<()> {
//!     let monitor = LeaseMonitor::new(Config::for_dnsmasq("/etc/dnsmasq.conf"))?;
//!     let mut stream = monitor.subscribe();
//!
//!     monitor.rescan().await?;
//!     for usage in monitor.usage().await? {
//!         println!("{}: {}%", usage.pool.pool_name, usage.usage_percentage);
//!     }
//!
//!     while let Some(message) = stream.recv().await {
//!         print!("{}", message.to_sse());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`ConfigTree`] - Root configuration file and the fragments it pulls in
//! - [`FragmentLoader`] - Filtered, ordered fragment discovery
//! - [`PoolRegistry`] / [`StaticAssignmentIndex`] - Directives extracted from all fragments
//! - [`LeaseFileParser`] - dnsmasq lease file reader
//! - [`ChangeDetector`] - One-step snapshot diffing
//! - [`StreamBroadcaster`] - Per-client bounded queues
//! - [`LeaseMonitor`] - Scan pipeline, query path and rescan path
//! - [`PollTrigger`] - Modification-time polling that drives rescans

pub mod broadcast;
pub mod change;
pub mod conf;
pub mod config;
pub mod error;
pub mod fragment;
pub mod lease;
pub mod monitor;
pub mod pool;
pub mod statics;
pub mod usage;
pub mod watch;

pub use broadcast::{Notification, StreamBroadcaster, StreamMessage, Subscription};
pub use change::{ChangeDetector, ChangeEvent, ChangeKind};
pub use conf::{ConfigTree, PathMapper};
pub use config::Config;
pub use error::{Error, Result};
pub use fragment::{FragmentFilter, FragmentLoader, FragmentSet};
pub use lease::{Lease, LeaseFileParser, normalize_mac};
pub use monitor::{LeaseMonitor, Snapshot, scan_once};
pub use pool::{LeaseDuration, Pool, PoolRegistry};
pub use statics::{StaticAssignment, StaticAssignmentIndex};
pub use usage::{PoolUsage, calculate_usage};
pub use watch::PollTrigger;
