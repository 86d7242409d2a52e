use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::{StreamBroadcaster, Subscription};
use crate::change::{ChangeDetector, ChangeEvent};
use crate::conf::ConfigTree;
use crate::config::Config;
use crate::error::Result;
use crate::fragment::FragmentLoader;
use crate::lease::{Lease, LeaseFileParser};
use crate::pool::{Pool, PoolRegistry};
use crate::statics::{StaticAssignment, StaticAssignmentIndex};
use crate::usage::{PoolUsage, calculate_usage};

/// Everything derived from one pass over the dnsmasq files.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub scanned_at: DateTime<Utc>,
    /// `None` when the configuration declares no lease file.
    pub lease_file: Option<PathBuf>,
    /// Root file first, then every fragment that was read.
    pub config_files: Vec<PathBuf>,
    pub config_dirs: Vec<PathBuf>,
    /// Sorted by IP.
    pub leases: Arc<Vec<Lease>>,
    pub pools: Vec<Pool>,
    pub usage: Vec<PoolUsage>,
    pub static_assignments: Vec<StaticAssignment>,
    pub static_count: usize,
}

impl Snapshot {
    /// Files and directories whose modification means a rescan is due.
    pub fn watch_paths(&self) -> Vec<PathBuf> {
        self.config_files
            .iter()
            .chain(&self.config_dirs)
            .chain(&self.lease_file)
            .cloned()
            .collect()
    }

    pub fn active_leases(&self) -> impl Iterator<Item = &Lease> {
        self.leases.iter().filter(|lease| lease.is_active)
    }
}

/// Runs the full scan pipeline once, blocking on file I/O.
///
/// # Errors
///
/// Fails when the root configuration or the declared lease file cannot be
/// read. Everything else is logged and skipped.
pub fn scan_once(config: &Config, now: DateTime<Utc>) -> Result<Snapshot> {
    let mapper = config.path_mapper();
    let tree = ConfigTree::resolve(&config.resolved_dnsmasq_config(), &mapper)?;

    let fragments = FragmentLoader::new(config.fragment_extensions.clone()).load(&tree);
    let pools = PoolRegistry::from_fragments(&fragments);
    let statics = StaticAssignmentIndex::from_fragments(&fragments);

    let lease_file = match tree.lease_file() {
        Ok(path) => Some(path.to_path_buf()),
        Err(error) => {
            warn!("{}; reporting pools without leases", error);
            None
        }
    };

    let mut leases = match &lease_file {
        Some(path) => LeaseFileParser::new(&statics, &pools, now).parse_file(path)?,
        None => Vec::new(),
    };
    leases.sort_by_key(|lease| lease.ip_address);

    let usage = calculate_usage(&pools, &leases);

    debug!(
        "Scanned {} files: {} pools, {} static hosts, {} leases",
        fragments.len(),
        pools.len(),
        statics.len(),
        leases.len()
    );

    Ok(Snapshot {
        scanned_at: now,
        lease_file,
        config_files: fragments.paths().into_iter().map(PathBuf::from).collect(),
        config_dirs: tree.conf_dirs().iter().map(|dir| dir.path.clone()).collect(),
        leases: Arc::new(leases),
        pools: pools.pools().to_vec(),
        usage,
        static_assignments: statics.assignments(),
        static_count: statics.len(),
    })
}

/// Serves lease queries and streams change notifications.
///
/// Every query re-derives its answer from disk. When a scan fails the last
/// good snapshot is served instead. [`LeaseMonitor::rescan`] is the only
/// path that diffs snapshots and notifies subscribers.
pub struct LeaseMonitor {
    config: Arc<Config>,
    last_snapshot: RwLock<Option<Arc<Snapshot>>>,
    detector: Mutex<ChangeDetector>,
    broadcaster: StreamBroadcaster,
}

impl LeaseMonitor {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        info!(
            "Monitoring dnsmasq configuration {}",
            config.resolved_dnsmasq_config().display()
        );
        let broadcaster = StreamBroadcaster::new(config.client_queue_capacity);
        Ok(Self {
            config: Arc::new(config),
            last_snapshot: RwLock::new(None),
            detector: Mutex::new(ChangeDetector::new()),
            broadcaster,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn broadcaster(&self) -> &StreamBroadcaster {
        &self.broadcaster
    }

    /// Scans the files and publishes the result as the last good snapshot.
    pub async fn scan(&self) -> Result<Arc<Snapshot>> {
        let config = Arc::clone(&self.config);
        let now = Utc::now();
        let result = tokio::task::spawn_blocking(move || scan_once(&config, now)).await?;

        match result {
            Ok(snapshot) => Ok(self.publish(snapshot).await),
            Err(error) => {
                warn!("Scan failed: {}", error);
                Err(error)
            }
        }
    }

    /// Stores `snapshot` as the last good one unless a newer scan already
    /// finished first.
    async fn publish(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        let mut last = self.last_snapshot.write().await;
        match last.as_ref() {
            Some(stored) if stored.scanned_at > snapshot.scanned_at => {
                debug!(
                    "Discarding scan from {} superseded by scan from {}",
                    snapshot.scanned_at, stored.scanned_at
                );
            }
            _ => *last = Some(Arc::clone(&snapshot)),
        }
        snapshot
    }

    /// The most recent successful scan, if any.
    pub async fn last_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.last_snapshot.read().await.clone()
    }

    /// A fresh snapshot, or the last good one when scanning fails.
    pub async fn snapshot(&self) -> Result<Arc<Snapshot>> {
        match self.scan().await {
            Ok(snapshot) => Ok(snapshot),
            Err(error) => match self.last_snapshot().await {
                Some(snapshot) => {
                    warn!(
                        "Serving snapshot from {} after failed scan",
                        snapshot.scanned_at.format("%Y-%m-%d %H:%M:%S UTC")
                    );
                    Ok(snapshot)
                }
                None => Err(error),
            },
        }
    }

    pub async fn leases(&self) -> Result<Vec<Lease>> {
        Ok(self.snapshot().await?.leases.as_ref().clone())
    }

    pub async fn pools(&self) -> Result<Vec<Pool>> {
        Ok(self.snapshot().await?.pools.clone())
    }

    pub async fn usage(&self) -> Result<Vec<PoolUsage>> {
        Ok(self.snapshot().await?.usage.clone())
    }

    /// Rescans, diffs against the previous rescan and notifies subscribers.
    ///
    /// The first call only primes the detector. A failed scan leaves the
    /// detector untouched, so the next successful rescan diffs against the
    /// last good one.
    pub async fn rescan(&self) -> Result<Vec<ChangeEvent>> {
        let mut detector = self.detector.lock().await;
        let primed = detector.is_primed();
        let snapshot = self.scan().await?;

        let events = detector.detect(Arc::clone(&snapshot.leases), snapshot.scanned_at);
        if !primed {
            info!("Recorded initial snapshot of {} leases", snapshot.leases.len());
        } else if !events.is_empty() {
            self.broadcaster.broadcast(&events);
        } else {
            debug!("Rescan found no lease changes");
        }
        Ok(events)
    }

    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }

    /// Starts the heartbeat task at the configured interval.
    pub fn start_heartbeat(&self) -> JoinHandle<()> {
        self.broadcaster
            .spawn_heartbeat(self.config.heartbeat_interval())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeKind;
    use crate::error::Error;
    use std::net::Ipv4Addr;
    use std::path::Path;

    const FUTURE: i64 = 4_102_444_800;

    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir(dir.path().join("dnsmasq.d")).unwrap();
            std::fs::write(
                dir.path().join("dnsmasq.conf"),
                "dhcp-leasefile=dnsmasq.leases\nconf-dir=dnsmasq.d,*.conf\n",
            )
            .unwrap();
            std::fs::write(
                dir.path().join("dnsmasq.d/10-dhcp.conf"),
                "dhcp-range=set:lan,10.0.0.10,10.0.0.19,255.255.255.0,12h\n\
                 dhcp-host=aa:bb:cc:dd:ee:01,10.0.0.5,nas\n",
            )
            .unwrap();
            let fixture = Self { dir };
            fixture.write_leases(&[]);
            fixture
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn config(&self) -> Config {
            Config::for_dnsmasq(self.path("dnsmasq.conf"))
        }

        fn write_leases(&self, lines: &[String]) {
            std::fs::write(self.path("dnsmasq.leases"), lines.join("\n")).unwrap();
        }
    }

    fn line(expiry: i64, mac: &str, ip: &str, host: &str) -> String {
        format!("{} {} {} {} *", expiry, mac, ip, host)
    }

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_scan_once_pipeline() {
        let fixture = Fixture::new();
        fixture.write_leases(&[
            line(FUTURE, "aa:bb:cc:dd:ee:03", "10.0.0.12", "phone"),
            line(0, "aa:bb:cc:dd:ee:01", "10.0.0.5", "nas"),
            line(1, "aa:bb:cc:dd:ee:02", "10.0.0.11", "old"),
            "garbage".to_string(),
        ]);

        let snapshot = scan_once(&fixture.config(), now()).unwrap();

        let addresses: Vec<Ipv4Addr> = snapshot.leases.iter().map(|l| l.ip_address).collect();
        assert_eq!(
            addresses,
            vec![
                Ipv4Addr::new(10, 0, 0, 5),
                Ipv4Addr::new(10, 0, 0, 11),
                Ipv4Addr::new(10, 0, 0, 12),
            ]
        );
        assert!(snapshot.leases[0].is_static);
        assert_eq!(snapshot.leases[0].pool_name, None);
        assert_eq!(snapshot.leases[2].pool_name.as_deref(), Some("lan"));
        assert_eq!(snapshot.active_leases().count(), 2);

        assert_eq!(snapshot.pools.len(), 1);
        assert_eq!(snapshot.usage[0].used_addresses, 1);
        assert_eq!(snapshot.usage[0].available_addresses, 9);
        assert_eq!(snapshot.usage[0].usage_percentage, 10.0);
        assert_eq!(snapshot.static_count, 1);
        assert_eq!(snapshot.lease_file, Some(fixture.path("dnsmasq.leases")));
        assert_eq!(
            snapshot.config_files,
            vec![fixture.path("dnsmasq.conf"), fixture.path("dnsmasq.d/10-dhcp.conf")]
        );
        assert_eq!(snapshot.watch_paths().len(), 4);
    }

    #[test]
    fn test_scan_without_lease_file_directive() {
        let fixture = Fixture::new();
        std::fs::write(fixture.path("dnsmasq.conf"), "conf-dir=dnsmasq.d\n").unwrap();

        let snapshot = scan_once(&fixture.config(), now()).unwrap();
        assert_eq!(snapshot.lease_file, None);
        assert!(snapshot.leases.is_empty());
        assert_eq!(snapshot.pools.len(), 1);
    }

    #[test]
    fn test_scan_fatal_errors() {
        let fixture = Fixture::new();
        std::fs::remove_file(fixture.path("dnsmasq.leases")).unwrap();
        let result = scan_once(&fixture.config(), now());
        assert!(matches!(result, Err(Error::LeaseFileUnreadable { .. })));

        let config = Config::for_dnsmasq(fixture.path("absent.conf"));
        let result = scan_once(&config, now());
        assert!(matches!(result, Err(Error::ConfigNotFound { .. })));
    }

    #[test]
    fn test_root_path_remaps_absolute_paths() {
        let fixture = Fixture::new();
        std::fs::write(
            fixture.path("dnsmasq.conf"),
            "dhcp-leasefile=/dnsmasq.leases\nconf-dir=/dnsmasq.d\n",
        )
        .unwrap();

        let config = Config {
            dnsmasq_config_file_path: PathBuf::from("/dnsmasq.conf"),
            root_path: Some(fixture.dir.path().to_path_buf()),
            ..Default::default()
        };
        let snapshot = scan_once(&config, now()).unwrap();
        assert_eq!(snapshot.lease_file, Some(fixture.path("dnsmasq.leases")));
        assert_eq!(snapshot.pools.len(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = Config {
            client_queue_capacity: 0,
            ..Config::for_dnsmasq(Path::new("/etc/dnsmasq.conf"))
        };
        assert!(matches!(LeaseMonitor::new(config), Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_queries_fall_back_to_last_snapshot() {
        let fixture = Fixture::new();
        fixture.write_leases(&[line(FUTURE, "aa:bb:cc:dd:ee:03", "10.0.0.12", "phone")]);
        let monitor = LeaseMonitor::new(fixture.config()).unwrap();

        assert_eq!(monitor.leases().await.unwrap().len(), 1);

        std::fs::remove_file(fixture.path("dnsmasq.leases")).unwrap();
        assert!(monitor.scan().await.is_err());
        assert_eq!(monitor.leases().await.unwrap().len(), 1);
        assert_eq!(monitor.pools().await.unwrap().len(), 1);
        assert_eq!(monitor.usage().await.unwrap()[0].used_addresses, 1);
    }

    #[tokio::test]
    async fn test_older_scan_does_not_replace_newer() {
        let fixture = Fixture::new();
        let monitor = LeaseMonitor::new(fixture.config()).unwrap();
        let earlier = now();
        let later = earlier + chrono::TimeDelta::seconds(5);

        monitor.publish(scan_once(&fixture.config(), later).unwrap()).await;
        let stale = monitor
            .publish(scan_once(&fixture.config(), earlier).unwrap())
            .await;

        assert_eq!(stale.scanned_at, earlier);
        assert_eq!(monitor.last_snapshot().await.unwrap().scanned_at, later);

        monitor.publish(scan_once(&fixture.config(), later).unwrap()).await;
        assert_eq!(monitor.last_snapshot().await.unwrap().scanned_at, later);
    }

    #[tokio::test]
    async fn test_query_without_any_snapshot_fails() {
        let fixture = Fixture::new();
        std::fs::remove_file(fixture.path("dnsmasq.conf")).unwrap();
        let monitor = LeaseMonitor::new(fixture.config()).unwrap();

        assert!(matches!(monitor.leases().await, Err(Error::ConfigNotFound { .. })));
        assert!(monitor.last_snapshot().await.is_none());
    }

    #[tokio::test]
    async fn test_rescan_notifies_subscribers() {
        let fixture = Fixture::new();
        fixture.write_leases(&[line(FUTURE, "aa:bb:cc:dd:ee:03", "10.0.0.12", "phone")]);
        let monitor = LeaseMonitor::new(fixture.config()).unwrap();
        let mut subscription = monitor.subscribe();
        assert_eq!(subscription.recv().await.unwrap().event, "connection_established");

        assert!(monitor.rescan().await.unwrap().is_empty());
        assert!(monitor.rescan().await.unwrap().is_empty());
        assert!(subscription.try_recv().is_none());

        fixture.write_leases(&[
            line(FUTURE, "aa:bb:cc:dd:ee:03", "10.0.0.12", "tablet"),
            line(FUTURE, "aa:bb:cc:dd:ee:04", "10.0.0.13", "laptop"),
        ]);
        let events = monitor.rescan().await.unwrap();
        let kinds: Vec<ChangeKind> = events.iter().map(|event| event.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Added, ChangeKind::Updated]);

        let message = subscription.recv().await.unwrap();
        assert_eq!(message.event, "data_changed");
        assert!(subscription.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_queries_do_not_consume_changes() {
        let fixture = Fixture::new();
        let monitor = LeaseMonitor::new(fixture.config()).unwrap();
        monitor.rescan().await.unwrap();

        fixture.write_leases(&[line(FUTURE, "aa:bb:cc:dd:ee:03", "10.0.0.12", "phone")]);
        assert_eq!(monitor.leases().await.unwrap().len(), 1);

        let events = monitor.rescan().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Added);
    }

    #[tokio::test]
    async fn test_failed_rescan_keeps_previous_state() {
        let fixture = Fixture::new();
        let monitor = LeaseMonitor::new(fixture.config()).unwrap();
        monitor.rescan().await.unwrap();

        std::fs::remove_file(fixture.path("dnsmasq.leases")).unwrap();
        assert!(monitor.rescan().await.is_err());

        fixture.write_leases(&[line(FUTURE, "aa:bb:cc:dd:ee:03", "10.0.0.12", "phone")]);
        let events = monitor.rescan().await.unwrap();
        assert_eq!(events.len(), 1);
    }
}
