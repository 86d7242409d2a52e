use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use leasewatch::{Config, LeaseMonitor, PollTrigger, Result};

#[derive(Parser)]
#[command(name = "leasewatch")]
#[command(author, version, about = "Live view of dnsmasq DHCP pools and leases", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "leasewatch.json")]
    config: PathBuf,

    /// Root dnsmasq configuration file, overriding the config file and environment
    #[arg(short, long)]
    dnsmasq_config: Option<PathBuf>,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream change notifications as Server-Sent Events frames
    Watch,
    /// List leases from the lease file
    Leases {
        /// Only leases that have not expired
        #[arg(long)]
        active: bool,
        #[arg(long)]
        json: bool,
    },
    /// List configured address pools
    Pools {
        #[arg(long)]
        json: bool,
    },
    /// Show per-pool usage
    Usage {
        #[arg(long)]
        json: bool,
    },
    /// Show service settings and the discovered dnsmasq files
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let mut config = Config::load_or_create(&cli.config)?;
    config.apply_env();
    if let Some(path) = cli.dnsmasq_config {
        config.dnsmasq_config_file_path = path;
    }

    let monitor = Arc::new(LeaseMonitor::new(config)?);

    match cli.command.unwrap_or(Commands::Watch) {
        Commands::Watch => {
            info!("Starting lease monitor with config: {:?}", cli.config);
            let mut subscription = monitor.subscribe();
            let heartbeat = monitor.start_heartbeat();
            let trigger = tokio::spawn(PollTrigger::new(Arc::clone(&monitor)).run());

            let mut stdout = std::io::stdout();
            loop {
                tokio::select! {
                    message = subscription.recv() => {
                        let Some(message) = message else { break };
                        stdout.write_all(message.to_sse().as_bytes())?;
                        stdout.flush()?;
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received shutdown signal, stopping monitor...");
                        break;
                    }
                }
            }

            trigger.abort();
            heartbeat.abort();
            Ok(())
        }
        Commands::Leases { active, json } => {
            let leases: Vec<_> = monitor
                .leases()
                .await?
                .into_iter()
                .filter(|lease| !active || lease.is_active)
                .collect();

            if json {
                println!("{}", serde_json::to_string_pretty(&leases)?);
            } else if leases.is_empty() {
                println!("No leases.");
            } else {
                let now = Utc::now();
                println!(
                    "{:<16} {:<18} {:<20} {:<24} {:<10} {:<7} {:<10}",
                    "IP Address", "MAC Address", "Hostname", "Expires At", "Remaining", "Static", "Pool"
                );
                println!("{}", "-".repeat(111));

                for lease in leases {
                    let expires_str = match lease.expires_at {
                        Some(expires_at) => expires_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                        None => "never".to_string(),
                    };
                    let remaining_str = match lease.remaining_seconds(now) {
                        None => "infinite".to_string(),
                        Some(remaining) if remaining > 0 => format!("{}s", remaining),
                        Some(_) => "expired".to_string(),
                    };

                    println!(
                        "{:<16} {:<18} {:<20} {:<24} {:<10} {:<7} {:<10}",
                        lease.ip_address,
                        lease.mac_address,
                        lease.hostname.as_deref().unwrap_or("*"),
                        expires_str,
                        remaining_str,
                        if lease.is_static { "yes" } else { "no" },
                        lease.pool_name.as_deref().unwrap_or("-")
                    );
                }
            }

            Ok(())
        }
        Commands::Pools { json } => {
            let pools = monitor.pools().await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&pools)?);
            } else if pools.is_empty() {
                println!("No pools configured.");
            } else {
                println!(
                    "{:<16} {:<16} {:<16} {:<16} {:<10} {:<8}",
                    "Pool", "Start", "End", "Netmask", "Lease", "Size"
                );
                println!("{}", "-".repeat(87));

                for pool in pools {
                    println!(
                        "{:<16} {:<16} {:<16} {:<16} {:<10} {:<8}",
                        pool.pool_name,
                        pool.start_ip,
                        pool.end_ip,
                        pool.netmask.map_or_else(|| "-".to_string(), |mask| mask.to_string()),
                        pool.lease_duration
                            .map_or_else(|| "-".to_string(), |duration| duration.to_string()),
                        pool.total_addresses
                    );
                }
            }

            Ok(())
        }
        Commands::Usage { json } => {
            let usage = monitor.usage().await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&usage)?);
            } else if usage.is_empty() {
                println!("No pools configured.");
            } else {
                println!(
                    "{:<16} {:<8} {:<8} {:<10} {:<8}",
                    "Pool", "Used", "Free", "Total", "Usage"
                );
                println!("{}", "-".repeat(54));

                for row in usage {
                    println!(
                        "{:<16} {:<8} {:<8} {:<10} {:>6.2}%",
                        row.pool.pool_name,
                        row.used_addresses,
                        row.available_addresses,
                        row.pool.total_addresses,
                        row.usage_percentage
                    );
                }
            }

            Ok(())
        }
        Commands::ShowConfig => {
            let snapshot = monitor.snapshot().await?;
            let report = serde_json::json!({
                "settings": monitor.config(),
                "resolved_dnsmasq_config": monitor.config().resolved_dnsmasq_config(),
                "lease_file": snapshot.lease_file,
                "config_files": snapshot.config_files,
                "config_dirs": snapshot.config_dirs,
                "pools": snapshot.pools,
                "static_assignments": snapshot.static_assignments,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}
