use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs};
use tracing::info;

/// Runtime configuration for the server manager, file servers, and port
/// manager, with the defaults named in spec §6.
#[derive(Clone, Debug)]
pub struct Config {
    pub max_active_servers: usize,
    pub idle_timeout: Duration,
    pub reaper_interval: Duration,
    pub port_range: RangeInclusive<u16>,
    pub bind_address: Ipv4Addr,
    pub start_timeout: Duration,
    pub state_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        let max_active_servers = env::var("PFS_MAX_ACTIVE_SERVERS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(10);

        let idle_timeout = env::var("PFS_IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(300));

        let reaper_interval = env::var("PFS_REAPER_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(60));

        let port_low = env::var("PFS_PORT_LOW")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(3000);
        let port_high = env::var("PFS_PORT_HIGH")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(4000);
        let port_range = port_low..=port_high;

        let start_timeout = env::var("PFS_START_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(5));

        let state_dir = resolve_path(
            env::var("PFS_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".project-file-server")),
        );

        Self {
            max_active_servers,
            idle_timeout,
            reaper_interval,
            port_range,
            // Loopback is not independently configurable: the service must
            // never bind anywhere else (spec §1 Non-goals).
            bind_address: Ipv4Addr::LOCALHOST,
            start_timeout,
            state_dir,
        }
    }

    /// Path to the persisted `ProjectId -> Port` mapping (spec §6).
    pub fn port_mapping_file(&self) -> PathBuf {
        self.state_dir.join("ports.json")
    }

    pub fn ensure_state_dir(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.state_dir)
    }

    pub fn log_summary(&self) {
        info!("project-file-server config initialized");
        info!("  max_active_servers : {}", self.max_active_servers);
        info!("  idle_timeout       : {:?}", self.idle_timeout);
        info!("  reaper_interval    : {:?}", self.reaper_interval);
        info!(
            "  port_range         : {}-{}",
            self.port_range.start(),
            self.port_range.end()
        );
        info!("  bind_address       : {}", self.bind_address);
        info!("  start_timeout      : {:?}", self.start_timeout);
        info!("  state_dir          : {}", self.state_dir.display());
    }
}

fn resolve_path(p: PathBuf) -> PathBuf {
    if p.is_absolute() {
        p
    } else {
        env::current_dir().map(|base| base.join(&p)).unwrap_or(p)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
