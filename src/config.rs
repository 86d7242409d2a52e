use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::conf::PathMapper;
use crate::error::{Error, Result};

/// Environment variable overriding [`Config::dnsmasq_config_file_path`].
pub const ENV_DNSMASQ_CONFIG: &str = "DNSMASQ_CONFIG_FILE_PATH";

/// Environment variable overriding [`Config::root_path`].
pub const ENV_ROOT_PATH: &str = "ROOT_PATH";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root dnsmasq configuration file; everything else is discovered from it.
    pub dnsmasq_config_file_path: PathBuf,
    /// Mount prefix for absolute paths found in the dnsmasq configuration.
    #[serde(default)]
    pub root_path: Option<PathBuf>,
    pub heartbeat_interval_seconds: u64,
    pub client_queue_capacity: usize,
    pub poll_interval_millis: u64,
    /// Replaces the include suffixes of every `conf-dir` when set.
    #[serde(default)]
    pub fragment_extensions: Option<Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dnsmasq_config_file_path: PathBuf::from("/etc/dnsmasq.conf"),
            root_path: None,
            heartbeat_interval_seconds: 30,
            client_queue_capacity: 64,
            poll_interval_millis: 1000,
            fragment_extensions: None,
        }
    }
}

impl Config {
    /// Creates a configuration pointing at the given root dnsmasq file.
    pub fn for_dnsmasq<P: AsRef<Path>>(path: P) -> Self {
        Self {
            dnsmasq_config_file_path: path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Applies overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_DNSMASQ_CONFIG).filter(|value| !value.is_empty()) {
            self.dnsmasq_config_file_path = PathBuf::from(path);
        }
        if let Some(root) = lookup(ENV_ROOT_PATH) {
            self.root_path = if root.is_empty() {
                None
            } else {
                Some(PathBuf::from(root))
            };
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.dnsmasq_config_file_path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "dnsmasq_config_file_path must not be empty".to_string(),
            ));
        }

        if self.heartbeat_interval_seconds == 0 {
            return Err(Error::InvalidConfig(
                "heartbeat_interval_seconds must be greater than 0".to_string(),
            ));
        }

        if self.client_queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "client_queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.poll_interval_millis == 0 {
            return Err(Error::InvalidConfig(
                "poll_interval_millis must be greater than 0".to_string(),
            ));
        }

        if let Some(extensions) = &self.fragment_extensions
            && extensions.iter().any(|extension| extension.trim().is_empty())
        {
            return Err(Error::InvalidConfig(
                "fragment_extensions must not contain empty entries".to_string(),
            ));
        }

        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }

    pub fn path_mapper(&self) -> PathMapper {
        PathMapper::new(self.root_path.clone())
    }

    /// The root dnsmasq file after applying [`Config::root_path`].
    pub fn resolved_dnsmasq_config(&self) -> PathBuf {
        let mapper = self.path_mapper();
        mapper.map_absolute(&self.dnsmasq_config_file_path)
    }
}
