//! Configuration system for the rendezvous CLI.

use rendezvous_core::PuncherConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Rendezvous CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Puncher timings and capacities
    #[serde(default)]
    pub puncher: PuncherSection,
    /// Simulated scenario layout
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Puncher configuration
///
/// Durations are whole seconds (`*_secs`) or milliseconds (`*_ms`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PuncherSection {
    pub republish_interval_secs: u64,
    pub transfer_timeout_ms: u64,
    pub lookup_timeout_ms: u64,
    pub tunnel_timeout_ms: u64,
    pub probe_interval_ms: u64,
    pub probe_retries: u32,
    pub tunnel_wait_ms: u64,
    pub ping_stagger_ms: u64,
    pub max_bindings: usize,
    pub binding_timeout_secs: u64,
    pub rebind_period_ms: u64,
    pub rebind_fail_limit: u32,
    pub initial_fail_budget: u32,
    pub connect_fail_limit: u32,
    pub connect_retry_cooldown_secs: u64,
    pub failed_history: usize,
    pub lookup_ttl_secs: u64,
    pub resume_grace_ms: u64,
    pub timer_workers: usize,
    pub max_outstanding_punches: usize,
}

/// Simulated three-node scenario
///
/// The target sits behind NAT and binds to the rendezvous; the originator
/// (also behind NAT) then punches through to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Advertised address of the target
    pub target_addr: String,
    /// Port the target's NAT maps its traffic to
    pub target_mapped_port: u16,
    /// Address of the reachable rendezvous
    pub rendezvous_addr: String,
    /// Advertised address of the originator
    pub originator_addr: String,
    /// Port the originator's NAT maps its traffic to
    pub originator_mapped_port: u16,
    /// Give up waiting for the target's rendezvous after this long
    pub settle_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Short timings so a simulated run finishes in a few seconds
impl Default for PuncherSection {
    fn default() -> Self {
        Self {
            republish_interval_secs: 300,
            transfer_timeout_ms: 2_000,
            lookup_timeout_ms: 2_000,
            tunnel_timeout_ms: 500,
            probe_interval_ms: 200,
            probe_retries: 3,
            tunnel_wait_ms: 2_000,
            ping_stagger_ms: 100,
            max_bindings: 8,
            binding_timeout_secs: 300,
            rebind_period_ms: 1_000,
            rebind_fail_limit: 4,
            initial_fail_budget: 2,
            connect_fail_limit: 8,
            connect_retry_cooldown_secs: 30,
            failed_history: 16,
            lookup_ttl_secs: 120,
            resume_grace_ms: 2_000,
            timer_workers: 8,
            max_outstanding_punches: 64,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            target_addr: "10.0.0.1:6881".to_string(),
            target_mapped_port: 40001,
            rendezvous_addr: "10.0.0.2:6881".to_string(),
            originator_addr: "10.0.0.3:6881".to_string(),
            originator_mapped_port: 40003,
            settle_timeout_ms: 5_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl PuncherSection {
    /// Convert into the engine's configuration
    #[must_use]
    pub fn to_puncher_config(&self) -> PuncherConfig {
        PuncherConfig {
            republish_interval: Duration::from_secs(self.republish_interval_secs),
            transfer_timeout: Duration::from_millis(self.transfer_timeout_ms),
            lookup_timeout: Duration::from_millis(self.lookup_timeout_ms),
            tunnel_timeout: Duration::from_millis(self.tunnel_timeout_ms),
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            probe_retries: self.probe_retries,
            tunnel_wait: Duration::from_millis(self.tunnel_wait_ms),
            ping_stagger: Duration::from_millis(self.ping_stagger_ms),
            max_bindings: self.max_bindings,
            binding_timeout: Duration::from_secs(self.binding_timeout_secs),
            rebind_period: Duration::from_millis(self.rebind_period_ms),
            rebind_fail_limit: self.rebind_fail_limit,
            initial_fail_budget: self.initial_fail_budget,
            connect_fail_limit: self.connect_fail_limit,
            connect_retry_cooldown: Duration::from_secs(self.connect_retry_cooldown_secs),
            failed_history: self.failed_history,
            lookup_ttl: Duration::from_secs(self.lookup_ttl_secs),
            resume_grace: Duration::from_millis(self.resume_grace_ms),
            timer_workers: self.timer_workers,
            max_outstanding_punches: self.max_outstanding_punches,
        }
    }
}

/// Addresses of the simulated scenario, parsed
#[derive(Debug, Clone, Copy)]
pub struct SimulationLayout {
    pub target: SocketAddr,
    pub target_mapped_port: u16,
    pub rendezvous: SocketAddr,
    pub originator: SocketAddr,
    pub originator_mapped_port: u16,
}

impl SimulationConfig {
    /// Parse the configured addresses
    ///
    /// # Errors
    ///
    /// Returns an error if an address does not parse or two nodes share an ip.
    pub fn layout(&self) -> anyhow::Result<SimulationLayout> {
        let parse = |value: &str, name: &str| -> anyhow::Result<SocketAddr> {
            value
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid {} address: {}", name, value))
        };

        let layout = SimulationLayout {
            target: parse(&self.target_addr, "target")?,
            target_mapped_port: self.target_mapped_port,
            rendezvous: parse(&self.rendezvous_addr, "rendezvous")?,
            originator: parse(&self.originator_addr, "originator")?,
            originator_mapped_port: self.originator_mapped_port,
        };

        let ips = [layout.target.ip(), layout.rendezvous.ip(), layout.originator.ip()];
        if ips[0] == ips[1] || ips[0] == ips[2] || ips[1] == ips[2] {
            anyhow::bail!("Simulated nodes must have distinct ip addresses");
        }
        if layout.target_mapped_port == 0 || layout.originator_mapped_port == 0 {
            anyhow::bail!("Mapped ports must be non-zero");
        }

        Ok(layout)
    }

    /// How long to wait for the target to become operational
    #[must_use]
    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("rendezvous/config.toml")
    }

    /// Load config from `path`, falling back to defaults when the default
    /// path does not exist yet
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed, or if an
    /// explicitly named file is missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else if path == Self::default_path() {
            Ok(Self::default())
        } else {
            anyhow::bail!("Config file not found: {}", path.display())
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.puncher
            .to_puncher_config()
            .validate()
            .map_err(|e| anyhow::anyhow!("[puncher] {}", e))?;

        self.simulation.layout()?;
        if self.simulation.settle_timeout_ms == 0 {
            anyhow::bail!("[simulation] settle_timeout_ms must be non-zero");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.simulation.target_addr, "10.0.0.1:6881");
        assert_eq!(config.simulation.target_mapped_port, 40001);
        assert_eq!(config.puncher.max_bindings, 8);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        config.puncher.rebind_fail_limit = 1;
        assert!(config.validate().is_err());

        config.puncher.rebind_fail_limit = 4;
        config.simulation.originator_addr = "10.0.0.2:7000".to_string();
        assert!(config.validate().is_err());

        config.simulation.originator_addr = "not an address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_puncher_conversion() {
        let section = PuncherSection {
            rebind_period_ms: 750,
            binding_timeout_secs: 10,
            ..PuncherSection::default()
        };
        let config = section.to_puncher_config();
        assert_eq!(config.rebind_period, Duration::from_millis(750));
        assert_eq!(config.binding_timeout, Duration::from_secs(10));
        assert_eq!(config.sweep_interval(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [puncher]
            max_bindings = 2

            [logging]
            level = "warn"
            "#,
        )
        .unwrap();

        assert_eq!(config.puncher.max_bindings, 2);
        assert_eq!(config.puncher.rebind_fail_limit, 4);
        assert_eq!(config.simulation.rendezvous_addr, "10.0.0.2:6881");
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.simulation.settle_timeout_ms = 1234;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.simulation.settle_timeout_ms, 1234);
        assert_eq!(loaded.puncher.probe_retries, config.puncher.probe_retries);
    }

    #[test]
    fn test_missing_explicit_path_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(Config::load_or_default(&path).is_err());
    }
}
