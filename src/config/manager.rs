//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{bail, Context};
use std::path::Path;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Ok(addrs) = std::env::var("SIGFLEET_LISTEN_ADDRS") {
            config.listen.addrs = addrs
                .split(',')
                .map(|a| {
                    a.trim()
                        .parse()
                        .with_context(|| format!("Invalid SIGFLEET_LISTEN_ADDRS entry: {a}"))
                })
                .collect::<Result<Vec<_>>>()?;
        }

        if let Ok(workers) = std::env::var("SIGFLEET_WORKERS") {
            config.fleet.workers = workers
                .parse::<usize>()
                .with_context(|| format!("Invalid SIGFLEET_WORKERS: {workers}"))?;
        }

        if let Ok(timeout) = std::env::var("SIGFLEET_CONNECT_TIMEOUT") {
            config.timeouts.connect = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid SIGFLEET_CONNECT_TIMEOUT: {timeout}"))?;
        }

        if let Ok(idle) = std::env::var("SIGFLEET_IDLE_TIMEOUT") {
            config.timeouts.idle = humantime::parse_duration(&idle)
                .with_context(|| format!("Invalid SIGFLEET_IDLE_TIMEOUT: {idle}"))?;
        }

        if let Ok(redirect) = std::env::var("SIGFLEET_REDIRECT_OUTBOUND") {
            config.fleet.redirect_outbound = redirect
                .parse::<bool>()
                .with_context(|| format!("Invalid SIGFLEET_REDIRECT_OUTBOUND: {redirect}"))?;
        }

        if let Ok(log_level) = std::env::var("SIGFLEET_LOG_LEVEL") {
            config.log_level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.fleet.workers == 0 {
            bail!("fleet.workers must be greater than 0");
        }

        if self.fleet.workers > 1024 {
            bail!("fleet.workers cannot exceed 1024");
        }

        if self.fleet.channel_capacity == 0 {
            bail!("fleet.channel_capacity must be greater than 0");
        }

        if self.listen.addrs.is_empty() {
            bail!("at least one listen address must be configured");
        }

        if self.timeouts.connect.is_zero() {
            bail!("timeouts.connect must be greater than 0");
        }

        if self.timeouts.connect.as_secs() > 300 {
            bail!("timeouts.connect cannot exceed 5 minutes");
        }

        if self.timeouts.idle < self.timeouts.eviction_interval {
            bail!("timeouts.idle must be at least timeouts.eviction_interval");
        }

        if self.io.read_buffer_size < 1024 {
            bail!("io.read_buffer_size must be at least 1024 bytes");
        }

        if self.io.max_queued_bytes < self.io.read_buffer_size {
            bail!("io.max_queued_bytes must be at least io.read_buffer_size");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            bail!("log_level must be one of: {}", valid_log_levels.join(", "));
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        listen: Option<&str>,
        workers: Option<usize>,
        connect_timeout: Option<u64>,
        redirect_outbound: bool,
    ) {
        if let Some(listen_str) = listen {
            if let Ok(addr) = listen_str.parse::<std::net::SocketAddr>() {
                self.listen.addrs = vec![addr];
                tracing::info!("CLI override: listen address set to {}", addr);
            } else {
                tracing::warn!("Invalid listen address provided: {}", listen_str);
            }
        }

        if let Some(workers) = workers {
            self.fleet.workers = workers;
            tracing::info!("CLI override: workers set to {}", workers);
        }

        if let Some(timeout_secs) = connect_timeout {
            self.timeouts.connect = std::time::Duration::from_secs(timeout_secs);
            tracing::info!("CLI override: connect timeout set to {}s", timeout_secs);
        }

        if redirect_outbound {
            self.fleet.redirect_outbound = true;
            tracing::info!("CLI override: outbound redirect enabled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut config = Config::default();
        config.fleet.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
log_level = "debug"

[fleet]
workers = 2
channel_capacity = 16
redirect_outbound = true

[listen]
addrs = ["127.0.0.1:5060", "127.0.0.1:5062"]

[timeouts]
connect = "2s"
resolve = "1s"
idle = "1m"
eviction_interval = "5s"
shutdown = "10s"

[io]
read_buffer_size = 4096
max_queued_bytes = 65536
"#
        )
        .unwrap();

        let config = ConfigManager::load_from_file(file.path()).unwrap();
        assert_eq!(config.fleet.workers, 2);
        assert!(config.fleet.redirect_outbound);
        assert_eq!(config.listen.addrs.len(), 2);
        assert_eq!(config.timeouts.connect, std::time::Duration::from_secs(2));
        assert_eq!(config.io.read_buffer_size, 4096);
    }

    #[test]
    fn cli_args_take_priority() {
        let mut config = Config::default();
        config.merge_with_cli_args(Some("0.0.0.0:5080"), Some(8), Some(3), false);
        assert_eq!(config.listen.addrs, vec!["0.0.0.0:5080".parse().unwrap()]);
        assert_eq!(config.fleet.workers, 8);
        assert_eq!(config.timeouts.connect, std::time::Duration::from_secs(3));
        assert!(!config.fleet.redirect_outbound);
    }
}
