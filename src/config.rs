//! Configuration management for geocatalog using the prefer crate.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Application settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base data directory.
    pub data_dir: PathBuf,
    /// Database filename.
    pub database_filename: String,
    /// Server bind host.
    pub host: String,
    /// Server bind port.
    pub port: u16,
    /// Fetch timeout in seconds.
    pub fetch_timeout: u64,
    /// Worker poll interval in milliseconds.
    pub worker_poll_ms: u64,
    /// Scheduler sweep interval in seconds.
    pub scheduler_interval_secs: u64,
    /// Stuck-import reaper interval in seconds.
    pub reaper_interval_secs: u64,
    /// Base URL for the Nominatim geocoding provider.
    pub nominatim_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
            .join("geocatalog");

        Self {
            data_dir,
            database_filename: "geocatalog.db".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            fetch_timeout: 30,
            worker_poll_ms: 500,
            scheduler_interval_secs: 60,
            reaper_interval_secs: 900,
            nominatim_url: None,
        }
    }
}

impl Settings {
    /// Create settings with a custom data directory.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            ..Default::default()
        }
    }

    /// Get the full path to the database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_filename)
    }

    /// Ensure the data directory exists.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

/// Configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Target directory for data.
    #[serde(default)]
    pub target: Option<String>,
    /// Database filename.
    #[serde(default)]
    pub database: Option<String>,
    /// Server bind host.
    #[serde(default)]
    pub host: Option<String>,
    /// Server bind port.
    #[serde(default)]
    pub port: Option<u16>,
    /// Fetch timeout in seconds.
    #[serde(default)]
    pub fetch_timeout: Option<u64>,
    /// Worker poll interval in milliseconds.
    #[serde(default)]
    pub worker_poll_ms: Option<u64>,
    /// Scheduler sweep interval in seconds.
    #[serde(default)]
    pub scheduler_interval_secs: Option<u64>,
    /// Reaper interval in seconds.
    #[serde(default)]
    pub reaper_interval_secs: Option<u64>,
    /// Base URL for the Nominatim geocoding provider.
    #[serde(default)]
    pub nominatim_url: Option<String>,
}

impl Config {
    /// Load configuration using prefer crate.
    /// Automatically discovers geocatalog config files in standard locations.
    pub async fn load() -> Self {
        match prefer::load("geocatalog").await {
            Ok(pref_config) => {
                let target: Option<String> = pref_config.get("target").ok();
                let database: Option<String> = pref_config.get("database").ok();
                let host: Option<String> = pref_config.get("host").ok();
                let port: Option<u16> = pref_config.get("port").ok();
                let fetch_timeout: Option<u64> = pref_config.get("fetch_timeout").ok();
                let worker_poll_ms: Option<u64> = pref_config.get("worker_poll_ms").ok();
                let scheduler_interval_secs: Option<u64> =
                    pref_config.get("scheduler_interval_secs").ok();
                let reaper_interval_secs: Option<u64> =
                    pref_config.get("reaper_interval_secs").ok();
                let nominatim_url: Option<String> = pref_config.get("nominatim_url").ok();

                Config {
                    target,
                    database,
                    host,
                    port,
                    fetch_timeout,
                    worker_poll_ms,
                    scheduler_interval_secs,
                    reaper_interval_secs,
                    nominatim_url,
                }
            }
            Err(_) => Self::default(),
        }
    }

    /// Apply configuration to settings.
    pub fn apply_to_settings(&self, settings: &mut Settings) {
        if let Some(ref target) = self.target {
            let path = shellexpand::tilde(target);
            settings.data_dir = PathBuf::from(path.as_ref());
        }
        if let Some(ref database) = self.database {
            settings.database_filename = database.clone();
        }
        if let Some(ref host) = self.host {
            settings.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(timeout) = self.fetch_timeout {
            settings.fetch_timeout = timeout;
        }
        if let Some(poll) = self.worker_poll_ms {
            settings.worker_poll_ms = poll;
        }
        if let Some(interval) = self.scheduler_interval_secs {
            settings.scheduler_interval_secs = interval;
        }
        if let Some(interval) = self.reaper_interval_secs {
            settings.reaper_interval_secs = interval;
        }
        if let Some(ref url) = self.nominatim_url {
            settings.nominatim_url = Some(url.clone());
        }
    }
}

/// Load settings from configuration.
pub async fn load_settings() -> Settings {
    let config = Config::load().await;
    let mut settings = Settings::default();
    config.apply_to_settings(&mut settings);
    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_overrides_settings() {
        let config = Config {
            target: Some("/tmp/geocatalog-test".into()),
            port: Some(9090),
            fetch_timeout: Some(10),
            ..Config::default()
        };
        let mut settings = Settings::default();
        config.apply_to_settings(&mut settings);

        assert_eq!(settings.data_dir, PathBuf::from("/tmp/geocatalog-test"));
        assert_eq!(settings.port, 9090);
        assert_eq!(settings.fetch_timeout, 10);
        assert_eq!(settings.host, "127.0.0.1");
    }

    #[test]
    fn test_database_path_joins_data_dir() {
        let settings = Settings::with_data_dir(PathBuf::from("/var/lib/geocatalog"));
        assert_eq!(
            settings.database_path(),
            PathBuf::from("/var/lib/geocatalog/geocatalog.db")
        );
    }
}
