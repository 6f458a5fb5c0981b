//! Daemon configuration from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub http_port: u16,
    pub bind_host: String,
    /// JSON file mapping source id -> connection descriptor.
    pub sources_path: PathBuf,
    /// Relative SQLite paths resolve against this directory.
    pub sqlite_base_dir: PathBuf,
    pub idle_ttl_secs: u64,
    pub reaper_interval_secs: u64,
    /// Upper bound on a caller's `wait`.
    pub max_wait_secs: u64,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            http_port: std::env::var("HTTP_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("Invalid HTTP_PORT")?,
            bind_host: std::env::var("BIND_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            sources_path: std::env::var("SOURCES_PATH")
                .unwrap_or_else(|_| "./sources.json".to_string())
                .into(),
            sqlite_base_dir: std::env::var("SQLITE_BASE_DIR")
                .unwrap_or_else(|_| ".".to_string())
                .into(),
            idle_ttl_secs: std::env::var("IDLE_TTL_SECS")
                .unwrap_or_else(|_| "600".to_string())
                .parse()
                .context("Invalid IDLE_TTL_SECS")?,
            reaper_interval_secs: std::env::var("REAPER_INTERVAL_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .context("Invalid REAPER_INTERVAL_SECS")?,
            max_wait_secs: std::env::var("MAX_WAIT_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .context("Invalid MAX_WAIT_SECS")?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.http_port)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid races.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for key in [
            "HTTP_PORT",
            "BIND_HOST",
            "SOURCES_PATH",
            "SQLITE_BASE_DIR",
            "IDLE_TTL_SECS",
            "REAPER_INTERVAL_SECS",
            "MAX_WAIT_SECS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();

        let config = DaemonConfig::from_env().unwrap();
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert_eq!(config.sources_path, PathBuf::from("./sources.json"));
        assert_eq!(config.sqlite_base_dir, PathBuf::from("."));
        assert_eq!(config.idle_ttl(), Duration::from_secs(600));
        assert_eq!(config.reaper_interval(), Duration::from_secs(60));
        assert_eq!(config.max_wait(), Duration::from_secs(300));

        clear_env();
    }

    #[test]
    fn from_env_with_all_vars() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();

        std::env::set_var("HTTP_PORT", "9000");
        std::env::set_var("BIND_HOST", "127.0.0.1");
        std::env::set_var("SOURCES_PATH", "/etc/rowtap/sources.json");
        std::env::set_var("SQLITE_BASE_DIR", "/var/lib/rowtap");
        std::env::set_var("IDLE_TTL_SECS", "30");
        std::env::set_var("REAPER_INTERVAL_SECS", "0");
        std::env::set_var("MAX_WAIT_SECS", "20");

        let config = DaemonConfig::from_env().unwrap();
        assert_eq!(config.bind_addr(), "127.0.0.1:9000");
        assert_eq!(config.sources_path, PathBuf::from("/etc/rowtap/sources.json"));
        assert_eq!(config.sqlite_base_dir, PathBuf::from("/var/lib/rowtap"));
        assert_eq!(config.idle_ttl(), Duration::from_secs(30));
        // A zero interval would make tokio::time::interval panic.
        assert_eq!(config.reaper_interval(), Duration::from_secs(1));
        assert_eq!(config.max_wait(), Duration::from_secs(20));

        clear_env();
    }

    #[test]
    fn from_env_invalid_port() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();

        std::env::set_var("HTTP_PORT", "not-a-number");
        assert!(DaemonConfig::from_env().is_err());

        clear_env();
    }

    #[test]
    fn from_env_invalid_ttl() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();

        std::env::set_var("IDLE_TTL_SECS", "-5");
        assert!(DaemonConfig::from_env().is_err());

        clear_env();
    }
}
