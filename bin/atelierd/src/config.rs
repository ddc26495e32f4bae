use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use atelier_task::reconcile::ReconcileConfig;

/// Server configuration loaded from a TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub storage: StorageConfig,
    pub watchdog: WatchdogConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding all persistent state.
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "/var/lib/atelier".to_string(),
        }
    }
}

/// Watchdog thresholds. Only the numbers vary; the structure is fixed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub tick_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub terminal_grace_secs: u64,
    pub missing_grace_secs: u64,
    pub batch_size: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            heartbeat_timeout_secs: 300,
            terminal_grace_secs: 90,
            missing_grace_secs: 30,
            batch_size: 200,
        }
    }
}

impl WatchdogConfig {
    pub fn to_reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            tick_interval: Duration::from_secs(self.tick_interval_secs),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            terminal_grace: Duration::from_secs(self.terminal_grace_secs),
            missing_grace: Duration::from_secs(self.missing_grace_secs),
            batch_size: self.batch_size,
        }
    }
}

impl ServerConfig {
    /// Resolve a context name to `/etc/atelier/<name>.toml`; anything
    /// containing a `/` or `.` is treated as a direct path.
    pub fn resolve_path(name_or_path: &str) -> PathBuf {
        if name_or_path.contains('/') || name_or_path.contains('.') {
            PathBuf::from(name_or_path)
        } else {
            PathBuf::from(format!("/etc/atelier/{name_or_path}.toml"))
        }
    }

    /// Load and parse the config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
        let config = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("cannot parse {}: {e}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_name_vs_path() {
        assert_eq!(
            ServerConfig::resolve_path("prod"),
            PathBuf::from("/etc/atelier/prod.toml")
        );
        assert_eq!(
            ServerConfig::resolve_path("./local.toml"),
            PathBuf::from("./local.toml")
        );
    }

    #[test]
    fn defaults_match_reference_thresholds() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.watchdog.tick_interval_secs, 60);
        assert_eq!(config.watchdog.heartbeat_timeout_secs, 300);
        assert_eq!(config.watchdog.terminal_grace_secs, 90);
        assert_eq!(config.watchdog.missing_grace_secs, 30);
        assert_eq!(config.watchdog.batch_size, 200);
    }

    #[test]
    fn partial_override() {
        let config: ServerConfig = toml::from_str(
            "[storage]\n\
             data_dir = \"/tmp/atelier\"\n\
             [watchdog]\n\
             heartbeat_timeout_secs = 120\n",
        )
        .unwrap();
        assert_eq!(config.storage.data_dir, "/tmp/atelier");
        assert_eq!(config.watchdog.heartbeat_timeout_secs, 120);
        assert_eq!(config.watchdog.tick_interval_secs, 60, "untouched default");

        let rc = config.watchdog.to_reconcile_config();
        assert_eq!(rc.heartbeat_timeout, Duration::from_secs(120));
    }
}
