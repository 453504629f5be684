use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub install: InstallConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub tuning: TuningConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Operator override: run this binary instead of the managed one.
    /// Bypasses the verification cache, and is never installed over,
    /// deleted, or repaired.
    #[serde(default)]
    pub binary_path: Option<PathBuf>,
    /// Device name spotifyd announces to the Spotify Connect network.
    #[serde(default = "default_device_name")]
    pub device_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Release tag to install, without the leading `v`.
    #[serde(default = "default_release_version")]
    pub release_version: String,
    /// Oldest daemon version the control plane will talk to.
    #[serde(default = "default_min_version")]
    pub min_version: String,
    /// Base URL the release archive is fetched from; the asset name is
    /// appended.  Overridable so tests never touch the network.
    #[serde(default = "default_release_base_url")]
    pub release_base_url: String,
    #[serde(default = "default_download_attempts")]
    pub download_attempts: u32,
    /// An install lock older than this is assumed to come from a crashed
    /// run and is reclaimed.
    #[serde(default = "default_lock_stale_secs")]
    pub lock_stale_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Use the playerctl subprocess backend instead of the native D-Bus
    /// client.  Also settable via SPOTUI_FORCE_LEGACY_MPRIS.
    #[serde(default)]
    pub force_legacy: bool,
}

/// Empirically tuned timing knobs.  The defaults are not load-bearing beyond
/// `debounce_ms < cooldown_ms`; keep them configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningConfig {
    /// Repeats of the same user action inside this window are dropped.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// How long an optimistic local value overrides the daemon-reported one.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Reconciliation poll cadence.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Remaining playtime below this triggers queue continuation.
    #[serde(default = "default_track_end_threshold_ms")]
    pub track_end_threshold_ms: i64,
    /// Inter-attempt delays for protocol reconnection, in order.
    #[serde(default = "default_reconnect_delays_ms")]
    pub reconnect_delays_ms: Vec<u64>,
    /// Outer bound on the whole install→spawn→connect startup sequence.
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            device_name: default_device_name(),
        }
    }
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            release_version: default_release_version(),
            min_version: default_min_version(),
            release_base_url: default_release_base_url(),
            download_attempts: default_download_attempts(),
            lock_stale_secs: default_lock_stale_secs(),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            force_legacy: false,
        }
    }
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            cooldown_ms: default_cooldown_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            track_end_threshold_ms: default_track_end_threshold_ms(),
            reconnect_delays_ms: default_reconnect_delays_ms(),
            startup_timeout_secs: default_startup_timeout_secs(),
        }
    }
}

fn default_device_name() -> String {
    "spotui".to_string()
}

fn default_release_version() -> String {
    "0.4.1".to_string()
}

fn default_min_version() -> String {
    "0.4.0".to_string()
}

fn default_release_base_url() -> String {
    "https://github.com/Spotifyd/spotifyd/releases/download".to_string()
}

fn default_download_attempts() -> u32 {
    3
}

fn default_lock_stale_secs() -> u64 {
    300
}

fn default_debounce_ms() -> u64 {
    150
}

fn default_cooldown_ms() -> u64 {
    1500
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_track_end_threshold_ms() -> i64 {
    2000
}

fn default_reconnect_delays_ms() -> Vec<u64> {
    vec![500, 1000, 2000, 3000, 4000]
}

fn default_startup_timeout_secs() -> u64 {
    60
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config.with_env_overrides());
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config.with_env_overrides())
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("control.toml")
    }

    /// Environment variables win over the config file.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(path) = std::env::var(platform::ENV_BINARY_PATH) {
            if !path.is_empty() {
                self.daemon.binary_path = Some(PathBuf::from(path));
            }
        }
        if platform::force_legacy_backend() {
            self.protocol.force_legacy = true;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.daemon.device_name, "spotui");
        assert!(config.daemon.binary_path.is_none());
        assert_eq!(config.tuning.poll_interval_ms, 1000);
        assert_eq!(config.tuning.reconnect_delays_ms.len(), 5);
        assert!(config.install.release_base_url.starts_with("https://"));
    }

    #[test]
    fn debounce_window_is_shorter_than_cooldown() {
        let config = Config::default();
        assert!(config.tuning.debounce_ms < config.tuning.cooldown_ms);
    }

    #[test]
    fn reconnect_delays_strictly_increase() {
        let delays = TuningConfig::default().reconnect_delays_ms;
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn roundtrips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.install.min_version, config.install.min_version);
        assert_eq!(back.tuning.cooldown_ms, config.tuning.cooldown_ms);
    }
}
