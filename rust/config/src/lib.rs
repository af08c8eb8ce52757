//! Configuration for McCache.
//!
//! Options load from the `[tool.mccache]` section of `pyproject.toml` (or an
//! explicit path), then `MCCACHE_`-prefixed environment variables merge on
//! top; environment wins.  Every field has a default, so an empty deployment
//! works out of the box on the local subnet.

use std::net::Ipv4Addr;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use mccache_error::{ErrorCodes, McCacheError};

/// The TOML table the options live under.
const CONFIG_SECTION: &str = "tool.mccache";

/// The default config file, shared with the packaging metadata.
const CONFIG_FILE: &str = "pyproject.toml";

const DEFAULT_MULTICAST_IP: &str = "224.0.0.3";
const DEFAULT_MULTICAST_PORT: u16 = 4000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config error: {0}")]
    Parse(#[from] figment::Error),
}

impl McCacheError for ConfigError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::Internal
    }
}

/// Every tunable in one place.  Durations are plain numbers here (seconds)
/// because that is how they read in TOML and environment variables; typed
/// accessors below convert.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct McCacheConfig {
    /// Per-entry time-to-live in seconds; 0 disables expiry.
    #[serde(default = "McCacheConfig::default_cache_ttl")]
    pub cache_ttl: u64,
    /// Max entries per cache before FIFO eviction.
    #[serde(default = "McCacheConfig::default_cache_max")]
    pub cache_max: usize,
    /// Max aggregate bytes per cache before FIFO eviction.
    #[serde(default = "McCacheConfig::default_cache_size")]
    pub cache_size: usize,
    /// Reserved for heartbeat scheduling.
    #[serde(default = "McCacheConfig::default_cache_pulse")]
    pub cache_pulse: u64,
    /// Reserved.
    #[serde(default = "McCacheConfig::default_cache_mode")]
    pub cache_mode: u32,
    /// Reserved.
    #[serde(default = "McCacheConfig::default_congestion")]
    pub congestion: u32,
    /// Base64-encoded 32-byte key enabling payload encryption.
    #[serde(default)]
    pub crypto_key: Option<String>,
    /// On-wire datagram size including the 18-byte fragment header.
    #[serde(default = "McCacheConfig::default_packet_mtu")]
    pub packet_mtu: usize,
    /// Minimum interval between outbound data operations, in seconds.
    #[serde(default = "McCacheConfig::default_packet_pace")]
    pub packet_pace: f64,
    /// Multicast group address; `ip:port` is accepted and splits.
    #[serde(default = "McCacheConfig::default_multicast_ip")]
    pub multicast_ip: String,
    /// UDP port for the group.
    #[serde(default = "McCacheConfig::default_multicast_port")]
    pub multicast_port: u16,
    /// IP TTL for outbound multicast.
    #[serde(default = "McCacheConfig::default_multicast_hops")]
    pub multicast_hops: u32,
    /// Recent-lookup window for the change callback, in seconds.
    #[serde(default = "McCacheConfig::default_callback_win")]
    pub callback_win: u64,
    /// Chaos drop percentage, 0-99.  Test environments only.
    #[serde(default)]
    pub monkey_tantrum: u8,
    /// Housekeeper period in seconds.
    #[serde(default = "McCacheConfig::default_daemon_sleep")]
    pub daemon_sleep: f64,
}

impl McCacheConfig {
    fn default_cache_ttl() -> u64 {
        3600
    }

    fn default_cache_max() -> usize {
        256
    }

    fn default_cache_size() -> usize {
        8 * 1024 * 1024
    }

    fn default_cache_pulse() -> u64 {
        5
    }

    fn default_cache_mode() -> u32 {
        1
    }

    fn default_congestion() -> u32 {
        25
    }

    fn default_packet_mtu() -> usize {
        1472
    }

    fn default_packet_pace() -> f64 {
        0.1
    }

    fn default_multicast_ip() -> String {
        DEFAULT_MULTICAST_IP.to_string()
    }

    fn default_multicast_port() -> u16 {
        DEFAULT_MULTICAST_PORT
    }

    fn default_multicast_hops() -> u32 {
        3
    }

    fn default_callback_win() -> u64 {
        5
    }

    fn default_daemon_sleep() -> f64 {
        1.0
    }
}

impl Default for McCacheConfig {
    fn default() -> Self {
        McCacheConfig {
            cache_ttl: Self::default_cache_ttl(),
            cache_max: Self::default_cache_max(),
            cache_size: Self::default_cache_size(),
            cache_pulse: Self::default_cache_pulse(),
            cache_mode: Self::default_cache_mode(),
            congestion: Self::default_congestion(),
            crypto_key: None,
            packet_mtu: Self::default_packet_mtu(),
            packet_pace: Self::default_packet_pace(),
            multicast_ip: Self::default_multicast_ip(),
            multicast_port: Self::default_multicast_port(),
            multicast_hops: Self::default_multicast_hops(),
            callback_win: Self::default_callback_win(),
            monkey_tantrum: 0,
            daemon_sleep: Self::default_daemon_sleep(),
        }
    }
}

impl McCacheConfig {
    /// Load from the default file location plus the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(CONFIG_FILE)
    }

    /// Load from an explicit TOML file plus the environment.  The file may be
    /// absent; the `[tool.mccache]` section may be absent.  Environment
    /// variables always win over the file, which wins over the defaults.
    pub fn load_from_path(path: &str) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(McCacheConfig::default()));
        let file = Figment::from(Toml::file(path));
        if let Ok(section) = file.extract_inner::<figment::value::Value>(CONFIG_SECTION) {
            figment = figment.merge(Serialized::defaults(section));
        }
        let mut config: McCacheConfig = figment.merge(Env::prefixed("MCCACHE_")).extract()?;
        config.normalize();
        Ok(config)
    }

    // Repair out-of-range values instead of refusing to start; a cache
    // library should not take the application down over a typo.
    fn normalize(&mut self) {
        if let Some((ip, port)) = self.multicast_ip.split_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                self.multicast_port = port;
            }
            self.multicast_ip = ip.to_string();
        }

        let valid_group = self
            .multicast_ip
            .parse::<Ipv4Addr>()
            .map(|ip| ip.is_multicast())
            .unwrap_or(false);
        if !valid_group {
            tracing::warn!(
                "{} is not a valid multicast address, defaulting to {}:{}",
                self.multicast_ip,
                DEFAULT_MULTICAST_IP,
                DEFAULT_MULTICAST_PORT
            );
            self.multicast_ip = DEFAULT_MULTICAST_IP.to_string();
            self.multicast_port = DEFAULT_MULTICAST_PORT;
        }

        if self.monkey_tantrum > 99 {
            tracing::warn!(
                "monkey_tantrum {} is out of range, clamping to 99",
                self.monkey_tantrum
            );
            self.monkey_tantrum = 99;
        }

        if !self.packet_pace.is_finite() || self.packet_pace < 0.0 {
            tracing::warn!(
                "packet_pace {} is invalid, using the default",
                self.packet_pace
            );
            self.packet_pace = Self::default_packet_pace();
        }

        if !self.daemon_sleep.is_finite() || self.daemon_sleep <= 0.0 {
            tracing::warn!(
                "daemon_sleep {} is invalid, using the default",
                self.daemon_sleep
            );
            self.daemon_sleep = Self::default_daemon_sleep();
        }
    }

    /// The multicast group, guaranteed valid after loading.
    pub fn group(&self) -> Ipv4Addr {
        self.multicast_ip
            .parse()
            .unwrap_or(Ipv4Addr::new(224, 0, 0, 3))
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl)
    }

    pub fn pace(&self) -> Duration {
        Duration::from_secs_f64(self.packet_pace)
    }

    pub fn callback_window(&self) -> Duration {
        Duration::from_secs(self.callback_win)
    }

    pub fn housekeeping_period(&self) -> Duration {
        Duration::from_secs_f64(self.daemon_sleep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_any_source() {
        figment::Jail::expect_with(|_jail| {
            let config = McCacheConfig::load().expect("load defaults");
            assert_eq!(config, McCacheConfig::default());
            assert_eq!(config.cache_ttl, 3600);
            assert_eq!(config.cache_max, 256);
            assert_eq!(config.cache_size, 8 * 1024 * 1024);
            assert_eq!(config.packet_mtu, 1472);
            assert_eq!(config.group(), Ipv4Addr::new(224, 0, 0, 3));
            assert_eq!(config.multicast_port, 4000);
            Ok(())
        });
    }

    #[test]
    fn file_section_overrides_defaults_and_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "pyproject.toml",
                r#"
                    [tool.other-tool]
                    cache_max = 9999

                    [tool.mccache]
                    cache_max = 512
                    multicast_port = 4545
                    packet_pace = 0.25
                "#,
            )?;
            jail.set_env("MCCACHE_CACHE_MAX", "1024");
            let config = McCacheConfig::load().expect("load layered");
            assert_eq!(config.cache_max, 1024);
            assert_eq!(config.multicast_port, 4545);
            assert_eq!(config.packet_pace, 0.25);
            // Untouched fields keep their defaults.
            assert_eq!(config.cache_ttl, 3600);
            Ok(())
        });
    }

    #[test]
    fn invalid_multicast_address_falls_back_to_the_default() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("MCCACHE_MULTICAST_IP", "10.1.2.3");
            jail.set_env("MCCACHE_MULTICAST_PORT", "5000");
            let config = McCacheConfig::load().expect("load");
            assert_eq!(config.group(), Ipv4Addr::new(224, 0, 0, 3));
            assert_eq!(config.multicast_port, 4000);
            Ok(())
        });
    }

    #[test]
    fn combined_ip_and_port_splits() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("MCCACHE_MULTICAST_IP", "224.0.0.251:5353");
            let config = McCacheConfig::load().expect("load");
            assert_eq!(config.group(), Ipv4Addr::new(224, 0, 0, 251));
            assert_eq!(config.multicast_port, 5353);
            Ok(())
        });
    }

    #[test]
    fn tantrum_is_clamped_into_percent_range() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("MCCACHE_MONKEY_TANTRUM", "250");
            let config = McCacheConfig::load().expect("load");
            assert_eq!(config.monkey_tantrum, 99);
            Ok(())
        });
    }

    #[test]
    fn nonsense_periods_are_repaired() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("MCCACHE_DAEMON_SLEEP", "-4.0");
            let config = McCacheConfig::load().expect("load");
            assert_eq!(config.daemon_sleep, 1.0);
            Ok(())
        });
    }
}
