// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for fnhost-server.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use fnhost_core::Toolchain;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the router listens on
    pub listen_addr: SocketAddr,
    /// Base directory; sources under `src/`, binaries under `bin/`
    pub base_dir: PathBuf,
    /// Toolchain invoked for every build
    pub toolchain: Toolchain,
    /// How long a new instance may take to accept connections
    pub readiness_timeout: Duration,
    /// Delay between readiness dials
    pub probe_interval: Duration,
    /// SIGTERM to SIGKILL grace when stopping an instance
    pub stop_grace: Duration,
    /// How long a recompile waits for the previous instance to stop
    pub supersession_timeout: Duration,
    /// Largest accepted upload
    pub max_upload_bytes: usize,
    /// How long shutdown waits for instances
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            base_dir: PathBuf::from(".data"),
            toolchain: Toolchain::default(),
            readiness_timeout: Duration::from_millis(5000),
            probe_interval: Duration::from_millis(50),
            stop_grace: Duration::from_millis(5000),
            supersession_timeout: Duration::from_secs(60),
            max_upload_bytes: 64 * 1024 * 1024,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host: IpAddr = parse_or(&lookup, "FNHOST_BIND_ADDR", defaults.listen_addr.ip())?;
        let port: u16 = parse_or(&lookup, "FNHOST_PORT", defaults.listen_addr.port())?;

        let base_dir = lookup("FNHOST_BASE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.base_dir);

        let toolchain = match lookup("FNHOST_BUILD_COMMAND") {
            Some(command) => Toolchain::parse(&command)
                .ok_or(ConfigError::Invalid("FNHOST_BUILD_COMMAND", command))?,
            None => defaults.toolchain,
        };

        let millis = |key: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            parse_or(&lookup, key, default.as_millis() as u64).map(Duration::from_millis)
        };
        let secs = |key: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            parse_or(&lookup, key, default.as_secs()).map(Duration::from_secs)
        };

        Ok(Self {
            listen_addr: SocketAddr::new(host, port),
            base_dir,
            toolchain,
            readiness_timeout: millis("FNHOST_READINESS_TIMEOUT_MS", defaults.readiness_timeout)?,
            probe_interval: millis("FNHOST_PROBE_INTERVAL_MS", defaults.probe_interval)?,
            stop_grace: millis("FNHOST_STOP_GRACE_MS", defaults.stop_grace)?,
            supersession_timeout: secs(
                "FNHOST_SUPERSESSION_TIMEOUT_SECS",
                defaults.supersession_timeout,
            )?,
            max_upload_bytes: parse_or(&lookup, "FNHOST_MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?,
            shutdown_timeout: secs("FNHOST_SHUTDOWN_TIMEOUT_SECS", defaults.shutdown_timeout)?,
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key, raw)),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is set to a value that cannot be used.
    #[error("Invalid value for {0}: {1:?}")]
    Invalid(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.base_dir, PathBuf::from(".data"));
        assert_eq!(config.toolchain.program(), "rustc");
        assert_eq!(config.readiness_timeout, Duration::from_secs(5));
        assert_eq!(config.probe_interval, Duration::from_millis(50));
        assert_eq!(config.supersession_timeout, Duration::from_secs(60));
        assert_eq!(config.max_upload_bytes, 67_108_864);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("FNHOST_BIND_ADDR", "127.0.0.1"),
            ("FNHOST_PORT", "8088"),
            ("FNHOST_BASE_DIR", "/var/lib/fnhost"),
            ("FNHOST_BUILD_COMMAND", "cargo build --release"),
            ("FNHOST_READINESS_TIMEOUT_MS", "250"),
            ("FNHOST_SUPERSESSION_TIMEOUT_SECS", "5"),
            ("FNHOST_MAX_UPLOAD_BYTES", "1024"),
        ])
        .unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:8088".parse().unwrap());
        assert_eq!(config.base_dir, PathBuf::from("/var/lib/fnhost"));
        assert_eq!(config.toolchain.program(), "cargo");
        assert_eq!(config.toolchain.args(), ["build", "--release"]);
        assert_eq!(config.readiness_timeout, Duration::from_millis(250));
        assert_eq!(config.supersession_timeout, Duration::from_secs(5));
        assert_eq!(config.max_upload_bytes, 1024);
    }

    #[test]
    fn test_invalid_values() {
        let err = load(&[("FNHOST_PORT", "99999")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("FNHOST_PORT", _)));

        let err = load(&[("FNHOST_BUILD_COMMAND", "   ")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("FNHOST_BUILD_COMMAND", _)));

        let err = load(&[("FNHOST_PROBE_INTERVAL_MS", "fast")]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid value for FNHOST_PROBE_INTERVAL_MS: \"fast\""
        );
    }
}
