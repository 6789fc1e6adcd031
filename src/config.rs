//! Process configuration from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::runner::SchedulerConfig;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_STATE_DIR: &str = "./state";
const DEFAULT_WORKDIR: &str = "./workdir";
const DEFAULT_ARTIFACTS_DIR: &str = "./artifacts";
const DEFAULT_POLL_INTERVAL_MS: u64 = 3_000;
const DEFAULT_SYNC_INTERVAL_MS: u64 = 300_000;
const DEFAULT_BUILD_COOLDOWN_MS: u64 = 60_000;
const DEFAULT_COMPILE_TIMEOUT_MS: u64 = 600_000;
const DEFAULT_BINARY_EXTENSION: &str = "exe";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: expected {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// Directory holding the store snapshot, event log, and build logs.
    pub state_dir: PathBuf,
    pub webhook_secret: Option<String>,
    pub github_token: Option<String>,
    pub workdir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub poll_interval: Duration,
    pub sync_interval: Duration,
    pub build_cooldown: Duration,
    pub compile_timeout: Duration,
    pub sync_on_start: bool,
    pub binary_extension: String,
}

impl Config {
    /// Reads the process environment. Unset or empty variables take their
    /// defaults; values that do not parse are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let listen_addr = parse_or(
            "REFBUILD_LISTEN_ADDR",
            get("REFBUILD_LISTEN_ADDR"),
            "a socket address",
            DEFAULT_LISTEN_ADDR,
        )?;

        Ok(Config {
            listen_addr,
            state_dir: get("REFBUILD_STATE_DIR")
                .unwrap_or_else(|| DEFAULT_STATE_DIR.to_string())
                .into(),
            webhook_secret: get("GITHUB_WEBHOOK_SECRET"),
            github_token: get("GITHUB_TOKEN"),
            workdir: get("REFBUILD_WORKDIR")
                .unwrap_or_else(|| DEFAULT_WORKDIR.to_string())
                .into(),
            artifacts_dir: get("REFBUILD_ARTIFACTS_DIR")
                .unwrap_or_else(|| DEFAULT_ARTIFACTS_DIR.to_string())
                .into(),
            poll_interval: millis(
                "REFBUILD_POLL_INTERVAL_MS",
                get("REFBUILD_POLL_INTERVAL_MS"),
                DEFAULT_POLL_INTERVAL_MS,
            )?,
            sync_interval: millis(
                "REFBUILD_SYNC_INTERVAL_MS",
                get("REFBUILD_SYNC_INTERVAL_MS"),
                DEFAULT_SYNC_INTERVAL_MS,
            )?,
            build_cooldown: millis(
                "REFBUILD_BUILD_COOLDOWN_MS",
                get("REFBUILD_BUILD_COOLDOWN_MS"),
                DEFAULT_BUILD_COOLDOWN_MS,
            )?,
            compile_timeout: millis(
                "REFBUILD_COMPILE_TIMEOUT_MS",
                get("REFBUILD_COMPILE_TIMEOUT_MS"),
                DEFAULT_COMPILE_TIMEOUT_MS,
            )?,
            sync_on_start: flag("REFBUILD_SYNC_ON_START", get("REFBUILD_SYNC_ON_START"), true)?,
            binary_extension: get("REFBUILD_BINARY_EXTENSION")
                .map(|ext| ext.trim_start_matches('.').to_string())
                .filter(|ext| !ext.is_empty())
                .unwrap_or_else(|| DEFAULT_BINARY_EXTENSION.to_string()),
        })
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: self.poll_interval,
            sync_interval: self.sync_interval,
            sync_on_start: self.sync_on_start,
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    var: &'static str,
    value: Option<String>,
    expected: &'static str,
    default: &str,
) -> Result<T, ConfigError> {
    let raw = value.unwrap_or_else(|| default.to_string());
    raw.parse().map_err(|_| ConfigError::Invalid {
        var,
        expected,
        value: raw,
    })
}

/// Intervals of zero are rejected; a zero-period `tokio::time::interval` panics.
fn millis(var: &'static str, value: Option<String>, default: u64) -> Result<Duration, ConfigError> {
    let Some(raw) = value else {
        return Ok(Duration::from_millis(default));
    };
    match raw.parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
        _ => Err(ConfigError::Invalid {
            var,
            expected: "a positive number of milliseconds",
            value: raw,
        }),
    }
}

fn flag(var: &'static str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = value else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            expected: "a boolean",
            value: raw,
        }),
    }
}
