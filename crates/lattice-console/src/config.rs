use crate::backoff::ReconnectBackoff;
use crate::driver::SessionConfig;
use crate::error::ConfigError;
use crate::notifier::NotifierConfig;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_MASTER_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_LOG_DIR: &str = ".lattice/logs";
const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
const DEFAULT_WATCHDOG_SECS: u64 = 300;
const DEFAULT_DELETE_CONFIRMATIONS: u32 = 2;
const DEFAULT_RECONNECT_BASE_MS: u64 = 1000;
const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;
const DEFAULT_RECONNECT_CEILING: u32 = 8;
const DEFAULT_PING_INTERVAL_SECS: u64 = 15;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
const DEFAULT_HISTORY_LIMIT: u32 = 50;
const MAX_HISTORY_LIMIT: u32 = 200;

#[derive(Clone, Debug)]
pub struct ConsoleConfig {
    pub master_url: Url,
    pub poll_interval: Duration,
    pub watchdog: Duration,
    pub delete_confirmations: u32,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub reconnect_ceiling: u32,
    pub ping_interval: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub history_limit: u32,
    pub log_dir: PathBuf,
}

/// Values given on the command line. `None` falls through to the environment.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub master_url: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub watchdog_secs: Option<u64>,
    pub delete_confirmations: Option<u32>,
    pub reconnect_base_ms: Option<u64>,
    pub reconnect_max_ms: Option<u64>,
    pub reconnect_ceiling: Option<u32>,
    pub ping_interval_secs: Option<u64>,
    pub log_dir: Option<String>,
}

impl ConsoleConfig {
    pub fn resolve(overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        Self::resolve_with(overrides, |key| std::env::var(key).ok())
    }

    pub fn resolve_with<F>(overrides: &ConfigOverrides, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| env(key).filter(|value| !value.trim().is_empty());

        let master_raw = overrides
            .master_url
            .clone()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| env("LATTICE_MASTER_URL"))
            .unwrap_or_else(|| DEFAULT_MASTER_URL.to_string());
        let master_url = parse_master_url(&master_raw)?;

        let poll_interval_ms = resolve_number(
            overrides.poll_interval_ms,
            "LATTICE_POLL_INTERVAL_MS",
            DEFAULT_POLL_INTERVAL_MS,
            &env,
        )?;
        let watchdog_secs = resolve_number(
            overrides.watchdog_secs,
            "LATTICE_WATCHDOG_SECS",
            DEFAULT_WATCHDOG_SECS,
            &env,
        )?;
        let delete_confirmations = resolve_number(
            overrides.delete_confirmations,
            "LATTICE_DELETE_CONFIRMATIONS",
            DEFAULT_DELETE_CONFIRMATIONS,
            &env,
        )?;
        let reconnect_base_ms = resolve_number(
            overrides.reconnect_base_ms,
            "LATTICE_RECONNECT_BASE_MS",
            DEFAULT_RECONNECT_BASE_MS,
            &env,
        )?;
        let reconnect_max_ms = resolve_number(
            overrides.reconnect_max_ms,
            "LATTICE_RECONNECT_MAX_MS",
            DEFAULT_RECONNECT_MAX_MS,
            &env,
        )?;
        let reconnect_ceiling = resolve_number(
            overrides.reconnect_ceiling,
            "LATTICE_RECONNECT_CEILING",
            DEFAULT_RECONNECT_CEILING,
            &env,
        )?;
        let ping_interval_secs = resolve_number(
            overrides.ping_interval_secs,
            "LATTICE_PING_INTERVAL_SECS",
            DEFAULT_PING_INTERVAL_SECS,
            &env,
        )?;
        let connect_timeout_secs = resolve_number(
            None,
            "LATTICE_CONNECT_TIMEOUT_SECS",
            DEFAULT_CONNECT_TIMEOUT_SECS,
            &env,
        )?;
        let request_timeout_secs = resolve_number(
            None,
            "LATTICE_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
            &env,
        )?;
        let history_limit: u32 =
            resolve_number(None, "LATTICE_HISTORY_LIMIT", DEFAULT_HISTORY_LIMIT, &env)?;

        let log_dir = overrides
            .log_dir
            .clone()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| env("LATTICE_LOG_DIR"))
            .unwrap_or_else(|| DEFAULT_LOG_DIR.to_string());

        for (field, value) in [
            ("poll interval", poll_interval_ms),
            ("watchdog", watchdog_secs),
            ("reconnect base", reconnect_base_ms),
            ("reconnect max", reconnect_max_ms),
            ("ping interval", ping_interval_secs),
            ("connect timeout", connect_timeout_secs),
            ("request timeout", request_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        for (field, value) in [
            ("delete confirmations", delete_confirmations),
            ("reconnect ceiling", reconnect_ceiling),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }

        Ok(Self {
            master_url,
            poll_interval: Duration::from_millis(poll_interval_ms),
            watchdog: Duration::from_secs(watchdog_secs),
            delete_confirmations,
            reconnect_base: Duration::from_millis(reconnect_base_ms),
            reconnect_max: Duration::from_millis(reconnect_max_ms.max(reconnect_base_ms)),
            reconnect_ceiling,
            ping_interval: Duration::from_secs(ping_interval_secs),
            connect_timeout: Duration::from_secs(connect_timeout_secs),
            request_timeout: Duration::from_secs(request_timeout_secs),
            history_limit: history_limit.clamp(1, MAX_HISTORY_LIMIT),
            log_dir: PathBuf::from(log_dir),
        })
    }

    pub fn notifier(&self) -> NotifierConfig {
        NotifierConfig {
            watchdog: self.watchdog,
            delete_confirmations: self.delete_confirmations,
        }
    }

    pub fn backoff(&self) -> ReconnectBackoff {
        ReconnectBackoff::new(
            self.reconnect_base,
            self.reconnect_max,
            self.reconnect_ceiling,
        )
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            backoff: self.backoff(),
            ping_interval: self.ping_interval,
            connect_timeout: self.connect_timeout,
        }
    }
}

fn parse_master_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|err| ConfigError::MasterUrl {
        value: raw.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::MasterUrl {
            value: raw.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

fn resolve_number<T, F>(
    flag: Option<T>,
    key: &'static str,
    default: T,
    env: &F,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = flag {
        return Ok(value);
    }
    match env(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidEnv { key, value }),
        None => Ok(default),
    }
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn env_true(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|value| parse_bool_flag(&value))
        .unwrap_or(false)
}
