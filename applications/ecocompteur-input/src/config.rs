use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use std::{fs, path::Path};

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 750;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub polling: PollingConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Base address of the meter, e.g. "http://192.168.1.50"
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

/// Both cadences are in seconds and required; they are kept optional here so a
/// missing value surfaces as a config error when the scheduler starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollingConfig {
    pub index_secs: Option<u64>,
    pub json_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Spike ceiling in watts; absent or <= 0 disables validation
    pub max_watts: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_path")]
    pub path: String,
}

fn default_state_path() -> String {
    "state/ecocompteur.json".into()
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

/// Scheduler inputs, checked by [`PollSettings::validate`] on start.
#[derive(Debug, Clone, PartialEq)]
pub struct PollSettings {
    pub base_url: String,
    pub index_interval: Duration,
    pub json_interval: Duration,
    pub request_timeout: Duration,
    pub max_watts: Option<f64>,
}

impl Config {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, then parse.
    /// Afterwards, if ECOCOMPTEUR_BASE_URL env is set, override `device.base_url`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let expanded = expand_env_placeholders(&raw)?;
        let mut cfg: Self = serde_yaml::from_str(&expanded)?;

        if let Ok(base_url) = std::env::var("ECOCOMPTEUR_BASE_URL") {
            cfg.device.base_url = Some(base_url);
        }

        Ok(cfg)
    }

    /// Scheduler inputs; missing values become empty/zero and are rejected by
    /// [`PollSettings::validate`].
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            base_url: self
                .device
                .base_url
                .as_deref()
                .map(|s| s.trim().trim_end_matches('/').to_string())
                .unwrap_or_default(),
            index_interval: Duration::from_secs(self.polling.index_secs.unwrap_or(0)),
            json_interval: Duration::from_secs(self.polling.json_secs.unwrap_or(0)),
            request_timeout: Duration::from_millis(self.device.request_timeout_ms),
            max_watts: self.validation.max_watts,
        }
    }
}

impl PollSettings {
    pub fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            return Err(AppError::Config("device.base_url must be set".into()));
        }
        if self.index_interval.is_zero() {
            return Err(AppError::Config(
                "polling.index_secs must be set and greater than 0".into(),
            ));
        }
        if self.json_interval.is_zero() {
            return Err(AppError::Config(
                "polling.json_secs must be set and greater than 0".into(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(AppError::Config(
                "device.request_timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Expand $(VAR) and ${VAR} placeholders using environment variables.
/// "$$" becomes a literal "$".
fn expand_env_placeholders(input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut it = input.chars().peekable();

    while let Some(c) = it.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let close = match it.peek().copied() {
            Some('$') => {
                it.next();
                out.push('$');
                continue;
            }
            Some('(') => ')',
            Some('{') => '}',
            _ => {
                out.push('$');
                continue;
            }
        };
        it.next();
        let var = read_until(&mut it, close).ok_or_else(|| {
            AppError::Config(format!("unterminated env placeholder: missing '{close}'"))
        })?;
        let val = std::env::var(&var)
            .map_err(|_| AppError::Config(format!("missing environment variable: {var}")))?;
        out.push_str(&val);
    }

    Ok(out)
}

/// Read characters until we hit `end`, consuming the delimiter.
fn read_until<I>(it: &mut std::iter::Peekable<I>, end: char) -> Option<String>
where
    I: Iterator<Item = char>,
{
    let mut buf = String::new();
    for ch in it.by_ref() {
        if ch == end {
            return Some(buf);
        }
        buf.push(ch);
    }
    None
}
