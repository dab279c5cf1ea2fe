use crate::api::DEFAULT_API_BASE;
use crate::storage::{Storage, StorageResult};
use std::time::Duration;

pub const API_BASE_URL_KEY: &str = "api_base_url";
pub const DOCUMENT_ID_KEY: &str = "document_id";
pub const CHUNK_TIMEOUT_KEY: &str = "chunk_timeout_secs";
pub const CONNECT_TIMEOUT_KEY: &str = "connect_timeout_secs";
pub const HISTORY_TIMEOUT_KEY: &str = "history_timeout_secs";

/// Keys accepted by `settings set`.
pub const SETTING_KEYS: &[&str] = &[
    API_BASE_URL_KEY,
    DOCUMENT_ID_KEY,
    CHUNK_TIMEOUT_KEY,
    CONNECT_TIMEOUT_KEY,
    HISTORY_TIMEOUT_KEY,
];

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CHUNK_TIMEOUT_SECS: u64 = 120;
const DEFAULT_HISTORY_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub api_base: String,
    pub connect_timeout: Duration,
    /// `None` disables the idle timeout between chunks.
    pub chunk_timeout: Option<Duration>,
    /// Bound on each history load, append or delete.
    pub history_timeout: Duration,
    pub document_id: Option<i64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            chunk_timeout: Some(Duration::from_secs(DEFAULT_CHUNK_TIMEOUT_SECS)),
            history_timeout: Duration::from_secs(DEFAULT_HISTORY_TIMEOUT_SECS),
            document_id: None,
        }
    }
}

impl ClientConfig {
    /// Read stored settings, falling back to defaults for missing or
    /// unparsable values.
    pub fn load(storage: &dyn Storage) -> StorageResult<Self> {
        let defaults = Self::default();
        let api_base = storage
            .get(API_BASE_URL_KEY)?
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.api_base);
        let connect_timeout = storage
            .get(CONNECT_TIMEOUT_KEY)?
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.connect_timeout);
        let history_timeout = storage
            .get(HISTORY_TIMEOUT_KEY)?
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.history_timeout);
        // 0 means "no idle timeout".
        let chunk_timeout = match storage
            .get(CHUNK_TIMEOUT_KEY)?
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.chunk_timeout,
        };
        let document_id = storage
            .get(DOCUMENT_ID_KEY)?
            .and_then(|v| v.trim().parse::<i64>().ok());

        Ok(Self {
            api_base,
            connect_timeout,
            chunk_timeout,
            history_timeout,
            document_id,
        })
    }
}

/// Check a value before it is stored under `key`.
pub fn validate_setting(key: &str, value: &str) -> Result<(), String> {
    if !SETTING_KEYS.contains(&key) {
        return Err(format!("Unknown setting key: {}", key));
    }
    let value = value.trim();
    match key {
        API_BASE_URL_KEY if !(value.starts_with("http://") || value.starts_with("https://")) => {
            Err(format!("{} must start with http:// or https://", key))
        }
        DOCUMENT_ID_KEY if value.parse::<i64>().is_err() => {
            Err(format!("{} must be a document id", key))
        }
        HISTORY_TIMEOUT_KEY if !matches!(value.parse::<u64>(), Ok(secs) if secs > 0) => {
            Err(format!("{} must be a positive number of seconds", key))
        }
        CHUNK_TIMEOUT_KEY | CONNECT_TIMEOUT_KEY if value.parse::<u64>().is_err() => {
            Err(format!("{} must be a number of seconds", key))
        }
        _ => Ok(()),
    }
}
