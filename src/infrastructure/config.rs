use crate::infrastructure::error::InfraError;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use url::Url;

const APP_JSON: &str = "app.json";

pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:3000/chrono-test";
pub const DEFAULT_RETRY_PERIOD_SECONDS: u64 = 30;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_STORAGE_KEY: &str = "chrono-tasks-pending-requests";
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 10;
pub const DEFAULT_TICK_PERIOD_SECONDS: u64 = 1;

const API_TOKEN_KEYS: &[&str] = &["CHRONO_TASKS_API_TOKEN", "API_TOKEN"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub api_base_url: Url,
    pub retry_period: Duration,
    pub max_retries: u32,
    pub storage_key: String,
    pub request_timeout: Duration,
    pub tick_period: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            api_base_url: Url::parse(DEFAULT_API_BASE_URL).expect("valid default api base url"),
            retry_period: Duration::from_secs(DEFAULT_RETRY_PERIOD_SECONDS),
            max_retries: DEFAULT_MAX_RETRIES,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECONDS),
            tick_period: Duration::from_secs(DEFAULT_TICK_PERIOD_SECONDS),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppConfigFile {
    api_base_url: Option<String>,
    retry_period_seconds: Option<u64>,
    max_retries: Option<u32>,
    storage_key: Option<String>,
    request_timeout_seconds: Option<u64>,
    tick_period_seconds: Option<u64>,
}

fn default_app_config() -> serde_json::Value {
    serde_json::json!({
        "schema": 1,
        "apiBaseUrl": DEFAULT_API_BASE_URL,
        "retryPeriodSeconds": DEFAULT_RETRY_PERIOD_SECONDS,
        "maxRetries": DEFAULT_MAX_RETRIES,
        "storageKey": DEFAULT_STORAGE_KEY,
        "requestTimeoutSeconds": DEFAULT_REQUEST_TIMEOUT_SECONDS,
        "tickPeriodSeconds": DEFAULT_TICK_PERIOD_SECONDS
    })
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    let path = config_dir.join(APP_JSON);
    if !path.exists() {
        let formatted = serde_json::to_string_pretty(&default_app_config())?;
        fs::write(path, format!("{formatted}\n"))?;
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != 1 {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn load_queue_config(config_dir: &Path) -> Result<QueueConfig, InfraError> {
    let path = config_dir.join(APP_JSON);
    let file: AppConfigFile = serde_json::from_value(read_config(&path)?)?;
    let defaults = QueueConfig::default();

    let api_base_url = match file
        .api_base_url
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        Some(raw) => Url::parse(raw)
            .map_err(|error| InfraError::InvalidConfig(format!("invalid apiBaseUrl '{raw}': {error}")))?,
        None => defaults.api_base_url,
    };
    if api_base_url.cannot_be_a_base() {
        return Err(InfraError::InvalidConfig(format!(
            "apiBaseUrl cannot be a base: {api_base_url}"
        )));
    }

    let storage_key = file
        .storage_key
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or(defaults.storage_key);

    Ok(QueueConfig {
        api_base_url,
        retry_period: positive_seconds(file.retry_period_seconds, defaults.retry_period, "retryPeriodSeconds")?,
        max_retries: match file.max_retries {
            Some(0) => {
                return Err(InfraError::InvalidConfig("maxRetries must be > 0".to_string()));
            }
            Some(value) => value,
            None => defaults.max_retries,
        },
        storage_key,
        request_timeout: positive_seconds(
            file.request_timeout_seconds,
            defaults.request_timeout,
            "requestTimeoutSeconds",
        )?,
        tick_period: positive_seconds(file.tick_period_seconds, defaults.tick_period, "tickPeriodSeconds")?,
    })
}

fn positive_seconds(value: Option<u64>, default: Duration, field_name: &str) -> Result<Duration, InfraError> {
    match value {
        Some(0) => Err(InfraError::InvalidConfig(format!("{field_name} must be > 0"))),
        Some(seconds) => Ok(Duration::from_secs(seconds)),
        None => Ok(default),
    }
}

pub fn load_api_token_from_env() -> Option<String> {
    load_api_token_from_lookup(|key| std::env::var(key).ok())
}

pub fn load_api_token_from_lookup<F>(lookup: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    for key in API_TOKEN_KEYS {
        if let Some(value) = lookup(key) {
            let normalized = value.trim();
            if !normalized.is_empty() {
                return Some(normalized.to_string());
            }
        }
    }
    None
}

pub fn api_token_keys() -> &'static [&'static str] {
    API_TOKEN_KEYS
}
