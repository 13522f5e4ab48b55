use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::KeytideError;
use crate::key::{ApiKey, KeyPool};
use crate::model::ModelTable;

const MODEL_ORDER: &[&str] = &[
    "gemini-2.5-pro",
    "gemini-2.5-flash",
    "gemini-2.0-flash",
    "gemini-2.0-flash-lite",
    "gemini-1.5-flash",
];

const DEFAULT_QUOTA_RESET_DATETIME: &str = "2025-01-01 00:00";
const DEFAULT_TIMEZONE: &str = "America/Los_Angeles";
const DEFAULT_RETENTION_SECONDS: u64 = 86_400;
const DEFAULT_DAILY_QUOTA_LIMIT: u64 = 2_000_000;

#[derive(Debug, Deserialize)]
struct RawModelParams {
    #[serde(default)]
    tpm_limit: u64,
    #[serde(default)]
    recovery_threshold: u64,
    #[serde(default)]
    disable_duration_secs: u64,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    priority_keys: Vec<String>,
    #[serde(default)]
    secondary_keys: Vec<String>,
    #[serde(default)]
    models: std::collections::HashMap<String, RawModelParams>,
    #[serde(default)]
    fallback_strategy: std::collections::HashMap<String, Vec<String>>,
    default_model: Option<String>,
    quota_reset_datetime: Option<String>,
    timezone: Option<String>,
    usage_record_retention_seconds: Option<u64>,
    daily_quota_limit: Option<u64>,
}

/// Service configuration loaded from `config.json`. Keys already present in
/// `unavailable.json`'s permanent ban list are filtered out of both pools at
/// load time, matching the original service's startup filtering.
#[derive(Debug, Clone)]
pub struct Config {
    pub path: PathBuf,
    pub keys: KeyPool,
    pub models: ModelTable,
    pub default_model: String,
    pub quota_reset_datetime: String,
    pub timezone: String,
    pub usage_record_retention_seconds: u64,
    pub daily_quota_limit: u64,
}

impl Config {
    /// Loads `config.json`, dropping any key already listed in `banned`.
    pub fn load(path: impl Into<PathBuf>, banned: &[ApiKey]) -> Result<Self, KeytideError> {
        let path = path.into();
        let raw = std::fs::read_to_string(&path).map_err(|source| KeytideError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        let raw: RawConfig = serde_json::from_str(&raw).map_err(|source| KeytideError::ConfigParse {
            path: path.display().to_string(),
            source,
        })?;

        let priority = filter_banned(raw.priority_keys, banned);
        let secondary = filter_banned(raw.secondary_keys, banned);
        let keys = KeyPool::new(priority, secondary);

        let order: Vec<String> = MODEL_ORDER.iter().map(|s| s.to_string()).collect();
        let params = raw
            .models
            .into_iter()
            .map(|(name, p)| {
                (
                    name,
                    crate::model::ModelParams {
                        tpm_limit: p.tpm_limit,
                        recovery_threshold: p.recovery_threshold,
                        disable_duration_secs: p.disable_duration_secs,
                    },
                )
            })
            .collect();
        let premium = MODEL_ORDER.first().expect("model order is non-empty").to_string();
        let models = ModelTable::new(order, params, premium, raw.fallback_strategy);

        Ok(Self {
            path,
            keys,
            models,
            default_model: raw.default_model.unwrap_or_else(|| "gemini-2.5-pro".to_string()),
            quota_reset_datetime: raw
                .quota_reset_datetime
                .unwrap_or_else(|| DEFAULT_QUOTA_RESET_DATETIME.to_string()),
            timezone: raw.timezone.unwrap_or_else(|| DEFAULT_TIMEZONE.to_string()),
            usage_record_retention_seconds: raw
                .usage_record_retention_seconds
                .unwrap_or(DEFAULT_RETENTION_SECONDS),
            daily_quota_limit: raw.daily_quota_limit.unwrap_or(DEFAULT_DAILY_QUOTA_LIMIT),
        })
    }
}

fn filter_banned(raw: Vec<String>, banned: &[ApiKey]) -> Vec<ApiKey> {
    raw.into_iter()
        .map(ApiKey::new)
        .filter(|k| !banned.contains(k))
        .collect()
}

/// `KEYTIDE_CONFIG` overrides the default `config.json` path when set.
pub fn default_config_path() -> PathBuf {
    std::env::var("KEYTIDE_CONFIG").map(PathBuf::from).unwrap_or_else(|_| Path::new("config.json").to_path_buf())
}
