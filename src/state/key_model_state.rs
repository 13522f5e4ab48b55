use serde::{Deserialize, Serialize};

/// A single `(timestamp, tokens)` sample retained for the sliding window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: f64,
    pub tokens: u64,
}

/// Per-`(key, model)` state — one instance lives in `UsageStore::usage_data[key][model]`.
///
/// Created on demand at first reference with zeroed fields and never
/// destroyed during a process lifetime except when its key is permanently
/// banned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyModelState {
    #[serde(default)]
    pub usage_records: Vec<UsageRecord>,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub daily_tokens: u64,
    #[serde(default)]
    pub is_temporarily_disabled: bool,
    #[serde(default)]
    pub disabled_until: f64,
    #[serde(default)]
    pub last_429_error: f64,
    #[serde(default)]
    pub consecutive_429_count: u32,
}

impl Default for KeyModelState {
    fn default() -> Self {
        Self {
            usage_records: Vec::new(),
            total_tokens: 0,
            daily_tokens: 0,
            is_temporarily_disabled: false,
            disabled_until: 0.0,
            last_429_error: 0.0,
            consecutive_429_count: 0,
        }
    }
}
