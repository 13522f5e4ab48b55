use std::collections::HashMap;

use serde::Serialize;

use crate::key::{ApiKey, KeyPool};
use crate::model::ModelTable;
use crate::state::{cooldown::RateLimitedSet, UsageStore};

/// Per-`(key, model)` snapshot returned by the status endpoint. A mirror of
/// `_get_model_recovery_status` merged with the basic token counters, kept
/// as one flat JSON object per the original service's response shape.
#[derive(Debug, Serialize)]
pub struct ModelStatus {
    pub tokens_last_minute: u64,
    pub total_tokens: u64,
    pub daily_tokens: u64,
    pub is_available: bool,
    pub current_usage: u64,
    pub recovery_threshold: u64,
    pub is_temporarily_disabled: bool,
    pub disabled_until: f64,
    pub consecutive_429_count: u32,
}

#[derive(Debug, Serialize)]
pub struct KeyStatus {
    #[serde(flatten)]
    pub models: HashMap<String, ModelStatus>,
    pub daily_quota_exceeded: bool,
}

#[derive(Debug, Serialize)]
pub struct EngineStatus {
    pub current_key: Option<String>,
    pub key_usage_status: HashMap<String, KeyStatus>,
    pub unavailable_keys: Vec<String>,
    pub rate_limited_keys: Vec<String>,
    pub model_order: Vec<String>,
    pub priority_keys: Vec<String>,
    pub secondary_keys: Vec<String>,
    pub grand_total_tokens: u64,
}

/// Builds the status snapshot. Availability uses `tokens_last_minute`
/// rather than mutating the store to clear expired cooldowns — status
/// reporting must not have side effects on selection state.
pub fn build(
    keys: &KeyPool,
    models: &ModelTable,
    store: &UsageStore,
    rate_limited: &RateLimitedSet,
    banned: &[ApiKey],
    cursor: usize,
    daily_quota_limit: u64,
    now: f64,
) -> EngineStatus {
    let all_keys = keys.all_keys();
    let mut key_usage_status = HashMap::new();
    let mut grand_total_tokens = 0u64;

    for key in &all_keys {
        let mut model_statuses = HashMap::new();
        let mut key_daily_total = 0u64;

        for model in models.order() {
            let params = models.params(model);
            let state = store.get(key, model);

            let (tokens_last_minute, total_tokens, daily_tokens, is_temporarily_disabled, disabled_until, consecutive_429_count) =
                match state {
                    Some(s) => (
                        crate::state::sliding_window::tokens_last_minute(s, now),
                        s.total_tokens,
                        s.daily_tokens,
                        s.is_temporarily_disabled,
                        s.disabled_until,
                        s.consecutive_429_count,
                    ),
                    None => (0, 0, 0, false, 0.0, 0),
                };

            grand_total_tokens += total_tokens;
            key_daily_total += daily_tokens;

            let is_available = !(models.is_premium(model) && rate_limited.contains(key))
                && !(is_temporarily_disabled && now < disabled_until)
                && tokens_last_minute < params.tpm_limit;

            model_statuses.insert(
                model.clone(),
                ModelStatus {
                    tokens_last_minute,
                    total_tokens,
                    daily_tokens,
                    is_available,
                    current_usage: tokens_last_minute,
                    recovery_threshold: params.recovery_threshold,
                    is_temporarily_disabled: is_temporarily_disabled && now < disabled_until,
                    disabled_until,
                    consecutive_429_count,
                },
            );
        }

        let daily_quota_exceeded = daily_quota_limit > 0 && key_daily_total > daily_quota_limit;
        key_usage_status.insert(
            key.as_str().to_string(),
            KeyStatus { models: model_statuses, daily_quota_exceeded },
        );
    }

    let current_key = all_keys.get(cursor % all_keys.len().max(1)).map(|k| k.as_str().to_string());

    EngineStatus {
        current_key,
        key_usage_status,
        unavailable_keys: banned.iter().map(|k| k.as_str().to_string()).collect(),
        rate_limited_keys: rate_limited.iter().map(|k| k.as_str().to_string()).collect(),
        model_order: models.order().to_vec(),
        priority_keys: keys.priority().iter().map(|k| k.as_str().to_string()).collect(),
        secondary_keys: keys.secondary().iter().map(|k| k.as_str().to_string()).collect(),
        grand_total_tokens,
    }
}
