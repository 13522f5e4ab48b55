use crate::error::KeytideError;
use crate::key::ApiKey;
use crate::model::ModelTable;
use crate::state::{cooldown, sliding_window, ban_store::{PermanentBanList, StrikeOutcome}, UsageStore};

/// Hardcoded in the service this was ported from: after this many
/// low-usage consecutive 429s, the engine stops retrying the same
/// `(key, model)` and force-switches instead of hoping the next request
/// succeeds.
const MAX_CONSECUTIVE_429: u32 = 2;

/// What the caller should do next after reporting a 429.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitAction {
    /// Recorded, but usage was already at or above the model's normal
    /// rate limit — a routine cooldown, no escalation.
    Cooldown,
    /// Usage was below `recovery_threshold` yet still 429'd repeatedly;
    /// premium model: the whole key is marked rate-limited (borrowable
    /// everywhere except premium). Non-premium: only this model disabled.
    Escalated,
}

/// Records a successful request: resets the consecutive-429 counter so a
/// single transient error doesn't count toward the escalation threshold, and
/// clears any pending 403 strikes against the key — a success means whatever
/// triggered those 403s no longer applies.
pub fn on_success(
    store: &mut UsageStore,
    ban_list: &mut PermanentBanList,
    key: &ApiKey,
    model: &str,
) -> Result<(), KeytideError> {
    let state = store.get_or_create(key, model);
    if state.consecutive_429_count > 0 {
        state.consecutive_429_count = 0;
    }
    ban_list.clear_strike(key)
}

/// Records token usage for a completed request against the sliding window
/// and lifetime/daily counters.
pub fn record_tokens(
    store: &mut UsageStore,
    key: &ApiKey,
    model: &str,
    tokens: u64,
    now: f64,
    retention_seconds: f64,
) {
    let state = store.get_or_create(key, model);
    sliding_window::record(state, now, tokens, retention_seconds);
}

/// Handles a 429. Below `recovery_threshold` usage, repeated errors look
/// like an upstream anomaly rather than a real rate limit; at
/// `MAX_CONSECUTIVE_429` the engine escalates — either marking the whole
/// key rate-limited (premium model) or disabling just this model. At or
/// above the threshold it's treated as a normal rate limit and the model is
/// disabled on this key immediately.
pub fn on_429(
    store: &mut UsageStore,
    rate_limited: &mut cooldown::RateLimitedSet,
    models: &ModelTable,
    key: &ApiKey,
    model: &str,
    now: f64,
) -> RateLimitAction {
    let params = models.params(model);
    let current_usage = {
        let state = store.get_or_create(key, model);
        sliding_window::tokens_last_minute(state, now)
    };

    let state = store.get_or_create(key, model);
    state.last_429_error = now;
    state.consecutive_429_count += 1;
    let consecutive = state.consecutive_429_count;

    if current_usage < params.recovery_threshold {
        if consecutive >= MAX_CONSECUTIVE_429 {
            if models.is_premium(model) {
                rate_limited.insert(key.clone());
            } else {
                let state = store.get_or_create(key, model);
                cooldown::disable(state, now, params.disable_duration_secs);
            }
            return RateLimitAction::Escalated;
        }
        return RateLimitAction::Cooldown;
    }

    let state = store.get_or_create(key, model);
    cooldown::disable(state, now, params.disable_duration_secs);
    RateLimitAction::Cooldown
}

/// Handles a 403: records a strike against the key via the ban list. A
/// third strike removes the key from the usage store and both config pools;
/// the caller is responsible for rewriting the config file and key pool.
pub fn on_403(
    store: &mut UsageStore,
    ban_list: &mut PermanentBanList,
    key: &ApiKey,
) -> Result<StrikeOutcome, KeytideError> {
    let outcome = ban_list.record_403(key)?;
    if outcome == StrikeOutcome::Banned {
        store.remove_key(key);
    }
    Ok(outcome)
}
