use std::collections::HashSet;

use crate::key::ApiKey;

use super::key_model_state::KeyModelState;

/// Sets a `(key, model)` cooldown. `duration_secs` defaults to the model's
/// `disable_duration` when the caller doesn't override it.
pub fn disable(state: &mut KeyModelState, now: f64, duration_secs: u64) {
    state.is_temporarily_disabled = true;
    state.disabled_until = now + duration_secs as f64;
    state.last_429_error = now;
}

/// Returns whether the pair is currently disabled. If the cooldown has
/// expired, clears the flag and the consecutive-429 counter as a side
/// effect — this is the only place expiry is observed; there is no
/// background timer (I2 in the design).
pub fn is_disabled(state: &mut KeyModelState, now: f64) -> bool {
    if state.is_temporarily_disabled && now >= state.disabled_until {
        state.is_temporarily_disabled = false;
        state.disabled_until = 0.0;
        state.consecutive_429_count = 0;
        return false;
    }
    state.is_temporarily_disabled
}

/// Keys whose premium-model quota is currently exhausted. Restricts only the
/// premium model — other models on that key remain selectable (the borrow
/// asymmetry). Cleared at every quota reset.
#[derive(Debug, Clone, Default)]
pub struct RateLimitedSet(HashSet<ApiKey>);

impl RateLimitedSet {
    pub fn from_keys(keys: impl IntoIterator<Item = ApiKey>) -> Self {
        Self(keys.into_iter().collect())
    }

    pub fn insert(&mut self, key: ApiKey) {
        self.0.insert(key);
    }

    pub fn contains(&self, key: &ApiKey) -> bool {
        self.0.contains(key)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &ApiKey> {
        self.0.iter()
    }

    pub fn as_vec(&self) -> Vec<ApiKey> {
        self.0.iter().cloned().collect()
    }
}
