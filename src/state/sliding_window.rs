use super::key_model_state::{KeyModelState, UsageRecord};

/// Sum of `tokens` over records with `now - timestamp <= 60s`.
pub fn tokens_last_minute(state: &KeyModelState, now: f64) -> u64 {
    state
        .usage_records
        .iter()
        .filter(|r| now - r.timestamp <= 60.0)
        .map(|r| r.tokens)
        .sum()
}

/// Appends a `(now, tokens)` record, bumps the lifetime and daily counters,
/// then prunes records older than `retention_seconds`. O(n) scan; amortized
/// negligible since retention is much larger than the 60s window that matters.
pub fn record(state: &mut KeyModelState, now: f64, tokens: u64, retention_seconds: f64) {
    state.usage_records.push(UsageRecord { timestamp: now, tokens });
    state.total_tokens += tokens;
    state.daily_tokens += tokens;
    prune(state, now, retention_seconds);
}

/// Drops records older than `retention_seconds`. Safe to call at any time —
/// only the last 60s of records affects any availability decision.
pub fn prune(state: &mut KeyModelState, now: f64, retention_seconds: f64) {
    state
        .usage_records
        .retain(|r| now - r.timestamp < retention_seconds);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sums_only_last_60_seconds() {
        let mut state = KeyModelState::default();
        record(&mut state, 1000.0, 50, 86400.0);
        record(&mut state, 1030.0, 30, 86400.0);
        record(&mut state, 1070.0, 100, 86400.0); // >60s after first record
        assert_eq!(tokens_last_minute(&state, 1070.0), 130);
    }

    #[test]
    fn prune_drops_records_past_retention() {
        let mut state = KeyModelState::default();
        record(&mut state, 0.0, 10, 100.0);
        record(&mut state, 50.0, 20, 100.0);
        prune(&mut state, 200.0, 100.0);
        assert_eq!(state.usage_records.len(), 1);
        assert_eq!(state.usage_records[0].tokens, 20);
    }

    #[test]
    fn total_and_daily_tokens_accumulate() {
        let mut state = KeyModelState::default();
        record(&mut state, 0.0, 10, 86400.0);
        record(&mut state, 1.0, 5, 86400.0);
        assert_eq!(state.total_tokens, 15);
        assert_eq!(state.daily_tokens, 15);
    }
}
