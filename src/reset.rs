use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::state::{cooldown::RateLimitedSet, UsageStore};

/// Computes the next daily reset instant: 01:00 in `tz`, strictly after
/// `now_utc`. Falls back to UTC if `tz` doesn't parse — matching the
/// original service's behavior of defaulting to UTC on an unknown zone
/// rather than failing startup.
pub fn next_reset_after(tz: &str, now_utc: DateTime<Utc>) -> DateTime<Utc> {
    let zone = Tz::from_str(tz).unwrap_or(chrono_tz::UTC);
    let now_local = now_utc.with_timezone(&zone);

    let mut candidate_date = now_local.date_naive();
    loop {
        let candidate_naive = candidate_date
            .and_hms_opt(1, 0, 0)
            .expect("01:00:00 is always a valid time");
        if let Some(candidate_local) = zone.from_local_datetime(&candidate_naive).single() {
            if candidate_local > now_local {
                return candidate_local.with_timezone(&Utc);
            }
        }
        candidate_date = candidate_date.succ_opt().expect("date arithmetic does not overflow");
    }
}

/// Checks whether the stored `next_reset` has passed and, if so, performs
/// the reset: clears the rate-limited set, zeroes every `daily_tokens`
/// counter, and schedules the following day's reset. Returns whether a
/// reset actually occurred — callers use this to decide whether to persist
/// and log. Idempotent: calling again before the new `next_reset` is a
/// no-op, so a restart after a missed reset catches up exactly once.
pub fn maybe_reset(store: &mut UsageStore, tz: &str, now_utc: DateTime<Utc>) -> bool {
    let due = match store.next_reset().and_then(|s| DateTime::parse_from_rfc3339(s).ok()) {
        Some(stored) => now_utc >= stored.with_timezone(&Utc),
        None => true,
    };

    if !due {
        return false;
    }

    *store.rate_limited_mut() = RateLimitedSet::default();
    for (_, state) in store.iter_pairs_mut() {
        state.daily_tokens = 0;
    }

    let next = next_reset_after(tz, now_utc);
    store.set_next_reset(next.to_rfc3339());
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    #[test]
    fn next_reset_is_one_am_local_strictly_in_the_future() {
        let now = Utc.with_ymd_and_hms(2026, 3, 5, 5, 30, 0).unwrap(); // 21:30 PST previous day
        let next = next_reset_after("America/Los_Angeles", now);
        let local = next.with_timezone(&chrono_tz::America::Los_Angeles);
        assert_eq!((local.format("%H:%M").to_string()), "01:00");
        assert!(next > now);
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let now = Utc.with_ymd_and_hms(2026, 3, 5, 0, 30, 0).unwrap();
        let next = next_reset_after("Not/AZone", now);
        assert_eq!(next.format("%H:%M").to_string(), "01:00");
    }

    #[test]
    fn catch_up_on_missed_reset_clears_state() {
        let path = std::env::temp_dir().join(format!("keytide_reset_test_{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let mut store = UsageStore::load(&path);
        let key = crate::key::ApiKey::new("abcd1234");
        store.get_or_create(&key, "gemini-2.5-pro").daily_tokens = 500;
        store.rate_limited_mut().insert(key.clone());
        store.set_next_reset("2020-01-01T01:00:00+00:00".to_string());

        let now = Utc.with_ymd_and_hms(2026, 3, 5, 12, 0, 0).unwrap();
        assert!(maybe_reset(&mut store, "UTC", now));
        assert_eq!(store.get(&key, "gemini-2.5-pro").unwrap().daily_tokens, 0);
        assert!(!store.rate_limited().contains(&key));
        assert!(!maybe_reset(&mut store, "UTC", now));

        let _ = std::fs::remove_file(&path);
    }
}
