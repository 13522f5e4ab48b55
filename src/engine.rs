use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;

use crate::config::Config;
use crate::error::KeytideError;
use crate::key::{ApiKey, KeyPool};
use crate::model::ModelTable;
use crate::outcome::{self, RateLimitAction};
use crate::reset;
use crate::selector::{self, Selection};
use crate::state::{ban_store::StrikeOutcome, PermanentBanList, UsageStore};
use crate::status::{self, EngineStatus};

fn unix_now() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

struct Inner {
    config_path: PathBuf,
    keys: KeyPool,
    models: ModelTable,
    default_model: String,
    timezone: String,
    usage_record_retention_seconds: u64,
    daily_quota_limit: u64,
    store: UsageStore,
    ban_list: PermanentBanList,
    cursor: usize,
}

/// The engine: a single re-entrant-free mutex guarding key pools, model
/// table, usage store, ban list, and the sticky selection cursor. Every
/// mutating public method takes the lock once, mutates, persists via a
/// small atomic file write, and releases — holding the lock across that
/// write is intentional, since the writes are small and this keeps
/// selection and persistence from ever observing each other torn.
pub struct Engine {
    inner: Mutex<Inner>,
}

impl Engine {
    pub fn new(config: Config, usage_path: PathBuf, ban_path: PathBuf) -> Self {
        let ban_list = PermanentBanList::load(ban_path);
        let mut store = UsageStore::load(usage_path);

        let now = unix_now();
        store.prune_all(now, config.usage_record_retention_seconds as f64);
        if reset::maybe_reset(&mut store, &config.timezone, Utc::now()) {
            tracing::info!("quota reset caught up at startup");
        }
        if let Err(e) = store.save() {
            tracing::error!(error = %e, "failed to persist usage store after startup reset/prune");
        }

        Self {
            inner: Mutex::new(Inner {
                config_path: config.path,
                keys: config.keys,
                models: config.models,
                default_model: config.default_model,
                timezone: config.timezone,
                usage_record_retention_seconds: config.usage_record_retention_seconds,
                daily_quota_limit: config.daily_quota_limit,
                store,
                ban_list,
                cursor: 0,
            }),
        }
    }

    /// Selects a `(model, key)` pair for `requested_model`. Runs the daily
    /// reset catch-up check first since a selection may be the first call
    /// after the scheduled instant passed with nothing else to trigger it.
    pub fn pick(&self, requested_model: Option<&str>) -> Result<Selection, KeytideError> {
        let mut inner = self.inner.lock().expect("engine mutex poisoned");
        let now = unix_now();

        let Inner { store, timezone, .. } = &mut *inner;
        if reset::maybe_reset(store, timezone, Utc::now()) {
            tracing::info!("daily quota reset");
        }

        let rate_limited = inner.store.rate_limited().clone();
        let Inner { keys, models, store, cursor, default_model, .. } = &mut *inner;
        let selection = selector::pick(
            keys,
            models,
            &rate_limited,
            store,
            cursor,
            requested_model,
            &default_model.clone(),
            now,
        );

        inner.store.save()?;

        selection.ok_or(KeytideError::NoCapacity)
    }

    pub fn on_success(&self, key: &ApiKey, model: &str, tokens: u64) -> Result<(), KeytideError> {
        let mut inner = self.inner.lock().expect("engine mutex poisoned");
        let now = unix_now();
        let retention = inner.usage_record_retention_seconds as f64;
        let Inner { store, ban_list, .. } = &mut *inner;
        outcome::on_success(store, ban_list, key, model)?;
        outcome::record_tokens(store, key, model, tokens, now, retention);
        inner.store.save()
    }

    pub fn on_429(&self, key: &ApiKey, model: &str) -> Result<RateLimitAction, KeytideError> {
        let mut inner = self.inner.lock().expect("engine mutex poisoned");
        let now = unix_now();
        let action = {
            let Inner { store, models, .. } = &mut *inner;
            let mut rate_limited = store.rate_limited().clone();
            let action = outcome::on_429(store, &mut rate_limited, models, key, model, now);
            *store.rate_limited_mut() = rate_limited;
            action
        };
        inner.store.save()?;
        Ok(action)
    }

    /// Reports a 403. On the third strike the key is permanently banned:
    /// removed from the in-memory pool, the usage store, and rewritten out
    /// of `config.json` on disk.
    pub fn on_403(&self, key: &ApiKey) -> Result<StrikeOutcome, KeytideError> {
        let mut inner = self.inner.lock().expect("engine mutex poisoned");
        let Inner { store, ban_list, .. } = &mut *inner;
        let outcome = outcome::on_403(store, ban_list, key)?;

        if outcome == StrikeOutcome::Banned {
            inner.keys.remove(key);
            crate::state::ban_store::remove_key_from_config_file(&inner.config_path, key)?;
            tracing::warn!(key = %key, "key permanently banned after repeated 403s");
        }

        Ok(outcome)
    }

    pub fn status(&self) -> EngineStatus {
        let inner = self.inner.lock().expect("engine mutex poisoned");
        let now = unix_now();
        status::build(
            &inner.keys,
            &inner.models,
            &inner.store,
            inner.store.rate_limited(),
            inner.ban_list.banned(),
            inner.cursor,
            inner.daily_quota_limit,
            now,
        )
    }

    /// Periodic maintenance: prunes stale usage records and runs the reset
    /// catch-up check. Intended to be called roughly once a minute by a
    /// background task, independent of request traffic.
    pub fn tick(&self) -> Result<(), KeytideError> {
        let mut inner = self.inner.lock().expect("engine mutex poisoned");
        let now = unix_now();
        let retention = inner.usage_record_retention_seconds as f64;
        inner.store.prune_all(now, retention);
        let Inner { store, timezone, .. } = &mut *inner;
        if reset::maybe_reset(store, timezone, Utc::now()) {
            tracing::info!("daily quota reset (background tick)");
        }
        inner.store.save()
    }
}
