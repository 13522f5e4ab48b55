use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::KeytideError;
use crate::key::ApiKey;

use super::cooldown::RateLimitedSet;
use super::key_model_state::KeyModelState;

/// The on-disk shape of `key_usage.json`, exactly as specified: a map of
/// key -> model -> state, the next reset instant, the rate-limited set, and
/// a derived (rebuildable) cache of currently-disabled pairs.
#[derive(Debug, Default, Serialize, Deserialize)]
struct UsageDocument {
    #[serde(default)]
    usage_data: HashMap<String, HashMap<String, KeyModelState>>,
    #[serde(default)]
    next_reset: Option<String>,
    #[serde(default)]
    rate_limited_keys: Vec<String>,
    #[serde(default)]
    model_specific_disabled: HashMap<String, Vec<String>>,
}

/// Durable snapshot of per-`(key, model)` counters, cooldowns, the
/// rate-limited set, and the next reset timestamp. Every mutating method on
/// the engine persists this before returning, via a temp-file-then-rename
/// write so a crash mid-write never leaves a half-written file behind.
pub struct UsageStore {
    path: PathBuf,
    usage_data: HashMap<ApiKey, HashMap<String, KeyModelState>>,
    next_reset: Option<String>,
    rate_limited: RateLimitedSet,
}

impl UsageStore {
    /// Loads from `path`. A missing file starts empty. A file that fails to
    /// parse is quarantined by renaming it to `__illegal_<unixts>_<name>`
    /// and starting empty — the corruption never aborts startup.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => {
                tracing::info!(path = %path.display(), "usage file not found, starting empty");
                return Self::empty(path);
            }
        };

        match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(value) => Self::from_value(path, value),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "usage file is corrupt, quarantining");
                Self::quarantine(&path);
                Self::empty(path)
            }
        }
    }

    fn empty(path: PathBuf) -> Self {
        Self {
            path,
            usage_data: HashMap::new(),
            next_reset: None,
            rate_limited: RateLimitedSet::default(),
        }
    }

    fn quarantine(path: &Path) {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "key_usage.json".to_string());
        let illegal = path.with_file_name(format!("__illegal_{ts}_{name}"));
        if let Err(e) = std::fs::rename(path, &illegal) {
            tracing::warn!(error = %e, "failed to rename corrupt usage file aside");
        }
    }

    /// Parses a loaded document, migrating the older flat-list record format
    /// (`usage_data[key][model]` as a bare array of records) in place by
    /// summing its tokens into `total_tokens` and defaulting the rest.
    fn from_value(path: PathBuf, mut value: serde_json::Value) -> Self {
        if let Some(usage) = value.get_mut("usage_data").and_then(|v| v.as_object_mut()) {
            for (_, models) in usage.iter_mut() {
                let Some(models) = models.as_object_mut() else { continue };
                for (_, model_data) in models.iter_mut() {
                    if let Some(records) = model_data.as_array() {
                        let total: u64 = records
                            .iter()
                            .filter_map(|r| r.get("tokens").and_then(|t| t.as_u64()))
                            .sum();
                        let migrated = serde_json::json!({
                            "usage_records": records,
                            "total_tokens": total,
                            "daily_tokens": 0,
                            "is_temporarily_disabled": false,
                            "disabled_until": 0.0,
                            "last_429_error": 0.0,
                            "consecutive_429_count": 0,
                        });
                        *model_data = migrated;
                    }
                }
            }
        }

        let doc: UsageDocument = match serde_json::from_value(value) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "usage file has invalid structure, quarantining");
                Self::quarantine(&path);
                return Self::empty(path);
            }
        };

        let usage_data = doc
            .usage_data
            .into_iter()
            .map(|(k, v)| (ApiKey::new(k), v))
            .collect();
        let rate_limited = RateLimitedSet::from_keys(
            doc.rate_limited_keys.into_iter().map(ApiKey::new),
        );

        Self {
            path,
            usage_data,
            next_reset: doc.next_reset,
            rate_limited,
        }
    }

    pub fn next_reset(&self) -> Option<&str> {
        self.next_reset.as_deref()
    }

    pub fn set_next_reset(&mut self, iso8601: String) {
        self.next_reset = Some(iso8601);
    }

    pub fn rate_limited(&self) -> &RateLimitedSet {
        &self.rate_limited
    }

    pub fn rate_limited_mut(&mut self) -> &mut RateLimitedSet {
        &mut self.rate_limited
    }

    /// Fetches, creating with zeroed fields on first reference.
    pub fn get_or_create(&mut self, key: &ApiKey, model: &str) -> &mut KeyModelState {
        self.usage_data
            .entry(key.clone())
            .or_default()
            .entry(model.to_string())
            .or_default()
    }

    pub fn get(&self, key: &ApiKey, model: &str) -> Option<&KeyModelState> {
        self.usage_data.get(key)?.get(model)
    }

    /// Iterates every `(key, model)` pair with recorded state.
    pub fn iter_pairs(&self) -> impl Iterator<Item = (&ApiKey, &str, &KeyModelState)> {
        self.usage_data.iter().flat_map(|(key, models)| {
            models.iter().map(move |(model, state)| (key, model.as_str(), state))
        })
    }

    pub fn iter_pairs_mut(&mut self) -> impl Iterator<Item = (&ApiKey, &mut KeyModelState)> {
        self.usage_data
            .iter_mut()
            .flat_map(|(key, models)| models.iter_mut().map(move |(_, state)| (key, state)))
    }

    /// Erases an entire key's usage record — used only when the key is
    /// permanently banned.
    pub fn remove_key(&mut self, key: &ApiKey) {
        self.usage_data.remove(key);
        self.rate_limited.clear_key(key);
    }

    /// Global prune sweep over every retained record, run at startup to
    /// bound memory.
    pub fn prune_all(&mut self, now: f64, retention_seconds: f64) {
        for models in self.usage_data.values_mut() {
            for state in models.values_mut() {
                super::sliding_window::prune(state, now, retention_seconds);
            }
        }
    }

    /// Derives `model_specific_disabled` fresh from `usage_data` at save
    /// time — it's a cache, not source of truth.
    fn derive_disabled(&self) -> HashMap<String, Vec<String>> {
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        for (key, models) in &self.usage_data {
            let disabled: Vec<String> = models
                .iter()
                .filter(|(_, s)| s.is_temporarily_disabled)
                .map(|(m, _)| m.clone())
                .collect();
            if !disabled.is_empty() {
                out.insert(key.as_str().to_string(), disabled);
            }
        }
        out
    }

    /// Serializes to `<file>.tmp` then atomically renames over `<file>`.
    pub fn save(&self) -> Result<(), KeytideError> {
        let doc = UsageDocument {
            usage_data: self
                .usage_data
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), v.clone()))
                .collect(),
            next_reset: self.next_reset.clone(),
            rate_limited_keys: {
                let mut keys: Vec<String> =
                    self.rate_limited.iter().map(|k| k.as_str().to_string()).collect();
                keys.sort();
                keys
            },
            model_specific_disabled: self.derive_disabled(),
        };

        let json = serde_json::to_string_pretty(&doc).expect("usage document always serializes");
        atomic_write(&self.path, &json)
    }
}

/// Writes `contents` to `path` via a temp file in the same directory
/// followed by a rename, which is atomic on the platforms this targets.
pub fn atomic_write(path: &Path, contents: &str) -> Result<(), KeytideError> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents).map_err(|source| KeytideError::Persist {
        path: tmp.display().to_string(),
        source,
    })?;
    std::fs::rename(&tmp, path).map_err(|source| KeytideError::Persist {
        path: path.display().to_string(),
        source,
    })
}

impl RateLimitedSet {
    fn clear_key(&mut self, key: &ApiKey) {
        let remaining: Vec<ApiKey> = self.iter().filter(|k| *k != key).cloned().collect();
        *self = RateLimitedSet::from_keys(remaining);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("keytide_test_{}_{}", std::process::id(), name));
        p
    }

    #[test]
    fn missing_file_starts_empty() {
        let path = temp_path("missing.json");
        let _ = std::fs::remove_file(&path);
        let store = UsageStore::load(&path);
        assert!(store.next_reset().is_none());
    }

    #[test]
    fn corrupt_file_is_quarantined_and_starts_empty() {
        let path = temp_path("corrupt.json");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"not json").unwrap();
        drop(f);

        let store = UsageStore::load(&path);
        assert!(store.next_reset().is_none());
        assert!(!path.exists());

        let dir = path.parent().unwrap();
        let quarantined = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains("__illegal_"));
        assert!(quarantined);
    }

    #[test]
    fn save_then_load_round_trips() {
        let path = temp_path("roundtrip.json");
        let mut store = UsageStore::empty(path.clone());
        let key = ApiKey::new("testkey1");
        let state = store.get_or_create(&key, "gemini-2.5-pro");
        state.total_tokens = 42;
        store.save().unwrap();

        let reloaded = UsageStore::load(&path);
        assert_eq!(reloaded.get(&key, "gemini-2.5-pro").unwrap().total_tokens, 42);
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(path.with_extension("tmp"));
    }

    #[test]
    fn migrates_old_flat_list_format() {
        let path = temp_path("migrate.json");
        let legacy = serde_json::json!({
            "usage_data": {
                "oldkey12": {
                    "gemini-2.5-pro": [
                        {"timestamp": 1.0, "tokens": 10},
                        {"timestamp": 2.0, "tokens": 5},
                    ]
                }
            },
            "next_reset": null,
            "rate_limited_keys": [],
            "model_specific_disabled": {}
        });
        std::fs::write(&path, legacy.to_string()).unwrap();

        let store = UsageStore::load(&path);
        let state = store.get(&ApiKey::new("oldkey12"), "gemini-2.5-pro").unwrap();
        assert_eq!(state.total_tokens, 15);
        assert_eq!(state.usage_records.len(), 2);
        let _ = std::fs::remove_file(&path);
    }
}
