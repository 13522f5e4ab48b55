use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::KeytideError;
use crate::key::ApiKey;

use super::usage_store::atomic_write;

const MAX_403_STRIKES: u32 = 3;

#[derive(Debug, Default, Serialize, Deserialize)]
struct BanDocument {
    #[serde(default)]
    potential_unavailable: HashMap<String, u32>,
    #[serde(default)]
    unavailable: Vec<String>,
}

/// The outcome of reporting a 403 against a key: either it accrued another
/// strike, or it just crossed the threshold and is now permanently banned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrikeOutcome {
    Recorded { strikes: u32 },
    Banned,
}

/// Tracks `unavailable.json`: keys with one or two 403 strikes
/// (`potential_unavailable`) and keys that crossed three strikes and are
/// permanently banned (`unavailable`). Mirrors `UsageStore`'s load/save
/// shape but is its own file, matching the original service's split.
pub struct PermanentBanList {
    path: PathBuf,
    potential: HashMap<ApiKey, u32>,
    banned: Vec<ApiKey>,
}

impl PermanentBanList {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return Self::empty(path),
        };
        let doc: BanDocument = match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unavailable.json is corrupt, starting empty");
                return Self::empty(path);
            }
        };
        Self {
            path,
            potential: doc
                .potential_unavailable
                .into_iter()
                .map(|(k, v)| (ApiKey::new(k), v))
                .collect(),
            banned: doc.unavailable.into_iter().map(ApiKey::new).collect(),
        }
    }

    fn empty(path: PathBuf) -> Self {
        Self { path, potential: HashMap::new(), banned: Vec::new() }
    }

    pub fn is_banned(&self, key: &ApiKey) -> bool {
        self.banned.contains(key)
    }

    pub fn banned(&self) -> &[ApiKey] {
        &self.banned
    }

    /// Records a 403 against `key`. On the third strike, clears its pending
    /// count and promotes it to permanently banned. Persists either way.
    pub fn record_403(&mut self, key: &ApiKey) -> Result<StrikeOutcome, KeytideError> {
        let strikes = self.potential.get(key).copied().unwrap_or(0) + 1;

        let outcome = if strikes >= MAX_403_STRIKES {
            self.potential.remove(key);
            if !self.banned.contains(key) {
                self.banned.push(key.clone());
            }
            StrikeOutcome::Banned
        } else {
            self.potential.insert(key.clone(), strikes);
            StrikeOutcome::Recorded { strikes }
        };

        self.save()?;
        Ok(outcome)
    }

    /// Clears any pending 403 strikes against `key` — a successful request
    /// means whatever caused the prior 403s no longer applies. No-op (and no
    /// write) if the key has no pending strikes. Does not touch `banned`:
    /// a key that already crossed the threshold stays permanently banned.
    pub fn clear_strike(&mut self, key: &ApiKey) -> Result<(), KeytideError> {
        if self.potential.remove(key).is_none() {
            return Ok(());
        }
        self.save()
    }

    fn save(&self) -> Result<(), KeytideError> {
        let doc = BanDocument {
            potential_unavailable: self
                .potential
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), *v))
                .collect(),
            unavailable: self.banned.iter().map(|k| k.as_str().to_string()).collect(),
        };
        let json = serde_json::to_string_pretty(&doc).expect("ban document always serializes");
        atomic_write(&self.path, &json)
    }
}

/// Rewrites `config.json`'s `priority_keys`/`secondary_keys` arrays to drop
/// a permanently banned key, preserving every other field untouched.
/// Grounded directly on `_remove_key_from_config` in the original service:
/// a read-modify-write of the whole document rather than a targeted patch,
/// since the config file is small and rewritten rarely.
pub fn remove_key_from_config_file(path: &std::path::Path, key: &ApiKey) -> Result<(), KeytideError> {
    let raw = std::fs::read_to_string(path).map_err(|source| KeytideError::ConfigRead {
        path: path.display().to_string(),
        source,
    })?;
    let mut value: serde_json::Value =
        serde_json::from_str(&raw).map_err(|source| KeytideError::ConfigParse {
            path: path.display().to_string(),
            source,
        })?;

    for field in ["priority_keys", "secondary_keys"] {
        if let Some(arr) = value.get_mut(field).and_then(|v| v.as_array_mut()) {
            arr.retain(|v| v.as_str() != Some(key.as_str()));
        }
    }

    let json = serde_json::to_string_pretty(&value).expect("config value always serializes");
    atomic_write(path, &json)
}
