use std::fmt;

/// Which config pool a key came from. Only affects initial ordering of
/// `all_keys`; stable index order is the tiebreak at selection time, not
/// tier membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Priority,
    Secondary,
}

/// An opaque API credential. `Display`/`Debug` never print the full value —
/// only a masked preview (`abcd****`), matching the masking used by the
/// Python service this was ported from.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn preview(&self) -> String {
        let end = self.0.char_indices().nth(4).map(|(i, _)| i).unwrap_or(self.0.len());
        format!("{}****", &self.0[..end])
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.preview())
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey({})", self.preview())
    }
}

/// The ordered key pools: `priority ++ secondary`, with a stable index used
/// for sticky rotation (`SelectionCursor` in the design).
#[derive(Debug, Clone, Default)]
pub struct KeyPool {
    priority: Vec<ApiKey>,
    secondary: Vec<ApiKey>,
}

impl KeyPool {
    pub fn new(priority: Vec<ApiKey>, secondary: Vec<ApiKey>) -> Self {
        Self { priority, secondary }
    }

    pub fn priority(&self) -> &[ApiKey] {
        &self.priority
    }

    pub fn secondary(&self) -> &[ApiKey] {
        &self.secondary
    }

    /// `all_keys = priority ++ secondary`, the stable index space the
    /// selection cursor walks.
    pub fn all_keys(&self) -> Vec<ApiKey> {
        self.priority.iter().chain(self.secondary.iter()).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.priority.len() + self.secondary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes a key from both tiers. Returns true if it was present.
    pub fn remove(&mut self, key: &ApiKey) -> bool {
        let before = self.len();
        self.priority.retain(|k| k != key);
        self.secondary.retain(|k| k != key);
        self.len() != before
    }
}
