use thiserror::Error;

/// Errors surfaced by the key/model selection engine and its collaborators.
///
/// A 429 or an expired cooldown is not an error — it's handled inline by the
/// engine and never reaches a caller as a `Result::Err`. These variants cover
/// the failure modes that do: missing/corrupt config, exhausted capacity, a
/// 403 from upstream, and I/O failures while persisting state.
#[derive(Debug, Error)]
pub enum KeytideError {
    #[error("failed to read config at {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no capacity: every key/model combination is unavailable")]
    NoCapacity,

    #[error("upstream rejected key as invalid or disabled")]
    InvalidKey,

    #[error("persisting state to {path} failed: {source}")]
    Persist {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("request to upstream failed: {0}")]
    Network(#[from] reqwest::Error),
}

impl KeytideError {
    /// Sanitized message safe to return to a client — never leaks key
    /// material, file paths, or upstream response bodies.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::ConfigRead { .. } | Self::ConfigParse { .. } => "service misconfigured",
            Self::NoCapacity => {
                "all API keys and models are currently rate-limited or unavailable"
            }
            Self::InvalidKey => "forbidden - API key may be invalid or disabled",
            Self::Persist { .. } => "failed to persist state",
            Self::Network(_) => "request to upstream failed",
        }
    }
}
