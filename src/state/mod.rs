pub mod ban_store;
pub mod cooldown;
pub mod key_model_state;
pub mod sliding_window;
pub mod usage_store;

pub use ban_store::{PermanentBanList, StrikeOutcome};
pub use cooldown::RateLimitedSet;
pub use key_model_state::{KeyModelState, UsageRecord};
pub use usage_store::UsageStore;
