//! Provider key pools with health tracking.
//!
//! Each LLM provider may own several API keys. The pool selects the key
//! with the lowest load score (`current_qps / qps_limit +
//! recent_error_score`), records successes and errors to move keys
//! through the `active → degraded → exhausted` lifecycle, and decays
//! error scores in a background loop so keys recover over time.

mod events;
mod key;
mod pool;

pub use events::KeyPoolEvent;
pub use key::{KeyErrorKind, KeyStatus, ProviderKey};
pub use pool::{KeyPoolManager, PoolHealth};

/// Upper bound on key switches a single request may perform.
pub const MAX_KEY_SWITCHES: u32 = 3;
