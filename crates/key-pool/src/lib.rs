//! Rotating pool of upstream API keys
//!
//! Caches the key store's current contents in memory and hands keys out
//! round-robin. The store stays the source of truth: every add/remove goes
//! through the store and is followed by a full refresh of the cache.
//!
//! Key lifecycle:
//! 1. Admin adds a key → row inserted, pool refreshed, key joins the rotation
//! 2. Request path allocates → next key in cyclic order
//! 3. Upstream accepts the call → usage weight added to the key's record
//! 4. Admin removes a key → row deleted, pool refreshed, key leaves the rotation
//! 5. Background task refreshes periodically to pick up out-of-band edits

pub mod error;
pub mod pool;
pub mod refresh;

pub use error::{Error, Result};
pub use pool::Pool;
pub use refresh::spawn_refresh_task;
