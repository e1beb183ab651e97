//! Round-robin key selection over a store-backed cache
//!
//! Two locks, with different jobs:
//! - `rotation` (`std::sync::Mutex`) guards the cached key list and cursor.
//!   It is held only for index arithmetic and a clone of one key, so
//!   `allocate` never waits on I/O.
//! - `mutations` (`tokio::sync::Mutex`) serializes store writes and
//!   refreshes, so a slow scan can never overwrite the result of a newer one.
//!
//! The cursor is the index of the last key handed out. The next index is
//! `(cursor + 1) % len` using the length *at call time*. When a refresh
//! changes the length, rotation continues from the old cursor modulo the new
//! length, so a key may be skipped or revisited once around a refresh. That
//! is accepted: allocation promises fairness, not a strict permutation across
//! refreshes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use common::{Secret, fingerprint};
use key_store::{KeyRecord, KeyStore};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

#[derive(Default)]
struct Rotation {
    keys: Vec<Secret<String>>,
    cursor: Option<usize>,
}

/// Rotating key pool.
///
/// Constructed once at startup and shared as `Arc<Pool>` between the request
/// path, the admin API and the background refresh task.
pub struct Pool {
    store: Arc<dyn KeyStore>,
    rotation: Mutex<Rotation>,
    mutations: tokio::sync::Mutex<()>,
    allocations: AtomicU64,
}

impl Pool {
    /// Create an empty pool over `store`. Call `refresh` before serving.
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self {
            store,
            rotation: Mutex::new(Rotation::default()),
            mutations: tokio::sync::Mutex::new(()),
            allocations: AtomicU64::new(0),
        }
    }

    /// Create a pool and load the store's current keys.
    pub async fn load(store: Arc<dyn KeyStore>) -> Result<Self> {
        let pool = Self::new(store);
        let keys = pool.refresh().await?;
        info!(keys, "key pool initialized");
        Ok(pool)
    }

    /// Hand out the next key in round-robin order.
    ///
    /// Fails with `PoolExhausted` when the pool is empty. Never blocks on I/O.
    pub fn allocate(&self) -> Result<Secret<String>> {
        let key = {
            let mut rotation = self.lock_rotation();
            let n = rotation.keys.len();
            if n == 0 {
                return Err(Error::PoolExhausted);
            }
            let next = rotation.cursor.map_or(0, |c| (c + 1) % n);
            rotation.cursor = Some(next);
            rotation.keys[next].clone()
        };
        self.allocations.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("key_pool_allocations_total").increment(1);
        Ok(key)
    }

    /// Reload the key list from the store.
    ///
    /// All-or-nothing: if the scan fails the cached list is left untouched
    /// and `StoreUnavailable` is returned. The cursor is not reset.
    pub async fn refresh(&self) -> Result<usize> {
        let _guard = self.mutations.lock().await;
        self.refresh_locked().await
    }

    /// Add `weight` to the usage counter of `value`.
    ///
    /// Returns `RecordNotFound` if the key was deleted in the meantime.
    /// Request handlers treat any error here as advisory.
    pub async fn record_usage(&self, value: &str, weight: u64) -> Result<()> {
        self.store.increment_usage(value, weight).await?;
        debug!(key = %fingerprint(value), weight, "recorded key usage");
        Ok(())
    }

    /// Insert a new key and refresh the pool.
    ///
    /// Fails with `DuplicateValue` if the key is already stored and with
    /// `InvalidValue` if it is empty or not usable as a header value.
    pub async fn add(&self, value: &str, memo: &str) -> Result<()> {
        let value = value.trim();
        validate_value(value)?;

        let _guard = self.mutations.lock().await;
        self.store.insert(value, memo).await?;
        info!(key = %fingerprint(value), "key added");
        self.refresh_locked().await?;
        Ok(())
    }

    /// Delete a key and refresh the pool.
    ///
    /// Removing a key that does not exist is not an error; the return value
    /// reports whether a record was actually deleted. The value is trimmed
    /// the same way [`Pool::add`] trims it.
    pub async fn remove(&self, value: &str) -> Result<bool> {
        let value = value.trim();
        let _guard = self.mutations.lock().await;
        let removed = self.store.delete(value).await?;
        if removed {
            info!(key = %fingerprint(value), "key removed");
        } else {
            debug!(key = %fingerprint(value), "remove requested for unknown key");
        }
        self.refresh_locked().await?;
        Ok(removed)
    }

    /// Full record listing straight from the store (includes usage).
    pub async fn list(&self) -> Result<Vec<KeyRecord>> {
        Ok(self.store.scan_all().await?)
    }

    /// Number of keys currently in rotation.
    pub fn len(&self) -> usize {
        self.lock_rotation().keys.len()
    }

    /// Whether the rotation is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total successful allocations since startup.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Pool summary for the health and admin endpoints. Never exposes keys.
    pub fn health(&self) -> serde_json::Value {
        let keys = self.len();
        let status = if keys > 0 { "healthy" } else { "unhealthy" };
        serde_json::json!({
            "status": status,
            "keys_total": keys,
            "allocations_total": self.allocations(),
        })
    }

    async fn refresh_locked(&self) -> Result<usize> {
        let records = self.store.scan_all().await.map_err(|e| {
            warn!(error = %e, "key store scan failed, keeping previous pool");
            Error::StoreUnavailable(e.to_string())
        })?;

        let keys: Vec<Secret<String>> = records
            .into_iter()
            .map(|r| Secret::new(r.value))
            .collect();
        let n = keys.len();
        self.lock_rotation().keys = keys;

        metrics::gauge!("key_pool_size").set(n as f64);
        debug!(keys = n, "key pool refreshed");
        Ok(n)
    }

    fn lock_rotation(&self) -> MutexGuard<'_, Rotation> {
        // Poisoning is ignored: every write replaces the list or index whole.
        self.rotation.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn validate_value(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidValue("key must not be empty".into()));
    }
    if !value.bytes().all(|b| (0x20..0x7f).contains(&b)) {
        return Err(Error::InvalidValue(
            "key must be printable ASCII so it can be sent as a header".into(),
        ));
    }
    Ok(())
}
