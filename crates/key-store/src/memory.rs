//! In-process key store
//!
//! Mirrors the SQLite store's semantics (insertion order, duplicate and
//! not-found errors) without touching disk. `set_unavailable` makes every
//! operation fail with `Unavailable`, which is how pool tests simulate a
//! database outage.

use common::fingerprint;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::{KeyRecord, KeyStore, StoreFuture};

#[derive(Default)]
struct State {
    records: Vec<KeyRecord>,
    unavailable: bool,
}

/// Key store held entirely in memory.
#[derive(Default)]
pub struct MemoryKeyStore {
    state: Mutex<State>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with the given values (empty memos).
    pub fn with_values<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let records = values
            .into_iter()
            .map(|v| KeyRecord {
                value: v.into(),
                memo: String::new(),
                usage: 0,
            })
            .collect();
        Self {
            state: Mutex::new(State {
                records,
                unavailable: false,
            }),
        }
    }

    /// Toggle simulated outage.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Current usage for a value, if present.
    pub async fn usage_of(&self, value: &str) -> Option<u64> {
        let state = self.state.lock().await;
        state
            .records
            .iter()
            .find(|r| r.value == value)
            .map(|r| r.usage)
    }
}

fn check_available(state: &State) -> Result<()> {
    if state.unavailable {
        return Err(Error::Unavailable("simulated outage".into()));
    }
    Ok(())
}

impl KeyStore for MemoryKeyStore {
    fn scan_all(&self) -> StoreFuture<'_, Vec<KeyRecord>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            check_available(&state)?;
            Ok(state.records.clone())
        })
    }

    fn insert<'a>(&'a self, value: &'a str, memo: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            check_available(&state)?;
            if state.records.iter().any(|r| r.value == value) {
                return Err(Error::Duplicate(fingerprint(value)));
            }
            state.records.push(KeyRecord {
                value: value.to_owned(),
                memo: memo.to_owned(),
                usage: 0,
            });
            Ok(())
        })
    }

    fn delete<'a>(&'a self, value: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            check_available(&state)?;
            let before = state.records.len();
            state.records.retain(|r| r.value != value);
            Ok(state.records.len() != before)
        })
    }

    fn increment_usage<'a>(&'a self, value: &'a str, weight: u64) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            check_available(&state)?;
            let record = state
                .records
                .iter_mut()
                .find(|r| r.value == value)
                .ok_or_else(|| Error::NotFound(fingerprint(value)))?;
            record.usage = record.usage.saturating_add(weight);
            Ok(())
        })
    }
}
