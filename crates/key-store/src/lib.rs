//! Durable storage for upstream API keys
//!
//! The store is the single source of truth for which keys exist, their memo
//! labels and their accumulated usage. The key pool scans it wholesale on
//! every refresh; it never patches its in-memory copy incrementally.
//!
//! Two implementations ship with the crate:
//! - `SqliteKeyStore`: the production table, compatible with the `keys`
//!   schema (`key`, `memo`, `usage`)
//! - `MemoryKeyStore`: in-process store with fault injection for tests

pub mod error;
pub mod memory;
pub mod sqlite;

pub use error::{Error, Result};
pub use memory::MemoryKeyStore;
pub use sqlite::SqliteKeyStore;

use serde::Serialize;
use std::future::Future;
use std::pin::Pin;

/// A stored API key with its label and usage counter.
///
/// `value` is the identity of the record and unique across the store.
/// `usage` only ever grows; allocation logic never reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyRecord {
    pub value: String,
    pub memo: String,
    pub usage: u64,
}

/// Boxed future returned by `KeyStore` methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Persistence contract for key records.
///
/// Uses `Pin<Box<dyn Future>>` return types so the pool can hold an
/// `Arc<dyn KeyStore>`.
pub trait KeyStore: Send + Sync {
    /// All records in store order.
    fn scan_all(&self) -> StoreFuture<'_, Vec<KeyRecord>>;

    /// Insert a new record with zero usage. Fails with `Duplicate` if the
    /// value already exists.
    fn insert<'a>(&'a self, value: &'a str, memo: &'a str) -> StoreFuture<'a, ()>;

    /// Delete a record. Returns whether a record was removed; deleting an
    /// absent value is not an error.
    fn delete<'a>(&'a self, value: &'a str) -> StoreFuture<'a, bool>;

    /// Add `weight` to a record's usage. Fails with `NotFound` if absent.
    fn increment_usage<'a>(&'a self, value: &'a str, weight: u64) -> StoreFuture<'a, ()>;
}
