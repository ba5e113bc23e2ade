//! ckvd — an embedded, file-backed, hierarchical key-value store.
//!
//! A single append-only ledger file, safe for concurrent opens from multiple
//! processes over a shared filesystem, paired with an in-memory trie index
//! supporting exact, prefix, and inclusive-range lookups over composite
//! keys. See [`Store`] for the public entry point.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::type_complexity)]

#[macro_use]
extern crate tracing;

pub mod cache;
pub mod config;
pub mod error;
pub mod hash;
pub mod index;
pub mod key;
pub mod ledger;
pub mod prefetch;
pub mod store;
pub mod transaction;
pub mod value;

pub use config::{StoreConfig, StoreConfigBuilder};
pub use error::{KeyError, LedgerError, Result, StoreError, TransactionError};
pub use key::{Fragment, Key, Query, QueryFragment};
pub use store::{GetResult, IteratedEntry, Store, StoreEvent, SyncOutcome, WatchId};
pub use transaction::Op;
pub use value::Value;
