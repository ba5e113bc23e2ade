//! Store configuration (spec.md §4.7.1, expanded per `SPEC_FULL.md` §10.3).
//!
//! Built the way the teacher builds `DiskBufferConfig`/`DiskBufferConfigBuilder`:
//! a builder with chainable setters, `Default`-backed fallbacks for unset
//! fields, and a fallible [`StoreConfigBuilder::build`] that validates
//! cross-field invariants.

use snafu::Snafu;

use crate::ledger::lock::LockConfig;

/// Watchdog cadence default (spec.md §4.7.1).
pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 2_500;
/// `EntryCache` byte budget default, in MiB.
pub const DEFAULT_LEDGER_CACHE_MB: u64 = 100;
/// Read-ahead chunk size default (spec.md §11).
pub const DEFAULT_PREFETCH_BYTES: usize = crate::prefetch::PREFETCH_BYTES;
/// Stale-lock reclamation timeout default (spec.md §11).
pub const DEFAULT_LOCK_STALE_TIMEOUT_MS: u64 = 10_000;
/// Lock-acquire retry budget default (spec.md §11).
pub const DEFAULT_LOCK_MAX_RETRIES: u32 = 10;
/// Lock-acquire linear backoff base default (spec.md §11).
pub const DEFAULT_LOCK_RETRY_INITIAL_MS: u64 = 50;

/// Error returned by [`StoreConfigBuilder::build`] when a cross-field
/// invariant is violated.
#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(display("parameter '{}' was invalid: {}", param_name, reason))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Validated store configuration, produced by [`StoreConfigBuilder::build`].
#[derive(Clone, Copy, Debug)]
pub struct StoreConfig {
    /// Enables the background watchdog (spec.md §4.7.3).
    pub(crate) auto_sync: bool,
    /// Watchdog cadence, in milliseconds.
    pub(crate) sync_interval_ms: u64,
    /// `EntryCache` byte budget, in bytes (`ledger_cache_mb * 1MiB`).
    pub(crate) ledger_cache_bytes: usize,
    /// Skips index build; only append and linear `scan` remain available.
    pub(crate) disable_index: bool,
    /// `Prefetcher` read-ahead chunk size, in bytes.
    pub(crate) prefetch_bytes: usize,
    /// Cross-process lock protocol tunables (spec.md §4.5.4).
    pub(crate) lock: LockConfig,
}

impl StoreConfig {
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    pub fn auto_sync(&self) -> bool {
        self.auto_sync
    }

    pub fn sync_interval_ms(&self) -> u64 {
        self.sync_interval_ms
    }

    pub fn disable_index(&self) -> bool {
        self.disable_index
    }

    pub(crate) fn lock_config(&self) -> LockConfig {
        self.lock
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfigBuilder::default()
            .build()
            .expect("default configuration always validates")
    }
}

/// Builder for [`StoreConfig`]. Unset fields fall back to the defaults named
/// in spec.md §4.7.1 and `SPEC_FULL.md` §10.3/§11.
#[derive(Clone, Copy, Debug, Default)]
pub struct StoreConfigBuilder {
    auto_sync: Option<bool>,
    sync_interval_ms: Option<u64>,
    ledger_cache_mb: Option<u64>,
    disable_index: Option<bool>,
    prefetch_bytes: Option<usize>,
    lock_stale_timeout_ms: Option<u64>,
    lock_max_retries: Option<u32>,
    lock_retry_initial_ms: Option<u64>,
}

impl StoreConfigBuilder {
    /// Enables or disables the background watchdog. Defaults to `true`.
    pub fn auto_sync(mut self, enabled: bool) -> Self {
        self.auto_sync = Some(enabled);
        self
    }

    /// Sets the watchdog cadence, in milliseconds. Must be positive. Defaults
    /// to 2500ms.
    pub fn sync_interval_ms(mut self, interval: u64) -> Self {
        self.sync_interval_ms = Some(interval);
        self
    }

    /// Sets the `EntryCache` byte budget, in MiB. Must be positive. Defaults
    /// to 100MiB.
    pub fn ledger_cache_mb(mut self, mb: u64) -> Self {
        self.ledger_cache_mb = Some(mb);
        self
    }

    /// Skips index construction, leaving only `append` and linear `scan`
    /// available. Defaults to `false`.
    pub fn disable_index(mut self, disabled: bool) -> Self {
        self.disable_index = Some(disabled);
        self
    }

    /// Sets the `Prefetcher` read-ahead chunk size, in bytes. Defaults to
    /// 64KiB.
    pub fn prefetch_bytes(mut self, bytes: usize) -> Self {
        self.prefetch_bytes = Some(bytes);
        self
    }

    /// Sets how long a held lock word may go unrefreshed before a peer
    /// reclaims it as abandoned. Defaults to 10s.
    pub fn lock_stale_timeout_ms(mut self, ms: u64) -> Self {
        self.lock_stale_timeout_ms = Some(ms);
        self
    }

    /// Sets the lock-acquire retry budget. Defaults to 10.
    pub fn lock_max_retries(mut self, retries: u32) -> Self {
        self.lock_max_retries = Some(retries);
        self
    }

    /// Sets the linear backoff base for lock-acquire retries, in
    /// milliseconds. Defaults to 50ms.
    pub fn lock_retry_initial_ms(mut self, ms: u64) -> Self {
        self.lock_retry_initial_ms = Some(ms);
        self
    }

    /// Consumes this builder and constructs a [`StoreConfig`], validating
    /// cross-field invariants.
    pub fn build(self) -> Result<StoreConfig, BuildError> {
        let auto_sync = self.auto_sync.unwrap_or(true);
        let sync_interval_ms = self.sync_interval_ms.unwrap_or(DEFAULT_SYNC_INTERVAL_MS);
        let ledger_cache_mb = self.ledger_cache_mb.unwrap_or(DEFAULT_LEDGER_CACHE_MB);
        let disable_index = self.disable_index.unwrap_or(false);
        let prefetch_bytes = self.prefetch_bytes.unwrap_or(DEFAULT_PREFETCH_BYTES);
        let lock_stale_timeout_ms = self
            .lock_stale_timeout_ms
            .unwrap_or(DEFAULT_LOCK_STALE_TIMEOUT_MS);
        let lock_max_retries = self.lock_max_retries.unwrap_or(DEFAULT_LOCK_MAX_RETRIES);
        let lock_retry_initial_ms = self
            .lock_retry_initial_ms
            .unwrap_or(DEFAULT_LOCK_RETRY_INITIAL_MS);

        if sync_interval_ms == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "sync_interval_ms",
                reason: "must be positive".to_string(),
            });
        }
        if ledger_cache_mb == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "ledger_cache_mb",
                reason: "must be positive".to_string(),
            });
        }
        if prefetch_bytes == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "prefetch_bytes",
                reason: "must be positive".to_string(),
            });
        }
        if lock_max_retries == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "lock_max_retries",
                reason: "must be positive".to_string(),
            });
        }
        if lock_retry_initial_ms == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "lock_retry_initial_ms",
                reason: "must be positive".to_string(),
            });
        }

        Ok(StoreConfig {
            auto_sync,
            sync_interval_ms,
            ledger_cache_bytes: (ledger_cache_mb as usize) * 1024 * 1024,
            disable_index,
            prefetch_bytes,
            lock: LockConfig {
                stale_timeout_ms: lock_stale_timeout_ms,
                max_retries: lock_max_retries,
                retry_initial_ms: lock_retry_initial_ms,
            },
        })
    }
}
