//! The `Store` façade: orchestrates a [`Ledger`] and an [`Index`] behind a
//! single async mutex, runs the optional watchdog, and dispatches watch
//! notifications (spec.md §4.7).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::cache::DecodedEntry;
use crate::config::StoreConfig;
use crate::error::{LedgerError, StoreError};
use crate::index::Index;
use crate::key::{Key, Query};
use crate::ledger::fs::{Filesystem, ProductionFilesystem};
use crate::ledger::{now_ms_f64, Ledger};
use crate::transaction::{Op, Transaction};
use crate::value::Value;

/// A callback invoked synchronously, under the façade's lock, for every
/// applied entry a watch matches (spec.md §4.7.4). Receives the matched
/// entry only — not a handle back into the store — since a callback this
/// crate runs cannot itself be `async`; see `DESIGN.md` for why this departs
/// from a literal identity-based `unwatch`.
pub type WatchCallback = Arc<dyn Fn(&DecodedEntry) + Send + Sync>;

/// Opaque handle returned by [`Store::watch`], passed back to [`Store::unwatch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

struct Watcher {
    id: WatchId,
    query: Query,
    recursive: bool,
    callback: WatchCallback,
}

/// The outcome of a [`Store::sync`] call (spec.md §4.7.2).
#[derive(Debug)]
pub enum SyncOutcome {
    /// Nothing new; the ledger was already caught up.
    Ready,
    /// New entries were read and applied.
    NewData,
    /// Skipped: a vacuum is in progress and `force` wasn't set.
    Blocked,
    /// The ledger was replaced (vacuumed) beneath this handle and has been
    /// transparently reopened.
    Invalidated,
    Error(StoreError),
}

/// A cloneable summary of a [`SyncOutcome`], broadcast via [`Store::subscribe_events`].
#[derive(Clone, Debug)]
pub enum SyncEventOutcome {
    Ready,
    NewData,
    Blocked,
    Invalidated,
    Error(String),
}

impl From<&SyncOutcome> for SyncEventOutcome {
    fn from(outcome: &SyncOutcome) -> Self {
        match outcome {
            SyncOutcome::Ready => SyncEventOutcome::Ready,
            SyncOutcome::NewData => SyncEventOutcome::NewData,
            SyncOutcome::Blocked => SyncEventOutcome::Blocked,
            SyncOutcome::Invalidated => SyncEventOutcome::Invalidated,
            SyncOutcome::Error(err) => SyncEventOutcome::Error(err.to_string()),
        }
    }
}

/// Broadcast over [`Store::subscribe_events`] (spec.md §9's "typed
/// multi-subscriber channel" design note, grounded on the teacher's
/// `tokio::sync::broadcast` usage in `vector-api-client`'s GraphQL
/// subscription client).
#[derive(Clone, Debug)]
pub enum StoreEvent {
    Sync(SyncEventOutcome),
    Closing,
}

/// A decoded value read back by [`Store::get`].
#[derive(Clone, Debug, PartialEq)]
pub struct GetResult {
    pub ts: f64,
    pub value: Value,
}

/// A decoded value read back by [`Store::iterate`]/[`Store::list_all`].
#[derive(Clone, Debug, PartialEq)]
pub struct IteratedEntry {
    pub key: Key,
    pub ts: f64,
    pub value: Value,
    pub offset: u64,
}

struct Inner<FS: Filesystem> {
    fs: FS,
    path: Option<PathBuf>,
    ledger: Option<Ledger<FS>>,
    index: Index,
    pending: Vec<Transaction>,
    in_tx: bool,
    block_sync: bool,
    closed: bool,
    watchers: Vec<Watcher>,
}

fn ensure_open<FS: Filesystem>(inner: &Inner<FS>) -> Result<(), StoreError> {
    if inner.closed {
        return Err(StoreError::Closed);
    }
    if inner.ledger.is_none() {
        return Err(StoreError::NotOpen);
    }
    Ok(())
}

struct WatchdogHandle {
    cancel: Arc<Notify>,
    task: JoinHandle<()>,
}

/// Orchestrates a [`Ledger`] and an [`Index`] behind a single async mutex
/// (spec.md §9: "a threaded or otherwise concurrent host environment needs
/// exactly one mutex guarding all façade state"). Cheaply `Clone`: every
/// clone shares the same underlying store.
pub struct Store<FS: Filesystem = ProductionFilesystem> {
    inner: Arc<Mutex<Inner<FS>>>,
    config: StoreConfig,
    events: broadcast::Sender<StoreEvent>,
    /// Set for the duration of watch-handler dispatch; mutating methods
    /// check it before attempting to lock `inner` at all, so a callback
    /// (or anything it spawns) that tries to mutate the store synchronously
    /// fails cleanly with [`StoreError::ReentrantMutation`] instead of
    /// deadlocking against the lock the dispatch loop is holding.
    reentrant: Arc<AtomicBool>,
    open_flag: Arc<AtomicBool>,
    next_watch_id: Arc<AtomicU64>,
    watchdog: Arc<StdMutex<Option<WatchdogHandle>>>,
}

impl<FS: Filesystem> Clone for Store<FS> {
    fn clone(&self) -> Self {
        Store {
            inner: self.inner.clone(),
            config: self.config,
            events: self.events.clone(),
            reentrant: self.reentrant.clone(),
            open_flag: self.open_flag.clone(),
            next_watch_id: self.next_watch_id.clone(),
            watchdog: self.watchdog.clone(),
        }
    }
}

impl Store<ProductionFilesystem> {
    /// Opens a store at `path` on the real filesystem.
    pub async fn open(
        path: impl Into<PathBuf>,
        create_if_missing: bool,
        config: StoreConfig,
    ) -> Result<Self, StoreError> {
        Store::open_with_fs(ProductionFilesystem, path, create_if_missing, config).await
    }
}

impl<FS: Filesystem> Store<FS> {
    /// Opens a store at `path` using a caller-supplied [`Filesystem`], for
    /// tests that want an in-memory double instead of real disk.
    #[tracing::instrument(skip(fs, config), level = "debug")]
    pub async fn open_with_fs(
        fs: FS,
        path: impl Into<PathBuf>,
        create_if_missing: bool,
        config: StoreConfig,
    ) -> Result<Self, StoreError> {
        let (events, _) = broadcast::channel(64);
        let inner = Inner {
            fs,
            path: None,
            ledger: None,
            index: Index::new(),
            pending: Vec::new(),
            in_tx: false,
            block_sync: false,
            closed: false,
            watchers: Vec::new(),
        };
        let store = Store {
            inner: Arc::new(Mutex::new(inner)),
            config,
            events,
            reentrant: Arc::new(AtomicBool::new(false)),
            open_flag: Arc::new(AtomicBool::new(false)),
            next_watch_id: Arc::new(AtomicU64::new(0)),
            watchdog: Arc::new(StdMutex::new(None)),
        };
        store.open_internal(path.into(), create_if_missing).await?;
        if config.auto_sync() {
            store.spawn_watchdog();
        }
        Ok(store)
    }

    /// Disallowed once this handle has been [`Store::close`]d. If a ledger
    /// is already open on this handle, its index is cleared before the
    /// replacement ledger is synced in (spec.md §4.7.1).
    async fn open_internal(&self, path: PathBuf, create_if_missing: bool) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(StoreError::Closed);
            }
            if inner.ledger.is_some() {
                inner.index.clear();
            }
            let ledger = Ledger::open(
                inner.fs.clone(),
                path.clone(),
                create_if_missing,
                self.config.lock_config(),
                self.config.ledger_cache_bytes,
                self.config.prefetch_bytes,
            )
            .await
            .map_err(StoreError::from)?;
            inner.ledger = Some(ledger);
            inner.path = Some(path);
        }

        match self.sync_inner(true, true).await {
            SyncOutcome::Error(err) => Err(err),
            _ => {
                self.open_flag.store(true, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    /// Cancels the watchdog (awaiting its current run), drops the ledger
    /// handle, and permanently disallows reopening this instance.
    pub async fn close(&self) -> Result<(), StoreError> {
        self.reject_if_reentrant()?;
        if let Some(handle) = self.watchdog.lock().unwrap().take() {
            handle.cancel.notify_one();
            let _ = handle.task.await;
        }
        let mut inner = self.inner.lock().await;
        inner.ledger = None;
        inner.closed = true;
        self.open_flag.store(false, Ordering::SeqCst);
        let _ = self.events.send(StoreEvent::Closing);
        Ok(())
    }

    /// Cheap, lock-free check of whether a ledger is currently open on this
    /// handle.
    pub fn is_open(&self) -> bool {
        self.open_flag.load(Ordering::SeqCst)
    }

    pub async fn ledger_path(&self) -> Option<PathBuf> {
        self.inner.lock().await.path.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn reject_if_reentrant(&self) -> Result<(), StoreError> {
        if self.reentrant.load(Ordering::SeqCst) {
            return Err(StoreError::ReentrantMutation);
        }
        Ok(())
    }

    // -- sync -------------------------------------------------------------

    /// Resyncs the ledger and applies any new entries (spec.md §4.7.2).
    /// `force` bypasses a `block_sync` guard set by an in-progress vacuum.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn sync(&self, force: bool) -> SyncOutcome {
        self.sync_inner(force, true).await
    }

    async fn sync_inner(&self, force: bool, do_lock: bool) -> SyncOutcome {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return SyncOutcome::Error(StoreError::Closed);
        }
        if inner.ledger.is_none() {
            return SyncOutcome::Error(StoreError::NotOpen);
        }
        if inner.block_sync && !force {
            let outcome = SyncOutcome::Blocked;
            self.emit_sync_event(&outcome);
            return outcome;
        }

        let mut lock_id = None;
        if do_lock {
            match inner.ledger.as_mut().unwrap().lock().await {
                Ok(id) => lock_id = Some(id),
                Err(err) => {
                    let outcome = SyncOutcome::Error(err.into());
                    self.emit_sync_event(&outcome);
                    return outcome;
                }
            }
        }

        let want_entries = !self.config.disable_index();
        let sync_result = inner.ledger.as_mut().unwrap().sync(want_entries).await;

        if let Some(id) = lock_id {
            let _ = inner.ledger.as_mut().unwrap().unlock(id).await;
        }

        let outcome = match sync_result {
            Ok(entries) => {
                let had_entries = !entries.is_empty();
                self.apply_entries(&mut inner, entries);
                if had_entries {
                    SyncOutcome::NewData
                } else {
                    SyncOutcome::Ready
                }
            }
            Err(LedgerError::Invalidated) => {
                let path = inner
                    .path
                    .clone()
                    .expect("path is always set while a ledger is open");
                drop(inner);
                match self.open_internal(path, false).await {
                    Ok(()) => SyncOutcome::Invalidated,
                    Err(err) => SyncOutcome::Error(err),
                }
            }
            Err(err) => SyncOutcome::Error(err.into()),
        };

        self.emit_sync_event(&outcome);
        outcome
    }

    fn emit_sync_event(&self, outcome: &SyncOutcome) {
        let _ = self.events.send(StoreEvent::Sync(outcome.into()));
    }

    /// Dispatches matching watchers, then applies the entry to the index
    /// (spec.md §4.7.4). Per-entry, in ledger order. Skips the index update
    /// when `disable_index` is set — only `scan` remains meaningful then.
    fn apply_entries(&self, inner: &mut Inner<FS>, entries: Vec<DecodedEntry>) {
        let disable_index = self.config.disable_index();
        for entry in entries {
            if !inner.watchers.is_empty() {
                self.reentrant.store(true, Ordering::SeqCst);
                for watcher in &inner.watchers {
                    if entry.transaction.key.matches(&watcher.query, watcher.recursive) {
                        (watcher.callback)(&entry);
                    }
                }
                self.reentrant.store(false, Ordering::SeqCst);
            }
            if disable_index {
                continue;
            }
            match entry.transaction.op {
                Op::Set => inner.index.add(&entry.transaction.key, entry.offset),
                Op::Delete => {
                    inner.index.delete(&entry.transaction.key);
                }
            }
        }
    }

    fn spawn_watchdog(&self) {
        let store = self.clone();
        let cancel = Arc::new(Notify::new());
        let cancel_for_task = cancel.clone();
        let period = Duration::from_millis(self.config.sync_interval_ms());

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // the constructor already ran an initial sync.
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let SyncOutcome::Error(err) = store.sync(false).await {
                            warn!(error = %err, "watchdog sync failed");
                        }
                    }
                    _ = cancel_for_task.notified() => break,
                }
            }
        });

        *self.watchdog.lock().unwrap() = Some(WatchdogHandle { cancel, task });
    }

    // -- mutation -----------------------------------------------------------

    pub async fn set(&self, key: Key, value: Value) -> Result<(), StoreError> {
        let tx = Transaction::create(key, Op::Set, now_ms_f64(), Some(&value))?;
        self.enqueue(tx).await
    }

    pub async fn delete(&self, key: Key) -> Result<(), StoreError> {
        let tx = Transaction::create(key, Op::Delete, now_ms_f64(), None)?;
        self.enqueue(tx).await
    }

    async fn enqueue(&self, tx: Transaction) -> Result<(), StoreError> {
        self.reject_if_reentrant()?;
        let should_commit = {
            let mut inner = self.inner.lock().await;
            ensure_open(&inner)?;
            inner.pending.push(tx);
            !inner.in_tx
        };
        if should_commit {
            self.end_transaction().await?;
        }
        Ok(())
    }

    /// Starts batching subsequent `set`/`delete` calls instead of committing
    /// each immediately (spec.md §4.7.5).
    pub async fn begin_transaction(&self) -> Result<(), StoreError> {
        self.reject_if_reentrant()?;
        let mut inner = self.inner.lock().await;
        ensure_open(&inner)?;
        inner.in_tx = true;
        Ok(())
    }

    /// Discards any pending, uncommitted writes.
    pub async fn abort_transaction(&self) -> Result<(), StoreError> {
        self.reject_if_reentrant()?;
        let mut inner = self.inner.lock().await;
        ensure_open(&inner)?;
        inner.pending.clear();
        inner.in_tx = false;
        Ok(())
    }

    /// Commits whatever is pending as a single locked batch (spec.md
    /// §4.7.5). A no-op, clearing `in_tx`, if nothing is pending.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn end_transaction(&self) -> Result<(), StoreError> {
        self.reject_if_reentrant()?;
        let mut inner = self.inner.lock().await;
        ensure_open(&inner)?;

        inner.in_tx = false;
        if inner.pending.is_empty() {
            return Ok(());
        }

        let txs = std::mem::take(&mut inner.pending);
        let batch: Vec<Vec<u8>> = txs.iter().map(Transaction::encode).collect();

        let lock_id = inner
            .ledger
            .as_mut()
            .unwrap()
            .lock()
            .await
            .map_err(StoreError::from)?;

        let result = self.commit_locked(&mut inner, &batch, &txs, lock_id).await;

        let _ = inner.ledger.as_mut().unwrap().unlock(lock_id).await;

        result
    }

    async fn commit_locked(
        &self,
        inner: &mut Inner<FS>,
        batch: &[Vec<u8>],
        txs: &[Transaction],
        lock_id: u64,
    ) -> Result<(), StoreError> {
        // c. catch up on any peer writes while already holding the lock.
        let want_entries = !self.config.disable_index();
        match inner.ledger.as_mut().unwrap().sync(want_entries).await {
            Ok(entries) => self.apply_entries(inner, entries),
            Err(err) => return Err(err.into()),
        }

        // d/e. append the batch and record where it landed.
        let base_offset = inner
            .ledger
            .as_mut()
            .unwrap()
            .add(batch, lock_id)
            .await
            .map_err(StoreError::from)?;

        let mut offset = base_offset;
        let mut committed = Vec::with_capacity(txs.len());
        for (tx, encoded) in txs.iter().zip(batch.iter()) {
            let entry = DecodedEntry {
                offset,
                length: encoded.len() as u64,
                complete: true,
                transaction: tx.clone(),
                error_correction_offset: 0,
            };
            offset += entry.length;
            inner.ledger.as_mut().unwrap().cache_insert(entry.clone());
            committed.push(entry);
        }

        // f. apply each freshly committed entry the same way a synced entry
        // would be: watchers first, then the index.
        self.apply_entries(inner, committed);
        Ok(())
    }

    // -- reads ----------------------------------------------------------

    pub async fn get(&self, key: &Key) -> Result<Option<GetResult>, StoreError> {
        let mut inner = self.inner.lock().await;
        ensure_open(&inner)?;
        if self.config.disable_index() {
            return Err(StoreError::IndexDisabled);
        }

        let query = Query::exact(key);
        let Some(offset) = inner.index.get(&query, Some(1), false).into_iter().next() else {
            return Ok(None);
        };
        let max = inner.ledger.as_ref().unwrap().header().current_offset;
        let entry = inner
            .ledger
            .as_mut()
            .unwrap()
            .raw_get_transaction(offset, max, true, false)
            .await
            .map_err(StoreError::from)?
            .expect("an index reference always points at a readable transaction");

        let payload = entry.transaction.payload.as_deref().unwrap_or(&[]);
        let value = Value::decode(payload)?;
        Ok(Some(GetResult {
            ts: entry.transaction.ts,
            value,
        }))
    }

    /// Resolves `query` against the index and decodes each matching entry
    /// (spec.md §4.7.6). Eagerly collected rather than streamed — there is
    /// no lazy iterator here, unlike spec.md's `iterate`; see `DESIGN.md`.
    pub async fn iterate(
        &self,
        query: &Query,
        limit: Option<usize>,
        reverse: bool,
    ) -> Result<Vec<IteratedEntry>, StoreError> {
        let mut inner = self.inner.lock().await;
        ensure_open(&inner)?;
        if self.config.disable_index() {
            return Err(StoreError::IndexDisabled);
        }

        let offsets = inner.index.get(query, limit, reverse);
        let max = inner.ledger.as_ref().unwrap().header().current_offset;
        let mut out = Vec::with_capacity(offsets.len());
        for offset in offsets {
            let entry = inner
                .ledger
                .as_mut()
                .unwrap()
                .raw_get_transaction(offset, max, true, false)
                .await
                .map_err(StoreError::from)?
                .expect("an index reference always points at a readable transaction");
            let payload = entry.transaction.payload.as_deref().unwrap_or(&[]);
            let value = Value::decode(payload)?;
            out.push(IteratedEntry {
                key: entry.transaction.key.clone(),
                ts: entry.transaction.ts,
                value,
                offset: entry.offset,
            });
        }
        Ok(out)
    }

    /// Buffered alias for [`Store::iterate`] (spec.md §4.7.6's `listAll`).
    pub async fn list_all(
        &self,
        query: &Query,
        limit: Option<usize>,
        reverse: bool,
    ) -> Result<Vec<IteratedEntry>, StoreError> {
        self.iterate(query, limit, reverse).await
    }

    pub async fn count(&self, query: &Query) -> Result<usize, StoreError> {
        let inner = self.inner.lock().await;
        ensure_open(&inner)?;
        if self.config.disable_index() {
            return Err(StoreError::IndexDisabled);
        }
        Ok(inner.index.get(query, None, false).len())
    }

    pub async fn list_keys(&self, query: Option<&Query>) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        ensure_open(&inner)?;
        if self.config.disable_index() {
            return Err(StoreError::IndexDisabled);
        }
        Ok(inner.index.get_child_keys(query))
    }

    /// A linear ledger walk, usable even with the index disabled (spec.md
    /// §4.7.6).
    pub async fn scan(&self, query: &Query, recursive: bool) -> Result<Vec<DecodedEntry>, StoreError> {
        let mut inner = self.inner.lock().await;
        ensure_open(&inner)?;
        inner
            .ledger
            .as_mut()
            .unwrap()
            .scan(query, recursive, true, false)
            .await
            .map_err(StoreError::from)
    }

    // -- maintenance ------------------------------------------------------

    /// Compacts the ledger, blocking background sync for the duration
    /// (spec.md §4.7.7), then reopens with a freshly rebuilt index.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn vacuum(&self) -> Result<(), StoreError> {
        self.reject_if_reentrant()?;
        let mut inner = self.inner.lock().await;
        ensure_open(&inner)?;
        inner.block_sync = true;

        let path = inner
            .path
            .clone()
            .expect("path is always set while a ledger is open");

        let vacuum_result = inner.ledger.as_mut().unwrap().vacuum().await;
        inner.index.clear();
        drop(inner);

        let result = match vacuum_result {
            Ok(()) => self.open_internal(path, false).await,
            Err(err) => Err(err.into()),
        };

        self.inner.lock().await.block_sync = false;
        result
    }

    pub async fn force_unlock_ledger(&self) -> Result<(), StoreError> {
        self.reject_if_reentrant()?;
        let mut inner = self.inner.lock().await;
        ensure_open(&inner)?;
        inner
            .ledger
            .as_mut()
            .unwrap()
            .force_unlock()
            .await
            .map_err(StoreError::from)
    }

    // -- watching -----------------------------------------------------------

    /// Registers a callback invoked synchronously for every applied entry
    /// whose key matches `query` (spec.md §4.7.4).
    pub async fn watch<F>(&self, query: Query, recursive: bool, callback: F) -> WatchId
    where
        F: Fn(&DecodedEntry) + Send + Sync + 'static,
    {
        let id = WatchId(self.next_watch_id.fetch_add(1, Ordering::SeqCst));
        let mut inner = self.inner.lock().await;
        inner.watchers.push(Watcher {
            id,
            query,
            recursive,
            callback: Arc::new(callback),
        });
        id
    }

    /// Unregisters a watcher previously returned by [`Store::watch`].
    /// Returns whether anything was removed.
    pub async fn unwatch(&self, id: WatchId) -> bool {
        let mut inner = self.inner.lock().await;
        let before = inner.watchers.len();
        inner.watchers.retain(|w| w.id != id);
        inner.watchers.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Fragment;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn key(parts: &[&str]) -> Key {
        Key::new(
            parts.iter().map(|s| Fragment::String(s.to_string())).collect(),
            true,
        )
        .unwrap()
    }

    fn no_auto_sync() -> StoreConfig {
        StoreConfig::builder().auto_sync(false).build().unwrap()
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db.ckvd"), true, no_auto_sync())
            .await
            .unwrap();

        store.set(key(&["name"]), Value::String("ok".into())).await.unwrap();
        let result = store.get(&key(&["name"])).await.unwrap().unwrap();
        assert_eq!(result.value, Value::String("ok".into()));
    }

    #[tokio::test]
    async fn delete_then_get_returns_none() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db.ckvd"), true, no_auto_sync())
            .await
            .unwrap();

        store.set(key(&["name"]), Value::Number(1.0)).await.unwrap();
        store.delete(key(&["name"])).await.unwrap();
        assert!(store.get(&key(&["name"])).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transaction_batches_until_end() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db.ckvd"), true, no_auto_sync())
            .await
            .unwrap();

        store.begin_transaction().await.unwrap();
        store.set(key(&["a"]), Value::Number(1.0)).await.unwrap();
        store.set(key(&["b"]), Value::Number(2.0)).await.unwrap();
        assert!(store.get(&key(&["a"])).await.unwrap().is_none());

        store.end_transaction().await.unwrap();
        assert!(store.get(&key(&["a"])).await.unwrap().is_some());
        assert!(store.get(&key(&["b"])).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn abort_transaction_discards_pending_writes() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db.ckvd"), true, no_auto_sync())
            .await
            .unwrap();

        store.begin_transaction().await.unwrap();
        store.set(key(&["a"]), Value::Number(1.0)).await.unwrap();
        store.abort_transaction().await.unwrap();
        store.end_transaction().await.unwrap();

        assert!(store.get(&key(&["a"])).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn watch_fires_for_matching_sets() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db.ckvd"), true, no_auto_sync())
            .await
            .unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let query = Query::exact(&key(&["watched"]));
        store
            .watch(query, false, move |_entry| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        store.set(key(&["watched"]), Value::Bool(true)).await.unwrap();
        store.set(key(&["other"]), Value::Bool(true)).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unwatch_stops_future_dispatch() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db.ckvd"), true, no_auto_sync())
            .await
            .unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let query = Query::exact(&key(&["watched"]));
        let id = store
            .watch(query, false, move |_entry| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert!(store.unwatch(id).await);
        store.set(key(&["watched"]), Value::Bool(true)).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!store.unwatch(id).await);
    }

    #[tokio::test]
    async fn two_handles_observe_each_others_writes_via_sync() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.ckvd");
        let a = Store::open(path.clone(), true, no_auto_sync()).await.unwrap();
        let b = Store::open(path, false, no_auto_sync()).await.unwrap();

        a.set(key(&["shared"]), Value::Number(7.0)).await.unwrap();
        assert!(b.get(&key(&["shared"])).await.unwrap().is_none());

        matches!(b.sync(false).await, SyncOutcome::NewData);
        let got = b.get(&key(&["shared"])).await.unwrap().unwrap();
        assert_eq!(got.value, Value::Number(7.0));
    }

    #[tokio::test]
    async fn vacuum_preserves_live_data_and_drops_overwritten_keys() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db.ckvd"), true, no_auto_sync())
            .await
            .unwrap();

        store.set(key(&["a"]), Value::Number(1.0)).await.unwrap();
        store.set(key(&["a"]), Value::Number(2.0)).await.unwrap();
        store.set(key(&["b"]), Value::Number(3.0)).await.unwrap();
        store.delete(key(&["b"])).await.unwrap();

        store.vacuum().await.unwrap();

        let a = store.get(&key(&["a"])).await.unwrap().unwrap();
        assert_eq!(a.value, Value::Number(2.0));
        assert!(store.get(&key(&["b"])).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_disallows_further_opens_on_the_same_handle() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db.ckvd"), true, no_auto_sync())
            .await
            .unwrap();
        store.close().await.unwrap();
        assert!(!store.is_open());

        let err = store.open_internal(dir.path().join("db.ckvd"), true).await;
        assert!(matches!(err, Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn get_against_disabled_index_is_rejected() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::builder()
            .auto_sync(false)
            .disable_index(true)
            .build()
            .unwrap();
        let store = Store::open(dir.path().join("db.ckvd"), true, config).await.unwrap();

        store.set(key(&["a"]), Value::Number(1.0)).await.unwrap();
        let err = store.get(&key(&["a"])).await.unwrap_err();
        assert!(matches!(err, StoreError::IndexDisabled));

        let scanned = store.scan(&Query::exact(&key(&["a"])), false).await.unwrap();
        assert_eq!(scanned.len(), 1);
    }
}
