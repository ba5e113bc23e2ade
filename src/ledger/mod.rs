//! The append-only ledger: header I/O, append, cross-process locking, sync,
//! error-corrective scanning, and vacuum (spec.md §4.5).

pub mod fs;
pub mod header;
pub mod lock;

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{ensure, ResultExt};

use crate::cache::{DecodedEntry, EntryCache};
use crate::error::{IoSnafu, LedgerError, TransactionSnafu};
use crate::key::Query;
use crate::prefetch::Prefetcher;
use crate::transaction::{HashAlgorithm, Op, Transaction};

use self::fs::{Filesystem, PositionedFile, ProductionFilesystem};
use self::header::{LedgerHeader, HEADER_LEN, LEDGER_BASE_OFFSET};
use self::lock::{LockConfig, FORCE_UNLOCK_SIGNAL};

/// One full error-correction scan window: the most bytes `raw_get_transaction`
/// will search forward for a valid signature before giving up (spec.md §11).
pub const LEDGER_MAX_READ_FAILURE_BYTES: usize = 16 * 1024 * 1024;

pub(crate) fn now_ms_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as f64
}

fn hash_algorithm_for(version: [u8; 4]) -> HashAlgorithm {
    if version == header::VERSION_LEGACY {
        HashAlgorithm::Faulty
    } else {
        HashAlgorithm::Canonical
    }
}

/// The append-only ledger file, owning the [`Prefetcher`] and [`EntryCache`]
/// used to serve reads.
pub struct Ledger<FS: Filesystem = ProductionFilesystem> {
    fs: FS,
    path: PathBuf,
    file: FS::File,
    header: LedgerHeader,
    /// The offset up to which `sync` has already decoded and returned
    /// entries. Deliberately tracked apart from `header.current_offset`:
    /// opening an existing, non-empty file populates `header` with the real
    /// on-disk tip immediately, and if `sync` used that same field as its
    /// "previously seen" watermark, the very first sync after open would
    /// see `prev_offset == header.current_offset` and decode nothing —
    /// silently leaving the index empty for every pre-existing transaction.
    /// Starting this at [`LEDGER_BASE_OFFSET`] unconditionally guarantees the
    /// first `sync` call after `open` always replays the whole file.
    synced_offset: u64,
    prefetcher: Prefetcher,
    cache: EntryCache,
    lock_config: LockConfig,
}

impl<FS: Filesystem> Ledger<FS> {
    /// Opens (or creates, if `create_if_missing` and the file is absent or
    /// empty) the ledger at `path`.
    #[tracing::instrument(skip(fs, lock_config), level = "debug")]
    pub async fn open(
        fs: FS,
        path: PathBuf,
        create_if_missing: bool,
        lock_config: LockConfig,
        cache_budget_bytes: usize,
        prefetch_bytes: usize,
    ) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs.mkdir_p(parent).await.context(IoSnafu {
                    path: path.clone(),
                })?;
            }
        }

        let exists = fs.exists(&path).await;
        if !exists && !create_if_missing {
            return Err(LedgerError::Io {
                path: path.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "ledger file does not exist",
                ),
            });
        }

        let mut file = if exists {
            fs.open_rw_existing(&path).await
        } else {
            fs.create(&path).await
        }
        .context(IoSnafu { path: path.clone() })?;

        let current_len = fs.len(&path).await.context(IoSnafu { path: path.clone() })?;

        let header = if current_len == 0 {
            let header = LedgerHeader::new_empty(now_ms_f64());
            file.write_at(0, &header.encode())
                .await
                .context(IoSnafu { path: path.clone() })?;
            file.write_at(header::LOCK_WORD_OFFSET, &0u64.to_be_bytes())
                .await
                .context(IoSnafu { path: path.clone() })?;
            header
        } else {
            let mut buf = vec![0u8; HEADER_LEN as usize];
            file.read_at(0, &mut buf)
                .await
                .context(IoSnafu { path: path.clone() })?;
            LedgerHeader::decode(&buf)?
        };

        debug!(path = %path.display(), current_offset = header.current_offset, "ledger opened");

        Ok(Ledger {
            fs,
            path,
            file,
            header,
            synced_offset: LEDGER_BASE_OFFSET,
            prefetcher: Prefetcher::new(prefetch_bytes),
            cache: EntryCache::new(cache_budget_bytes),
            lock_config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &LedgerHeader {
        &self.header
    }

    /// Writes bytes `0..32`; never touches the lock word.
    pub async fn write_header(&mut self) -> Result<(), LedgerError> {
        self.file
            .write_at(0, &self.header.encode())
            .await
            .context(IoSnafu {
                path: self.path.clone(),
            })
    }

    /// Reads and validates the first 32 bytes of the header, updating and
    /// returning the in-memory copy.
    pub async fn read_header(&mut self) -> Result<LedgerHeader, LedgerError> {
        let mut buf = vec![0u8; HEADER_LEN as usize];
        self.file
            .read_at(0, &mut buf)
            .await
            .context(IoSnafu {
                path: self.path.clone(),
            })?;
        self.header = LedgerHeader::decode(&buf)?;
        Ok(self.header)
    }

    pub async fn lock(&mut self) -> Result<u64, LedgerError> {
        lock::lock(&mut self.file, &self.path, &self.lock_config).await
    }

    pub async fn unlock(&mut self, lock_id: u64) -> Result<(), LedgerError> {
        lock::unlock(&mut self.file, &self.path, lock_id).await
    }

    pub async fn verify_lock(&mut self, lock_id: u64) -> Result<bool, LedgerError> {
        lock::verify_lock(&mut self.file, &self.path, lock_id).await
    }

    pub async fn force_unlock(&mut self) -> Result<(), LedgerError> {
        self.unlock(FORCE_UNLOCK_SIGNAL).await
    }

    /// Seeds the cache with a just-committed entry so the next read of it
    /// doesn't re-hit the file (spec.md §4.7.5.f).
    pub fn cache_insert(&mut self, entry: DecodedEntry) {
        self.cache.insert(entry);
    }

    /// Appends each pre-encoded transaction in `batch` at the current
    /// `currentOffset`, verifying `lock_id` before every write, and persists
    /// the new offset. Returns the base offset the batch was written at.
    #[tracing::instrument(skip(self, batch), level = "trace")]
    pub async fn add(&mut self, batch: &[Vec<u8>], lock_id: u64) -> Result<u64, LedgerError> {
        let base = self.header.current_offset;
        let mut offset = base;

        for record in batch {
            ensure!(
                self.verify_lock(lock_id).await?,
                crate::error::LockLostSnafu { expected: lock_id }
            );
            self.file
                .write_at(offset, record)
                .await
                .context(IoSnafu {
                    path: self.path.clone(),
                })?;
            offset += record.len() as u64;
        }

        self.header.current_offset = offset;
        self.write_header().await?;
        Ok(base)
    }

    /// Resyncs the header and, if `want_entries`, decodes every transaction
    /// appended since the last call. Returns [`LedgerError::Invalidated`] if
    /// the ledger's creation timestamp changed (it was vacuumed/replaced).
    #[tracing::instrument(skip(self), level = "trace")]
    pub async fn sync(&mut self, want_entries: bool) -> Result<Vec<DecodedEntry>, LedgerError> {
        let prev_created = self.header.created;
        let prev_offset = self.synced_offset;

        self.read_header().await?;

        if prev_created != 0.0 && prev_created != self.header.created {
            return Err(LedgerError::Invalidated);
        }

        let current_max = self.header.current_offset;
        let mut entries = Vec::new();
        if want_entries {
            let mut offset = prev_offset;
            while offset < current_max {
                let entry = self
                    .raw_get_transaction(offset, current_max, true, false)
                    .await?
                    .expect("offset < current_max always yields an entry or an error");
                offset += entry.length + entry.error_correction_offset;
                entries.push(entry);
            }
        }
        self.synced_offset = current_max;
        Ok(entries)
    }

    /// Fetches the transaction whose signature starts at or after `offset`
    /// (bounded by `max`), tolerating and skipping leading garbage bytes via
    /// a sliding error-correction window. Returns `Ok(None)` only when
    /// `offset >= max`.
    #[tracing::instrument(skip(self), level = "trace")]
    pub async fn raw_get_transaction(
        &mut self,
        offset: u64,
        max: u64,
        read_data: bool,
        tolerate_read_errors: bool,
    ) -> Result<Option<DecodedEntry>, LedgerError> {
        if offset >= max {
            return Ok(None);
        }
        if let Some(entry) = self.cache.get_satisfying(offset, read_data) {
            return Ok(Some(entry.clone()));
        }

        let window = LEDGER_MAX_READ_FAILURE_BYTES.min((max - offset) as usize);
        let mut skip: usize = 0;

        loop {
            if skip >= window {
                return Err(LedgerError::ErrorCorrectionExhausted { window });
            }
            let candidate = offset + skip as u64;
            if candidate + 2 > max {
                return Err(LedgerError::ErrorCorrectionExhausted { window });
            }

            match self.try_decode_at(candidate, max, read_data).await {
                Ok(Some(mut entry)) => {
                    entry.error_correction_offset = skip as u64;
                    self.cache.insert(entry.clone());
                    trace!(offset, candidate, skip, "decoded transaction");
                    return Ok(Some(entry));
                }
                Ok(None) => {
                    skip += 1;
                }
                Err(err) => {
                    if tolerate_read_errors {
                        warn!(offset = candidate, error = %err, "skipping unreadable transaction candidate");
                        skip += 1;
                    } else {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Attempts to decode one transaction at exactly `candidate`. Returns
    /// `Ok(None)` on a plain signature mismatch (not an error — the search
    /// should keep sliding); returns `Err` for anything past the signature
    /// check that fails to parse or verify.
    async fn try_decode_at(
        &mut self,
        candidate: u64,
        max: u64,
        read_data: bool,
    ) -> Result<Option<DecodedEntry>, LedgerError> {
        let preamble_bytes = self
            .prefetcher
            .read(&mut self.file, candidate, crate::transaction::PREAMBLE_LEN)
            .await
            .context(IoSnafu {
                path: self.path.clone(),
            })?;

        if preamble_bytes[0..2] != crate::transaction::SIGNATURE {
            return Ok(None);
        }

        let preamble = Transaction::decode_preamble(&preamble_bytes).context(TransactionSnafu)?;
        let hdr_len = preamble.hdr_len as u64;
        let data_len = preamble.data_len as u64;
        let header_start = candidate + crate::transaction::PREAMBLE_LEN as u64;

        if header_start + hdr_len > max {
            return Err(LedgerError::Transaction {
                source: crate::error::TransactionError::Truncated {
                    what: "header exceeds ledger bounds",
                },
            });
        }

        let header_bytes = self
            .prefetcher
            .read(&mut self.file, header_start, hdr_len as usize)
            .await
            .context(IoSnafu {
                path: self.path.clone(),
            })?;
        let header = Transaction::decode_header(&header_bytes).context(TransactionSnafu)?;

        let total_len = crate::transaction::PREAMBLE_LEN as u64 + hdr_len + data_len;
        let data_start = header_start + hdr_len;

        if read_data {
            if data_start + data_len > max {
                return Err(LedgerError::Transaction {
                    source: crate::error::TransactionError::Truncated {
                        what: "data exceeds ledger bounds",
                    },
                });
            }

            let data_bytes = self
                .prefetcher
                .read(&mut self.file, data_start, data_len as usize)
                .await
                .context(IoSnafu {
                    path: self.path.clone(),
                })?;

            let algo = hash_algorithm_for(self.header.version);
            let transaction = Transaction::decode_data(header, data_bytes, algo)
                .context(TransactionSnafu)?;

            Ok(Some(DecodedEntry {
                offset: candidate,
                length: total_len,
                complete: true,
                transaction,
                error_correction_offset: 0,
            }))
        } else {
            let transaction = Transaction {
                key: header.key,
                op: header.op,
                ts: header.ts,
                payload: None,
                hash: header.hash,
            };
            Ok(Some(DecodedEntry {
                offset: candidate,
                length: total_len,
                complete: false,
                transaction,
                error_correction_offset: 0,
            }))
        }
    }

    /// A linear walk from [`LEDGER_BASE_OFFSET`] to `currentOffset`, yielding
    /// every entry whose key matches `query`.
    #[tracing::instrument(skip(self, query), level = "debug")]
    pub async fn scan(
        &mut self,
        query: &Query,
        recursive: bool,
        fetch_data: bool,
        tolerate_read_errors: bool,
    ) -> Result<Vec<DecodedEntry>, LedgerError> {
        let max = self.header.current_offset;
        let mut offset = LEDGER_BASE_OFFSET;
        let mut out = Vec::new();

        while offset < max {
            let Some(entry) = self
                .raw_get_transaction(offset, max, fetch_data, tolerate_read_errors)
                .await?
            else {
                break;
            };
            let advance = entry.length + entry.error_correction_offset;
            if entry.transaction.key.matches(query, recursive) {
                out.push(entry);
            }
            offset += advance;
        }

        Ok(out)
    }

    /// Compacts the ledger, keeping only the most recent `SET` per still-live
    /// key (spec.md §4.5.5).
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn vacuum(&mut self) -> Result<(), LedgerError> {
        // 1. Walk every transaction without holding the lock, re-reading the
        // header as we go so we notice concurrent appends.
        let mut walked = Vec::new();
        loop {
            let max = self.header.current_offset;
            let mut offset = LEDGER_BASE_OFFSET;
            walked.clear();
            while offset < max {
                let Some(entry) = self.raw_get_transaction(offset, max, true, true).await? else {
                    break;
                };
                offset += entry.length + entry.error_correction_offset;
                walked.push(entry);
            }
            self.read_header().await?;
            if self.header.current_offset == max {
                break;
            }
        }

        // 2. Acquire the lock on the current ledger.
        let our_lock_id = self.lock().await?;

        // 3. Walk in reverse, keeping the last write per still-live key.
        let mut deleted_keys = std::collections::HashSet::new();
        let mut kept_keys = std::collections::HashSet::new();
        let mut survivors = Vec::new();
        for entry in walked.iter().rev() {
            let stringified = entry.transaction.key.stringify();
            match entry.transaction.op {
                Op::Delete => {
                    deleted_keys.insert(stringified);
                }
                Op::Set => {
                    if !deleted_keys.contains(&stringified) && !kept_keys.contains(&stringified) {
                        kept_keys.insert(stringified);
                        survivors.push(entry);
                    }
                }
            }
        }
        survivors.reverse();

        // 4. Create the temp ledger alongside this one and lock it.
        let tmp_path = tmp_path_for(&self.path);
        let mut tmp_ledger = Ledger::open(
            self.fs.clone(),
            tmp_path.clone(),
            true,
            self.lock_config,
            0,
            PREFETCH_DEFAULT,
        )
        .await?;
        let tmp_lock_id = tmp_ledger.lock().await?;

        // `Ledger::open` always stamps a brand-new file as `VERSION_CURRENT`,
        // but the survivor transactions below carry their `hash` field
        // verbatim from whichever `HashAlgorithm` applied to `self`'s
        // version. Re-tag the temp ledger with `self`'s version before
        // appending so a post-vacuum read selects the same algorithm that
        // originally computed those hashes (spec.md §9's
        // `FAULTY_MURMURHASH3` must keep verifying `B016` ledgers after
        // compaction, not just before it).
        if tmp_ledger.header.version != self.header.version {
            tmp_ledger.header.version = self.header.version;
            tmp_ledger.write_header().await?;
        }

        // 5. Append surviving transactions, preserving their wire bytes.
        let mut batch = Vec::with_capacity(survivors.len());
        for entry in &survivors {
            batch.push(entry.transaction.encode());
        }
        if !batch.is_empty() {
            tmp_ledger.add(&batch, tmp_lock_id).await?;
        }

        // 6. Drop caches invalidated by the rewrite.
        self.cache.clear();
        self.prefetcher.clear();

        // 7. Replace the original file with the compacted one.
        tmp_ledger.unlock(tmp_lock_id).await?;
        drop(tmp_ledger);
        self.fs.unlink(&self.path).await.context(IoSnafu {
            path: self.path.clone(),
        })?;
        self.fs.rename(&tmp_path, &self.path).await.context(IoSnafu {
            path: self.path.clone(),
        })?;
        self.file = self.fs.open_rw_existing(&self.path).await.context(IoSnafu {
            path: self.path.clone(),
        })?;
        self.read_header().await?;

        // 8. Unlock.
        self.unlock(our_lock_id).await?;

        info!(path = %self.path.display(), survivors = survivors.len(), "vacuum complete");
        Ok(())
    }
}

const PREFETCH_DEFAULT: usize = crate::prefetch::PREFETCH_BYTES;

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push("-tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::key::{Fragment, Key};
    use crate::transaction::Transaction;

    async fn open(path: PathBuf) -> Ledger<ProductionFilesystem> {
        Ledger::open(
            ProductionFilesystem,
            path,
            true,
            LockConfig::default(),
            0,
            PREFETCH_DEFAULT,
        )
        .await
        .unwrap()
    }

    fn set_tx(name: &str) -> Vec<u8> {
        let key = Key::new(vec![Fragment::String(name.to_string())], true).unwrap();
        Transaction::create(key, Op::Set, now_ms_f64(), Some(&crate::value::Value::Bool(true)))
            .unwrap()
            .encode()
    }

    /// Reopening a ledger that already has committed transactions must see
    /// all of them on the very first `sync`, not just ones appended after
    /// the reopen. Regression test for a bug where `sync` compared against
    /// `header.current_offset` (already advanced to the on-disk tip by
    /// `open`) instead of a separate "last synced" watermark, so the first
    /// sync after reopening an existing file silently replayed nothing.
    #[tokio::test]
    async fn sync_after_reopen_replays_preexisting_transactions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.ckvd");

        let mut writer = open(path.clone()).await;
        let lock_id = writer.lock().await.unwrap();
        writer.add(&[set_tx("a"), set_tx("b")], lock_id).await.unwrap();
        writer.unlock(lock_id).await.unwrap();
        drop(writer);

        let mut reopened = open(path).await;
        let entries = reopened.sync(true).await.unwrap();
        assert_eq!(entries.len(), 2);

        // A second sync with nothing new appended must be empty, not a
        // repeat of the same two entries.
        let entries = reopened.sync(true).await.unwrap();
        assert!(entries.is_empty());
    }

    /// Regression test: vacuuming a legacy (`B016`) ledger must not silently
    /// upgrade it to `VERSION_CURRENT`. The survivor transactions carry
    /// hashes computed with `HashAlgorithm::Faulty`; if the compacted file
    /// came out tagged `B017`, every subsequent read would verify those same
    /// hashes with the canonical algorithm and fail with `HashMismatch`.
    #[tokio::test]
    async fn vacuum_preserves_legacy_version_so_faulty_hashes_still_verify() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.ckvd");

        let mut ledger = open(path).await;
        ledger.header.version = header::VERSION_LEGACY;
        ledger.write_header().await.unwrap();

        let key = Key::new(vec![Fragment::String("legacy".to_string())], true).unwrap();
        let value = crate::value::Value::Bool(true);
        let payload = value.encode().unwrap();
        let faulty_hash = crate::hash::murmur3_x86_32_faulty(&payload, 0);
        let mut tx = Transaction::create(key.clone(), Op::Set, now_ms_f64(), Some(&value)).unwrap();
        tx.hash = faulty_hash;

        let lock_id = ledger.lock().await.unwrap();
        ledger.add(&[tx.encode()], lock_id).await.unwrap();
        ledger.unlock(lock_id).await.unwrap();

        ledger.vacuum().await.unwrap();
        assert_eq!(ledger.header.version, header::VERSION_LEGACY);

        let max = ledger.header.current_offset;
        let entry = ledger
            .raw_get_transaction(LEDGER_BASE_OFFSET, max, true, false)
            .await
            .unwrap()
            .expect("surviving legacy SET should still decode (and hash-verify) after vacuum");
        assert_eq!(entry.transaction.key, key);
    }
}
