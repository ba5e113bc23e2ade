//! The cross-process lock-word protocol (spec.md §4.5.4).
//!
//! Deliberately not OS advisory file locking (`flock`/`fslock`): per
//! spec.md §9, the protocol must keep working on filesystems that don't
//! support advisory locks at all. The lock word is just eight bytes in the
//! header that every peer reads and CASes-by-convention.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use snafu::{ensure, ResultExt};

use crate::error::{IoSnafu, LedgerError, LockLostSnafu, LockTimeoutSnafu};
use crate::ledger::fs::PositionedFile;
use crate::ledger::header::LOCK_WORD_OFFSET;

/// A lock id of this value is never a real owner; passing it to [`unlock`]
/// clears the word unconditionally regardless of current content.
pub const FORCE_UNLOCK_SIGNAL: u64 = u64::MAX;

const RAND_BITS: u32 = 11;
const RAND_MASK: u64 = (1 << RAND_BITS) - 1;

/// Tunables for [`lock`], carried from [`crate::config::StoreConfig`].
#[derive(Clone, Copy, Debug)]
pub struct LockConfig {
    pub stale_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_initial_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            stale_timeout_ms: 10_000,
            max_retries: 10,
            retry_initial_ms: 50,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as u64
}

/// `lock_id = (now_ms & ~((1<<11)-1)) | rand_11bits`: a millisecond
/// timestamp with the low 11 bits randomized for collision resistance
/// between processes racing in the same millisecond.
pub fn generate_lock_id() -> u64 {
    let rand_bits = rand::random::<u16>() as u64 & RAND_MASK;
    (now_ms() & !RAND_MASK) | rand_bits
}

pub async fn read_lock_word<F: PositionedFile>(
    file: &mut F,
    path: &Path,
) -> Result<u64, LedgerError> {
    let mut buf = [0u8; 8];
    file.read_at(LOCK_WORD_OFFSET, &mut buf)
        .await
        .context(IoSnafu {
            path: path.to_path_buf(),
        })?;
    Ok(u64::from_be_bytes(buf))
}

async fn write_lock_word<F: PositionedFile>(
    file: &mut F,
    path: &Path,
    value: u64,
) -> Result<(), LedgerError> {
    file.write_at(LOCK_WORD_OFFSET, &value.to_be_bytes())
        .await
        .context(IoSnafu {
            path: path.to_path_buf(),
        })
}

/// Acquires the lock, retrying up to `config.max_retries` times with linear
/// backoff. Reclaims a stale lock (older than `config.stale_timeout_ms`)
/// from a crashed peer before attempting to take it.
pub async fn lock<F: PositionedFile>(
    file: &mut F,
    path: &Path,
    config: &LockConfig,
) -> Result<u64, LedgerError> {
    for attempt in 0..config.max_retries {
        let mut word = read_lock_word(file, path).await?;

        if word != 0 {
            let word_ts = word & !RAND_MASK;
            if now_ms().saturating_sub(word_ts) > config.stale_timeout_ms {
                unlock(file, path, word).await?;
                word = 0;
            }
        }

        if word != 0 {
            tokio::time::sleep(Duration::from_millis(
                config.retry_initial_ms * (attempt as u64 + 1),
            ))
            .await;
            continue;
        }

        let candidate = generate_lock_id();
        write_lock_word(file, path, candidate).await?;
        tokio::task::yield_now().await;

        if read_lock_word(file, path).await? == candidate {
            return Ok(candidate);
        }
        // Another process raced us between our write and our re-read; retry.
    }

    Err(LockTimeoutSnafu {
        attempts: config.max_retries,
    }
    .build())
}

/// Releases the lock. `lock_id` must equal the current word, unless
/// `lock_id` is [`FORCE_UNLOCK_SIGNAL`], which clears the word unconditionally.
pub async fn unlock<F: PositionedFile>(
    file: &mut F,
    path: &Path,
    lock_id: u64,
) -> Result<(), LedgerError> {
    if lock_id != FORCE_UNLOCK_SIGNAL {
        let current = read_lock_word(file, path).await?;
        ensure!(current == lock_id, LockLostSnafu { expected: lock_id });
    }
    write_lock_word(file, path, 0).await
}

/// Returns whether the lock word still equals `lock_id`, without mutating
/// it.
pub async fn verify_lock<F: PositionedFile>(
    file: &mut F,
    path: &Path,
    lock_id: u64,
) -> Result<bool, LedgerError> {
    Ok(read_lock_word(file, path).await? == lock_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io;

    #[derive(Default)]
    struct MemFile {
        bytes: HashMap<u64, u8>,
    }

    #[async_trait::async_trait]
    impl PositionedFile for MemFile {
        async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
            for (i, b) in buf.iter_mut().enumerate() {
                *b = *self.bytes.get(&(offset + i as u64)).unwrap_or(&0);
            }
            Ok(buf.len())
        }

        async fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
            for (i, b) in buf.iter().enumerate() {
                self.bytes.insert(offset + i as u64, *b);
            }
            Ok(())
        }

        async fn sync_all(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn path() -> PathBuf {
        PathBuf::from("/tmp/test.ledger")
    }

    #[tokio::test]
    async fn lock_then_unlock_round_trips() {
        let mut file = MemFile::default();
        let id = lock(&mut file, &path(), &LockConfig::default()).await.unwrap();
        assert_ne!(id, 0);
        assert!(verify_lock(&mut file, &path(), id).await.unwrap());
        unlock(&mut file, &path(), id).await.unwrap();
        assert!(!verify_lock(&mut file, &path(), id).await.unwrap());
    }

    #[tokio::test]
    async fn unlock_rejects_mismatched_id() {
        let mut file = MemFile::default();
        let id = lock(&mut file, &path(), &LockConfig::default()).await.unwrap();
        let err = unlock(&mut file, &path(), id.wrapping_add(1)).await.unwrap_err();
        assert!(matches!(err, LedgerError::LockLost { .. }));
    }

    #[tokio::test]
    async fn force_unlock_clears_regardless_of_owner() {
        let mut file = MemFile::default();
        let id = lock(&mut file, &path(), &LockConfig::default()).await.unwrap();
        unlock(&mut file, &path(), FORCE_UNLOCK_SIGNAL).await.unwrap();
        assert!(!verify_lock(&mut file, &path(), id).await.unwrap());
    }

    #[tokio::test]
    async fn lock_reclaims_a_stale_word() {
        let mut file = MemFile::default();
        // Simulate a word written far enough in the past to be stale.
        let stale_word = 1u64 << 20;
        write_lock_word(&mut file, &path(), stale_word).await.unwrap();

        let config = LockConfig {
            stale_timeout_ms: 0,
            ..LockConfig::default()
        };
        let id = lock(&mut file, &path(), &config).await.unwrap();
        assert_ne!(id, stale_word);
    }

    #[tokio::test]
    async fn lock_times_out_when_held_and_fresh() {
        let mut file = MemFile::default();
        write_lock_word(&mut file, &path(), generate_lock_id()).await.unwrap();

        let config = LockConfig {
            stale_timeout_ms: 10_000,
            max_retries: 2,
            retry_initial_ms: 1,
        };
        let err = lock(&mut file, &path(), &config).await.unwrap_err();
        assert!(matches!(err, LedgerError::LockTimeout { .. }));
    }
}
