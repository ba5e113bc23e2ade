//! The minimal filesystem capability the ledger consumes (spec.md §6): open
//! read-write-at-offset, atomic rename, unlink, mkdir, stat. Kept behind a
//! trait so tests can swap in an in-memory double without touching disk.

use std::io;
use std::path::Path;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// A positioned file handle: `read_at`/`write_at` never move a shared cursor
/// implicitly visible to other callers, even though the concrete
/// implementation seeks internally. Callers are expected to hold `&mut
/// self` for the duration of a positioned operation, consistent with the
/// single-owner cooperative model described in spec.md §5.
#[async_trait]
pub trait PositionedFile: Send {
    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
    async fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;
    async fn sync_all(&mut self) -> io::Result<()>;
}

#[async_trait]
impl PositionedFile for File {
    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.seek(io::SeekFrom::Start(offset)).await?;
        let mut total = 0;
        while total < buf.len() {
            let n = self.read(&mut buf[total..]).await?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    async fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.seek(io::SeekFrom::Start(offset)).await?;
        self.write_all(buf).await
    }

    async fn sync_all(&mut self) -> io::Result<()> {
        File::sync_all(self).await
    }
}

/// Filesystem capability consumed by the ledger, abstracted so it can be
/// faked in tests (mirrors the teacher's `Filesystem`/`ProductionFilesystem`
/// split in `variants/disk_v2/io.rs`).
#[async_trait]
pub trait Filesystem: Clone + Send + Sync + 'static {
    type File: PositionedFile + 'static;

    async fn open_rw_existing(&self, path: &Path) -> io::Result<Self::File>;
    async fn open_r_existing(&self, path: &Path) -> io::Result<Self::File>;
    async fn create(&self, path: &Path) -> io::Result<Self::File>;
    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    async fn unlink(&self, path: &Path) -> io::Result<()>;
    async fn mkdir_p(&self, path: &Path) -> io::Result<()>;
    async fn exists(&self, path: &Path) -> bool;
    async fn len(&self, path: &Path) -> io::Result<u64>;
}

/// The real, on-disk filesystem implementation used outside of tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProductionFilesystem;

#[async_trait]
impl Filesystem for ProductionFilesystem {
    type File = File;

    async fn open_rw_existing(&self, path: &Path) -> io::Result<Self::File> {
        tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await
    }

    async fn open_r_existing(&self, path: &Path) -> io::Result<Self::File> {
        tokio::fs::OpenOptions::new().read(true).open(path).await
    }

    async fn create(&self, path: &Path) -> io::Result<Self::File> {
        tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn unlink(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn mkdir_p(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.is_ok()
    }

    async fn len(&self, path: &Path) -> io::Result<u64> {
        Ok(tokio::fs::metadata(path).await?.len())
    }
}
