//! Error types for every layer of the store.

use std::io;
use std::path::PathBuf;

use snafu::Snafu;

/// Error produced while constructing or validating a [`crate::key::Key`] or
/// [`crate::key::Query`].
#[derive(Debug, Snafu)]
pub enum KeyError {
    #[snafu(display("key must have between 1 and 255 fragments, got {}", count))]
    FragmentCount { count: usize },

    #[snafu(display("the first fragment of a key must be a string"))]
    FirstFragmentNotString,

    #[snafu(display("string fragment {:?} contains a character outside [letter|number|_|-|@]", fragment))]
    InvalidStringFragment { fragment: String },

    #[snafu(display("range fragments are only permitted in queries"))]
    RangeInKey,

    #[snafu(display("range bounds must share a type (both strings or both numbers)"))]
    MismatchedRangeBoundTypes,

    #[snafu(display("truncated or malformed key bytes at offset {}", offset))]
    Truncated { offset: usize },

    #[snafu(display("trailing bytes after decoding key"))]
    TrailingBytes,

    #[snafu(display("malformed key string: {}", reason))]
    BadSyntax { reason: String },
}

/// Error produced while encoding or decoding a [`crate::transaction::Transaction`].
#[derive(Debug, Snafu)]
pub enum TransactionError {
    #[snafu(display("bad key in transaction: {}", source))]
    BadKey { source: KeyError },

    #[snafu(display("SET transactions must carry a payload"))]
    MissingPayload,

    #[snafu(display("DELETE transactions must not carry a payload"))]
    UnexpectedPayload,

    #[snafu(display("signature mismatch: expected 'T;'"))]
    BadSignature,

    #[snafu(display("transaction bytes truncated: {}", what))]
    Truncated { what: &'static str },

    #[snafu(display("header length {} does not match decoded content", expected))]
    HeaderLengthMismatch { expected: u32 },

    #[snafu(display("{} trailing byte(s) after decoding transaction header", extra))]
    TrailingBytes { extra: usize },

    #[snafu(display("unknown transaction operation byte {}", op))]
    UnknownOp { op: u8 },

    #[snafu(display("payload hash mismatch ({})", what))]
    HashMismatch { what: &'static str },

    #[snafu(display("failed to encode payload: {}", source))]
    Encode { source: io::Error },

    #[snafu(display("failed to decode payload: {}", source))]
    Decode { source: io::Error },
}

/// Error produced by the ledger layer.
#[derive(Debug, Snafu)]
pub enum LedgerError {
    #[snafu(display("ledger I/O error at {}: {}", path.display(), source))]
    Io { path: PathBuf, source: io::Error },

    #[snafu(display("ledger file id mismatch: expected CKVD"))]
    BadFileId,

    #[snafu(display("unsupported ledger version {:?}", version))]
    UnsupportedVersion { version: [u8; 4] },

    #[snafu(display("ledger header reports currentOffset {} < 256", offset))]
    OffsetBelowHeader { offset: f64 },

    #[snafu(display("the ledger lock was lost mid-write (expected {:#x})", expected))]
    LockLost { expected: u64 },

    #[snafu(display("timed out acquiring the ledger lock after {} attempts", attempts))]
    LockTimeout { attempts: u32 },

    #[snafu(display("ledger was replaced (vacuumed) beneath this handle"))]
    Invalidated,

    #[snafu(display("transaction error while scanning ledger: {}", source))]
    Transaction { source: TransactionError },

    #[snafu(display("exhausted error-correction window ({} bytes) without finding a valid transaction", window))]
    ErrorCorrectionExhausted { window: usize },
}

/// Top-level façade error.
#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("{}", source))]
    Key { source: KeyError },

    #[snafu(display("{}", source))]
    Transaction { source: TransactionError },

    #[snafu(display("{}", source))]
    Ledger { source: LedgerError },

    #[snafu(display("store is not open"))]
    NotOpen,

    #[snafu(display("store is already open"))]
    AlreadyOpen,

    #[snafu(display("the index is disabled (disable_index = true)"))]
    IndexDisabled,

    #[snafu(display("sync refused: a vacuum is in progress"))]
    Blocked,

    #[snafu(display("watcher callbacks may not call mutating store methods"))]
    ReentrantMutation,

    #[snafu(display("invalid configuration: {}", reason))]
    BadConfig { reason: String },

    #[snafu(display("store was permanently closed and cannot be reopened"))]
    Closed,
}

impl From<KeyError> for StoreError {
    fn from(source: KeyError) -> Self {
        StoreError::Key { source }
    }
}

impl From<TransactionError> for StoreError {
    fn from(source: TransactionError) -> Self {
        StoreError::Transaction { source }
    }
}

impl From<LedgerError> for StoreError {
    fn from(source: LedgerError) -> Self {
        StoreError::Ledger { source }
    }
}

impl From<crate::config::BuildError> for StoreError {
    fn from(source: crate::config::BuildError) -> Self {
        StoreError::BadConfig {
            reason: source.to_string(),
        }
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
