//! The fixed 256-byte `LedgerHeader` block (spec.md §3, §4.5.1).

use snafu::ensure;

use crate::error::{BadFileIdSnafu, LedgerError, OffsetBelowHeaderSnafu, UnsupportedVersionSnafu};

pub const FILE_ID: &[u8; 4] = b"CKVD";
pub const VERSION_CURRENT: [u8; 4] = *b"B017";
pub const VERSION_LEGACY: [u8; 4] = *b"B016";
pub const SUPPORTED_VERSIONS: [[u8; 4]; 2] = [VERSION_CURRENT, VERSION_LEGACY];

/// Total header block size, including the trailing lock word.
pub const HEADER_LEN: u64 = 256;
/// First byte of the transaction region; also where the 8-byte lock word
/// ends (the lock word occupies the 8 bytes immediately before it).
pub const LEDGER_BASE_OFFSET: u64 = 256;
pub const LOCK_WORD_OFFSET: u64 = LEDGER_BASE_OFFSET - 8;
pub const LOCK_WORD_LEN: usize = 8;

/// Bytes actually touched by [`write_header`]; the remainder of the 256-byte
/// block (`[32, 248)`) is reserved padding left untouched, and `[248, 256)`
/// is the lock word, owned by the lock protocol instead.
const WRITTEN_LEN: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LedgerHeader {
    pub version: [u8; 4],
    /// Creation timestamp (ms since epoch); identifies a specific ledger
    /// incarnation so peers can detect a vacuum/replace via [`crate::error::LedgerError::Invalidated`].
    pub created: f64,
    /// First free byte after the last committed transaction.
    pub current_offset: u64,
}

impl LedgerHeader {
    pub fn new_empty(created: f64) -> Self {
        LedgerHeader {
            version: VERSION_CURRENT,
            created,
            current_offset: LEDGER_BASE_OFFSET,
        }
    }

    /// Encodes the 32 bytes written by [`write_header`]: file id, version,
    /// created, current_offset, then 8 zero bytes of padding.
    pub fn encode(&self) -> [u8; WRITTEN_LEN] {
        let mut buf = [0u8; WRITTEN_LEN];
        buf[0..4].copy_from_slice(FILE_ID);
        buf[4..8].copy_from_slice(&self.version);
        buf[8..16].copy_from_slice(&self.created.to_be_bytes());
        buf[16..24].copy_from_slice(&(self.current_offset as f64).to_be_bytes());
        // buf[24..32] left zeroed (reserved).
        buf
    }

    /// Decodes and validates a header from the first 32+ bytes of the file.
    pub fn decode(bytes: &[u8]) -> Result<Self, LedgerError> {
        ensure!(bytes.len() >= WRITTEN_LEN, BadFileIdSnafu);
        ensure!(&bytes[0..4] == FILE_ID, BadFileIdSnafu);

        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[4..8]);
        ensure!(
            SUPPORTED_VERSIONS.contains(&version),
            UnsupportedVersionSnafu { version }
        );

        let created = f64::from_be_bytes(bytes[8..16].try_into().unwrap());
        let current_offset = f64::from_be_bytes(bytes[16..24].try_into().unwrap());
        ensure!(
            current_offset >= LEDGER_BASE_OFFSET as f64,
            OffsetBelowHeaderSnafu {
                offset: current_offset
            }
        );

        Ok(LedgerHeader {
            version,
            created,
            current_offset: current_offset as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let header = LedgerHeader::new_empty(1_700_000_000_000.0);
        let bytes = header.encode();
        let decoded = LedgerHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn rejects_bad_file_id() {
        let mut bytes = LedgerHeader::new_empty(0.0).encode();
        bytes[0] = b'X';
        assert!(matches!(
            LedgerHeader::decode(&bytes).unwrap_err(),
            LedgerError::BadFileId
        ));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut bytes = LedgerHeader::new_empty(0.0).encode();
        bytes[4..8].copy_from_slice(b"ZZZZ");
        assert!(matches!(
            LedgerHeader::decode(&bytes).unwrap_err(),
            LedgerError::UnsupportedVersion { .. }
        ));
    }

    #[test]
    fn accepts_legacy_version() {
        let mut bytes = LedgerHeader::new_empty(0.0).encode();
        bytes[4..8].copy_from_slice(&VERSION_LEGACY);
        let decoded = LedgerHeader::decode(&bytes).unwrap();
        assert_eq!(decoded.version, VERSION_LEGACY);
    }

    #[test]
    fn rejects_offset_below_header() {
        let mut header = LedgerHeader::new_empty(0.0);
        header.current_offset = 10;
        let bytes = header.encode();
        assert!(matches!(
            LedgerHeader::decode(&bytes).unwrap_err(),
            LedgerError::OffsetBelowHeader { .. }
        ));
    }
}
