//! The on-wire transaction record (spec.md §4.2).
//!
//! ```text
//! signature:  2 bytes  = 'T' ';'
//! hdr_len:    u32
//! data_len:   u32
//! HEADER[hdr_len]:
//!   key_len:   u32
//!   key_bytes: key_len bytes
//!   op:        u8   (1=SET, 2=DELETE)
//!   ts:        f64  (ms since epoch)
//!   hash:      u32  (MurmurHash3 x86_32 of payload; 0 if no payload)
//! DATA[data_len]
//! ```
//!
//! All multi-byte integers and floats are big-endian.

use snafu::{ensure, OptionExt, ResultExt};

use crate::error::{
    BadKeySnafu, BadSignatureSnafu, HashMismatchSnafu, HeaderLengthMismatchSnafu,
    MissingPayloadSnafu, TrailingBytesSnafu, TransactionError, TruncatedSnafu,
    UnexpectedPayloadSnafu,
};
use crate::hash::{murmur3_x86_32, murmur3_x86_32_faulty};
use crate::key::Key;
use crate::value::Value;

pub const SIGNATURE: [u8; 2] = [b'T', b';'];
/// Bytes consumed by `signature | hdr_len | data_len` before `HEADER` starts.
pub const PREAMBLE_LEN: usize = 2 + 4 + 4;

/// The mutation an applied transaction performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Set = 1,
    Delete = 2,
}

impl Op {
    fn from_byte(b: u8) -> Result<Self, TransactionError> {
        match b {
            1 => Ok(Op::Set),
            2 => Ok(Op::Delete),
            other => Err(TransactionError::UnknownOp { op: other }),
        }
    }
}

/// Selects which MurmurHash3 variant verifies a payload's hash, chosen by
/// the ledger version the transaction was read from (spec.md §9).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// `B017` and later.
    Canonical,
    /// `B016` only; see [`crate::hash::murmur3_x86_32_faulty`].
    Faulty,
}

impl HashAlgorithm {
    pub fn hash(self, data: &[u8]) -> u32 {
        match self {
            HashAlgorithm::Canonical => murmur3_x86_32(data, 0),
            HashAlgorithm::Faulty => murmur3_x86_32_faulty(data, 0),
        }
    }
}

/// The lengths read from the fixed-size preamble, before the variable-length
/// `HEADER`/`DATA` sections are available.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Preamble {
    pub hdr_len: u32,
    pub data_len: u32,
}

/// The decoded `HEADER` section: everything needed to identify a transaction
/// and verify its payload, without requiring `DATA` to be read yet.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionHeader {
    pub key: Key,
    pub op: Op,
    pub ts: f64,
    pub hash: u32,
}

/// A fully decoded (or about-to-be-encoded) transaction, header and payload
/// together.
#[derive(Clone, Debug, PartialEq)]
pub struct Transaction {
    pub key: Key,
    pub op: Op,
    pub ts: f64,
    pub payload: Option<Vec<u8>>,
    pub hash: u32,
}

impl Transaction {
    /// Builds a transaction. `SET` requires `value` and serializes it with
    /// the stable object codec (§6); `DELETE` rejects a value.
    pub fn create(
        key: Key,
        op: Op,
        ts: f64,
        value: Option<&Value>,
    ) -> Result<Self, TransactionError> {
        match op {
            Op::Set => {
                let value = value.context(MissingPayloadSnafu)?;
                let payload = value.encode()?;
                let hash = murmur3_x86_32(&payload, 0);
                Ok(Transaction {
                    key,
                    op,
                    ts,
                    payload: Some(payload),
                    hash,
                })
            }
            Op::Delete => {
                ensure!(value.is_none(), UnexpectedPayloadSnafu);
                Ok(Transaction {
                    key,
                    op,
                    ts,
                    payload: None,
                    hash: 0,
                })
            }
        }
    }

    /// Encodes this transaction into a contiguous byte buffer matching the
    /// wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let key_bytes = self.key.to_bytes();
        let data = self.payload.as_deref().unwrap_or(&[]);

        let mut header = Vec::with_capacity(4 + key_bytes.len() + 1 + 8 + 4);
        header.extend_from_slice(&(key_bytes.len() as u32).to_be_bytes());
        header.extend_from_slice(&key_bytes);
        header.push(self.op as u8);
        header.extend_from_slice(&self.ts.to_be_bytes());
        header.extend_from_slice(&self.hash.to_be_bytes());

        let mut buf = Vec::with_capacity(PREAMBLE_LEN + header.len() + data.len());
        buf.extend_from_slice(&SIGNATURE);
        buf.extend_from_slice(&(header.len() as u32).to_be_bytes());
        buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(data);
        buf
    }

    /// Decodes the fixed 10-byte preamble, validating the signature.
    pub fn decode_preamble(bytes: &[u8]) -> Result<Preamble, TransactionError> {
        ensure!(
            bytes.len() >= PREAMBLE_LEN,
            TruncatedSnafu {
                what: "preamble"
            }
        );
        ensure!(bytes[0..2] == SIGNATURE, BadSignatureSnafu);
        let hdr_len = u32::from_be_bytes(bytes[2..6].try_into().unwrap());
        let data_len = u32::from_be_bytes(bytes[6..10].try_into().unwrap());
        Ok(Preamble { hdr_len, data_len })
    }

    /// Decodes a `HEADER` section. `bytes` must be exactly `hdr_len` bytes,
    /// as sliced by the caller using the preceding [`Preamble`]; any
    /// trailing byte after the recognized fields is a [`TransactionError::TrailingBytes`].
    pub fn decode_header(bytes: &[u8]) -> Result<TransactionHeader, TransactionError> {
        ensure!(
            bytes.len() >= 4,
            TruncatedSnafu {
                what: "header key_len"
            }
        );
        let key_len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let key_start = 4;
        let key_end = key_start + key_len;
        ensure!(
            bytes.len() >= key_end,
            TruncatedSnafu {
                what: "header key_bytes"
            }
        );
        let (key, consumed) = Key::from_bytes(&bytes[key_start..key_end]).context(BadKeySnafu)?;
        ensure!(
            consumed == key_len,
            HeaderLengthMismatchSnafu {
                expected: key_len as u32
            }
        );

        ensure!(
            bytes.len() >= key_end + 1 + 8 + 4,
            TruncatedSnafu {
                what: "header op/ts/hash"
            }
        );
        let op = Op::from_byte(bytes[key_end])?;
        let ts_start = key_end + 1;
        let ts = f64::from_be_bytes(bytes[ts_start..ts_start + 8].try_into().unwrap());
        let hash_start = ts_start + 8;
        let hash = u32::from_be_bytes(bytes[hash_start..hash_start + 4].try_into().unwrap());

        let end = hash_start + 4;
        ensure!(
            end == bytes.len(),
            TrailingBytesSnafu {
                extra: bytes.len() - end
            }
        );

        Ok(TransactionHeader { key, op, ts, hash })
    }

    /// Verifies `data` against `header.hash` using `algo`, returning the
    /// assembled transaction on success.
    pub fn decode_data(
        header: TransactionHeader,
        data: Vec<u8>,
        algo: HashAlgorithm,
    ) -> Result<Transaction, TransactionError> {
        let payload = match header.op {
            Op::Set => {
                let actual = algo.hash(&data);
                ensure!(
                    actual == header.hash,
                    HashMismatchSnafu { what: "payload" }
                );
                Some(data)
            }
            Op::Delete => {
                ensure!(data.is_empty(), UnexpectedPayloadSnafu);
                None
            }
        };

        Ok(Transaction {
            key: header.key,
            op: header.op,
            ts: header.ts,
            payload,
            hash: header.hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Fragment;

    fn key(s: &str) -> Key {
        Key::new(vec![Fragment::String(s.to_string())], true).unwrap()
    }

    #[test]
    fn set_round_trips_through_encode_decode() {
        let tx = Transaction::create(
            key("name"),
            Op::Set,
            1_700_000_000_000.0,
            Some(&Value::String("Alice".to_string())),
        )
        .unwrap();

        let bytes = tx.encode();
        let preamble = Transaction::decode_preamble(&bytes).unwrap();
        let header_start = PREAMBLE_LEN;
        let header_end = header_start + preamble.hdr_len as usize;
        let data_end = header_end + preamble.data_len as usize;

        let header = Transaction::decode_header(&bytes[header_start..header_end]).unwrap();
        let decoded = Transaction::decode_data(
            header,
            bytes[header_end..data_end].to_vec(),
            HashAlgorithm::Canonical,
        )
        .unwrap();

        assert_eq!(decoded, tx);
        assert_eq!(data_end, bytes.len());
    }

    #[test]
    fn delete_rejects_a_value() {
        let err = Transaction::create(
            key("name"),
            Op::Delete,
            0.0,
            Some(&Value::Bool(true)),
        )
        .unwrap_err();
        assert!(matches!(err, TransactionError::UnexpectedPayload));
    }

    #[test]
    fn set_requires_a_value() {
        let err = Transaction::create(key("name"), Op::Set, 0.0, None).unwrap_err();
        assert!(matches!(err, TransactionError::MissingPayload));
    }

    #[test]
    fn decode_header_rejects_trailing_bytes() {
        let tx = Transaction::create(
            key("name"),
            Op::Set,
            0.0,
            Some(&Value::Number(1.0)),
        )
        .unwrap();
        let bytes = tx.encode();
        let preamble = Transaction::decode_preamble(&bytes).unwrap();
        let header_start = PREAMBLE_LEN;
        let header_end = header_start + preamble.hdr_len as usize;

        let mut header_bytes = bytes[header_start..header_end].to_vec();
        header_bytes.push(0xff);

        let err = Transaction::decode_header(&header_bytes).unwrap_err();
        assert!(matches!(err, TransactionError::TrailingBytes { .. }));
    }

    #[test]
    fn decode_data_rejects_hash_mismatch() {
        let tx = Transaction::create(
            key("name"),
            Op::Set,
            0.0,
            Some(&Value::String("Alice".to_string())),
        )
        .unwrap();
        let bytes = tx.encode();
        let preamble = Transaction::decode_preamble(&bytes).unwrap();
        let header_start = PREAMBLE_LEN;
        let header_end = header_start + preamble.hdr_len as usize;
        let header = Transaction::decode_header(&bytes[header_start..header_end]).unwrap();

        let tampered = b"tampered payload bytes".to_vec();
        let err = Transaction::decode_data(header, tampered, HashAlgorithm::Canonical).unwrap_err();
        assert!(matches!(err, TransactionError::HashMismatch { .. }));
    }

    #[test]
    fn bad_signature_is_rejected() {
        let err = Transaction::decode_preamble(b"XX\0\0\0\0\0\0\0\0").unwrap_err();
        assert!(matches!(err, TransactionError::BadSignature));
    }
}
