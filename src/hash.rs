//! MurmurHash3 (x86, 32-bit) payload hashing.
//!
//! Two variants are implemented: the canonical algorithm, used by every
//! ledger written with version `B017` or later, and a frozen legacy variant,
//! [`murmur3_x86_32_faulty`], which reproduces a historical bug present in
//! `B016` ledgers. The faulty variant must never be "fixed" — doing so would
//! make every `B016` ledger's stored hashes unverifiable. See `DESIGN.md` for
//! the provenance of the bug.

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

/// Canonical MurmurHash3 x86_32, as used to verify `B017`-and-later payloads.
pub fn murmur3_x86_32(data: &[u8], seed: u32) -> u32 {
    murmur3_x86_32_inner(data, seed, true)
}

/// The `FAULTY_MURMURHASH3` variant used to verify `B016` payloads.
///
/// The bug: the finalization step of the canonical algorithm XORs the input
/// length into the running hash state before the avalanche mix (`h1 ^= len as
/// u32`). The `B016` implementation omitted that XOR entirely, so two inputs
/// that differ only in length but share the same block/tail bytes beyond the
/// shorter length's boundary can hash identically. This is preserved exactly
/// so that hashes stored in pre-existing `B016` ledgers keep verifying.
pub fn murmur3_x86_32_faulty(data: &[u8], seed: u32) -> u32 {
    murmur3_x86_32_inner(data, seed, false)
}

fn murmur3_x86_32_inner(data: &[u8], seed: u32, xor_len: bool) -> u32 {
    let len = data.len();
    let nblocks = len / 4;
    let mut h1 = seed;

    for i in 0..nblocks {
        let block = &data[i * 4..i * 4 + 4];
        let mut k1 = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);

        h1 ^= k1;
        h1 = h1.rotate_left(13);
        h1 = h1.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = &data[nblocks * 4..];
    let mut k1: u32 = 0;
    match tail.len() {
        3 => {
            k1 ^= u32::from(tail[2]) << 16;
            k1 ^= u32::from(tail[1]) << 8;
            k1 ^= u32::from(tail[0]);
            k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
            h1 ^= k1;
        }
        2 => {
            k1 ^= u32::from(tail[1]) << 8;
            k1 ^= u32::from(tail[0]);
            k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
            h1 ^= k1;
        }
        1 => {
            k1 ^= u32::from(tail[0]);
            k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
            h1 ^= k1;
        }
        _ => {}
    }

    if xor_len {
        h1 ^= len as u32;
    }
    fmix32(h1)
}

fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}
