//! MurmurHash2 (32-bit) over the ASCII form of a stream id.
//!
//! Partition assignment depends on this exact function; changing the seed,
//! the encoding or the algorithm moves existing streams to other partitions.

pub const MURMUR2_SEED: u32 = 0xc58f_1a7b;

const M: u32 = 0x5bd1_e995;
const R: u32 = 24;

pub fn murmur2(data: &[u8], seed: u32) -> u32 {
    let mut h = seed ^ data.len() as u32;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() == 3 {
        h ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        h ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// ASCII bytes of `s`; every non-ASCII character becomes a single `?`.
pub fn ascii_bytes(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect()
}

/// Hash used to pick a stream's partition.
pub fn stream_hash(stream_id: &str) -> u32 {
    murmur2(&ascii_bytes(stream_id), MURMUR2_SEED)
}
