//! MurmurHash3 (x86, 32-bit) and the dialog-id combiner built on top of it.
//!
//! Grounded on `original_source/WiPhone/src/MurmurHash3_32.h` (public-domain
//! MurmurHash3 by Austin Appleby) and the folding in
//! `original_source/WiPhone/tinySIP.cpp` (`dialogIdHash = rotate5(...) ^
//! murmur3_32(component)`), default seed `5381`.

const C1: u32 = 0xcc9e2d51;
const C2: u32 = 0x1b873593;
const DEFAULT_SEED: u32 = 5381;

/// 32-bit MurmurHash3 over `data`, matching `MurmurHash3_32(key, len, seed)`.
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    let mut hash = seed;
    let chunks = data.chunks_exact(4);
    let remainder = chunks.remainder();

    for chunk in chunks {
        let mut k = u32::from_le_bytes(chunk.try_into().unwrap());
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);

        hash ^= k;
        hash = hash.rotate_left(13);
        hash = hash.wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let mut k: u32 = 0;
    for (i, &b) in remainder.iter().enumerate() {
        k ^= (b as u32) << (8 * i);
    }
    if !remainder.is_empty() {
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        hash ^= k;
    }

    hash ^= data.len() as u32;
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85ebca6b);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xc2b2ae35);
    hash ^= hash >> 16;

    hash
}

/// 5-bit left rotate, as used between each folded component.
fn rotate5(v: u32) -> u32 {
    v.rotate_left(5)
}

/// Folds `(call_id, local_tag, remote_tag)` into the 32-bit dialog-id hash
/// used for the fast-path comparison in [`crate::dialog::DialogTable::find`].
pub fn dialog_id_hash(call_id: &str, local_tag: &str, remote_tag: &str) -> u32 {
    let mut h = 0u32;
    h = rotate5(h) ^ murmur3_32(call_id.as_bytes(), DEFAULT_SEED);
    h = rotate5(h) ^ murmur3_32(local_tag.as_bytes(), DEFAULT_SEED);
    h = rotate5(h) ^ murmur3_32(remote_tag.as_bytes(), DEFAULT_SEED);
    h
}
