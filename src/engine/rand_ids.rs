//! Random identifier generation: branches, tags, Call-IDs.
//!
//! Grounded on `original_source/WiPhone/tinySIP.h` (`TINYSIP_BRANCH_PREFIX
//! "z9hG4bKMZJ-"`) and `tinySIP.cpp`'s `newCallId`/tag generators, which all
//! draw from the same base62 alphabet via `Random.randChars`.

use rand::Rng;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const BRANCH_PREFIX: &str = "z9hG4bKMZJ-";

fn random_alphanum(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len).map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char).collect()
}

/// A fresh `branch` parameter, regenerated per transaction (spec §4.5).
pub fn new_branch() -> String {
    format!("{BRANCH_PREFIX}{}", random_alphanum(9))
}

/// A fresh `tag` parameter for From/To.
pub fn new_tag() -> String {
    random_alphanum(8)
}

/// A fresh Call-ID, unique for the lifetime of one call/registration/message
/// sequence.
pub fn new_call_id() -> String {
    random_alphanum(16)
}
