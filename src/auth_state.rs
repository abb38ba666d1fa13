//! Per-transaction Digest retry bookkeeping.
//!
//! Grounded on spec §4.8/§7: "the engine must guard against endless
//! re-challenge by remembering the last CSeq for which it retried, and only
//! retrying when CSeq differs." One `AuthState` is kept per outbound
//! request class (INVITE, REGISTER, MESSAGE) since each runs its own
//! independent challenge/response sequence.

use rand::Rng;

use crate::digest::{Algorithm, Qop};
use crate::parser::Challenge;

const CNONCE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generates a 6-character base62 cnonce, regenerated per retry (spec
/// §4.8).
pub fn generate_cnonce() -> String {
    let mut rng = rand::rng();
    (0..6).map(|_| CNONCE_ALPHABET[rng.random_range(0..CNONCE_ALPHABET.len())] as char).collect()
}

/// Tracks the most recent challenge and retry state for one request class.
#[derive(Debug, Default)]
pub struct AuthState {
    nc: u32,
    retried_cseq: Option<u32>,
    challenge: Option<Challenge>,
}

impl AuthState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if a challenge for `cseq` has not already been
    /// retried — the guard against endless re-challenge.
    pub fn should_retry(&self, cseq: u32) -> bool {
        self.retried_cseq != Some(cseq)
    }

    /// Records that `cseq` has now been retried and advances the
    /// nonce-count, remembering `challenge` for header construction.
    pub fn accept_challenge(&mut self, cseq: u32, challenge: Challenge) {
        self.retried_cseq = Some(cseq);
        self.nc += 1;
        self.challenge = Some(challenge);
    }

    pub fn nc(&self) -> u32 {
        self.nc
    }

    pub fn challenge(&self) -> Option<&Challenge> {
        self.challenge.as_ref()
    }

    pub fn algorithm(&self) -> Algorithm {
        Algorithm::parse(self.challenge.as_ref().and_then(|c| c.algorithm.as_deref()))
    }

    pub fn qop(&self) -> Option<Qop> {
        self.challenge.as_ref().and_then(|c| c.qop.as_deref()).and_then(Qop::select)
    }

    /// Resets all retry state (e.g. a fresh un-challenged transaction is
    /// starting, such as a new outbound INVITE).
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
