//! Per-write token generation.

use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

/// Size of a write token, in bytes.
pub const TOKEN_SIZE: usize = 16;

/// Source of unique 16-byte write tokens.
///
/// A token is a random per-process prefix followed by a monotonic counter.
/// Tokens are opaque and need not be secret; they only have to stay unique
/// within the TTL window of the items that embed them.
#[derive(Debug)]
pub struct TokenSource {
    prefix: [u8; 8],
    counter: AtomicU64,
}

impl TokenSource {
    pub fn new() -> Self {
        Self {
            prefix: rand::rng().random::<u64>().to_be_bytes(),
            counter: AtomicU64::new(1),
        }
    }

    /// Produce the next token.
    pub fn next(&self) -> [u8; TOKEN_SIZE] {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut token = [0u8; TOKEN_SIZE];
        token[..8].copy_from_slice(&self.prefix);
        token[8..].copy_from_slice(&seq.to_be_bytes());
        token
    }
}

impl Default for TokenSource {
    fn default() -> Self {
        Self::new()
    }
}
