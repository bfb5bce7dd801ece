//! Token generation for joining ingesters

use rand::Rng;
use std::collections::HashSet;
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// How a joining ingester picks its tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStrategy {
    /// Deterministic tokens derived from the identity and a salt
    Derived { salt: u64 },
    /// Uniformly random tokens
    Random,
    /// Operator-supplied tokens; the requested count is ignored and any
    /// token already taken is dropped
    Fixed(Vec<u32>),
}

impl Default for TokenStrategy {
    fn default() -> Self {
        TokenStrategy::Derived { salt: 0 }
    }
}

impl TokenStrategy {
    pub fn generate(&self, id: &str, count: usize, taken: &HashSet<u32>) -> Vec<u32> {
        match self {
            TokenStrategy::Derived { salt } => derived_tokens(id, *salt, count, taken),
            TokenStrategy::Random => random_tokens(count, taken),
            TokenStrategy::Fixed(tokens) => {
                let mut tokens: Vec<u32> = tokens
                    .iter()
                    .copied()
                    .filter(|t| !taken.contains(t))
                    .collect();
                tokens.sort_unstable();
                tokens.dedup();
                tokens
            }
        }
    }
}

/// Deterministic token set for `id`.
///
/// Candidate `i` is the low 32 bits of `xxh3(id ‖ i)` seeded with `salt`.
/// Values already in `taken`, or already chosen, are skipped and the index
/// advances, so the same identity against the same ring always yields the
/// same set. Returned ascending.
pub fn derived_tokens(id: &str, salt: u64, count: usize, taken: &HashSet<u32>) -> Vec<u32> {
    let mut chosen = HashSet::with_capacity(count);
    let mut tokens = Vec::with_capacity(count);
    let mut buf = Vec::with_capacity(id.len() + 8);
    let mut index: u64 = 0;

    while tokens.len() < count {
        buf.clear();
        buf.extend_from_slice(id.as_bytes());
        buf.extend_from_slice(&index.to_be_bytes());
        index += 1;

        let token = xxh3_64_with_seed(&buf, salt) as u32;
        if taken.contains(&token) || !chosen.insert(token) {
            continue;
        }
        tokens.push(token);
    }

    tokens.sort_unstable();
    tokens
}

/// Random token set avoiding `taken`. Returned ascending.
pub fn random_tokens(count: usize, taken: &HashSet<u32>) -> Vec<u32> {
    let mut rng = rand::thread_rng();
    let mut chosen = HashSet::with_capacity(count);
    let mut tokens = Vec::with_capacity(count);

    while tokens.len() < count {
        let token: u32 = rng.gen();
        if taken.contains(&token) || !chosen.insert(token) {
            continue;
        }
        tokens.push(token);
    }

    tokens.sort_unstable();
    tokens
}
