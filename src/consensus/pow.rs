// Proof of work: compact targets, validation and nonce search

use crate::core::{Block, BlockHeader, Hash256, finish_double};
use num_bigint::BigUint;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Difficulty target: a hash is valid when it is numerically below it
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Target(BigUint);

impl Target {
    /// Decode compact bits: target = mantissa * 256^(exponent - 3).
    /// Negative, zero and over-256-bit encodings are invalid.
    pub fn from_bits(bits: u32) -> Option<Self> {
        let exponent = bits >> 24;
        let mantissa = bits & 0x007f_ffff;
        if bits & 0x0080_0000 != 0 || mantissa == 0 {
            return None;
        }

        let value = if exponent <= 3 {
            BigUint::from(mantissa >> (8 * (3 - exponent)))
        } else {
            BigUint::from(mantissa) << (8 * (exponent - 3))
        };

        if value.bits() == 0 || value.bits() > 256 {
            return None;
        }
        Some(Self(value))
    }

    /// Encode as compact bits, truncating to a 23-bit mantissa
    pub fn to_bits(&self) -> u32 {
        let mut size = ((self.0.bits() + 7) / 8) as u32;
        let low = |v: &BigUint| v.to_u64_digits().first().copied().unwrap_or(0) as u32;
        let mut mantissa = if size <= 3 {
            low(&self.0) << (8 * (3 - size))
        } else {
            low(&(&self.0 >> (8 * (size - 3))))
        };
        if mantissa & 0x0080_0000 != 0 {
            mantissa >>= 8;
            size += 1;
        }
        (size << 24) | (mantissa & 0x007f_ffff)
    }

    pub fn from_value(value: BigUint) -> Self {
        Self(value)
    }

    pub fn value(&self) -> &BigUint {
        &self.0
    }

    /// Big-endian 32-byte form for fast comparison against hashes
    pub fn to_hash256(&self) -> Hash256 {
        let bytes = self.0.to_bytes_be();
        let mut out = [0u8; 32];
        let len = bytes.len().min(32);
        out[32 - len..].copy_from_slice(&bytes[bytes.len() - len..]);
        Hash256::new(out)
    }

    pub fn is_met_by(&self, hash: &Hash256) -> bool {
        *hash < self.to_hash256()
    }

    /// At least as hard as `other`
    pub fn is_harder_or_equal(&self, other: &Target) -> bool {
        self.0 <= other.0
    }

    /// Expected number of hashes to meet this target: 2^256 / (target + 1)
    pub fn work(&self) -> BigUint {
        (BigUint::from(1u8) << 256u32) / (&self.0 + 1u32)
    }

    /// Count leading zero bits (difficulty indicator)
    pub fn leading_zeros(&self) -> u32 {
        256u32.saturating_sub(self.0.bits() as u32)
    }
}

/// Shared flag that asks a running search to stop
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// SHA256 state after the constant header prefix; only the nonce is hashed per attempt
struct HeaderHasher {
    midstate: Sha256,
}

impl HeaderHasher {
    fn new(header: &BlockHeader) -> Self {
        let mut midstate = Sha256::new();
        midstate.update(header.prefix_bytes());
        Self { midstate }
    }

    fn hash(&self, nonce: u64) -> Hash256 {
        let mut state = self.midstate.clone();
        state.update(nonce.to_le_bytes());
        finish_double(&state.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    Found { nonce: u64, hash: Hash256 },
    /// The nonce range holds no solution
    Exhausted,
    Cancelled,
}

/// Mining result
#[derive(Debug)]
pub struct MiningResult {
    pub outcome: SearchOutcome,
    /// Number of hashes computed
    pub attempts: u64,
    pub duration: Duration,
}

impl MiningResult {
    pub fn nonce(&self) -> Option<u64> {
        match self.outcome {
            SearchOutcome::Found { nonce, .. } => Some(nonce),
            _ => None,
        }
    }

    /// Hashes per second
    pub fn hash_rate(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs == 0.0 { 0.0 } else { self.attempts as f64 / secs }
    }
}

/// Proof-of-work checker and solver for one target
pub struct ProofOfWork {
    target: Target,
    threshold: Hash256,
}

impl ProofOfWork {
    pub fn new(target: Target) -> Self {
        let threshold = target.to_hash256();
        Self { target, threshold }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Recompute the block hash and compare it with the target
    pub fn validate(&self, block: &Block) -> bool {
        block.hash() < self.threshold
    }

    /// Try every nonce in `nonces` on one thread, checking `cancel` between attempts
    pub fn search(&self, template: &Block, nonces: Range<u64>, cancel: &CancelToken) -> MiningResult {
        let start_time = Instant::now();
        let hasher = HeaderHasher::new(&template.header);
        let mut attempts = 0u64;

        for nonce in nonces {
            if cancel.is_cancelled() {
                return self.finish(SearchOutcome::Cancelled, attempts, start_time);
            }
            let hash = hasher.hash(nonce);
            attempts += 1;

            if hash < self.threshold {
                return self.finish(SearchOutcome::Found { nonce, hash }, attempts, start_time);
            }

            if attempts % 100_000 == 0 {
                let elapsed = start_time.elapsed();
                log::debug!(
                    "Mining attempts: {} ({:.1} KH/s)",
                    attempts,
                    attempts as f64 / elapsed.as_secs_f64() / 1000.0
                );
            }
        }

        self.finish(SearchOutcome::Exhausted, attempts, start_time)
    }

    /// Split `nonces` across the threads of `pool`; the first valid nonce wins
    pub fn search_parallel(
        &self,
        template: &Block,
        nonces: Range<u64>,
        pool: &rayon::ThreadPool,
        cancel: &CancelToken,
    ) -> MiningResult {
        let start_time = Instant::now();
        let hasher = HeaderHasher::new(&template.header);
        let attempts = AtomicU64::new(0);

        let found = pool.install(|| {
            nonces.into_par_iter().find_map_any(|nonce| {
                if cancel.is_cancelled() {
                    return Some(None);
                }
                attempts.fetch_add(1, Ordering::Relaxed);
                let hash = hasher.hash(nonce);
                (hash < self.threshold).then_some(Some((nonce, hash)))
            })
        });

        let outcome = match found {
            Some(Some((nonce, hash))) => SearchOutcome::Found { nonce, hash },
            Some(None) => SearchOutcome::Cancelled,
            None if cancel.is_cancelled() => SearchOutcome::Cancelled,
            None => SearchOutcome::Exhausted,
        };
        self.finish(outcome, attempts.load(Ordering::Relaxed), start_time)
    }

    fn finish(&self, outcome: SearchOutcome, attempts: u64, start_time: Instant) -> MiningResult {
        MiningResult {
            outcome,
            attempts,
            duration: start_time.elapsed(),
        }
    }
}
