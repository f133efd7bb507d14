//! Environment abstraction for deterministic id generation.
//!
//! The `Environment` trait decouples routing logic from the source of
//! randomness used to mint peer and connection ids. This enables:
//!
//! - Deterministic Simulation: a seeded RNG (or a plain counter) makes every
//!   id, and therefore every routing decision that depends on one,
//!   reproducible.
//!
//! - Production Runtime: `SystemEnv` draws ids from OS entropy without any
//!   change to the routing code.
//!
//! # Invariants
//!
//! - Determinism: Given the same seed, `random_bytes()` produces the same
//!   sequence
//! - Isolation: Implementations must not share global state

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// Abstract source of randomness for id generation.
///
/// Passed explicitly to every router (root routers mint peer ids, every
/// router mints the ids of the connections it hosts) and to anonymous peer
/// naming.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Fills the provided buffer with random bytes.
    ///
    /// # Invariants
    ///
    /// - Determinism during simulations: Given the same RNG seed, this produces
    ///   the same sequence of bytes
    /// - Unpredictability in production: Uses OS entropy
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random `u128`.
    fn random_u128(&self) -> u128 {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        u128::from_be_bytes(bytes)
    }

    /// Mints a fresh opaque id: 32 lowercase hex characters.
    fn next_id(&self) -> String {
        format!("{:032x}", self.random_u128())
    }
}

/// Production environment backed by `getrandom`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).unwrap_or_else(|e| {
            // NOTE: Only reachable on unsupported platforms. Ids then collide
            // and registration reports DuplicateKey instead of panicking.
            tracing::error!(error = %e, "getrandom failed");
            buffer.fill(0);
        });
    }
}

/// Counter-backed environment producing `1, 2, 3, ...` as ids.
///
/// Clones share the counter, so one `SequentialEnv` handed to a whole tree
/// yields globally unique, predictable ids.
#[derive(Debug, Clone, Default)]
pub struct SequentialEnv {
    counter: Arc<AtomicU64>,
}

impl SequentialEnv {
    /// Create a counter starting at 1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of values handed out so far.
    pub fn issued(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

impl Environment for SequentialEnv {
    fn random_bytes(&self, buffer: &mut [u8]) {
        let value = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let bytes = u128::from(value).to_be_bytes();
        let len = buffer.len().min(bytes.len());
        buffer.fill(0);
        let start = buffer.len() - len;
        buffer[start..].copy_from_slice(&bytes[bytes.len() - len..]);
    }
}
