//! Deterministic seed derivation. Every named random stream in a run is a
//! pure function of the root seed and a free-form label.

use contracts::KernelError;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedManager {
    root: u64,
}

impl SeedManager {
    pub fn new(root: u64) -> Self {
        Self { root }
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    /// Derives the labeled 64-bit sub-seed:
    /// `truncate(SHA-256(root_be ‖ 0x00 ‖ label), 8 bytes, big-endian)`.
    pub fn sub_seed(&self, label: &str) -> Result<u64, KernelError> {
        if label.is_empty() {
            return Err(KernelError::invalid_argument("label must not be empty"));
        }
        let mut hasher = Sha256::new();
        hasher.update(self.root.to_be_bytes());
        hasher.update([0u8]);
        hasher.update(label.as_bytes());
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        Ok(u64::from_be_bytes(prefix))
    }

    /// A restartable stream: the same label always yields an identical
    /// sequence.
    pub fn rng(&self, label: &str) -> Result<ChaCha8Rng, KernelError> {
        Ok(ChaCha8Rng::seed_from_u64(self.sub_seed(label)?))
    }
}
