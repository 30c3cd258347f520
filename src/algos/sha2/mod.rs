use sha2::{Digest, Sha256};

use crate::core::crypto::HashingAlgorithm;


impl HashingAlgorithm<32> for Sha256 {
    fn hash_sequence(buffer: &[&[u8]]) -> [u8; 32] {
        let mut hasher = Self::new();
        for chunk in buffer {
            hasher.update(chunk);
        }
        hasher.finalize().into()
    }
}
