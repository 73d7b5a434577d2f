// Hash functions

use sha2::{Digest, Sha256};
use crate::core::Hash256;

/// SHA256 applied twice: hash256 = SHA256(SHA256(data))
pub fn hash256(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    finish_double(&first)
}

/// hash256 over the concatenation of two hashes (Merkle interior nodes)
pub fn hash256_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    finish_double(&hasher.finalize())
}

/// Second round of hash256 over an already computed SHA256 digest
pub fn finish_double(first: &[u8]) -> Hash256 {
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    Hash256::new(out)
}

/// RIPEMD160(SHA256(data)), used for address derivation
pub fn hash160(data: &[u8]) -> [u8; 20] {
    use ripemd::Ripemd160;
    let sha = Sha256::digest(data);
    let ripemd = Ripemd160::digest(sha);
    let mut result = [0u8; 20];
    result.copy_from_slice(&ripemd);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash256_known_vector() {
        // SHA256d("") is a well known constant
        assert_eq!(
            hash256(b"").to_hex(),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn test_hash256_pair_matches_concatenation() {
        let a = hash256(b"a");
        let b = hash256(b"b");
        let mut joined = Vec::new();
        joined.extend_from_slice(a.as_bytes());
        joined.extend_from_slice(b.as_bytes());
        assert_eq!(hash256_pair(&a, &b), hash256(&joined));
        assert_ne!(hash256_pair(&a, &b), hash256_pair(&b, &a));
    }

    #[test]
    fn test_hash160() {
        let hash = hash160(b"test data");
        assert_eq!(hash.len(), 20);
        assert_eq!(hash, hash160(b"test data"));
    }
}
