use crate::canon;
use crate::value::Value;

/// A deterministic, fixed-width content hash of a tree value's
/// canonical encoding.
///
/// Equal values hash equal; unequal values are assumed to hash
/// unequal (cryptographic-strength collision resistance is not
/// required for correctness, but blake3 gives it to us anyway).
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Returns the raw bytes of the hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<Hash> for [u8; 32] {
    fn from(hash: Hash) -> Self {
        hash.0
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Computes the content hash of a tree value.
pub fn hash(value: &Value) -> Hash {
    Hash(*blake3::hash(&canon::encode(value)).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn equal_values_hash_equal() {
        let a = Value::set([Value::leaf("a"), Value::leaf("b")]);
        let b = Value::set([Value::leaf("b"), Value::leaf("a")]);
        assert_eq!(hash(&a), hash(&b));
    }

    #[test]
    fn unequal_values_hash_unequal() {
        let a = Value::leaf(1i64);
        let b = Value::leaf(2i64);
        assert_ne!(hash(&a), hash(&b));
    }
}
