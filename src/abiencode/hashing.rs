use super::{to_bytes, types::Hash, Error};

use serde::Serialize;
use sha3::{Digest, Keccak256};

pub fn keccak256(bytes: &[u8]) -> Hash {
    Hash(Keccak256::digest(bytes).into())
}

/// Keccak-256 over the canonical abi encoding of `value`.
///
/// This is the digest both parties of a channel compute independently, so
/// it must only depend on the value itself.
pub fn to_hash<T>(value: &T) -> Result<Hash, Error>
where
    T: Serialize,
{
    Ok(keccak256(&to_bytes(value)?))
}

/// Builder for `abi.encodePacked` style digests.
///
/// Packed encoding concatenates values at their natural width with no
/// padding and no offsets, so it cannot go through the slot-based
/// serializer. The commitment digests that use it are small and explicit
/// enough to write out field by field.
#[derive(Default)]
pub struct PackedEncoder {
    out: Vec<u8>,
}

impl PackedEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_u8(mut self, v: u8) -> Self {
        self.out.push(v);
        self
    }

    pub fn push_u256(mut self, v: super::types::U256) -> Self {
        self.out.extend_from_slice(&v.to_be_slot());
        self
    }

    pub fn push_address(mut self, v: super::types::Address) -> Self {
        self.out.extend_from_slice(&v.0);
        self
    }

    /// An address padded to a full slot. Packed encoding pads the elements
    /// of an `address[]` even though a lone address stays at 20 bytes.
    pub fn push_address_word(mut self, v: super::types::Address) -> Self {
        self.out.extend_from_slice(&[0u8; 12]);
        self.out.extend_from_slice(&v.0);
        self
    }

    pub fn push_hash(mut self, v: Hash) -> Self {
        self.out.extend_from_slice(&v.0);
        self
    }

    pub fn push_bytes(mut self, v: &[u8]) -> Self {
        self.out.extend_from_slice(v);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.out
    }

    pub fn hash(self) -> Hash {
        keccak256(&self.out)
    }
}

/// First four bytes of the Keccak-256 of a Solidity function signature,
/// used to prefix call data.
pub fn selector(signature: &str) -> [u8; 4] {
    let digest = keccak256(signature.as_bytes());
    [digest.0[0], digest.0[1], digest.0[2], digest.0[3]]
}
