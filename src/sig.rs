//! Creation, recovery and validation of (Ethereum) signatures.
//!
//! Every commitment digest is signed and verified through this module.
//! [validate_signature] is the single checkpoint the protocol flows use for
//! counterparty signatures, and the canonical ordering helpers define the
//! byte layout of the aggregated signature blob the multisig contract
//! expects.

use crate::abiencode::types::{Address, Hash, Signature};
use sha3::{Digest, Keccak256};
use std::collections::BTreeMap;
use thiserror::Error;

mod k256;
pub use self::k256::{recover_signer, Signer};


/// Add the `\x19Ethereum Signed Message\n<length>` prefix to hash.
///
/// This is the format expected by the Solidity contracts.
fn hash_to_eth_signed_msg_hash(hash: Hash) -> Hash {
    // Packed encoding => We can't use the serializer
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(hash.0);
    Hash(hasher.finalize().into())
}

#[derive(Debug, Error)]
pub enum SignatureError {
    /// The message did not carry the signature slot this step requires.
    #[error("missing signature")]
    MissingSignature,
    /// There is no pending commitment to verify the signature against.
    #[error("missing commitment")]
    MissingCommitment,
    /// The signature is valid but was produced by someone else.
    #[error("signature by {recovered}, expected {expected}")]
    InvalidSignature {
        expected: Address,
        recovered: Address,
    },
    /// The signature bytes are not a valid signature at all.
    #[error("signature recovery failed: {0}")]
    Recovery(#[from] ::k256::ecdsa::Error),
}

/// Check that `signature` is `expected_signer`'s signature over `digest`.
///
/// `digest` is the pending commitment's hash to sign, or `None` when the
/// protocol has not built a commitment yet; `signature` is whatever the
/// incoming message carried. Both absences are distinct errors so a
/// malformed handshake is distinguishable from a mis-signed one. Pure, no
/// key material involved.
pub fn validate_signature(
    expected_signer: Address,
    digest: Option<Hash>,
    signature: Option<&Signature>,
) -> Result<(), SignatureError> {
    let signature = signature.ok_or(SignatureError::MissingSignature)?;
    let digest = digest.ok_or(SignatureError::MissingCommitment)?;
    let recovered = recover_signer(digest, signature)?;
    if recovered != expected_signer {
        return Err(SignatureError::InvalidSignature {
            expected: expected_signer,
            recovered,
        });
    }
    Ok(())
}

/// Order signatures over `digest` by recovered signer address, ascending.
///
/// The on-chain verifier walks the concatenated blob expecting strictly
/// increasing signer addresses, so the order must not depend on message
/// arrival order.
pub fn sort_by_signer(
    digest: Hash,
    signatures: &[Signature],
) -> Result<Vec<Signature>, SignatureError> {
    let mut with_signer: Vec<(Address, Signature)> = signatures
        .iter()
        .map(|sig| Ok((recover_signer(digest, sig)?, *sig)))
        .collect::<Result<_, SignatureError>>()?;
    with_signer.sort_by_key(|(addr, _)| *addr);
    Ok(with_signer.into_iter().map(|(_, sig)| sig).collect())
}

/// Concatenate already-keyed signatures in canonical (address) order.
pub fn concat_canonical(signatures: &BTreeMap<Address, Signature>) -> Vec<u8> {
    let mut out = Vec::with_capacity(signatures.len() * 65);
    for sig in signatures.values() {
        out.extend_from_slice(&sig.0);
    }
    out
}
