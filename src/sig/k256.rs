//! Signer using the k256 Rust crate (implementation of ecdsa in Rust).

use crate::abiencode::types::{Address, Hash, Signature};
use k256::{
    ecdsa::{
        recoverable,
        signature::{hazmat::PrehashSigner, Signature as K256Signature},
        SigningKey, VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
};
use sha3::{Digest, Keccak256};

use super::{hash_to_eth_signed_msg_hash, SignatureError};

pub use k256::ecdsa::Error;

/// Holds the private key of one channel participant.
#[derive(Debug)]
pub struct Signer {
    key: SigningKey,
    addr: Address,
}

impl From<VerifyingKey> for Address {
    fn from(key: VerifyingKey) -> Self {
        // Convert the key into an EncodedPoint (on the curve), which has the
        // data we need in bytes [1..]. The first byte is an artifact of the
        // uncompressed point encoding and not part of the public key.
        let pk_bytes: [u8; 65] = key
            .to_encoded_point(false)
            .as_bytes()
            .try_into()
            .expect("uncompressed secp256k1 points are 65 bytes");

        let hash: [u8; 32] = Keccak256::digest(&pk_bytes[1..]).into();

        let mut addr = Address([0; 20]);
        addr.0.copy_from_slice(&hash[32 - 20..]);
        addr
    }
}

impl Signer {
    pub fn new<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        let key = SigningKey::random(rng);
        let addr = key.verifying_key().into();
        Self { key, addr }
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    /// Sign a digest in the `\x19Ethereum Signed Message:\n32` format.
    ///
    /// ECDSA here is deterministic (RFC 6979), so re-signing the same digest
    /// after a crash reproduces the identical signature. The write-ahead log
    /// replay relies on that.
    pub fn sign_eth(&self, msg: Hash) -> Result<Signature, SignatureError> {
        let hash = hash_to_eth_signed_msg_hash(msg);

        let sig: recoverable::Signature = self.key.sign_prehash(&hash.0)?;

        // This Signature type already has the 65-byte r || s || v layout we
        // need, but v still has to be shifted by 27 to be valid in the EVM.
        let mut sig_bytes: [u8; 65] = sig
            .as_bytes()
            .try_into()
            .expect("recoverable signatures are 65 bytes");
        debug_assert!(sig_bytes[32] & 0x80 == 0);
        sig_bytes[64] += 27;

        Ok(Signature(sig_bytes))
    }
}

/// Recover the address that signed `msg` (pre Ethereum-prefix) from an
/// EVM-format signature.
pub fn recover_signer(msg: Hash, eth_sig: &Signature) -> Result<Address, Error> {
    let hash = hash_to_eth_signed_msg_hash(msg);

    // Undo adding the 27, to go back to the format expected below.
    let mut sig_bytes: [u8; 65] = eth_sig.0;
    sig_bytes[64] = sig_bytes[64].wrapping_sub(27);

    let sig = recoverable::Signature::from_bytes(&sig_bytes)?;

    let verifying_key = sig.recover_verifying_key_from_digest_bytes(&hash.0.into())?;
    Ok(verifying_key.into())
}
