//! Persistent map from multisig address to channel state.
//!
//! The store only ever sees committed values: a protocol run works on a
//! copy inside its [Context][crate::protocol::Context] and writes back in
//! one step or not at all. Values are persisted in their serialized form
//! so an implementation can sit on any key-value backend.

use crate::abiencode::types::{Address, Hash};
use crate::channel::StateChannel;
use crate::commitment::SignedCommitment;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Encode(#[from] crate::abiencode::Error),
    #[error("store io failed: {0}")]
    Io(#[from] std::io::Error),
}

pub trait ChannelStore {
    fn load(&self, multisig: Address) -> Result<Option<StateChannel>, StoreError>;
    fn save(&mut self, channel: &StateChannel) -> Result<(), StoreError>;
    /// Find the channel whose owner set is exactly `{a, b}`.
    fn find_by_owners(&self, a: Address, b: Address)
        -> Result<Option<StateChannel>, StoreError>;
    fn multisig_addresses(&self) -> Result<Vec<Address>, StoreError>;
    /// Persist a fully signed commitment for later dispute use, keyed by
    /// its signing digest.
    fn save_commitment(&mut self, commitment: &SignedCommitment) -> Result<(), StoreError>;
    fn commitment(&self, digest: Hash) -> Result<Option<SignedCommitment>, StoreError>;
}

/// In-memory store holding the same serialized form a persistent backend
/// would.
#[derive(Default)]
pub struct MemoryStore {
    channels: BTreeMap<Address, String>,
    commitments: BTreeMap<Hash, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChannelStore for MemoryStore {
    fn load(&self, multisig: Address) -> Result<Option<StateChannel>, StoreError> {
        self.channels
            .get(&multisig)
            .map(|raw| serde_json::from_str(raw).map_err(StoreError::from))
            .transpose()
    }

    fn save(&mut self, channel: &StateChannel) -> Result<(), StoreError> {
        let raw = serde_json::to_string(channel)?;
        self.channels.insert(channel.multisig_address(), raw);
        Ok(())
    }

    fn find_by_owners(
        &self,
        a: Address,
        b: Address,
    ) -> Result<Option<StateChannel>, StoreError> {
        let mut owners = [a, b];
        owners.sort();
        for raw in self.channels.values() {
            let channel: StateChannel = serde_json::from_str(raw)?;
            if channel.multisig_owners() == owners.as_slice() {
                return Ok(Some(channel));
            }
        }
        Ok(None)
    }

    fn multisig_addresses(&self) -> Result<Vec<Address>, StoreError> {
        Ok(self.channels.keys().copied().collect())
    }

    fn save_commitment(&mut self, commitment: &SignedCommitment) -> Result<(), StoreError> {
        let digest = commitment.commitment.hash_to_sign()?;
        let raw = serde_json::to_string(commitment)?;
        self.commitments.insert(digest, raw);
        Ok(())
    }

    fn commitment(&self, digest: Hash) -> Result<Option<SignedCommitment>, StoreError> {
        self.commitments
            .get(&digest)
            .map(|raw| serde_json::from_str(raw).map_err(StoreError::from))
            .transpose()
    }
}
