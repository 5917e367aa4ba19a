//! Events the engine reports outward.
//!
//! Emitted after the store is updated, so a subscriber always observes the
//! snapshot the event carries as the committed truth.

use crate::abiencode::types::{Address, Hash, U256};
use crate::channel::StateChannel;
use crate::messages::ProtocolParams;
use crate::protocol::Protocol;

#[derive(Debug, Clone)]
pub enum Event {
    /// Setup committed; the channel exists on this side now.
    ChannelCreated { channel: StateChannel },
    /// An on-chain deposit was reflected in the free balance.
    DepositConfirmed {
        channel: StateChannel,
        party: Address,
        amount: U256,
    },
    /// A counterparty opened a handshake with us.
    ProposalReceived {
        protocol: Protocol,
        params: ProtocolParams,
        from: Address,
    },
    /// An install (regular or virtual) committed on this channel.
    InstallCompleted {
        channel: StateChannel,
        app_identity_hash: Hash,
    },
    /// An uninstall (regular or virtual) committed on this channel.
    UninstallCompleted {
        channel: StateChannel,
        app_identity_hash: Hash,
    },
    /// A state update committed.
    UpdateApplied {
        channel: StateChannel,
        app_identity_hash: Hash,
        version_number: u64,
    },
}
