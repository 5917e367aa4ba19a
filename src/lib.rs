//! Off-chain state channel protocol engine.
//!
//! Two parties (or three, through an intermediary) maintain a shared
//! ledger of apps, deposits and conditional payments behind an on-chain
//! multisig that is only invoked on dispute. This crate is the off-chain
//! half: the deterministic handshake engine producing and exchanging
//! signed commitments, the channel data model, and the persistence needed
//! to survive a crash mid-handshake. Contracts, transports and rpc
//! servers live outside and talk to [ChannelClient].

mod abiencode {
    mod error;
    mod hashing;
    mod ser;

    pub mod types;

    pub use error::{Error, Result};
    pub use hashing::{keccak256, selector, to_hash, PackedEncoder};
    pub use ser::{to_bytes, to_fnargs_bytes, to_token, Token};

    #[cfg(test)]
    mod tests;
}
pub mod sig;

pub mod channel;
mod client;
pub mod commitment;
pub mod engine;
pub mod events;
pub mod messages;
mod network;
pub mod protocol;
pub mod store;
pub mod wal;
pub mod wire;

pub use abiencode::types::{Address, Bytes, Bytes32, Hash, Signature, U256};
pub use abiencode::Error as EncodeError;
pub use client::{ChannelClient, InstallRequest, InstallVirtualRequest};
pub use network::NetworkContext;
