//! Protocol definitions: the closed instruction set and the role-indexed
//! scripts that drive each handshake.
//!
//! A protocol run is an interpreter walking one role's script. Pure
//! transition steps rewrite the in-memory [Context]; the five opcodes are
//! the only places where keys, IO or the store are touched, and
//! [Opcode::IoSendAndWait] is the only point a run can suspend. The engine
//! in [crate::engine] owns the interpreter loop; this module owns what it
//! executes.

mod context;
mod install;
mod install_virtual_app;
mod setup;
mod uninstall;
mod uninstall_virtual_app;
mod update;

pub use context::{CommitmentPurpose, Context, PendingCommitment};

use crate::abiencode::types::Address;
use crate::channel::TransitionError;
use crate::sig::SignatureError;
use crate::store::StoreError;
use crate::wal::WalError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The named handshakes.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Protocol {
    Setup,
    Install,
    Uninstall,
    Update,
    InstallVirtualApp,
    UninstallVirtualApp,
}

impl Protocol {
    pub fn is_three_party(self) -> bool {
        matches!(
            self,
            Protocol::InstallVirtualApp | Protocol::UninstallVirtualApp
        )
    }
}

/// Position of a party within a handshake. Fixed indices: 0 initiates, 1
/// routes (three-party protocols only), 2 responds.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Intermediary,
    Responder,
}

impl Role {
    pub fn index(self) -> usize {
        match self {
            Role::Initiator => 0,
            Role::Intermediary => 1,
            Role::Responder => 2,
        }
    }
}

/// The closed set of effectful instructions.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Opcode {
    /// Sign every pending commitment this party has not signed yet.
    OpSign,
    /// Same, restricted to the intermediary role. The left and right
    /// commitments stay distinct through their purposes.
    OpSignAsIntermediary,
    /// Transmit the head of the outbox.
    IoSend,
    /// Transmit, then park the run until a correlated message arrives.
    IoSendAndWait,
    /// Atomically write the working channel copies and collected
    /// commitments back to the store.
    StateTransitionCommit,
}

/// A pure rewrite of the context. Everything a step needs is inside it.
pub type Step = fn(&mut Context) -> Result<(), ProtocolError>;

pub enum Instruction {
    Transition(Step),
    Op(Opcode),
}

/// Everything a protocol run can fail with. The engine surfaces exactly
/// one of these per failed run, after discarding the working copies.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid message or parameters: {0}")]
    Validation(String),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("no channel for multisig {0}")]
    ChannelNotFound(Address),
    #[error("no channel between {0} and {1}")]
    ChannelNotFoundByOwners(Address, Address),
    #[error("channel {0} already exists")]
    ChannelExists(Address),
    #[error("channel {0} is busy with another protocol run")]
    ChannelBusy(Address),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("protocol aborted: {0}")]
    Aborted(String),
    #[error(transparent)]
    Encode(#[from] crate::abiencode::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error("{protocol:?} defines no script for {role:?}")]
    NoScript { protocol: Protocol, role: Role },
}

/// The role's instruction script, the engine's program text.
pub fn script(protocol: Protocol, role: Role) -> Result<&'static [Instruction], ProtocolError> {
    let script = match protocol {
        Protocol::Setup => setup::script(role),
        Protocol::Install => install::script(role),
        Protocol::Uninstall => uninstall::script(role),
        Protocol::Update => update::script(role),
        Protocol::InstallVirtualApp => install_virtual_app::script(role),
        Protocol::UninstallVirtualApp => uninstall_virtual_app::script(role),
    };
    script.ok_or(ProtocolError::NoScript { protocol, role })
}

/// Which role a first message of a handshake addresses, by sequence
/// number. Anything else must correlate with an already suspended run.
pub fn role_for_incoming(protocol: Protocol, seq: i32) -> Option<Role> {
    match (protocol.is_three_party(), seq) {
        (false, 1) => Some(Role::Responder),
        (true, 1) => Some(Role::Intermediary),
        (true, 2) => Some(Role::Responder),
        _ => None,
    }
}
