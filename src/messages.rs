//! Parameter payloads carried by the first message of each handshake.
//!
//! Params are agreed data, not local state: everything in here is either
//! supplied by the caller or already known to all parties, so every
//! participant can derive the same channel transitions and commitment
//! digests from them. App state never appears in the three-party payloads
//! beyond its hash; the intermediary routes capital, not application data.

use crate::abiencode::types::{Address, Bytes, Hash, U256};
use crate::channel::{AppInstance, AppInterface, AppState, Terms};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Open a fresh channel by installing its free balance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SetupParams {
    pub initiating: Address,
    pub responding: Address,
    pub multisig: Address,
}

/// Install an app funded from the free balance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InstallParams {
    pub initiating: Address,
    pub responding: Address,
    pub multisig: Address,
    /// Keys authorized to sign state updates, in any order.
    pub signing_keys: Vec<Address>,
    pub interface: AppInterface,
    pub terms: Terms,
    pub initial_state: AppState,
    pub default_timeout: u64,
    /// What each party moves out of the free balance into the app.
    pub decrements: BTreeMap<Address, U256>,
}

impl InstallParams {
    /// The instance both parties derive from these params. `app_seq_no` is
    /// the local channel's next install slot; it does not affect identity.
    pub fn app_instance(&self, app_seq_no: u64) -> AppInstance {
        AppInstance::new(
            self.multisig,
            self.signing_keys.clone(),
            self.interface.clone(),
            self.terms.clone(),
            self.initial_state.clone(),
            self.default_timeout,
            app_seq_no,
            false,
        )
    }
}

/// Remove an app, crediting its agreed resolution back.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UninstallParams {
    pub initiating: Address,
    pub responding: Address,
    pub multisig: Address,
    pub app_identity_hash: Hash,
    /// What each party gets back from the app's final state.
    pub increments: BTreeMap<Address, U256>,
}

/// Advance an app's state by one version.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UpdateParams {
    pub initiating: Address,
    pub responding: Address,
    pub multisig: Address,
    pub app_identity_hash: Hash,
    /// The action that produced `new_state`, in the app's action encoding.
    /// Informational; the engine signs states, it does not run app logic.
    pub action: Option<Bytes>,
    pub new_state: AppState,
    pub timeout: u64,
}

/// Install an app funded by two real channels through an intermediary.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InstallVirtualAppParams {
    pub initiating: Address,
    pub responding: Address,
    pub intermediary: Address,
    /// The two endpoint signing keys.
    pub signing_keys: Vec<Address>,
    pub interface: AppInterface,
    pub terms: Terms,
    pub initial_state: AppState,
    pub default_timeout: u64,
    /// Block height after which the funding agreements can be settled
    /// unilaterally.
    pub expiry: u64,
    /// Total capital routed to the app through each real channel.
    pub capital: U256,
}

impl InstallVirtualAppParams {
    /// The virtual instance. It has no multisig of its own, so its owner
    /// slot is pinned to zero; both endpoints derive the same identity.
    pub fn app_instance(&self, app_seq_no: u64) -> AppInstance {
        AppInstance::new(
            Address::default(),
            self.signing_keys.clone(),
            self.interface.clone(),
            self.terms.clone(),
            self.initial_state.clone(),
            self.default_timeout,
            app_seq_no,
            true,
        )
    }

    /// Identity hash of the virtual app, used to correlate the handshake.
    pub fn target(&self) -> Result<Hash, crate::abiencode::Error> {
        // The sequence number is not part of the identity.
        self.app_instance(0).identity_hash()
    }
}

/// Tear down a virtual app and settle both funding agreements.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UninstallVirtualAppParams {
    pub initiating: Address,
    pub responding: Address,
    pub intermediary: Address,
    pub target: Hash,
    /// Hash of the final app state the lock pins. The intermediary never
    /// sees the state itself.
    pub final_state_hash: Hash,
    pub final_version_number: u64,
    pub lock_timeout: u64,
    /// Settlement of the initiating<->intermediary channel.
    pub left_increments: BTreeMap<Address, U256>,
    /// Settlement of the responding<->intermediary channel.
    pub right_increments: BTreeMap<Address, U256>,
}

/// Protocol-specific half of a [ProtocolMessage][crate::wire::ProtocolMessage].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolParams {
    Setup(SetupParams),
    Install(InstallParams),
    Uninstall(UninstallParams),
    Update(UpdateParams),
    InstallVirtualApp(InstallVirtualAppParams),
    UninstallVirtualApp(UninstallVirtualAppParams),
}

impl ProtocolParams {
    /// Who started the handshake.
    pub fn initiating(&self) -> Address {
        match self {
            ProtocolParams::Setup(p) => p.initiating,
            ProtocolParams::Install(p) => p.initiating,
            ProtocolParams::Uninstall(p) => p.initiating,
            ProtocolParams::Update(p) => p.initiating,
            ProtocolParams::InstallVirtualApp(p) => p.initiating,
            ProtocolParams::UninstallVirtualApp(p) => p.initiating,
        }
    }
}
