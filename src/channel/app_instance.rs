use crate::abiencode::{
    self, keccak256,
    types::{Address, Hash, U256},
    PackedEncoder,
};
use serde::{Deserialize, Serialize};

/// Which kind of asset a set of terms refers to.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum AssetClass {
    Eth,
    Erc20,
}

impl AssetClass {
    fn as_u8(self) -> u8 {
        match self {
            AssetClass::Eth => 0,
            AssetClass::Erc20 => 1,
        }
    }
}

/// Limits on what an app may pay out on uninstall or dispute.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Terms {
    pub asset_class: AssetClass,
    pub limit: U256,
    /// Token contract for [AssetClass::Erc20], zero otherwise.
    pub token: Address,
}

/// Abi view of [Terms]; the enum variant has no Solidity counterpart.
#[derive(Serialize)]
pub(crate) struct TermsEncoding {
    asset_class: u8,
    limit: U256,
    token: Address,
}

impl Terms {
    /// Packed digest the enforcement contracts use to pin the terms a
    /// commitment was made under.
    pub fn hash(&self) -> Hash {
        PackedEncoder::new()
            .push_u8(self.asset_class.as_u8())
            .push_u256(self.limit)
            .push_address(self.token)
            .hash()
    }

    pub(crate) fn encodable(&self) -> TermsEncoding {
        TermsEncoding {
            asset_class: self.asset_class.as_u8(),
            limit: self.limit,
            token: self.token,
        }
    }
}

/// How to talk to the app definition contract.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AppInterface {
    /// Address of the app definition contract.
    pub addr: Address,
    /// Solidity type of the app state, e.g. `tuple(address,uint256)`.
    pub state_encoding: String,
    /// Solidity type of actions, absent if the app has none.
    pub action_encoding: Option<String>,
}

/// Structured or opaque app state.
///
/// The free balance is the one app whose state the engine itself has to
/// read and rewrite, so it is kept structured. Every other app's state is
/// opaque bytes in the app's own encoding; the engine only ever hashes it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum AppState {
    FreeBalance(super::FreeBalanceState),
    Opaque(#[serde(with = "hex::serde")] Vec<u8>),
}

impl AppState {
    pub fn hash(&self) -> Result<Hash, abiencode::Error> {
        match self {
            AppState::FreeBalance(state) => state.hash(),
            AppState::Opaque(bytes) => Ok(keccak256(bytes)),
        }
    }

    pub fn as_free_balance(&self) -> Option<&super::FreeBalanceState> {
        match self {
            AppState::FreeBalance(state) => Some(state),
            AppState::Opaque(_) => None,
        }
    }
}

/// The tuple the identity hash commits to. Fixed field order; changing
/// anything here changes every app identity in existence.
#[derive(Serialize)]
struct AppIdentity<'a> {
    owner: Address,
    signing_keys: &'a [Address],
    app_definition: Address,
    default_timeout: u64,
}

/// One installed instance of an off-chain application.
///
/// The identity fields (owner, signing keys, app definition, default
/// timeout) are fixed at install time; only `state`, `version_number` and
/// `timeout` change afterwards, and only through [AppInstance::with_state].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AppInstance {
    owner: Address,
    signing_keys: Vec<Address>,
    interface: AppInterface,
    terms: Terms,
    state: AppState,
    version_number: u64,
    timeout: u64,
    default_timeout: u64,
    is_virtual: bool,
    locked: bool,
    app_seq_no: u64,
}

impl AppInstance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        owner: Address,
        mut signing_keys: Vec<Address>,
        interface: AppInterface,
        terms: Terms,
        state: AppState,
        default_timeout: u64,
        app_seq_no: u64,
        is_virtual: bool,
    ) -> Self {
        // Lexicographic key order is part of the identity.
        signing_keys.sort();
        AppInstance {
            owner,
            signing_keys,
            interface,
            terms,
            state,
            version_number: 0,
            timeout: default_timeout,
            default_timeout,
            is_virtual,
            locked: false,
            app_seq_no,
        }
    }

    /// Content-derived identity, never reassigned.
    pub fn identity_hash(&self) -> Result<Hash, abiencode::Error> {
        abiencode::to_hash(&AppIdentity {
            owner: self.owner,
            signing_keys: &self.signing_keys,
            app_definition: self.interface.addr,
            default_timeout: self.default_timeout,
        })
    }

    pub fn state_hash(&self) -> Result<Hash, abiencode::Error> {
        self.state.hash()
    }

    /// Salt deriving this app's dependency nonce from its position among
    /// everything ever installed in the owning channel.
    pub fn dependency_nonce_salt(&self) -> Hash {
        PackedEncoder::new()
            .push_address(self.owner)
            .push_u256(U256::from(self.app_seq_no))
            .hash()
    }

    /// The successor instance after an accepted state update.
    pub fn with_state(&self, state: AppState, timeout: u64) -> Self {
        AppInstance {
            state,
            version_number: self.version_number + 1,
            timeout,
            ..self.clone()
        }
    }

    /// Mark the app as mid-uninstall so no concurrent update can race the
    /// settlement handshake.
    pub fn into_locked(&self) -> Self {
        AppInstance {
            locked: true,
            ..self.clone()
        }
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    pub fn signing_keys(&self) -> &[Address] {
        &self.signing_keys
    }

    pub fn interface(&self) -> &AppInterface {
        &self.interface
    }

    pub fn app_definition(&self) -> Address {
        self.interface.addr
    }

    pub fn terms(&self) -> &Terms {
        &self.terms
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn version_number(&self) -> u64 {
        self.version_number
    }

    pub fn timeout(&self) -> u64 {
        self.timeout
    }

    pub fn default_timeout(&self) -> u64 {
        self.default_timeout
    }

    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn app_seq_no(&self) -> u64 {
        self.app_seq_no
    }
}
