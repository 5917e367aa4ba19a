use super::{
    app_instance::{AppInstance, AppInterface, AppState, AssetClass, Terms},
    free_balance::{FreeBalanceState, InsufficientBalance},
};
use crate::abiencode::{
    self,
    types::{Address, Hash, U256},
};
use crate::network::NetworkContext;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Solidity type of the free balance app state.
const FREE_BALANCE_STATE_ENCODING: &str = "tuple(address[] participants, uint256[] balances)";

/// How long the free balance can be challenged on-chain, in blocks.
const FREE_BALANCE_TIMEOUT: u64 = 100;

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("app {0} not found in channel")]
    AppNotFound(Hash),
    #[error("app {0} already installed")]
    DuplicateIdentity(Hash),
    #[error("app sequence number would not advance: channel at {current}, app claims {proposed}")]
    NonceNotMonotonic { current: u64, proposed: u64 },
    #[error("channel has no free balance yet, run setup first")]
    FreeBalanceMissing,
    #[error("channel is already set up")]
    AlreadySetUp,
    #[error("app {0} is locked by an in-flight uninstall")]
    AppLocked(Hash),
    #[error("app {0} is not a virtual app")]
    NotVirtual(Hash),
    #[error("no virtual app agreement recorded for {0}")]
    AgreementNotFound(Hash),
    #[error("settlement returns {returned} of {locked} locked")]
    SettlementMismatch { locked: U256, returned: U256 },
    #[error(transparent)]
    InsufficientBalance(#[from] InsufficientBalance),
    #[error(transparent)]
    Encode(#[from] abiencode::Error),
}

/// Bookkeeping for a virtual app funded through this channel.
///
/// The agreement never materializes a third multisig; it records how much
/// capital this real channel has conditionally routed to the virtual app,
/// who receives it on settlement and when the condition expires.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VirtualAppAgreement {
    /// Identity hash of the virtual app this agreement funds.
    pub target: Hash,
    /// Capital this channel routes to the virtual app.
    pub capital: U256,
    /// Block height after which the agreement can be settled unilaterally.
    pub expiry: u64,
    /// Who the capital falls back to, in fixed order.
    pub beneficiaries: Vec<Address>,
    /// The shared intermediary the virtual app runs through.
    pub intermediary: Address,
}

/// The full state of one 2-party multisig relationship.
///
/// Immutable: every transition returns a fresh value and the previous one
/// stays valid, so a protocol run can be abandoned at any point without
/// touching what the store holds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StateChannel {
    multisig_address: Address,
    multisig_owners: Vec<Address>,
    app_instances: BTreeMap<Hash, AppInstance>,
    free_balance_id: Option<Hash>,
    num_installed_apps: u64,
    root_nonce_value: u64,
    virtual_agreements: BTreeMap<Hash, VirtualAppAgreement>,
}

impl StateChannel {
    pub fn new(multisig_address: Address, mut multisig_owners: Vec<Address>) -> Self {
        multisig_owners.sort();
        StateChannel {
            multisig_address,
            multisig_owners,
            app_instances: BTreeMap::new(),
            free_balance_id: None,
            num_installed_apps: 0,
            root_nonce_value: 0,
            virtual_agreements: BTreeMap::new(),
        }
    }

    pub fn multisig_address(&self) -> Address {
        self.multisig_address
    }

    pub fn multisig_owners(&self) -> &[Address] {
        &self.multisig_owners
    }

    pub fn num_installed_apps(&self) -> u64 {
        self.num_installed_apps
    }

    pub fn root_nonce_value(&self) -> u64 {
        self.root_nonce_value
    }

    pub fn app(&self, identity_hash: Hash) -> Result<&AppInstance, TransitionError> {
        self.app_instances
            .get(&identity_hash)
            .ok_or(TransitionError::AppNotFound(identity_hash))
    }

    pub fn apps(&self) -> impl Iterator<Item = (&Hash, &AppInstance)> {
        self.app_instances.iter()
    }

    pub fn has_app(&self, identity_hash: Hash) -> bool {
        self.app_instances.contains_key(&identity_hash)
    }

    pub fn virtual_agreement(&self, target: Hash) -> Result<&VirtualAppAgreement, TransitionError> {
        self.virtual_agreements
            .get(&target)
            .ok_or(TransitionError::AgreementNotFound(target))
    }

    pub fn free_balance_app(&self) -> Result<&AppInstance, TransitionError> {
        let id = self
            .free_balance_id
            .ok_or(TransitionError::FreeBalanceMissing)?;
        self.app(id)
    }

    pub fn free_balance_state(&self) -> Result<&FreeBalanceState, TransitionError> {
        self.free_balance_app()?
            .state()
            .as_free_balance()
            .ok_or(TransitionError::FreeBalanceMissing)
    }

    pub fn is_set_up(&self) -> bool {
        self.free_balance_id.is_some()
    }

    /// Install the initial zero free balance. The first transition of every
    /// channel; everything else requires it.
    pub fn setup_channel(&self, network: &NetworkContext) -> Result<Self, TransitionError> {
        if self.free_balance_id.is_some() {
            return Err(TransitionError::AlreadySetUp);
        }

        let free_balance = AppInstance::new(
            self.multisig_address,
            self.multisig_owners.clone(),
            AppInterface {
                addr: network.free_balance_app,
                state_encoding: FREE_BALANCE_STATE_ENCODING.into(),
                action_encoding: None,
            },
            Terms {
                asset_class: AssetClass::Eth,
                limit: U256::MAX,
                token: Address::default(),
            },
            AppState::FreeBalance(FreeBalanceState::new(&self.multisig_owners)),
            FREE_BALANCE_TIMEOUT,
            self.num_installed_apps,
            false,
        );
        let id = free_balance.identity_hash()?;

        let mut next = self.clone();
        next.app_instances.insert(id, free_balance);
        next.free_balance_id = Some(id);
        next.num_installed_apps += 1;
        next.root_nonce_value += 1;
        Ok(next)
    }

    /// Replace the free balance state, bumping its version number.
    fn with_free_balance(&self, state: FreeBalanceState) -> Result<Self, TransitionError> {
        let app = self.free_balance_app()?;
        let id = self
            .free_balance_id
            .expect("free_balance_app checked presence");
        let updated = app.with_state(AppState::FreeBalance(state), app.timeout());

        let mut next = self.clone();
        next.app_instances.insert(id, updated);
        Ok(next)
    }

    fn apply_decrements(
        state: &FreeBalanceState,
        decrements: &BTreeMap<Address, U256>,
    ) -> Result<FreeBalanceState, InsufficientBalance> {
        let mut state = state.clone();
        for (party, amount) in decrements {
            state = state.debit(*party, *amount)?;
        }
        Ok(state)
    }

    fn apply_increments(
        state: &FreeBalanceState,
        increments: &BTreeMap<Address, U256>,
    ) -> FreeBalanceState {
        let mut state = state.clone();
        for (party, amount) in increments {
            state = state.credit(*party, *amount);
        }
        state
    }

    /// Add an app, moving its deposits out of the free balance.
    ///
    /// The app must claim the next sequence number; anything else means the
    /// two parties disagree about what is installed and must fail before a
    /// commitment is signed.
    pub fn install_app(
        &self,
        app: AppInstance,
        decrements: &BTreeMap<Address, U256>,
    ) -> Result<Self, TransitionError> {
        let id = app.identity_hash()?;
        if self.app_instances.contains_key(&id) {
            return Err(TransitionError::DuplicateIdentity(id));
        }
        if app.app_seq_no() != self.num_installed_apps {
            return Err(TransitionError::NonceNotMonotonic {
                current: self.num_installed_apps,
                proposed: app.app_seq_no(),
            });
        }

        let balance = Self::apply_decrements(self.free_balance_state()?, decrements)?;
        let mut next = self.with_free_balance(balance)?;
        next.app_instances.insert(id, app);
        next.num_installed_apps += 1;
        next.root_nonce_value += 1;
        Ok(next)
    }

    /// Remove an app, returning its resolved balances to the free balance.
    pub fn uninstall_app(
        &self,
        identity_hash: Hash,
        increments: &BTreeMap<Address, U256>,
    ) -> Result<Self, TransitionError> {
        self.app(identity_hash)?;

        let balance = Self::apply_increments(self.free_balance_state()?, increments);
        let mut next = self.with_free_balance(balance)?;
        next.app_instances.remove(&identity_hash);
        next.root_nonce_value += 1;
        Ok(next)
    }

    /// Replace an app's state with the next version.
    pub fn set_app_state(
        &self,
        identity_hash: Hash,
        state: AppState,
        timeout: u64,
    ) -> Result<Self, TransitionError> {
        let app = self.app(identity_hash)?;
        if app.is_locked() {
            return Err(TransitionError::AppLocked(identity_hash));
        }
        let updated = app.with_state(state, timeout);

        let mut next = self.clone();
        next.app_instances.insert(identity_hash, updated);
        Ok(next)
    }

    /// Mark a virtual app as mid-uninstall so updates cannot race the
    /// settlement handshake.
    pub fn lock_app_instance(&self, identity_hash: Hash) -> Result<Self, TransitionError> {
        let app = self.app(identity_hash)?;
        if !app.is_virtual() {
            return Err(TransitionError::NotVirtual(identity_hash));
        }
        let locked = app.into_locked();

        let mut next = self.clone();
        next.app_instances.insert(identity_hash, locked);
        Ok(next)
    }

    /// Record a virtual app this channel helps fund, as one of the two
    /// endpoint channels. Holds the app instance itself plus the agreement.
    pub fn install_virtual_app(
        &self,
        app: AppInstance,
        agreement: VirtualAppAgreement,
        decrements: &BTreeMap<Address, U256>,
    ) -> Result<Self, TransitionError> {
        let id = app.identity_hash()?;
        if self.app_instances.contains_key(&id) || self.virtual_agreements.contains_key(&id) {
            return Err(TransitionError::DuplicateIdentity(id));
        }
        if app.app_seq_no() != self.num_installed_apps {
            return Err(TransitionError::NonceNotMonotonic {
                current: self.num_installed_apps,
                proposed: app.app_seq_no(),
            });
        }

        let balance = Self::apply_decrements(self.free_balance_state()?, decrements)?;
        let mut next = self.with_free_balance(balance)?;
        next.app_instances.insert(id, app);
        next.virtual_agreements.insert(id, agreement);
        next.num_installed_apps += 1;
        next.root_nonce_value += 1;
        Ok(next)
    }

    /// Settle and drop a virtual app and its agreement, crediting the
    /// resolved amounts back. The credits must redistribute exactly the
    /// capital the agreement locked; anything else means the parties
    /// disagree about the resolution.
    pub fn remove_virtual_app(
        &self,
        target: Hash,
        increments: &BTreeMap<Address, U256>,
    ) -> Result<Self, TransitionError> {
        let agreement = self.virtual_agreement(target)?;
        let returned = increments
            .values()
            .fold(U256::zero(), |sum, amount| sum + *amount);
        if returned != agreement.capital {
            return Err(TransitionError::SettlementMismatch {
                locked: agreement.capital,
                returned,
            });
        }

        let balance = Self::apply_increments(self.free_balance_state()?, increments);
        let mut next = self.with_free_balance(balance)?;
        next.virtual_agreements.remove(&target);
        next.app_instances.remove(&target);
        next.root_nonce_value += 1;
        Ok(next)
    }

    /// Credit a confirmed on-chain deposit to one owner's free balance.
    pub fn deposit(&self, party: Address, amount: U256) -> Result<Self, TransitionError> {
        let balance = self.free_balance_state()?.credit(party, amount);
        self.with_free_balance(balance)
    }

    /// Release part of one owner's free balance for an on-chain withdrawal.
    pub fn withdraw(&self, party: Address, amount: U256) -> Result<Self, TransitionError> {
        let balance = self.free_balance_state()?.debit(party, amount)?;
        self.with_free_balance(balance)
    }
}
