//! The request surface outer layers talk to.
//!
//! One [ChannelClient] per party wraps the engine and maps the rpc-shaped
//! requests onto protocol runs. Every method either completes with final
//! snapshots, suspends waiting for the counterparty, or fails with one
//! typed error; there is no partial success.

use crate::abiencode::types::{Address, Bytes, Hash, U256};
use crate::channel::{AppInterface, AppState, StateChannel, Terms};
use crate::commitment::SignedCommitment;
use crate::engine::{Engine, Outcome};
use crate::events::Event;
use crate::messages::{
    InstallParams, InstallVirtualAppParams, ProtocolParams, SetupParams, UninstallParams,
    UninstallVirtualAppParams, UpdateParams,
};
use crate::network::NetworkContext;
use crate::protocol::{Protocol, ProtocolError};
use crate::sig::Signer;
use crate::store::ChannelStore;
use crate::wal::ProtocolLog;
use crate::wire::{CorrelationKey, MessageBus, ProtocolMessage};
use std::collections::BTreeMap;

/// Everything needed to request an app install.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub responding: Address,
    pub multisig: Address,
    pub signing_keys: Vec<Address>,
    pub interface: AppInterface,
    pub terms: Terms,
    pub initial_state: AppState,
    pub default_timeout: u64,
    pub decrements: BTreeMap<Address, U256>,
}

/// Everything needed to request a virtual app install.
#[derive(Debug, Clone)]
pub struct InstallVirtualRequest {
    pub responding: Address,
    pub intermediary: Address,
    pub signing_keys: Vec<Address>,
    pub interface: AppInterface,
    pub terms: Terms,
    pub initial_state: AppState,
    pub default_timeout: u64,
    pub expiry: u64,
    pub capital: U256,
}

pub struct ChannelClient<B: MessageBus, S: ChannelStore, L: ProtocolLog> {
    engine: Engine<B, S, L>,
}

impl<B: MessageBus, S: ChannelStore, L: ProtocolLog> ChannelClient<B, S, L> {
    pub fn new(signer: Signer, network: NetworkContext, bus: B, store: S, wal: L) -> Self {
        ChannelClient {
            engine: Engine::new(signer, network, bus, store, wal),
        }
    }

    pub fn address(&self) -> Address {
        self.engine.address()
    }

    /// Register an event handler for channel lifecycle notifications.
    pub fn subscribe(&mut self, handler: impl Fn(&Event) + 'static) {
        self.engine.subscribe(handler);
    }

    /// Rebuild interrupted handshakes after a restart.
    pub fn resume(&mut self) -> Result<(), ProtocolError> {
        self.engine.resume_from_log()?;
        Ok(())
    }

    /// Feed one message received from the transport into the engine.
    pub fn handle_message(&mut self, msg: ProtocolMessage) -> Result<Outcome, ProtocolError> {
        self.engine.handle_message(msg)
    }

    /// Give up on a handshake the counterparty stopped answering. Nothing
    /// of the run survives; the channel is usable again immediately.
    pub fn abandon(&mut self, correlation: CorrelationKey) -> Result<(), ProtocolError> {
        self.engine.abandon(correlation)
    }

    /// Open a channel with `responding` at the given multisig address.
    pub fn create_channel(
        &mut self,
        responding: Address,
        multisig: Address,
    ) -> Result<Outcome, ProtocolError> {
        self.engine.initiate(
            Protocol::Setup,
            ProtocolParams::Setup(SetupParams {
                initiating: self.address(),
                responding,
                multisig,
            }),
        )
    }

    /// Install an app funded from the channel's free balance.
    pub fn install(&mut self, request: InstallRequest) -> Result<Outcome, ProtocolError> {
        self.engine.initiate(
            Protocol::Install,
            ProtocolParams::Install(InstallParams {
                initiating: self.address(),
                responding: request.responding,
                multisig: request.multisig,
                signing_keys: request.signing_keys,
                interface: request.interface,
                terms: request.terms,
                initial_state: request.initial_state,
                default_timeout: request.default_timeout,
                decrements: request.decrements,
            }),
        )
    }

    /// Install an app funded through an intermediary.
    pub fn install_virtual(
        &mut self,
        request: InstallVirtualRequest,
    ) -> Result<Outcome, ProtocolError> {
        self.engine.initiate(
            Protocol::InstallVirtualApp,
            ProtocolParams::InstallVirtualApp(InstallVirtualAppParams {
                initiating: self.address(),
                responding: request.responding,
                intermediary: request.intermediary,
                signing_keys: request.signing_keys,
                interface: request.interface,
                terms: request.terms,
                initial_state: request.initial_state,
                default_timeout: request.default_timeout,
                expiry: request.expiry,
                capital: request.capital,
            }),
        )
    }

    /// Remove an app, crediting `increments` back to the free balance.
    pub fn uninstall(
        &mut self,
        responding: Address,
        multisig: Address,
        app_identity_hash: Hash,
        increments: BTreeMap<Address, U256>,
    ) -> Result<Outcome, ProtocolError> {
        self.engine.initiate(
            Protocol::Uninstall,
            ProtocolParams::Uninstall(UninstallParams {
                initiating: self.address(),
                responding,
                multisig,
                app_identity_hash,
                increments,
            }),
        )
    }

    /// Settle and remove a virtual app.
    #[allow(clippy::too_many_arguments)]
    pub fn uninstall_virtual(
        &mut self,
        responding: Address,
        intermediary: Address,
        target: Hash,
        final_state_hash: Hash,
        final_version_number: u64,
        lock_timeout: u64,
        left_increments: BTreeMap<Address, U256>,
        right_increments: BTreeMap<Address, U256>,
    ) -> Result<Outcome, ProtocolError> {
        self.engine.initiate(
            Protocol::UninstallVirtualApp,
            ProtocolParams::UninstallVirtualApp(UninstallVirtualAppParams {
                initiating: self.address(),
                responding,
                intermediary,
                target,
                final_state_hash,
                final_version_number,
                lock_timeout,
                left_increments,
                right_increments,
            }),
        )
    }

    /// Advance an app's state. The caller computes the successor state
    /// against the app definition; the engine negotiates the signatures.
    pub fn take_action(
        &mut self,
        responding: Address,
        multisig: Address,
        app_identity_hash: Hash,
        action: Option<Bytes>,
        new_state: AppState,
        timeout: u64,
    ) -> Result<Outcome, ProtocolError> {
        self.engine.initiate(
            Protocol::Update,
            ProtocolParams::Update(UpdateParams {
                initiating: self.address(),
                responding,
                multisig,
                app_identity_hash,
                action,
                new_state,
                timeout,
            }),
        )
    }

    /// Reflect a confirmed on-chain deposit in the free balance.
    pub fn deposit(
        &mut self,
        multisig: Address,
        party: Address,
        amount: U256,
    ) -> Result<StateChannel, ProtocolError> {
        self.engine.deposit(multisig, party, amount)
    }

    /// Release free balance for withdrawal and get the signed commitment
    /// to submit on-chain.
    pub fn withdraw(
        &mut self,
        multisig: Address,
        amount: U256,
        recipient: Address,
    ) -> Result<(StateChannel, SignedCommitment), ProtocolError> {
        self.engine.withdraw(multisig, amount, recipient)
    }

    /// The committed free balance map of one channel.
    pub fn get_free_balance_state(
        &self,
        multisig: Address,
    ) -> Result<BTreeMap<Address, U256>, ProtocolError> {
        self.engine.free_balance(multisig)
    }

    /// The committed channel value, if any.
    pub fn channel(&self, multisig: Address) -> Result<Option<StateChannel>, ProtocolError> {
        self.engine.channel(multisig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::wal::MemoryLog;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct QueueBus(Rc<RefCell<VecDeque<ProtocolMessage>>>);

    impl MessageBus for QueueBus {
        fn send(&self, msg: &ProtocolMessage) {
            self.0.borrow_mut().push_back(msg.clone());
        }
    }

    type TestClient = ChannelClient<QueueBus, MemoryStore, MemoryLog>;

    fn test_client(rng: &mut StdRng, network: NetworkContext) -> (TestClient, QueueBus) {
        let bus = QueueBus::default();
        let client = ChannelClient::new(
            Signer::new(rng),
            network,
            bus.clone(),
            MemoryStore::new(),
            MemoryLog::new(),
        );
        (client, bus)
    }

    fn test_network(rng: &mut StdRng) -> NetworkContext {
        NetworkContext {
            app_registry: rng.gen(),
            conditional_transaction: rng.gen(),
            virtual_app_agreement: rng.gen(),
            free_balance_app: rng.gen(),
        }
    }

    fn open(
        a: &mut TestClient,
        a_bus: &QueueBus,
        b: &mut TestClient,
        b_bus: &QueueBus,
        multisig: Address,
    ) {
        let responding = b.address();
        a.create_channel(responding, multisig).unwrap();
        let m1 = a_bus.0.borrow_mut().pop_front().unwrap();
        b.handle_message(m1).unwrap();
        let m2 = b_bus.0.borrow_mut().pop_front().unwrap();
        let outcome = a.handle_message(m2).unwrap();
        assert!(matches!(outcome, Outcome::Completed { .. }));
    }

    #[test]
    fn open_deposit_and_query() {
        let mut rng = StdRng::seed_from_u64(90);
        let network = test_network(&mut rng);
        let (mut alice_client, alice_bus) = test_client(&mut rng, network);
        let (mut bob_client, bob_bus) = test_client(&mut rng, network);
        let (alice, bob) = (alice_client.address(), bob_client.address());
        let multisig: Address = rng.gen();

        open(
            &mut alice_client,
            &alice_bus,
            &mut bob_client,
            &bob_bus,
            multisig,
        );

        // Both sides reflect a one-unit deposit from each owner.
        for client in [&mut alice_client, &mut bob_client] {
            client.deposit(multisig, alice, U256::from(1u64)).unwrap();
            client.deposit(multisig, bob, U256::from(1u64)).unwrap();
        }
        for client in [&alice_client, &bob_client] {
            let balances = client.get_free_balance_state(multisig).unwrap();
            assert_eq!(balances[&alice], U256::from(1u64));
            assert_eq!(balances[&bob], U256::from(1u64));
        }
    }

    #[test]
    fn withdraw_releases_balance_and_signs_the_commitment() {
        let mut rng = StdRng::seed_from_u64(91);
        let network = test_network(&mut rng);
        let (mut alice_client, alice_bus) = test_client(&mut rng, network);
        let (mut bob_client, bob_bus) = test_client(&mut rng, network);
        let alice = alice_client.address();
        let multisig: Address = rng.gen();
        let recipient: Address = rng.gen();

        open(
            &mut alice_client,
            &alice_bus,
            &mut bob_client,
            &bob_bus,
            multisig,
        );
        alice_client
            .deposit(multisig, alice, U256::from(5u64))
            .unwrap();

        let (channel, signed) = alice_client
            .withdraw(multisig, U256::from(2u64), recipient)
            .unwrap();
        assert_eq!(
            channel.free_balance_state().unwrap().balance(alice),
            U256::from(3u64)
        );

        let tx = signed.transaction().unwrap();
        assert_eq!(tx.to, recipient);
        assert_eq!(tx.value, U256::from(2u64));
        crate::sig::validate_signature(
            alice,
            Some(signed.commitment.hash_to_sign().unwrap()),
            signed.signatures.get(&alice),
        )
        .unwrap();
    }
}
