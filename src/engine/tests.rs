use super::*;
use crate::channel::{AppInterface, AppState, AssetClass, Terms};
use crate::messages::{
    InstallParams, InstallVirtualAppParams, SetupParams, UninstallParams,
    UninstallVirtualAppParams, UpdateParams,
};
use crate::store::MemoryStore;
use crate::wal::{FileLog, MemoryLog};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Captures outgoing messages so the test can play transport.
#[derive(Clone, Default)]
struct QueueBus(Rc<RefCell<VecDeque<ProtocolMessage>>>);

impl MessageBus for QueueBus {
    fn send(&self, msg: &ProtocolMessage) {
        self.0.borrow_mut().push_back(msg.clone());
    }
}

type TestEngine = Engine<QueueBus, MemoryStore, MemoryLog>;

fn test_network(rng: &mut StdRng) -> NetworkContext {
    NetworkContext {
        app_registry: rng.gen(),
        conditional_transaction: rng.gen(),
        virtual_app_agreement: rng.gen(),
        free_balance_app: rng.gen(),
    }
}

fn test_engine(rng: &mut StdRng, network: NetworkContext) -> (TestEngine, QueueBus) {
    let bus = QueueBus::default();
    let engine = Engine::new(
        Signer::new(rng),
        network,
        bus.clone(),
        MemoryStore::new(),
        MemoryLog::new(),
    );
    (engine, bus)
}

/// Deliver queued messages to their addressees until everything is quiet.
fn pump(engines: &mut [&mut TestEngine], buses: &[QueueBus]) {
    loop {
        let mut delivered = false;
        for bus in buses {
            let pending: Vec<ProtocolMessage> = bus.0.borrow_mut().drain(..).collect();
            for msg in pending {
                let engine = engines
                    .iter_mut()
                    .find(|e| e.address() == msg.to)
                    .expect("message addressed to an engine under test");
                engine.handle_message(msg).unwrap();
                delivered = true;
            }
        }
        if !delivered {
            break;
        }
    }
}

fn open_channel(a: &mut TestEngine, b: &mut TestEngine, buses: &[QueueBus], multisig: Address) {
    let params = ProtocolParams::Setup(SetupParams {
        initiating: a.address(),
        responding: b.address(),
        multisig,
    });
    let outcome = a.initiate(Protocol::Setup, params).unwrap();
    assert!(matches!(outcome, Outcome::Suspended));
    pump(&mut [a, b], buses);
}

/// Both engines reflect the same confirmed on-chain deposit.
fn deposit_both(engines: &mut [&mut TestEngine], multisig: Address, party: Address, amount: u64) {
    for engine in engines {
        engine.deposit(multisig, party, U256::from(amount)).unwrap();
    }
}

fn test_app_interface(rng: &mut StdRng) -> AppInterface {
    AppInterface {
        addr: rng.gen(),
        state_encoding: "tuple(uint256 turn, uint256 pot)".into(),
        action_encoding: Some("uint8".into()),
    }
}

fn test_terms(limit: u64) -> Terms {
    Terms {
        asset_class: AssetClass::Eth,
        limit: U256::from(limit),
        token: Address::default(),
    }
}

fn install_params(
    rng: &mut StdRng,
    initiating: Address,
    responding: Address,
    multisig: Address,
    decrements: &[(Address, u64)],
) -> InstallParams {
    InstallParams {
        initiating,
        responding,
        multisig,
        signing_keys: vec![initiating, responding],
        interface: test_app_interface(rng),
        terms: test_terms(5),
        initial_state: AppState::Opaque(vec![0u8; 32]),
        default_timeout: 20,
        decrements: decrements
            .iter()
            .map(|(party, amount)| (*party, U256::from(*amount)))
            .collect(),
    }
}

#[test]
fn setup_yields_matching_channels() {
    let mut rng = StdRng::seed_from_u64(70);
    let network = test_network(&mut rng);
    let (mut a, a_bus) = test_engine(&mut rng, network);
    let (mut b, b_bus) = test_engine(&mut rng, network);
    let (alice, bob) = (a.address(), b.address());
    let multisig: Address = rng.gen();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    b.subscribe(move |event| {
        sink.borrow_mut().push(match event {
            Event::ProposalReceived { .. } => "proposal",
            Event::ChannelCreated { .. } => "created",
            _ => "other",
        });
    });

    open_channel(&mut a, &mut b, &[a_bus, b_bus], multisig);

    let ours = a.channel(multisig).unwrap().unwrap();
    let theirs = b.channel(multisig).unwrap().unwrap();
    // Both sides derived the channel independently from the same params.
    assert_eq!(ours, theirs);
    assert_eq!(ours.num_installed_apps(), 1);
    let mut owners = vec![alice, bob];
    owners.sort();
    assert_eq!(ours.multisig_owners(), owners);
    let balances = a.free_balance(multisig).unwrap();
    assert_eq!(balances[&alice], U256::zero());
    assert_eq!(balances[&bob], U256::zero());

    assert_eq!(*seen.borrow(), vec!["proposal", "created"]);

    // Both parties hold the fully signed setup commitment for dispute use.
    let digest = {
        let free_balance = ours.free_balance_app().unwrap();
        Commitment::Setup(crate::commitment::SetupCommitment {
            network,
            multisig,
            multisig_owners: ours.multisig_owners().to_vec(),
            free_balance_id: free_balance.identity_hash().unwrap(),
            free_balance_terms: free_balance.terms().clone(),
        })
        .hash_to_sign()
        .unwrap()
    };
    for engine in [&a, &b] {
        let signed = engine.stored_commitment(digest).unwrap().unwrap();
        assert_eq!(signed.signatures.len(), 2);
    }
}

#[test]
fn deposits_reach_the_free_balance_query() {
    let mut rng = StdRng::seed_from_u64(71);
    let network = test_network(&mut rng);
    let (mut a, a_bus) = test_engine(&mut rng, network);
    let (mut b, b_bus) = test_engine(&mut rng, network);
    let (alice, bob) = (a.address(), b.address());
    let multisig: Address = rng.gen();

    open_channel(&mut a, &mut b, &[a_bus, b_bus], multisig);
    deposit_both(&mut [&mut a, &mut b], multisig, alice, 1);
    deposit_both(&mut [&mut a, &mut b], multisig, bob, 1);

    for engine in [&a, &b] {
        let balances = engine.free_balance(multisig).unwrap();
        assert_eq!(balances[&alice], U256::from(1u64));
        assert_eq!(balances[&bob], U256::from(1u64));
    }
}

#[test]
fn install_then_uninstall_restores_the_free_balance() {
    let mut rng = StdRng::seed_from_u64(72);
    let network = test_network(&mut rng);
    let (mut a, a_bus) = test_engine(&mut rng, network);
    let (mut b, b_bus) = test_engine(&mut rng, network);
    let (alice, bob) = (a.address(), b.address());
    let multisig: Address = rng.gen();
    let buses = [a_bus, b_bus];

    open_channel(&mut a, &mut b, &buses, multisig);
    deposit_both(&mut [&mut a, &mut b], multisig, alice, 10);
    deposit_both(&mut [&mut a, &mut b], multisig, bob, 10);

    let params = install_params(&mut rng, alice, bob, multisig, &[(alice, 3), (bob, 2)]);
    let id = params.app_instance(1).identity_hash().unwrap();
    a.initiate(Protocol::Install, ProtocolParams::Install(params))
        .unwrap();
    pump(&mut [&mut a, &mut b], &buses);

    let installed = a.channel(multisig).unwrap().unwrap();
    assert_eq!(installed, b.channel(multisig).unwrap().unwrap());
    assert!(installed.has_app(id));
    assert_eq!(installed.num_installed_apps(), 2);
    let balances = a.free_balance(multisig).unwrap();
    assert_eq!(balances[&alice], U256::from(7u64));
    assert_eq!(balances[&bob], U256::from(8u64));

    a.initiate(
        Protocol::Uninstall,
        ProtocolParams::Uninstall(UninstallParams {
            initiating: alice,
            responding: bob,
            multisig,
            app_identity_hash: id,
            increments: [(alice, U256::from(3u64)), (bob, U256::from(2u64))]
                .into_iter()
                .collect(),
        }),
    )
    .unwrap();
    pump(&mut [&mut a, &mut b], &buses);

    let done = a.channel(multisig).unwrap().unwrap();
    assert_eq!(done, b.channel(multisig).unwrap().unwrap());
    assert!(!done.has_app(id));
    // The install slot stays used.
    assert_eq!(done.num_installed_apps(), 2);
    let balances = a.free_balance(multisig).unwrap();
    assert_eq!(balances[&alice], U256::from(10u64));
    assert_eq!(balances[&bob], U256::from(10u64));
}

#[test]
fn update_advances_the_app_one_version() {
    let mut rng = StdRng::seed_from_u64(73);
    let network = test_network(&mut rng);
    let (mut a, a_bus) = test_engine(&mut rng, network);
    let (mut b, b_bus) = test_engine(&mut rng, network);
    let (alice, bob) = (a.address(), b.address());
    let multisig: Address = rng.gen();
    let buses = [a_bus, b_bus];

    open_channel(&mut a, &mut b, &buses, multisig);
    deposit_both(&mut [&mut a, &mut b], multisig, alice, 5);
    deposit_both(&mut [&mut a, &mut b], multisig, bob, 5);

    let params = install_params(&mut rng, alice, bob, multisig, &[(alice, 1)]);
    let id = params.app_instance(1).identity_hash().unwrap();
    a.initiate(Protocol::Install, ProtocolParams::Install(params))
        .unwrap();
    pump(&mut [&mut a, &mut b], &buses);

    let new_state = AppState::Opaque(vec![0xaa; 32]);
    a.initiate(
        Protocol::Update,
        ProtocolParams::Update(UpdateParams {
            initiating: alice,
            responding: bob,
            multisig,
            app_identity_hash: id,
            action: None,
            new_state: new_state.clone(),
            timeout: 15,
        }),
    )
    .unwrap();
    pump(&mut [&mut a, &mut b], &buses);

    for engine in [&a, &b] {
        let channel = engine.channel(multisig).unwrap().unwrap();
        let app = channel.app(id).unwrap();
        assert_eq!(app.version_number(), 1);
        assert_eq!(app.timeout(), 15);
        assert_eq!(*app.state(), new_state);
    }
}

#[test]
fn tampered_signature_leaves_the_responder_untouched() {
    let mut rng = StdRng::seed_from_u64(74);
    let network = test_network(&mut rng);
    let (mut a, a_bus) = test_engine(&mut rng, network);
    let (mut b, _b_bus) = test_engine(&mut rng, network);
    let multisig: Address = rng.gen();

    let params = ProtocolParams::Setup(SetupParams {
        initiating: a.address(),
        responding: b.address(),
        multisig,
    });
    a.initiate(Protocol::Setup, params).unwrap();
    let m1 = a_bus.0.borrow_mut().pop_front().unwrap();

    let mut tampered = m1.clone();
    let mut sig = tampered.signature.unwrap();
    sig.0[10] ^= 0x01;
    tampered.signature = Some(sig);

    let err = b.handle_message(tampered).unwrap_err();
    assert!(matches!(err, ProtocolError::Signature(_)));
    // Nothing was committed and nothing is left in flight.
    assert!(b.channel(multisig).unwrap().is_none());

    // The untampered original still goes through cleanly.
    b.handle_message(m1).unwrap();
    assert!(b.channel(multisig).unwrap().is_some());
}

#[test]
fn busy_channels_reject_concurrent_work() {
    let mut rng = StdRng::seed_from_u64(75);
    let network = test_network(&mut rng);
    let (mut a, a_bus) = test_engine(&mut rng, network);
    let (mut b, b_bus) = test_engine(&mut rng, network);
    let (alice, bob) = (a.address(), b.address());
    let multisig: Address = rng.gen();
    let buses = [a_bus, b_bus];

    open_channel(&mut a, &mut b, &buses, multisig);
    deposit_both(&mut [&mut a, &mut b], multisig, alice, 5);

    // Park an install mid-handshake without delivering its message.
    let params = install_params(&mut rng, alice, bob, multisig, &[(alice, 1)]);
    let outcome = a
        .initiate(Protocol::Install, ProtocolParams::Install(params.clone()))
        .unwrap();
    assert!(matches!(outcome, Outcome::Suspended));

    let err = a.deposit(multisig, alice, U256::from(1u64)).unwrap_err();
    assert!(matches!(err, ProtocolError::ChannelBusy(addr) if addr == multisig));

    // A second run over the same correlation key is rejected outright.
    let err = a
        .initiate(Protocol::Install, ProtocolParams::Install(params))
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Validation(_)));

    // Delivering the parked message drains the handshake and frees the lock.
    pump(&mut [&mut a, &mut b], &buses);
    a.deposit(multisig, alice, U256::from(1u64)).unwrap();
}

#[test]
fn abandoning_a_suspended_run_leaves_the_store_unchanged() {
    let mut rng = StdRng::seed_from_u64(78);
    let network = test_network(&mut rng);
    let (mut a, a_bus) = test_engine(&mut rng, network);
    let (mut b, b_bus) = test_engine(&mut rng, network);
    let (alice, bob) = (a.address(), b.address());
    let multisig: Address = rng.gen();
    let buses = [a_bus.clone(), b_bus];

    open_channel(&mut a, &mut b, &buses, multisig);
    deposit_both(&mut [&mut a, &mut b], multisig, alice, 5);
    let before = a.channel(multisig).unwrap().unwrap();

    let params = install_params(&mut rng, alice, bob, multisig, &[(alice, 2)]);
    let outcome = a
        .initiate(Protocol::Install, ProtocolParams::Install(params))
        .unwrap();
    assert!(matches!(outcome, Outcome::Suspended));
    a_bus.0.borrow_mut().clear();

    a.abandon(CorrelationKey::Multisig(multisig)).unwrap();

    // The committed channel never saw the install and the lock is gone.
    assert_eq!(a.channel(multisig).unwrap().unwrap(), before);
    a.deposit(multisig, alice, U256::from(1u64)).unwrap();

    // Abandoning the same run twice is an error, not a no-op.
    assert!(matches!(
        a.abandon(CorrelationKey::Multisig(multisig)),
        Err(ProtocolError::Validation(_))
    ));
}

#[test]
fn crash_resume_completes_an_interrupted_handshake() {
    let mut rng = StdRng::seed_from_u64(76);
    let network = test_network(&mut rng);
    let dir = tempfile::tempdir().unwrap();
    let multisig: Address = rng.gen();

    let mut key_rng = StdRng::seed_from_u64(760);
    let a_bus = QueueBus::default();
    let mut a = Engine::new(
        Signer::new(&mut key_rng),
        network,
        a_bus.clone(),
        MemoryStore::new(),
        FileLog::new(dir.path()).unwrap(),
    );
    let (mut b, b_bus) = test_engine(&mut rng, network);

    let params = ProtocolParams::Setup(SetupParams {
        initiating: a.address(),
        responding: b.address(),
        multisig,
    });
    a.initiate(Protocol::Setup, params).unwrap();
    let m1 = a_bus.0.borrow_mut().pop_front().unwrap();
    b.handle_message(m1).unwrap();

    // Crash before the response arrives.
    let address = a.address();
    drop(a);

    // Restart with the same key and log directory; the store starts empty
    // because setup had not committed anything.
    let mut key_rng = StdRng::seed_from_u64(760);
    let a2_bus = QueueBus::default();
    let mut a2 = Engine::new(
        Signer::new(&mut key_rng),
        network,
        a2_bus,
        MemoryStore::new(),
        FileLog::new(dir.path()).unwrap(),
    );
    assert_eq!(a2.address(), address);
    let resumed = a2.resume_from_log().unwrap();
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0], CorrelationKey::Multisig(multisig));

    let m2 = b_bus.0.borrow_mut().pop_front().unwrap();
    let outcome = a2.handle_message(m2).unwrap();
    assert!(matches!(outcome, Outcome::Completed { .. }));

    // The rebuilt run reached the same channel value the counterparty holds,
    // and its log records are gone.
    assert_eq!(
        a2.channel(multisig).unwrap().unwrap(),
        b.channel(multisig).unwrap().unwrap()
    );
    let log = FileLog::new(dir.path()).unwrap();
    assert!(log.records(address).unwrap().is_empty());
}

#[test]
fn virtual_app_runs_through_the_intermediary() {
    let mut rng = StdRng::seed_from_u64(77);
    let network = test_network(&mut rng);
    let (mut alice, alice_bus) = test_engine(&mut rng, network);
    let (mut ingrid, ingrid_bus) = test_engine(&mut rng, network);
    let (mut bob, bob_bus) = test_engine(&mut rng, network);
    let (alice_addr, ingrid_addr, bob_addr) =
        (alice.address(), ingrid.address(), bob.address());
    let buses = [alice_bus, ingrid_bus, bob_bus];
    let left_multisig: Address = rng.gen();
    let right_multisig: Address = rng.gen();

    open_channel(&mut alice, &mut ingrid, &buses, left_multisig);
    open_channel(&mut bob, &mut ingrid, &buses, right_multisig);
    deposit_both(&mut [&mut alice, &mut ingrid], left_multisig, alice_addr, 5);
    deposit_both(&mut [&mut alice, &mut ingrid], left_multisig, ingrid_addr, 5);
    deposit_both(&mut [&mut bob, &mut ingrid], right_multisig, bob_addr, 5);
    deposit_both(&mut [&mut bob, &mut ingrid], right_multisig, ingrid_addr, 5);

    let params = InstallVirtualAppParams {
        initiating: alice_addr,
        responding: bob_addr,
        intermediary: ingrid_addr,
        signing_keys: vec![alice_addr, bob_addr],
        interface: test_app_interface(&mut rng),
        terms: test_terms(4),
        initial_state: AppState::Opaque(vec![0u8; 32]),
        default_timeout: 20,
        expiry: 500,
        capital: U256::from(4u64),
    };
    let target = params.target().unwrap();
    let final_state = AppState::Opaque(vec![0xbb; 32]);

    alice
        .initiate(
            Protocol::InstallVirtualApp,
            ProtocolParams::InstallVirtualApp(params),
        )
        .unwrap();
    pump(&mut [&mut alice, &mut ingrid, &mut bob], &buses);

    // Each multisig's two owners hold identical channel values; the app and
    // its agreement exist on both sides of the intermediary.
    let left = alice.channel(left_multisig).unwrap().unwrap();
    assert_eq!(left, ingrid.channel(left_multisig).unwrap().unwrap());
    let right = bob.channel(right_multisig).unwrap().unwrap();
    assert_eq!(right, ingrid.channel(right_multisig).unwrap().unwrap());
    for channel in [&left, &right] {
        let app = channel.app(target).unwrap();
        assert!(app.is_virtual());
        assert!(channel.virtual_agreement(target).is_ok());
    }
    // Each endpoint put up the app's capital in its own channel.
    assert_eq!(
        left.free_balance_state().unwrap().balance(alice_addr),
        U256::from(1u64)
    );
    assert_eq!(
        right.free_balance_state().unwrap().balance(bob_addr),
        U256::from(1u64)
    );

    alice
        .initiate(
            Protocol::UninstallVirtualApp,
            ProtocolParams::UninstallVirtualApp(UninstallVirtualAppParams {
                initiating: alice_addr,
                responding: bob_addr,
                intermediary: ingrid_addr,
                target,
                final_state_hash: final_state.hash().unwrap(),
                final_version_number: 3,
                lock_timeout: 10,
                left_increments: [
                    (alice_addr, U256::from(3u64)),
                    (ingrid_addr, U256::from(1u64)),
                ]
                .into_iter()
                .collect(),
                right_increments: [
                    (bob_addr, U256::from(1u64)),
                    (ingrid_addr, U256::from(3u64)),
                ]
                .into_iter()
                .collect(),
            }),
        )
        .unwrap();
    pump(&mut [&mut alice, &mut ingrid, &mut bob], &buses);

    let left = alice.channel(left_multisig).unwrap().unwrap();
    assert_eq!(left, ingrid.channel(left_multisig).unwrap().unwrap());
    let right = bob.channel(right_multisig).unwrap().unwrap();
    assert_eq!(right, ingrid.channel(right_multisig).unwrap().unwrap());
    for channel in [&left, &right] {
        assert!(!channel.has_app(target));
        assert!(channel.virtual_agreement(target).is_err());
        // The install slot stays used after settlement.
        assert_eq!(channel.num_installed_apps(), 2);
    }
    let balances = left.free_balance_state().unwrap();
    assert_eq!(balances.balance(alice_addr), U256::from(4u64));
    assert_eq!(balances.balance(ingrid_addr), U256::from(6u64));
    let balances = right.free_balance_state().unwrap();
    assert_eq!(balances.balance(bob_addr), U256::from(2u64));
    assert_eq!(balances.balance(ingrid_addr), U256::from(8u64));
}
