//! The protocol execution engine: one interpreter instance per party.
//!
//! The engine walks the role's instruction script, executing pure
//! transition steps and the five opcodes. A run suspends only at
//! [Opcode::IoSendAndWait]; the suspended continuation (program counter
//! plus context) is parked under its correlation key and picked back up by
//! [Engine::handle_message]. Every executed instruction is logged to the
//! write-ahead log first thing after it takes effect, so
//! [Engine::resume_from_log] can rebuild any run a crash interrupted.
//!
//! Channel access is serialized per multisig through a lock set: a second
//! run touching a busy channel fails with [ProtocolError::ChannelBusy]
//! instead of racing version numbers. Failures anywhere discard the run's
//! working copies and log records; the store only ever sees the commit
//! instruction's output.

use crate::abiencode::types::{Address, Hash, U256};
use crate::channel::StateChannel;
use crate::commitment::{Commitment, SignedCommitment, WithdrawCommitment};
use crate::events::Event;
use crate::messages::ProtocolParams;
use crate::network::NetworkContext;
use crate::protocol::{
    self, Context, Instruction, Opcode, Protocol, ProtocolError, Role,
};
use crate::sig::Signer;
use crate::store::ChannelStore;
use crate::wal::{self, ProtocolLog, WalRecord};
use crate::wire::{correlation_key, CorrelationKey, MessageBus, ProtocolMessage};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};

#[cfg(test)]
mod tests;

/// What a request produced: either the run finished and these are the
/// committed channel values, or it parked waiting for the counterparty.
#[derive(Debug)]
pub enum Outcome {
    Suspended,
    Completed { channels: Vec<StateChannel> },
}

enum StepOutcome {
    Continue,
    Suspend,
}

/// A run in flight: the next instruction and everything it operates on.
struct Execution {
    pc: usize,
    committed: bool,
    locks: Vec<Address>,
    context: Context,
}

pub struct Engine<B: MessageBus, S: ChannelStore, L: ProtocolLog> {
    signer: Signer,
    network: NetworkContext,
    bus: B,
    store: S,
    wal: L,
    executions: BTreeMap<CorrelationKey, Execution>,
    locked: BTreeSet<Address>,
    subscribers: Vec<Box<dyn Fn(&Event)>>,
}

impl<B: MessageBus, S: ChannelStore, L: ProtocolLog> Engine<B, S, L> {
    pub fn new(signer: Signer, network: NetworkContext, bus: B, store: S, wal: L) -> Self {
        Engine {
            signer,
            network,
            bus,
            store,
            wal,
            executions: BTreeMap::new(),
            locked: BTreeSet::new(),
            subscribers: Vec::new(),
        }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn network(&self) -> &NetworkContext {
        &self.network
    }

    /// Register an event handler. Handlers run synchronously right after
    /// the store commit they report.
    pub fn subscribe(&mut self, handler: impl Fn(&Event) + 'static) {
        self.subscribers.push(Box::new(handler));
    }

    fn emit(&self, event: Event) {
        for handler in &self.subscribers {
            handler(&event);
        }
    }

    /// Start a handshake as its initiator.
    pub fn initiate(
        &mut self,
        protocol: Protocol,
        params: ProtocolParams,
    ) -> Result<Outcome, ProtocolError> {
        if params.initiating() != self.signer.address() {
            return Err(ProtocolError::Validation(
                "initiating address does not match this engine's key".into(),
            ));
        }
        let correlation = correlation_key(&params)?;
        if self.executions.contains_key(&correlation) {
            return Err(ProtocolError::Validation(
                "a handshake with this correlation key is already in flight".into(),
            ));
        }
        debug!("initiating {:?} as {}", protocol, self.signer.address());
        self.start(protocol, Role::Initiator, params, Vec::new(), correlation)
    }

    /// Feed one received message in; resumes the matching suspended run or
    /// starts a responder/intermediary run for a fresh handshake.
    pub fn handle_message(&mut self, msg: ProtocolMessage) -> Result<Outcome, ProtocolError> {
        if msg.to != self.signer.address() {
            return Err(ProtocolError::Validation(format!(
                "message addressed to {}, we are {}",
                msg.to,
                self.signer.address()
            )));
        }
        let correlation = msg.correlation_key()?;

        if let Some(mut execution) = self.executions.remove(&correlation) {
            debug!(
                "resuming {:?} at step {} on message {}",
                execution.context.protocol, execution.pc, msg.seq
            );
            execution.context.inbox.push(msg);
            return self.run(correlation, execution);
        }

        let role = protocol::role_for_incoming(msg.protocol, msg.seq).ok_or_else(|| {
            ProtocolError::Aborted(format!(
                "message {} of {:?} does not match any run in flight",
                msg.seq, msg.protocol
            ))
        })?;
        self.emit(Event::ProposalReceived {
            protocol: msg.protocol,
            params: msg.params.clone(),
            from: msg.from,
        });
        let (protocol, params) = (msg.protocol, msg.params.clone());
        self.start(protocol, role, params, vec![msg], correlation)
    }

    /// Rebuild every interrupted run from the write-ahead log. Runs that
    /// were parked waiting for a message go back to waiting; runs that
    /// died mid-step re-execute from their last logged state. Returns the
    /// correlation keys that were brought back.
    pub fn resume_from_log(&mut self) -> Result<Vec<CorrelationKey>, ProtocolError> {
        let records = self.wal.records(self.signer.address())?;
        let latest = wal::latest_per_handshake(records);
        let mut resumed = Vec::new();
        for (correlation, record) in latest {
            info!(
                "resuming {:?} ({:?}) from log at step {}",
                record.protocol, record.role, record.pc
            );
            let locks = record.context.lock_addresses();
            for address in &locks {
                self.locked.insert(*address);
            }
            let execution = Execution {
                pc: record.pc,
                committed: false,
                locks,
                context: record.context,
            };
            if record.waiting {
                self.executions.insert(correlation, execution);
            } else if let Err(e) = self.run(correlation, execution) {
                warn!("replayed run {:?} failed: {}", correlation, e);
                continue;
            }
            resumed.push(correlation);
        }
        Ok(resumed)
    }

    fn start(
        &mut self,
        protocol: Protocol,
        role: Role,
        params: ProtocolParams,
        inbox: Vec<ProtocolMessage>,
        correlation: CorrelationKey,
    ) -> Result<Outcome, ProtocolError> {
        let mut context = Context::new(protocol, role, params, self.signer.address(), self.network);
        context.inbox = inbox;
        self.load_channels(&mut context)?;

        let locks = context.lock_addresses();
        for address in &locks {
            if self.locked.contains(address) {
                return Err(ProtocolError::ChannelBusy(*address));
            }
        }
        for address in &locks {
            self.locked.insert(*address);
        }

        self.run(
            correlation,
            Execution {
                pc: 0,
                committed: false,
                locks,
                context,
            },
        )
    }

    /// Resolve the channels this run works on into its context.
    fn load_channels(&self, context: &mut Context) -> Result<(), ProtocolError> {
        match context.params.clone() {
            ProtocolParams::Setup(p) => {
                if self.store.load(p.multisig)?.is_some() {
                    return Err(ProtocolError::ChannelExists(p.multisig));
                }
            }
            ProtocolParams::Install(p) => {
                let channel = self
                    .store
                    .load(p.multisig)?
                    .ok_or(ProtocolError::ChannelNotFound(p.multisig))?;
                context.put_channel(channel);
            }
            ProtocolParams::Uninstall(p) => {
                let channel = self
                    .store
                    .load(p.multisig)?
                    .ok_or(ProtocolError::ChannelNotFound(p.multisig))?;
                context.put_channel(channel);
            }
            ProtocolParams::Update(p) => {
                let channel = self
                    .store
                    .load(p.multisig)?
                    .ok_or(ProtocolError::ChannelNotFound(p.multisig))?;
                context.put_channel(channel);
            }
            ProtocolParams::InstallVirtualApp(p) => {
                self.load_endpoint_channels(
                    context,
                    p.initiating,
                    p.responding,
                    p.intermediary,
                )?;
            }
            ProtocolParams::UninstallVirtualApp(p) => {
                self.load_endpoint_channels(
                    context,
                    p.initiating,
                    p.responding,
                    p.intermediary,
                )?;
            }
        }
        Ok(())
    }

    fn load_endpoint_channels(
        &self,
        context: &mut Context,
        initiating: Address,
        responding: Address,
        intermediary: Address,
    ) -> Result<(), ProtocolError> {
        let mut load_pair = |a: Address, b: Address| -> Result<StateChannel, ProtocolError> {
            self.store
                .find_by_owners(a, b)?
                .ok_or(ProtocolError::ChannelNotFoundByOwners(a, b))
        };
        match context.role {
            Role::Initiator => {
                let left = load_pair(initiating, intermediary)?;
                context.put_channel(left);
            }
            Role::Responder => {
                let right = load_pair(responding, intermediary)?;
                context.put_channel(right);
            }
            Role::Intermediary => {
                let left = load_pair(initiating, intermediary)?;
                let right = load_pair(responding, intermediary)?;
                context.put_channel(left);
                context.put_channel(right);
            }
        }
        Ok(())
    }

    fn run(
        &mut self,
        correlation: CorrelationKey,
        mut execution: Execution,
    ) -> Result<Outcome, ProtocolError> {
        let script = protocol::script(execution.context.protocol, execution.context.role)?;
        loop {
            if execution.pc >= script.len() {
                self.release(&execution.locks);
                info!(
                    "{:?} completed as {:?}",
                    execution.context.protocol, execution.context.role
                );
                return Ok(Outcome::Completed {
                    channels: execution.context.channels.values().cloned().collect(),
                });
            }

            let pc = execution.pc;
            match self.step(&mut execution, &script[pc], correlation) {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::Suspend) => {
                    debug!(
                        "{:?} suspended at step {} waiting on {:?}",
                        execution.context.protocol, execution.pc, correlation
                    );
                    self.executions.insert(correlation, execution);
                    return Ok(Outcome::Suspended);
                }
                Err(e) => {
                    warn!(
                        "{:?} aborted as {:?} at step {}: {}",
                        execution.context.protocol, execution.context.role, execution.pc, e
                    );
                    self.release(&execution.locks);
                    if let Err(log_err) = self.wal.clear(self.signer.address(), &correlation) {
                        warn!("could not clear log for aborted run: {}", log_err);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Execute one instruction and log its effect.
    fn step(
        &mut self,
        execution: &mut Execution,
        instruction: &Instruction,
        correlation: CorrelationKey,
    ) -> Result<StepOutcome, ProtocolError> {
        let mut suspend = false;
        match instruction {
            Instruction::Transition(step) => step(&mut execution.context)?,
            Instruction::Op(Opcode::OpSign) => {
                if execution.context.role == Role::Intermediary {
                    return Err(ProtocolError::Validation(
                        "the intermediary signs through its own opcode".into(),
                    ));
                }
                self.sign_pending(&mut execution.context)?;
            }
            Instruction::Op(Opcode::OpSignAsIntermediary) => {
                if execution.context.role != Role::Intermediary {
                    return Err(ProtocolError::Validation(
                        "only the intermediary signs through this opcode".into(),
                    ));
                }
                self.sign_pending(&mut execution.context)?;
            }
            Instruction::Op(Opcode::IoSend) => self.send_head(&mut execution.context)?,
            Instruction::Op(Opcode::IoSendAndWait) => {
                self.send_head(&mut execution.context)?;
                suspend = true;
            }
            Instruction::Op(Opcode::StateTransitionCommit) => {
                self.commit(&execution.context, correlation)?;
                self.release(&execution.locks);
                execution.committed = true;
            }
        }

        execution.pc += 1;
        if !execution.committed {
            self.wal.append(
                self.signer.address(),
                &WalRecord {
                    correlation,
                    protocol: execution.context.protocol,
                    role: execution.context.role,
                    pc: execution.pc,
                    waiting: suspend,
                    context: execution.context.clone(),
                },
            )?;
        }

        Ok(if suspend {
            StepOutcome::Suspend
        } else {
            StepOutcome::Continue
        })
    }

    /// Sign every pending commitment we have not signed yet.
    fn sign_pending(&self, context: &mut Context) -> Result<(), ProtocolError> {
        let our_address = self.signer.address();
        for pending in &mut context.commitments {
            if pending.signatures.contains_key(&our_address) {
                continue;
            }
            let digest = pending.digest()?;
            let sig = self.signer.sign_eth(digest)?;
            pending.signatures.insert(our_address, sig);
        }
        Ok(())
    }

    fn send_head(&self, context: &mut Context) -> Result<(), ProtocolError> {
        if context.outbox.is_empty() {
            return Err(ProtocolError::Validation(
                "outbox is empty at a send instruction".into(),
            ));
        }
        let msg = context.outbox.remove(0);
        debug!(
            "sending {:?} message {} to {}",
            msg.protocol, msg.seq, msg.to
        );
        self.bus.send(&msg);
        Ok(())
    }

    /// Atomically replace the stored channels with the working copies,
    /// persist the collected commitments and drop the run's log records.
    fn commit(
        &mut self,
        context: &Context,
        correlation: CorrelationKey,
    ) -> Result<(), ProtocolError> {
        for channel in context.channels.values() {
            self.store.save(channel)?;
        }
        for pending in &context.commitments {
            self.store.save_commitment(&pending.signed())?;
        }
        self.wal.clear(self.signer.address(), &correlation)?;
        info!(
            "{:?} committed {} channel(s), {} commitment(s)",
            context.protocol,
            context.channels.len(),
            context.commitments.len()
        );

        for event in Self::commit_events(context) {
            self.emit(event);
        }
        Ok(())
    }

    fn commit_events(context: &Context) -> Vec<Event> {
        let mut events = Vec::new();
        for channel in context.channels.values() {
            match context.protocol {
                Protocol::Setup => events.push(Event::ChannelCreated {
                    channel: channel.clone(),
                }),
                Protocol::Install | Protocol::InstallVirtualApp => {
                    if let Some(id) = context.target_app {
                        events.push(Event::InstallCompleted {
                            channel: channel.clone(),
                            app_identity_hash: id,
                        });
                    }
                }
                Protocol::Uninstall | Protocol::UninstallVirtualApp => {
                    if let Some(id) = context.target_app {
                        events.push(Event::UninstallCompleted {
                            channel: channel.clone(),
                            app_identity_hash: id,
                        });
                    }
                }
                Protocol::Update => {
                    if let Some(id) = context.target_app {
                        if let Ok(app) = channel.app(id) {
                            events.push(Event::UpdateApplied {
                                channel: channel.clone(),
                                app_identity_hash: id,
                                version_number: app.version_number(),
                            });
                        }
                    }
                }
            }
        }
        events
    }

    fn release(&mut self, locks: &[Address]) {
        for address in locks {
            self.locked.remove(address);
        }
    }

    /// Drop a suspended run without committing anything. The working
    /// copies and log records are discarded and the channel locks
    /// released, so the store ends up exactly as it was before the run
    /// started. What the counterparty does with the stalled handshake is
    /// the transport layer's policy.
    pub fn abandon(&mut self, correlation: CorrelationKey) -> Result<(), ProtocolError> {
        let execution = self.executions.remove(&correlation).ok_or_else(|| {
            ProtocolError::Validation(format!("no suspended run for {:?}", correlation))
        })?;
        self.release(&execution.locks);
        self.wal.clear(self.signer.address(), &correlation)?;
        info!(
            "{:?} abandoned as {:?} at step {}",
            execution.context.protocol, execution.context.role, execution.pc
        );
        Ok(())
    }

    /// Credit a confirmed on-chain deposit. Outside the handshake
    /// machinery: the chain already enforced it, the store just follows.
    pub fn deposit(
        &mut self,
        multisig: Address,
        party: Address,
        amount: U256,
    ) -> Result<StateChannel, ProtocolError> {
        if self.locked.contains(&multisig) {
            return Err(ProtocolError::ChannelBusy(multisig));
        }
        let channel = self
            .store
            .load(multisig)?
            .ok_or(ProtocolError::ChannelNotFound(multisig))?;
        if !channel.multisig_owners().contains(&party) {
            return Err(ProtocolError::Validation(format!(
                "{} does not own channel {}",
                party, multisig
            )));
        }
        let next = channel.deposit(party, amount)?;
        self.store.save(&next)?;
        self.emit(Event::DepositConfirmed {
            channel: next.clone(),
            party,
            amount,
        });
        Ok(next)
    }

    /// Release free balance for an on-chain withdrawal and produce the
    /// commitment authorizing it, signed by this party.
    pub fn withdraw(
        &mut self,
        multisig: Address,
        amount: U256,
        recipient: Address,
    ) -> Result<(StateChannel, SignedCommitment), ProtocolError> {
        if self.locked.contains(&multisig) {
            return Err(ProtocolError::ChannelBusy(multisig));
        }
        let channel = self
            .store
            .load(multisig)?
            .ok_or(ProtocolError::ChannelNotFound(multisig))?;
        let party = self.signer.address();
        if !channel.multisig_owners().contains(&party) {
            return Err(ProtocolError::Validation(format!(
                "{} does not own channel {}",
                party, multisig
            )));
        }
        let next = channel.withdraw(party, amount)?;

        let commitment = Commitment::Withdraw(WithdrawCommitment {
            multisig,
            multisig_owners: next.multisig_owners().to_vec(),
            recipient,
            amount,
        });
        let digest = commitment.hash_to_sign()?;
        let sig = self.signer.sign_eth(digest)?;
        let mut signatures = BTreeMap::new();
        signatures.insert(party, sig);
        let signed = SignedCommitment {
            commitment,
            signatures,
        };

        self.store.save_commitment(&signed)?;
        self.store.save(&next)?;
        info!("withdraw of {} from {} prepared", amount, multisig);
        Ok((next, signed))
    }

    /// The committed free balance map of one channel.
    pub fn free_balance(
        &self,
        multisig: Address,
    ) -> Result<BTreeMap<Address, U256>, ProtocolError> {
        let channel = self
            .store
            .load(multisig)?
            .ok_or(ProtocolError::ChannelNotFound(multisig))?;
        Ok(channel.free_balance_state()?.balances().clone())
    }

    /// The committed channel value, if any.
    pub fn channel(&self, multisig: Address) -> Result<Option<StateChannel>, ProtocolError> {
        Ok(self.store.load(multisig)?)
    }

    /// A persisted commitment by its signing digest.
    pub fn stored_commitment(
        &self,
        digest: Hash,
    ) -> Result<Option<SignedCommitment>, ProtocolError> {
        Ok(self.store.commitment(digest)?)
    }
}
