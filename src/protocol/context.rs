use super::{Protocol, ProtocolError, Role};
use crate::abiencode::types::{Address, Hash, Signature};
use crate::channel::StateChannel;
use crate::commitment::{Commitment, SignedCommitment};
use crate::messages::{
    InstallParams, InstallVirtualAppParams, ProtocolParams, SetupParams, UninstallParams,
    UninstallVirtualAppParams, UpdateParams,
};
use crate::network::NetworkContext;
use crate::sig;
use crate::wire::ProtocolMessage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a collected signature authorizes. One handshake can carry several
/// commitments (a conditional transfer plus the free balance update paying
/// for it, or the two sides of a virtual app), so signatures are filed
/// under the commitment they belong to.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommitmentPurpose {
    Setup,
    FreeBalanceUpdate,
    ConditionalTransfer,
    AppSetState,
    VirtualAppSetState,
    LeftAgreement,
    RightAgreement,
    LeftSettlement,
    RightSettlement,
}

/// A commitment under construction plus every signature collected for it,
/// keyed by signer. The map's address order is the canonical aggregation
/// order, so nothing downstream depends on arrival order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PendingCommitment {
    pub purpose: CommitmentPurpose,
    pub commitment: Commitment,
    pub signatures: BTreeMap<Address, Signature>,
}

impl PendingCommitment {
    pub fn digest(&self) -> Result<Hash, crate::abiencode::Error> {
        self.commitment.hash_to_sign()
    }

    pub fn signed(&self) -> SignedCommitment {
        SignedCommitment {
            commitment: self.commitment.clone(),
            signatures: self.signatures.clone(),
        }
    }
}

/// Working state of one protocol run.
///
/// Holds copies of every channel the run touches; the store is only
/// written at the commit instruction. Serializable as a whole so the
/// write-ahead log can reconstruct a run exactly as it was after any step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Context {
    pub protocol: Protocol,
    pub role: Role,
    pub params: ProtocolParams,
    pub our_address: Address,
    pub network: NetworkContext,
    /// Working copies, keyed by multisig address.
    pub channels: BTreeMap<Address, StateChannel>,
    pub commitments: Vec<PendingCommitment>,
    /// Received messages, oldest first. The last one is the message the
    /// current step is reacting to.
    pub inbox: Vec<ProtocolMessage>,
    /// Messages queued for the next send instruction.
    pub outbox: Vec<ProtocolMessage>,
    /// Identity hash of the app this run creates or tears down, for event
    /// reporting.
    pub target_app: Option<Hash>,
}

impl Context {
    pub fn new(
        protocol: Protocol,
        role: Role,
        params: ProtocolParams,
        our_address: Address,
        network: NetworkContext,
    ) -> Self {
        Context {
            protocol,
            role,
            params,
            our_address,
            network,
            channels: BTreeMap::new(),
            commitments: Vec::new(),
            inbox: Vec::new(),
            outbox: Vec::new(),
            target_app: None,
        }
    }

    pub fn channel(&self, multisig: Address) -> Result<&StateChannel, ProtocolError> {
        self.channels
            .get(&multisig)
            .ok_or(ProtocolError::ChannelNotFound(multisig))
    }

    pub fn channel_by_owners(
        &self,
        a: Address,
        b: Address,
    ) -> Result<&StateChannel, ProtocolError> {
        let mut owners = [a, b];
        owners.sort();
        self.channels
            .values()
            .find(|channel| channel.multisig_owners() == owners.as_slice())
            .ok_or(ProtocolError::ChannelNotFoundByOwners(a, b))
    }

    /// Insert or replace a working copy.
    pub fn put_channel(&mut self, channel: StateChannel) {
        self.channels.insert(channel.multisig_address(), channel);
    }

    /// Every multisig this run needs exclusive access to. Derivable from
    /// the context alone so a replayed run re-locks the same set.
    pub fn lock_addresses(&self) -> Vec<Address> {
        let mut addresses: std::collections::BTreeSet<Address> =
            self.channels.keys().copied().collect();
        match &self.params {
            ProtocolParams::Setup(p) => {
                addresses.insert(p.multisig);
            }
            ProtocolParams::Install(p) => {
                addresses.insert(p.multisig);
            }
            ProtocolParams::Uninstall(p) => {
                addresses.insert(p.multisig);
            }
            ProtocolParams::Update(p) => {
                addresses.insert(p.multisig);
            }
            // Three-party runs touch exactly the channels the engine
            // resolved into the context.
            ProtocolParams::InstallVirtualApp(_) | ProtocolParams::UninstallVirtualApp(_) => {}
        }
        addresses.into_iter().collect()
    }

    /// The message that resumed or started this run, checked against the
    /// sequence number this script position requires.
    pub fn expect_message(&self, seq: i32) -> Result<&ProtocolMessage, ProtocolError> {
        let msg = self
            .inbox
            .last()
            .ok_or_else(|| ProtocolError::Validation("no message to process".into()))?;
        if msg.protocol != self.protocol {
            return Err(ProtocolError::Aborted(format!(
                "expected a {:?} message, got {:?}",
                self.protocol, msg.protocol
            )));
        }
        if msg.seq != seq {
            return Err(ProtocolError::Aborted(format!(
                "expected message {}, got {}",
                seq, msg.seq
            )));
        }
        Ok(msg)
    }

    /// Compose an outgoing message; the signature slots are positional per
    /// flow definition.
    pub fn compose(&self, seq: i32, to: Address, sigs: [Option<Signature>; 3]) -> ProtocolMessage {
        ProtocolMessage {
            protocol: self.protocol,
            seq,
            params: self.params.clone(),
            from: self.our_address,
            to,
            signature: sigs[0],
            signature2: sigs[1],
            signature3: sigs[2],
        }
    }

    pub fn send(&mut self, msg: ProtocolMessage) {
        self.outbox.push(msg);
    }

    pub fn push_commitment(&mut self, purpose: CommitmentPurpose, commitment: Commitment) {
        self.commitments.push(PendingCommitment {
            purpose,
            commitment,
            signatures: BTreeMap::new(),
        });
    }

    pub fn commitment(&self, purpose: CommitmentPurpose) -> Result<&PendingCommitment, ProtocolError> {
        self.commitments
            .iter()
            .find(|pending| pending.purpose == purpose)
            .ok_or(ProtocolError::Signature(
                crate::sig::SignatureError::MissingCommitment,
            ))
    }

    fn commitment_mut(
        &mut self,
        purpose: CommitmentPurpose,
    ) -> Option<&mut PendingCommitment> {
        self.commitments
            .iter_mut()
            .find(|pending| pending.purpose == purpose)
    }

    /// Validate a counterparty signature against a pending commitment and
    /// file it on success. The single checkpoint every flow goes through
    /// when a message arrives.
    pub fn validate_commitment_signature(
        &mut self,
        purpose: CommitmentPurpose,
        expected_signer: Address,
        signature: Option<&Signature>,
    ) -> Result<(), ProtocolError> {
        let digest = match self.commitments.iter().find(|p| p.purpose == purpose) {
            Some(pending) => Some(pending.digest()?),
            None => None,
        };
        sig::validate_signature(expected_signer, digest, signature)?;
        let signature = *signature.expect("validate_signature checked presence");
        let pending = self
            .commitment_mut(purpose)
            .expect("validate_signature checked presence");
        pending.signatures.insert(expected_signer, signature);
        Ok(())
    }

    /// A signature previously filed for `purpose`, ours or a relayed one.
    pub fn signature_of(
        &self,
        purpose: CommitmentPurpose,
        signer: Address,
    ) -> Result<Signature, ProtocolError> {
        self.commitment(purpose)?
            .signatures
            .get(&signer)
            .copied()
            .ok_or_else(|| {
                ProtocolError::Validation(format!("no signature by {} collected yet", signer))
            })
    }

    pub fn our_signature(&self, purpose: CommitmentPurpose) -> Result<Signature, ProtocolError> {
        self.signature_of(purpose, self.our_address)
    }

    fn params_mismatch(&self) -> ProtocolError {
        ProtocolError::Validation(format!(
            "params do not match protocol {:?}",
            self.protocol
        ))
    }

    pub fn setup_params(&self) -> Result<&SetupParams, ProtocolError> {
        match &self.params {
            ProtocolParams::Setup(p) => Ok(p),
            _ => Err(self.params_mismatch()),
        }
    }

    pub fn install_params(&self) -> Result<&InstallParams, ProtocolError> {
        match &self.params {
            ProtocolParams::Install(p) => Ok(p),
            _ => Err(self.params_mismatch()),
        }
    }

    pub fn uninstall_params(&self) -> Result<&UninstallParams, ProtocolError> {
        match &self.params {
            ProtocolParams::Uninstall(p) => Ok(p),
            _ => Err(self.params_mismatch()),
        }
    }

    pub fn update_params(&self) -> Result<&UpdateParams, ProtocolError> {
        match &self.params {
            ProtocolParams::Update(p) => Ok(p),
            _ => Err(self.params_mismatch()),
        }
    }

    pub fn install_virtual_params(&self) -> Result<&InstallVirtualAppParams, ProtocolError> {
        match &self.params {
            ProtocolParams::InstallVirtualApp(p) => Ok(p),
            _ => Err(self.params_mismatch()),
        }
    }

    pub fn uninstall_virtual_params(&self) -> Result<&UninstallVirtualAppParams, ProtocolError> {
        match &self.params {
            ProtocolParams::UninstallVirtualApp(p) => Ok(p),
            _ => Err(self.params_mismatch()),
        }
    }
}
