//! The wire unit exchanged between parties and the bus it travels on.
//!
//! The engine only produces and consumes [ProtocolMessage] values; moving
//! them between machines is the embedding application's job, through
//! whatever transport it likes. The json helpers define the one canonical
//! interchange format so independent implementations stay compatible.

use crate::abiencode::types::{Address, Hash, Signature};
use crate::messages::ProtocolParams;
use crate::protocol::Protocol;
use serde::{Deserialize, Serialize};

/// What a suspended handshake waits on. Virtual app protocols span three
/// parties and two multisigs, so they correlate on the app identity
/// instead of a channel address.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum CorrelationKey {
    Multisig(Address),
    VirtualApp(Hash),
}

/// One message of a handshake.
///
/// `seq` is the 1-based position within the handshake, negated when the
/// message flows toward the initiator, so a receiver can tell a fresh
/// handshake from a response without inspecting params. The signature
/// slots are filled per protocol step; which slot holds which commitment's
/// signature is fixed by the flow definitions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    pub protocol: Protocol,
    pub seq: i32,
    pub params: ProtocolParams,
    pub from: Address,
    pub to: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature2: Option<Signature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature3: Option<Signature>,
}

/// The key a handshake over `params` suspends and resumes on.
pub fn correlation_key(params: &ProtocolParams) -> Result<CorrelationKey, crate::abiencode::Error> {
    Ok(match params {
        ProtocolParams::Setup(p) => CorrelationKey::Multisig(p.multisig),
        ProtocolParams::Install(p) => CorrelationKey::Multisig(p.multisig),
        ProtocolParams::Uninstall(p) => CorrelationKey::Multisig(p.multisig),
        ProtocolParams::Update(p) => CorrelationKey::Multisig(p.multisig),
        ProtocolParams::InstallVirtualApp(p) => CorrelationKey::VirtualApp(p.target()?),
        ProtocolParams::UninstallVirtualApp(p) => CorrelationKey::VirtualApp(p.target),
    })
}

impl ProtocolMessage {
    pub fn correlation_key(&self) -> Result<CorrelationKey, crate::abiencode::Error> {
        correlation_key(&self.params)
    }
}

/// Outgoing edge of the engine. Implementations deliver the message to
/// `msg.to` however they see fit; delivery failures and retries are theirs
/// to handle, the engine never re-sends on its own.
pub trait MessageBus {
    fn send(&self, msg: &ProtocolMessage);
}

/// Encode a message in the canonical json interchange format.
pub fn to_json(msg: &ProtocolMessage) -> serde_json::Result<String> {
    serde_json::to_string(msg)
}

/// Decode a message from the canonical json interchange format.
pub fn from_json(raw: &str) -> serde_json::Result<ProtocolMessage> {
    serde_json::from_str(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::SetupParams;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn json_round_trip() {
        let mut rng = StdRng::seed_from_u64(50);
        let msg = ProtocolMessage {
            protocol: Protocol::Setup,
            seq: 1,
            params: ProtocolParams::Setup(SetupParams {
                initiating: rng.gen(),
                responding: rng.gen(),
                multisig: rng.gen(),
            }),
            from: rng.gen(),
            to: rng.gen(),
            signature: None,
            signature2: None,
            signature3: None,
        };

        let raw = to_json(&msg).unwrap();
        let back = from_json(&raw).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn responses_correlate_with_their_request() {
        let mut rng = StdRng::seed_from_u64(51);
        let multisig: Address = rng.gen();
        let params = ProtocolParams::Setup(SetupParams {
            initiating: rng.gen(),
            responding: rng.gen(),
            multisig,
        });

        let request = ProtocolMessage {
            protocol: Protocol::Setup,
            seq: 1,
            params: params.clone(),
            from: rng.gen(),
            to: rng.gen(),
            signature: None,
            signature2: None,
            signature3: None,
        };
        let mut response = request.clone();
        response.seq = -2;

        assert_eq!(
            request.correlation_key().unwrap(),
            response.correlation_key().unwrap()
        );
        assert_eq!(
            request.correlation_key().unwrap(),
            CorrelationKey::Multisig(multisig)
        );
    }
}
