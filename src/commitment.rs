//! Typed commitment builders.
//!
//! A commitment is the off-chain artifact one handshake step produces: the
//! digest every required party signs, plus the on-chain transaction those
//! signatures authorize if anyone ever has to go to chain. Construction is
//! pure; nothing here reads the store or the network.
//!
//! Two digest families exist. Multisig commitments (setup, conditional
//! transfer, agreement, withdraw) are authorized by the multisig owners and
//! hash the transaction the multisig would execute. Set-state commitments
//! are authorized by an app's signing keys and hash the app state advance
//! the registry would accept in a dispute.

use crate::abiencode::{
    self, keccak256, selector,
    types::{Address, Bytes, Hash, Signature, U256},
    PackedEncoder,
};
use crate::channel::{Terms, TermsEncoding};
use crate::network::NetworkContext;
use crate::sig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How the multisig executes the transaction payload.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum MultisigOperation {
    Call,
    DelegateCall,
}

impl MultisigOperation {
    fn as_u8(self) -> u8 {
        match self {
            MultisigOperation::Call => 0,
            MultisigOperation::DelegateCall => 1,
        }
    }
}

/// The transaction a fully signed commitment submits to chain.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MultisigTransaction {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub operation: MultisigOperation,
}

/// Digest the multisig owners sign to authorize `tx` from `multisig`.
///
/// Packed over a fixed prefix byte, the padded owner list, the target call
/// and the hash of its data, so no two channels or calls ever share a
/// digest.
fn multisig_tx_hash(multisig: Address, owners: &[Address], tx: &MultisigTransaction) -> Hash {
    let mut packed = PackedEncoder::new().push_u8(0x19).push_address(multisig);
    for owner in owners {
        packed = packed.push_address_word(*owner);
    }
    packed
        .push_address(tx.to)
        .push_u256(tx.value)
        .push_hash(keccak256(&tx.data.0))
        .push_u8(tx.operation.as_u8())
        .hash()
}

/// Authorizes installing the initial free balance behind the multisig.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SetupCommitment {
    pub network: NetworkContext,
    pub multisig: Address,
    pub multisig_owners: Vec<Address>,
    pub free_balance_id: Hash,
    pub free_balance_terms: Terms,
}

#[derive(Serialize)]
struct SetupCall {
    registry: Address,
    app_identity_hash: Hash,
    terms: TermsEncoding,
}

impl SetupCommitment {
    fn transaction_payload(&self) -> Result<MultisigTransaction, abiencode::Error> {
        let mut data =
            selector("executeAppConditionalTransaction(address,bytes32,(uint8,uint256,address))")
                .to_vec();
        data.extend(abiencode::to_fnargs_bytes(&SetupCall {
            registry: self.network.app_registry,
            app_identity_hash: self.free_balance_id,
            terms: self.free_balance_terms.encodable(),
        })?);
        Ok(MultisigTransaction {
            to: self.network.conditional_transaction,
            value: U256::zero(),
            data: Bytes(data),
            operation: MultisigOperation::DelegateCall,
        })
    }
}

/// Authorizes advancing an app to a specific state version in the registry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SetStateCommitment {
    pub network: NetworkContext,
    pub app_identity_hash: Hash,
    pub state_hash: Hash,
    pub version_number: u64,
    pub timeout: u64,
}

#[derive(Serialize)]
struct SetStateCall {
    app_identity_hash: Hash,
    state_hash: Hash,
    version_number: u64,
    timeout: u64,
    signatures: Bytes,
}

impl SetStateCommitment {
    fn digest(&self) -> Hash {
        PackedEncoder::new()
            .push_u8(0x19)
            .push_hash(self.app_identity_hash)
            .push_u256(U256::from(self.version_number))
            .push_u256(U256::from(self.timeout))
            .push_hash(self.state_hash)
            .hash()
    }

    fn transaction_payload(
        &self,
        signatures: &BTreeMap<Address, Signature>,
    ) -> Result<MultisigTransaction, abiencode::Error> {
        let mut data = selector("setState(bytes32,bytes32,uint256,uint256,bytes)").to_vec();
        data.extend(abiencode::to_fnargs_bytes(&SetStateCall {
            app_identity_hash: self.app_identity_hash,
            state_hash: self.state_hash,
            version_number: self.version_number,
            timeout: self.timeout,
            signatures: Bytes(sig::concat_canonical(signatures)),
        })?);
        Ok(MultisigTransaction {
            to: self.network.app_registry,
            value: U256::zero(),
            data: Bytes(data),
            operation: MultisigOperation::Call,
        })
    }
}

/// Authorizes the conditional transfer that funds a newly installed app
/// from the free balance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConditionalTransferCommitment {
    pub network: NetworkContext,
    pub multisig: Address,
    pub multisig_owners: Vec<Address>,
    pub app_identity_hash: Hash,
    pub free_balance_id: Hash,
    /// Salt deriving the dependency nonce that ties this transfer to the
    /// app's install slot.
    pub dependency_nonce_salt: Hash,
    pub terms: Terms,
}

#[derive(Serialize)]
struct ConditionalTransferCall {
    registry: Address,
    app_identity_hash: Hash,
    free_balance_id: Hash,
    dependency_nonce_salt: Hash,
    terms: TermsEncoding,
}

impl ConditionalTransferCommitment {
    fn transaction_payload(&self) -> Result<MultisigTransaction, abiencode::Error> {
        let mut data = selector(
            "executeAppConditionalTransaction(address,bytes32,bytes32,bytes32,(uint8,uint256,address))",
        )
        .to_vec();
        data.extend(abiencode::to_fnargs_bytes(&ConditionalTransferCall {
            registry: self.network.app_registry,
            app_identity_hash: self.app_identity_hash,
            free_balance_id: self.free_balance_id,
            dependency_nonce_salt: self.dependency_nonce_salt,
            terms: self.terms.encodable(),
        })?);
        Ok(MultisigTransaction {
            to: self.network.conditional_transaction,
            value: U256::zero(),
            data: Bytes(data),
            operation: MultisigOperation::DelegateCall,
        })
    }
}

/// Authorizes one real channel's side of a virtual app: capital routed to
/// the virtual app's outcome until expiry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VirtualAppAgreementCommitment {
    pub network: NetworkContext,
    pub multisig: Address,
    pub multisig_owners: Vec<Address>,
    /// Identity hash of the virtual app being funded.
    pub target: Hash,
    pub capital: U256,
    pub expiry: u64,
    pub beneficiaries: Vec<Address>,
}

#[derive(Serialize)]
struct VirtualAppAgreementCall {
    registry: Address,
    target: Hash,
    capital: U256,
    expiry: u64,
    beneficiaries: Vec<Address>,
}

impl VirtualAppAgreementCommitment {
    fn transaction_payload(&self) -> Result<MultisigTransaction, abiencode::Error> {
        let mut data =
            selector("delegateTargetVirtualAppAgreement(address,bytes32,uint256,uint256,address[])")
                .to_vec();
        data.extend(abiencode::to_fnargs_bytes(&VirtualAppAgreementCall {
            registry: self.network.app_registry,
            target: self.target,
            capital: self.capital,
            expiry: self.expiry,
            beneficiaries: self.beneficiaries.clone(),
        })?);
        Ok(MultisigTransaction {
            to: self.network.virtual_app_agreement,
            value: U256::zero(),
            data: Bytes(data),
            operation: MultisigOperation::DelegateCall,
        })
    }
}

/// Authorizes sending part of the free balance out of the multisig.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WithdrawCommitment {
    pub multisig: Address,
    pub multisig_owners: Vec<Address>,
    pub recipient: Address,
    pub amount: U256,
}

impl WithdrawCommitment {
    fn transaction_payload(&self) -> MultisigTransaction {
        MultisigTransaction {
            to: self.recipient,
            value: self.amount,
            data: Bytes(Vec::new()),
            operation: MultisigOperation::Call,
        }
    }
}

/// The closed set of commitments a protocol can produce.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Commitment {
    Setup(SetupCommitment),
    SetState(SetStateCommitment),
    ConditionalTransfer(ConditionalTransferCommitment),
    VirtualAppAgreement(VirtualAppAgreementCommitment),
    Withdraw(WithdrawCommitment),
}

impl Commitment {
    /// The digest every required party signs. Depends only on the
    /// commitment's own fields.
    pub fn hash_to_sign(&self) -> Result<Hash, abiencode::Error> {
        match self {
            Commitment::Setup(c) => Ok(multisig_tx_hash(
                c.multisig,
                &c.multisig_owners,
                &c.transaction_payload()?,
            )),
            Commitment::SetState(c) => Ok(c.digest()),
            Commitment::ConditionalTransfer(c) => Ok(multisig_tx_hash(
                c.multisig,
                &c.multisig_owners,
                &c.transaction_payload()?,
            )),
            Commitment::VirtualAppAgreement(c) => Ok(multisig_tx_hash(
                c.multisig,
                &c.multisig_owners,
                &c.transaction_payload()?,
            )),
            Commitment::Withdraw(c) => Ok(multisig_tx_hash(
                c.multisig,
                &c.multisig_owners,
                &c.transaction_payload(),
            )),
        }
    }

    /// The transaction to submit if this commitment ever has to be
    /// enforced, with `signatures` aggregated in canonical order.
    pub fn transaction(
        &self,
        signatures: &BTreeMap<Address, Signature>,
    ) -> Result<MultisigTransaction, abiencode::Error> {
        match self {
            Commitment::Setup(c) => c.transaction_payload(),
            Commitment::SetState(c) => c.transaction_payload(signatures),
            Commitment::ConditionalTransfer(c) => c.transaction_payload(),
            Commitment::VirtualAppAgreement(c) => c.transaction_payload(),
            Commitment::Withdraw(c) => Ok(c.transaction_payload()),
        }
    }
}

/// A commitment together with every signature collected for it. This is
/// what the store persists at commit time for later dispute use.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignedCommitment {
    pub commitment: Commitment,
    pub signatures: BTreeMap<Address, Signature>,
}

impl SignedCommitment {
    pub fn transaction(&self) -> Result<MultisigTransaction, abiencode::Error> {
        self.commitment.transaction(&self.signatures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::AssetClass;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn network(rng: &mut StdRng) -> NetworkContext {
        NetworkContext {
            app_registry: rng.gen(),
            conditional_transaction: rng.gen(),
            virtual_app_agreement: rng.gen(),
            free_balance_app: rng.gen(),
        }
    }

    fn terms() -> Terms {
        Terms {
            asset_class: AssetClass::Eth,
            limit: U256::from(100u64),
            token: Address::default(),
        }
    }

    fn setup_commitment(rng: &mut StdRng) -> SetupCommitment {
        let mut owners: Vec<Address> = vec![rng.gen(), rng.gen()];
        owners.sort();
        SetupCommitment {
            network: network(rng),
            multisig: rng.gen(),
            multisig_owners: owners,
            free_balance_id: rng.gen(),
            free_balance_terms: terms(),
        }
    }

    #[test]
    fn digest_is_pure_and_field_sensitive() {
        let mut rng = StdRng::seed_from_u64(40);
        let commitment = setup_commitment(&mut rng);

        let a = Commitment::Setup(commitment.clone());
        let b = Commitment::Setup(commitment.clone());
        assert_eq!(a.hash_to_sign().unwrap(), b.hash_to_sign().unwrap());

        let mut other = commitment;
        other.free_balance_id = rng.gen();
        assert_ne!(
            a.hash_to_sign().unwrap(),
            Commitment::Setup(other).hash_to_sign().unwrap()
        );
    }

    #[test]
    fn set_state_digest_covers_version() {
        let mut rng = StdRng::seed_from_u64(41);
        let base = SetStateCommitment {
            network: network(&mut rng),
            app_identity_hash: rng.gen(),
            state_hash: rng.gen(),
            version_number: 1,
            timeout: 30,
        };
        let mut bumped = base.clone();
        bumped.version_number = 2;

        assert_ne!(
            Commitment::SetState(base).hash_to_sign().unwrap(),
            Commitment::SetState(bumped).hash_to_sign().unwrap()
        );
    }

    #[test]
    fn set_state_transaction_carries_sorted_signatures() {
        let mut rng = StdRng::seed_from_u64(42);
        let commitment = Commitment::SetState(SetStateCommitment {
            network: network(&mut rng),
            app_identity_hash: rng.gen(),
            state_hash: rng.gen(),
            version_number: 1,
            timeout: 30,
        });
        let digest = commitment.hash_to_sign().unwrap();

        let a = crate::sig::Signer::new(&mut rng);
        let b = crate::sig::Signer::new(&mut rng);
        let mut signatures = BTreeMap::new();
        signatures.insert(b.address(), b.sign_eth(digest).unwrap());
        signatures.insert(a.address(), a.sign_eth(digest).unwrap());

        let tx = commitment.transaction(&signatures).unwrap();
        assert_eq!(tx.operation, MultisigOperation::Call);

        // The signature blob sits at the end of the call data; the lower
        // address signs first no matter the insertion order.
        let lo_sig = signatures[&a.address().min(b.address())];
        let hi_sig = signatures[&a.address().max(b.address())];
        let pos_of = |needle: &Signature| {
            tx.data
                .0
                .windows(65)
                .position(|window| window == needle.0)
                .expect("signature bytes appear in the call data")
        };
        assert!(pos_of(&lo_sig) < pos_of(&hi_sig));
    }

    #[test]
    fn withdraw_transaction_moves_value() {
        let mut rng = StdRng::seed_from_u64(43);
        let recipient: Address = rng.gen();
        let commitment = WithdrawCommitment {
            multisig: rng.gen(),
            multisig_owners: vec![rng.gen(), rng.gen()],
            recipient,
            amount: U256::from(5u64),
        };

        let tx = commitment.transaction_payload();
        assert_eq!(tx.to, recipient);
        assert_eq!(tx.value, U256::from(5u64));
        assert!(tx.data.0.is_empty());
        assert_eq!(tx.operation, MultisigOperation::Call);
    }

    #[test]
    fn owners_are_part_of_the_digest() {
        let mut rng = StdRng::seed_from_u64(44);
        let commitment = setup_commitment(&mut rng);

        let mut other = commitment.clone();
        other.multisig_owners = vec![rng.gen(), rng.gen()];
        other.multisig_owners.sort();

        assert_ne!(
            Commitment::Setup(commitment).hash_to_sign().unwrap(),
            Commitment::Setup(other).hash_to_sign().unwrap()
        );
    }
}
