//! Addresses of the deployed enforcement contracts.

use crate::abiencode::types::Address;
use serde::{Deserialize, Serialize};

/// Where the on-chain side of the protocol lives.
///
/// Constructed by the embedding application from its deployment artifacts
/// and passed into the engine, which never mutates it. All commitments
/// reference these addresses, so both channel parties must agree on them.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct NetworkContext {
    /// Registry contract that adjudicates app state disputes.
    pub app_registry: Address,
    /// Delegate target executing conditional transfers from the multisig.
    pub conditional_transaction: Address,
    /// Delegate target settling virtual app agreements.
    pub virtual_app_agreement: Address,
    /// App definition backing every channel's free balance.
    pub free_balance_app: Address,
}
