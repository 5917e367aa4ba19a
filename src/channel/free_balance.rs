use crate::abiencode::{
    self,
    types::{Address, Hash, U256},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// A debit was requested that the party cannot cover.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{party} holds {available} free, cannot release {requested}")]
pub struct InsufficientBalance {
    pub party: Address,
    pub available: U256,
    pub requested: U256,
}

/// State of the distinguished free balance app: what each owner could walk
/// away with right now without touching any installed app.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct FreeBalanceState {
    balances: BTreeMap<Address, U256>,
}

/// Hashing view. The map itself has no Solidity counterpart; the contracts
/// see two parallel arrays in ascending address order, which is exactly the
/// map's iteration order.
#[derive(Serialize)]
struct FreeBalanceEncoding {
    participants: Vec<Address>,
    balances: Vec<U256>,
}

impl FreeBalanceState {
    pub fn new(owners: &[Address]) -> Self {
        FreeBalanceState {
            balances: owners.iter().map(|owner| (*owner, U256::zero())).collect(),
        }
    }

    pub fn balance(&self, party: Address) -> U256 {
        self.balances.get(&party).copied().unwrap_or_default()
    }

    pub fn balances(&self) -> &BTreeMap<Address, U256> {
        &self.balances
    }

    pub fn credit(&self, party: Address, amount: U256) -> Self {
        let mut next = self.clone();
        let entry = next.balances.entry(party).or_insert_with(U256::zero);
        *entry = *entry + amount;
        next
    }

    pub fn debit(&self, party: Address, amount: U256) -> Result<Self, InsufficientBalance> {
        let available = self.balance(party);
        let remainder = available
            .checked_sub(amount)
            .ok_or(InsufficientBalance {
                party,
                available,
                requested: amount,
            })?;
        let mut next = self.clone();
        next.balances.insert(party, remainder);
        Ok(next)
    }

    pub fn hash(&self) -> Result<Hash, abiencode::Error> {
        abiencode::to_hash(&FreeBalanceEncoding {
            participants: self.balances.keys().copied().collect(),
            balances: self.balances.values().copied().collect(),
        })
    }
}
