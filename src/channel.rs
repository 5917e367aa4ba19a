//! The channel and app value objects and the transitions between them.
//!
//! Everything in here is an immutable value: a protocol run loads a
//! [StateChannel] from the store, derives new values through the transition
//! methods and either commits the result or throws it away. Nothing in this
//! module performs IO or signing.

mod app_instance;
mod free_balance;
mod state_channel;

pub use app_instance::{AppInstance, AppInterface, AppState, AssetClass, Terms};
pub(crate) use app_instance::TermsEncoding;
pub use free_balance::{FreeBalanceState, InsufficientBalance};
pub use state_channel::{StateChannel, TransitionError, VirtualAppAgreement};
