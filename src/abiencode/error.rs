//! Error type and Result alias used by the encoder.

use serde::ser;
use thiserror::Error;

/// Represents all possible errors that can happen while encoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The value contains a type that has no Solidity counterpart, for
    /// example floating point numbers, maps or enums. Encode such data
    /// through an explicit helper struct instead.
    #[error("type is not representable in abi encoding: {0}")]
    TypeNotRepresentable(&'static str),
    /// `serialize_bytes` was called with something other than one 32-byte
    /// slot. Fixed-size byte types pad themselves to a full slot before
    /// reaching the encoder; anything else is a bug in the calling type.
    #[error("expected a single 32-byte slot, got {0} bytes")]
    InvalidSlotLength(usize),
    /// Raised through [serde::ser::Error::custom] by a Serialize impl.
    #[error("{0}")]
    Custom(String),
}

impl ser::Error for Error {
    fn custom<T>(msg: T) -> Self
    where
        T: core::fmt::Display,
    {
        Error::Custom(msg.to_string())
    }
}

/// Alias for `Result` using the [Error] returned by the encoder.
pub type Result<T> = core::result::Result<T, Error>;
