use core::fmt::{Debug, Display};

use rand::{distributions::Standard, prelude::Distribution};
use serde::{de, Deserialize, Serialize};
use uint::construct_uint;

pub(super) const SLOT_SIZE: usize = 32;

macro_rules! impl_hex_debug {
    ($T:ident) => {
        impl Debug for $T {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str("0x")?;
                for b in self.0 {
                    f.write_fmt(format_args!("{:02x}", b))?;
                }
                Ok(())
            }
        }
    };
}

fn parse_hex_exact<const N: usize, E: de::Error>(s: &str) -> Result<[u8; N], E> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let mut out = [0u8; N];
    hex::decode_to_slice(s, &mut out)
        .map_err(|_| E::custom(format_args!("expected {} hex bytes", N)))?;
    Ok(out)
}

// The human readable representation (used by the json wire and store
// layers) is a 0x-prefixed hex string. The binary representation is the
// 32-byte slot the abi encoder hashes, so both parties of a channel derive
// bit-identical digests from the same value.
macro_rules! bytesN {
    ( $T:ident, $N:literal, left ) => {
        bytesN!($T, $N);

        impl Serialize for $T {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                if serializer.is_human_readable() {
                    serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
                } else {
                    // bytesN values are left aligned in their slot.
                    let mut bytes = [0u8; SLOT_SIZE];
                    bytes[..$N].copy_from_slice(&self.0);
                    serializer.serialize_bytes(&bytes)
                }
            }
        }
    };
    ( $T:ident, $N:literal ) => {
        #[derive(PartialEq, Eq, PartialOrd, Ord, Copy, Clone)]
        pub struct $T(pub [u8; $N]);

        impl Default for $T {
            fn default() -> Self {
                Self([0; $N])
            }
        }

        impl<'de> Deserialize<'de> for $T {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Ok($T(parse_hex_exact::<$N, D::Error>(&s)?))
            }
        }

        impl Distribution<$T> for Standard {
            fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> $T {
                $T(rng.gen())
            }
        }

        impl_hex_debug!($T);

        impl Display for $T {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                <Self as Debug>::fmt(self, f)
            }
        }
    };
}

bytesN!(Bytes32, 32, left);
bytesN!(Hash, 32, left);

// 65 bytes holding r, s and v. Never part of an abi encoded payload on its
// own (the commitment transactions concatenate raw signature bytes), so it
// only has the hex representation.
bytesN!(Signature, 65);

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
    }
}

impl Signature {
    pub fn new(rs: &[u8; 64], v: u8) -> Self {
        let mut sig = Signature([0; 65]);
        sig.0[..64].copy_from_slice(rs);
        sig.0[64] = v;
        sig
    }
}

/// Dynamic-length `bytes`, e.g. call data or a signature blob inside call
/// data. Encodes with a length prefix and zero padding, unlike the fixed
/// `bytesN` newtypes above.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Bytes(pub Vec<u8>);

impl Debug for Bytes {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("0x")?;
        for b in &self.0 {
            f.write_fmt(format_args!("{:02x}", b))?;
        }
        Ok(())
    }
}

/// Hands raw bytes to the encoder once the wrapper has marked them dynamic.
struct RawBytes<'a>(&'a [u8]);

impl Serialize for RawBytes<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(self.0)
    }
}

impl Serialize for Bytes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&format!("0x{}", hex::encode(&self.0)))
        } else {
            serializer.serialize_newtype_struct(super::ser::DYN_BYTES_NAME, &RawBytes(&self.0))
        }
    }
}

impl<'de> Deserialize<'de> for Bytes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.strip_prefix("0x").unwrap_or(&s);
        hex::decode(s)
            .map(Bytes)
            .map_err(|_| de::Error::custom("expected hex bytes"))
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 20]);
impl_hex_debug!(Address);

impl Display for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        <Self as Debug>::fmt(self, f)
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
        } else {
            // Addresses are right aligned (like uints), not left aligned
            // like the other bytesN types.
            let mut bytes = [0u8; SLOT_SIZE];
            bytes[SLOT_SIZE - 20..].copy_from_slice(self.0.as_slice());
            serializer.serialize_bytes(&bytes)
        }
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Address(parse_hex_exact::<20, D::Error>(&s)?))
    }
}

impl Distribution<Address> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Address {
        Address(rng.gen())
    }
}

// We could use primitive_types::U256 or ethereum_types::U256 here, but both
// come with serde representations we cannot influence. Since they internally
// use construct_uint anyway it is easier to construct our own type and give
// it exactly the two representations we need.
construct_uint! {
    pub struct U256(4);
}

impl U256 {
    pub fn to_be_slot(self) -> [u8; SLOT_SIZE] {
        let mut bytes = [0u8; SLOT_SIZE];
        self.to_big_endian(&mut bytes);
        bytes
    }
}

impl Serialize for U256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&format!("0x{:x}", self))
        } else {
            serializer.serialize_bytes(&self.to_be_slot())
        }
    }
}

impl<'de> Deserialize<'de> for U256 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.strip_prefix("0x").unwrap_or(&s);
        U256::from_str_radix(s, 16).map_err(|_| de::Error::custom("expected a hex quantity"))
    }
}

impl Distribution<U256> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> U256 {
        let buf: [u8; 32] = rng.gen();
        U256::from_big_endian(&buf)
    }
}
