//! Serializer producing the canonical Solidity abi encoding.
//!
//! The encoder works in two stages. A [serde::Serializer] first collects the
//! value into a [Token] tree (one 32-byte word per primitive, tuples for
//! structs and fixed-size arrays, dynamic arrays for sequences). The token
//! tree is then written out with the standard head/tail layout: static
//! values inline, dynamic values behind an offset word. Splitting the two
//! stages keeps the offset arithmetic in one small function instead of
//! spreading it over every Serializer method.
//!
//! Field order is the declaration order of the Rust struct, integers are
//! written as full 32-byte big-endian slots and there is no implicit
//! coercion anywhere, so independent processes hash identical bytes for
//! identical values.

use super::error::{Error, Result};
use super::types::SLOT_SIZE;
use serde::{
    ser::{
        self, SerializeMap, SerializeSeq, SerializeStruct, SerializeStructVariant, SerializeTuple,
        SerializeTupleStruct, SerializeTupleVariant,
    },
    Serialize,
};

/// Marker name the [types::Bytes][super::types::Bytes] wrapper uses to get
/// raw bytes past the slot length check. The serde Serializer trait has no
/// way to express both `bytesN` (one padded slot) and `bytes` (dynamic), so
/// the dynamic case announces itself through a newtype with this name. The
/// characters have no special meaning, normal Rust types just never look
/// like this.
pub(super) const DYN_BYTES_NAME: &str = ":$&_BYTES";

/// One node of an abi-encodable value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// A single 32-byte slot (uintN, address, bytesN, bool).
    Word([u8; SLOT_SIZE]),
    /// A struct or fixed-size array. Static iff all fields are static.
    Tuple(Vec<Token>),
    /// A dynamic-length array (`T[]`). Always dynamic.
    Array(Vec<Token>),
    /// Dynamic-length `bytes`. Always dynamic.
    Bytes(Vec<u8>),
}

impl Token {
    fn is_dynamic(&self) -> bool {
        match self {
            Token::Word(_) => false,
            Token::Array(_) | Token::Bytes(_) => true,
            Token::Tuple(fields) => fields.iter().any(Token::is_dynamic),
        }
    }

    /// Size this token occupies in the head of the enclosing sequence.
    fn head_size(&self) -> usize {
        if self.is_dynamic() {
            SLOT_SIZE
        } else {
            self.static_size()
        }
    }

    /// Encoded size of a static token. Must not be called on dynamic ones.
    fn static_size(&self) -> usize {
        match self {
            Token::Word(_) => SLOT_SIZE,
            Token::Tuple(fields) => fields.iter().map(Token::static_size).sum(),
            Token::Array(_) | Token::Bytes(_) => unreachable!("these are always dynamic"),
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Token::Word(w) => out.extend_from_slice(w),
            Token::Tuple(fields) => encode_sequence(fields, out),
            Token::Array(elements) => {
                out.extend_from_slice(&usize_slot(elements.len()));
                encode_sequence(elements, out);
            }
            Token::Bytes(bytes) => {
                out.extend_from_slice(&usize_slot(bytes.len()));
                out.extend_from_slice(bytes);
                // Zero padding up to the slot boundary.
                let rem = bytes.len() % SLOT_SIZE;
                if rem != 0 {
                    out.resize(out.len() + SLOT_SIZE - rem, 0);
                }
            }
        }
    }
}

fn usize_slot(v: usize) -> [u8; SLOT_SIZE] {
    let mut bytes = [0u8; SLOT_SIZE];
    bytes[SLOT_SIZE - 8..].copy_from_slice(&(v as u64).to_be_bytes());
    bytes
}

/// Head/tail layout shared by tuples, arrays and the argument list itself.
fn encode_sequence(tokens: &[Token], out: &mut Vec<u8>) {
    let head_size: usize = tokens.iter().map(Token::head_size).sum();
    let mut tail: Vec<u8> = Vec::new();
    for token in tokens {
        if token.is_dynamic() {
            // Offsets are relative to the start of this sequence's head.
            out.extend_from_slice(&usize_slot(head_size + tail.len()));
            token.encode_into(&mut tail);
        } else {
            token.encode_into(out);
        }
    }
    out.extend_from_slice(&tail);
}

/// Collect a value into its [Token] tree.
pub fn to_token<T>(value: &T) -> Result<Token>
where
    T: Serialize,
{
    let mut serializer = Serializer {
        frames: vec![Vec::new()],
        dyn_bytes: false,
    };
    value.serialize(&mut serializer)?;
    let mut root = serializer
        .frames
        .pop()
        .expect("the root frame always exists");
    debug_assert!(serializer.frames.is_empty());
    debug_assert_eq!(root.len(), 1);
    root.pop()
        .ok_or(Error::TypeNotRepresentable("empty value"))
}

/// Encode a value the way `abi.encode` does when passed a single argument.
pub fn to_bytes<T>(value: &T) -> Result<Vec<u8>>
where
    T: Serialize,
{
    let token = to_token(value)?;
    let mut out = Vec::new();
    encode_sequence(core::slice::from_ref(&token), &mut out);
    Ok(out)
}

/// Encode a struct as a function argument list: the fields become the
/// arguments, without the outer tuple indirection `to_bytes` adds. This is
/// the layout call data uses after the four selector bytes.
pub fn to_fnargs_bytes<T>(value: &T) -> Result<Vec<u8>>
where
    T: Serialize,
{
    let token = to_token(value)?;
    let mut out = Vec::new();
    match token {
        Token::Tuple(fields) => encode_sequence(&fields, &mut out),
        other => encode_sequence(core::slice::from_ref(&other), &mut out),
    }
    Ok(out)
}

pub struct Serializer {
    /// Stack of sequences under construction. The bottom frame receives the
    /// finished root token.
    frames: Vec<Vec<Token>>,
    /// Set while serializing the inside of a dynamic bytes wrapper.
    dyn_bytes: bool,
}

impl Serializer {
    fn push(&mut self, token: Token) {
        self.frames
            .last_mut()
            .expect("the root frame always exists")
            .push(token);
    }

    fn push_word_right<const N: usize>(&mut self, v: [u8; N]) {
        let mut bytes = [0u8; SLOT_SIZE];
        bytes[SLOT_SIZE - N..].copy_from_slice(v.as_slice());
        self.push(Token::Word(bytes));
    }

    fn push_word_signed<const N: usize>(&mut self, negative: bool, v: [u8; N]) {
        let filler = if negative { 0xff } else { 0x00 };
        let mut bytes = [filler; SLOT_SIZE];
        bytes[SLOT_SIZE - N..].copy_from_slice(v.as_slice());
        self.push(Token::Word(bytes));
    }

    fn begin(&mut self) {
        self.frames.push(Vec::new());
    }

    fn end_tuple(&mut self) {
        let fields = self.frames.pop().expect("begin() pushed this frame");
        self.push(Token::Tuple(fields));
    }

    fn end_array(&mut self) {
        let elements = self.frames.pop().expect("begin() pushed this frame");
        self.push(Token::Array(elements));
    }
}

impl<'a> ser::Serializer for &'a mut Serializer {
    type Ok = ();
    type Error = Error;

    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn is_human_readable(&self) -> bool {
        false
    }

    fn serialize_bool(self, v: bool) -> Result<()> {
        self.serialize_u8(u8::from(v))
    }

    fn serialize_i8(self, v: i8) -> Result<()> {
        self.push_word_signed(v < 0, v.to_be_bytes());
        Ok(())
    }

    fn serialize_i16(self, v: i16) -> Result<()> {
        self.push_word_signed(v < 0, v.to_be_bytes());
        Ok(())
    }

    fn serialize_i32(self, v: i32) -> Result<()> {
        self.push_word_signed(v < 0, v.to_be_bytes());
        Ok(())
    }

    fn serialize_i64(self, v: i64) -> Result<()> {
        self.push_word_signed(v < 0, v.to_be_bytes());
        Ok(())
    }

    fn serialize_i128(self, v: i128) -> Result<()> {
        self.push_word_signed(v < 0, v.to_be_bytes());
        Ok(())
    }

    fn serialize_u8(self, v: u8) -> Result<()> {
        self.push_word_right(v.to_be_bytes());
        Ok(())
    }

    fn serialize_u16(self, v: u16) -> Result<()> {
        self.push_word_right(v.to_be_bytes());
        Ok(())
    }

    fn serialize_u32(self, v: u32) -> Result<()> {
        self.push_word_right(v.to_be_bytes());
        Ok(())
    }

    fn serialize_u64(self, v: u64) -> Result<()> {
        self.push_word_right(v.to_be_bytes());
        Ok(())
    }

    fn serialize_u128(self, v: u128) -> Result<()> {
        self.push_word_right(v.to_be_bytes());
        Ok(())
    }

    fn serialize_f32(self, _: f32) -> Result<()> {
        Err(Error::TypeNotRepresentable("f32"))
    }

    fn serialize_f64(self, _: f64) -> Result<()> {
        Err(Error::TypeNotRepresentable("f64"))
    }

    fn serialize_char(self, _: char) -> Result<()> {
        Err(Error::TypeNotRepresentable("char"))
    }

    fn serialize_str(self, _: &str) -> Result<()> {
        Err(Error::TypeNotRepresentable("str"))
    }

    /// Accepts exactly one pre-padded 32-byte slot, or arbitrary bytes when
    /// reached through the dynamic bytes wrapper. The types in
    /// [types][super::types] align themselves (uints and addresses right,
    /// bytesN left) before calling this.
    fn serialize_bytes(self, v: &[u8]) -> Result<()> {
        if self.dyn_bytes {
            self.dyn_bytes = false;
            self.push(Token::Bytes(v.to_vec()));
            return Ok(());
        }
        let slot: [u8; SLOT_SIZE] = v.try_into().map_err(|_| Error::InvalidSlotLength(v.len()))?;
        self.push(Token::Word(slot));
        Ok(())
    }

    fn serialize_none(self) -> Result<()> {
        Err(Error::TypeNotRepresentable("none"))
    }

    fn serialize_some<T: ?Sized>(self, _: &T) -> Result<()>
    where
        T: Serialize,
    {
        Err(Error::TypeNotRepresentable("some"))
    }

    fn serialize_unit(self) -> Result<()> {
        Err(Error::TypeNotRepresentable("unit"))
    }

    fn serialize_unit_struct(self, _: &'static str) -> Result<()> {
        Err(Error::TypeNotRepresentable("unit struct"))
    }

    fn serialize_unit_variant(self, _: &'static str, _: u32, _: &'static str) -> Result<()> {
        Err(Error::TypeNotRepresentable("unit variant (enum)"))
    }

    fn serialize_newtype_struct<T: ?Sized>(self, name: &'static str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        if name == DYN_BYTES_NAME {
            self.dyn_bytes = true;
        }
        // Transparent: a newtype wrapper encodes as its content.
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: &T,
    ) -> Result<()>
    where
        T: Serialize,
    {
        Err(Error::TypeNotRepresentable("newtype variant (enum)"))
    }

    fn serialize_seq(self, _: Option<usize>) -> Result<Self::SerializeSeq> {
        self.begin();
        Ok(self)
    }

    fn serialize_tuple(self, _: usize) -> Result<Self::SerializeTuple> {
        self.begin();
        Ok(self)
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct> {
        self.begin();
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        Err(Error::TypeNotRepresentable("tuple variant (enum)"))
    }

    fn serialize_map(self, _: Option<usize>) -> Result<Self::SerializeMap> {
        Err(Error::TypeNotRepresentable("map"))
    }

    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self::SerializeStruct> {
        self.begin();
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant> {
        Err(Error::TypeNotRepresentable("struct variant"))
    }
}

impl<'a> SerializeSeq for &'a mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        self.end_array();
        Ok(())
    }
}

impl<'a> SerializeTuple for &'a mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        self.end_tuple();
        Ok(())
    }
}

impl<'a> SerializeTupleStruct for &'a mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        self.end_tuple();
        Ok(())
    }
}

impl<'a> SerializeTupleVariant for &'a mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, _value: &T) -> Result<()>
    where
        T: Serialize,
    {
        Err(Error::TypeNotRepresentable("tuple variant (enum)"))
    }

    fn end(self) -> Result<()> {
        Err(Error::TypeNotRepresentable("tuple variant (enum)"))
    }
}

impl<'a> SerializeMap for &'a mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_key<T: ?Sized>(&mut self, _key: &T) -> Result<()>
    where
        T: Serialize,
    {
        Err(Error::TypeNotRepresentable("map"))
    }

    fn serialize_value<T: ?Sized>(&mut self, _value: &T) -> Result<()>
    where
        T: Serialize,
    {
        Err(Error::TypeNotRepresentable("map"))
    }

    fn end(self) -> Result<()> {
        Err(Error::TypeNotRepresentable("map"))
    }
}

impl<'a> SerializeStruct for &'a mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, _name: &'static str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        self.end_tuple();
        Ok(())
    }
}

impl<'a> SerializeStructVariant for &'a mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, _key: &'static str, _value: &T) -> Result<()>
    where
        T: Serialize,
    {
        Err(Error::TypeNotRepresentable("struct variant"))
    }

    fn end(self) -> Result<()> {
        Err(Error::TypeNotRepresentable("struct variant"))
    }
}
