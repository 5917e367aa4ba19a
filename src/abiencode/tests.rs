use super::types::{Address, Bytes, Bytes32, U256};
use super::*;
use hex::FromHex;
use serde::Serialize;

/// Encode `value` and compare it slot by slot against `expected`, given as
/// one 32-byte hex string per line. Text after the 64 hex characters is
/// treated as a comment.
fn serialize_and_compare<T>(value: &T, expected: &str)
where
    T: Serialize,
{
    let encoded = to_bytes(value).unwrap();
    assert_eq!(encoded.len() % 32, 0, "encoding is not slot aligned");

    let expected_slots: Vec<[u8; 32]> = expected
        .split('\n')
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let line = line.trim();
            assert!(
                line.len() >= 64,
                "expected line is too short, it must start with a 32 byte hex string"
            );
            <[u8; 32]>::from_hex(&line[..64]).unwrap()
        })
        .collect();

    for (i, (got, want)) in encoded.chunks(32).zip(expected_slots.iter()).enumerate() {
        assert_eq!(
            hex::encode(got),
            hex::encode(want),
            "slot {} did not match the expected value",
            i
        );
    }
    assert_eq!(
        encoded.len() / 32,
        expected_slots.len(),
        "slot count did not match"
    );
}

fn test_address() -> Address {
    // Random address from etherscan, do not use!
    Address(<[u8; 20]>::from_hex("5B38Da6a701c568545dCfcB03FcB875f56beddC4").unwrap())
}

#[test]
fn static_struct() {
    #[derive(Serialize)]
    struct Static {
        version: u64,
        holder: Address,
    }

    let d = Static {
        version: 0x2222,
        holder: test_address(),
    };

    let expected = "
        0000000000000000000000000000000000000000000000000000000000002222
        0000000000000000000000005b38da6a701c568545dcfcb03fcb875f56beddc4
        ";
    serialize_and_compare(&d, expected);
}

#[test]
fn uints_and_bool() {
    #[derive(Serialize)]
    struct Mixed {
        small: u8,
        flag: bool,
        big: U256,
    }

    let d = Mixed {
        small: 0x7f,
        flag: true,
        big: U256::from(0x1337000012341111u64),
    };

    let expected = "
        000000000000000000000000000000000000000000000000000000000000007f
        0000000000000000000000000000000000000000000000000000000000000001
        0000000000000000000000000000000000000000000000001337000012341111
        ";
    serialize_and_compare(&d, expected);
}

#[test]
fn dynamic_address_array() {
    // Mirrors the tuple layout used for app identities: a struct that
    // becomes dynamic because one field is a `T[]`.
    #[derive(Serialize)]
    struct Identity {
        owner: Address,
        keys: Vec<Address>,
        timeout: u64,
    }

    let d = Identity {
        owner: test_address(),
        keys: vec![Address([0x11; 20]), Address([0x22; 20])],
        timeout: 0x64,
    };

    let expected = "
        0000000000000000000000000000000000000000000000000000000000000020 offset of the struct
        0000000000000000000000005b38da6a701c568545dcfcb03fcb875f56beddc4 owner
        0000000000000000000000000000000000000000000000000000000000000060 offset of keys
        0000000000000000000000000000000000000000000000000000000000000064 timeout
        0000000000000000000000000000000000000000000000000000000000000002 keys length
        0000000000000000000000001111111111111111111111111111111111111111
        0000000000000000000000002222222222222222222222222222222222222222
        ";
    serialize_and_compare(&d, expected);
}

#[test]
fn two_dynamic_fields() {
    #[derive(Serialize)]
    struct Two {
        xs: Vec<u64>,
        ys: Vec<u64>,
    }

    let d = Two {
        xs: vec![1],
        ys: vec![2, 3],
    };

    let expected = "
        0000000000000000000000000000000000000000000000000000000000000020 offset of the struct
        0000000000000000000000000000000000000000000000000000000000000040 offset of xs
        0000000000000000000000000000000000000000000000000000000000000080 offset of ys
        0000000000000000000000000000000000000000000000000000000000000001 xs length
        0000000000000000000000000000000000000000000000000000000000000001
        0000000000000000000000000000000000000000000000000000000000000002 ys length
        0000000000000000000000000000000000000000000000000000000000000002
        0000000000000000000000000000000000000000000000000000000000000003
        ";
    serialize_and_compare(&d, expected);
}

#[test]
fn empty_array() {
    #[derive(Serialize)]
    struct Holder {
        xs: Vec<u64>,
    }

    let d = Holder { xs: vec![] };

    let expected = "
        0000000000000000000000000000000000000000000000000000000000000020
        0000000000000000000000000000000000000000000000000000000000000020 offset of xs
        0000000000000000000000000000000000000000000000000000000000000000 xs length
        ";
    serialize_and_compare(&d, expected);
}

#[test]
fn fixed_array_is_inlined() {
    // A Rust fixed-size array of static values encodes like N consecutive
    // fields, without a length or offset.
    #[derive(Serialize)]
    struct Pair {
        values: [u64; 2],
    }

    let d = Pair { values: [5, 6] };

    let expected = "
        0000000000000000000000000000000000000000000000000000000000000005
        0000000000000000000000000000000000000000000000000000000000000006
        ";
    serialize_and_compare(&d, expected);
}

#[test]
fn bytes32_is_left_aligned() {
    #[derive(Serialize)]
    #[serde(transparent)]
    struct Wrapper(Bytes32);

    let mut raw = [0u8; 32];
    raw[..4].copy_from_slice(b"1111");
    let d = Wrapper(Bytes32(raw));

    let expected = "
        3131313100000000000000000000000000000000000000000000000000000000
        ";
    serialize_and_compare(&d, expected);
}

#[test]
fn dynamic_bytes() {
    #[derive(Serialize)]
    struct WithData {
        version: u64,
        data: Bytes,
    }

    let d = WithData {
        version: 1,
        data: Bytes(vec![0xa1, 0xa2, 0xa3, 0xa4]),
    };

    let expected = "
        0000000000000000000000000000000000000000000000000000000000000020 offset of the struct
        0000000000000000000000000000000000000000000000000000000000000001 version
        0000000000000000000000000000000000000000000000000000000000000040 offset of data
        0000000000000000000000000000000000000000000000000000000000000004 data length
        a1a2a3a400000000000000000000000000000000000000000000000000000000
        ";
    serialize_and_compare(&d, expected);
}

#[test]
fn fnargs_drop_the_outer_tuple() {
    #[derive(Serialize)]
    struct Args {
        id: Bytes32,
        blob: Bytes,
    }

    let mut id = [0u8; 32];
    id[0] = 0xee;
    let encoded = to_fnargs_bytes(&Args {
        id: Bytes32(id),
        blob: Bytes(vec![0xff; 33]),
    })
    .unwrap();

    // head: id word + offset, tail: length + two padded slots.
    assert_eq!(encoded.len(), 32 * 5);
    assert_eq!(encoded[0], 0xee);
    // Offset is relative to the argument list itself.
    assert_eq!(encoded[63], 0x40);
    assert_eq!(encoded[95], 33);
    assert_eq!(encoded[96], 0xff);
    assert_eq!(encoded[128], 0xff);
    assert_eq!(encoded[129], 0x00);
}

#[test]
fn maps_are_rejected() {
    use std::collections::BTreeMap;

    let mut d: BTreeMap<u64, u64> = BTreeMap::new();
    d.insert(1, 2);

    assert!(matches!(
        to_bytes(&d),
        Err(Error::TypeNotRepresentable("map"))
    ));
}

#[test]
fn hash_is_deterministic() {
    #[derive(Serialize)]
    struct Identity {
        owner: Address,
        keys: Vec<Address>,
        timeout: u64,
    }

    let build = || Identity {
        owner: test_address(),
        keys: vec![Address([0x11; 20]), Address([0x22; 20])],
        timeout: 100,
    };

    // Two independently constructed values hash identically, a different
    // value does not.
    assert_eq!(to_hash(&build()).unwrap(), to_hash(&build()).unwrap());

    let mut other = build();
    other.timeout = 101;
    assert_ne!(to_hash(&build()).unwrap(), to_hash(&other).unwrap());
}

#[test]
fn packed_encoding_layout() {
    let packed = PackedEncoder::new()
        .push_u8(0x19)
        .push_address(test_address())
        .push_u256(U256::from(0xabcdu64))
        .finish();

    assert_eq!(packed.len(), 1 + 20 + 32);
    assert_eq!(packed[0], 0x19);
    assert_eq!(&packed[1..21], &test_address().0);
    assert_eq!(packed[52], 0xcd);
}

#[test]
fn selector_is_four_bytes_and_stable() {
    let a = selector("setState(bytes32,uint256)");
    let b = selector("setState(bytes32,uint256)");
    let c = selector("cancelChallenge(bytes32)");
    assert_eq!(a, b);
    assert_ne!(a, c);
}
