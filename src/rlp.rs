//! A minimal RLP encoder, sufficient for deriving contract addresses from
//! `(sender, nonce)` pairs.

use crate::expr::W256;

/// An item in the RLP data model: either a byte string or a list of items.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Item {
    /// A plain byte string.
    Bytes(Vec<u8>),

    /// A heterogeneous list of items.
    List(Vec<Item>),
}

impl Item {
    /// Encodes the item into its RLP byte representation.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Bytes(bytes) => {
                if bytes.len() == 1 && bytes[0] < 0x80 {
                    bytes.clone()
                } else {
                    let mut out = encode_length(bytes.len(), 0x80);
                    out.extend_from_slice(bytes);
                    out
                }
            }
            Self::List(items) => {
                let payload: Vec<u8> = items.iter().flat_map(Item::encode).collect();
                let mut out = encode_length(payload.len(), 0xc0);
                out.extend_from_slice(&payload);
                out
            }
        }
    }
}

/// Encodes a word as an RLP integer: the shortest big-endian byte string with
/// no leading zeroes. Zero encodes as the empty string.
#[must_use]
pub fn from_word(value: W256) -> Item {
    let bytes = value.to_be_bytes();
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(32);
    Item::Bytes(bytes[start..].to_vec())
}

/// Encodes the length prefix for a payload of `len` bytes with the given
/// `offset` (0x80 for strings, 0xc0 for lists).
fn encode_length(len: usize, offset: u8) -> Vec<u8> {
    if len < 56 {
        vec![offset + len as u8]
    } else {
        let len_bytes = len.to_be_bytes();
        let start = len_bytes.iter().position(|b| *b != 0).unwrap_or(7);
        let mut out = vec![offset + 55 + (8 - start) as u8];
        out.extend_from_slice(&len_bytes[start..]);
        out
    }
}

#[cfg(test)]
mod test {
    use ethnum::U256;

    use crate::rlp::{from_word, Item};

    #[test]
    fn single_low_bytes_encode_as_themselves() {
        assert_eq!(Item::Bytes(vec![0x7f]).encode(), vec![0x7f]);
    }

    #[test]
    fn short_strings_get_a_length_prefix() {
        assert_eq!(Item::Bytes(vec![0x80]).encode(), vec![0x81, 0x80]);
        assert_eq!(Item::Bytes(b"dog".to_vec()).encode(), vec![0x83, b'd', b'o', b'g']);
    }

    #[test]
    fn the_empty_string_is_the_null_byte() {
        assert_eq!(Item::Bytes(vec![]).encode(), vec![0x80]);
        assert_eq!(from_word(U256::ZERO).encode(), vec![0x80]);
    }

    #[test]
    fn long_strings_use_an_extended_prefix() {
        let payload = vec![0xaa; 56];
        let encoded = Item::Bytes(payload.clone()).encode();
        assert_eq!(encoded[0], 0xb8);
        assert_eq!(encoded[1], 56);
        assert_eq!(&encoded[2..], payload.as_slice());
    }

    #[test]
    fn lists_nest() {
        let list = Item::List(vec![
            Item::Bytes(b"cat".to_vec()),
            Item::Bytes(b"dog".to_vec()),
        ]);
        assert_eq!(
            list.encode(),
            vec![0xc8, 0x83, b'c', b'a', b't', 0x83, b'd', b'o', b'g']
        );
    }

    #[test]
    fn words_encode_minimally() {
        assert_eq!(from_word(U256::from(15u64)).encode(), vec![0x0f]);
        assert_eq!(from_word(U256::from(1024u64)).encode(), vec![0x82, 0x04, 0x00]);
    }
}
