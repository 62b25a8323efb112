//! This module contains the symbolic expression algebra that the engine
//! threads through every operation.
//!
//! Each expression sort is a distinct sum type — [`Word`], [`Byte`], [`Buf`],
//! [`Storage`] and [`Prop`] — linked by the signatures of the smart
//! constructors in the submodules. This gives static rejection of ill-sorted
//! expressions without any run-time checking.
//!
//! All construction of non-literal nodes should go through the smart
//! constructors, which fold concrete arguments and apply the algebraic
//! identities of the underlying EVM operations.

pub mod buf;
pub mod prop;
pub mod storage;
pub mod word;

use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
    rc::Rc,
};

use ethnum::U256;

/// The type of concrete 256-bit EVM words.
pub type W256 = U256;

/// A concrete 160-bit account address.
///
/// The engine requires concrete addresses wherever the EVM semantics do
/// (account access, the call family, self destruction), so addresses are not
/// part of the symbolic algebra. The wrapped word is guaranteed to fit in 20
/// bytes by all constructors.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Addr(U256);

impl Addr {
    /// The mask selecting the low 160 bits of a word.
    const MASK: U256 = U256::from_words(0xffff_ffff, u128::MAX);

    /// Constructs an address from `word`, discarding anything above the low
    /// 160 bits as the EVM does when a word is used as an address.
    #[must_use]
    pub fn from_word(word: U256) -> Self {
        Self(word & Self::MASK)
    }

    /// Constructs an address from the low 20 bytes of a 32-byte hash.
    ///
    /// # Panics
    ///
    /// Panics if `hash` is shorter than 32 bytes. This is a programmer bug.
    #[must_use]
    pub fn from_hash(hash: &[u8]) -> Self {
        let mut bytes = [0u8; 32];
        bytes[12..].copy_from_slice(&hash[12..32]);
        Self(U256::from_be_bytes(bytes))
    }

    /// Views the address as a word, zero-extended to 256 bits.
    #[must_use]
    pub fn into_word(self) -> U256 {
        self.0
    }

    /// Gets the big-endian 20-byte representation of the address.
    #[must_use]
    pub fn to_fixed_bytes(self) -> [u8; 20] {
        let mut out = [0u8; 20];
        out.copy_from_slice(&self.0.to_be_bytes()[12..]);
        out
    }
}

impl From<u64> for Addr {
    fn from(value: u64) -> Self {
        Self(U256::from(value))
    }
}

impl Display for Addr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.to_fixed_bytes()))
    }
}

/// A symbolic 256-bit word.
///
/// Non-literal nodes record the EVM operation that produced them; the smart
/// constructors in [`word`] and [`buf`] fold any node whose inputs are
/// concrete, so a `Lit` in hand means the value is known exactly.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Word {
    /// A concrete 256-bit unsigned word.
    Lit(W256),

    /// An abstract word identified by name.
    Var(String),

    /// Wrapping addition.
    Add { left: Box<Word>, right: Box<Word> },

    /// Wrapping subtraction.
    Sub { left: Box<Word>, right: Box<Word> },

    /// Wrapping multiplication.
    Mul { left: Box<Word>, right: Box<Word> },

    /// Unsigned division, zero when the divisor is zero.
    Div { left: Box<Word>, right: Box<Word> },

    /// Two's-complement signed division.
    SDiv { left: Box<Word>, right: Box<Word> },

    /// Unsigned modulo, zero when the modulus is zero.
    Mod { left: Box<Word>, right: Box<Word> },

    /// Two's-complement signed modulo.
    SMod { left: Box<Word>, right: Box<Word> },

    /// Addition modulo an arbitrary modulus, computed without intermediate
    /// wrap-around.
    AddMod {
        left:    Box<Word>,
        right:   Box<Word>,
        modulus: Box<Word>,
    },

    /// Multiplication modulo an arbitrary modulus, computed without
    /// intermediate wrap-around.
    MulMod {
        left:    Box<Word>,
        right:   Box<Word>,
        modulus: Box<Word>,
    },

    /// Wrapping exponentiation.
    Exp { base: Box<Word>, exponent: Box<Word> },

    /// Sign extension from the `(size + 1)`-th byte.
    SEx { size: Box<Word>, value: Box<Word> },

    /// Unsigned less-than, producing 0 or 1.
    Lt { left: Box<Word>, right: Box<Word> },

    /// Unsigned greater-than, producing 0 or 1.
    Gt { left: Box<Word>, right: Box<Word> },

    /// Signed less-than, producing 0 or 1.
    SLt { left: Box<Word>, right: Box<Word> },

    /// Signed greater-than, producing 0 or 1.
    SGt { left: Box<Word>, right: Box<Word> },

    /// Equality, producing 0 or 1.
    Eq { left: Box<Word>, right: Box<Word> },

    /// Equality with zero, producing 0 or 1.
    IsZero { value: Box<Word> },

    /// Bitwise conjunction.
    And { left: Box<Word>, right: Box<Word> },

    /// Bitwise disjunction.
    Or { left: Box<Word>, right: Box<Word> },

    /// Bitwise exclusive disjunction.
    Xor { left: Box<Word>, right: Box<Word> },

    /// Bitwise negation.
    Not { value: Box<Word> },

    /// Left shift, zero for shifts of 256 or more.
    Shl { shift: Box<Word>, value: Box<Word> },

    /// Logical right shift, zero for shifts of 256 or more.
    Shr { shift: Box<Word>, value: Box<Word> },

    /// Arithmetic right shift, saturating at the sign for shifts of 256 or
    /// more.
    Sar { shift: Box<Word>, value: Box<Word> },

    /// The keccak-256 hash of a buffer whose contents are not fully known.
    Keccak { buffer: Rc<Buf> },

    /// The hash of a block whose number is not concretely known.
    BlockHash { number: Box<Word> },

    /// The size of the code at an address that has not been fetched.
    CodeSize { address: Addr },

    /// The length of a buffer that is not statically determined.
    BufLength { buffer: Rc<Buf> },

    /// A word read from a buffer at an index that could not be resolved
    /// statically. Reads beyond the end of the buffer zero-extend.
    ReadWord { index: Box<Word>, buffer: Rc<Buf> },

    /// A storage read that could not be resolved statically.
    SLoad {
        address: Addr,
        slot:    Box<Word>,
        storage: Rc<Storage>,
    },
}

impl Word {
    /// Gets the concrete value of the word if it is a literal.
    #[must_use]
    pub fn maybe_lit(&self) -> Option<W256> {
        match self {
            Self::Lit(value) => Some(*value),
            _ => None,
        }
    }

    /// Checks whether the word is a literal.
    #[must_use]
    pub fn is_lit(&self) -> bool {
        matches!(self, Self::Lit(_))
    }
}

impl From<W256> for Word {
    fn from(value: W256) -> Self {
        Self::Lit(value)
    }
}

impl From<u64> for Word {
    fn from(value: u64) -> Self {
        Self::Lit(U256::from(value))
    }
}

impl Display for Word {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lit(value) => write!(f, "0x{value:x}"),
            Self::Var(name) => write!(f, "{name}"),
            Self::Add { left, right } => write!(f, "(add {left} {right})"),
            Self::Sub { left, right } => write!(f, "(sub {left} {right})"),
            Self::Mul { left, right } => write!(f, "(mul {left} {right})"),
            Self::Div { left, right } => write!(f, "(div {left} {right})"),
            Self::SDiv { left, right } => write!(f, "(sdiv {left} {right})"),
            Self::Mod { left, right } => write!(f, "(mod {left} {right})"),
            Self::SMod { left, right } => write!(f, "(smod {left} {right})"),
            Self::AddMod {
                left,
                right,
                modulus,
            } => write!(f, "(addmod {left} {right} {modulus})"),
            Self::MulMod {
                left,
                right,
                modulus,
            } => write!(f, "(mulmod {left} {right} {modulus})"),
            Self::Exp { base, exponent } => write!(f, "(exp {base} {exponent})"),
            Self::SEx { size, value } => write!(f, "(signextend {size} {value})"),
            Self::Lt { left, right } => write!(f, "(lt {left} {right})"),
            Self::Gt { left, right } => write!(f, "(gt {left} {right})"),
            Self::SLt { left, right } => write!(f, "(slt {left} {right})"),
            Self::SGt { left, right } => write!(f, "(sgt {left} {right})"),
            Self::Eq { left, right } => write!(f, "(eq {left} {right})"),
            Self::IsZero { value } => write!(f, "(iszero {value})"),
            Self::And { left, right } => write!(f, "(and {left} {right})"),
            Self::Or { left, right } => write!(f, "(or {left} {right})"),
            Self::Xor { left, right } => write!(f, "(xor {left} {right})"),
            Self::Not { value } => write!(f, "(not {value})"),
            Self::Shl { shift, value } => write!(f, "(shl {shift} {value})"),
            Self::Shr { shift, value } => write!(f, "(shr {shift} {value})"),
            Self::Sar { shift, value } => write!(f, "(sar {shift} {value})"),
            Self::Keccak { buffer } => write!(f, "(keccak {buffer})"),
            Self::BlockHash { number } => write!(f, "(blockhash {number})"),
            Self::CodeSize { address } => write!(f, "(codesize {address})"),
            Self::BufLength { buffer } => write!(f, "(buflength {buffer})"),
            Self::ReadWord { index, buffer } => write!(f, "(readword {index} {buffer})"),
            Self::SLoad { address, slot, .. } => write!(f, "(sload {address} {slot})"),
        }
    }
}

/// A symbolic byte.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Byte {
    /// A concrete byte.
    Lit(u8),

    /// Byte `index` of `word`, counted from the most significant end.
    IndexWord { index: Box<Word>, word: Box<Word> },

    /// A byte read from a buffer at an index that could not be resolved
    /// statically.
    ReadByte { index: Box<Word>, buffer: Rc<Buf> },
}

impl Byte {
    /// Gets the concrete value of the byte if it is a literal.
    #[must_use]
    pub fn maybe_lit(&self) -> Option<u8> {
        match self {
            Self::Lit(value) => Some(*value),
            _ => None,
        }
    }
}

impl Display for Byte {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lit(value) => write!(f, "0x{value:02x}"),
            Self::IndexWord { index, word } => write!(f, "(indexword {index} {word})"),
            Self::ReadByte { index, buffer } => write!(f, "(readbyte {index} {buffer})"),
        }
    }
}

/// A symbolic byte buffer.
///
/// Buffers are conceptually infinite and zero-initialised; reads beyond any
/// written region produce zero bytes. Write nodes share their tails via [`Rc`]
/// so that the long chains produced by memory traffic can be snapshotted
/// without deep copies.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Buf {
    /// A buffer whose entire contents are concretely known.
    Concrete(Vec<u8>),

    /// An abstract buffer identified by name.
    Abstract(String),

    /// A 32-byte word written into the underlying buffer.
    WriteWord {
        index: Box<Word>,
        value: Box<Word>,
        tail:  Rc<Buf>,
    },

    /// A single byte written into the underlying buffer.
    WriteByte {
        index: Box<Word>,
        value: Box<Byte>,
        tail:  Rc<Buf>,
    },

    /// A region of `src` spliced over `dst`.
    CopySlice {
        src_offset: Box<Word>,
        dst_offset: Box<Word>,
        size:       Box<Word>,
        src:        Rc<Buf>,
        dst:        Rc<Buf>,
    },
}

impl Buf {
    /// Constructs the empty buffer.
    #[must_use]
    pub fn empty() -> Self {
        Self::Concrete(Vec::new())
    }

    /// Gets the concrete contents of the buffer if they are fully known.
    #[must_use]
    pub fn maybe_concrete(&self) -> Option<&[u8]> {
        match self {
            Self::Concrete(bytes) => Some(bytes.as_slice()),
            _ => None,
        }
    }
}

impl Default for Buf {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Vec<u8>> for Buf {
    fn from(value: Vec<u8>) -> Self {
        Self::Concrete(value)
    }
}

impl Display for Buf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Concrete(bytes) => write!(f, "0x{}", hex::encode(bytes)),
            Self::Abstract(name) => write!(f, "{name}"),
            Self::WriteWord { index, value, tail } => {
                write!(f, "(writeword {index} {value} {tail})")
            }
            Self::WriteByte { index, value, tail } => {
                write!(f, "(writebyte {index} {value} {tail})")
            }
            Self::CopySlice {
                src_offset,
                dst_offset,
                size,
                src,
                dst,
            } => write!(
                f,
                "(copyslice {src_offset} {dst_offset} {size} {src} {dst})"
            ),
        }
    }
}

/// A symbolic view of the persistent storage of all accounts.
///
/// Storage is addressed by `(account, slot)`; write nodes form a linear chain
/// over a base, and the chain prefix is shared across reversion snapshots via
/// [`Rc`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Storage {
    /// Storage in which every slot of every account is zero.
    Empty,

    /// Storage whose contents are concretely known per account and slot.
    /// Slots absent from the map are not constrained to any value.
    Concrete(BTreeMap<Addr, BTreeMap<W256, W256>>),

    /// Storage about which nothing is known.
    Abstract,

    /// A single slot written over the previous state of storage.
    Write {
        address: Addr,
        slot:    Box<Word>,
        value:   Box<Word>,
        prev:    Rc<Storage>,
    },
}

impl Display for Storage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "(empty-store)"),
            Self::Concrete(accounts) => write!(f, "(concrete-store {} accounts)", accounts.len()),
            Self::Abstract => write!(f, "(abstract-store)"),
            Self::Write {
                address,
                slot,
                value,
                prev,
            } => write!(f, "(sstore {address} {slot} {value} {prev})"),
        }
    }
}

/// A boolean proposition over symbolic words, accumulated as path conditions
/// during execution.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Prop {
    /// Equality of two words.
    Eq(Word, Word),

    /// Unsigned strict less-than.
    Lt(Word, Word),

    /// Unsigned strict greater-than.
    Gt(Word, Word),

    /// Unsigned less-than-or-equal.
    Leq(Word, Word),

    /// Unsigned greater-than-or-equal.
    Geq(Word, Word),

    /// Conjunction.
    And(Box<Prop>, Box<Prop>),

    /// Disjunction.
    Or(Box<Prop>, Box<Prop>),

    /// Negation.
    Neg(Box<Prop>),

    /// A concrete truth value.
    Bool(bool),
}

impl Display for Prop {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Eq(left, right) => write!(f, "(= {left} {right})"),
            Self::Lt(left, right) => write!(f, "(< {left} {right})"),
            Self::Gt(left, right) => write!(f, "(> {left} {right})"),
            Self::Leq(left, right) => write!(f, "(<= {left} {right})"),
            Self::Geq(left, right) => write!(f, "(>= {left} {right})"),
            Self::And(left, right) => write!(f, "(and {left} {right})"),
            Self::Or(left, right) => write!(f, "(or {left} {right})"),
            Self::Neg(prop) => write!(f, "(not {prop})"),
            Self::Bool(value) => write!(f, "{value}"),
        }
    }
}

/// A log record emitted by one of the `LOG` opcodes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogEntry {
    /// The account whose execution emitted the log.
    pub address: Addr,

    /// The logged data.
    pub data: Buf,

    /// The indexed topics, at most four.
    pub topics: Vec<Word>,
}

#[cfg(test)]
mod test {
    use ethnum::U256;

    use crate::expr::{Addr, Buf, Word};

    #[test]
    fn address_truncates_to_low_160_bits() {
        let word = U256::from_be_bytes([0xff; 32]);
        let addr = Addr::from_word(word);
        assert_eq!(addr.to_fixed_bytes(), [0xff; 20]);
        assert!(addr.into_word() < U256::ONE << 160);
    }

    #[test]
    fn address_displays_as_twenty_bytes() {
        let addr = Addr::from(0xdead_beefu64);
        assert_eq!(addr.to_string(), "0x00000000000000000000000000000000deadbeef");
    }

    #[test]
    fn literal_words_report_their_value() {
        let word = Word::from(42u64);
        assert_eq!(word.maybe_lit(), Some(U256::from(42u64)));
        assert!(word.is_lit());
    }

    #[test]
    fn empty_buffer_is_concrete_and_empty() {
        let buf = Buf::empty();
        assert_eq!(buf.maybe_concrete(), Some(&[] as &[u8]));
    }
}
