//! This module contains the model of a contract account: its code in the
//! various stages of its life cycle, and the execution-relevant metadata
//! derived from that code.

use ethnum::U256;

use crate::{
    crypto,
    disassembly,
    expr::{buf, Buf, Byte, Word},
    opcode::Op,
};

/// The code of a contract account.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ContractCode {
    /// Code of a contract under creation: a concrete initcode prefix followed
    /// by the (possibly abstract) constructor arguments.
    InitCode(Vec<u8>, Buf),

    /// Code of a deployed contract.
    RuntimeCode(RuntimeCode),
}

/// The runtime code of a deployed contract.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RuntimeCode {
    /// Fully known bytecode.
    Concrete(Vec<u8>),

    /// Bytecode in which individual bytes may be symbolic, as produced by a
    /// creation frame that returned a partially symbolic buffer.
    Symbolic(Vec<Byte>),
}

impl ContractCode {
    /// Checks whether this is creation-stage code.
    #[must_use]
    pub fn is_creation(&self) -> bool {
        matches!(self, Self::InitCode(_, _))
    }

    /// Gets the number of executable byte positions in the code.
    ///
    /// For creation code this is the concrete prefix only: the constructor
    /// arguments that follow are data, not code.
    #[must_use]
    pub fn opslen(&self) -> usize {
        match self {
            Self::InitCode(prefix, _) => prefix.len(),
            Self::RuntimeCode(RuntimeCode::Concrete(bytes)) => bytes.len(),
            Self::RuntimeCode(RuntimeCode::Symbolic(bytes)) => bytes.len(),
        }
    }

    /// Views the full code, including any constructor arguments, as a buffer.
    #[must_use]
    pub fn to_buf(&self) -> Buf {
        match self {
            Self::InitCode(prefix, args) => buf::append(prefix, args),
            Self::RuntimeCode(RuntimeCode::Concrete(bytes)) => Buf::Concrete(bytes.clone()),
            Self::RuntimeCode(RuntimeCode::Symbolic(bytes)) => buf::from_bytes(bytes),
        }
    }

    /// Gets the concrete byte at `offset` in the executable region, if there
    /// is one.
    #[must_use]
    pub fn concrete_byte_at(&self, offset: usize) -> Option<u8> {
        match self {
            Self::InitCode(prefix, _) => prefix.get(offset).copied(),
            Self::RuntimeCode(RuntimeCode::Concrete(bytes)) => bytes.get(offset).copied(),
            Self::RuntimeCode(RuntimeCode::Symbolic(bytes)) => {
                bytes.get(offset).and_then(Byte::maybe_lit)
            }
        }
    }

    /// Gets the byte expression at `offset` in the executable region. Offsets
    /// past the end of the code read as zero, as the EVM treats code reads.
    #[must_use]
    pub fn byte_at(&self, offset: usize) -> Byte {
        match self {
            Self::InitCode(prefix, _) => Byte::Lit(prefix.get(offset).copied().unwrap_or(0)),
            Self::RuntimeCode(RuntimeCode::Concrete(bytes)) => {
                Byte::Lit(bytes.get(offset).copied().unwrap_or(0))
            }
            Self::RuntimeCode(RuntimeCode::Symbolic(bytes)) => {
                bytes.get(offset).cloned().unwrap_or(Byte::Lit(0))
            }
        }
    }

    /// The executable region with any symbolic bytes replaced by the invalid
    /// opcode, used to derive the operation maps. A symbolic byte can never
    /// be a verified `JUMPDEST`, which is exactly how the invalid opcode
    /// behaves under validation.
    fn disassembly_view(&self) -> Vec<u8> {
        match self {
            Self::InitCode(prefix, _) => prefix.clone(),
            Self::RuntimeCode(RuntimeCode::Concrete(bytes)) => bytes.clone(),
            Self::RuntimeCode(RuntimeCode::Symbolic(bytes)) => bytes
                .iter()
                .map(|b| b.maybe_lit().unwrap_or(Op::Unknown(0xfe).as_byte()))
                .collect(),
        }
    }
}

/// A contract account as tracked by the engine's environment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Contract {
    /// The account's code.
    pub code: ContractCode,

    /// The account's balance in wei. May be symbolic for accounts whose
    /// balance was never concretised.
    pub balance: Word,

    /// The account's nonce, when known.
    pub nonce: Option<u64>,

    /// The keccak-256 hash of the account's full code.
    pub codehash: Word,

    /// Maps every byte offset of the executable region to the index of the
    /// operation that owns it.
    pub op_ix_map: Vec<u32>,

    /// The decoded operation sequence of the metadata-stripped executable
    /// region, each paired with its byte offset.
    pub code_ops: Vec<(u32, Op)>,

    /// Whether the account was fetched from a remote node. External accounts
    /// have their unknown storage slots fetched on demand rather than
    /// defaulted to zero.
    pub external: bool,
}

impl Contract {
    /// Constructs a fresh account carrying `code`, with zero balance and the
    /// nonce prescribed for its life-cycle stage (1 for an account under
    /// creation, 0 otherwise, per EIP-161).
    #[must_use]
    pub fn new(code: ContractCode) -> Self {
        let nonce = if code.is_creation() { 1 } else { 0 };
        let codehash = hashcode(&code);
        let (op_ix_map, code_ops) = derive_code_maps(&code);
        Self {
            code,
            balance: Word::Lit(U256::ZERO),
            nonce: Some(nonce),
            codehash,
            op_ix_map,
            code_ops,
            external: false,
        }
    }

    /// Constructs an empty account: no code, no balance, zero nonce.
    #[must_use]
    pub fn empty() -> Self {
        let mut contract = Self::new(ContractCode::RuntimeCode(RuntimeCode::Concrete(Vec::new())));
        contract.nonce = Some(0);
        contract
    }

    /// Sets the balance, builder style.
    #[must_use]
    pub fn with_balance(mut self, balance: Word) -> Self {
        self.balance = balance;
        self
    }

    /// Marks the account as fetched from a remote node, builder style.
    #[must_use]
    pub fn with_external(mut self, external: bool) -> Self {
        self.external = external;
        self
    }

    /// Replaces the account's code, recomputing the derived metadata while
    /// preserving balance and nonce. This is how a creation frame installs
    /// the runtime code it returned.
    pub fn replace_code(&mut self, code: ContractCode) {
        let (op_ix_map, code_ops) = derive_code_maps(&code);
        self.codehash = hashcode(&code);
        self.op_ix_map = op_ix_map;
        self.code_ops = code_ops;
        self.code = code;
    }

    /// Checks whether byte offset `pc` is a valid `JUMPDEST` in this
    /// account's code.
    #[must_use]
    pub fn is_valid_jump_dest(&self, pc: usize) -> bool {
        self.code.concrete_byte_at(pc) == Some(Op::JumpDest.as_byte())
            && self
                .op_ix_map
                .get(pc)
                .and_then(|ix| self.code_ops.get(*ix as usize))
                .is_some_and(|(_, op)| *op == Op::JumpDest)
    }

    /// Checks whether the account is empty in the sense of
    /// [EIP-161](https://eips.ethereum.org/EIPS/eip-161): zero nonce, zero
    /// balance and no code.
    #[must_use]
    pub fn is_empty_account(&self) -> bool {
        let no_code = match &self.code {
            ContractCode::InitCode(prefix, args) => {
                prefix.is_empty() && args.maybe_concrete() == Some(&[])
            }
            ContractCode::RuntimeCode(RuntimeCode::Concrete(bytes)) => bytes.is_empty(),
            ContractCode::RuntimeCode(RuntimeCode::Symbolic(bytes)) => bytes.is_empty(),
        };
        no_code
            && self.nonce == Some(0)
            && self.balance.maybe_lit() == Some(U256::ZERO)
    }
}

/// Computes the code hash of `code`, folding to a literal when the code is
/// fully concrete.
#[must_use]
pub fn hashcode(code: &ContractCode) -> Word {
    let buffer = code.to_buf();
    match buffer.maybe_concrete() {
        Some(bytes) => Word::Lit(crypto::keccak256_word(bytes)),
        None => Word::Keccak {
            buffer: std::rc::Rc::new(buffer),
        },
    }
}

/// Derives the operation maps for `code`.
fn derive_code_maps(code: &ContractCode) -> (Vec<u32>, Vec<(u32, Op)>) {
    let view = code.disassembly_view();
    let op_ix_map = disassembly::op_ix_map(&view);
    let code_ops = disassembly::code_ops(disassembly::strip_bytecode_metadata(&view));
    (op_ix_map, code_ops)
}
