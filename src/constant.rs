//! This module contains constants that are needed throughout the codebase.

/// The maximum size that a contract can have when being deployed on the
/// blockchain.
///
/// This is specified in [EIP-170](https://eips.ethereum.org/EIPS/eip-170).
pub const CONTRACT_MAXIMUM_SIZE_BYTES: u64 = 24576;

/// The maximum depth of the data stack for the EVM.
pub const MAXIMUM_STACK_DEPTH: usize = 1024;

/// The maximum nesting depth for message calls and contract creations.
pub const MAXIMUM_CALL_DEPTH: usize = 1024;

/// The width of a word on the EVM in bytes.
pub const WORD_SIZE_BYTES: u64 = 32;

/// The base byte value for the `PUSH` opcode, for `N > 0`.
///
/// This is constructed such that for `PUSHN`, `PUSH_OPCODE_BASE_VALUE` + `N`
/// equals the byte value for the corresponding `PUSH` opcode.
pub const PUSH_OPCODE_BASE_VALUE: u8 = 0x5f;

/// The base byte value for the `DUP` opcode.
///
/// This is constructed such that for `DUPN`, `DUP_OPCODE_BASE_VALUE` + `N`
/// equals the byte value for the corresponding `DUP` opcode.
pub const DUP_OPCODE_BASE_VALUE: u8 = 0x7f;

/// The base byte value for the `SWAP` opcode.
///
/// This is constructed such that for `SWAPN`, `SWAP_OPCODE_BASE_VALUE` + `N`
/// equals the byte value for the corresponding `SWAP` opcode.
pub const SWAP_OPCODE_BASE_VALUE: u8 = 0x8f;

/// The base byte value for the `LOG` opcode.
///
/// This is constructed such that for `LOGN`, `LOG_OPCODE_BASE_VALUE` + `N`
/// equals the byte value for the corresponding `LOG` opcode.
pub const LOG_OPCODE_BASE_VALUE: u8 = 0xa0;

/// The maximum number of bytes that can be pushed at once using the `PUSH`
/// opcode.
pub const PUSH_OPCODE_MAX_BYTES: u8 = 32;

/// The address of the highest-numbered precompiled contract that the engine
/// dispatches natively.
///
/// Addresses `0x01` through this value are treated as precompiles rather than
/// ordinary contracts.
pub const MAXIMUM_PRECOMPILE_ADDRESS: u64 = 0x09;

/// The number of recent blocks for which the `BLOCKHASH` opcode produces a
/// non-zero answer.
pub const BLOCKHASH_HISTORY_WINDOW: u64 = 256;

/// The string whose keccak-256 hash, truncated to its low 20 bytes, addresses
/// the cheat-action dispatcher.
pub const CHEAT_CODE_PHRASE: &str = "hevm cheat code";
