//! This module contains the errors that can halt a frame during execution.

use thiserror::Error;

use crate::{
    expr::{Buf, Word},
    vm::query::{Choice, Query},
};

/// The ways in which executing an operation can fail.
///
/// The engine never unwinds through panics or early returns: every failure is
/// routed through `finish_frame`, and the paused states of the query protocol
/// travel through the same channel (as [`EvmError::Query`] and
/// [`EvmError::Choose`]) so that a driver observes a single "paused or done"
/// result.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum EvmError {
    #[error("Balance of {have} is below the required {want}")]
    BalanceTooLow { have: Word, want: Word },

    #[error("Unrecognized opcode 0x{0:02x}")]
    UnrecognizedOpcode(u8),

    #[error("Executing account has been self-destructed")]
    SelfDestruction,

    #[error("Stack underrun")]
    StackUnderrun,

    #[error("Bad jump destination")]
    BadJumpDestination,

    #[error("Execution reverted with {0}")]
    Revert(Buf),

    #[error("Out of gas: {have} available, {need} needed")]
    OutOfGas { have: u64, need: u64 },

    #[error("Bad cheat code call with selector {0:#010x?}")]
    BadCheatCode(Option<u32>),

    #[error("Stack limit exceeded")]
    StackLimitExceeded,

    #[error("Arithmetic overflow while computing a memory range")]
    IllegalOverflow,

    #[error("Paused on a query: {0}")]
    Query(Query),

    #[error("Paused on a path choice: {0}")]
    Choose(Choice),

    #[error("State modification attempted inside a static call")]
    StateChangeWhileStatic,

    #[error("Invalid memory access")]
    InvalidMemoryAccess,

    #[error("Call depth limit reached")]
    CallDepthLimitReached,

    #[error("Code of size {actual} exceeds the maximum of {limit}")]
    MaxCodeSizeExceeded { limit: u64, actual: u64 },

    #[error("Deployed code starts with the reserved 0xEF byte")]
    InvalidFormat,

    #[error("Precompiled contract failed")]
    PrecompileFailure,

    #[error("Unexpected symbolic argument at pc {pc}: {msg}")]
    UnexpectedSymbolicArg {
        pc:   usize,
        msg:  String,
        args: Vec<Word>,
    },

    #[error("The path conditions are unsatisfiable")]
    DeadPath,

    #[error("Expected a unique value for {0}")]
    NotUnique(Word),

    #[error("The solver timed out")]
    SmtTimeout,

    #[error("FFI execution failed: {0:?}")]
    Ffi(Vec<String>),

    #[error("Nonce overflow")]
    NonceOverflow,
}

/// The result type for operations that can fail with an [`EvmError`].
pub type Result<T> = std::result::Result<T, EvmError>;
