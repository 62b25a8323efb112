//! This module contains the per-frame execution state of the virtual machine.

pub mod memory;
pub mod stack;

use crate::{
    contract::ContractCode,
    expr::{Addr, Buf, Word},
    vm::state::stack::Stack,
};

/// The registers of one frame of execution: program counter, stack, memory,
/// and the identity of the code being run.
#[derive(Clone, Debug)]
pub struct FrameState {
    /// The account in whose storage context the code executes.
    pub contract: Addr,

    /// The account whose code is executing. Differs from `contract` for
    /// `CALLCODE` and `DELEGATECALL`.
    pub code_contract: Addr,

    /// The code being executed.
    pub code: ContractCode,

    /// The program counter, as a byte offset into the code.
    pub pc: usize,

    /// The data stack.
    pub stack: Stack,

    /// The transient memory of the frame, as a single buffer expression.
    pub memory: Buf,

    /// The active size of memory in bytes. Always a multiple of 32, and grows
    /// monotonically as memory ranges are accessed.
    pub memory_size: u64,

    /// The input data of the frame.
    pub calldata: Buf,

    /// The value transferred into the frame.
    pub callvalue: Word,

    /// The account that initiated this frame.
    pub caller: Addr,

    /// The gas remaining in the frame.
    pub gas: u64,

    /// The output of the most recently completed subcall.
    pub returndata: Buf,

    /// Whether the frame executes in a static context, in which no persistent
    /// state may be modified.
    pub is_static: bool,
}

impl FrameState {
    /// Constructs the state of a frame about to begin executing `code` in the
    /// storage context of `contract`.
    #[must_use]
    pub fn new_for(contract: Addr, code_contract: Addr, code: ContractCode) -> Self {
        Self {
            contract,
            code_contract,
            code,
            pc: 0,
            stack: Stack::new(),
            memory: Buf::empty(),
            memory_size: 0,
            calldata: Buf::empty(),
            callvalue: Word::from(0u64),
            caller: Addr::from(0u64),
            gas: 0,
            returndata: Buf::empty(),
            is_static: false,
        }
    }
}
