//! This library implements a stepwise symbolic execution engine for
//! [EVM](https://ethereum.org/en/developers/docs/evm/) bytecode: an
//! interpreter that advances an EVM state one opcode at a time over a value
//! domain mixing concrete 256-bit words and byte buffers with symbolic
//! expressions for unknown inputs (calldata, storage, block environment).
//!
//! The engine reproduces the gas accounting, memory semantics, storage
//! semantics, call/return frames and revert bookkeeping of a real EVM while
//! letting entire regions of state remain unknown, which makes it a suitable
//! core for equivalence checking, invariant proving and fuzz seed
//! generation.
//!
//! # How it Works
//!
//! 1. A [`vm::VM`] is built from [`vm::VmOpts`]: the contract under
//!    execution, its (possibly symbolic) calldata, and the block and
//!    transaction environment.
//! 2. The driver calls [`vm::VM::step`] repeatedly. Each call executes one
//!    opcode: it advances the current frame, pushes or pops a call frame, or
//!    pauses the machine with a [`vm::query::Query`] for data the engine
//!    cannot produce itself — contract code, storage slots, SMT branch
//!    decisions, or FFI output.
//! 3. The driver services a query through whatever backend it likes (an RPC
//!    node, an SMT solver, a subprocess) and hands the answer to
//!    [`vm::VM::resume`], after which stepping continues.
//! 4. When the last frame pops, the transaction is finalized — refunds, the
//!    miner payment, EIP-161 state clearing — and `result` holds the final
//!    [`vm::VmResult`] along with the accumulated path constraints.
//!
//! # Basic Usage
//!
//! ```
//! use symbolic_evm::{
//!     contract::{Contract, ContractCode, RuntimeCode},
//!     vm::{VmOpts, VmResult, VM},
//! };
//!
//! // PUSH1 1, PUSH1 2, ADD, STOP
//! let code = vec![0x60, 0x01, 0x60, 0x02, 0x01, 0x00];
//! let contract = Contract::new(ContractCode::RuntimeCode(RuntimeCode::Concrete(code)));
//!
//! let mut vm = VM::new(VmOpts {
//!     contract,
//!     ..VmOpts::default()
//! });
//! while vm.result().is_none() {
//!     vm.step();
//! }
//!
//! assert!(matches!(vm.result(), Some(VmResult::Success(_))));
//! ```

#![warn(clippy::all, clippy::cargo, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)] // Allows for better API naming

pub mod constant;
pub mod contract;
pub mod crypto;
pub mod disassembly;
pub mod error;
pub mod expr;
pub mod gas;
pub mod opcode;
pub mod rlp;
pub mod trace;
pub mod vm;

// Re-exports to provide the library interface.
pub use error::EvmError;
pub use vm::{VmOpts, VmResult, VM};
