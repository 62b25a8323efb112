//! This module contains the query protocol through which the engine pauses
//! itself and asks the driver for outside information: contract code, storage
//! slots, SMT branch decisions and FFI results.
//!
//! A query is surfaced by writing it into the VM's `result` field (wrapped in
//! [`EvmError::Query`] or [`EvmError::Choose`]); a private pending-operation
//! record remembers how the answer is to be consumed. [`VM::resume`] applies
//! the answer and clears the paused state, after which the driver simply
//! calls `step` again.
//!
//! Queries that can be satisfied by re-running the current opcode (account
//! and slot fetches) are emitted *before* the opcode mutates anything, so
//! re-execution after the answer is installed is idempotent. Branch and FFI
//! queries instead carry explicit continuation data.

use std::fmt::{Display, Formatter};

use log::debug;
use thiserror::Error;

use crate::{
    contract::Contract,
    error::EvmError,
    expr::{prop, word, Addr, Buf, Prop, Word, W256},
    vm::{frame::FrameResult, CodeLocation, VmResult, VM},
};

/// A request for information that the engine cannot produce by itself.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Query {
    /// The engine needs the contract at `address`. Answer with
    /// [`QueryAnswer::Contract`].
    FetchContract { address: Addr },

    /// The engine needs the value of `slot` of the external contract at
    /// `address`. Answer with [`QueryAnswer::Slot`].
    FetchSlot { address: Addr, slot: W256 },

    /// The engine reached a conditional branch whose condition is symbolic.
    /// `path` holds the constraints accumulated so far. Answer with
    /// [`QueryAnswer::Branch`].
    AskSmt { condition: Word, path: Vec<Prop> },

    /// The engine needs the output of running `command` outside the EVM.
    /// Answer with [`QueryAnswer::Ffi`].
    ExecFfi { command: Vec<String> },
}

impl Display for Query {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FetchContract { address } => write!(f, "fetch contract {address}"),
            Self::FetchSlot { address, slot } => {
                write!(f, "fetch slot 0x{slot:x} of {address}")
            }
            Self::AskSmt { condition, .. } => write!(f, "decide branch on {condition}"),
            Self::ExecFfi { command } => write!(f, "execute {command:?}"),
        }
    }
}

/// A request for the user to pick a side of a branch that the solver could
/// not decide.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Choice {
    /// Pick whether the branch on `condition` is taken. Answer with
    /// [`QueryAnswer::Path`].
    Path { condition: Word },
}

impl Display for Choice {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path { condition } => write!(f, "choose branch on {condition}"),
        }
    }
}

/// The driver's answer to a [`Query`] or [`Choice`].
#[derive(Clone, Debug)]
pub enum QueryAnswer {
    /// The contract requested by [`Query::FetchContract`].
    Contract(Contract),

    /// The slot value requested by [`Query::FetchSlot`].
    Slot(W256),

    /// The solver's verdict for [`Query::AskSmt`].
    Branch(BranchAnswer),

    /// The user's pick for [`Choice::Path`].
    Path(bool),

    /// The standard output requested by [`Query::ExecFfi`].
    Ffi(Vec<u8>),
}

/// The solver's answer to a branch query.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BranchAnswer {
    /// Only the given side of the branch is feasible (or the driver wants
    /// that side explored first).
    Case(bool),

    /// The solver could not decide; the engine re-emits the branch as a
    /// [`Choice::Path`] for interactive resolution.
    Unknown,

    /// The path conditions are themselves unsatisfiable; execution of this
    /// path halts with [`EvmError::DeadPath`].
    Inconsistent,
}

/// The private record of how to consume a query answer.
#[derive(Clone, Debug)]
pub(crate) enum PendingOp {
    /// Install the fetched contract at `address`, then re-run the current
    /// opcode.
    AccountFetch { address: Addr },

    /// Install the fetched value of `(address, slot)`, then re-run the
    /// current opcode.
    SlotFetch { address: Addr, slot: W256 },

    /// Resolve a conditional branch: constrain `condition`, record the
    /// decision for `location` in the path cache, and set the program
    /// counter.
    Branch {
        condition:   Word,
        location:    CodeLocation,
        jump_target: usize,
        fallthrough: usize,
    },

    /// Complete a paused `ffi` cheat action by installing its output.
    Ffi { out_offset: W256, out_size: W256 },
}

/// The ways in which [`VM::resume`] can reject an answer.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ResumeError {
    #[error("The VM is not paused on a query")]
    NotPaused,

    #[error("The answer does not match the pending query")]
    AnswerMismatch,
}

impl VM {
    /// Answers the query the VM is currently paused on and readies the VM for
    /// the next `step` call.
    ///
    /// # Errors
    ///
    /// Returns [`ResumeError::NotPaused`] when the VM is not paused on a
    /// query, and [`ResumeError::AnswerMismatch`] when `answer` is of the
    /// wrong kind for the pending query.
    pub fn resume(&mut self, answer: QueryAnswer) -> Result<(), ResumeError> {
        if self.pending.is_none() {
            return Err(ResumeError::NotPaused);
        }

        match (self.pending.take().expect("pending was checked above"), answer) {
            (PendingOp::AccountFetch { address }, QueryAnswer::Contract(contract)) => {
                debug!("resume: installing fetched contract at {address}");
                self.cache.fetched_contracts.insert(address, contract.clone());
                self.env.contracts.insert(address, contract);
                self.result = None;
            }
            (PendingOp::SlotFetch { address, slot }, QueryAnswer::Slot(value)) => {
                debug!("resume: installing fetched slot 0x{slot:x} of {address}");
                self.install_fetched_slot(address, slot, value);
                self.result = None;
            }
            (pending @ PendingOp::Branch { .. }, QueryAnswer::Branch(verdict)) => {
                match verdict {
                    BranchAnswer::Case(taken) => self.apply_branch(pending, taken),
                    BranchAnswer::Unknown => {
                        // Hand the decision to the user instead.
                        let PendingOp::Branch { ref condition, .. } = pending else {
                            unreachable!("pending was matched as a branch")
                        };
                        debug!("resume: solver returned unknown, deferring to the user");
                        self.result = Some(VmResult::Failure(EvmError::Choose(Choice::Path {
                            condition: condition.clone(),
                        })));
                        self.pending = Some(pending);
                    }
                    BranchAnswer::Inconsistent => {
                        self.result = None;
                        self.finish_frame(FrameResult::Errored(EvmError::DeadPath));
                    }
                }
            }
            (pending @ PendingOp::Branch { .. }, QueryAnswer::Path(taken)) => {
                self.apply_branch(pending, taken);
            }
            (PendingOp::Ffi {
                out_offset,
                out_size,
            }, QueryAnswer::Ffi(output)) => {
                self.complete_ffi(out_offset, out_size, &output);
            }
            (pending, _) => {
                // Put the record back so a correct answer can still arrive.
                self.pending = Some(pending);
                return Err(ResumeError::AnswerMismatch);
            }
        }

        Ok(())
    }

    /// Writes a fetched slot value into storage, the fetch cache, and the
    /// transaction-start snapshot used for refund accounting.
    pub(crate) fn install_fetched_slot(&mut self, address: Addr, slot: W256, value: W256) {
        self.cache.fetched_slots.insert((address, slot), value);
        self.env
            .orig_storage
            .entry(address)
            .or_default()
            .entry(slot)
            .or_insert(value);
        let storage = std::mem::replace(&mut self.env.storage, crate::expr::Storage::Empty);
        self.env.storage = crate::expr::storage::write(
            address,
            Word::Lit(slot),
            Word::Lit(value),
            storage,
        );
    }

    /// Applies a branch decision: appends the path constraint, records the
    /// decision in the path cache, and moves the program counter.
    pub(crate) fn apply_branch(&mut self, pending: PendingOp, taken: bool) {
        let PendingOp::Branch {
            condition,
            location,
            jump_target,
            fallthrough,
        } = pending
        else {
            unreachable!("apply_branch is only called with a branch record")
        };

        let constraint = if taken {
            prop::is_nonzero(condition)
        } else {
            prop::is_zero(condition)
        };
        self.constraints.push(constraint);

        let iteration = self.iterations.get(&location).copied().unwrap_or(0);
        self.cache.path.insert((location, iteration), taken);
        self.iterations.insert(location, iteration + 1);

        self.result = None;
        if taken {
            let valid = self
                .current_code_contract()
                .is_some_and(|contract| contract.is_valid_jump_dest(jump_target));
            if valid {
                self.state.pc = jump_target;
            } else {
                self.finish_frame(FrameResult::Errored(EvmError::BadJumpDestination));
            }
        } else {
            self.state.pc = fallthrough;
        }
    }

    /// Completes a paused `ffi` cheat action by installing `output` as the
    /// call's return data.
    fn complete_ffi(&mut self, out_offset: W256, out_size: W256, output: &[u8]) {
        self.state.returndata = Buf::Concrete(output.to_vec());
        let copied = out_size.min(W256::from(output.len() as u64));
        let returndata = self.state.returndata.clone();
        self.copy_bytes_to_memory(
            &returndata,
            Word::Lit(copied),
            word::zero(),
            Word::Lit(out_offset),
        );
        self.state
            .stack
            .push(word::one())
            .expect("room was freed by popping the call arguments");
        self.result = None;
    }

    /// Attempts to answer a branch from the cross-run path cache, so that a
    /// previously decided `(location, iteration)` pair is not asked again.
    pub(crate) fn cached_branch_decision(&self, location: CodeLocation) -> Option<bool> {
        let iteration = self.iterations.get(&location).copied().unwrap_or(0);
        self.cache.path.get(&(location, iteration)).copied()
    }
}
