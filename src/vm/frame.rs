//! This module contains the call/creation frame machine: the contexts pushed
//! when execution enters a callee, and the single unwinding point
//! `finish_frame` through which every frame completion — return, revert or
//! error — flows.

use std::collections::BTreeMap;

use ethnum::U256;

use crate::{
    contract::{Contract, ContractCode, RuntimeCode},
    error::EvmError,
    expr::{buf, word, Addr, Buf, Byte, Storage, Word, W256},
    trace::{Trace, TraceData},
    vm::{state::FrameState, Substate, VmResult, VM},
};

/// The address whose membership in `touchedAccounts` survives reverts, per
/// Yellow Paper appendix K.1 (the RIPEMD-160 precompile quirk inherited from
/// the 2016 state-clearing fork).
const PRESERVED_TOUCHED_ADDRESS: u64 = 3;

/// A suspended parent frame: its register state at the moment of the call,
/// plus the context describing how the callee's completion feeds back into
/// it.
#[derive(Clone, Debug)]
pub struct Frame {
    /// The parent's state, with the call's arguments already consumed and the
    /// program counter already advanced.
    pub state: FrameState,

    /// The context of the callee execution.
    pub context: FrameContext,
}

/// The immutable context carried by a frame for the duration of a callee's
/// execution.
#[derive(Clone, Debug)]
pub enum FrameContext {
    /// The callee is initcode creating a contract.
    Creation {
        /// The address being created.
        address: Addr,

        /// The code hash of the initcode.
        codehash: Word,

        /// The contracts as they stood at entry.
        reversion: BTreeMap<Addr, Contract>,

        /// The storage as it stood at entry.
        storage_reversion: Storage,

        /// The substate as it stood at entry.
        substate: Substate,
    },

    /// The callee is an existing contract entered through the `CALL` family.
    Call {
        /// The account whose code runs.
        target: Addr,

        /// The account whose storage context the code runs in.
        context: Addr,

        /// Where in the caller's memory the output lands.
        out_offset: W256,

        /// How much of the output lands in the caller's memory.
        out_size: W256,

        /// The code hash of the callee.
        codehash: Word,

        /// The four-byte ABI selector of the call, when statically visible.
        abi: Option<u32>,

        /// The calldata passed to the callee.
        calldata: Buf,

        /// The contracts and storage as they stood at entry.
        reversion: (BTreeMap<Addr, Contract>, Storage),

        /// The substate as it stood at entry.
        substate: Substate,
    },
}

/// The ways in which the current frame can complete.
#[derive(Clone, Debug)]
pub enum FrameResult {
    /// The frame returned normally with the given output.
    Returned(Buf),

    /// The frame reverted with the given output.
    Reverted(Buf),

    /// The frame failed.
    Errored(EvmError),
}

impl VM {
    /// Completes the current frame and unwinds into the parent, or halts the
    /// machine when the current frame is the last one.
    ///
    /// This is the sole unwinding point of the engine: every error path calls
    /// it, and it never fails itself.
    pub(crate) fn finish_frame(&mut self, how: FrameResult) {
        self.record_frame_completion(&how);

        let Some(frame) = self.frames.pop() else {
            self.finalize(&how);
            self.result = Some(match how {
                FrameResult::Returned(output) => VmResult::Success(output),
                FrameResult::Reverted(output) => VmResult::Failure(EvmError::Revert(output)),
                FrameResult::Errored(error) => VmResult::Failure(error),
            });
            return;
        };

        let finished = std::mem::replace(&mut self.state, frame.state);
        let remaining_gas = finished.gas;

        match frame.context {
            FrameContext::Call {
                out_offset,
                out_size,
                reversion,
                substate,
                ..
            } => match how {
                FrameResult::Returned(output) => {
                    self.reclaim_gas_allowance(remaining_gas);
                    self.deliver_call_output(&output, out_offset, out_size);
                    self.push_unchecked(word::one());
                }
                FrameResult::Reverted(output) => {
                    self.revert_world(reversion.0, reversion.1);
                    self.revert_substate(substate);
                    self.reclaim_gas_allowance(remaining_gas);
                    self.deliver_call_output(&output, out_offset, out_size);
                    self.push_unchecked(word::zero());
                }
                FrameResult::Errored(_) => {
                    self.revert_world(reversion.0, reversion.1);
                    self.revert_substate(substate);
                    self.state.returndata = Buf::empty();
                    self.push_unchecked(word::zero());
                }
            },
            FrameContext::Creation {
                address,
                reversion,
                storage_reversion,
                substate,
                ..
            } => match how {
                FrameResult::Returned(output) => {
                    self.reclaim_gas_allowance(remaining_gas);
                    self.install_runtime_code(address, &output);
                    self.state.returndata = Buf::empty();
                    self.push_unchecked(Word::Lit(address.into_word()));
                }
                FrameResult::Reverted(output) => {
                    // The reversion snapshot was taken after the creator's
                    // nonce bump, so the bump survives the revert.
                    self.revert_world(reversion, storage_reversion);
                    self.revert_substate(substate);
                    self.reclaim_gas_allowance(remaining_gas);
                    self.state.returndata = output;
                    self.push_unchecked(word::zero());
                }
                FrameResult::Errored(_) => {
                    self.revert_world(reversion, storage_reversion);
                    self.revert_substate(substate);
                    self.state.returndata = Buf::empty();
                    self.push_unchecked(word::zero());
                }
            },
        }
    }

    /// Copies a completed call's `output` into the caller's memory at the
    /// out-region agreed at call time, and installs it as the caller's return
    /// data.
    fn deliver_call_output(&mut self, output: &Buf, out_offset: W256, out_size: W256) {
        self.state.returndata = output.clone();
        let copied = word::min(buf::length(output), Word::Lit(out_size));
        self.copy_bytes_to_memory(output, copied, word::zero(), Word::Lit(out_offset));
    }

    /// Installs the runtime code a creation frame returned at `address`.
    fn install_runtime_code(&mut self, address: Addr, output: &Buf) {
        let code = runtime_code_from_buf(output);
        self.with_contract_mut(address, |contract| contract.replace_code(code));
    }

    /// Returns the callee's unspent gas allowance to the parent frame. Not
    /// applied for errored frames, whose entire allowance is consumed.
    fn reclaim_gas_allowance(&mut self, remaining: u64) {
        self.burned = self.burned.saturating_sub(remaining);
        self.state.gas += remaining;
    }

    /// Restores the contracts and storage captured in a reversion snapshot.
    fn revert_world(&mut self, contracts: BTreeMap<Addr, Contract>, storage: Storage) {
        self.env.contracts = contracts;
        self.env.storage = storage;
    }

    /// Restores the substate captured at call entry, preserving the
    /// membership of address 3 in the touched set as Yellow Paper appendix
    /// K.1 requires.
    fn revert_substate(&mut self, snapshot: Substate) {
        let preserved = Addr::from(PRESERVED_TOUCHED_ADDRESS);
        let had_preserved = self
            .tx
            .substate
            .touched_accounts
            .contains(&preserved);
        self.tx.substate = snapshot;
        if had_preserved && !self.tx.substate.touched_accounts.contains(&preserved) {
            self.tx.substate.touched_accounts.push(preserved);
        }
    }

    /// Pushes a frame-completion status flag onto the parent's stack.
    ///
    /// The parent popped at least the call arguments to get here, so room is
    /// guaranteed.
    fn push_unchecked(&mut self, value: Word) {
        self.state
            .stack
            .push(value)
            .expect("the parent freed stack room by popping the call arguments");
    }

    /// Records the completion of the current frame in the trace tree and
    /// moves the trace cursor back to the parent.
    fn record_frame_completion(&mut self, how: &FrameResult) {
        let record = Trace {
            pc: self.state.pc,
            address: self.state.contract,
            data: match how {
                FrameResult::Returned(output) => TraceData::FrameReturned(output.clone()),
                FrameResult::Reverted(output) => TraceData::FrameReverted(output.clone()),
                FrameResult::Errored(error) => TraceData::Error(error.clone()),
            },
        };
        self.traces.record(record);
        self.traces.exit();
    }
}

/// Converts a creation frame's output buffer into runtime code: concrete
/// bytecode when fully known, per-byte symbolic code otherwise.
///
/// The `RETURN` handler forces the output size concrete for creation frames,
/// so the buffer's length is always statically known here.
pub(crate) fn runtime_code_from_buf(output: &Buf) -> ContractCode {
    if let Some(bytes) = output.maybe_concrete() {
        return ContractCode::RuntimeCode(RuntimeCode::Concrete(bytes.to_vec()));
    }

    let length = buf::length(output)
        .maybe_lit()
        .map_or(0, |length| length.as_usize());
    let bytes: Vec<Byte> = (0..length)
        .map(|i| buf::read_byte(&Word::Lit(U256::from(i as u64)), output))
        .collect();

    if bytes.iter().all(|byte| byte.maybe_lit().is_some()) {
        ContractCode::RuntimeCode(RuntimeCode::Concrete(
            bytes.iter().filter_map(Byte::maybe_lit).collect(),
        ))
    } else {
        ContractCode::RuntimeCode(RuntimeCode::Symbolic(bytes))
    }
}
