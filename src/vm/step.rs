//! This module contains the single-step opcode dispatcher.
//!
//! [`VM::step`] is total: a machine whose `result` is [`None`] always
//! transitions — by advancing the program counter, pushing or popping a
//! frame, or pausing on a query. Within one step the order of operations is
//! fixed: the static-context check, then operand reads, then memory-range
//! access (which may grow and bill memory), then the gas burn, then the state
//! mutation, then the program-counter advance. Gas is always billed before
//! any observable state change, so an out-of-gas failure leaves the frame
//! exhausted but otherwise clean.

use ethnum::U256;
use log::trace;

use crate::{
    constant::{BLOCKHASH_HISTORY_WINDOW, MAXIMUM_CALL_DEPTH, MAXIMUM_PRECOMPILE_ADDRESS},
    contract::{Contract, ContractCode},
    crypto,
    error::EvmError,
    expr::{buf, storage, word, Addr, Buf, LogEntry, Storage, Word, W256},
    opcode::Op,
    trace::{Trace, TraceData},
    vm::{
        cheat,
        frame::{Frame, FrameContext, FrameResult},
        query::{PendingOp, Query},
        state::FrameState,
        StorageBase, VmResult, VM,
    },
};

/// The ways in which the linear execution of an opcode can be interrupted.
#[derive(Clone, Debug)]
pub(crate) enum Interrupt {
    /// The frame failed; `finish_frame` unwinds it.
    Fault(EvmError),

    /// The machine pauses on a query. `surface` is written into the result
    /// field and `pending` remembers how to consume the answer.
    Suspend {
        surface: EvmError,
        pending: PendingOp,
    },
}

impl From<EvmError> for Interrupt {
    fn from(error: EvmError) -> Self {
        Self::Fault(error)
    }
}

/// The result type threaded through the opcode implementations.
pub(crate) type Step<T> = Result<T, Interrupt>;

impl VM {
    /// Advances the machine by one opcode.
    ///
    /// Does nothing when the machine has already halted or paused; a paused
    /// machine is revived with [`VM::resume`].
    pub fn step(&mut self) {
        if self.result.is_some() {
            return;
        }

        match self.exec_op() {
            Ok(()) => {}
            Err(Interrupt::Fault(error)) => self.finish_frame(FrameResult::Errored(error)),
            Err(Interrupt::Suspend { surface, pending }) => {
                self.pending = Some(pending);
                self.result = Some(VmResult::Failure(surface));
            }
        }
    }

    /// Executes the opcode under the program counter.
    #[allow(clippy::too_many_lines)] // The dispatcher is a single flat table.
    fn exec_op(&mut self) -> Step<()> {
        let self_addr = self.state.contract;
        let fees = self.block.schedule.clone();

        // Frames entered directly on a precompiled contract run it in one
        // step.
        let addr_word = self_addr.into_word();
        if addr_word >= U256::ONE && addr_word <= U256::from(MAXIMUM_PRECOMPILE_ADDRESS) {
            return self.exec_precompile_frame(addr_word.as_u64());
        }

        // Walking off the end of the code is an implicit STOP.
        if self.state.pc >= self.state.code.opslen() {
            self.finish_frame(FrameResult::Returned(Buf::empty()));
            return Ok(());
        }

        let Some(op_byte) = self.state.code.concrete_byte_at(self.state.pc) else {
            return Err(self.symbolic_fault("attempted to execute a symbolic code byte", vec![]));
        };
        let op = Op::from_byte(op_byte);
        trace!("pc {:>5}  {}", self.state.pc, op.as_text_code());

        match op {
            Op::Stop => self.finish_frame(FrameResult::Returned(Buf::empty())),

            // Arithmetic.
            Op::Add => self.stack_op2(op, fees.g_verylow, word::add)?,
            Op::Mul => self.stack_op2(op, fees.g_low, word::mul)?,
            Op::Sub => self.stack_op2(op, fees.g_verylow, word::sub)?,
            Op::Div => self.stack_op2(op, fees.g_low, word::div)?,
            Op::SDiv => self.stack_op2(op, fees.g_low, word::sdiv)?,
            Op::Mod => self.stack_op2(op, fees.g_low, word::emod)?,
            Op::SMod => self.stack_op2(op, fees.g_low, word::smod)?,
            Op::AddMod => self.stack_op3(op, fees.g_mid, word::addmod)?,
            Op::MulMod => self.stack_op3(op, fees.g_mid, word::mulmod)?,
            Op::SignExtend => self.stack_op2(op, fees.g_low, word::sex)?,
            Op::Exp => {
                let base = self.pop()?;
                let exponent = self.pop()?;
                let exponent_lit =
                    self.force_concrete(&exponent, "EXP: symbolic exponent sets the gas cost")?;
                self.burn(fees.cost_of_exp(exponent_lit))?;
                self.push(word::exp(base, exponent))?;
                self.next(op);
            }

            // Comparison and bitwise logic.
            Op::Lt => self.stack_op2(op, fees.g_verylow, word::lt)?,
            Op::Gt => self.stack_op2(op, fees.g_verylow, word::gt)?,
            Op::SLt => self.stack_op2(op, fees.g_verylow, word::slt)?,
            Op::SGt => self.stack_op2(op, fees.g_verylow, word::sgt)?,
            Op::Eq => self.stack_op2(op, fees.g_verylow, word::eq)?,
            Op::IsZero => self.stack_op1(op, fees.g_verylow, word::iszero)?,
            Op::And => self.stack_op2(op, fees.g_verylow, word::and)?,
            Op::Or => self.stack_op2(op, fees.g_verylow, word::or)?,
            Op::Xor => self.stack_op2(op, fees.g_verylow, word::xor)?,
            Op::Not => self.stack_op1(op, fees.g_verylow, word::not)?,
            Op::Byte => self.stack_op2(op, fees.g_verylow, |index, value| {
                // BYTE is (x >> (8 * (31 - i))) & 0xff; the wrap-around of
                // the subtraction makes out-of-range indices shift to zero.
                word::and(
                    word::shr(
                        word::mul(word::sub(Word::from(31u64), index), Word::from(8u64)),
                        value,
                    ),
                    Word::from(0xffu64),
                )
            })?,
            Op::Shl => self.stack_op2(op, fees.g_verylow, word::shl)?,
            Op::Shr => self.stack_op2(op, fees.g_verylow, word::shr)?,
            Op::Sar => self.stack_op2(op, fees.g_verylow, word::sar)?,

            Op::Sha3 => {
                let offset = self.pop()?;
                let size = self.pop()?;
                let offset_lit = self.force_concrete(&offset, "SHA3: symbolic memory offset")?;
                let size_lit = self.force_concrete(&size, "SHA3: symbolic memory size")?;
                self.access_memory_range(offset_lit, size_lit)?;
                self.burn(fees.cost_of_sha3(size_lit.as_u64()))?;

                let region = match buf::maybe_slice(&offset, &size, &self.state.memory) {
                    Some(bytes) => Buf::Concrete(bytes),
                    None => self.read_memory(&offset, &size),
                };
                let hash = self.keccak_of(&region);
                self.push(hash)?;
                self.next(op);
            }

            // Execution environment.
            Op::Address => self.push_base_fee_item(op, Word::Lit(self_addr.into_word()))?,
            Op::Balance => {
                let target = self.force_addr(&self.peek(0)?.clone(), "BALANCE: symbolic address")?;
                self.ensure_account(target)?;
                self.pop()?;
                let warm = self.access_account(target);
                self.burn(self.account_access_fee(warm))?;
                let balance = self.env.contracts[&target].balance.clone();
                self.push(balance)?;
                self.next(op);
            }
            Op::Origin => self.push_base_fee_item(op, Word::Lit(self.tx.origin.into_word()))?,
            Op::Caller => self.push_base_fee_item(op, Word::Lit(self.state.caller.into_word()))?,
            Op::CallValue => self.push_base_fee_item(op, self.state.callvalue.clone())?,
            Op::CallDataLoad => {
                let calldata = self.state.calldata.clone();
                self.stack_op1(op, fees.g_verylow, |index| buf::read_word(&index, &calldata))?;
            }
            Op::CallDataSize => {
                let size = buf::length(&self.state.calldata);
                self.push_base_fee_item(op, size)?;
            }
            Op::CallDataCopy => {
                let calldata = self.state.calldata.clone();
                self.copy_into_memory(op, &calldata, None)?;
            }
            Op::CodeSize => {
                let size = code_size_word(&self.state.code);
                self.push_base_fee_item(op, size)?;
            }
            Op::CodeCopy => {
                let code = self.state.code.to_buf();
                self.copy_into_memory(op, &code, None)?;
            }
            Op::GasPrice => self.push_base_fee_item(op, Word::Lit(self.tx.gas_price))?,
            Op::ExtCodeSize => {
                let target =
                    self.force_addr(&self.peek(0)?.clone(), "EXTCODESIZE: symbolic address")?;
                if target == cheat::cheat_address() {
                    // The cheat dispatcher must look callable to the guards
                    // solidity inserts before calls.
                    self.pop()?;
                    self.burn(fees.g_warm_storage_read)?;
                    self.push(word::one())?;
                    self.next(op);
                    return Ok(());
                }
                self.ensure_account(target)?;
                self.pop()?;
                let warm = self.access_account(target);
                self.burn(self.account_access_fee(warm))?;
                let size = match &self.env.contracts[&target].code {
                    // An account still under construction has no visible
                    // code.
                    ContractCode::InitCode(_, _) => word::zero(),
                    code @ ContractCode::RuntimeCode(_) => {
                        Word::from(code.opslen() as u64)
                    }
                };
                self.push(size)?;
                self.next(op);
            }
            Op::ExtCodeCopy => {
                let target =
                    self.force_addr(&self.peek(0)?.clone(), "EXTCODECOPY: symbolic address")?;
                self.ensure_account(target)?;
                self.pop()?;
                let warm = self.access_account(target);
                let access_fee = self.account_access_fee(warm);
                let code = self.env.contracts[&target].code.to_buf();
                self.copy_into_memory(op, &code, Some(access_fee))?;
            }
            Op::ReturnDataSize => {
                let size = buf::length(&self.state.returndata);
                self.push_base_fee_item(op, size)?;
            }
            Op::ReturnDataCopy => {
                let dst_offset = self.pop()?;
                let src_offset = self.pop()?;
                let size = self.pop()?;
                let dst_lit =
                    self.force_concrete(&dst_offset, "RETURNDATACOPY: symbolic memory offset")?;
                let size_lit = self.force_concrete(&size, "RETURNDATACOPY: symbolic size")?;
                self.access_memory_range(dst_lit, size_lit)?;
                self.burn(fees.cost_of_copy(fees.g_verylow, size_lit.as_u64()))?;

                // Reading past the end of the return buffer is a hard fault,
                // unlike the zero-extension of ordinary buffer reads.
                if let (Some(src), Some(len)) = (
                    src_offset.maybe_lit(),
                    buf::length(&self.state.returndata).maybe_lit(),
                ) {
                    if src.wrapping_add(size_lit) > len || src.wrapping_add(size_lit) < src {
                        return Err(EvmError::InvalidMemoryAccess.into());
                    }
                }
                let returndata = self.state.returndata.clone();
                self.copy_bytes_to_memory(&returndata, size, src_offset, dst_offset);
                self.next(op);
            }
            Op::ExtCodeHash => {
                let target =
                    self.force_addr(&self.peek(0)?.clone(), "EXTCODEHASH: symbolic address")?;
                self.ensure_account(target)?;
                self.pop()?;
                let warm = self.access_account(target);
                self.burn(self.account_access_fee(warm))?;
                let contract = &self.env.contracts[&target];
                let hash = if contract.is_empty_account() {
                    word::zero()
                } else {
                    contract.codehash.clone()
                };
                self.push(hash)?;
                self.next(op);
            }

            // Block data.
            Op::BlockHash => {
                let number = self.pop()?;
                self.burn(fees.g_blockhash)?;
                let hash = match number.maybe_lit() {
                    Some(requested) => {
                        let current = self.block.number;
                        let in_window = requested < current
                            && current - requested <= U256::from(BLOCKHASH_HISTORY_WINDOW);
                        if in_window {
                            Word::Lit(crypto::synthetic_block_hash(requested))
                        } else {
                            word::zero()
                        }
                    }
                    None => Word::BlockHash {
                        number: Box::new(number),
                    },
                };
                self.push(hash)?;
                self.next(op);
            }
            Op::Coinbase => {
                self.push_base_fee_item(op, Word::Lit(self.block.coinbase.into_word()))?;
            }
            Op::Timestamp => self.push_base_fee_item(op, self.block.timestamp.clone())?,
            Op::Number => self.push_base_fee_item(op, Word::Lit(self.block.number))?,
            Op::PrevRandao => self.push_base_fee_item(op, Word::Lit(self.block.prev_randao))?,
            Op::GasLimit => self.push_base_fee_item(op, Word::from(self.block.gas_limit))?,
            Op::ChainId => self.push_base_fee_item(op, Word::Lit(self.env.chain_id))?,
            Op::SelfBalance => {
                let balance = self
                    .env
                    .contracts
                    .get(&self_addr)
                    .map_or(word::zero(), |contract| contract.balance.clone());
                self.burn(fees.g_low)?;
                self.push(balance)?;
                self.next(op);
            }
            Op::BaseFee => self.push_base_fee_item(op, Word::Lit(self.block.base_fee))?,

            // Stack, memory, storage and flow.
            Op::Pop => {
                self.pop()?;
                self.burn(fees.g_base)?;
                self.next(op);
            }
            Op::MLoad => {
                let offset = self.pop()?;
                let offset_lit = self.force_concrete(&offset, "MLOAD: symbolic memory offset")?;
                self.access_memory_range(offset_lit, U256::from(32u64))?;
                self.burn(fees.g_verylow)?;
                let value = buf::read_word(&offset, &self.state.memory);
                self.push(value)?;
                self.next(op);
            }
            Op::MStore => {
                let offset = self.pop()?;
                let value = self.pop()?;
                let offset_lit = self.force_concrete(&offset, "MSTORE: symbolic memory offset")?;
                self.access_memory_range(offset_lit, U256::from(32u64))?;
                self.burn(fees.g_verylow)?;
                self.write_memory_word(offset, value);
                self.next(op);
            }
            Op::MStore8 => {
                let offset = self.pop()?;
                let value = self.pop()?;
                let offset_lit = self.force_concrete(&offset, "MSTORE8: symbolic memory offset")?;
                self.access_memory_range(offset_lit, U256::ONE)?;
                self.burn(fees.g_verylow)?;
                let byte = word::index_word(Word::from(31u64), value);
                self.write_memory_byte(offset, byte);
                self.next(op);
            }
            Op::SLoad => self.exec_sload(op)?,
            Op::SStore => self.exec_sstore(op)?,
            Op::Jump => {
                let destination = self.pop()?;
                self.burn(fees.g_mid)?;
                let destination =
                    self.force_concrete(&destination, "JUMP: symbolic jump destination")?;
                self.jump_to(destination)?;
            }
            Op::JumpI => self.exec_jumpi(op)?,
            Op::Pc => {
                let pc = self.state.pc;
                self.push_base_fee_item(op, Word::from(pc as u64))?;
            }
            Op::MSize => {
                let size = self.state.memory_size;
                self.push_base_fee_item(op, Word::from(size))?;
            }
            Op::Gas => {
                self.burn(fees.g_base)?;
                let remaining = self.state.gas;
                self.push(Word::from(remaining))?;
                self.next(op);
            }
            Op::JumpDest => {
                self.burn(fees.g_jumpdest)?;
                self.next(op);
            }

            // Pushes, dups, swaps, logs.
            Op::Push0 => self.push_base_fee_item(op, word::zero())?,
            Op::Push(count) => {
                let value = self.read_push_immediate(count)?;
                self.burn(fees.g_verylow)?;
                self.push(value)?;
                self.next(op);
            }
            Op::Dup(n) => {
                self.burn(fees.g_verylow)?;
                self.state.stack.dup(n as usize).map_err(Interrupt::from)?;
                self.next(op);
            }
            Op::Swap(n) => {
                self.burn(fees.g_verylow)?;
                self.state.stack.swap(n as usize).map_err(Interrupt::from)?;
                self.next(op);
            }
            Op::Log(topic_count) => self.exec_log(op, topic_count)?,

            // Frames.
            Op::Create | Op::Create2 => self.exec_create(op)?,
            Op::Call | Op::CallCode | Op::DelegateCall | Op::StaticCall => self.exec_call(op)?,
            Op::Return => {
                let offset = self.pop()?;
                let size = self.pop()?;
                let offset_lit = self.force_concrete(&offset, "RETURN: symbolic memory offset")?;
                let size_lit = self.force_concrete(&size, "RETURN: symbolic memory size")?;
                self.access_memory_range(offset_lit, size_lit)?;
                let output = self.read_memory(&offset, &size);

                if self.in_creation_context() {
                    if buf::read_byte(&word::zero(), &output).maybe_lit() == Some(0xef)
                        && size_lit > U256::ZERO
                    {
                        return Err(EvmError::InvalidFormat.into());
                    }
                    if size_lit > U256::from(self.block.max_code_size) {
                        return Err(EvmError::MaxCodeSizeExceeded {
                            limit:  self.block.max_code_size,
                            actual: size_lit.as_u64(),
                        }
                        .into());
                    }
                    self.burn(fees.g_codedeposit * size_lit.as_u64())?;
                }
                self.finish_frame(FrameResult::Returned(output));
            }
            Op::Revert => {
                let offset = self.pop()?;
                let size = self.pop()?;
                let offset_lit = self.force_concrete(&offset, "REVERT: symbolic memory offset")?;
                let size_lit = self.force_concrete(&size, "REVERT: symbolic memory size")?;
                self.access_memory_range(offset_lit, size_lit)?;
                let output = self.read_memory(&offset, &size);
                self.finish_frame(FrameResult::Reverted(output));
            }
            Op::SelfDestruct => self.exec_selfdestruct()?,

            Op::Unknown(byte) => return Err(EvmError::UnrecognizedOpcode(byte).into()),
        }

        Ok(())
    }

    // --- Shared opcode shapes ------------------------------------------

    /// A one-operand stack operation: pop, burn, push the image, advance.
    fn stack_op1(&mut self, op: Op, fee: u64, f: impl FnOnce(Word) -> Word) -> Step<()> {
        let a = self.pop()?;
        self.burn(fee)?;
        self.push(f(a))?;
        self.next(op);
        Ok(())
    }

    /// A two-operand stack operation.
    fn stack_op2(&mut self, op: Op, fee: u64, f: impl FnOnce(Word, Word) -> Word) -> Step<()> {
        let a = self.pop()?;
        let b = self.pop()?;
        self.burn(fee)?;
        self.push(f(a, b))?;
        self.next(op);
        Ok(())
    }

    /// A three-operand stack operation.
    fn stack_op3(
        &mut self,
        op: Op,
        fee: u64,
        f: impl FnOnce(Word, Word, Word) -> Word,
    ) -> Step<()> {
        let a = self.pop()?;
        let b = self.pop()?;
        let c = self.pop()?;
        self.burn(fee)?;
        self.push(f(a, b, c))?;
        self.next(op);
        Ok(())
    }

    /// Pushes an environment item for the base fee.
    fn push_base_fee_item(&mut self, op: Op, value: Word) -> Step<()> {
        self.burn(self.block.schedule.g_base)?;
        self.push(value)?;
        self.next(op);
        Ok(())
    }

    /// The common shape of `CALLDATACOPY`, `CODECOPY` and `EXTCODECOPY`: pop
    /// the destination, source offset and size, bill, and splice `source`
    /// into memory.
    ///
    /// `extra_fee` replaces the `g_verylow` base charge for `EXTCODECOPY`,
    /// whose base is the account access fee.
    fn copy_into_memory(&mut self, op: Op, source: &Buf, extra_fee: Option<u64>) -> Step<()> {
        let dst_offset = self.pop()?;
        let src_offset = self.pop()?;
        let size = self.pop()?;
        let dst_lit = self.force_concrete(&dst_offset, "copy: symbolic memory offset")?;
        let size_lit = self.force_concrete(&size, "copy: symbolic size")?;
        self.access_memory_range(dst_lit, size_lit)?;
        let base = extra_fee.unwrap_or(self.block.schedule.g_verylow);
        self.burn(self.block.schedule.cost_of_copy(base, size_lit.as_u64()))?;
        self.copy_bytes_to_memory(source, size, src_offset, dst_offset);
        self.next(op);
        Ok(())
    }

    // --- Storage -------------------------------------------------------

    fn exec_sload(&mut self, op: Op) -> Step<()> {
        let self_addr = self.state.contract;
        let slot = self.peek(0)?.clone();

        let (value, write_back_zero) = match storage::read(self_addr, &slot, &self.env.storage) {
            storage::ReadResult::Value(value) => (value, false),
            storage::ReadResult::Indeterminate => {
                let load = Word::SLoad {
                    address: self_addr,
                    slot:    Box::new(slot.clone()),
                    storage: std::rc::Rc::new(self.env.storage.clone()),
                };
                (load, false)
            }
            storage::ReadResult::Unwritten => {
                if self.is_external(self_addr) {
                    let slot_lit = self.force_concrete(
                        &slot,
                        "SLOAD: cannot fetch a symbolic slot of an external contract",
                    )?;
                    (self.fetch_slot_or_suspend(self_addr, slot_lit)?, false)
                } else {
                    // Native contracts over a concrete base read zero, and
                    // the zero is written back so that later reads resolve
                    // without special cases.
                    (word::zero(), true)
                }
            }
        };

        self.pop()?;
        let warm = match slot.maybe_lit() {
            Some(slot_lit) => self.access_storage_key(self_addr, slot_lit),
            None => false,
        };
        let fee = if warm {
            self.block.schedule.g_warm_storage_read
        } else {
            self.block.schedule.g_cold_sload
        };
        self.burn(fee)?;

        if write_back_zero {
            let storage = std::mem::replace(&mut self.env.storage, Storage::Empty);
            self.env.storage = storage::write(self_addr, slot, word::zero(), storage);
        }
        self.push(value)?;
        self.next(op);
        Ok(())
    }

    fn exec_sstore(&mut self, op: Op) -> Step<()> {
        self.not_static()?;
        let fees = self.block.schedule.clone();
        if self.state.gas <= fees.g_callstipend {
            return Err(EvmError::OutOfGas {
                have: self.state.gas,
                need: fees.g_callstipend + 1,
            }
            .into());
        }

        let self_addr = self.state.contract;
        let slot = self.peek(0)?.clone();
        let value = self.peek(1)?.clone();

        let current = match storage::read(self_addr, &slot, &self.env.storage) {
            storage::ReadResult::Value(current) => current.maybe_lit(),
            storage::ReadResult::Indeterminate => None,
            storage::ReadResult::Unwritten => {
                if self.is_external(self_addr) {
                    let slot_lit = self.force_concrete(
                        &slot,
                        "SSTORE: cannot fetch a symbolic slot of an external contract",
                    )?;
                    self.fetch_slot_or_suspend(self_addr, slot_lit)?.maybe_lit()
                } else {
                    Some(U256::ZERO)
                }
            }
        };
        let slot_lit = slot.maybe_lit();
        let original = slot_lit.and_then(|slot| self.original_slot_value(self_addr, slot));

        self.pop()?;
        self.pop()?;
        let cold = match slot_lit {
            Some(slot_lit) => !self.access_storage_key(self_addr, slot_lit),
            None => false,
        };
        let (cost, refund_changes) =
            fees.cost_of_sstore(cold, original, current, value.maybe_lit());
        self.burn(cost)?;
        for change in refund_changes {
            match change {
                crate::gas::RefundChange::Add(amount) => self.refund(self_addr, amount),
                crate::gas::RefundChange::Remove(amount) => self.un_refund(self_addr, amount),
            }
        }

        let storage = std::mem::replace(&mut self.env.storage, Storage::Empty);
        self.env.storage = storage::write(self_addr, slot, value, storage);
        self.next(op);
        Ok(())
    }

    /// The value a slot held at transaction start, when known.
    fn original_slot_value(&self, address: Addr, slot: W256) -> Option<W256> {
        if let Some(value) = self
            .env
            .orig_storage
            .get(&address)
            .and_then(|slots| slots.get(&slot))
        {
            return Some(*value);
        }
        match self.config.base_state {
            StorageBase::Concrete if !self.is_external(address) => Some(U256::ZERO),
            _ => None,
        }
    }

    /// Resolves a slot of an external contract from the fetch cache, or
    /// suspends on a [`Query::FetchSlot`].
    ///
    /// Callers invoke this before mutating anything, so re-execution after
    /// the answer arrives is idempotent.
    fn fetch_slot_or_suspend(&mut self, address: Addr, slot: W256) -> Step<Word> {
        if let Some(value) = self.cache.fetched_slots.get(&(address, slot)).copied() {
            self.install_fetched_slot(address, slot, value);
            return Ok(Word::Lit(value));
        }
        Err(Interrupt::Suspend {
            surface: EvmError::Query(Query::FetchSlot { address, slot }),
            pending: PendingOp::SlotFetch { address, slot },
        })
    }

    // --- Control flow --------------------------------------------------

    fn exec_jumpi(&mut self, op: Op) -> Step<()> {
        let destination = self.pop()?;
        let condition = self.pop()?;
        self.burn(self.block.schedule.g_high)?;
        let destination =
            self.force_concrete(&destination, "JUMPI: symbolic jump destination")?;

        match condition.maybe_lit() {
            Some(value) if value == U256::ZERO => self.next(op),
            Some(_) => self.jump_to(destination)?,
            None => {
                let location = (self.state.contract, self.state.pc);
                // Targets past any realistic code size can never validate;
                // clamping avoids truncation aliasing a valid destination.
                let jump_target = if destination > U256::from(u32::MAX) {
                    usize::MAX
                } else {
                    destination.as_usize()
                };
                let pending = PendingOp::Branch {
                    condition: condition.clone(),
                    location,
                    jump_target,
                    fallthrough: self.state.pc + op.size(),
                };
                if let Some(taken) = self.cached_branch_decision(location) {
                    self.apply_branch(pending, taken);
                    return Ok(());
                }
                return Err(Interrupt::Suspend {
                    surface: EvmError::Query(Query::AskSmt {
                        condition,
                        path: self.constraints.clone(),
                    }),
                    pending,
                });
            }
        }
        Ok(())
    }

    /// Moves the program counter to `destination` after validating it as a
    /// `JUMPDEST`.
    fn jump_to(&mut self, destination: W256) -> Step<()> {
        if destination > U256::from(u32::MAX) {
            return Err(EvmError::BadJumpDestination.into());
        }
        let destination = destination.as_usize();
        let valid = self
            .current_code_contract()
            .is_some_and(|contract| contract.is_valid_jump_dest(destination));
        if valid {
            self.state.pc = destination;
            Ok(())
        } else {
            Err(EvmError::BadJumpDestination.into())
        }
    }

    // --- Logging -------------------------------------------------------

    fn exec_log(&mut self, op: Op, topic_count: u8) -> Step<()> {
        self.not_static()?;
        let offset = self.pop()?;
        let size = self.pop()?;
        let mut topics = Vec::with_capacity(topic_count as usize);
        for _ in 0..topic_count {
            topics.push(self.pop()?);
        }
        let offset_lit = self.force_concrete(&offset, "LOG: symbolic memory offset")?;
        let size_lit = self.force_concrete(&size, "LOG: symbolic memory size")?;
        self.access_memory_range(offset_lit, size_lit)?;
        self.burn(
            self.block
                .schedule
                .cost_of_log(u64::from(topic_count), size_lit.as_u64()),
        )?;

        let entry = LogEntry {
            address: self.state.contract,
            data: self.read_memory(&offset, &size),
            topics,
        };
        self.traces.record(Trace {
            pc: self.state.pc,
            address: self.state.contract,
            data: TraceData::Event(entry.clone()),
        });
        self.logs.push(entry);
        self.next(op);
        Ok(())
    }

    // --- Creation ------------------------------------------------------

    fn exec_create(&mut self, op: Op) -> Step<()> {
        self.not_static()?;
        let fees = self.block.schedule.clone();
        let self_addr = self.state.contract;

        let value = self.pop()?;
        let offset = self.pop()?;
        let size = self.pop()?;
        let salt = if op == Op::Create2 {
            Some(self.pop()?)
        } else {
            None
        };

        let offset_lit = self.force_concrete(&offset, "CREATE: symbolic memory offset")?;
        let size_lit = self.force_concrete(&size, "CREATE: symbolic memory size")?;
        self.access_memory_range(offset_lit, size_lit)?;

        let Some(init_code) = buf::maybe_slice(&offset, &size, &self.state.memory) else {
            return Err(self.symbolic_fault(
                "CREATE: initcode must be concrete",
                vec![offset, size],
            ));
        };

        let hashed_bytes = if op == Op::Create2 {
            size_lit.as_u64()
        } else {
            0
        };
        let (total, init_gas) = fees.cost_of_create(hashed_bytes, self.state.gas);
        self.burn(total - init_gas)?;

        let Some(nonce) = self.env.contracts.get(&self_addr).and_then(|c| c.nonce) else {
            return Err(self.symbolic_fault("CREATE: unknown creator nonce", vec![]));
        };
        let created = match salt {
            None => crypto::create_address(self_addr, nonce),
            Some(salt) => {
                let salt = self.force_concrete(&salt, "CREATE2: symbolic salt")?;
                crypto::create2_address(self_addr, salt, crypto::keccak256(&init_code))
            }
        };

        // Pre-flight checks fail the creation without consuming the reserved
        // allowance: the caller gets a zero and execution continues.
        if nonce == u64::MAX {
            return self.fail_create(op, EvmError::NonceOverflow);
        }
        if self.frames.len() >= MAXIMUM_CALL_DEPTH {
            return self.fail_create(op, EvmError::CallDepthLimitReached);
        }
        if !self.balance_covers(self_addr, &value) {
            let have = self.env.contracts[&self_addr].balance.clone();
            return self.fail_create(op, EvmError::BalanceTooLow { have, want: value });
        }
        // An EIP-684 address collision fails the creation without a
        // dedicated error: the caller just sees a zero.
        let collision = self.env.contracts.get(&created).is_some_and(|existing| {
            existing.nonce != Some(0) || existing.code.opslen() != 0
        });
        if collision {
            self.state.returndata = Buf::empty();
            self.push(word::zero())?;
            self.next(op);
            return Ok(());
        }

        // Committed: reserve the allowance and build the callee.
        self.burn(init_gas)?;
        self.bump_nonce(self_addr);
        self.access_account(created);

        let reversion = self.env.contracts.clone();
        let storage_reversion = self.env.storage.clone();
        let substate = self.tx.substate.clone();

        let code = ContractCode::InitCode(init_code, Buf::empty());
        let codehash = crate::contract::hashcode(&code);
        let mut new_contract = Contract::new(code.clone());
        if let Some(existing) = self.env.contracts.get(&created) {
            new_contract.balance = existing.balance.clone();
        }
        self.env.contracts.insert(created, new_contract);

        self.next(op);
        let mut callee = FrameState::new_for(created, created, code);
        callee.callvalue = value.clone();
        callee.caller = self_addr;
        callee.gas = init_gas;
        callee.is_static = self.state.is_static;
        let parent = std::mem::replace(&mut self.state, callee);

        self.traces.enter(Trace {
            pc: parent.pc,
            address: created,
            data: TraceData::FrameEntered,
        });
        self.frames.push(Frame {
            state: parent,
            context: FrameContext::Creation {
                address: created,
                codehash,
                reversion,
                storage_reversion,
                substate,
            },
        });

        self.move_balance(self_addr, created, &value);
        self.touch_account(self_addr);
        self.touch_account(created);
        Ok(())
    }

    /// Fails a creation in pre-flight: the reserved allowance is untouched,
    /// the caller sees a zero, and the reason is recorded in the trace.
    fn fail_create(&mut self, op: Op, reason: EvmError) -> Step<()> {
        self.traces.record(Trace {
            pc: self.state.pc,
            address: self.state.contract,
            data: TraceData::Error(reason),
        });
        self.state.returndata = Buf::empty();
        self.push(word::zero())?;
        self.next(op);
        Ok(())
    }

    // --- Calls ---------------------------------------------------------

    #[allow(clippy::too_many_lines)] // The call plumbing is one linear story.
    fn exec_call(&mut self, op: Op) -> Step<()> {
        let fees = self.block.schedule.clone();
        let self_addr = self.state.contract;
        let has_value_arg = matches!(op, Op::Call | Op::CallCode);

        let target = self.force_addr(&self.peek(1)?.clone(), "CALL: symbolic target address")?;
        let value = if has_value_arg {
            self.peek(2)?.clone()
        } else {
            word::zero()
        };

        if op == Op::Call && self.state.is_static && value != word::zero() {
            return Err(EvmError::StateChangeWhileStatic.into());
        }

        if target == cheat::cheat_address() && matches!(op, Op::Call | Op::StaticCall) {
            return self.exec_cheat(op);
        }

        let precompile = is_precompile(target);
        if !precompile {
            self.ensure_account(target)?;
        }

        // Arguments: gas, target, (value,) argOff, argSize, retOff, retSize.
        let gas_word = self.pop()?;
        self.pop()?;
        if has_value_arg {
            self.pop()?;
        }
        let in_offset = self.pop()?;
        let in_size = self.pop()?;
        let out_offset = self.pop()?;
        let out_size = self.pop()?;

        let in_offset_lit = self.force_concrete(&in_offset, "CALL: symbolic argument offset")?;
        let in_size_lit = self.force_concrete(&in_size, "CALL: symbolic argument size")?;
        let out_offset_lit = self.force_concrete(&out_offset, "CALL: symbolic return offset")?;
        let out_size_lit = self.force_concrete(&out_size, "CALL: symbolic return size")?;
        self.access_memory_range(in_offset_lit, in_size_lit)?;
        self.access_memory_range(out_offset_lit, out_size_lit)?;

        let requested = self.force_concrete(&gas_word, "CALL: symbolic gas")?;
        let warm = self.access_account(target);
        let transfers_value = value != word::zero();
        let recipient_exists = self
            .env
            .contracts
            .get(&target)
            .is_some_and(|contract| !contract.is_empty_account());
        let (charged, callee_gas) = fees.cost_of_call(
            warm,
            transfers_value,
            recipient_exists,
            self.state.gas,
            requested,
        );
        let stipend = if transfers_value { fees.g_callstipend } else { 0 };
        let allowance = callee_gas - stipend;
        self.burn(charged)?;

        if precompile {
            return self.exec_precompile_call(
                op,
                target,
                callee_gas,
                &in_offset,
                &in_size,
                out_offset_lit,
                out_size_lit,
                &value,
            );
        }

        // Pre-flight failures return the callee allowance and hand the
        // caller a zero.
        if self.frames.len() >= MAXIMUM_CALL_DEPTH {
            return self.fail_call(op, allowance, EvmError::CallDepthLimitReached);
        }
        if has_value_arg && !self.balance_covers(self_addr, &value) {
            let have = self.env.contracts[&self_addr].balance.clone();
            return self.fail_call(op, allowance, EvmError::BalanceTooLow { have, want: value });
        }

        let callee_contract = self.env.contracts[&target].clone();
        let calldata = self.read_memory(&in_offset, &in_size);
        let abi = buf::maybe_slice(&word::zero(), &Word::from(4u64), &calldata)
            .map(|bytes| u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));

        let caller_override = self.config.override_caller.take();
        let callee_caller = match op {
            Op::DelegateCall => self.state.caller,
            _ => caller_override.unwrap_or(self_addr),
        };
        let (context_addr, callee_value) = match op {
            Op::Call => (target, value.clone()),
            Op::CallCode => (self_addr, value.clone()),
            Op::DelegateCall => (self_addr, self.state.callvalue.clone()),
            Op::StaticCall => (target, word::zero()),
            _ => unreachable!("exec_call is only dispatched for the call family"),
        };

        let reversion = (self.env.contracts.clone(), self.env.storage.clone());
        let substate = self.tx.substate.clone();

        self.next(op);
        let mut callee = FrameState::new_for(
            context_addr,
            target,
            clear_init_code(callee_contract.code.clone()),
        );
        callee.calldata = calldata.clone();
        callee.callvalue = callee_value;
        callee.caller = callee_caller;
        callee.gas = callee_gas;
        callee.is_static = self.state.is_static || op == Op::StaticCall;
        let parent = std::mem::replace(&mut self.state, callee);

        self.traces.enter(Trace {
            pc: parent.pc,
            address: target,
            data: TraceData::FrameEntered,
        });
        self.frames.push(Frame {
            state: parent,
            context: FrameContext::Call {
                target,
                context: context_addr,
                out_offset: out_offset_lit,
                out_size: out_size_lit,
                codehash: callee_contract.codehash,
                abi,
                calldata,
                reversion,
                substate,
            },
        });

        if op == Op::Call {
            self.move_balance(self_addr, target, &value);
        }
        self.touch_account(self_addr);
        self.touch_account(target);
        Ok(())
    }

    /// Fails a call in pre-flight: the callee allowance is returned to the
    /// caller, which sees a zero.
    fn fail_call(&mut self, op: Op, allowance: u64, reason: EvmError) -> Step<()> {
        self.traces.record(Trace {
            pc: self.state.pc,
            address: self.state.contract,
            data: TraceData::Error(reason),
        });
        self.un_burn(allowance);
        self.state.returndata = Buf::empty();
        self.push(word::zero())?;
        self.next(op);
        Ok(())
    }

    /// Runs a precompile called through the `CALL` family, inside the
    /// caller's frame.
    #[allow(clippy::too_many_arguments)]
    fn exec_precompile_call(
        &mut self,
        op: Op,
        target: Addr,
        callee_gas: u64,
        in_offset: &Word,
        in_size: &Word,
        out_offset: W256,
        out_size: W256,
        value: &Word,
    ) -> Step<()> {
        let which = target.into_word().as_u64();
        let Some(input) = buf::maybe_slice(in_offset, in_size, &self.state.memory) else {
            return Err(self.symbolic_fault(
                "precompile input must be concrete",
                vec![in_offset.clone(), in_size.clone()],
            ));
        };

        let cost = crate::vm::precompile::cost(&self.block.schedule, which, &input);
        let outcome = if cost <= callee_gas {
            crate::vm::precompile::execute(which, &input)
        } else {
            Err(EvmError::OutOfGas {
                have: callee_gas,
                need: cost,
            })
        };

        match outcome {
            Ok(output) => {
                // The unused remainder of the allowance comes back.
                self.un_burn(callee_gas - cost);
                self.state.returndata = Buf::Concrete(output.clone());
                let copied = out_size.min(U256::from(output.len() as u64));
                let returndata = self.state.returndata.clone();
                self.copy_bytes_to_memory(
                    &returndata,
                    Word::Lit(copied),
                    word::zero(),
                    Word::Lit(out_offset),
                );
                if op == Op::Call {
                    self.move_balance(self.state.contract, target, value);
                }
                self.touch_account(target);
                self.push(word::one())?;
            }
            Err(_) => {
                // A failed precompile consumes its entire allowance.
                self.state.returndata = Buf::empty();
                self.push(word::zero())?;
            }
        }
        self.next(op);
        Ok(())
    }

    /// Runs a precompile that was entered as its own frame, as happens when
    /// the VM is constructed directly on a precompile address.
    fn exec_precompile_frame(&mut self, which: u64) -> Step<()> {
        let calldata = self.state.calldata.clone();
        let size = buf::length(&calldata);
        let Some(input) = buf::maybe_slice(&word::zero(), &size, &calldata) else {
            return Err(self.symbolic_fault("precompile input must be concrete", vec![]));
        };

        // The input region is materialised at the bottom of memory before
        // the precompile runs.
        self.access_memory_range(U256::ZERO, U256::from(input.len() as u64))?;
        self.copy_bytes_to_memory(&calldata, size, word::zero(), word::zero());
        let cost = crate::vm::precompile::cost(&self.block.schedule, which, &input);
        self.burn(cost)?;
        match crate::vm::precompile::execute(which, &input) {
            Ok(output) => self.finish_frame(FrameResult::Returned(Buf::Concrete(output))),
            Err(error) => self.finish_frame(FrameResult::Errored(error)),
        }
        Ok(())
    }

    // --- Self destruction ----------------------------------------------

    fn exec_selfdestruct(&mut self) -> Step<()> {
        self.not_static()?;
        let fees = self.block.schedule.clone();
        let self_addr = self.state.contract;

        let beneficiary =
            self.force_addr(&self.peek(0)?.clone(), "SELFDESTRUCT: symbolic beneficiary")?;
        self.ensure_account(beneficiary)?;
        self.pop()?;

        let warm = self.access_account(beneficiary);
        let funds = self
            .env
            .contracts
            .get(&self_addr)
            .map_or(word::zero(), |contract| contract.balance.clone());
        let has_funds = funds != word::zero();
        let recipient_dead = self
            .env
            .contracts
            .get(&beneficiary)
            .map_or(true, Contract::is_empty_account);

        let mut cost = fees.g_selfdestruct;
        if !warm {
            cost += fees.g_cold_account_access;
        }
        if recipient_dead && has_funds {
            cost += fees.g_selfdestruct_newaccount;
        }
        self.burn(cost)?;

        self.tx.substate.selfdestructs.push(self_addr);
        self.touch_account(self_addr);
        self.touch_account(beneficiary);
        if beneficiary == self_addr {
            // Funds sent to the dying account are destroyed with it.
            self.with_contract_mut(self_addr, |contract| contract.balance = word::zero());
        } else {
            self.move_balance(self_addr, beneficiary, &funds);
        }
        self.finish_frame(FrameResult::Returned(Buf::empty()));
        Ok(())
    }

    // --- Small helpers -------------------------------------------------

    pub(crate) fn pop(&mut self) -> Step<Word> {
        self.state.stack.pop().map_err(Interrupt::from)
    }

    pub(crate) fn push(&mut self, value: Word) -> Step<()> {
        self.state.stack.push(value).map_err(Interrupt::from)
    }

    pub(crate) fn peek(&self, depth: usize) -> Step<&Word> {
        self.state.stack.peek(depth).map_err(Interrupt::from)
    }

    pub(crate) fn next(&mut self, op: Op) {
        self.state.pc += op.size();
    }

    /// Rejects execution in a static context.
    pub(crate) fn not_static(&self) -> Step<()> {
        if self.state.is_static {
            Err(EvmError::StateChangeWhileStatic.into())
        } else {
            Ok(())
        }
    }

    /// Demands a concrete word where the EVM semantics require one.
    pub(crate) fn force_concrete(&self, value: &Word, msg: &str) -> Step<W256> {
        value.maybe_lit().ok_or_else(|| {
            Interrupt::Fault(EvmError::UnexpectedSymbolicArg {
                pc:   self.state.pc,
                msg:  msg.into(),
                args: vec![value.clone()],
            })
        })
    }

    /// Demands a concrete address where the EVM semantics require one.
    pub(crate) fn force_addr(&self, value: &Word, msg: &str) -> Step<Addr> {
        Ok(Addr::from_word(self.force_concrete(value, msg)?))
    }

    /// Builds an [`EvmError::UnexpectedSymbolicArg`] fault at the current
    /// program counter.
    pub(crate) fn symbolic_fault(&self, msg: &str, args: Vec<Word>) -> Interrupt {
        Interrupt::Fault(EvmError::UnexpectedSymbolicArg {
            pc: self.state.pc,
            msg: msg.into(),
            args,
        })
    }

    /// Makes sure the account at `address` is known, installing it from the
    /// fetch cache or suspending on a [`Query::FetchContract`].
    ///
    /// Callers invoke this before mutating anything, so re-execution after
    /// the answer arrives is idempotent.
    pub(crate) fn ensure_account(&mut self, address: Addr) -> Step<()> {
        if self.env.contracts.contains_key(&address) {
            return Ok(());
        }
        if let Some(cached) = self.cache.fetched_contracts.get(&address).cloned() {
            self.env.contracts.insert(address, cached);
            return Ok(());
        }
        Err(Interrupt::Suspend {
            surface: EvmError::Query(Query::FetchContract { address }),
            pending: PendingOp::AccountFetch { address },
        })
    }

    /// The EIP-2929 fee for touching an account.
    fn account_access_fee(&self, warm: bool) -> u64 {
        if warm {
            self.block.schedule.g_warm_storage_read
        } else {
            self.block.schedule.g_cold_account_access
        }
    }

    /// Whether the account at `address` came from a remote node.
    fn is_external(&self, address: Addr) -> bool {
        self.env
            .contracts
            .get(&address)
            .is_some_and(|contract| contract.external)
    }

    /// Whether the current frame is executing initcode.
    fn in_creation_context(&self) -> bool {
        match self.frames.last() {
            Some(frame) => matches!(frame.context, FrameContext::Creation { .. }),
            None => self.tx.is_create,
        }
    }

    /// Reads the immediate of a `PUSHN` at the current program counter.
    ///
    /// For symbolic runtime code the immediate bytes are zero-padded to 32
    /// bytes and read back as a word, which folds to a literal exactly when
    /// every byte is concrete.
    fn read_push_immediate(&self, count: u8) -> Step<Word> {
        let start = self.state.pc + 1;
        let bytes: Vec<crate::expr::Byte> = (0..count as usize)
            .map(|i| self.state.code.byte_at(start + i))
            .collect();

        let concrete: Option<Vec<u8>> = bytes.iter().map(crate::expr::Byte::maybe_lit).collect();
        match concrete {
            Some(bytes) => {
                let mut padded = [0u8; 32];
                padded[32 - bytes.len()..].copy_from_slice(&bytes);
                Ok(Word::Lit(U256::from_be_bytes(padded)))
            }
            None => {
                // Left-pad the immediate into a 32-byte buffer and read it
                // back as one word.
                let padded = bytes.into_iter().enumerate().fold(
                    Buf::Concrete(vec![0; 32]),
                    |acc, (i, byte)| {
                        buf::write_byte(
                            Word::from((32 - count as usize + i) as u64),
                            byte,
                            acc,
                        )
                    },
                );
                Ok(buf::read_word(&word::zero(), &padded))
            }
        }
    }
}

/// Whether `address` names one of the natively dispatched precompiles.
fn is_precompile(address: Addr) -> bool {
    let word = address.into_word();
    word >= U256::ONE && word <= U256::from(MAXIMUM_PRECOMPILE_ADDRESS)
}

/// The size pushed by `CODESIZE`: a literal whenever the code length is
/// statically known, which is everything except initcode with abstract
/// constructor arguments.
fn code_size_word(code: &ContractCode) -> Word {
    match code {
        ContractCode::InitCode(_, args) if args.maybe_concrete().is_none() => {
            buf::length(&code.to_buf())
        }
        ContractCode::InitCode(prefix, args) => {
            let args_len = args.maybe_concrete().map_or(0, <[u8]>::len);
            Word::from((prefix.len() + args_len) as u64)
        }
        ContractCode::RuntimeCode(_) => Word::from(code.opslen() as u64),
    }
}

/// Strips the abstract constructor arguments when initcode is installed into
/// a callee frame; the code hash in the frame context retains the full
/// identity.
fn clear_init_code(code: ContractCode) -> ContractCode {
    match code {
        ContractCode::InitCode(prefix, _) => ContractCode::InitCode(prefix, Buf::empty()),
        other => other,
    }
}
