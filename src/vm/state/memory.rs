//! This module contains the memory-expansion accounting of the virtual
//! machine.
//!
//! Memory itself is a single [`Buf`] expression in the frame state; what
//! lives here is the billing: any opcode that touches a memory range first
//! declares it, which grows the active memory size to the next 32-byte
//! multiple covering the range and charges the cost difference.

use ethnum::U256;

use crate::{
    constant::WORD_SIZE_BYTES,
    error::EvmError,
    expr::{buf, Buf, Word, W256},
    vm::VM,
};

impl VM {
    /// Declares that the current operation touches the memory range
    /// `[offset, offset + size)`, growing and billing memory as needed.
    ///
    /// Accessing an empty range neither grows nor bills.
    ///
    /// # Errors
    ///
    /// Returns [`EvmError::IllegalOverflow`] when the range end does not fit
    /// into 64 bits, and [`EvmError::OutOfGas`] when the expansion cost
    /// exceeds the remaining gas.
    pub(crate) fn access_memory_range(
        &mut self,
        offset: W256,
        size: W256,
    ) -> Result<(), EvmError> {
        if size == U256::ZERO {
            return Ok(());
        }

        let limit = U256::from(u64::MAX);
        if offset > limit || size > limit {
            return Err(EvmError::IllegalOverflow);
        }
        let end = u128::from(offset.as_u64()) + u128::from(size.as_u64());
        let Ok(end) = u64::try_from(end) else {
            return Err(EvmError::IllegalOverflow);
        };

        let target = ceil_to_word(end)?;
        let expansion = self
            .block
            .schedule
            .memory_expansion_cost(self.state.memory_size, target);
        self.burn(expansion)?;
        self.state.memory_size = self.state.memory_size.max(target);
        Ok(())
    }

    /// Copies `size` bytes of `source` (starting at `src_offset`) into memory
    /// at `dst_offset`.
    ///
    /// The caller is responsible for having declared the target range with
    /// [`VM::access_memory_range`].
    pub(crate) fn copy_bytes_to_memory(
        &mut self,
        source: &Buf,
        size: Word,
        src_offset: Word,
        dst_offset: Word,
    ) {
        if size.maybe_lit() == Some(U256::ZERO) {
            return;
        }
        let memory = std::mem::take(&mut self.state.memory);
        self.state.memory = buf::copy_slice(src_offset, dst_offset, size, source, memory);
    }

    /// Writes the word `value` into memory at `offset`.
    pub(crate) fn write_memory_word(&mut self, offset: Word, value: Word) {
        let memory = std::mem::take(&mut self.state.memory);
        self.state.memory = buf::write_word(offset, value, memory);
    }

    /// Writes the byte `value` into memory at `offset`.
    pub(crate) fn write_memory_byte(&mut self, offset: Word, value: crate::expr::Byte) {
        let memory = std::mem::take(&mut self.state.memory);
        self.state.memory = buf::write_byte(offset, value, memory);
    }
}

/// Rounds `bytes` up to the next multiple of the word size.
fn ceil_to_word(bytes: u64) -> Result<u64, EvmError> {
    bytes
        .checked_add(WORD_SIZE_BYTES - 1)
        .map(|padded| padded / WORD_SIZE_BYTES * WORD_SIZE_BYTES)
        .ok_or(EvmError::IllegalOverflow)
}
