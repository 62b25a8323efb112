//! Utilities shared between the integration tests: contract construction,
//! a tiny bytecode assembler, and drivers that service queries.
#![cfg(test)]
#![allow(unused)] // Each test binary uses its own subset of the helpers.

use ethnum::U256;
use symbolic_evm::{
    contract::{Contract, ContractCode, RuntimeCode},
    vm::{Query, VmOpts, VmResult, VM},
    EvmError,
};

/// The most steps any test program should ever need; exceeding it means the
/// machine failed to halt.
pub const STEP_LIMIT: usize = 10_000;

/// Builds a contract around concrete runtime bytecode.
pub fn runtime_contract(code: Vec<u8>) -> Contract {
    Contract::new(ContractCode::RuntimeCode(RuntimeCode::Concrete(code)))
}

/// Builds a VM executing `code` with the default options.
pub fn vm_with_code(code: Vec<u8>) -> VM {
    VM::new(VmOpts {
        contract: runtime_contract(code),
        ..VmOpts::default()
    })
}

/// Steps the machine until it halts or pauses.
///
/// # Panics
///
/// Panics if the machine takes more than [`STEP_LIMIT`] steps.
pub fn run(vm: &mut VM) -> &VmResult {
    for _ in 0..STEP_LIMIT {
        if vm.result().is_some() {
            break;
        }
        vm.step();
    }
    vm.result().expect("the machine did not halt within the step limit")
}

/// Steps the machine to its halt and demands a success, returning nothing so
/// the caller can keep borrowing the VM.
pub fn run_to_success(vm: &mut VM) {
    let result = run(vm);
    assert!(
        matches!(result, VmResult::Success(_)),
        "expected success, got {result:?}"
    );
}

/// Steps the machine until it pauses and extracts the pending query.
///
/// # Panics
///
/// Panics if the machine halts without pausing.
pub fn run_to_query(vm: &mut VM) -> Query {
    match run(vm) {
        VmResult::Failure(EvmError::Query(query)) => query.clone(),
        other => panic!("expected a query, got {other:?}"),
    }
}

/// A tiny assembler for the test programs.
pub mod asm {
    use super::U256;

    /// `PUSHN` for the minimal `N` covering `bytes`.
    pub fn push(bytes: &[u8]) -> Vec<u8> {
        assert!(!bytes.is_empty() && bytes.len() <= 32);
        let mut out = vec![0x5f + bytes.len() as u8];
        out.extend_from_slice(bytes);
        out
    }

    /// `PUSH1` of a single byte.
    pub fn push1(value: u8) -> Vec<u8> {
        push(&[value])
    }

    /// `PUSH32` of a full word.
    pub fn push32(value: U256) -> Vec<u8> {
        push(&value.to_be_bytes())
    }

    /// `PUSH20` of an address.
    pub fn push_addr(address: symbolic_evm::expr::Addr) -> Vec<u8> {
        push(&address.to_fixed_bytes())
    }

    /// Stores the word `value` at memory offset `offset`.
    pub fn mstore(offset: u8, value: U256) -> Vec<u8> {
        let mut out = push32(value);
        out.extend(push1(offset));
        out.push(0x52);
        out
    }

    /// A `CALL` with no transferred value.
    ///
    /// The arguments are pushed in reverse so they pop in the EVM's order:
    /// gas, target, value, input offset and size, output offset and size.
    pub fn call(
        target: symbolic_evm::expr::Addr,
        in_offset: u8,
        in_size: u8,
        out_offset: u8,
        out_size: u8,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(push1(out_size));
        out.extend(push1(out_offset));
        out.extend(push1(in_size));
        out.extend(push1(in_offset));
        out.extend(push1(0)); // value
        out.extend(push_addr(target));
        out.extend(push(&[0xff, 0xff, 0xff])); // plenty of gas
        out.push(0xf1);
        out
    }

    /// A `STATICCALL` with empty input and output regions.
    pub fn staticcall(target: symbolic_evm::expr::Addr) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(push1(0)); // retSize
        out.extend(push1(0)); // retOffset
        out.extend(push1(0)); // argSize
        out.extend(push1(0)); // argOffset
        out.extend(push_addr(target));
        out.extend(push(&[0xff, 0xff, 0xff]));
        out.push(0xfa);
        out
    }

    /// A call to the cheat dispatcher with the given selector and word
    /// arguments. The input is assembled at memory offset 0; the output
    /// region starts at 0x80.
    pub fn cheat_call(selector: u32, args: &[U256], out_size: u8) -> Vec<u8> {
        let mut out = Vec::new();
        // The selector occupies the four high bytes of the first word.
        out.extend(mstore(0, U256::from(selector) << 224u32));
        for (i, arg) in args.iter().enumerate() {
            out.extend(mstore(4 + 32 * i as u8, *arg));
        }

        let in_size = 4 + 32 * args.len() as u8;
        out.extend(push1(out_size));
        out.extend(push1(0x80));
        out.extend(push1(in_size));
        out.extend(push1(0));
        out.extend(push1(0)); // value
        out.extend(push_addr(symbolic_evm::vm::cheat::cheat_address()));
        out.extend(push(&[0xff, 0xff, 0xff]));
        out.push(0xf1);
        out
    }
}
