//! Integration tests for calling into the precompiled contracts.
#![cfg(test)]

use ethnum::U256;
use symbolic_evm::{
    expr::{buf, Addr, Buf, Word},
    vm::{VmOpts, VM},
};

mod common;
use common::{asm, run_to_success, runtime_contract, vm_with_code};

#[test]
fn identity_round_trips_through_memory() {
    // Store a word at 0, call IDENTITY on it, and collect the copy at 0x40.
    let mut code = asm::mstore(0, U256::from(0xabcdu64));
    code.extend(asm::call(Addr::from(4u64), 0, 0x20, 0x40, 0x20));
    code.push(0x00);
    let mut vm = vm_with_code(code);
    run_to_success(&mut vm);

    assert_eq!(vm.state().stack.peek(0).unwrap(), &Word::from(1u64));
    assert_eq!(
        buf::read_word(&Word::from(0x40u64), &vm.state().memory),
        Word::from(0xabcdu64)
    );
}

#[test]
fn identity_charges_its_data_cost() {
    let mut code = asm::mstore(0, U256::from(0xabcdu64));
    code.extend(asm::call(Addr::from(4u64), 0, 0x20, 0x40, 0x20));
    code.push(0x00);
    let mut vm = vm_with_code(code);

    // Step to just before the CALL.
    while vm.state().pc < code_len_before_call() {
        vm.step();
    }
    let before = vm.state().gas;
    vm.step(); // CALL
    let spent = before - vm.state().gas;

    // Warm access (precompiles start warm) plus 15 + 3 per word of input,
    // plus the expansion of memory from one word to three for the output
    // region.
    assert_eq!(spent, 100 + 15 + 3 + 6);
}

/// The byte offset of the `CALL` in the identity programs above.
fn code_len_before_call() -> usize {
    let mut code = asm::mstore(0, U256::from(0xabcdu64));
    code.extend(asm::call(Addr::from(4u64), 0, 0x20, 0x40, 0x20));
    code.len() - 1
}

#[test]
fn sha256_of_empty_input_matches_the_digest() {
    let mut code = asm::call(Addr::from(2u64), 0, 0, 0, 0x20);
    code.push(0x00);
    let mut vm = vm_with_code(code);
    run_to_success(&mut vm);

    let digest = buf::read_word(&Word::from(0u64), &vm.state().memory);
    let expected = U256::from_str_radix(
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        16,
    )
    .unwrap();
    assert_eq!(digest, Word::Lit(expected));
}

#[test]
fn ecrecover_of_garbage_succeeds_with_empty_output() {
    // 128 zero bytes of input: recovery fails, but the call succeeds.
    let mut code = asm::call(Addr::from(1u64), 0, 0x80, 0x80, 0x20);
    code.push(0x00);
    let mut vm = vm_with_code(code);
    run_to_success(&mut vm);

    assert_eq!(vm.state().stack.peek(0).unwrap(), &Word::from(1u64));
    assert_eq!(vm.state().returndata.maybe_concrete(), Some(&[] as &[u8]));
}

#[test]
fn precompile_as_the_transaction_target_runs_in_one_step() {
    // A transaction straight into IDENTITY.
    let mut vm = VM::new(VmOpts {
        contract: runtime_contract(Vec::new()),
        address: Addr::from(4u64),
        calldata: (Buf::Concrete(vec![1, 2, 3]), Vec::new()),
        ..VmOpts::default()
    });
    run_to_success(&mut vm);

    match vm.result() {
        Some(symbolic_evm::vm::VmResult::Success(output)) => {
            assert_eq!(output.maybe_concrete(), Some(&[1u8, 2, 3] as &[u8]));
        }
        _ => unreachable!("run_to_success already checked"),
    }
}
