//! Integration tests for the pause/resume query protocol: symbolic branch
//! decisions, account and slot fetches, and answer validation.
#![cfg(test)]

use ethnum::U256;
use symbolic_evm::{
    expr::{Buf, Prop, Word},
    vm::{BranchAnswer, Query, QueryAnswer, ResumeError, VmOpts, VmResult, VM},
    EvmError,
};

mod common;
use common::{run, run_to_query, run_to_success, runtime_contract};

/// A program that loads calldata word zero and conditionally jumps on it:
///
/// ```text
/// PUSH1 0, CALLDATALOAD, PUSH1 8, JUMPI, STOP, STOP, JUMPDEST, STOP
/// ```
fn branching_program() -> Vec<u8> {
    vec![0x60, 0x00, 0x35, 0x60, 0x08, 0x57, 0x00, 0x00, 0x5b, 0x00]
}

/// Builds the branching program over fully abstract calldata.
fn branching_vm() -> VM {
    VM::new(VmOpts {
        contract: runtime_contract(branching_program()),
        calldata: (Buf::Abstract("calldata".into()), Vec::new()),
        ..VmOpts::default()
    })
}

#[test]
fn symbolic_jumpi_asks_the_solver() {
    let mut vm = branching_vm();
    match run_to_query(&mut vm) {
        Query::AskSmt { condition, path } => {
            assert!(condition.maybe_lit().is_none());
            assert!(path.is_empty());
        }
        other => panic!("expected a branch query, got {other:?}"),
    }
}

#[test]
fn taking_the_branch_constrains_the_condition_nonzero() -> anyhow::Result<()> {
    let mut vm = branching_vm();
    run_to_query(&mut vm);
    vm.resume(QueryAnswer::Branch(BranchAnswer::Case(true)))?;

    // The jump was taken.
    assert_eq!(vm.state().pc, 8);
    assert_eq!(vm.constraints().len(), 1);
    assert!(matches!(vm.constraints()[0], Prop::Neg(_)));

    run_to_success(&mut vm);

    Ok(())
}

#[test]
fn declining_the_branch_constrains_the_condition_zero() -> anyhow::Result<()> {
    let mut vm = branching_vm();
    run_to_query(&mut vm);
    vm.resume(QueryAnswer::Branch(BranchAnswer::Case(false)))?;

    // Execution fell through to the instruction after the JUMPI.
    assert_eq!(vm.state().pc, 6);
    assert!(matches!(vm.constraints()[0], Prop::Eq(_, _)));

    run_to_success(&mut vm);

    Ok(())
}

#[test]
fn branch_decisions_are_recorded_in_the_path_cache() -> anyhow::Result<()> {
    let mut vm = branching_vm();
    run_to_query(&mut vm);
    vm.resume(QueryAnswer::Branch(BranchAnswer::Case(true)))?;

    let location = (vm.tx().to, 5);
    assert_eq!(vm.cache().path.get(&(location, 0)), Some(&true));

    Ok(())
}

#[test]
fn unknown_branch_verdicts_defer_to_the_user() -> anyhow::Result<()> {
    let mut vm = branching_vm();
    run_to_query(&mut vm);
    vm.resume(QueryAnswer::Branch(BranchAnswer::Unknown))?;

    // The machine re-paused as an interactive choice.
    match vm.result() {
        Some(VmResult::Failure(EvmError::Choose(_))) => {}
        other => panic!("expected a path choice, got {other:?}"),
    }

    vm.resume(QueryAnswer::Path(true))?;
    assert_eq!(vm.state().pc, 8);
    run_to_success(&mut vm);

    Ok(())
}

#[test]
fn inconsistent_paths_die() -> anyhow::Result<()> {
    let mut vm = branching_vm();
    run_to_query(&mut vm);
    vm.resume(QueryAnswer::Branch(BranchAnswer::Inconsistent))?;
    assert!(matches!(
        vm.result(),
        Some(VmResult::Failure(EvmError::DeadPath))
    ));

    Ok(())
}

#[test]
fn external_contracts_fetch_their_slots() -> anyhow::Result<()> {
    // PUSH1 5, SLOAD, STOP on an external contract.
    let mut vm = VM::new(VmOpts {
        contract: runtime_contract(vec![0x60, 0x05, 0x54, 0x00]).with_external(true),
        ..VmOpts::default()
    });
    let target = vm.tx().to;

    match run_to_query(&mut vm) {
        Query::FetchSlot { address, slot } => {
            assert_eq!(address, target);
            assert_eq!(slot, U256::from(5u64));
        }
        other => panic!("expected a slot fetch, got {other:?}"),
    }

    vm.resume(QueryAnswer::Slot(U256::from(99u64)))?;
    run_to_success(&mut vm);

    // The fetched value was read, cached, and recorded as the
    // transaction-start original for refund accounting.
    assert_eq!(vm.state().stack.peek(0).unwrap(), &Word::from(99u64));
    assert_eq!(
        vm.cache().fetched_slots.get(&(target, U256::from(5u64))),
        Some(&U256::from(99u64))
    );
    assert_eq!(
        vm.env().orig_storage.get(&target).and_then(|s| s.get(&U256::from(5u64))),
        Some(&U256::from(99u64))
    );

    Ok(())
}

#[test]
fn native_contracts_default_missing_slots_to_zero() {
    let mut vm = VM::new(VmOpts {
        contract: runtime_contract(vec![0x60, 0x05, 0x54, 0x00]),
        ..VmOpts::default()
    });
    run_to_success(&mut vm);
    assert_eq!(vm.state().stack.peek(0).unwrap(), &Word::from(0u64));
}

#[test]
fn symbolic_storage_reads_stay_symbolic() {
    let mut vm = VM::new(VmOpts {
        contract: runtime_contract(vec![0x60, 0x05, 0x54, 0x00]),
        storage_base: symbolic_evm::vm::StorageBase::Symbolic,
        ..VmOpts::default()
    });
    run_to_success(&mut vm);
    let top = vm.state().stack.peek(0).unwrap();
    assert!(matches!(top, Word::SLoad { .. }));
}

#[test]
fn resuming_without_a_pause_is_rejected() {
    let mut vm = branching_vm();
    assert_eq!(
        vm.resume(QueryAnswer::Path(true)),
        Err(ResumeError::NotPaused)
    );
}

#[test]
fn mismatched_answers_are_rejected_and_the_pause_survives() {
    let mut vm = branching_vm();
    run_to_query(&mut vm);

    assert_eq!(
        vm.resume(QueryAnswer::Slot(U256::ZERO)),
        Err(ResumeError::AnswerMismatch)
    );

    // The correct answer still lands.
    vm.resume(QueryAnswer::Branch(BranchAnswer::Case(true))).unwrap();
    run_to_success(&mut vm);
}

#[test]
fn fetched_contracts_are_cached() -> anyhow::Result<()> {
    // Call out to an unknown contract that just stops, twice.
    let target = symbolic_evm::expr::Addr::from(0x1000u64);
    let mut code = common::asm::call(target, 0, 0, 0, 0);
    code.extend(common::asm::call(target, 0, 0, 0, 0));
    code.push(0x00);

    let mut vm = common::vm_with_code(code);
    run_to_query(&mut vm);
    vm.resume(QueryAnswer::Contract(runtime_contract(vec![0x00])))?;

    // The second call is answered from the cache; no further query arrives.
    run_to_success(&mut vm);
    assert!(vm.cache().fetched_contracts.contains_key(&target));

    Ok(())
}

#[test]
fn constraints_accumulate_along_the_path() -> anyhow::Result<()> {
    // Two independent symbolic branches one after the other.
    //
    // PUSH1 0, CALLDATALOAD, PUSH1 10, JUMPI, STOP, ...
    let code = vec![
        0x60, 0x00, 0x35, // CALLDATALOAD word 0
        0x60, 0x0a, 0x57, // JUMPI -> 10
        0x00, 0x00, 0x00, 0x00, // padding
        0x5b, // JUMPDEST at 10
        0x60, 0x20, 0x35, // CALLDATALOAD word 32
        0x60, 0x12, 0x57, // JUMPI -> 18
        0x00, // padding
        0x5b, 0x00, // JUMPDEST at 18, STOP
    ];
    let mut vm = VM::new(VmOpts {
        contract: runtime_contract(code),
        calldata: (Buf::Abstract("calldata".into()), Vec::new()),
        ..VmOpts::default()
    });

    run_to_query(&mut vm);
    vm.resume(QueryAnswer::Branch(BranchAnswer::Case(true)))?;

    match run(&mut vm).clone() {
        VmResult::Failure(EvmError::Query(Query::AskSmt { path, .. })) => {
            // The second branch sees the first decision on its path.
            assert_eq!(path.len(), 1);
        }
        other => panic!("expected a second branch query, got {other:?}"),
    }
    vm.resume(QueryAnswer::Branch(BranchAnswer::Case(true)))?;
    run_to_success(&mut vm);
    assert_eq!(vm.constraints().len(), 2);

    Ok(())
}
