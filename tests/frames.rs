//! Integration tests for the frame machine: calls, static contexts,
//! creation, reverts and transaction finalization.
#![cfg(test)]

use ethnum::U256;
use symbolic_evm::{
    contract::{Contract, ContractCode, RuntimeCode},
    expr::{storage, Addr, Storage, Word},
    vm::{Query, QueryAnswer, VmOpts, VmResult, VM},
    EvmError,
};

mod common;
use common::{asm, run, run_to_query, run_to_success, runtime_contract, vm_with_code};

/// The address used for callee contracts that tests supply via the fetch
/// protocol.
fn callee_address() -> Addr {
    Addr::from(0x1000u64)
}

/// Builds a caller whose code performs a `STATICCALL` into the callee and
/// stops.
fn staticcall_program() -> Vec<u8> {
    let mut code = asm::staticcall(callee_address());
    code.push(0x00);
    code
}

#[test]
fn staticcall_blocks_sstore_in_the_callee() -> anyhow::Result<()> {
    let mut vm = vm_with_code(staticcall_program());

    // The callee is unknown, so the machine pauses to fetch it.
    let query = run_to_query(&mut vm);
    assert_eq!(
        query,
        Query::FetchContract {
            address: callee_address()
        }
    );

    // PUSH1 0xff, PUSH1 0, SSTORE, STOP: an attempted write.
    let callee = runtime_contract(vec![0x60, 0xff, 0x60, 0x00, 0x55, 0x00]);
    vm.resume(QueryAnswer::Contract(callee))?;

    run_to_success(&mut vm);

    // The caller saw a zero from the failed callee.
    assert_eq!(vm.state().stack.peek(0).unwrap(), &Word::from(0u64));

    // And no storage write survived.
    assert_eq!(
        storage::read(callee_address(), &Word::from(0u64), &vm.env().storage),
        storage::ReadResult::Unwritten
    );

    Ok(())
}

#[test]
fn call_output_lands_in_the_caller_memory() -> anyhow::Result<()> {
    // Callee: PUSH1 42, PUSH1 0, MSTORE, PUSH1 32, PUSH1 0, RETURN.
    let callee = runtime_contract(vec![
        0x60, 0x2a, 0x60, 0x00, 0x52, 0x60, 0x20, 0x60, 0x00, 0xf3,
    ]);

    // Caller: CALL with a 32-byte output region at 0x40, then STOP.
    let mut code = asm::call(callee_address(), 0, 0, 0x40, 0x20);
    code.push(0x00);
    let mut vm = vm_with_code(code);

    run_to_query(&mut vm);
    vm.resume(QueryAnswer::Contract(callee))?;
    run_to_success(&mut vm);

    // The call succeeded.
    assert_eq!(vm.state().stack.peek(0).unwrap(), &Word::from(1u64));

    // The output was copied to 0x40 and kept as returndata.
    let in_memory = symbolic_evm::expr::buf::read_word(&Word::from(0x40u64), &vm.state().memory);
    assert_eq!(in_memory, Word::from(42u64));
    assert_eq!(
        vm.state().returndata.maybe_concrete().map(<[u8]>::len),
        Some(32)
    );

    Ok(())
}

#[test]
fn reverting_callee_restores_storage_and_returns_zero() -> anyhow::Result<()> {
    // Callee: SSTORE 1 at slot 0, then REVERT with empty output.
    let callee = runtime_contract(vec![
        0x60, 0x01, 0x60, 0x00, 0x55, // SSTORE
        0x60, 0x00, 0x60, 0x00, 0xfd, // REVERT(0, 0)
    ]);

    let mut code = asm::call(callee_address(), 0, 0, 0, 0);
    code.push(0x00);
    let mut vm = vm_with_code(code);

    run_to_query(&mut vm);
    vm.resume(QueryAnswer::Contract(callee))?;
    run_to_success(&mut vm);

    assert_eq!(vm.state().stack.peek(0).unwrap(), &Word::from(0u64));
    assert_eq!(
        storage::read(callee_address(), &Word::from(0u64), &vm.env().storage),
        storage::ReadResult::Unwritten
    );

    Ok(())
}

#[test]
fn reverted_root_frame_surfaces_the_output() {
    // PUSH1 42, PUSH1 0, MSTORE, PUSH1 32, PUSH1 0, REVERT.
    let mut vm = vm_with_code(vec![
        0x60, 0x2a, 0x60, 0x00, 0x52, 0x60, 0x20, 0x60, 0x00, 0xfd,
    ]);
    match run(&mut vm) {
        VmResult::Failure(EvmError::Revert(output)) => {
            let word =
                symbolic_evm::expr::buf::read_word(&Word::from(0u64), output);
            assert_eq!(word, Word::from(42u64));
        }
        other => panic!("expected a revert, got {other:?}"),
    }
}

/// Initcode that deploys a single byte of code: it stores the byte at the
/// end of the first memory word and returns that one byte.
fn initcode_returning(byte: u8) -> Vec<u8> {
    vec![
        0x60, byte, 0x60, 0x00, 0x52, // MSTORE(0, byte)
        0x60, 0x01, 0x60, 0x1f, 0xf3, // RETURN(31, 1)
    ]
}

/// A creator whose code deploys `initcode` from memory via `CREATE` and
/// stops.
fn create_program(initcode: &[u8]) -> Vec<u8> {
    assert!(initcode.len() <= 32);
    // Left-align the initcode within the first memory word.
    let mut padded = [0u8; 32];
    padded[..initcode.len()].copy_from_slice(initcode);

    let mut code = asm::mstore(0, U256::from_be_bytes(padded));
    code.extend(asm::push1(initcode.len() as u8)); // size
    code.extend(asm::push1(0)); // offset
    code.extend(asm::push1(0)); // value
    code.push(0xf0);
    code.push(0x00);
    code
}

#[test]
fn create_installs_the_returned_runtime_code() {
    let mut vm = vm_with_code(create_program(&initcode_returning(0x00)));
    let creator = vm.tx().to;
    run_to_success(&mut vm);

    // The created address landed on the stack.
    let created = vm.state().stack.peek(0).unwrap().clone();
    let created = Addr::from_word(created.maybe_lit().expect("the address is concrete"));
    assert_ne!(created, creator);

    // The account exists and carries the returned code.
    let account = vm.account(created).expect("the created account exists");
    assert_eq!(
        account.code,
        ContractCode::RuntimeCode(RuntimeCode::Concrete(vec![0x00]))
    );
    assert_eq!(account.nonce, Some(1));

    // The creator's nonce advanced.
    assert_eq!(vm.account(creator).unwrap().nonce, Some(1));
}

#[test]
fn create_rejects_code_with_the_ef_prefix() {
    let mut vm = vm_with_code(create_program(&initcode_returning(0xef)));
    let creator = vm.tx().to;
    run_to_success(&mut vm);

    // The creation failed: the caller got a zero, but the nonce bump
    // survives the unwind.
    assert_eq!(vm.state().stack.peek(0).unwrap(), &Word::from(0u64));
    assert_eq!(vm.account(creator).unwrap().nonce, Some(1));
}

#[test]
fn creation_transactions_install_their_code_at_finalization() {
    // The transaction target carries the initcode and ends up holding the
    // returned runtime code.
    let mut vm = VM::new(VmOpts {
        contract: Contract::new(ContractCode::InitCode(
            initcode_returning(0x00),
            symbolic_evm::expr::Buf::empty(),
        )),
        is_create: true,
        ..VmOpts::default()
    });
    let created = vm.tx().to;
    let origin = vm.tx().origin;
    run_to_success(&mut vm);

    let account = vm.account(created).expect("the created account survives");
    assert_eq!(
        account.code,
        ContractCode::RuntimeCode(RuntimeCode::Concrete(vec![0x00]))
    );

    // The origin's nonce advanced for the creation.
    assert_eq!(vm.account(origin).unwrap().nonce, Some(1));
}

#[test]
fn create_in_static_context_is_forbidden() -> anyhow::Result<()> {
    // The callee attempts a CREATE inside a STATICCALL.
    let callee = runtime_contract(create_program(&initcode_returning(0x00)));
    let mut vm = vm_with_code(staticcall_program());

    run_to_query(&mut vm);
    vm.resume(QueryAnswer::Contract(callee))?;
    run_to_success(&mut vm);

    // The static callee failed, so the caller sees zero.
    assert_eq!(vm.state().stack.peek(0).unwrap(), &Word::from(0u64));

    Ok(())
}

#[test]
fn finalization_pays_the_coinbase_and_clears_nothing_substantial() {
    let coinbase = Addr::from(0xc0ffeeu64);
    let mut vm = VM::new(VmOpts {
        contract: runtime_contract(vec![0x00]),
        coinbase,
        gas_price: U256::ONE,
        priority_fee: U256::ONE,
        ..VmOpts::default()
    });
    run_to_success(&mut vm);

    let miner = vm.account(coinbase).expect("the coinbase account was created");
    let balance = miner.balance.maybe_lit().expect("the balance is concrete");
    let gas_used = U256::from(vm.tx().gas_limit - vm.state().gas);
    let block_reward = U256::from(2_000_000_000_000_000_000u64);
    assert_eq!(balance, gas_used + block_reward);
}

#[test]
fn clearing_refund_is_granted_and_capped() {
    // SSTORE 1 to slot 0, then SSTORE 0 to slot 0: write then restore.
    let code = vec![
        0x60, 0x01, 0x60, 0x00, 0x55, // SSTORE(0, 1)
        0x60, 0x00, 0x60, 0x00, 0x55, // SSTORE(0, 0)
        0x00,
    ];
    let mut vm = VM::new(VmOpts {
        contract: runtime_contract(code),
        gas_price: U256::ONE,
        ..VmOpts::default()
    });
    let origin = vm.tx().origin;
    run_to_success(&mut vm);

    // Restoring a dirty slot to its original zero refunds the difference
    // between the set charge and the warm read.
    let refunds: u64 = vm
        .tx()
        .substate
        .refunds
        .iter()
        .map(|(_, amount)| amount)
        .sum();
    assert_eq!(refunds, 20000 - 100);

    // The origin was repaid the remaining gas plus the capped refund at the
    // transaction gas price.
    let gas_used = vm.tx().gas_limit - vm.state().gas;
    let capped = refunds.min(gas_used / 5);
    let repaid = vm
        .account(origin)
        .unwrap()
        .balance
        .maybe_lit()
        .expect("the balance is concrete");
    assert_eq!(repaid, U256::from(vm.state().gas + capped));
}

#[test]
fn selfdestruct_schedules_deletion_and_moves_funds() -> anyhow::Result<()> {
    let heir = Addr::from(0xdadu64);
    let mut vm = VM::new(VmOpts {
        // PUSH20 heir, SELFDESTRUCT
        contract: {
            let mut code = asm::push_addr(heir);
            code.push(0xff);
            runtime_contract(code).with_balance(Word::from(500u64))
        },
        value: Word::from(0u64),
        ..VmOpts::default()
    });
    let victim = vm.tx().to;

    // The heir is unknown and gets fetched.
    let query = run_to_query(&mut vm);
    assert_eq!(query, Query::FetchContract { address: heir });
    vm.resume(QueryAnswer::Contract(Contract::empty()))?;
    run_to_success(&mut vm);

    // The victim is gone, and the heir holds the funds.
    assert!(vm.account(victim).is_none());
    assert_eq!(
        vm.account(heir).unwrap().balance.maybe_lit(),
        Some(U256::from(500u64))
    );

    Ok(())
}

#[test]
fn storage_writes_survive_successful_transactions() {
    // SSTORE 7 at slot 3, STOP.
    let mut vm = vm_with_code(vec![0x60, 0x07, 0x60, 0x03, 0x55, 0x00]);
    let target = vm.tx().to;
    run_to_success(&mut vm);

    assert_eq!(
        storage::read(target, &Word::from(3u64), &vm.env().storage),
        storage::ReadResult::Value(Word::from(7u64))
    );
    assert!(matches!(vm.env().storage, Storage::Concrete(_)));
}
