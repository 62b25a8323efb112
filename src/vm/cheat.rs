//! This module contains the cheat-action dispatcher: a non-EVM side channel,
//! addressed at the low 20 bytes of `keccak256("hevm cheat code")`, through
//! which a test harness manipulates the machine — block values, storage,
//! ECDSA keys, caller identity, and (when enabled) external processes.
//!
//! The actions are encoded as a static table from four-byte ABI selector to a
//! function pointer, built once from the signature strings.

use std::{collections::HashMap, sync::OnceLock};

use ethnum::U256;
use itertools::Itertools;
use log::debug;

use crate::{
    crypto,
    error::EvmError,
    expr::{buf, storage, word, Addr, Buf, Storage, Word, W256},
    opcode::Op,
    vm::{
        query::{PendingOp, Query},
        step::{Interrupt, Step},
        VM,
    },
};

/// Gets the address of the cheat-action dispatcher.
pub fn cheat_address() -> Addr {
    static ADDRESS: OnceLock<Addr> = OnceLock::new();
    *ADDRESS.get_or_init(|| {
        Addr::from_hash(&crypto::keccak256(
            crate::constant::CHEAT_CODE_PHRASE.as_bytes(),
        ))
    })
}

/// The decoded argument view of a cheat call.
struct CheatArgs {
    /// The full input buffer, selector included.
    data: Buf,

    /// The caller's declared output region.
    out_offset: W256,
    out_size:   W256,
}

impl CheatArgs {
    /// Reads the `index`-th 32-byte argument word.
    fn word(&self, index: usize) -> Word {
        buf::read_word(&Word::from((4 + 32 * index) as u64), &self.data)
    }
}

/// What a cheat action asks the dispatcher to do after it ran.
enum CheatOutcome {
    /// Complete the call successfully with the given return data.
    Return(Buf),

    /// Pause on a [`Query::ExecFfi`] for the given command.
    LaunchFfi(Vec<String>),

    /// Fail the call in the manner of a reverting callee, with a
    /// solidity-style `Error(string)` payload.
    Deny(String),
}

/// One entry of the cheat-action table.
struct CheatAction {
    /// The solidity-style signature the selector is derived from.
    signature: &'static str,

    /// Pre-flight work that may pause the machine. Runs before any state is
    /// consumed, so a paused call re-executes from scratch.
    prefetch: Option<fn(&mut VM, &CheatArgs) -> Step<()>>,

    /// The action itself.
    run: fn(&mut VM, &CheatArgs) -> Step<CheatOutcome>,
}

/// The cheat-action table, keyed by ABI selector.
fn actions() -> &'static HashMap<u32, CheatAction> {
    static TABLE: OnceLock<HashMap<u32, CheatAction>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let entries = [
            CheatAction {
                signature: "warp(uint256)",
                prefetch:  None,
                run:       cheat_warp,
            },
            CheatAction {
                signature: "roll(uint256)",
                prefetch:  None,
                run:       cheat_roll,
            },
            CheatAction {
                signature: "store(address,bytes32,bytes32)",
                prefetch:  Some(prefetch_account),
                run:       cheat_store,
            },
            CheatAction {
                signature: "load(address,bytes32)",
                prefetch:  Some(prefetch_account_and_slot),
                run:       cheat_load,
            },
            CheatAction {
                signature: "sign(uint256,bytes32)",
                prefetch:  None,
                run:       cheat_sign,
            },
            CheatAction {
                signature: "addr(uint256)",
                prefetch:  None,
                run:       cheat_addr,
            },
            CheatAction {
                signature: "prank(address)",
                prefetch:  None,
                run:       cheat_prank,
            },
            CheatAction {
                signature: "ffi(string[])",
                prefetch:  None,
                run:       cheat_ffi,
            },
        ];
        entries
            .into_iter()
            .map(|action| (crypto::abi_selector(action.signature), action))
            .collect()
    })
}

impl VM {
    /// Dispatches a `CALL` or `STATICCALL` whose target is the cheat
    /// address.
    ///
    /// Cheat calls never push a frame and are not charged call gas; the
    /// action manipulates the machine directly and the caller sees an
    /// ordinary call result.
    pub(crate) fn exec_cheat(&mut self, op: Op) -> Step<()> {
        let has_value_arg = op == Op::Call;
        let argument_base = if has_value_arg { 3 } else { 2 };

        // Everything is read through peeks first: a cheat that pauses on a
        // query must leave the machine untouched so the call re-executes.
        let in_offset = self.peek(argument_base)?.clone();
        let in_size = self.peek(argument_base + 1)?.clone();
        let out_offset = self.peek(argument_base + 2)?.clone();
        let out_size = self.peek(argument_base + 3)?.clone();
        let in_offset_lit = self.force_concrete(&in_offset, "cheat call: symbolic offset")?;
        let in_size_lit = self.force_concrete(&in_size, "cheat call: symbolic size")?;
        let out_offset_lit = self.force_concrete(&out_offset, "cheat call: symbolic offset")?;
        let out_size_lit = self.force_concrete(&out_size, "cheat call: symbolic size")?;

        let selector = buf::maybe_slice(
            &in_offset,
            &Word::from(4u64.min(in_size_lit.as_u64())),
            &self.state.memory,
        )
        .filter(|bytes| bytes.len() == 4)
        .map(|bytes| u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
        let Some(selector) = selector else {
            return Err(EvmError::BadCheatCode(None).into());
        };
        let Some(action) = actions().get(&selector) else {
            return Err(EvmError::BadCheatCode(Some(selector)).into());
        };
        debug!("cheat action {}", action.signature);

        let args = CheatArgs {
            data: self.read_memory(&in_offset, &in_size),
            out_offset: out_offset_lit,
            out_size: out_size_lit,
        };
        if let Some(prefetch) = action.prefetch {
            prefetch(self, &args)?;
        }

        // Committed: consume the call arguments and bill the memory ranges.
        for _ in 0..(argument_base + 4) {
            self.pop()?;
        }
        self.access_memory_range(in_offset_lit, in_size_lit)?;
        self.access_memory_range(out_offset_lit, out_size_lit)?;

        match (action.run)(self, &args)? {
            CheatOutcome::Return(output) => {
                self.deliver_cheat_output(&output, out_offset_lit, out_size_lit);
                self.push(word::one())?;
                self.next(op);
                Ok(())
            }
            CheatOutcome::LaunchFfi(command) => {
                debug!("pausing for ffi: {}", command.iter().format(" "));
                self.next(op);
                Err(Interrupt::Suspend {
                    surface: EvmError::Query(Query::ExecFfi { command }),
                    pending: PendingOp::Ffi {
                        out_offset: out_offset_lit,
                        out_size:   out_size_lit,
                    },
                })
            }
            CheatOutcome::Deny(message) => {
                let output = Buf::Concrete(encode_error_string(&message));
                self.deliver_cheat_output(&output, out_offset_lit, out_size_lit);
                self.push(word::zero())?;
                self.next(op);
                Ok(())
            }
        }
    }

    /// Installs a cheat action's output as return data and copies it into the
    /// caller's declared output region.
    fn deliver_cheat_output(&mut self, output: &Buf, out_offset: W256, out_size: W256) {
        self.state.returndata = output.clone();
        let copied = buf::length(output)
            .maybe_lit()
            .map_or(out_size, |length| length.min(out_size));
        self.copy_bytes_to_memory(
            output,
            Word::Lit(copied),
            word::zero(),
            Word::Lit(out_offset),
        );
    }
}

/// Pre-flight for actions whose first argument names an account: make sure
/// the account is known.
fn prefetch_account(vm: &mut VM, args: &CheatArgs) -> Step<()> {
    let address = vm.force_addr(&args.word(0), "cheat: symbolic account")?;
    vm.ensure_account(address)
}

/// Pre-flight for `load`: the account, plus the slot of external accounts.
fn prefetch_account_and_slot(vm: &mut VM, args: &CheatArgs) -> Step<()> {
    let address = vm.force_addr(&args.word(0), "cheat: symbolic account")?;
    vm.ensure_account(address)?;
    let slot = args.word(1);
    if let (true, storage::ReadResult::Unwritten) = (
        vm.account(address).is_some_and(|c| c.external),
        storage::read(address, &slot, &vm.env().storage),
    ) {
        let slot = vm.force_concrete(&slot, "cheat: cannot fetch a symbolic slot")?;
        vm.fetch_slot_for_cheat(address, slot)?;
    }
    Ok(())
}

impl VM {
    /// The slot-fetch hook shared with the interpreter's `SLOAD` path.
    fn fetch_slot_for_cheat(&mut self, address: Addr, slot: W256) -> Step<()> {
        if self.cache.fetched_slots.contains_key(&(address, slot)) {
            let value = self.cache.fetched_slots[&(address, slot)];
            self.install_fetched_slot(address, slot, value);
            return Ok(());
        }
        Err(Interrupt::Suspend {
            surface: EvmError::Query(Query::FetchSlot { address, slot }),
            pending: PendingOp::SlotFetch { address, slot },
        })
    }
}

fn cheat_warp(vm: &mut VM, args: &CheatArgs) -> Step<CheatOutcome> {
    vm.block.timestamp = args.word(0);
    Ok(CheatOutcome::Return(Buf::empty()))
}

fn cheat_roll(vm: &mut VM, args: &CheatArgs) -> Step<CheatOutcome> {
    let number = vm.force_concrete(&args.word(0), "roll: symbolic block number")?;
    vm.block.number = number;
    Ok(CheatOutcome::Return(Buf::empty()))
}

fn cheat_store(vm: &mut VM, args: &CheatArgs) -> Step<CheatOutcome> {
    let address = vm.force_addr(&args.word(0), "store: symbolic account")?;
    let slot = args.word(1);
    let value = args.word(2);
    let current = std::mem::replace(&mut vm.env.storage, Storage::Empty);
    vm.env.storage = storage::write(address, slot, value, current);
    Ok(CheatOutcome::Return(Buf::empty()))
}

fn cheat_load(vm: &mut VM, args: &CheatArgs) -> Step<CheatOutcome> {
    let address = vm.force_addr(&args.word(0), "load: symbolic account")?;
    let slot = args.word(1);
    let value = match storage::read(address, &slot, &vm.env.storage) {
        storage::ReadResult::Value(value) => value,
        storage::ReadResult::Unwritten => word::zero(),
        storage::ReadResult::Indeterminate => Word::SLoad {
            address,
            slot: Box::new(slot),
            storage: std::rc::Rc::new(vm.env.storage.clone()),
        },
    };
    let output = match value.maybe_lit() {
        Some(value) => Buf::Concrete(value.to_be_bytes().to_vec()),
        None => buf::write_word(word::zero(), value, Buf::Concrete(vec![0; 32])),
    };
    Ok(CheatOutcome::Return(output))
}

fn cheat_sign(vm: &mut VM, args: &CheatArgs) -> Step<CheatOutcome> {
    let key = vm.force_concrete(&args.word(0), "sign: symbolic private key")?;
    let digest = vm.force_concrete(&args.word(1), "sign: symbolic digest")?;
    let Some((v, r, s)) = crypto::sign_digest(key, digest.to_be_bytes()) else {
        return Err(EvmError::BadCheatCode(Some(crypto::abi_selector("sign(uint256,bytes32)"))).into());
    };
    let mut output = Vec::with_capacity(96);
    output.extend_from_slice(&U256::from(v).to_be_bytes());
    output.extend_from_slice(&r.to_be_bytes());
    output.extend_from_slice(&s.to_be_bytes());
    Ok(CheatOutcome::Return(Buf::Concrete(output)))
}

fn cheat_addr(vm: &mut VM, args: &CheatArgs) -> Step<CheatOutcome> {
    let key = vm.force_concrete(&args.word(0), "addr: symbolic private key")?;
    let Some(address) = crypto::address_from_private_key(key) else {
        return Err(EvmError::BadCheatCode(Some(crypto::abi_selector("addr(uint256)"))).into());
    };
    Ok(CheatOutcome::Return(Buf::Concrete(
        address.into_word().to_be_bytes().to_vec(),
    )))
}

fn cheat_prank(vm: &mut VM, args: &CheatArgs) -> Step<CheatOutcome> {
    let address = vm.force_addr(&args.word(0), "prank: symbolic account")?;
    vm.config.override_caller = Some(address);
    Ok(CheatOutcome::Return(Buf::empty()))
}

fn cheat_ffi(vm: &mut VM, args: &CheatArgs) -> Step<CheatOutcome> {
    if !vm.config.allow_ffi {
        return Ok(CheatOutcome::Deny(
            "ffi disabled: run again with --ffi if you want to allow tests to call \
             external commands"
                .into(),
        ));
    }
    let input_length = buf::length(&args.data);
    let Some(input) = buf::maybe_slice(&word::zero(), &input_length, &args.data) else {
        return Err(vm.symbolic_fault("ffi: the command must be concrete", vec![]));
    };
    let command = decode_string_array(&input[4..])
        .ok_or(Interrupt::Fault(EvmError::BadCheatCode(Some(
            crypto::abi_selector("ffi(string[])"),
        ))))?;
    Ok(CheatOutcome::LaunchFfi(command))
}

/// Decodes an ABI-encoded `string[]` from `data` (the calldata with the
/// selector already stripped).
fn decode_string_array(data: &[u8]) -> Option<Vec<String>> {
    let head = read_abi_word(data, 0)?;
    let array = head.checked_add(32)?;
    let count = read_abi_word(data, head)?;
    if count > 1024 {
        return None;
    }

    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let element = array.checked_add(read_abi_word(data, array + 32 * i)?)?;
        let length = read_abi_word(data, element)?;
        let bytes = data.get(element + 32..element + 32 + length)?;
        out.push(String::from_utf8(bytes.to_vec()).ok()?);
    }
    Some(out)
}

/// Reads the big-endian word at byte `offset` of `data` as a `usize`.
fn read_abi_word(data: &[u8], offset: usize) -> Option<usize> {
    let bytes: [u8; 32] = data.get(offset..offset + 32)?.try_into().ok()?;
    let word = U256::from_be_bytes(bytes);
    if word > U256::from(u32::MAX) {
        return None;
    }
    Some(word.as_usize())
}

/// Encodes a solidity `Error(string)` revert payload.
fn encode_error_string(message: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&crypto::abi_selector("Error(string)").to_be_bytes());
    out.extend_from_slice(&U256::from(32u64).to_be_bytes());
    out.extend_from_slice(&U256::from(message.len() as u64).to_be_bytes());
    out.extend_from_slice(message.as_bytes());
    // Pad the string data to a word boundary.
    let padding = (32 - message.len() % 32) % 32;
    out.extend(std::iter::repeat(0u8).take(padding));
    out
}

#[cfg(test)]
mod test {
    use crate::vm::cheat::{cheat_address, decode_string_array, encode_error_string};

    #[test]
    fn the_cheat_address_matches_the_known_constant() {
        assert_eq!(
            cheat_address().to_string(),
            "0x7109709ecfa91a80626ff3989d68f67f5b1dd12d"
        );
    }

    #[test]
    fn string_arrays_decode() {
        // abi.encode(["echo", "hi"])
        let mut data = Vec::new();
        let word = |n: u64| ethnum::U256::from(n).to_be_bytes();
        data.extend_from_slice(&word(32)); // offset of the array
        data.extend_from_slice(&word(2)); // element count
        data.extend_from_slice(&word(64)); // offset of "echo"
        data.extend_from_slice(&word(128)); // offset of "hi"
        data.extend_from_slice(&word(4));
        data.extend_from_slice(b"echo");
        data.extend(std::iter::repeat(0u8).take(28));
        data.extend_from_slice(&word(2));
        data.extend_from_slice(b"hi");
        data.extend(std::iter::repeat(0u8).take(30));

        assert_eq!(
            decode_string_array(&data),
            Some(vec!["echo".to_string(), "hi".to_string()])
        );
    }

    #[test]
    fn malformed_string_arrays_are_rejected() {
        assert_eq!(decode_string_array(&[]), None);
        let mut data = Vec::new();
        data.extend_from_slice(&ethnum::U256::from(32u64).to_be_bytes());
        assert_eq!(decode_string_array(&data), None);
    }

    #[test]
    fn error_strings_encode_in_the_solidity_layout() {
        let encoded = encode_error_string("no");
        assert_eq!(&encoded[..4], &[0x08, 0xc3, 0x79, 0xa0]);
        assert_eq!(encoded.len(), 4 + 32 + 32 + 32);
        assert_eq!(&encoded[68..70], b"no");
    }
}
