//! This module contains the symbolic virtual machine: a stepwise EVM
//! interpreter over the expression algebra in [`crate::expr`].
//!
//! A driver owns a [`VM`] and calls [`VM::step`] repeatedly. Each call either
//! advances the current frame by one opcode, pushes or pops a call frame, or
//! pauses the machine with a [`query::Query`] that the driver services
//! through [`VM::resume`]. When the last frame pops, the machine finalizes
//! the transaction and becomes terminal.

pub mod cheat;
pub mod finalize;
pub mod frame;
pub mod precompile;
pub mod query;
pub mod state;
pub mod step;

pub use frame::{FrameContext, FrameResult};
pub use query::{BranchAnswer, Choice, Query, QueryAnswer, ResumeError};
pub use state::FrameState;

use std::collections::{BTreeMap, HashMap, HashSet};

use ethnum::U256;

use crate::{
    constant::{CONTRACT_MAXIMUM_SIZE_BYTES, MAXIMUM_PRECOMPILE_ADDRESS},
    contract::Contract,
    crypto,
    error::EvmError,
    expr::{buf, prop, word, Addr, Buf, LogEntry, Prop, Storage, Word, W256},
    gas::FeeSchedule,
    trace::TraceTree,
    vm::{frame::Frame, query::PendingOp},
};

/// A point in the code, identified by the executing account and the program
/// counter. Used to key branch iteration counts and the path cache.
pub type CodeLocation = (Addr, usize);

/// The result of a halted VM.
///
/// A paused machine is represented as `Failure(EvmError::Query(..))` or
/// `Failure(EvmError::Choose(..))`, so drivers observe a single "paused or
/// done" state.
#[derive(Clone, Debug)]
pub enum VmResult {
    /// Execution reached `STOP`, `RETURN` or the end of code, with the given
    /// output.
    Success(Buf),

    /// Execution failed, reverted, or paused on a query.
    Failure(EvmError),
}

/// The base over which storage slots that are never written resolve.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StorageBase {
    /// Unwritten slots are concretely zero.
    Concrete,

    /// Unwritten slots are unconstrained symbolic values.
    Symbolic,
}

/// Run-time toggles that are not part of the EVM state proper.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Whether the `ffi` cheat action may run.
    pub allow_ffi: bool,

    /// A one-shot caller override installed by the `prank` cheat action and
    /// consumed by the next `CALL`, `CALLCODE` or `STATICCALL`.
    pub override_caller: Option<Addr>,

    /// The base storage the VM was constructed over.
    pub base_state: StorageBase,
}

/// The state of the world as the engine knows it.
#[derive(Clone, Debug)]
pub struct Env {
    /// All known contract accounts.
    pub contracts: BTreeMap<Addr, Contract>,

    /// The chain id.
    pub chain_id: W256,

    /// The persistent storage of all accounts, as a single expression.
    pub storage: Storage,

    /// The concrete values storage slots had at transaction start, recorded
    /// as they become known. Feeds the `SSTORE` refund rules.
    pub orig_storage: BTreeMap<Addr, BTreeMap<W256, W256>>,

    /// The concrete keccak preimages observed during execution, kept so that
    /// hashed values can be displayed in terms of what was hashed.
    pub sha3_crack: HashMap<W256, Vec<u8>>,
}

/// Data about the block in which execution takes place.
#[derive(Clone, Debug)]
pub struct Block {
    /// The beneficiary of fees and rewards.
    pub coinbase: Addr,

    /// The block timestamp. May be symbolic.
    pub timestamp: Word,

    /// The block number.
    pub number: W256,

    /// The output of the randomness beacon, served by `PREVRANDAO`.
    pub prev_randao: W256,

    /// The block gas limit.
    pub gas_limit: u64,

    /// The base fee per gas.
    pub base_fee: W256,

    /// The maximum size of deployed code, per EIP-170.
    pub max_code_size: u64,

    /// The fee schedule in force.
    pub schedule: FeeSchedule,
}

/// The accrued substate of the transaction, per Yellow Paper section 6.1.
#[derive(Clone, Debug, Default)]
pub struct Substate {
    /// Accounts scheduled for deletion at the end of the transaction.
    pub selfdestructs: Vec<Addr>,

    /// Accounts touched during execution, candidates for EIP-161 clearing.
    pub touched_accounts: Vec<Addr>,

    /// Accounts that have been accessed and are therefore warm (EIP-2929).
    pub accessed_addresses: HashSet<Addr>,

    /// Storage keys that have been accessed and are therefore warm
    /// (EIP-2929).
    pub accessed_storage_keys: HashSet<(Addr, W256)>,

    /// The refund ledger fed by `SSTORE`.
    pub refunds: Vec<(Addr, u64)>,
}

/// The state that spans the whole transaction.
#[derive(Clone, Debug)]
pub struct TxState {
    /// The effective gas price paid by the origin.
    pub gas_price: W256,

    /// The transaction gas limit.
    pub gas_limit: u64,

    /// The priority fee per gas paid to the coinbase.
    pub priority_fee: W256,

    /// The externally-owned account that signed the transaction.
    pub origin: Addr,

    /// The target of the transaction (the created address for a creation
    /// transaction).
    pub to: Addr,

    /// The value sent with the transaction.
    pub value: Word,

    /// The accrued substate.
    pub substate: Substate,

    /// Whether this is a contract-creation transaction.
    pub is_create: bool,

    /// The contracts as they stood at transaction start, restored wholesale
    /// when the transaction fails.
    pub reversion: BTreeMap<Addr, Contract>,
}

/// Cross-transaction memoization of fetched data and branch decisions.
#[derive(Clone, Debug, Default)]
pub struct Cache {
    /// Contracts fetched through the query protocol.
    pub fetched_contracts: BTreeMap<Addr, Contract>,

    /// Storage slots fetched through the query protocol.
    pub fetched_slots: BTreeMap<(Addr, W256), W256>,

    /// Branch decisions keyed by code location and iteration count, replayed
    /// instead of re-querying the solver.
    pub path: HashMap<(CodeLocation, usize), bool>,
}

/// The options a VM is created from.
#[derive(Clone, Debug)]
pub struct VmOpts {
    /// The contract to execute. For a creation transaction this carries the
    /// initcode.
    pub contract: Contract,

    /// The input data, along with any constraints that scope it.
    pub calldata: (Buf, Vec<Prop>),

    /// The base over which unwritten storage resolves.
    pub storage_base: StorageBase,

    /// The value sent with the transaction.
    pub value: Word,

    /// The priority fee per gas.
    pub priority_fee: W256,

    /// The address at which `contract` lives (or is being created).
    pub address: Addr,

    /// The immediate caller of the first frame.
    pub caller: Addr,

    /// The transaction origin.
    pub origin: Addr,

    /// The gas available to the first frame.
    pub gas: u64,

    /// The transaction gas limit.
    pub gas_limit: u64,

    /// The block number.
    pub number: W256,

    /// The block timestamp.
    pub timestamp: Word,

    /// The block's fee and reward beneficiary.
    pub coinbase: Addr,

    /// The randomness beacon output.
    pub prev_randao: W256,

    /// The maximum deployed code size.
    pub max_code_size: u64,

    /// The block gas limit.
    pub block_gas_limit: u64,

    /// The effective gas price.
    pub gas_price: W256,

    /// The block base fee.
    pub base_fee: W256,

    /// The fee schedule to charge under.
    pub schedule: FeeSchedule,

    /// The chain id.
    pub chain_id: W256,

    /// Whether this is a contract-creation transaction.
    pub is_create: bool,

    /// The EIP-2930 access list: addresses and storage keys that start warm.
    pub tx_access_list: BTreeMap<Addr, Vec<W256>>,

    /// Whether the `ffi` cheat action may run.
    pub allow_ffi: bool,
}

impl Default for VmOpts {
    fn default() -> Self {
        Self {
            contract: Contract::empty(),
            calldata: (Buf::empty(), Vec::new()),
            storage_base: StorageBase::Concrete,
            value: word::zero(),
            priority_fee: U256::ZERO,
            address: Addr::from(0xacab_u64),
            caller: Addr::from(0xbeef_u64),
            origin: Addr::from(0xbeef_u64),
            gas: 0xffff_ffff,
            gas_limit: 0xffff_ffff,
            number: U256::ZERO,
            timestamp: Word::from(1u64),
            coinbase: Addr::from(0u64),
            prev_randao: U256::ZERO,
            max_code_size: CONTRACT_MAXIMUM_SIZE_BYTES,
            block_gas_limit: 0xffff_ffff,
            gas_price: U256::ZERO,
            base_fee: U256::ZERO,
            schedule: FeeSchedule::london(),
            chain_id: U256::ONE,
            is_create: false,
            tx_access_list: BTreeMap::new(),
            allow_ffi: false,
        }
    }
}

/// The state of a stepwise EVM execution.
#[derive(Clone, Debug)]
pub struct VM {
    /// `None` while running; the outcome or the pending query once halted.
    pub(crate) result: Option<VmResult>,

    /// The state of the current frame.
    pub(crate) state: FrameState,

    /// The suspended parent frames, innermost last.
    pub(crate) frames: Vec<Frame>,

    /// The known state of the world.
    pub(crate) env: Env,

    /// The enclosing block.
    pub(crate) block: Block,

    /// The transaction-wide state.
    pub(crate) tx: TxState,

    /// The logs emitted so far.
    pub(crate) logs: Vec<LogEntry>,

    /// The call/event trace tree.
    pub(crate) traces: TraceTree,

    /// Cross-transaction memoization.
    pub(crate) cache: Cache,

    /// The gas charged so far, for accounting rather than semantics.
    pub(crate) burned: u64,

    /// How many times each branch location has been visited, keying the path
    /// cache.
    pub(crate) iterations: HashMap<CodeLocation, usize>,

    /// The path conditions accumulated so far.
    pub(crate) constraints: Vec<Prop>,

    /// Equalities learned when concrete keccak hashes were computed.
    pub(crate) keccak_eqs: Vec<Prop>,

    /// Run-time toggles.
    pub(crate) config: RuntimeConfig,

    /// The record of how to consume the next query answer, when paused.
    pub(crate) pending: Option<PendingOp>,
}

impl VM {
    /// Constructs a VM from `opts` and performs the up-front transaction
    /// work: seeding the warm access sets, snapshotting the reversion state,
    /// and transferring the transaction value.
    #[must_use]
    pub fn new(opts: VmOpts) -> Self {
        let mut accessed_addresses: HashSet<Addr> = HashSet::new();
        accessed_addresses.insert(opts.origin);
        accessed_addresses.insert(opts.address);
        for precompile in 1..=MAXIMUM_PRECOMPILE_ADDRESS {
            accessed_addresses.insert(Addr::from(precompile));
        }
        accessed_addresses.extend(opts.tx_access_list.keys().copied());

        let accessed_storage_keys: HashSet<(Addr, W256)> = opts
            .tx_access_list
            .iter()
            .flat_map(|(address, slots)| slots.iter().map(|slot| (*address, *slot)))
            .collect();

        let touched_accounts = if opts.is_create {
            vec![opts.origin]
        } else {
            vec![opts.origin, opts.address]
        };

        let mut contracts = BTreeMap::new();
        contracts.insert(opts.address, opts.contract.clone());
        contracts.entry(opts.origin).or_insert_with(Contract::empty);
        let reversion = contracts.clone();

        let storage = match opts.storage_base {
            StorageBase::Concrete => Storage::Empty,
            StorageBase::Symbolic => Storage::Abstract,
        };

        let mut state = FrameState::new_for(opts.address, opts.address, opts.contract.code);
        state.calldata = opts.calldata.0;
        state.callvalue = opts.value.clone();
        state.caller = opts.caller;
        state.gas = opts.gas;

        let mut vm = Self {
            result: None,
            state,
            frames: Vec::new(),
            env: Env {
                contracts,
                chain_id: opts.chain_id,
                storage,
                orig_storage: BTreeMap::new(),
                sha3_crack: HashMap::new(),
            },
            block: Block {
                coinbase: opts.coinbase,
                timestamp: opts.timestamp,
                number: opts.number,
                prev_randao: opts.prev_randao,
                gas_limit: opts.block_gas_limit,
                base_fee: opts.base_fee,
                max_code_size: opts.max_code_size,
                schedule: opts.schedule,
            },
            tx: TxState {
                gas_price: opts.gas_price,
                gas_limit: opts.gas_limit,
                priority_fee: opts.priority_fee,
                origin: opts.origin,
                to: opts.address,
                value: opts.value.clone(),
                substate: Substate {
                    selfdestructs: Vec::new(),
                    touched_accounts,
                    accessed_addresses,
                    accessed_storage_keys,
                    refunds: Vec::new(),
                },
                is_create: opts.is_create,
                reversion,
            },
            logs: Vec::new(),
            traces: TraceTree::new(),
            cache: Cache::default(),
            burned: 0,
            iterations: HashMap::new(),
            constraints: opts.calldata.1,
            keccak_eqs: Vec::new(),
            config: RuntimeConfig {
                allow_ffi: opts.allow_ffi,
                override_caller: None,
                base_state: opts.storage_base,
            },
            pending: None,
        };

        // The up-front value transfer. The reversion snapshot above is taken
        // before this, so a failed transaction restores the pre-transfer
        // balances.
        let value = vm.tx.value.clone();
        let origin = vm.tx.origin;
        let to = vm.tx.to;
        vm.move_balance(origin, to, &value);
        if opts.is_create {
            vm.bump_nonce(origin);
        }

        vm
    }

    /// Gets the result of the VM: [`None`] while it is still running.
    #[must_use]
    pub fn result(&self) -> Option<&VmResult> {
        self.result.as_ref()
    }

    /// Gets the state of the current frame.
    #[must_use]
    pub fn state(&self) -> &FrameState {
        &self.state
    }

    /// Gets the number of suspended parent frames.
    #[must_use]
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// Gets the known state of the world.
    #[must_use]
    pub fn env(&self) -> &Env {
        &self.env
    }

    /// Gets the enclosing block.
    #[must_use]
    pub fn block(&self) -> &Block {
        &self.block
    }

    /// Gets the transaction-wide state.
    #[must_use]
    pub fn tx(&self) -> &TxState {
        &self.tx
    }

    /// Gets the logs emitted so far.
    #[must_use]
    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    /// Gets the call/event trace tree.
    #[must_use]
    pub fn traces(&self) -> &TraceTree {
        &self.traces
    }

    /// Gets the path conditions accumulated so far.
    #[must_use]
    pub fn constraints(&self) -> &[Prop] {
        &self.constraints
    }

    /// Gets the keccak preimage equalities learned so far.
    #[must_use]
    pub fn keccak_eqs(&self) -> &[Prop] {
        &self.keccak_eqs
    }

    /// Gets the cross-transaction cache.
    #[must_use]
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Gets the total gas charged so far.
    #[must_use]
    pub fn burned(&self) -> u64 {
        self.burned
    }

    /// Gets the account at `address`, if the engine knows it.
    #[must_use]
    pub fn account(&self, address: Addr) -> Option<&Contract> {
        self.env.contracts.get(&address)
    }

    // --- Internal mutation helpers -------------------------------------
    //
    // The VM is deliberately not exposed as a pile of public fields; these
    // narrow helpers are the only ways the interpreter modifies deep state.

    /// Charges `amount` gas against the current frame.
    pub(crate) fn burn(&mut self, amount: u64) -> Result<(), EvmError> {
        if self.state.gas < amount {
            return Err(EvmError::OutOfGas {
                have: self.state.gas,
                need: amount,
            });
        }
        self.state.gas -= amount;
        self.burned += amount;
        Ok(())
    }

    /// Returns `amount` gas to the current frame, undoing a previous burn.
    ///
    /// The burn counter saturates at zero: an unspent call stipend can hand
    /// back slightly more than was ever charged.
    pub(crate) fn un_burn(&mut self, amount: u64) {
        self.state.gas += amount;
        self.burned = self.burned.saturating_sub(amount);
    }

    /// Marks `address` as accessed, returning whether it was already warm.
    pub(crate) fn access_account(&mut self, address: Addr) -> bool {
        !self.tx.substate.accessed_addresses.insert(address)
    }

    /// Marks the storage key as accessed, returning whether it was already
    /// warm.
    pub(crate) fn access_storage_key(&mut self, address: Addr, slot: W256) -> bool {
        !self
            .tx
            .substate
            .accessed_storage_keys
            .insert((address, slot))
    }

    /// Records `address` as touched for end-of-transaction clearing.
    pub(crate) fn touch_account(&mut self, address: Addr) {
        self.tx.substate.touched_accounts.push(address);
    }

    /// Records a refund of `amount` for `address`.
    pub(crate) fn refund(&mut self, address: Addr, amount: u64) {
        self.tx.substate.refunds.push((address, amount));
    }

    /// Withdraws a previously recorded refund of exactly `amount` for
    /// `address`, if one exists.
    pub(crate) fn un_refund(&mut self, address: Addr, amount: u64) {
        if let Some(position) = self
            .tx
            .substate
            .refunds
            .iter()
            .position(|(a, n)| *a == address && *n == amount)
        {
            self.tx.substate.refunds.remove(position);
        }
    }

    /// Applies `action` to the account at `address`, creating an empty
    /// account there first if none exists.
    pub(crate) fn with_contract_mut(
        &mut self,
        address: Addr,
        action: impl FnOnce(&mut Contract),
    ) {
        let contract = self
            .env
            .contracts
            .entry(address)
            .or_insert_with(Contract::empty);
        action(contract);
    }

    /// Moves `value` from the balance of `from` to the balance of `to`,
    /// without any sufficiency check. Both accounts are created if missing.
    pub(crate) fn move_balance(&mut self, from: Addr, to: Addr, value: &Word) {
        if value.maybe_lit() == Some(U256::ZERO) {
            return;
        }
        if from == to {
            return;
        }
        self.with_contract_mut(from, |contract| {
            let balance = std::mem::replace(&mut contract.balance, word::zero());
            contract.balance = word::sub(balance, value.clone());
        });
        self.with_contract_mut(to, |contract| {
            let balance = std::mem::replace(&mut contract.balance, word::zero());
            contract.balance = word::add(balance, value.clone());
        });
    }

    /// Checks whether the balance of `from` concretely covers `value`.
    /// Symbolic balances and values are optimistically considered
    /// sufficient; the constraint system scopes them elsewhere.
    pub(crate) fn balance_covers(&self, from: Addr, value: &Word) -> bool {
        let Some(want) = value.maybe_lit() else {
            return true;
        };
        let Some(have) = self
            .env
            .contracts
            .get(&from)
            .and_then(|contract| contract.balance.maybe_lit())
        else {
            return true;
        };
        have >= want
    }

    /// Increments the nonce of the account at `address`.
    pub(crate) fn bump_nonce(&mut self, address: Addr) {
        self.with_contract_mut(address, |contract| {
            contract.nonce = contract.nonce.map(|nonce| nonce + 1);
        });
    }

    /// Computes the keccak-256 hash of `buffer` as a word, recording the
    /// preimage and the learned equality when the buffer is concrete.
    pub(crate) fn keccak_of(&mut self, buffer: &Buf) -> Word {
        match buffer.maybe_concrete() {
            Some(bytes) => {
                let hash = crypto::keccak256_word(bytes);
                self.env.sha3_crack.insert(hash, bytes.to_vec());
                self.keccak_eqs.push(prop::eq(
                    Word::Lit(hash),
                    Word::Keccak {
                        buffer: std::rc::Rc::new(buffer.clone()),
                    },
                ));
                Word::Lit(hash)
            }
            None => Word::Keccak {
                buffer: std::rc::Rc::new(buffer.clone()),
            },
        }
    }

    /// Gets the contract whose code the current frame is executing.
    pub(crate) fn current_code_contract(&self) -> Option<&Contract> {
        self.env.contracts.get(&self.state.code_contract)
    }

    /// Reads `size` bytes of memory starting at `offset` as a buffer.
    pub(crate) fn read_memory(&self, offset: &Word, size: &Word) -> Buf {
        buf::copy_slice(
            offset.clone(),
            word::zero(),
            size.clone(),
            &self.state.memory,
            Buf::empty(),
        )
    }
}
