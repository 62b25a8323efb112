//! This module contains the fee schedule and the gas cost functions whose
//! results depend on more than a single schedule constant.
//!
//! The schedule constants are those in force at the Berlin hard fork with the
//! London refund reductions ([EIP-2929](https://eips.ethereum.org/EIPS/eip-2929),
//! [EIP-3529](https://eips.ethereum.org/EIPS/eip-3529)).

use ethnum::U256;

use crate::{constant::WORD_SIZE_BYTES, expr::W256};

/// The gas fees charged (and refunded) for the various operations of the EVM.
///
/// Every cost the engine charges is a parameter here, so alternative
/// schedules can be described without touching the interpreter.
#[derive(Clone, Debug, Eq, PartialEq)]
#[allow(clippy::struct_field_names)] // The `g_`/`r_` prefixes are Yellow Paper names.
pub struct FeeSchedule {
    pub g_zero: u64,
    pub g_base: u64,
    pub g_verylow: u64,
    pub g_low: u64,
    pub g_mid: u64,
    pub g_high: u64,
    pub g_balance: u64,
    pub g_sload: u64,
    pub g_jumpdest: u64,
    pub g_sset: u64,
    pub g_sreset: u64,
    pub r_sclear: u64,
    pub g_selfdestruct: u64,
    pub g_selfdestruct_newaccount: u64,
    pub g_create: u64,
    pub g_codedeposit: u64,
    pub g_callvalue: u64,
    pub g_callstipend: u64,
    pub g_newaccount: u64,
    pub g_exp: u64,
    pub g_expbyte: u64,
    pub g_memory: u64,
    pub g_txcreate: u64,
    pub g_txdatazero: u64,
    pub g_txdatanonzero: u64,
    pub g_transaction: u64,
    pub g_log: u64,
    pub g_logdata: u64,
    pub g_logtopic: u64,
    pub g_sha3: u64,
    pub g_sha3word: u64,
    pub g_initcodeword: u64,
    pub g_copy: u64,
    pub g_blockhash: u64,
    pub g_quaddivisor: u64,
    pub g_ecadd: u64,
    pub g_ecmul: u64,
    pub g_pairing_point: u64,
    pub g_pairing_base: u64,
    pub g_fround: u64,
    pub r_block: u64,
    pub g_cold_sload: u64,
    pub g_cold_account_access: u64,
    pub g_warm_storage_read: u64,
    pub g_access_list_address: u64,
    pub g_access_list_storage_key: u64,
}

impl FeeSchedule {
    /// The schedule in force at the London hard fork.
    #[must_use]
    pub fn london() -> Self {
        Self {
            g_zero: 0,
            g_base: 2,
            g_verylow: 3,
            g_low: 5,
            g_mid: 8,
            g_high: 10,
            g_balance: 2600,
            g_sload: 100,
            g_jumpdest: 1,
            g_sset: 20000,
            g_sreset: 2900,
            // g_sreset + g_access_list_storage_key per EIP-3529.
            r_sclear: 4800,
            g_selfdestruct: 5000,
            g_selfdestruct_newaccount: 25000,
            g_create: 32000,
            g_codedeposit: 200,
            g_callvalue: 9000,
            g_callstipend: 2300,
            g_newaccount: 25000,
            g_exp: 10,
            g_expbyte: 50,
            g_memory: 3,
            g_txcreate: 32000,
            g_txdatazero: 4,
            g_txdatanonzero: 16,
            g_transaction: 21000,
            g_log: 375,
            g_logdata: 8,
            g_logtopic: 375,
            g_sha3: 30,
            g_sha3word: 6,
            g_initcodeword: 2,
            g_copy: 3,
            g_blockhash: 20,
            g_quaddivisor: 3,
            g_ecadd: 150,
            g_ecmul: 6000,
            g_pairing_point: 34000,
            g_pairing_base: 45000,
            g_fround: 1,
            r_block: 2_000_000_000_000_000_000,
            g_cold_sload: 2100,
            g_cold_account_access: 2600,
            g_warm_storage_read: 100,
            g_access_list_address: 2400,
            g_access_list_storage_key: 1900,
        }
    }

    /// The total cost of holding `byte_count` bytes of memory.
    #[must_use]
    pub fn memory_cost(&self, byte_count: u64) -> u64 {
        let words = u128::from(ceil_div(byte_count, WORD_SIZE_BYTES));
        let cost = u128::from(self.g_memory) * words + words * words / 512;
        u64::try_from(cost).unwrap_or(u64::MAX)
    }

    /// The cost of growing memory from `current` to `target` bytes. Memory
    /// never shrinks, so a smaller target costs nothing.
    #[must_use]
    pub fn memory_expansion_cost(&self, current: u64, target: u64) -> u64 {
        if target <= current {
            0
        } else {
            self.memory_cost(target) - self.memory_cost(current)
        }
    }

    /// The cost of a `CALL`-family operation, excluding memory expansion.
    ///
    /// Returns `(charged, call_gas)`: the gas charged to the caller and the
    /// gas allowance handed to the callee. The stipend for value-bearing
    /// calls is included in `call_gas` but not charged to the caller.
    #[must_use]
    pub fn cost_of_call(
        &self,
        warm: bool,
        transfers_value: bool,
        recipient_exists: bool,
        available_gas: u64,
        requested_gas: W256,
    ) -> (u64, u64) {
        let access = if warm {
            self.g_warm_storage_read
        } else {
            self.g_cold_account_access
        };
        let mut extra = access;
        if transfers_value {
            extra += self.g_callvalue;
            if !recipient_exists {
                extra += self.g_newaccount;
            }
        }

        let requested = clamp_to_gas(requested_gas);
        let gas_cap = if available_gas >= extra {
            requested.min(all_but_one_64th(available_gas - extra))
        } else {
            requested
        };
        let stipend = if transfers_value {
            self.g_callstipend
        } else {
            0
        };

        (extra + gas_cap, gas_cap + stipend)
    }

    /// The cost of a `CREATE`-family operation, excluding memory expansion.
    ///
    /// `hashed_bytes` is the size of the initcode hashed for `CREATE2`
    /// address derivation, and zero for plain `CREATE`.
    ///
    /// Returns `(charged, init_gas)`: the gas charged to the creator
    /// (including the allowance reserved for the initcode) and the allowance
    /// itself.
    #[must_use]
    pub fn cost_of_create(&self, hashed_bytes: u64, available_gas: u64) -> (u64, u64) {
        let cost = self.g_create + self.g_sha3word * ceil_div(hashed_bytes, WORD_SIZE_BYTES);
        let init_gas = all_but_one_64th(available_gas.saturating_sub(cost));
        (cost + init_gas, init_gas)
    }

    /// The cost and refund adjustments of an `SSTORE`, per EIP-2200 as
    /// amended by EIP-3529.
    ///
    /// `original` is the slot's value at transaction start, `current` its
    /// value now, and `new` the value being written; [`None`] marks a value
    /// that is not concretely known. When any participant is symbolic the
    /// charge is conservatively `g_sset` and no refund adjustments are made.
    #[must_use]
    pub fn cost_of_sstore(
        &self,
        cold: bool,
        original: Option<W256>,
        current: Option<W256>,
        new: Option<W256>,
    ) -> (u64, Vec<RefundChange>) {
        let cold_surcharge = if cold { self.g_cold_sload } else { 0 };
        let zero = U256::ZERO;

        match (original, current, new) {
            (_, Some(current), Some(new)) if current == new => {
                (self.g_sload + cold_surcharge, Vec::new())
            }
            (Some(original), Some(current), Some(new)) if original == current => {
                let mut refunds = Vec::new();
                let cost = if original == zero {
                    self.g_sset
                } else {
                    if new == zero {
                        refunds.push(RefundChange::Add(self.r_sclear));
                    }
                    self.g_sreset
                };
                (cost + cold_surcharge, refunds)
            }
            (Some(original), Some(current), Some(new)) => {
                let mut refunds = Vec::new();
                if original != zero {
                    if current == zero {
                        refunds.push(RefundChange::Remove(self.r_sclear));
                    }
                    if new == zero {
                        refunds.push(RefundChange::Add(self.r_sclear));
                    }
                }
                if new == original {
                    let restored = if original == zero {
                        self.g_sset - self.g_sload
                    } else {
                        self.g_sreset - self.g_sload
                    };
                    refunds.push(RefundChange::Add(restored));
                }
                (self.g_sload + cold_surcharge, refunds)
            }
            _ => (self.g_sset + cold_surcharge, Vec::new()),
        }
    }

    /// The cost of a `LOGN` with `topic_count` topics over `size` bytes of
    /// data.
    #[must_use]
    pub fn cost_of_log(&self, topic_count: u64, size: u64) -> u64 {
        self.g_log + topic_count * self.g_logtopic + size * self.g_logdata
    }

    /// The cost of hashing `size` bytes with the `SHA3` opcode.
    #[must_use]
    pub fn cost_of_sha3(&self, size: u64) -> u64 {
        self.g_sha3 + self.g_sha3word * ceil_div(size, WORD_SIZE_BYTES)
    }

    /// The cost of one of the copying opcodes: a `base` charge plus a
    /// per-word copy fee over `size` bytes.
    #[must_use]
    pub fn cost_of_copy(&self, base: u64, size: u64) -> u64 {
        base + self.g_copy * ceil_div(size, WORD_SIZE_BYTES)
    }

    /// The cost of `EXP` with the given concrete exponent.
    #[must_use]
    pub fn cost_of_exp(&self, exponent: W256) -> u64 {
        let significant_bytes = u64::from(32 - exponent.leading_zeros() / 8);
        self.g_exp + self.g_expbyte * significant_bytes
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self::london()
    }
}

/// An adjustment to the refund ledger produced by an `SSTORE`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RefundChange {
    /// Record a refund of the given amount.
    Add(u64),

    /// Withdraw a previously recorded refund of the given amount.
    Remove(u64),
}

/// All but one 64th of `gas`, as reserved by EIP-150 when handing gas down to
/// a callee.
#[must_use]
pub fn all_but_one_64th(gas: u64) -> u64 {
    gas - gas / 64
}

/// Division rounding towards positive infinity.
#[must_use]
pub fn ceil_div(value: u64, divisor: u64) -> u64 {
    value / divisor + u64::from(value % divisor != 0)
}

/// Clamps a word-sized requested gas amount into the concrete gas domain.
fn clamp_to_gas(value: W256) -> u64 {
    if value > U256::from(u64::MAX) {
        u64::MAX
    } else {
        value.as_u64()
    }
}

#[cfg(test)]
mod test {
    use ethnum::U256;

    use crate::gas::{all_but_one_64th, FeeSchedule, RefundChange};

    #[test]
    fn memory_cost_is_quadratic_past_the_linear_term() {
        let fees = FeeSchedule::london();
        assert_eq!(fees.memory_cost(0), 0);
        assert_eq!(fees.memory_cost(32), 3);
        // 1024 words: 3 * 1024 + 1024^2 / 512
        assert_eq!(fees.memory_cost(32768), 3 * 1024 + 2048);
    }

    #[test]
    fn memory_never_refunds_on_shrink() {
        let fees = FeeSchedule::london();
        assert_eq!(fees.memory_expansion_cost(64, 32), 0);
        assert_eq!(fees.memory_expansion_cost(32, 64), 3);
    }

    #[test]
    fn call_cost_reserves_one_64th() {
        let fees = FeeSchedule::london();
        let (charged, call_gas) =
            fees.cost_of_call(true, false, true, 6500, U256::from(1_000_000u64));
        // All but one 64th of (6500 - 100) = 6400 - 100 = 6300.
        assert_eq!(call_gas, 6300);
        assert_eq!(charged, 100 + 6300);
    }

    #[test]
    fn call_cost_respects_the_requested_limit() {
        let fees = FeeSchedule::london();
        let (charged, call_gas) = fees.cost_of_call(true, false, true, 6500, U256::from(50u64));
        assert_eq!(call_gas, 50);
        assert_eq!(charged, 150);
    }

    #[test]
    fn value_transfers_carry_the_stipend() {
        let fees = FeeSchedule::london();
        let (charged, call_gas) =
            fees.cost_of_call(false, true, true, 100_000, U256::from(0u64));
        assert_eq!(charged, 2600 + 9000);
        assert_eq!(call_gas, 2300);
    }

    #[test]
    fn calls_into_the_void_pay_for_the_new_account() {
        let fees = FeeSchedule::london();
        let (charged, _) = fees.cost_of_call(false, true, false, 100_000, U256::from(0u64));
        assert_eq!(charged, 2600 + 9000 + 25000);
    }

    #[test]
    fn create_reserves_one_64th_for_the_caller() {
        let fees = FeeSchedule::london();
        let (charged, init_gas) = fees.cost_of_create(0, 96000);
        assert_eq!(init_gas, all_but_one_64th(96000 - 32000));
        assert_eq!(charged, 32000 + init_gas);
    }

    #[test]
    fn create2_pays_per_hashed_word() {
        let fees = FeeSchedule::london();
        let (charged_plain, _) = fees.cost_of_create(0, 96000);
        let (charged_hashed, _) = fees.cost_of_create(65, 96000);
        // Three words of hashing at g_sha3word each, minus the reduced
        // allowance that results from the larger up-front cost.
        assert!(charged_hashed > charged_plain);
    }

    #[test]
    fn sstore_noop_is_a_warm_read() {
        let fees = FeeSchedule::london();
        let five = Some(U256::from(5u64));
        assert_eq!(
            fees.cost_of_sstore(false, five, five, five),
            (100, Vec::new())
        );
    }

    #[test]
    fn sstore_fresh_write_from_zero_pays_sset() {
        let fees = FeeSchedule::london();
        let zero = Some(U256::ZERO);
        let one = Some(U256::ONE);
        assert_eq!(
            fees.cost_of_sstore(true, zero, zero, one),
            (20000 + 2100, Vec::new())
        );
    }

    #[test]
    fn sstore_clearing_refunds() {
        let fees = FeeSchedule::london();
        let zero = Some(U256::ZERO);
        let one = Some(U256::ONE);
        assert_eq!(
            fees.cost_of_sstore(false, one, one, zero),
            (2900, vec![RefundChange::Add(4800)])
        );
    }

    #[test]
    fn sstore_dirty_restore_refunds_the_difference() {
        let fees = FeeSchedule::london();
        let one = Some(U256::ONE);
        let two = Some(U256::from(2u64));
        let (cost, refunds) = fees.cost_of_sstore(false, one, two, one);
        assert_eq!(cost, 100);
        assert_eq!(refunds, vec![RefundChange::Add(2900 - 100)]);
    }

    #[test]
    fn sstore_symbolic_values_charge_conservatively() {
        let fees = FeeSchedule::london();
        assert_eq!(
            fees.cost_of_sstore(true, None, None, None),
            (20000 + 2100, Vec::new())
        );
    }

    #[test]
    fn exp_charges_per_significant_exponent_byte() {
        let fees = FeeSchedule::london();
        assert_eq!(fees.cost_of_exp(U256::ZERO), 10);
        assert_eq!(fees.cost_of_exp(U256::from(0xffu64)), 10 + 50);
        assert_eq!(fees.cost_of_exp(U256::from(0x100u64)), 10 + 100);
    }
}
