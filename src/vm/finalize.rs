//! This module contains the transaction finalizer: refund settlement, miner
//! payment, the block reward, and end-of-transaction state clearing.

use itertools::Itertools;
use log::debug;

use crate::{
    contract::Contract,
    expr::{word, Addr, Word, W256},
    vm::{
        frame::{runtime_code_from_buf, FrameResult},
        Substate, VM,
    },
};

/// The maximum share of the gas used that refunds may cover: one fifth, per
/// EIP-3529.
const MAX_REFUND_QUOTIENT: u64 = 5;

impl VM {
    /// Settles the transaction once the root frame has completed.
    ///
    /// Runs exactly once per transaction, from `finish_frame`. In order:
    ///
    /// 1. Failures other than `REVERT` consume all remaining gas; any failure
    ///    (including `REVERT`) restores the contracts and substate captured
    ///    at transaction start. A successful creation transaction installs
    ///    the returned runtime code.
    /// 2. The origin is repaid for unspent and refunded gas, and the coinbase
    ///    is paid the priority fee, both at the transaction's prices.
    /// 3. The coinbase account is created if missing and credited the block
    ///    reward.
    /// 4. Self-destructed accounts are deleted, followed by every touched
    ///    account that is empty in the EIP-161 sense.
    pub(crate) fn finalize(&mut self, how: &FrameResult) {
        match how {
            FrameResult::Returned(output) => {
                if self.tx.is_create {
                    let address = self.tx.to;
                    let code = runtime_code_from_buf(output);
                    if self.env.contracts.contains_key(&address) {
                        self.with_contract_mut(address, |contract| contract.replace_code(code));
                    }
                }
            }
            FrameResult::Reverted(_) => {
                // A revert keeps its unspent gas but gives up every state
                // change, refunds included.
                self.env.contracts = self.tx.reversion.clone();
                self.tx.substate = Substate::default();
            }
            FrameResult::Errored(error) => {
                debug!("transaction failed: {error}");
                self.state.gas = 0;
                self.env.contracts = self.tx.reversion.clone();
                self.tx.substate = Substate::default();
            }
        }

        // Settle gas with the origin and the coinbase.
        let gas_remaining = self.state.gas;
        let gas_used = self.tx.gas_limit.saturating_sub(gas_remaining);
        let total_refund: u64 = self
            .tx
            .substate
            .refunds
            .iter()
            .map(|(_, amount)| *amount)
            .sum();
        let capped_refund = total_refund.min(gas_used / MAX_REFUND_QUOTIENT);

        let origin = self.tx.origin;
        let coinbase = self.block.coinbase;
        let gas_price = self.tx.gas_price;
        let priority_fee = self.tx.priority_fee;

        self.credit(
            origin,
            W256::from(gas_remaining + capped_refund).wrapping_mul(gas_price),
        );
        self.credit(
            coinbase,
            W256::from(gas_used).wrapping_mul(priority_fee),
        );
        self.touch_account(coinbase);

        // The block reward.
        let reward = self.block.schedule.r_block;
        self.env
            .contracts
            .entry(coinbase)
            .or_insert_with(Contract::empty);
        self.credit(coinbase, W256::from(reward));

        // Deletions: self-destructed accounts first, then the EIP-161 sweep
        // of touched-but-empty accounts.
        for address in std::mem::take(&mut self.tx.substate.selfdestructs) {
            self.env.contracts.remove(&address);
        }
        let touched = self
            .tx
            .substate
            .touched_accounts
            .iter()
            .copied()
            .unique()
            .collect::<Vec<_>>();
        for address in touched {
            if self
                .env
                .contracts
                .get(&address)
                .is_some_and(Contract::is_empty_account)
            {
                self.env.contracts.remove(&address);
            }
        }
    }

    /// Adds `amount` wei to the balance of `address`, creating the account if
    /// needed.
    fn credit(&mut self, address: Addr, amount: W256) {
        if amount == W256::ZERO {
            return;
        }
        self.with_contract_mut(address, |contract| {
            let balance = std::mem::replace(&mut contract.balance, word::zero());
            contract.balance = word::add(balance, Word::Lit(amount));
        });
    }
}

