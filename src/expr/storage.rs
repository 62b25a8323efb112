//! Smart constructors and static reads for [`Storage`]-sorted expressions.
//!
//! Storage is addressed by concrete account address and (possibly symbolic)
//! slot. Concrete writes fold into the underlying map; symbolic writes form a
//! chain of [`Storage::Write`] nodes whose shared tails make reversion
//! snapshots cheap.

use std::{collections::BTreeMap, rc::Rc};

use crate::expr::{Addr, Storage, Word};

/// The outcome of a static storage lookup.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReadResult {
    /// The lookup resolved to this value.
    Value(Word),

    /// The lookup walked to a fully concrete base without finding the slot.
    /// The caller decides between fetching the slot (external accounts) and
    /// defaulting it to zero (native accounts).
    Unwritten,

    /// The lookup hit an abstract base or a write whose aliasing with the
    /// requested slot cannot be decided; the value is genuinely symbolic.
    Indeterminate,
}

/// Statically reads the value of `slot` of the account at `address` from
/// `storage`.
///
/// The lookup resolves on a hit in a concrete store, or through a write
/// chain whose relevant entries can all be compared with the requested slot.
#[must_use]
pub fn read(address: Addr, slot: &Word, storage: &Storage) -> ReadResult {
    match storage {
        Storage::Empty => ReadResult::Unwritten,
        Storage::Abstract => ReadResult::Indeterminate,
        Storage::Concrete(accounts) => {
            let Some(key) = slot.maybe_lit() else {
                return ReadResult::Indeterminate;
            };
            match accounts.get(&address).and_then(|slots| slots.get(&key)) {
                Some(value) => ReadResult::Value(Word::Lit(*value)),
                None => ReadResult::Unwritten,
            }
        }
        Storage::Write {
            address: written_address,
            slot: written_slot,
            value,
            prev,
        } => {
            if *written_address != address {
                // Writes to other accounts can never alias this read.
                return read(address, slot, prev);
            }
            if slot == written_slot.as_ref() {
                return ReadResult::Value(Word::clone(value));
            }
            match (slot.maybe_lit(), written_slot.maybe_lit()) {
                // Both concrete and distinct, so the write cannot alias.
                (Some(_), Some(_)) => read(address, slot, prev),
                // Aliasing cannot be decided statically.
                _ => ReadResult::Indeterminate,
            }
        }
    }
}

/// Writes `value` into `slot` of the account at `address` over `storage`.
#[must_use]
pub fn write(address: Addr, slot: Word, value: Word, storage: Storage) -> Storage {
    match (slot, value, storage) {
        (Word::Lit(slot), Word::Lit(value), Storage::Concrete(mut accounts)) => {
            accounts.entry(address).or_default().insert(slot, value);
            Storage::Concrete(accounts)
        }
        (Word::Lit(slot), Word::Lit(value), Storage::Empty) => {
            let mut accounts: BTreeMap<Addr, BTreeMap<_, _>> = BTreeMap::new();
            accounts.entry(address).or_default().insert(slot, value);
            Storage::Concrete(accounts)
        }
        // A same-slot write shadows the one below it.
        (
            slot,
            value,
            Storage::Write {
                address: written_address,
                slot: written_slot,
                prev,
                ..
            },
        ) if written_address == address && slot == *written_slot => Storage::Write {
            address,
            slot: Box::new(slot),
            value: Box::new(value),
            prev,
        },
        (slot, value, storage) => Storage::Write {
            address,
            slot: Box::new(slot),
            value: Box::new(value),
            prev: Rc::new(storage),
        },
    }
}

#[cfg(test)]
mod test {
    use crate::expr::{
        storage::{self, ReadResult},
        word, Addr, Storage, Word,
    };

    fn addr(value: u64) -> Addr {
        Addr::from(value)
    }

    #[test]
    fn empty_storage_reports_unwritten_slots() {
        // The engine decides between a fetch and a zero default, so the read
        // itself must not resolve.
        assert_eq!(
            storage::read(addr(1), &Word::from(0u64), &Storage::Empty),
            ReadResult::Unwritten
        );
    }

    #[test]
    fn abstract_storage_is_indeterminate() {
        assert_eq!(
            storage::read(addr(1), &Word::from(0u64), &Storage::Abstract),
            ReadResult::Indeterminate
        );
    }

    #[test]
    fn concrete_writes_fold_into_the_map() {
        let store = storage::write(addr(1), Word::from(5u64), Word::from(9u64), Storage::Empty);
        assert!(matches!(store, Storage::Concrete(_)));
        assert_eq!(
            storage::read(addr(1), &Word::from(5u64), &store),
            ReadResult::Value(Word::from(9u64))
        );
        assert_eq!(
            storage::read(addr(1), &Word::from(6u64), &store),
            ReadResult::Unwritten
        );
        assert_eq!(
            storage::read(addr(2), &Word::from(5u64), &store),
            ReadResult::Unwritten
        );
    }

    #[test]
    fn symbolic_write_chains_resolve_identical_slots() {
        let slot = word::var("slot");
        let store = storage::write(
            addr(1),
            slot.clone(),
            Word::from(7u64),
            Storage::Abstract,
        );
        assert_eq!(
            storage::read(addr(1), &slot, &store),
            ReadResult::Value(Word::from(7u64))
        );
        // A concrete read against a symbolic write cannot be decided.
        assert_eq!(
            storage::read(addr(1), &Word::from(0u64), &store),
            ReadResult::Indeterminate
        );
    }

    #[test]
    fn writes_to_other_accounts_do_not_obstruct_reads() {
        let store = storage::write(
            addr(2),
            word::var("slot"),
            Word::from(7u64),
            storage::write(addr(1), Word::from(0u64), Word::from(3u64), Storage::Empty),
        );
        assert_eq!(
            storage::read(addr(1), &Word::from(0u64), &store),
            ReadResult::Value(Word::from(3u64))
        );
    }

    #[test]
    fn same_slot_writes_flatten() {
        let slot = word::var("slot");
        let store = storage::write(
            addr(1),
            slot.clone(),
            Word::from(2u64),
            storage::write(addr(1), slot.clone(), Word::from(1u64), Storage::Abstract),
        );
        match store {
            Storage::Write { value, prev, .. } => {
                assert_eq!(*value, Word::from(2u64));
                assert_eq!(*prev, Storage::Abstract);
            }
            other => panic!("Expected a flattened write chain, got {other:?}"),
        }
    }
}
