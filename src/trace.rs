//! This module contains the call/event trace tree that the engine grows as it
//! executes.
//!
//! The tree is append-only and carries a cursor: entering a frame descends
//! into a fresh child, popping a frame ascends to the parent. The flat
//! node-and-parent-pointer representation keeps the cursor cheap to move.

use crate::{
    error::EvmError,
    expr::{Addr, Buf, LogEntry},
};

/// A single record in the trace tree.
#[derive(Clone, Debug)]
pub struct Trace {
    /// The program counter at which the record was made.
    pub pc: usize,

    /// The account that was executing when the record was made.
    pub address: Addr,

    /// The payload of the record.
    pub data: TraceData,
}

/// The payload of a trace record.
#[derive(Clone, Debug)]
pub enum TraceData {
    /// A frame was entered (a call or a creation).
    FrameEntered,

    /// A frame returned with the given output.
    FrameReturned(Buf),

    /// A frame reverted with the given output.
    FrameReverted(Buf),

    /// An error occurred, or a pre-flight check failed without erroring the
    /// frame (depth limit, balance, nonce overflow, address collision).
    Error(EvmError),

    /// A log was emitted.
    Event(LogEntry),
}

/// The append-only trace tree with its cursor.
#[derive(Clone, Debug, Default)]
pub struct TraceTree {
    nodes:  Vec<TraceNode>,
    cursor: Option<usize>,
}

#[derive(Clone, Debug)]
struct TraceNode {
    trace:    Trace,
    parent:   Option<usize>,
    children: Vec<usize>,
}

impl TraceTree {
    /// Creates an empty trace tree with the cursor at the (virtual) root.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record at the current cursor position without moving the
    /// cursor.
    pub fn record(&mut self, trace: Trace) {
        self.insert(trace);
    }

    /// Appends a record and descends into it, so that subsequent records
    /// become its children. Used when entering a frame.
    pub fn enter(&mut self, trace: Trace) {
        let index = self.insert(trace);
        self.cursor = Some(index);
    }

    /// Ascends to the parent of the current position. Used when a frame is
    /// popped. Ascending from the root is a no-op.
    pub fn exit(&mut self) {
        self.cursor = self.cursor.and_then(|index| self.nodes[index].parent);
    }

    /// Gets the records at the top level of the tree.
    #[must_use]
    pub fn roots(&self) -> Vec<&Trace> {
        self.nodes
            .iter()
            .filter(|node| node.parent.is_none())
            .map(|node| &node.trace)
            .collect()
    }

    /// Gets the children of the `index`-th top-level record.
    #[must_use]
    pub fn children_of_root(&self, index: usize) -> Vec<&Trace> {
        let Some(root) = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.parent.is_none())
            .map(|(i, _)| i)
            .nth(index)
        else {
            return Vec::new();
        };
        self.nodes[root]
            .children
            .iter()
            .map(|child| &self.nodes[*child].trace)
            .collect()
    }

    /// Gets the number of records in the whole tree.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Checks whether the tree has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn insert(&mut self, trace: Trace) -> usize {
        let index = self.nodes.len();
        self.nodes.push(TraceNode {
            trace,
            parent: self.cursor,
            children: Vec::new(),
        });
        if let Some(parent) = self.cursor {
            self.nodes[parent].children.push(index);
        }
        index
    }
}

#[cfg(test)]
mod test {
    use crate::{
        expr::{Addr, Buf},
        trace::{Trace, TraceData, TraceTree},
    };

    fn trace(pc: usize) -> Trace {
        Trace {
            pc,
            address: Addr::from(1u64),
            data: TraceData::FrameEntered,
        }
    }

    #[test]
    fn records_at_the_root_stay_flat() {
        let mut tree = TraceTree::new();
        tree.record(trace(0));
        tree.record(trace(1));
        assert_eq!(tree.roots().len(), 2);
    }

    #[test]
    fn entering_nests_subsequent_records() {
        let mut tree = TraceTree::new();
        tree.enter(trace(0));
        tree.record(trace(1));
        tree.exit();
        tree.record(Trace {
            pc: 2,
            address: Addr::from(1u64),
            data: TraceData::FrameReturned(Buf::empty()),
        });

        assert_eq!(tree.roots().len(), 2);
        assert_eq!(tree.children_of_root(0).len(), 1);
        assert_eq!(tree.children_of_root(0)[0].pc, 1);
    }

    #[test]
    fn exiting_the_root_is_a_no_op() {
        let mut tree = TraceTree::new();
        tree.exit();
        tree.record(trace(0));
        assert_eq!(tree.roots().len(), 1);
    }
}
