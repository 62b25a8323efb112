//! This module maintains the correspondence between raw bytecode and the
//! operations it encodes.
//!
//! Where most operations occupy a single byte, the `PUSH` family is followed
//! by its immediate data, so a byte offset does not directly identify an
//! operation. The [`op_ix_map`] maps every byte offset to the index of the
//! operation that owns it, which is what makes `JUMPDEST` validation against
//! `PUSH` immediates possible.

use crate::opcode::Op;

/// The longest CBOR metadata trailer that will be recognised and stripped.
/// Solidity's trailer is well under this; anything longer is assumed to be
/// code.
const MAXIMUM_METADATA_BYTES: usize = 1024;

/// Builds the byte-offset-to-operation-index map for `code`.
///
/// The result has one entry per byte of `code`; the bytes of a `PUSH`
/// immediate all map to the index of the owning `PUSH` operation.
#[must_use]
pub fn op_ix_map(code: &[u8]) -> Vec<u32> {
    let mut map = Vec::with_capacity(code.len());
    let mut op_index = 0u32;
    let mut offset = 0usize;
    while offset < code.len() {
        let op = Op::from_byte(code[offset]);
        let size = op.size().min(code.len() - offset);
        for _ in 0..size {
            map.push(op_index);
        }
        op_index += 1;
        offset += size;
    }
    map
}

/// Decodes `code` into its sequence of operations, each paired with the byte
/// offset at which it begins.
///
/// Callers that want the decoded view of deployed bytecode should pass the
/// output of [`strip_bytecode_metadata`] so that the CBOR trailer is not
/// misread as code.
#[must_use]
pub fn code_ops(code: &[u8]) -> Vec<(u32, Op)> {
    let mut ops = Vec::new();
    let mut offset = 0usize;
    while offset < code.len() {
        let op = Op::from_byte(code[offset]);
        ops.push((offset as u32, op));
        offset += op.size();
    }
    ops
}

/// Strips the CBOR metadata trailer that the Solidity compiler appends to
/// deployed bytecode, if one is present.
///
/// The trailer ends with a big-endian two-byte length of the CBOR payload;
/// the payload itself begins with a small CBOR map header (`0xa1` or `0xa2`
/// for the one- and two-entry maps the compiler emits). When no plausible
/// trailer is found the input is returned unchanged.
#[must_use]
pub fn strip_bytecode_metadata(code: &[u8]) -> &[u8] {
    if code.len() < 2 {
        return code;
    }
    let payload_len = u16::from_be_bytes([code[code.len() - 2], code[code.len() - 1]]) as usize;
    let trailer_len = payload_len + 2;
    if payload_len > MAXIMUM_METADATA_BYTES || trailer_len > code.len() {
        return code;
    }
    let payload_start = code.len() - trailer_len;
    match code[payload_start] {
        0xa1 | 0xa2 => &code[..payload_start],
        _ => code,
    }
}

/// Checks whether byte offset `pc` in `code` is a valid `JUMPDEST`: the byte
/// there must be `0x5b` *and* must not be the immediate of a preceding
/// `PUSH`.
///
/// `ops` and `map` must be the [`code_ops`] and [`op_ix_map`] of `code`
/// (with `ops` built over the metadata-stripped view).
#[must_use]
pub fn is_valid_jump_dest(code: &[u8], ops: &[(u32, Op)], map: &[u32], pc: usize) -> bool {
    if code.get(pc) != Some(&Op::JumpDest.as_byte()) {
        return false;
    }
    let Some(op_index) = map.get(pc) else {
        return false;
    };
    matches!(ops.get(*op_index as usize), Some((_, Op::JumpDest)))
}
