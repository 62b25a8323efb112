//! Smart constructors and static reads for [`Buf`]-sorted expressions.
//!
//! Buffers are conceptually infinite and zero-initialised. Concrete buffers
//! are kept as plain byte vectors for as long as every write to them is
//! concrete; the first symbolic write starts a write chain whose tail is
//! shared by reference.

use std::rc::Rc;

use ethnum::U256;

use crate::expr::{word, Buf, Byte, Word};

/// The largest buffer region the engine will reify into a concrete byte
/// vector. Larger regions stay symbolic; on-chain gas limits make them
/// unreachable in practice.
const MAXIMUM_REIFIED_BYTES: u64 = 1 << 32;

/// The length of `buffer` in bytes.
///
/// Returns a [`Word::Lit`] whenever the length is statically determined.
#[must_use]
pub fn length(buffer: &Buf) -> Word {
    match buffer {
        Buf::Concrete(bytes) => Word::Lit(U256::from(bytes.len() as u64)),
        Buf::Abstract(_) => Word::BufLength {
            buffer: Rc::new(buffer.clone()),
        },
        Buf::WriteWord { index, tail, .. } => word::max(
            length(tail),
            word::add(Word::clone(index), Word::from(32u64)),
        ),
        Buf::WriteByte { index, tail, .. } => word::max(
            length(tail),
            word::add(Word::clone(index), Word::from(1u64)),
        ),
        Buf::CopySlice {
            dst_offset,
            size,
            dst,
            ..
        } => word::max(
            length(dst),
            word::add(Word::clone(dst_offset), Word::clone(size)),
        ),
    }
}

/// Reads the byte at `index` from `buffer`.
///
/// Reads beyond every written region produce the zero byte.
#[must_use]
pub fn read_byte(index: &Word, buffer: &Buf) -> Byte {
    match buffer {
        Buf::Concrete(bytes) => match index.maybe_lit() {
            Some(i) => {
                let byte = if i < U256::from(MAXIMUM_REIFIED_BYTES) {
                    bytes.get(i.as_usize()).copied().unwrap_or(0)
                } else {
                    0
                };
                Byte::Lit(byte)
            }
            None => symbolic_read_byte(index, buffer),
        },
        Buf::WriteByte {
            index: written,
            value,
            tail,
        } => {
            if index == written.as_ref() {
                Byte::clone(value)
            } else if let (Some(i), Some(w)) = (index.maybe_lit(), written.maybe_lit()) {
                debug_assert!(i != w);
                read_byte(index, tail)
            } else {
                symbolic_read_byte(index, buffer)
            }
        }
        Buf::WriteWord {
            index: written,
            value,
            tail,
        } => match (index.maybe_lit(), written.maybe_lit()) {
            (Some(i), Some(w)) => {
                if i >= w && i < w.wrapping_add(U256::from(32u64)) {
                    word::index_word(Word::Lit(i - w), Word::clone(value))
                } else {
                    read_byte(index, tail)
                }
            }
            _ => symbolic_read_byte(index, buffer),
        },
        Buf::CopySlice {
            src_offset,
            dst_offset,
            size,
            src,
            dst,
        } => match (
            index.maybe_lit(),
            src_offset.maybe_lit(),
            dst_offset.maybe_lit(),
            size.maybe_lit(),
        ) {
            (Some(i), Some(src_off), Some(dst_off), Some(n)) => {
                if i >= dst_off && i < dst_off.wrapping_add(n) {
                    read_byte(&Word::Lit(i - dst_off + src_off), src)
                } else {
                    read_byte(index, dst)
                }
            }
            _ => symbolic_read_byte(index, buffer),
        },
        Buf::Abstract(_) => symbolic_read_byte(index, buffer),
    }
}

/// Reads the 32-byte word starting at `index` from `buffer`, zero-extending
/// beyond the end of the written region.
#[must_use]
pub fn read_word(index: &Word, buffer: &Buf) -> Word {
    // A word-aligned read of a word-sized write resolves without inspecting
    // individual bytes, even when the index is symbolic.
    if let Buf::WriteWord {
        index: written,
        value,
        ..
    } = buffer
    {
        if index == written.as_ref() {
            return Word::clone(value);
        }
    }

    // Otherwise resolve byte by byte, folding to a literal when every byte is
    // concretely known.
    let mut bytes = [0u8; 32];
    for (offset, slot) in bytes.iter_mut().enumerate() {
        let byte = read_byte(
            &word::add(index.clone(), Word::from(offset as u64)),
            buffer,
        );
        match byte.maybe_lit() {
            Some(value) => *slot = value,
            None => {
                return Word::ReadWord {
                    index:  Box::new(index.clone()),
                    buffer: Rc::new(buffer.clone()),
                }
            }
        }
    }
    Word::Lit(U256::from_be_bytes(bytes))
}

/// Writes the byte `value` at `index` over `buffer`.
#[must_use]
pub fn write_byte(index: Word, value: Byte, buffer: Buf) -> Buf {
    match (index, value, buffer) {
        (Word::Lit(i), Byte::Lit(b), Buf::Concrete(mut bytes))
            if i < U256::from(MAXIMUM_REIFIED_BYTES) =>
        {
            let i = i.as_usize();
            if bytes.len() <= i {
                bytes.resize(i + 1, 0);
            }
            bytes[i] = b;
            Buf::Concrete(bytes)
        }
        // A same-index write shadows the one below it.
        (
            index,
            value,
            Buf::WriteByte {
                index: written,
                tail,
                ..
            },
        ) if index == *written => Buf::WriteByte {
            index: Box::new(index),
            value: Box::new(value),
            tail,
        },
        (index, value, buffer) => Buf::WriteByte {
            index: Box::new(index),
            value: Box::new(value),
            tail:  Rc::new(buffer),
        },
    }
}

/// Writes the 32-byte word `value` at `index` over `buffer`.
#[must_use]
pub fn write_word(index: Word, value: Word, buffer: Buf) -> Buf {
    match (index, value, buffer) {
        (Word::Lit(i), Word::Lit(v), Buf::Concrete(mut bytes))
            if i < U256::from(MAXIMUM_REIFIED_BYTES) =>
        {
            let i = i.as_usize();
            if bytes.len() < i + 32 {
                bytes.resize(i + 32, 0);
            }
            bytes[i..i + 32].copy_from_slice(&v.to_be_bytes());
            Buf::Concrete(bytes)
        }
        (
            index,
            value,
            Buf::WriteWord {
                index: written,
                tail,
                ..
            },
        ) if index == *written => Buf::WriteWord {
            index: Box::new(index),
            value: Box::new(value),
            tail,
        },
        (index, value, buffer) => Buf::WriteWord {
            index: Box::new(index),
            value: Box::new(value),
            tail:  Rc::new(buffer),
        },
    }
}

/// Splices `size` bytes of `src` starting at `src_offset` over `dst` starting
/// at `dst_offset`.
///
/// Bytes read past the end of `src` are zeroes, as for any buffer read.
#[must_use]
pub fn copy_slice(src_offset: Word, dst_offset: Word, size: Word, src: &Buf, dst: Buf) -> Buf {
    if size.maybe_lit() == Some(U256::ZERO) {
        return dst;
    }

    if let (Some(src_off), Some(dst_off), Some(n), Some(src_bytes)) = (
        src_offset.maybe_lit(),
        dst_offset.maybe_lit(),
        size.maybe_lit(),
        src.maybe_concrete(),
    ) {
        if let Buf::Concrete(dst_bytes) = &dst {
            if n < U256::from(MAXIMUM_REIFIED_BYTES)
                && dst_off < U256::from(MAXIMUM_REIFIED_BYTES)
                && src_off < U256::from(MAXIMUM_REIFIED_BYTES)
            {
                let n = n.as_usize();
                let src_off = src_off.as_usize();
                let dst_off = dst_off.as_usize();

                let mut out = dst_bytes.clone();
                if out.len() < dst_off + n {
                    out.resize(dst_off + n, 0);
                }
                for i in 0..n {
                    out[dst_off + i] = src_bytes.get(src_off + i).copied().unwrap_or(0);
                }
                return Buf::Concrete(out);
            }
        }
    }

    Buf::CopySlice {
        src_offset: Box::new(src_offset),
        dst_offset: Box::new(dst_offset),
        size:       Box::new(size),
        src:        Rc::new(src.clone()),
        dst:        Rc::new(dst),
    }
}

/// Constructs a buffer from a sequence of byte expressions, folding to a
/// concrete buffer when every byte is a literal.
#[must_use]
pub fn from_bytes(bytes: &[Byte]) -> Buf {
    let concrete: Option<Vec<u8>> = bytes.iter().map(Byte::maybe_lit).collect();
    match concrete {
        Some(bytes) => Buf::Concrete(bytes),
        None => bytes.iter().enumerate().fold(Buf::empty(), |acc, (i, b)| {
            write_byte(Word::from(i as u64), b.clone(), acc)
        }),
    }
}

/// Appends `tail` after the concrete prefix `front`.
///
/// This is used to reconstitute init code, whose constructor arguments may be
/// abstract.
#[must_use]
pub fn append(front: &[u8], tail: &Buf) -> Buf {
    if front.is_empty() {
        return tail.clone();
    }
    match tail.maybe_concrete() {
        Some(bytes) => {
            let mut out = front.to_vec();
            out.extend_from_slice(bytes);
            Buf::Concrete(out)
        }
        None => copy_slice(
            word::zero(),
            Word::from(front.len() as u64),
            length(tail),
            tail,
            Buf::Concrete(front.to_vec()),
        ),
    }
}

/// Attempts to reify the region `[offset, offset + size)` of `buffer` into
/// concrete bytes, zero-extending past the end of the buffer.
///
/// Returns [`None`] when the offset or size is symbolic, when the region is
/// too large to reify, or when any byte in the region is symbolic.
#[must_use]
pub fn maybe_slice(offset: &Word, size: &Word, buffer: &Buf) -> Option<Vec<u8>> {
    let offset = offset.maybe_lit()?;
    let size = size.maybe_lit()?;
    if size >= U256::from(MAXIMUM_REIFIED_BYTES) {
        return None;
    }

    // The common case of a fully concrete buffer avoids the per-byte walk.
    if let Buf::Concrete(bytes) = buffer {
        if offset >= U256::from(MAXIMUM_REIFIED_BYTES) {
            return Some(vec![0; size.as_usize()]);
        }
        let offset = offset.as_usize();
        let size = size.as_usize();
        let mut out = vec![0u8; size];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = bytes.get(offset + i).copied().unwrap_or(0);
        }
        return Some(out);
    }

    let mut out = vec![0u8; size.as_usize()];
    for (i, slot) in out.iter_mut().enumerate() {
        let index = Word::Lit(offset.wrapping_add(U256::from(i as u64)));
        *slot = read_byte(&index, buffer).maybe_lit()?;
    }
    Some(out)
}

/// Constructs the fallback symbolic read-byte node.
fn symbolic_read_byte(index: &Word, buffer: &Buf) -> Byte {
    Byte::ReadByte {
        index:  Box::new(index.clone()),
        buffer: Rc::new(buffer.clone()),
    }
}

#[cfg(test)]
mod test {
    use ethnum::U256;

    use crate::expr::{buf, word, Buf, Byte, Word};

    #[test]
    fn length_of_concrete_buffer_is_literal() {
        let buffer = Buf::from(vec![1, 2, 3]);
        assert_eq!(buf::length(&buffer), Word::from(3u64));
    }

    #[test]
    fn length_accounts_for_write_extents() {
        let buffer = buf::write_word(Word::from(64u64), word::var("x"), Buf::empty());
        assert_eq!(buf::length(&buffer), Word::from(96u64));
    }

    #[test]
    fn reads_past_the_end_are_zero() {
        let buffer = Buf::from(vec![0xaa]);
        assert_eq!(buf::read_byte(&Word::from(9u64), &buffer), Byte::Lit(0));
    }

    #[test]
    fn read_word_zero_extends() {
        let buffer = Buf::from(vec![0x01]);
        let expected = {
            let mut bytes = [0u8; 32];
            bytes[0] = 0x01;
            Word::Lit(U256::from_be_bytes(bytes))
        };
        assert_eq!(buf::read_word(&word::zero(), &buffer), expected);
    }

    #[test]
    fn concrete_writes_stay_concrete() {
        let buffer = buf::write_word(word::zero(), Word::from(0xffu64), Buf::empty());
        assert!(matches!(buffer, Buf::Concrete(_)));
        assert_eq!(buf::read_word(&word::zero(), &buffer), Word::from(0xffu64));
    }

    #[test]
    fn symbolic_write_then_aligned_read_roundtrips() {
        let value = word::var("x");
        let buffer = buf::write_word(Word::from(32u64), value.clone(), Buf::empty());
        assert_eq!(buf::read_word(&Word::from(32u64), &buffer), value);
    }

    #[test]
    fn same_index_byte_writes_flatten() {
        let index = word::var("i");
        let first = buf::write_byte(index.clone(), Byte::Lit(1), Buf::Abstract("b".into()));
        let second = buf::write_byte(index.clone(), Byte::Lit(2), first);
        match second {
            Buf::WriteByte { value, tail, .. } => {
                assert_eq!(*value, Byte::Lit(2));
                assert_eq!(*tail, Buf::Abstract("b".into()));
            }
            other => panic!("Expected a flattened write chain, got {other:?}"),
        }
    }

    #[test]
    fn copy_slice_splices_concrete_buffers() {
        let src = Buf::from(vec![1, 2, 3, 4]);
        let dst = Buf::from(vec![9, 9, 9, 9, 9, 9]);
        let out = buf::copy_slice(
            Word::from(1u64),
            Word::from(2u64),
            Word::from(3u64),
            &src,
            dst,
        );
        assert_eq!(out.maybe_concrete(), Some(&[9u8, 9, 2, 3, 4, 9] as &[u8]));
    }

    #[test]
    fn copy_slice_of_zero_size_is_identity() {
        let dst = Buf::Abstract("dst".into());
        let out = buf::copy_slice(
            word::zero(),
            word::zero(),
            word::zero(),
            &Buf::Abstract("src".into()),
            dst.clone(),
        );
        assert_eq!(out, dst);
    }

    #[test]
    fn copy_slice_zero_pads_past_source_end() {
        let src = Buf::from(vec![1]);
        let out = buf::copy_slice(
            word::zero(),
            word::zero(),
            Word::from(4u64),
            &src,
            Buf::empty(),
        );
        assert_eq!(out.maybe_concrete(), Some(&[1u8, 0, 0, 0] as &[u8]));
    }

    #[test]
    fn slicing_resolves_through_write_chains() {
        let buffer = buf::write_word(
            Word::from(0u64),
            Word::Lit(U256::from(0xdeadu64)),
            Buf::Abstract("mem".into()),
        );
        let slice = buf::maybe_slice(&Word::from(30u64), &Word::from(2u64), &buffer);
        assert_eq!(slice, Some(vec![0xde, 0xad]));

        let unresolved = buf::maybe_slice(&Word::from(30u64), &Word::from(4u64), &buffer);
        assert_eq!(unresolved, None);
    }
}
