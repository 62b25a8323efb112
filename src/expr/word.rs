//! Smart constructors for [`Word`]-sorted expressions.
//!
//! Every constructor folds to a [`Word::Lit`] when its inputs are concrete,
//! and applies the algebraic identities of the underlying operation where
//! doing so cannot change the semantics. Word arithmetic wraps modulo 2^256;
//! the signed operations reinterpret words as two's-complement integers.

use ethnum::{I256, U256};
use num_bigint::BigUint;

use crate::expr::{Byte, Word, W256};

/// The word representing zero.
#[must_use]
pub fn zero() -> Word {
    Word::Lit(U256::ZERO)
}

/// The word representing one.
#[must_use]
pub fn one() -> Word {
    Word::Lit(U256::ONE)
}

/// Constructs an abstract word named `name`.
#[must_use]
pub fn var(name: impl Into<String>) -> Word {
    Word::Var(name.into())
}

/// Wrapping addition of `left` and `right`.
#[must_use]
pub fn add(left: Word, right: Word) -> Word {
    match (left, right) {
        (Word::Lit(a), Word::Lit(b)) => Word::Lit(a.wrapping_add(b)),
        (Word::Lit(a), x) | (x, Word::Lit(a)) if a == U256::ZERO => x,
        (left, right) => Word::Add {
            left:  Box::new(left),
            right: Box::new(right),
        },
    }
}

/// Wrapping subtraction of `right` from `left`.
#[must_use]
pub fn sub(left: Word, right: Word) -> Word {
    match (left, right) {
        (Word::Lit(a), Word::Lit(b)) => Word::Lit(a.wrapping_sub(b)),
        (x, Word::Lit(a)) if a == U256::ZERO => x,
        (left, right) if left == right => zero(),
        (left, right) => Word::Sub {
            left:  Box::new(left),
            right: Box::new(right),
        },
    }
}

/// Wrapping multiplication of `left` and `right`.
#[must_use]
pub fn mul(left: Word, right: Word) -> Word {
    match (left, right) {
        (Word::Lit(a), Word::Lit(b)) => Word::Lit(a.wrapping_mul(b)),
        (Word::Lit(a), _) | (_, Word::Lit(a)) if a == U256::ZERO => zero(),
        (Word::Lit(a), x) | (x, Word::Lit(a)) if a == U256::ONE => x,
        (left, right) => Word::Mul {
            left:  Box::new(left),
            right: Box::new(right),
        },
    }
}

/// Unsigned division of `left` by `right`, yielding zero when the divisor is
/// zero.
#[must_use]
pub fn div(left: Word, right: Word) -> Word {
    match (left, right) {
        (_, Word::Lit(b)) if b == U256::ZERO => zero(),
        (Word::Lit(a), Word::Lit(b)) => Word::Lit(a / b),
        (x, Word::Lit(b)) if b == U256::ONE => x,
        (left, right) => Word::Div {
            left:  Box::new(left),
            right: Box::new(right),
        },
    }
}

/// Signed division of `left` by `right`, yielding zero when the divisor is
/// zero. The overflow case `MIN / -1` wraps to `MIN` as on the EVM.
#[must_use]
pub fn sdiv(left: Word, right: Word) -> Word {
    match (left, right) {
        (_, Word::Lit(b)) if b == U256::ZERO => zero(),
        (Word::Lit(a), Word::Lit(b)) => {
            Word::Lit(a.as_i256().wrapping_div(b.as_i256()).as_u256())
        }
        (left, right) => Word::SDiv {
            left:  Box::new(left),
            right: Box::new(right),
        },
    }
}

/// Unsigned modulo of `left` by `right`, yielding zero when the modulus is
/// zero.
#[must_use]
pub fn emod(left: Word, right: Word) -> Word {
    match (left, right) {
        (_, Word::Lit(b)) if b == U256::ZERO => zero(),
        (Word::Lit(a), Word::Lit(b)) => Word::Lit(a % b),
        (left, right) => Word::Mod {
            left:  Box::new(left),
            right: Box::new(right),
        },
    }
}

/// Signed modulo of `left` by `right`, yielding zero when the modulus is
/// zero. The result takes the sign of the dividend.
#[must_use]
pub fn smod(left: Word, right: Word) -> Word {
    match (left, right) {
        (_, Word::Lit(b)) if b == U256::ZERO => zero(),
        (Word::Lit(a), Word::Lit(b)) => {
            Word::Lit(a.as_i256().wrapping_rem(b.as_i256()).as_u256())
        }
        (left, right) => Word::SMod {
            left:  Box::new(left),
            right: Box::new(right),
        },
    }
}

/// `(left + right) % modulus` computed without intermediate wrap-around,
/// yielding zero when the modulus is zero.
#[must_use]
pub fn addmod(left: Word, right: Word, modulus: Word) -> Word {
    match (left, right, modulus) {
        (_, _, Word::Lit(n)) if n == U256::ZERO => zero(),
        (Word::Lit(a), Word::Lit(b), Word::Lit(n)) => {
            let wide = BigUint::from_bytes_be(&a.to_be_bytes())
                + BigUint::from_bytes_be(&b.to_be_bytes());
            Word::Lit(narrow(&(wide % BigUint::from_bytes_be(&n.to_be_bytes()))))
        }
        (left, right, modulus) => Word::AddMod {
            left:    Box::new(left),
            right:   Box::new(right),
            modulus: Box::new(modulus),
        },
    }
}

/// `(left * right) % modulus` computed without intermediate wrap-around,
/// yielding zero when the modulus is zero.
#[must_use]
pub fn mulmod(left: Word, right: Word, modulus: Word) -> Word {
    match (left, right, modulus) {
        (_, _, Word::Lit(n)) if n == U256::ZERO => zero(),
        (Word::Lit(a), Word::Lit(b), Word::Lit(n)) => {
            let wide = BigUint::from_bytes_be(&a.to_be_bytes())
                * BigUint::from_bytes_be(&b.to_be_bytes());
            Word::Lit(narrow(&(wide % BigUint::from_bytes_be(&n.to_be_bytes()))))
        }
        (left, right, modulus) => Word::MulMod {
            left:    Box::new(left),
            right:   Box::new(right),
            modulus: Box::new(modulus),
        },
    }
}

/// Wrapping exponentiation of `base` to `exponent`.
#[must_use]
pub fn exp(base: Word, exponent: Word) -> Word {
    match (base, exponent) {
        (_, Word::Lit(e)) if e == U256::ZERO => one(),
        (x, Word::Lit(e)) if e == U256::ONE => x,
        (Word::Lit(b), Word::Lit(e)) => Word::Lit(pow_wrapping(b, e)),
        (base, exponent) => Word::Exp {
            base:     Box::new(base),
            exponent: Box::new(exponent),
        },
    }
}

/// Sign-extends `value` from the `(size + 1)`-th least significant byte.
#[must_use]
pub fn sex(size: Word, value: Word) -> Word {
    match (size, value) {
        (Word::Lit(b), x) if b >= U256::from(31u64) => x,
        (Word::Lit(b), Word::Lit(x)) => {
            let bit = 8 * b.as_u32() + 7;
            let mask = (U256::ONE << (bit + 1)) - U256::ONE;
            if x & (U256::ONE << bit) != U256::ZERO {
                Word::Lit(x | !mask)
            } else {
                Word::Lit(x & mask)
            }
        }
        (size, value) => Word::SEx {
            size:  Box::new(size),
            value: Box::new(value),
        },
    }
}

/// Unsigned strict comparison `left < right`, producing 0 or 1.
#[must_use]
pub fn lt(left: Word, right: Word) -> Word {
    match (left, right) {
        (Word::Lit(a), Word::Lit(b)) => from_bool(a < b),
        (_, Word::Lit(b)) if b == U256::ZERO => zero(),
        (left, right) => Word::Lt {
            left:  Box::new(left),
            right: Box::new(right),
        },
    }
}

/// Unsigned strict comparison `left > right`, producing 0 or 1.
#[must_use]
pub fn gt(left: Word, right: Word) -> Word {
    match (left, right) {
        (Word::Lit(a), Word::Lit(b)) => from_bool(a > b),
        (Word::Lit(a), _) if a == U256::ZERO => zero(),
        (left, right) => Word::Gt {
            left:  Box::new(left),
            right: Box::new(right),
        },
    }
}

/// Signed strict comparison `left < right`, producing 0 or 1.
#[must_use]
pub fn slt(left: Word, right: Word) -> Word {
    match (left, right) {
        (Word::Lit(a), Word::Lit(b)) => from_bool(a.as_i256() < b.as_i256()),
        (left, right) => Word::SLt {
            left:  Box::new(left),
            right: Box::new(right),
        },
    }
}

/// Signed strict comparison `left > right`, producing 0 or 1.
#[must_use]
pub fn sgt(left: Word, right: Word) -> Word {
    match (left, right) {
        (Word::Lit(a), Word::Lit(b)) => from_bool(a.as_i256() > b.as_i256()),
        (left, right) => Word::SGt {
            left:  Box::new(left),
            right: Box::new(right),
        },
    }
}

/// Equality of `left` and `right`, producing 0 or 1.
///
/// Structurally identical expressions are equal even when symbolic.
#[must_use]
pub fn eq(left: Word, right: Word) -> Word {
    match (left, right) {
        (Word::Lit(a), Word::Lit(b)) => from_bool(a == b),
        (left, right) if left == right => one(),
        (left, right) => Word::Eq {
            left:  Box::new(left),
            right: Box::new(right),
        },
    }
}

/// Equality of `value` with zero, producing 0 or 1.
#[must_use]
pub fn iszero(value: Word) -> Word {
    match value {
        Word::Lit(a) => from_bool(a == U256::ZERO),
        value => Word::IsZero {
            value: Box::new(value),
        },
    }
}

/// Bitwise conjunction of `left` and `right`.
#[must_use]
pub fn and(left: Word, right: Word) -> Word {
    match (left, right) {
        (Word::Lit(a), Word::Lit(b)) => Word::Lit(a & b),
        (Word::Lit(a), _) | (_, Word::Lit(a)) if a == U256::ZERO => zero(),
        (Word::Lit(a), x) | (x, Word::Lit(a)) if a == U256::MAX => x,
        (left, right) => Word::And {
            left:  Box::new(left),
            right: Box::new(right),
        },
    }
}

/// Bitwise disjunction of `left` and `right`.
#[must_use]
pub fn or(left: Word, right: Word) -> Word {
    match (left, right) {
        (Word::Lit(a), Word::Lit(b)) => Word::Lit(a | b),
        (Word::Lit(a), x) | (x, Word::Lit(a)) if a == U256::ZERO => x,
        (left, right) => Word::Or {
            left:  Box::new(left),
            right: Box::new(right),
        },
    }
}

/// Bitwise exclusive disjunction of `left` and `right`.
#[must_use]
pub fn xor(left: Word, right: Word) -> Word {
    match (left, right) {
        (Word::Lit(a), Word::Lit(b)) => Word::Lit(a ^ b),
        (Word::Lit(a), x) | (x, Word::Lit(a)) if a == U256::ZERO => x,
        (left, right) if left == right => zero(),
        (left, right) => Word::Xor {
            left:  Box::new(left),
            right: Box::new(right),
        },
    }
}

/// Bitwise negation of `value`.
#[must_use]
pub fn not(value: Word) -> Word {
    match value {
        Word::Lit(a) => Word::Lit(!a),
        Word::Not { value } => *value,
        value => Word::Not {
            value: Box::new(value),
        },
    }
}

/// Left shift of `value` by `shift` bits, zero for shifts of 256 or more.
#[must_use]
pub fn shl(shift: Word, value: Word) -> Word {
    match (shift, value) {
        (Word::Lit(s), _) if s >= U256::from(256u64) => zero(),
        (Word::Lit(s), Word::Lit(v)) => Word::Lit(v << s.as_u32()),
        (Word::Lit(s), x) if s == U256::ZERO => x,
        (shift, value) => Word::Shl {
            shift: Box::new(shift),
            value: Box::new(value),
        },
    }
}

/// Logical right shift of `value` by `shift` bits, zero for shifts of 256 or
/// more.
#[must_use]
pub fn shr(shift: Word, value: Word) -> Word {
    match (shift, value) {
        (Word::Lit(s), _) if s >= U256::from(256u64) => zero(),
        (Word::Lit(s), Word::Lit(v)) => Word::Lit(v >> s.as_u32()),
        (Word::Lit(s), x) if s == U256::ZERO => x,
        (shift, value) => Word::Shr {
            shift: Box::new(shift),
            value: Box::new(value),
        },
    }
}

/// Arithmetic right shift of `value` by `shift` bits. Shifts of 256 or more
/// saturate to all-zeroes or all-ones depending on the sign of `value`.
#[must_use]
pub fn sar(shift: Word, value: Word) -> Word {
    match (shift, value) {
        (Word::Lit(s), Word::Lit(v)) => {
            if s >= U256::from(256u64) {
                if v.as_i256() < I256::ZERO {
                    Word::Lit(U256::MAX)
                } else {
                    zero()
                }
            } else {
                Word::Lit((v.as_i256() >> s.as_u32()).as_u256())
            }
        }
        (Word::Lit(s), x) if s == U256::ZERO => x,
        (shift, value) => Word::Sar {
            shift: Box::new(shift),
            value: Box::new(value),
        },
    }
}

/// Extracts byte `index` of `word`, counted big-endian from the most
/// significant side (index 0 is the most significant byte). Indices past 31
/// produce the zero byte.
#[must_use]
pub fn index_word(index: Word, word: Word) -> Byte {
    match (index, word) {
        (Word::Lit(i), _) if i >= U256::from(32u64) => Byte::Lit(0),
        (Word::Lit(i), Word::Lit(w)) => Byte::Lit(w.to_be_bytes()[i.as_usize()]),
        (index, word) => Byte::IndexWord {
            index: Box::new(index),
            word:  Box::new(word),
        },
    }
}

/// The larger of `left` and `right` under unsigned comparison.
#[must_use]
pub fn max(left: Word, right: Word) -> Word {
    match (left, right) {
        (Word::Lit(a), Word::Lit(b)) => Word::Lit(a.max(b)),
        (Word::Lit(a), x) | (x, Word::Lit(a)) if a == U256::ZERO => x,
        (left, right) => {
            let cond = Word::Lt {
                left:  Box::new(left.clone()),
                right: Box::new(right.clone()),
            };
            // There is no dedicated symbolic max node; encode it as a
            // comparison-selected sum, which the SMT layer handles natively.
            add(
                mul(cond.clone(), right),
                mul(iszero(cond), left),
            )
        }
    }
}

/// The smaller of `left` and `right` under unsigned comparison, encoded the
/// same way as [`max`] when symbolic.
#[must_use]
pub fn min(left: Word, right: Word) -> Word {
    match (left, right) {
        (Word::Lit(a), Word::Lit(b)) => Word::Lit(a.min(b)),
        (Word::Lit(a), _) | (_, Word::Lit(a)) if a == U256::ZERO => zero(),
        (left, right) => {
            let cond = Word::Lt {
                left:  Box::new(left.clone()),
                right: Box::new(right.clone()),
            };
            add(
                mul(cond.clone(), left),
                mul(iszero(cond), right),
            )
        }
    }
}

/// Converts a flag into the EVM's 0-or-1 word encoding.
#[must_use]
fn from_bool(value: bool) -> Word {
    if value {
        one()
    } else {
        zero()
    }
}

/// Truncates an arbitrary-precision value that is already known to fit into a
/// word.
fn narrow(value: &BigUint) -> W256 {
    let bytes = value.to_bytes_be();
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    U256::from_be_bytes(out)
}

/// Exponentiation by squaring modulo 2^256.
fn pow_wrapping(base: W256, exponent: W256) -> W256 {
    let mut result = U256::ONE;
    let mut base = base;
    let mut exponent = exponent;
    while exponent != U256::ZERO {
        if exponent & U256::ONE == U256::ONE {
            result = result.wrapping_mul(base);
        }
        base = base.wrapping_mul(base);
        exponent >>= 1;
    }
    result
}

#[cfg(test)]
mod test {
    use ethnum::U256;

    use crate::expr::{word, Byte, Word};

    fn lit(value: u64) -> Word {
        Word::from(value)
    }

    #[test]
    fn addition_folds_and_wraps() {
        assert_eq!(word::add(lit(1), lit(2)), lit(3));
        assert_eq!(
            word::add(Word::Lit(U256::MAX), lit(1)),
            word::zero()
        );
    }

    #[test]
    fn addition_drops_zero_operands() {
        let x = word::var("x");
        assert_eq!(word::add(x.clone(), word::zero()), x.clone());
        assert_eq!(word::add(word::zero(), x.clone()), x);
    }

    #[test]
    fn multiplication_by_zero_annihilates_symbols() {
        assert_eq!(word::mul(word::var("x"), word::zero()), word::zero());
    }

    #[test]
    fn division_by_zero_is_zero() {
        assert_eq!(word::div(lit(10), word::zero()), word::zero());
        assert_eq!(word::emod(lit(10), word::zero()), word::zero());
        assert_eq!(word::sdiv(lit(10), word::zero()), word::zero());
        assert_eq!(word::smod(lit(10), word::zero()), word::zero());
    }

    #[test]
    fn signed_division_truncates_toward_zero() {
        let minus_seven = word::sub(word::zero(), lit(7));
        assert_eq!(
            word::sdiv(minus_seven.clone(), lit(2)),
            word::sub(word::zero(), lit(3))
        );
        assert_eq!(
            word::smod(minus_seven, lit(2)),
            word::sub(word::zero(), lit(1))
        );
    }

    #[test]
    fn signed_division_overflow_wraps() {
        let min = Word::Lit(U256::ONE << 255u32);
        let minus_one = Word::Lit(U256::MAX);
        assert_eq!(word::sdiv(min.clone(), minus_one), min);
    }

    #[test]
    fn modular_arithmetic_avoids_intermediate_overflow() {
        let max = Word::Lit(U256::MAX);
        // 2^256 - 1 is congruent to 1 modulo 7; wrapping intermediates would
        // give different answers.
        assert_eq!(word::addmod(max.clone(), max.clone(), lit(7)), lit(2));
        assert_eq!(word::mulmod(max.clone(), max, lit(7)), lit(1));
        assert_eq!(word::addmod(lit(5), lit(5), word::zero()), word::zero());
    }

    #[test]
    fn exponentiation_folds() {
        assert_eq!(word::exp(lit(2), lit(10)), lit(1024));
        assert_eq!(word::exp(word::var("x"), word::zero()), word::one());
    }

    #[test]
    fn sign_extension_propagates_the_sign_bit() {
        assert_eq!(
            word::sex(word::zero(), lit(0x80)),
            Word::Lit(U256::MAX - U256::from(0x7fu64))
        );
        assert_eq!(word::sex(word::zero(), lit(0x7f)), lit(0x7f));
    }

    #[test]
    fn comparisons_produce_flags() {
        assert_eq!(word::lt(lit(1), lit(2)), word::one());
        assert_eq!(word::gt(lit(1), lit(2)), word::zero());
        assert_eq!(word::slt(Word::Lit(U256::MAX), lit(0)), word::one());
        assert_eq!(word::sgt(Word::Lit(U256::MAX), lit(0)), word::zero());
    }

    #[test]
    fn structurally_identical_expressions_are_equal() {
        let x = word::var("x");
        assert_eq!(word::eq(x.clone(), x), word::one());
    }

    #[test]
    fn iszero_folds_literals() {
        assert_eq!(word::iszero(word::zero()), word::one());
        assert_eq!(word::iszero(lit(3)), word::zero());
    }

    #[test]
    fn shifts_of_a_word_or_more_vanish() {
        assert_eq!(word::shl(lit(256), word::var("x")), word::zero());
        assert_eq!(word::shr(lit(256), word::var("x")), word::zero());
        assert_eq!(
            word::sar(lit(256), Word::Lit(U256::MAX)),
            Word::Lit(U256::MAX)
        );
        assert_eq!(word::sar(lit(256), lit(1)), word::zero());
    }

    #[test]
    fn double_negation_cancels() {
        let x = word::var("x");
        assert_eq!(word::not(word::not(x.clone())), x);
    }

    #[test]
    fn byte_indexing_is_big_endian() {
        let word = Word::Lit(U256::from(0x0102u64));
        assert_eq!(word::index_word(lit(31), word.clone()), Byte::Lit(0x02));
        assert_eq!(word::index_word(lit(30), word.clone()), Byte::Lit(0x01));
        assert_eq!(word::index_word(lit(0), word.clone()), Byte::Lit(0x00));
        assert_eq!(word::index_word(lit(32), word), Byte::Lit(0x00));
    }
}
