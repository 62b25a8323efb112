//! Smart constructors for [`Prop`]-sorted expressions.

use crate::expr::{word, Prop, Word};

/// The proposition that `left` and `right` are equal.
#[must_use]
pub fn eq(left: Word, right: Word) -> Prop {
    match (left, right) {
        (Word::Lit(a), Word::Lit(b)) => Prop::Bool(a == b),
        (left, right) if left == right => Prop::Bool(true),
        (left, right) => Prop::Eq(left, right),
    }
}

/// The proposition that `left` is strictly less than `right` (unsigned).
#[must_use]
pub fn lt(left: Word, right: Word) -> Prop {
    match (left, right) {
        (Word::Lit(a), Word::Lit(b)) => Prop::Bool(a < b),
        (left, right) => Prop::Lt(left, right),
    }
}

/// The proposition that `left` is strictly greater than `right` (unsigned).
#[must_use]
pub fn gt(left: Word, right: Word) -> Prop {
    match (left, right) {
        (Word::Lit(a), Word::Lit(b)) => Prop::Bool(a > b),
        (left, right) => Prop::Gt(left, right),
    }
}

/// The proposition that `left` is at most `right` (unsigned).
#[must_use]
pub fn leq(left: Word, right: Word) -> Prop {
    match (left, right) {
        (Word::Lit(a), Word::Lit(b)) => Prop::Bool(a <= b),
        (left, right) => Prop::Leq(left, right),
    }
}

/// The proposition that `left` is at least `right` (unsigned).
#[must_use]
pub fn geq(left: Word, right: Word) -> Prop {
    match (left, right) {
        (Word::Lit(a), Word::Lit(b)) => Prop::Bool(a >= b),
        (left, right) => Prop::Geq(left, right),
    }
}

/// The conjunction of `left` and `right`.
#[must_use]
pub fn and(left: Prop, right: Prop) -> Prop {
    match (left, right) {
        (Prop::Bool(false), _) | (_, Prop::Bool(false)) => Prop::Bool(false),
        (Prop::Bool(true), p) | (p, Prop::Bool(true)) => p,
        (left, right) => Prop::And(Box::new(left), Box::new(right)),
    }
}

/// The disjunction of `left` and `right`.
#[must_use]
pub fn or(left: Prop, right: Prop) -> Prop {
    match (left, right) {
        (Prop::Bool(true), _) | (_, Prop::Bool(true)) => Prop::Bool(true),
        (Prop::Bool(false), p) | (p, Prop::Bool(false)) => p,
        (left, right) => Prop::Or(Box::new(left), Box::new(right)),
    }
}

/// The negation of `prop`.
#[must_use]
pub fn neg(prop: Prop) -> Prop {
    match prop {
        Prop::Bool(value) => Prop::Bool(!value),
        Prop::Neg(inner) => *inner,
        prop => Prop::Neg(Box::new(prop)),
    }
}

/// The proposition that `value` is non-zero, as appended to the path when a
/// conditional branch is taken.
#[must_use]
pub fn is_nonzero(value: Word) -> Prop {
    neg(eq(value, word::zero()))
}

/// The proposition that `value` is zero, as appended to the path when a
/// conditional branch falls through.
#[must_use]
pub fn is_zero(value: Word) -> Prop {
    eq(value, word::zero())
}
