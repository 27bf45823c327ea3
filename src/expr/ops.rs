//! Symbolic operation types.
//!
//! This module defines [`SymbolicOp`], the set of operations an execution engine may
//! record in an output expression. All operations work on 64-bit machine words with
//! wrapping semantics; division and shifts follow SMT-LIB bitvector rules so that a
//! concrete evaluation and a solver query always agree.
//!
//! Operations are categorized as:
//! - **Arithmetic**: Add, Sub, Mul, DivU, RemU, Neg
//! - **Bitwise**: And, Or, Xor, Not, Shl, ShrU, ByteSwap
//! - **Comparison**: Eq, Ne, LtU, LeU (yield 0 or 1)

use std::fmt;

use strum::EnumIter;

/// A symbolic operation in an expression tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter)]
pub enum SymbolicOp {
    // Arithmetic operations
    /// Wrapping addition.
    Add,
    /// Wrapping subtraction.
    Sub,
    /// Wrapping multiplication.
    Mul,
    /// Unsigned division. Division by zero yields all-ones.
    DivU,
    /// Unsigned remainder. Remainder by zero yields the dividend.
    RemU,
    /// Two's complement negation.
    Neg,

    // Bitwise operations
    /// Bitwise AND.
    And,
    /// Bitwise OR.
    Or,
    /// Bitwise XOR.
    Xor,
    /// Bitwise NOT.
    Not,
    /// Shift left. Shift amounts of 64 or more yield zero.
    Shl,
    /// Logical shift right. Shift amounts of 64 or more yield zero.
    ShrU,
    /// Reverses the byte order of the low 32 bits; the high half is cleared.
    ByteSwap,

    // Comparison operations (return 0 or 1)
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Unsigned less than.
    LtU,
    /// Unsigned less than or equal.
    LeU,
}

impl SymbolicOp {
    /// Checks if this operation is commutative.
    ///
    /// Commutative operations produce the same result regardless of operand order,
    /// which lets the arena canonicalize operand order before interning.
    #[must_use]
    pub const fn is_commutative(self) -> bool {
        matches!(
            self,
            Self::Add | Self::Mul | Self::And | Self::Or | Self::Xor | Self::Eq | Self::Ne
        )
    }

    /// Checks if this operation is a comparison.
    #[must_use]
    pub const fn is_comparison(self) -> bool {
        matches!(self, Self::Eq | Self::Ne | Self::LtU | Self::LeU)
    }

    /// Checks if this is a unary operation.
    #[must_use]
    pub const fn is_unary(self) -> bool {
        matches!(self, Self::Neg | Self::Not | Self::ByteSwap)
    }

    /// Checks if this operation makes an expression non-linear over its variables.
    ///
    /// Used by the classifier to penalize expressions that a closed-form inverse is
    /// unlikely to cover.
    #[must_use]
    pub const fn is_nonlinear(self) -> bool {
        matches!(self, Self::Mul | Self::DivU | Self::RemU)
    }

    /// Applies a unary operation to a concrete value.
    ///
    /// Binary operations passed here return the operand unchanged.
    #[must_use]
    pub fn apply_unary(self, value: u64) -> u64 {
        match self {
            Self::Neg => value.wrapping_neg(),
            Self::Not => !value,
            Self::ByteSwap => u64::from((value as u32).swap_bytes()),
            _ => value,
        }
    }

    /// Applies a binary operation to concrete values.
    ///
    /// Unary operations passed here return the left operand unchanged.
    #[must_use]
    pub fn apply_binary(self, lhs: u64, rhs: u64) -> u64 {
        match self {
            Self::Add => lhs.wrapping_add(rhs),
            Self::Sub => lhs.wrapping_sub(rhs),
            Self::Mul => lhs.wrapping_mul(rhs),
            Self::DivU => lhs.checked_div(rhs).unwrap_or(u64::MAX),
            Self::RemU => lhs.checked_rem(rhs).unwrap_or(lhs),
            Self::And => lhs & rhs,
            Self::Or => lhs | rhs,
            Self::Xor => lhs ^ rhs,
            Self::Shl => u32::try_from(rhs)
                .ok()
                .and_then(|amount| lhs.checked_shl(amount))
                .unwrap_or(0),
            Self::ShrU => u32::try_from(rhs)
                .ok()
                .and_then(|amount| lhs.checked_shr(amount))
                .unwrap_or(0),
            Self::Eq => u64::from(lhs == rhs),
            Self::Ne => u64::from(lhs != rhs),
            Self::LtU => u64::from(lhs < rhs),
            Self::LeU => u64::from(lhs <= rhs),
            Self::Neg | Self::Not | Self::ByteSwap => lhs,
        }
    }
}

impl fmt::Display for SymbolicOp {
    #[allow(clippy::match_same_arms)] // Sub and Neg are semantically different (binary vs unary)
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "+"),
            Self::Sub => write!(f, "-"),
            Self::Mul => write!(f, "*"),
            Self::DivU => write!(f, "/u"),
            Self::RemU => write!(f, "%u"),
            Self::Neg => write!(f, "-"),
            Self::And => write!(f, "&"),
            Self::Or => write!(f, "|"),
            Self::Xor => write!(f, "^"),
            Self::Not => write!(f, "~"),
            Self::Shl => write!(f, "<<"),
            Self::ShrU => write!(f, ">>>"),
            Self::ByteSwap => write!(f, "bswap"),
            Self::Eq => write!(f, "=="),
            Self::Ne => write!(f, "!="),
            Self::LtU => write!(f, "<u"),
            Self::LeU => write!(f, "<=u"),
        }
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_smt_division_semantics() {
        assert_eq!(SymbolicOp::DivU.apply_binary(10, 0), u64::MAX);
        assert_eq!(SymbolicOp::RemU.apply_binary(10, 0), 10);
        assert_eq!(SymbolicOp::DivU.apply_binary(10, 3), 3);
        assert_eq!(SymbolicOp::RemU.apply_binary(10, 3), 1);
    }

    #[test]
    fn test_oversized_shifts() {
        assert_eq!(SymbolicOp::Shl.apply_binary(1, 64), 0);
        assert_eq!(SymbolicOp::ShrU.apply_binary(u64::MAX, 200), 0);
        assert_eq!(SymbolicOp::Shl.apply_binary(1, 4), 16);
        assert_eq!(SymbolicOp::ShrU.apply_binary(0x100, 8), 1);
    }

    #[test]
    fn test_unary_ops() {
        assert_eq!(SymbolicOp::Not.apply_unary(0), u64::MAX);
        assert_eq!(SymbolicOp::Neg.apply_unary(1), u64::MAX);
        assert_eq!(SymbolicOp::ByteSwap.apply_unary(0x1122_3344), 0x4433_2211);
        assert_eq!(SymbolicOp::ByteSwap.apply_unary(0xFFFF_0000_0000_0001), 0x0100_0000);
    }

    #[test]
    fn test_classification_is_disjoint() {
        for op in SymbolicOp::iter() {
            assert!(!(op.is_unary() && op.is_comparison()), "{op:?}");
            assert!(!(op.is_unary() && op.is_commutative()), "{op:?}");
        }
    }

    #[test]
    fn test_comparisons_yield_bits() {
        assert_eq!(SymbolicOp::Eq.apply_binary(3, 3), 1);
        assert_eq!(SymbolicOp::Ne.apply_binary(3, 3), 0);
        assert_eq!(SymbolicOp::LtU.apply_binary(2, 3), 1);
        assert_eq!(SymbolicOp::LeU.apply_binary(4, 3), 0);
    }
}
