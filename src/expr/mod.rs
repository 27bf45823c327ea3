//! Symbolic expressions over flag bytes and runtime state.
//!
//! Every symbolic output byte an execution engine reports is an [`ExprId`] into the
//! [`ExprArena`] of that execution. The arena is built while the target runs and
//! frozen afterwards, so all later stages share it read-only through [`ExprRef`].
//!
//! # Architecture
//!
//! - [`SymbolicOp`] - The operations an expression may contain, with their concrete
//!   64-bit semantics
//! - [`ExprArena`] - Interning storage with constant folding and cached [`ExprFlags`]
//! - [`CompiledExpr`] - A flattened expression for repeated evaluation (truth tables,
//!   enumerative solving)
//! - [`ExprRef`] - An `Arc`-shared handle to one expression
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use leakscope::expr::{ExprArena, ExprRef, SymbolicOp};
//!
//! let mut arena = ExprArena::new();
//! let byte = arena.flag_byte(0);
//! let nibble = arena.constant(0x0f);
//! let low = arena.binary(SymbolicOp::And, byte, nibble);
//!
//! let expr = ExprRef::new(Arc::new(arena), low);
//! assert_eq!(expr.flag_offsets().into_iter().collect::<Vec<_>>(), vec![0]);
//! assert_eq!(expr.to_string(), "(flag[0] & 0xf)");
//! ```

mod arena;
mod ops;

pub use arena::{
    CompiledExpr, ExprArena, ExprDisplay, ExprFlags, ExprId, ExprNode, ExprRef, Variable,
};
pub use ops::SymbolicOp;
