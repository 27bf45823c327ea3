//! Constraint solving over byte-valued variables.
//!
//! The analysis only ever asks three questions of a solver: is a set of output
//! observations consistent, what value does an expression take under them, and which
//! values can one flag byte take under them. [`Solver`] captures exactly these three
//! queries so that the pipeline does not depend on any particular backend.
//!
//! # Semantics
//!
//! - Every free variable ranges over `0..=255`; engines report flag bytes and runtime
//!   bytes, never wider words.
//! - A [`Constraint`] states that the low byte of an expression equals an observed
//!   output byte.
//! - Enumeration returns the smallest satisfying values in ascending order, so that
//!   synthesis stays deterministic regardless of the backend.
//!
//! # Backends
//!
//! - [`EnumerativeSolver`] - Exhaustive search over the byte domain, bounded by an
//!   assignment budget. Always available.
//! - `Z3Solver` - SMT-backed search via Z3 (feature `z3`).

mod enumerative;
#[cfg(feature = "z3")]
mod smt;

pub use enumerative::EnumerativeSolver;
#[cfg(feature = "z3")]
pub use smt::Z3Solver;

use crate::{
    expr::{ExprArena, ExprId, Variable},
    Result,
};

/// `low_byte(expr) == value`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Constraint {
    /// The constrained expression.
    pub expr: ExprId,
    /// The observed output byte.
    pub value: u8,
}

impl Constraint {
    /// Creates a constraint binding the low byte of `expr` to `value`.
    #[must_use]
    pub const fn new(expr: ExprId, value: u8) -> Self {
        Self { expr, value }
    }
}

/// Result of a bounded enumeration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enumeration {
    /// Satisfying values, ascending, at most the requested maximum.
    pub values: Vec<u8>,
    /// `false` if more satisfying values exist than were returned.
    pub complete: bool,
}

impl Enumeration {
    /// Returns the only satisfying value, if the enumeration is complete and unique.
    #[must_use]
    pub fn unique(&self) -> Option<u8> {
        match (self.complete, self.values.as_slice()) {
            (true, [value]) => Some(*value),
            _ => None,
        }
    }
}

/// Backend answering the constraint queries of the analysis.
///
/// Implementations must be deterministic: the same arena and constraints always
/// produce the same answer.
pub trait Solver: Send + Sync {
    /// Short backend name for log records.
    fn name(&self) -> &'static str;

    /// Returns `true` if some assignment satisfies all constraints.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Timeout`] if the query exceeds the backend budget and
    /// [`crate::Error::SolverError`] if the backend fails.
    fn satisfiable(&self, arena: &ExprArena, constraints: &[Constraint]) -> Result<bool>;

    /// Returns the value of `expr` under a satisfying assignment, `None` if the
    /// constraints are unsatisfiable.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Timeout`] if the query exceeds the backend budget and
    /// [`crate::Error::SolverError`] if the backend fails.
    fn evaluate(
        &self,
        arena: &ExprArena,
        expr: ExprId,
        constraints: &[Constraint],
    ) -> Result<Option<u64>>;

    /// Enumerates up to `max` values of `variable` consistent with the constraints.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Timeout`] if the query exceeds the backend budget and
    /// [`crate::Error::SolverError`] if the backend fails.
    fn enumerate(
        &self,
        arena: &ExprArena,
        variable: &Variable,
        constraints: &[Constraint],
        max: usize,
    ) -> Result<Enumeration>;

    /// [`Solver::enumerate`] under an explicit assignment budget.
    ///
    /// Backends without a search budget ignore `max_assignments`.
    ///
    /// # Errors
    ///
    /// Same as [`Solver::enumerate`].
    fn enumerate_within(
        &self,
        arena: &ExprArena,
        variable: &Variable,
        constraints: &[Constraint],
        max: usize,
        max_assignments: u64,
    ) -> Result<Enumeration> {
        let _ = max_assignments;
        self.enumerate(arena, variable, constraints, max)
    }
}
