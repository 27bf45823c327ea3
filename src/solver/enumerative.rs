//! Exhaustive byte-domain solver.

use std::collections::BTreeSet;

use crate::{
    config::SolverLimits,
    expr::{CompiledExpr, ExprArena, ExprId, Variable},
    solver::{Constraint, Enumeration, Solver},
    Error, Result, Stage,
};

/// Solver that tries every assignment of the free bytes in lexicographic order.
///
/// Leaks worth exploiting depend on one or two flag bytes, which keeps the search
/// space at 256 or 65 536 assignments. Queries whose space exceeds the configured
/// budget fail with [`Error::Timeout`] instead of running unbounded.
///
/// # Example
///
/// ```rust
/// use leakscope::expr::{ExprArena, SymbolicOp, Variable};
/// use leakscope::solver::{Constraint, EnumerativeSolver, Solver};
///
/// let mut arena = ExprArena::new();
/// let flag = arena.flag_byte(0);
/// let key = arena.constant(0x20);
/// let leaked = arena.binary(SymbolicOp::Xor, flag, key);
///
/// let solver = EnumerativeSolver::default();
/// let found = solver
///     .enumerate(&arena, &Variable::Flag(0), &[Constraint::new(leaked, 0x61)], 4)
///     .unwrap();
/// assert_eq!(found.unique(), Some(0x41));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct EnumerativeSolver {
    max_assignments: u64,
}

impl Default for EnumerativeSolver {
    fn default() -> Self {
        Self::from_limits(&SolverLimits::default())
    }
}

struct Query {
    variables: Vec<Variable>,
    checks: Vec<Check>,
}

struct Check {
    compiled: CompiledExpr,
    /// Position of each of the expression's variables in the query assignment.
    mapping: Vec<usize>,
    value: u8,
}

impl Check {
    fn holds(&self, assignment: &[u64], scratch: &mut Vec<u64>) -> bool {
        scratch.clear();
        scratch.extend(self.mapping.iter().map(|index| assignment[*index]));
        self.compiled.evaluate(scratch) as u8 == self.value
    }
}

impl EnumerativeSolver {
    /// Creates a solver that visits at most `max_assignments` assignments per query.
    #[must_use]
    pub const fn new(max_assignments: u64) -> Self {
        Self { max_assignments }
    }

    /// Creates a solver from the assignment budget of `limits`.
    #[must_use]
    pub const fn from_limits(limits: &SolverLimits) -> Self {
        Self::new(limits.max_assignments)
    }

    fn prepare(
        &self,
        arena: &ExprArena,
        constraints: &[Constraint],
        extra: impl IntoIterator<Item = Variable>,
    ) -> Result<Query> {
        let compiled: Vec<(CompiledExpr, u8)> = constraints
            .iter()
            .map(|c| (arena.compile(c.expr), c.value))
            .collect();

        let mut variables: BTreeSet<Variable> = extra.into_iter().collect();
        for (expr, _) in &compiled {
            variables.extend(expr.variables().iter().cloned());
        }
        let variables: Vec<Variable> = variables.into_iter().collect();
        self.check_budget(variables.len())?;

        let checks = compiled
            .into_iter()
            .map(|(compiled, value)| {
                let mapping = compiled
                    .variables()
                    .iter()
                    .map(|v| variables.binary_search(v).unwrap_or_default())
                    .collect();
                Check {
                    compiled,
                    mapping,
                    value,
                }
            })
            .collect();

        Ok(Query { variables, checks })
    }

    fn check_budget(&self, free: usize) -> Result<()> {
        let space = u32::try_from(free)
            .ok()
            .and_then(|free| 256u64.checked_pow(free));
        match space {
            Some(space) if space <= self.max_assignments => Ok(()),
            _ => Err(Error::Timeout {
                stage: Stage::Solver,
                detail: format!(
                    "{} free bytes exceed the budget of {} assignments",
                    free, self.max_assignments
                ),
            }),
        }
    }

    /// Visits assignments of the unfixed variables in lexicographic order until
    /// `visit` returns `true`. Returns whether it did.
    fn search(
        query: &Query,
        fixed: Option<(usize, u64)>,
        mut visit: impl FnMut(&[u64]) -> bool,
    ) -> bool {
        let free: Vec<usize> = (0..query.variables.len())
            .filter(|index| fixed.map_or(true, |(f, _)| f != *index))
            .collect();
        let mut assignment = vec![0u64; query.variables.len()];
        if let Some((index, value)) = fixed {
            assignment[index] = value;
        }

        let mut scratch = Vec::new();
        let total = 1u64 << (8 * free.len());
        for counter in 0..total {
            for (digit, index) in free.iter().enumerate() {
                let shift = 8 * (free.len() - 1 - digit);
                assignment[*index] = (counter >> shift) & 0xff;
            }
            if query
                .checks
                .iter()
                .all(|check| check.holds(&assignment, &mut scratch))
                && visit(&assignment)
            {
                return true;
            }
        }
        false
    }
}

impl Solver for EnumerativeSolver {
    fn name(&self) -> &'static str {
        "enumerative"
    }

    fn satisfiable(&self, arena: &ExprArena, constraints: &[Constraint]) -> Result<bool> {
        let query = self.prepare(arena, constraints, [])?;
        Ok(Self::search(&query, None, |_| true))
    }

    fn evaluate(
        &self,
        arena: &ExprArena,
        expr: ExprId,
        constraints: &[Constraint],
    ) -> Result<Option<u64>> {
        let target = arena.compile(expr);
        let query = self.prepare(arena, constraints, target.variables().iter().cloned())?;
        let mapping: Vec<usize> = target
            .variables()
            .iter()
            .map(|v| query.variables.binary_search(v).unwrap_or_default())
            .collect();

        let mut result = None;
        Self::search(&query, None, |assignment| {
            let local: Vec<u64> = mapping.iter().map(|index| assignment[*index]).collect();
            result = Some(target.evaluate(&local));
            true
        });
        Ok(result)
    }

    fn enumerate(
        &self,
        arena: &ExprArena,
        variable: &Variable,
        constraints: &[Constraint],
        max: usize,
    ) -> Result<Enumeration> {
        let query = self.prepare(arena, constraints, [variable.clone()])?;
        let target = query
            .variables
            .binary_search(variable)
            .map_err(|_| Error::SolverError(format!("{variable} missing from query")))?;

        let mut values = Vec::new();
        for candidate in 0..=255u8 {
            if Self::search(&query, Some((target, u64::from(candidate))), |_| true) {
                if values.len() == max {
                    return Ok(Enumeration {
                        values,
                        complete: false,
                    });
                }
                values.push(candidate);
            }
        }

        Ok(Enumeration {
            values,
            complete: true,
        })
    }

    fn enumerate_within(
        &self,
        arena: &ExprArena,
        variable: &Variable,
        constraints: &[Constraint],
        max: usize,
        max_assignments: u64,
    ) -> Result<Enumeration> {
        Self::new(max_assignments).enumerate(arena, variable, constraints, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::SymbolicOp;

    #[test]
    fn test_xor_unique() {
        let mut arena = ExprArena::new();
        let flag = arena.flag_byte(0);
        let key = arena.constant(0x42);
        let expr = arena.binary(SymbolicOp::Xor, flag, key);

        let solver = EnumerativeSolver::default();
        let result = solver
            .enumerate(&arena, &Variable::Flag(0), &[Constraint::new(expr, 0x00)], 16)
            .unwrap();
        assert_eq!(result.values, vec![0x42]);
        assert!(result.complete);
    }

    #[test]
    fn test_ambiguous_nibble() {
        let mut arena = ExprArena::new();
        let flag = arena.flag_byte(0);
        let mask = arena.constant(0x0f);
        let low = arena.binary(SymbolicOp::And, flag, mask);

        let solver = EnumerativeSolver::default();
        let result = solver
            .enumerate(&arena, &Variable::Flag(0), &[Constraint::new(low, 0x3)], 4)
            .unwrap();
        assert_eq!(result.values, vec![0x03, 0x13, 0x23, 0x33]);
        assert!(!result.complete);

        let all = solver
            .enumerate(&arena, &Variable::Flag(0), &[Constraint::new(low, 0x3)], 16)
            .unwrap();
        assert_eq!(all.values.len(), 16);
        assert!(all.complete);
    }

    #[test]
    fn test_companion_disambiguates() {
        let mut arena = ExprArena::new();
        let flag = arena.flag_byte(0);
        let mask = arena.constant(0x0f);
        let four = arena.constant(4);
        let low = arena.binary(SymbolicOp::And, flag, mask);
        let high = arena.binary(SymbolicOp::ShrU, flag, four);

        let solver = EnumerativeSolver::default();
        let constraints = [Constraint::new(low, 0xe), Constraint::new(high, 0xb)];
        let result = solver
            .enumerate(&arena, &Variable::Flag(0), &constraints, 16)
            .unwrap();
        assert_eq!(result.unique(), Some(0xbe));
    }

    #[test]
    fn test_two_variables() {
        let mut arena = ExprArena::new();
        let f0 = arena.flag_byte(0);
        let f1 = arena.flag_byte(1);
        let sum = arena.binary(SymbolicOp::Add, f0, f1);
        let diff = arena.binary(SymbolicOp::Sub, f0, f1);

        let solver = EnumerativeSolver::default();
        let constraints = [Constraint::new(sum, 30), Constraint::new(diff, 10)];
        assert!(solver.satisfiable(&arena, &constraints).unwrap());
        assert_eq!(solver.evaluate(&arena, f1, &constraints).unwrap(), Some(10));
        assert_eq!(
            solver.evaluate(&arena, f0, &constraints).unwrap(),
            Some(20)
        );
    }

    #[test]
    fn test_unsatisfiable() {
        let mut arena = ExprArena::new();
        let flag = arena.flag_byte(0);
        let one = arena.constant(1);
        let bit = arena.binary(SymbolicOp::And, flag, one);

        let solver = EnumerativeSolver::default();
        let constraints = [Constraint::new(bit, 2)];
        assert!(!solver.satisfiable(&arena, &constraints).unwrap());
        assert_eq!(solver.evaluate(&arena, flag, &constraints).unwrap(), None);
        let result = solver
            .enumerate(&arena, &Variable::Flag(0), &constraints, 16)
            .unwrap();
        assert!(result.values.is_empty());
        assert!(result.complete);
    }

    #[test]
    fn test_enumerate_within_overrides_budget() {
        let mut arena = ExprArena::new();
        let f0 = arena.flag_byte(0);
        let f1 = arena.flag_byte(1);
        let pair = arena.binary(SymbolicOp::Xor, f0, f1);
        let key = arena.constant(0x5a);
        let single = arena.binary(SymbolicOp::Xor, f1, key);
        let constraints = [Constraint::new(pair, 0x11), Constraint::new(single, 0x00)];

        let narrow = EnumerativeSolver::new(256);
        assert!(matches!(
            narrow.enumerate(&arena, &Variable::Flag(0), &constraints, 4),
            Err(Error::Timeout {
                stage: Stage::Solver,
                ..
            })
        ));
        let found = narrow
            .enumerate_within(&arena, &Variable::Flag(0), &constraints, 4, 1 << 16)
            .unwrap();
        assert_eq!(found.unique(), Some(0x5a ^ 0x11));
    }

    #[test]
    fn test_budget_exceeded() {
        let mut arena = ExprArena::new();
        let f0 = arena.flag_byte(0);
        let f1 = arena.flag_byte(1);
        let f2 = arena.flag_byte(2);
        let a = arena.binary(SymbolicOp::Add, f0, f1);
        let b = arena.binary(SymbolicOp::Add, a, f2);

        let solver = EnumerativeSolver::default();
        let err = solver
            .satisfiable(&arena, &[Constraint::new(b, 0)])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Timeout {
                stage: Stage::Solver,
                ..
            }
        ));
    }
}
