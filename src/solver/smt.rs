//! Z3-based constraint solver.
//!
//! This module provides [`Z3Solver`], which translates arena expressions to Z3's AST
//! and lets the SMT solver answer the analysis queries. Expressions use 64-bit
//! bitvectors; every free variable is additionally constrained to a single byte.

use std::collections::{BTreeSet, HashMap};

use z3::ast::BV;

use crate::{
    expr::{ExprArena, ExprId, ExprNode, SymbolicOp, Variable},
    solver::{Constraint, Enumeration, Solver},
    Error, Result,
};

const WIDTH: u32 = 64;

/// Z3-based constraint solver.
///
/// The solver is stateless; each query builds a fresh Z3 solver. Enumeration
/// bisects for the smallest satisfying value above the previous one, so a truncated
/// result holds the same smallest values the enumerative backend returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct Z3Solver;

impl Z3Solver {
    /// Creates a new Z3 solver instance.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn variable_name(variable: &Variable) -> String {
        match variable {
            Variable::Flag(offset) => format!("flag_{offset}"),
            Variable::External(name) => format!("ext_{name}"),
        }
    }

    /// Translates the expressions rooted at `roots` in topological order, binding
    /// each free variable once.
    fn translate(
        arena: &ExprArena,
        roots: &[ExprId],
        variables: &mut HashMap<Variable, BV>,
    ) -> HashMap<ExprId, BV> {
        let mut pending: BTreeSet<ExprId> = BTreeSet::new();
        let mut stack: Vec<ExprId> = roots.to_vec();
        while let Some(id) = stack.pop() {
            if pending.insert(id) {
                match arena.node(id) {
                    ExprNode::Unary { operand, .. } => stack.push(*operand),
                    ExprNode::Binary { lhs, rhs, .. } => {
                        stack.push(*lhs);
                        stack.push(*rhs);
                    }
                    ExprNode::Select {
                        cond,
                        then,
                        otherwise,
                    } => {
                        stack.push(*cond);
                        stack.push(*then);
                        stack.push(*otherwise);
                    }
                    ExprNode::Const(_) | ExprNode::Var(_) => {}
                }
            }
        }

        let one = BV::from_u64(1, WIDTH);
        let zero = BV::from_u64(0, WIDTH);
        let mut translated: HashMap<ExprId, BV> = HashMap::new();
        for id in pending {
            let ast = match arena.node(id) {
                ExprNode::Const(value) => BV::from_u64(*value, WIDTH),
                ExprNode::Var(variable) => variables
                    .entry(variable.clone())
                    .or_insert_with(|| BV::new_const(Self::variable_name(variable), WIDTH))
                    .clone(),
                ExprNode::Unary { op, operand } => {
                    let operand = &translated[operand];
                    match op {
                        SymbolicOp::Neg => operand.bvneg(),
                        SymbolicOp::Not => operand.bvnot(),
                        SymbolicOp::ByteSwap => {
                            let b0 = operand.extract(7, 0);
                            let b1 = operand.extract(15, 8);
                            let b2 = operand.extract(23, 16);
                            let b3 = operand.extract(31, 24);
                            b0.concat(&b1).concat(&b2).concat(&b3).zero_ext(32)
                        }
                        _ => operand.clone(),
                    }
                }
                ExprNode::Binary { op, lhs, rhs } => {
                    let lhs = &translated[lhs];
                    let rhs = &translated[rhs];
                    match op {
                        SymbolicOp::Add => lhs.bvadd(rhs),
                        SymbolicOp::Sub => lhs.bvsub(rhs),
                        SymbolicOp::Mul => lhs.bvmul(rhs),
                        SymbolicOp::DivU => lhs.bvudiv(rhs),
                        SymbolicOp::RemU => lhs.bvurem(rhs),
                        SymbolicOp::And => lhs.bvand(rhs),
                        SymbolicOp::Or => lhs.bvor(rhs),
                        SymbolicOp::Xor => lhs.bvxor(rhs),
                        SymbolicOp::Shl => lhs.bvshl(rhs),
                        SymbolicOp::ShrU => lhs.bvlshr(rhs),
                        // Comparisons return 1 or 0
                        SymbolicOp::Eq => lhs.eq(rhs).ite(&one, &zero),
                        SymbolicOp::Ne => lhs.eq(rhs).not().ite(&one, &zero),
                        SymbolicOp::LtU => lhs.bvult(rhs).ite(&one, &zero),
                        SymbolicOp::LeU => lhs.bvule(rhs).ite(&one, &zero),
                        SymbolicOp::Neg | SymbolicOp::Not | SymbolicOp::ByteSwap => lhs.clone(),
                    }
                }
                ExprNode::Select {
                    cond,
                    then,
                    otherwise,
                } => translated[cond]
                    .eq(&zero)
                    .not()
                    .ite(&translated[then], &translated[otherwise]),
            };
            translated.insert(id, ast);
        }
        translated
    }

    /// Builds a solver holding the constraints and the byte-range restriction of
    /// every free variable.
    fn prepare(
        arena: &ExprArena,
        constraints: &[Constraint],
        extra: &[ExprId],
    ) -> (z3::Solver, HashMap<ExprId, BV>, HashMap<Variable, BV>) {
        let solver = z3::Solver::new();
        let mut variables = HashMap::new();
        let mut roots: Vec<ExprId> = constraints.iter().map(|c| c.expr).collect();
        roots.extend_from_slice(extra);
        let translated = Self::translate(arena, &roots, &mut variables);

        for constraint in constraints {
            let low = translated[&constraint.expr].extract(7, 0);
            solver.assert(low.eq(&BV::from_u64(u64::from(constraint.value), 8)));
        }
        let max_byte = BV::from_u64(0xff, WIDTH);
        for var in variables.values() {
            solver.assert(var.bvule(&max_byte));
        }

        (solver, translated, variables)
    }

    /// Smallest value of `var` not below `floor`, by bisection over the byte range.
    fn smallest_from(
        solver: &z3::Solver,
        var: &BV,
        floor: u64,
        variable: &Variable,
    ) -> Result<Option<u64>> {
        let within = |upper: u64| -> Result<bool> {
            solver.push();
            solver.assert(var.bvuge(&BV::from_u64(floor, WIDTH)));
            solver.assert(var.bvule(&BV::from_u64(upper, WIDTH)));
            let result = solver.check();
            solver.pop(1);
            match result {
                z3::SatResult::Sat => Ok(true),
                z3::SatResult::Unsat => Ok(false),
                z3::SatResult::Unknown => Err(Error::SolverError(format!(
                    "z3 returned unknown while enumerating {variable}"
                ))),
            }
        };

        if !within(0xff)? {
            return Ok(None);
        }
        let (mut low, mut high) = (floor, 0xff);
        while low < high {
            let mid = low + (high - low) / 2;
            if within(mid)? {
                high = mid;
            } else {
                low = mid + 1;
            }
        }
        Ok(Some(low))
    }
}

impl Solver for Z3Solver {
    fn name(&self) -> &'static str {
        "z3"
    }

    fn satisfiable(&self, arena: &ExprArena, constraints: &[Constraint]) -> Result<bool> {
        let (solver, _, _) = Self::prepare(arena, constraints, &[]);
        match solver.check() {
            z3::SatResult::Sat => Ok(true),
            z3::SatResult::Unsat => Ok(false),
            z3::SatResult::Unknown => Err(Error::SolverError(
                "z3 returned unknown for satisfiability query".to_string(),
            )),
        }
    }

    fn evaluate(
        &self,
        arena: &ExprArena,
        expr: ExprId,
        constraints: &[Constraint],
    ) -> Result<Option<u64>> {
        let (solver, translated, _) = Self::prepare(arena, constraints, &[expr]);
        match solver.check() {
            z3::SatResult::Sat => {
                let Some(model) = solver.get_model() else {
                    return Err(Error::SolverError("z3 produced no model".to_string()));
                };
                Ok(model
                    .eval(&translated[&expr], true)
                    .and_then(|value| value.as_u64()))
            }
            z3::SatResult::Unsat => Ok(None),
            z3::SatResult::Unknown => Err(Error::SolverError(
                "z3 returned unknown for evaluation query".to_string(),
            )),
        }
    }

    fn enumerate(
        &self,
        arena: &ExprArena,
        variable: &Variable,
        constraints: &[Constraint],
        max: usize,
    ) -> Result<Enumeration> {
        let (solver, _, mut variables) = Self::prepare(arena, constraints, &[]);
        let var = variables
            .entry(variable.clone())
            .or_insert_with(|| BV::new_const(Self::variable_name(variable), WIDTH))
            .clone();
        solver.assert(var.bvule(&BV::from_u64(0xff, WIDTH)));

        // One value beyond the bound tells a complete result from a truncated one.
        let mut values = Vec::new();
        let mut floor = 0u64;
        while values.len() <= max && floor <= 0xff {
            let Some(value) = Self::smallest_from(&solver, &var, floor, variable)? else {
                break;
            };
            values.push(value as u8);
            floor = value + 1;
        }

        let complete = values.len() <= max;
        values.truncate(max);
        Ok(Enumeration { values, complete })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_z3_xor_solve() {
        let mut arena = ExprArena::new();
        let flag = arena.flag_byte(0);
        let key = arena.constant(0x20);
        let expr = arena.binary(SymbolicOp::Xor, flag, key);

        let solver = Z3Solver::new();
        let result = solver
            .enumerate(&arena, &Variable::Flag(0), &[Constraint::new(expr, 0x61)], 8)
            .unwrap();
        assert_eq!(result.unique(), Some(0x41));
    }

    #[test]
    fn test_z3_matches_enumerative() {
        let mut arena = ExprArena::new();
        let flag = arena.flag_byte(0);
        let mask = arena.constant(0x0f);
        let low = arena.binary(SymbolicOp::And, flag, mask);

        let constraints = [Constraint::new(low, 0x7)];
        let z3 = Z3Solver::new()
            .enumerate(&arena, &Variable::Flag(0), &constraints, 32)
            .unwrap();
        let exhaustive = crate::solver::EnumerativeSolver::default()
            .enumerate(&arena, &Variable::Flag(0), &constraints, 32)
            .unwrap();
        assert_eq!(z3, exhaustive);
    }

    #[test]
    fn test_z3_truncation_keeps_smallest_values() {
        let mut arena = ExprArena::new();
        let flag = arena.flag_byte(0);
        let mask = arena.constant(0x0f);
        let low = arena.binary(SymbolicOp::And, flag, mask);

        let constraints = [Constraint::new(low, 0x3)];
        let z3 = Z3Solver::new()
            .enumerate(&arena, &Variable::Flag(0), &constraints, 4)
            .unwrap();
        assert_eq!(z3.values, vec![0x03, 0x13, 0x23, 0x33]);
        assert!(!z3.complete);

        let exhaustive = crate::solver::EnumerativeSolver::default()
            .enumerate(&arena, &Variable::Flag(0), &constraints, 4)
            .unwrap();
        assert_eq!(z3, exhaustive);
    }
}
