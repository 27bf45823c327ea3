//! Hash-consed expression storage.
//!
//! An [`ExprArena`] owns every node of the expressions produced by one execution.
//! Nodes are interned: building the same node twice returns the same [`ExprId`], so
//! structural equality within one arena is id equality. Children are always interned
//! before their parents, which gives every arena a topological order for free; the
//! evaluation, import and traversal routines below rely on it instead of recursing.
//!
//! Once an execution finishes, its arena is frozen behind an `Arc` and shared by the
//! trace, the dependencies and the exploit routes through [`ExprRef`].

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt,
    sync::Arc,
};

use bitflags::bitflags;

use crate::expr::ops::SymbolicOp;

/// Expressions larger than this many tree nodes are summarized instead of rendered.
const MAX_RENDERED_NODES: u32 = 512;

/// A free variable of an output expression.
///
/// Only the flag region and engine-internal runtime state can be symbolic; there is
/// deliberately no variant for program input, which always stays concrete.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Variable {
    /// One byte of the flag region, by offset from the region base.
    Flag(u32),
    /// Runtime state the engine could not concretize (counters, clocks, randomness).
    External(String),
}

impl Variable {
    /// Returns the flag offset for flag variables.
    #[must_use]
    pub fn flag_offset(&self) -> Option<u32> {
        match self {
            Variable::Flag(offset) => Some(*offset),
            Variable::External(_) => None,
        }
    }

    /// Returns `true` for flag-region variables.
    #[must_use]
    pub fn is_flag(&self) -> bool {
        matches!(self, Variable::Flag(_))
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variable::Flag(offset) => write!(f, "flag[{offset}]"),
            Variable::External(name) => write!(f, "${name}"),
        }
    }
}

/// Index of a node inside an [`ExprArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(u32);

impl ExprId {
    /// Returns the position of the node in its arena.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// One interned expression node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExprNode {
    /// A 64-bit constant.
    Const(u64),
    /// A free variable.
    Var(Variable),
    /// A unary operation.
    Unary {
        /// The operation to perform.
        op: SymbolicOp,
        /// The operand.
        operand: ExprId,
    },
    /// A binary operation.
    Binary {
        /// The operation to perform.
        op: SymbolicOp,
        /// The left operand.
        lhs: ExprId,
        /// The right operand.
        rhs: ExprId,
    },
    /// `cond != 0 ? then : otherwise`
    Select {
        /// The condition.
        cond: ExprId,
        /// Value when the condition is non-zero.
        then: ExprId,
        /// Value when the condition is zero.
        otherwise: ExprId,
    },
}

impl ExprNode {
    fn for_each_operand(&self, mut f: impl FnMut(ExprId)) {
        match self {
            ExprNode::Const(_) | ExprNode::Var(_) => {}
            ExprNode::Unary { operand, .. } => f(*operand),
            ExprNode::Binary { lhs, rhs, .. } => {
                f(*lhs);
                f(*rhs);
            }
            ExprNode::Select {
                cond,
                then,
                otherwise,
            } => {
                f(*cond);
                f(*then);
                f(*otherwise);
            }
        }
    }
}

bitflags! {
    /// Properties cached per node, accumulated from the node's operands.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ExprFlags: u8 {
        /// References at least one flag byte.
        const FLAG = 0x01;
        /// References at least one non-flag variable.
        const EXTERNAL = 0x02;
        /// Multiplies, divides or shifts two non-constant values.
        const NONLINEAR = 0x04;
        /// Contains a select.
        const BRANCHING = 0x08;
    }
}

#[derive(Debug, Clone, Copy)]
struct NodeInfo {
    flags: ExprFlags,
    depth: u32,
    size: u32,
}

/// Interning storage for symbolic expressions.
///
/// # Examples
///
/// ```rust
/// use leakscope::expr::{ExprArena, SymbolicOp, Variable};
///
/// let mut arena = ExprArena::new();
/// let flag = arena.flag_byte(3);
/// let key = arena.constant(0x20);
/// let leaked = arena.binary(SymbolicOp::Xor, flag, key);
///
/// assert_eq!(arena.binary(SymbolicOp::Xor, key, flag), leaked);
/// assert_eq!(arena.evaluate(leaked, |_| Some(0x41)), Some(0x61));
/// assert!(arena.free_variables(leaked).contains(&Variable::Flag(3)));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ExprArena {
    nodes: Vec<ExprNode>,
    info: Vec<NodeInfo>,
    interned: HashMap<ExprNode, ExprId>,
}

impl ExprArena {
    /// Creates an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if no node was interned yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns `true` if `id` was minted by an arena at least this large.
    #[must_use]
    pub fn contains(&self, id: ExprId) -> bool {
        id.index() < self.nodes.len()
    }

    /// Returns the node behind `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not belong to this arena.
    #[must_use]
    pub fn node(&self, id: ExprId) -> &ExprNode {
        &self.nodes[id.index()]
    }

    /// Cached properties of the expression rooted at `id`.
    #[must_use]
    pub fn flags(&self, id: ExprId) -> ExprFlags {
        self.info[id.index()].flags
    }

    /// Height of the expression tree rooted at `id`; leaves have depth 1.
    #[must_use]
    pub fn depth(&self, id: ExprId) -> u32 {
        self.info[id.index()].depth
    }

    /// Number of tree nodes of the expression rooted at `id`, counting shared
    /// subtrees once per use and saturating at `u32::MAX`.
    #[must_use]
    pub fn size(&self, id: ExprId) -> u32 {
        self.info[id.index()].size
    }

    /// Returns the value of a constant node.
    #[must_use]
    pub fn as_const(&self, id: ExprId) -> Option<u64> {
        match self.node(id) {
            ExprNode::Const(value) => Some(*value),
            _ => None,
        }
    }

    /// Interns a constant.
    pub fn constant(&mut self, value: u64) -> ExprId {
        self.intern(ExprNode::Const(value))
    }

    /// Interns a free variable.
    pub fn variable(&mut self, variable: Variable) -> ExprId {
        self.intern(ExprNode::Var(variable))
    }

    /// Interns the variable for one flag byte.
    pub fn flag_byte(&mut self, offset: u32) -> ExprId {
        self.variable(Variable::Flag(offset))
    }

    /// Interns an engine-internal runtime variable.
    pub fn external(&mut self, name: impl Into<String>) -> ExprId {
        self.variable(Variable::External(name.into()))
    }

    /// Interns a unary operation, folding constant operands.
    pub fn unary(&mut self, op: SymbolicOp, operand: ExprId) -> ExprId {
        debug_assert!(op.is_unary(), "{op:?} is not unary");

        if let Some(value) = self.as_const(operand) {
            return self.constant(op.apply_unary(value));
        }

        if let ExprNode::Unary {
            op: inner,
            operand: inner_operand,
        } = self.node(operand)
        {
            if *inner == op && matches!(op, SymbolicOp::Not | SymbolicOp::Neg) {
                return *inner_operand;
            }
        }

        self.intern(ExprNode::Unary { op, operand })
    }

    /// Interns a binary operation, folding constants and trivial identities.
    pub fn binary(&mut self, op: SymbolicOp, lhs: ExprId, rhs: ExprId) -> ExprId {
        debug_assert!(!op.is_unary(), "{op:?} is unary");

        let (lhs, rhs) = if op.is_commutative() && self.sorts_after(lhs, rhs) {
            (rhs, lhs)
        } else {
            (lhs, rhs)
        };

        match (self.as_const(lhs), self.as_const(rhs)) {
            (Some(a), Some(b)) => return self.constant(op.apply_binary(a, b)),
            (_, Some(0))
                if matches!(
                    op,
                    SymbolicOp::Add
                        | SymbolicOp::Sub
                        | SymbolicOp::Xor
                        | SymbolicOp::Or
                        | SymbolicOp::Shl
                        | SymbolicOp::ShrU
                ) =>
            {
                return lhs
            }
            (_, Some(1)) if matches!(op, SymbolicOp::Mul | SymbolicOp::DivU) => return lhs,
            _ => {}
        }

        if lhs == rhs {
            match op {
                SymbolicOp::Xor | SymbolicOp::Sub => return self.constant(0),
                SymbolicOp::And | SymbolicOp::Or => return lhs,
                SymbolicOp::Eq | SymbolicOp::LeU => return self.constant(1),
                SymbolicOp::Ne | SymbolicOp::LtU => return self.constant(0),
                _ => {}
            }
        }

        self.intern(ExprNode::Binary { op, lhs, rhs })
    }

    /// Interns a select, folding constant conditions and equal branches.
    pub fn select(&mut self, cond: ExprId, then: ExprId, otherwise: ExprId) -> ExprId {
        if let Some(value) = self.as_const(cond) {
            return if value != 0 { then } else { otherwise };
        }
        if then == otherwise {
            return then;
        }
        self.intern(ExprNode::Select {
            cond,
            then,
            otherwise,
        })
    }

    /// Constants sort after everything else so they end up on the right.
    fn sorts_after(&self, lhs: ExprId, rhs: ExprId) -> bool {
        match (self.as_const(lhs).is_some(), self.as_const(rhs).is_some()) {
            (true, false) => true,
            (false, true) => false,
            _ => lhs > rhs,
        }
    }

    fn intern(&mut self, node: ExprNode) -> ExprId {
        if let Some(id) = self.interned.get(&node) {
            return *id;
        }

        let info = self.info_for(&node);
        let id = ExprId(u32::try_from(self.nodes.len()).unwrap_or(u32::MAX));
        self.nodes.push(node.clone());
        self.info.push(info);
        self.interned.insert(node, id);
        id
    }

    fn info_for(&self, node: &ExprNode) -> NodeInfo {
        let mut flags = match node {
            ExprNode::Var(Variable::Flag(_)) => ExprFlags::FLAG,
            ExprNode::Var(Variable::External(_)) => ExprFlags::EXTERNAL,
            ExprNode::Select { .. } => ExprFlags::BRANCHING,
            ExprNode::Binary { op, lhs, rhs } => {
                let both_symbolic = self.as_const(*lhs).is_none() && self.as_const(*rhs).is_none();
                let nonlinear =
                    op.is_nonlinear() || matches!(op, SymbolicOp::Shl | SymbolicOp::ShrU);
                if both_symbolic && nonlinear {
                    ExprFlags::NONLINEAR
                } else {
                    ExprFlags::empty()
                }
            }
            ExprNode::Const(_) | ExprNode::Unary { .. } => ExprFlags::empty(),
        };

        let mut depth = 0u32;
        let mut size = 1u32;
        node.for_each_operand(|operand| {
            let child = self.info[operand.index()];
            flags |= child.flags;
            depth = depth.max(child.depth);
            size = size.saturating_add(child.size);
        });

        NodeInfo {
            flags,
            depth: depth + 1,
            size,
        }
    }

    /// Every node reachable from `root`, in ascending (topological) order.
    fn reachable(&self, root: ExprId) -> Vec<ExprId> {
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if seen.insert(id) {
                self.node(id).for_each_operand(|operand| stack.push(operand));
            }
        }

        let mut order: Vec<ExprId> = seen.into_iter().collect();
        order.sort_unstable();
        order
    }

    /// Collects the free variables of the expression rooted at `id`.
    #[must_use]
    pub fn free_variables(&self, id: ExprId) -> BTreeSet<Variable> {
        if !self
            .flags(id)
            .intersects(ExprFlags::FLAG | ExprFlags::EXTERNAL)
        {
            return BTreeSet::new();
        }

        self.reachable(id)
            .into_iter()
            .filter_map(|node| match self.node(node) {
                ExprNode::Var(variable) => Some(variable.clone()),
                _ => None,
            })
            .collect()
    }

    /// Collects the flag offsets the expression rooted at `id` depends on.
    #[must_use]
    pub fn flag_offsets(&self, id: ExprId) -> BTreeSet<u32> {
        if !self.flags(id).contains(ExprFlags::FLAG) {
            return BTreeSet::new();
        }

        self.free_variables(id)
            .iter()
            .filter_map(Variable::flag_offset)
            .collect()
    }

    /// Flattens the expression rooted at `id` into a form that can be evaluated
    /// repeatedly without touching the arena.
    #[must_use]
    pub fn compile(&self, id: ExprId) -> CompiledExpr {
        let order = self.reachable(id);
        let variables: Vec<Variable> = self.free_variables(id).into_iter().collect();
        let slots: HashMap<ExprId, usize> = order
            .iter()
            .enumerate()
            .map(|(slot, node)| (*node, slot))
            .collect();

        let steps = order
            .iter()
            .map(|node| match self.node(*node) {
                ExprNode::Const(value) => Step::Const(*value),
                ExprNode::Var(variable) => {
                    Step::Var(variables.binary_search(variable).unwrap_or_default())
                }
                ExprNode::Unary { op, operand } => Step::Unary(*op, slots[operand]),
                ExprNode::Binary { op, lhs, rhs } => Step::Binary(*op, slots[lhs], slots[rhs]),
                ExprNode::Select {
                    cond,
                    then,
                    otherwise,
                } => Step::Select(slots[cond], slots[then], slots[otherwise]),
            })
            .collect();

        CompiledExpr { variables, steps }
    }

    /// Evaluates the expression rooted at `id`.
    ///
    /// Returns `None` if `bindings` leaves a free variable unbound.
    pub fn evaluate<F>(&self, id: ExprId, bindings: F) -> Option<u64>
    where
        F: Fn(&Variable) -> Option<u64>,
    {
        self.compile(id).evaluate_with(bindings)
    }

    /// Copies the expression rooted at `id` out of `other` into this arena.
    pub fn import(&mut self, other: &ExprArena, id: ExprId) -> ExprId {
        let mut mapped: HashMap<ExprId, ExprId> = HashMap::new();
        for node in other.reachable(id) {
            let translated = match other.node(node) {
                ExprNode::Const(value) => ExprNode::Const(*value),
                ExprNode::Var(variable) => ExprNode::Var(variable.clone()),
                ExprNode::Unary { op, operand } => ExprNode::Unary {
                    op: *op,
                    operand: mapped[operand],
                },
                ExprNode::Binary { op, lhs, rhs } => ExprNode::Binary {
                    op: *op,
                    lhs: mapped[lhs],
                    rhs: mapped[rhs],
                },
                ExprNode::Select {
                    cond,
                    then,
                    otherwise,
                } => ExprNode::Select {
                    cond: mapped[cond],
                    then: mapped[then],
                    otherwise: mapped[otherwise],
                },
            };
            mapped.insert(node, self.intern(translated));
        }
        mapped[&id]
    }

    /// Renders the expression rooted at `id`.
    #[must_use]
    pub fn display(&self, id: ExprId) -> ExprDisplay<'_> {
        ExprDisplay { arena: self, id }
    }

    fn render(&self, id: ExprId, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node(id) {
            ExprNode::Const(value) => write!(f, "{value:#x}"),
            ExprNode::Var(variable) => write!(f, "{variable}"),
            ExprNode::Unary { op, operand } => {
                write!(f, "{op}(")?;
                self.render(*operand, f)?;
                write!(f, ")")
            }
            ExprNode::Binary { op, lhs, rhs } => {
                write!(f, "(")?;
                self.render(*lhs, f)?;
                write!(f, " {op} ")?;
                self.render(*rhs, f)?;
                write!(f, ")")
            }
            ExprNode::Select {
                cond,
                then,
                otherwise,
            } => {
                write!(f, "ite(")?;
                self.render(*cond, f)?;
                write!(f, ", ")?;
                self.render(*then, f)?;
                write!(f, ", ")?;
                self.render(*otherwise, f)?;
                write!(f, ")")
            }
        }
    }
}

/// Display adapter returned by [`ExprArena::display`].
pub struct ExprDisplay<'a> {
    arena: &'a ExprArena,
    id: ExprId,
}

impl fmt::Display for ExprDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = self.arena.size(self.id);
        if size > MAX_RENDERED_NODES {
            return write!(f, "<{} of {} nodes>", self.id, size);
        }
        self.arena.render(self.id, f)
    }
}

#[derive(Debug, Clone)]
enum Step {
    Const(u64),
    Var(usize),
    Unary(SymbolicOp, usize),
    Binary(SymbolicOp, usize, usize),
    Select(usize, usize, usize),
}

/// An expression flattened into evaluation order.
///
/// Variables are numbered by their position in [`CompiledExpr::variables`], which is
/// sorted, so an assignment is a plain slice of values.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    variables: Vec<Variable>,
    steps: Vec<Step>,
}

impl CompiledExpr {
    /// The free variables, sorted ascending.
    #[must_use]
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Evaluates with `assignment[i]` bound to `variables()[i]`.
    ///
    /// Variables without a value in `assignment` evaluate as zero.
    #[must_use]
    pub fn evaluate(&self, assignment: &[u64]) -> u64 {
        let mut slots: Vec<u64> = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let value = match step {
                Step::Const(value) => *value,
                Step::Var(index) => assignment.get(*index).copied().unwrap_or(0),
                Step::Unary(op, operand) => op.apply_unary(slots[*operand]),
                Step::Binary(op, lhs, rhs) => op.apply_binary(slots[*lhs], slots[*rhs]),
                Step::Select(cond, then, otherwise) => {
                    if slots[*cond] != 0 {
                        slots[*then]
                    } else {
                        slots[*otherwise]
                    }
                }
            };
            slots.push(value);
        }
        slots.last().copied().unwrap_or(0)
    }

    /// Evaluates with variables bound through a lookup function.
    ///
    /// Returns `None` if a free variable is unbound.
    pub fn evaluate_with<F>(&self, bindings: F) -> Option<u64>
    where
        F: Fn(&Variable) -> Option<u64>,
    {
        let assignment = self
            .variables
            .iter()
            .map(&bindings)
            .collect::<Option<Vec<u64>>>()?;
        Some(self.evaluate(&assignment))
    }
}

/// A shared handle to one expression inside a frozen arena.
#[derive(Clone)]
pub struct ExprRef {
    arena: Arc<ExprArena>,
    id: ExprId,
}

impl ExprRef {
    /// Wraps `id`, which must belong to `arena`.
    #[must_use]
    pub fn new(arena: Arc<ExprArena>, id: ExprId) -> Self {
        debug_assert!(arena.contains(id));
        Self { arena, id }
    }

    /// The node id inside [`ExprRef::arena`].
    #[must_use]
    pub fn id(&self) -> ExprId {
        self.id
    }

    /// The arena holding the expression.
    #[must_use]
    pub fn arena(&self) -> &Arc<ExprArena> {
        &self.arena
    }

    /// The root node.
    #[must_use]
    pub fn node(&self) -> &ExprNode {
        self.arena.node(self.id)
    }

    /// Cached properties of the expression.
    #[must_use]
    pub fn flags(&self) -> ExprFlags {
        self.arena.flags(self.id)
    }

    /// Height of the expression tree.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.arena.depth(self.id)
    }

    /// Tree node count of the expression.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.arena.size(self.id)
    }

    /// The free variables of the expression.
    #[must_use]
    pub fn free_variables(&self) -> BTreeSet<Variable> {
        self.arena.free_variables(self.id)
    }

    /// The flag offsets the expression depends on.
    #[must_use]
    pub fn flag_offsets(&self) -> BTreeSet<u32> {
        self.arena.flag_offsets(self.id)
    }

    /// Flattens the expression for repeated evaluation.
    #[must_use]
    pub fn compile(&self) -> CompiledExpr {
        self.arena.compile(self.id)
    }

    /// Evaluates the expression; `None` if a free variable is unbound.
    pub fn evaluate<F>(&self, bindings: F) -> Option<u64>
    where
        F: Fn(&Variable) -> Option<u64>,
    {
        self.arena.evaluate(self.id, bindings)
    }
}

impl PartialEq for ExprRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.arena, &other.arena)
    }
}

impl fmt::Debug for ExprRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ExprRef")
            .field(&self.id)
            .field(&format_args!("{self}"))
            .finish()
    }
}

impl fmt::Display for ExprRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.arena.display(self.id).fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_consing() {
        let mut arena = ExprArena::new();
        let a = arena.flag_byte(0);
        let b = arena.flag_byte(0);
        assert_eq!(a, b);

        let c = arena.constant(7);
        let x = arena.binary(SymbolicOp::Add, a, c);
        let y = arena.binary(SymbolicOp::Add, c, a);
        assert_eq!(x, y);
        assert_eq!(arena.len(), 3);
    }

    #[test]
    fn test_constant_folding() {
        let mut arena = ExprArena::new();
        let two = arena.constant(2);
        let three = arena.constant(3);
        let five = arena.binary(SymbolicOp::Add, two, three);
        assert_eq!(arena.as_const(five), Some(5));

        let flag = arena.flag_byte(1);
        let zero = arena.constant(0);
        assert_eq!(arena.binary(SymbolicOp::Xor, flag, zero), flag);
        assert_eq!(arena.binary(SymbolicOp::Xor, flag, flag), zero);

        let not = arena.unary(SymbolicOp::Not, flag);
        assert_eq!(arena.unary(SymbolicOp::Not, not), flag);

        let cond = arena.constant(1);
        assert_eq!(arena.select(cond, flag, zero), flag);
    }

    #[test]
    fn test_flags_and_depth() {
        let mut arena = ExprArena::new();
        let flag = arena.flag_byte(0);
        let counter = arena.external("counter");
        let sum = arena.binary(SymbolicOp::Add, flag, counter);
        let product = arena.binary(SymbolicOp::Mul, sum, flag);

        assert_eq!(arena.flags(flag), ExprFlags::FLAG);
        assert!(arena
            .flags(sum)
            .contains(ExprFlags::FLAG | ExprFlags::EXTERNAL));
        assert!(!arena.flags(sum).contains(ExprFlags::NONLINEAR));
        assert!(arena.flags(product).contains(ExprFlags::NONLINEAR));
        assert_eq!(arena.depth(flag), 1);
        assert_eq!(arena.depth(product), 3);
        assert_eq!(arena.size(product), 5);
    }

    #[test]
    fn test_free_variables() {
        let mut arena = ExprArena::new();
        let f2 = arena.flag_byte(2);
        let f0 = arena.flag_byte(0);
        let ext = arena.external("clock");
        let a = arena.binary(SymbolicOp::Or, f2, f0);
        let b = arena.binary(SymbolicOp::And, a, ext);

        let vars: Vec<Variable> = arena.free_variables(b).into_iter().collect();
        assert_eq!(
            vars,
            vec![
                Variable::Flag(0),
                Variable::Flag(2),
                Variable::External("clock".to_string())
            ]
        );
        assert_eq!(arena.flag_offsets(b).into_iter().collect::<Vec<_>>(), vec![0, 2]);

        let c = arena.constant(9);
        assert!(arena.free_variables(c).is_empty());
    }

    #[test]
    fn test_evaluate() {
        let mut arena = ExprArena::new();
        let f0 = arena.flag_byte(0);
        let f1 = arena.flag_byte(1);
        let shift = arena.constant(4);
        let hi = arena.binary(SymbolicOp::Shl, f0, shift);
        let joined = arena.binary(SymbolicOp::Or, hi, f1);
        let cond = arena.binary(SymbolicOp::LtU, f0, f1);
        let pick = arena.select(cond, joined, f1);

        let bindings = |v: &Variable| match v {
            Variable::Flag(0) => Some(0x3),
            Variable::Flag(1) => Some(0x5),
            _ => None,
        };
        assert_eq!(arena.evaluate(joined, bindings), Some(0x35));
        assert_eq!(arena.evaluate(pick, bindings), Some(0x35));
        assert_eq!(arena.evaluate(pick, |_| None), None);
    }

    #[test]
    fn test_compiled_assignment_order() {
        let mut arena = ExprArena::new();
        let f1 = arena.flag_byte(1);
        let f0 = arena.flag_byte(0);
        let diff = arena.binary(SymbolicOp::Sub, f1, f0);

        let compiled = arena.compile(diff);
        assert_eq!(compiled.variables(), &[Variable::Flag(0), Variable::Flag(1)]);
        assert_eq!(compiled.evaluate(&[3, 10]), 7);
    }

    #[test]
    fn test_import() {
        let mut source = ExprArena::new();
        let f0 = source.flag_byte(0);
        let key = source.constant(0x42);
        let expr = source.binary(SymbolicOp::Xor, f0, key);

        let mut target = ExprArena::new();
        target.constant(1);
        let imported = target.import(&source, expr);
        assert_eq!(
            target.evaluate(imported, |_| Some(0x42)),
            source.evaluate(expr, |_| Some(0x42))
        );
        assert_eq!(target.display(imported).to_string(), "(flag[0] ^ 0x42)");
    }

    #[test]
    fn test_expr_ref() {
        let mut arena = ExprArena::new();
        let f0 = arena.flag_byte(0);
        let arena = Arc::new(arena);

        let a = ExprRef::new(arena.clone(), f0);
        let b = ExprRef::new(arena, f0);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "flag[0]");
        assert_eq!(a.depth(), 1);
    }
}
