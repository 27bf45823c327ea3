//! Leak detection and classification.
//!
//! Detection works on a symbolic trace: every output byte whose expression mentions
//! a flag byte is a leak candidate ([`ByteDependency`]). Classification then decides
//! how the flag byte can be read back from such an output byte ([`LeakDescriptor`]).
//!
//! # Key Components
//!
//! - [`LeakLocator`] - Extracts flag-offset provenance per output byte
//! - [`LeakClassifier`] - Grades dependencies as DIRECT, TRANSFORMED or UNRESOLVED
//! - [`ConcreteScan`] - Ground-truth based search for verbatim flag runs in the output
//!
//! # Example
//!
//! ```rust,ignore
//! use leakscope::leak::{LeakClassifier, LeakLocator};
//!
//! let dependencies = LeakLocator::new().locate(&symbolic_trace)?;
//! let descriptors = LeakClassifier::new(config.classifier).classify_all(&dependencies);
//! for descriptor in &descriptors {
//!     println!("{descriptor}");
//! }
//! ```

mod classifier;
mod locator;
mod naive;

use std::{collections::BTreeSet, fmt};

use strum::{Display, EnumIter};

pub use classifier::{selection_order, LeakClassifier};
pub use locator::LeakLocator;
pub use naive::{ConcreteScan, NaiveLeak, MIN_NAIVE_RUN};

use crate::{engine::ChannelId, expr::ExprRef};

/// One output byte that depends on the flag region.
#[derive(Debug, Clone, PartialEq)]
pub struct ByteDependency {
    /// The channel carrying the byte.
    pub channel: ChannelId,
    /// Position in the channel's output stream.
    pub position: usize,
    /// Engine step that wrote the byte.
    pub step: u64,
    /// The flag offsets among the expression's free variables.
    pub flag_offsets: BTreeSet<u32>,
    /// The byte's expression.
    pub expression: ExprRef,
}

impl ByteDependency {
    /// The flag offset, if the byte depends on exactly one.
    #[must_use]
    pub fn single_flag_offset(&self) -> Option<u32> {
        match self.flag_offsets.len() {
            1 => self.flag_offsets.first().copied(),
            _ => None,
        }
    }
}

/// How a leak relates output to flag content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum LeakClass {
    /// Output byte is an invertible simple function of exactly one flag byte.
    #[strum(serialize = "DIRECT")]
    Direct,
    /// Output depends on flag bytes through a more complex deterministic relation.
    #[strum(serialize = "TRANSFORMED")]
    Transformed,
    /// Dependency exists but cannot be reproduced deterministically.
    #[strum(serialize = "UNRESOLVED")]
    Unresolved,
}

impl LeakClass {
    /// Preference rank, lower is better.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            LeakClass::Direct => 0,
            LeakClass::Transformed => 1,
            LeakClass::Unresolved => 2,
        }
    }

    /// Confidence of a leak of this class before penalties.
    #[must_use]
    pub const fn base_confidence(self) -> f64 {
        match self {
            LeakClass::Direct => 1.0,
            LeakClass::Transformed => 0.8,
            LeakClass::Unresolved => 0.1,
        }
    }
}

/// Recovers a flag byte from an observed output byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InverseTransform {
    /// `flag = output`
    Identity,
    /// `flag = output ^ key`
    Xor(u8),
    /// `flag = output - delta`
    Sub(u8),
    /// `flag = table[output]`, for bijective byte transforms.
    Table(Box<[u8; 256]>),
    /// The flag byte is recovered by solving the route's constraints.
    Solve,
}

impl InverseTransform {
    /// Short name of the transform.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            InverseTransform::Identity => "identity",
            InverseTransform::Xor(_) => "xor",
            InverseTransform::Sub(_) => "sub",
            InverseTransform::Table(_) => "table",
            InverseTransform::Solve => "solve",
        }
    }

    /// Returns `true` if [`InverseTransform::apply`] works without a solver.
    #[must_use]
    pub fn is_closed_form(&self) -> bool {
        !matches!(self, InverseTransform::Solve)
    }

    /// Recovers the flag byte from an output byte; `None` for solver-backed
    /// inverses.
    #[must_use]
    pub fn apply(&self, output: u8) -> Option<u8> {
        match self {
            InverseTransform::Identity => Some(output),
            InverseTransform::Xor(key) => Some(output ^ key),
            InverseTransform::Sub(delta) => Some(output.wrapping_sub(*delta)),
            InverseTransform::Table(table) => Some(table[usize::from(output)]),
            InverseTransform::Solve => None,
        }
    }

    /// Predicts the output byte for a flag byte; `None` for solver-backed inverses.
    #[must_use]
    pub fn forward(&self, flag: u8) -> Option<u8> {
        match self {
            InverseTransform::Identity => Some(flag),
            InverseTransform::Xor(key) => Some(flag ^ key),
            InverseTransform::Sub(delta) => Some(flag.wrapping_add(*delta)),
            InverseTransform::Table(table) => table
                .iter()
                .position(|value| *value == flag)
                .and_then(|output| u8::try_from(output).ok()),
            InverseTransform::Solve => None,
        }
    }

    /// Parameters of the transform as text: the key, the delta, or the table in hex.
    #[must_use]
    pub fn parameters(&self) -> String {
        match self {
            InverseTransform::Identity | InverseTransform::Solve => String::new(),
            InverseTransform::Xor(value) | InverseTransform::Sub(value) => {
                format!("{value:#04x}")
            }
            InverseTransform::Table(table) => {
                table.iter().map(|byte| format!("{byte:02x}")).collect()
            }
        }
    }
}

impl fmt::Display for InverseTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InverseTransform::Xor(value) | InverseTransform::Sub(value) => {
                write!(f, "{}({value:#04x})", self.name())
            }
            _ => write!(f, "{}", self.name()),
        }
    }
}

/// A run of leaks whose output positions and flag offsets advance in lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatPattern {
    /// Output position of the first leak of the run.
    pub start: usize,
    /// Distance between consecutive output positions.
    pub stride: usize,
    /// Number of leaks in the run.
    pub count: usize,
    /// Flag offset disclosed by the first leak.
    pub flag_start: u32,
    /// Difference between consecutive flag offsets.
    pub flag_stride: i64,
}

/// A classified leak.
#[derive(Debug, Clone, PartialEq)]
pub struct LeakDescriptor {
    /// The leak class.
    pub class: LeakClass,
    /// The channel carrying the leak.
    pub channel: ChannelId,
    /// Position in the channel's output stream.
    pub position: usize,
    /// Set when the leak is part of a regular run of leaks.
    pub pattern: Option<RepeatPattern>,
    /// The underlying dependency.
    pub dependency: ByteDependency,
    /// Closed-form inverse, when one exists.
    pub inverse: Option<InverseTransform>,
    /// Confidence in `0.0..=1.0` that the leak can be exploited.
    pub confidence: f64,
    /// Height of the expression tree.
    pub depth: u32,
    /// Number of flag values that produce the same output, at worst.
    pub ambiguity: u32,
}

impl LeakDescriptor {
    /// The flag offsets the leak depends on.
    #[must_use]
    pub fn flag_offsets(&self) -> &BTreeSet<u32> {
        &self.dependency.flag_offsets
    }

    /// The flag offset, if the leak depends on exactly one.
    #[must_use]
    pub fn single_flag_offset(&self) -> Option<u32> {
        self.dependency.single_flag_offset()
    }

    /// The leak's expression.
    #[must_use]
    pub fn expression(&self) -> &ExprRef {
        &self.dependency.expression
    }

    /// Tree node count of the leak's expression.
    #[must_use]
    pub fn node_count(&self) -> u32 {
        self.dependency.expression.size()
    }

    /// Returns `true` if the leak may be selected for synthesis.
    #[must_use]
    pub fn is_exploitable(&self, min_confidence: f64) -> bool {
        self.class != LeakClass::Unresolved && self.confidence >= min_confidence
    }
}

impl fmt::Display for LeakDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} leak of flag{:?} at {}:{} (confidence {:.2}",
            self.class,
            self.flag_offsets(),
            self.channel,
            self.position,
            self.confidence
        )?;
        if let Some(inverse) = &self.inverse {
            write!(f, ", inverse {inverse}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverse_round_trip() {
        let xor = InverseTransform::Xor(0x20);
        assert_eq!(xor.forward(0x41), Some(0x61));
        assert_eq!(xor.apply(0x61), Some(0x41));

        let sub = InverseTransform::Sub(3);
        assert_eq!(sub.forward(0xff), Some(0x02));
        assert_eq!(sub.apply(0x02), Some(0xff));

        let mut table = [0u8; 256];
        for (output, flag) in table.iter_mut().enumerate() {
            *flag = (output as u8).rotate_left(1);
        }
        let table = InverseTransform::Table(Box::new(table));
        let output = table.forward(0x81).unwrap();
        assert_eq!(table.apply(output), Some(0x81));

        assert_eq!(InverseTransform::Solve.apply(0), None);
        assert!(!InverseTransform::Solve.is_closed_form());
    }

    #[test]
    fn test_inverse_display() {
        assert_eq!(InverseTransform::Xor(0x42).to_string(), "xor(0x42)");
        assert_eq!(InverseTransform::Identity.to_string(), "identity");
        assert_eq!(InverseTransform::Sub(1).parameters(), "0x01");
    }

    #[test]
    fn test_class_order() {
        assert!(LeakClass::Direct.rank() < LeakClass::Transformed.rank());
        assert!(LeakClass::Transformed.rank() < LeakClass::Unresolved.rank());
        assert_eq!(LeakClass::Transformed.to_string(), "TRANSFORMED");
    }
}
