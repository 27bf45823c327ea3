//! The execution engine interface.
//!
//! The analysis never runs a target itself. It hands an [`ExecutionRequest`] to an
//! [`ExecutionEngine`] and receives an [`EngineTrace`]: every write the target made
//! to an output channel, byte by byte, with each byte either concrete or a symbolic
//! expression in the trace's own arena.
//!
//! # Contract
//!
//! - Input bytes are always concrete. Only the regions listed in
//!   [`ExecutionRequest::symbolic_regions`] may be symbolic, and their bytes are named
//!   [`Variable::Flag`](crate::expr::Variable::Flag) by offset from the region base.
//! - State the engine cannot concretize (clocks, counters, randomness) may appear as
//!   [`Variable::External`](crate::expr::Variable::External).
//! - With no symbolic region, every output byte must be concrete.
//! - The same request produces the same trace. Per-run randomness must derive from
//!   [`ExecutionRequest::seed`].
//! - The engine enforces [`ExecutionRequest::limits`] and reports exhaustion as
//!   [`EngineFault::LimitExceeded`].
//!
//! The crate ships [`crate::sim::SimMachine`] as a reference implementation.

mod stats;

use std::fmt;

pub use stats::{ExecutionStats, LimitExceeded};

use crate::{
    config::ExecutionLimits,
    expr::{ExprArena, ExprId},
};

/// Identifier of an output channel (a file descriptor for process targets).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl ChannelId {
    /// Standard output.
    pub const STDOUT: ChannelId = ChannelId(1);
    /// Standard error.
    pub const STDERR: ChannelId = ChannelId(2);
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd{}", self.0)
    }
}

/// A contiguous range of target memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRegion {
    /// First address of the region.
    pub base: u64,
    /// Length in bytes.
    pub len: u32,
}

impl MemoryRegion {
    /// Returns the offset of `address` inside the region.
    #[must_use]
    pub fn offset_of(&self, address: u64) -> Option<u32> {
        let offset = address.checked_sub(self.base)?;
        u32::try_from(offset).ok().filter(|offset| *offset < self.len)
    }

    /// Returns `true` if `address` lies inside the region.
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        self.offset_of(address).is_some()
    }
}

/// Everything an engine needs for one run.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionRequest<'a> {
    /// Concrete program input.
    pub input: &'a [u8],
    /// Memory regions whose content is to be treated as symbolic.
    pub symbolic_regions: &'a [MemoryRegion],
    /// Seed of the per-run environment (randomness, challenge values).
    pub seed: u64,
    /// Execution budget.
    pub limits: ExecutionLimits,
}

/// One output byte as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineByte {
    /// A byte with a known value.
    Concrete(u8),
    /// A byte whose low 8 bits are given by an expression of the trace arena.
    Symbolic(ExprId),
}

/// One write of the target to an output channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineWrite {
    /// The written channel.
    pub channel: ChannelId,
    /// The engine step that performed the write.
    pub step: u64,
    /// The written bytes.
    pub bytes: Vec<EngineByte>,
}

/// Everything observed during one run.
#[derive(Debug, Clone, Default)]
pub struct EngineTrace {
    /// Output writes in execution order.
    pub writes: Vec<EngineWrite>,
    /// Arena holding every symbolic output expression.
    pub arena: ExprArena,
    /// Number of steps executed.
    pub steps: u64,
}

/// Abnormal termination of a run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineFault {
    /// The run hit its step or time budget.
    #[error("{0}")]
    LimitExceeded(LimitExceeded),
    /// The target crashed, or the engine could not continue.
    #[error("target crashed at step {step}: {reason}")]
    Crash {
        /// Step at which the crash happened.
        step: u64,
        /// Description of the crash.
        reason: String,
    },
}

/// A target program together with the machinery to run it.
///
/// Engines are shared across threads by batch analysis and must not keep mutable
/// per-run state outside of [`ExecutionEngine::execute`].
pub trait ExecutionEngine: Send + Sync {
    /// Runs the target once.
    ///
    /// # Errors
    ///
    /// Returns [`EngineFault::LimitExceeded`] when the budget is exhausted and
    /// [`EngineFault::Crash`] when the target terminates abnormally.
    fn execute(&self, request: &ExecutionRequest<'_>) -> Result<EngineTrace, EngineFault>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_region() {
        let region = MemoryRegion {
            base: 0x4347_c000,
            len: 4096,
        };
        assert_eq!(region.offset_of(0x4347_c000), Some(0));
        assert_eq!(region.offset_of(0x4347_cfff), Some(4095));
        assert_eq!(region.offset_of(0x4347_d000), None);
        assert_eq!(region.offset_of(0), None);
        assert!(region.contains(0x4347_c010));
    }

    #[test]
    fn test_channel_display() {
        assert_eq!(ChannelId::STDOUT.to_string(), "fd1");
        assert!(ChannelId::STDOUT < ChannelId::STDERR);
    }
}
