//! A small register machine implementing [`ExecutionEngine`](crate::engine::ExecutionEngine).
//!
//! [`SimMachine`] is the target-simulation harness used by the crate's own tests,
//! benches and fuzz target. It is deliberately tiny: sixteen registers, byte loads
//! from a mapped flag page, arithmetic, selects, a seeded runtime counter, output
//! writes and branches. That is enough to model the disclosure patterns the analysis
//! cares about (verbatim copies, keyed transforms, input-selected offsets, encodings
//! and leaks mixed with runtime state) without pulling in a real emulator.
//!
//! Programs are written with [`ProgramAssembler`], which resolves branch labels.

mod machine;
mod program;

pub use machine::SimMachine;
pub use program::{Instruction, Program, ProgramAssembler, Reg};
