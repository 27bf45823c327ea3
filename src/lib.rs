// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

//! # leakscope
//!
//! Detection of information leaks from a protected memory region ("the flag page")
//! into a program's output, and synthesis of replayable inputs that make the
//! program disclose chosen flag bytes on demand.
//!
//! `leakscope` runs a target twice for the same input: once with the real flag
//! content, once with every flag byte replaced by a free variable. Output bytes
//! that come out as expressions over flag variables are leaks. Each leak is
//! classified by how its flag byte can be read back, an exploit template is built
//! for the best one, and the template is replayed against the target before it is
//! handed out.
//!
//! ## Features
//!
//! - **Hybrid tracing** - Input always stays concrete; only the flag region is symbolic
//! - **Exact classification** - Single-byte leaks are graded from their full truth table
//! - **Solver-backed recovery** - Multi-byte and non-injective leaks via companion constraints
//! - **Input probing** - Finds the input byte that selects which flag byte leaks
//! - **Challenge-response detection** - Validation replays under several environment seeds
//! - **Pluggable backends** - Engines and solvers are traits; Z3 behind the `z3` feature
//!
//! ## Quick Start
//!
//! ```rust
//! use leakscope::prelude::*;
//!
//! // Prints the flag byte selected by the first input byte, xored with 0x20
//! let mut asm = ProgramAssembler::new();
//! asm.emit_bytes(ChannelId::STDOUT, b"leak: ")
//!     .load_input(Reg(1), 0)
//!     .binary_imm(SymbolicOp::RemU, Reg(1), Reg(1), 8)
//!     .load(Reg(0), 0x4347_c000, Reg(1))
//!     .xor_imm(Reg(0), Reg(0), 0x20)
//!     .emit(ChannelId::STDOUT, Reg(0))
//!     .halt();
//! let target = SimMachine::new(asm.finish()?, 0x4347_c000, b"s3cr3t!!".to_vec());
//!
//! let flag = FlagRegion::new(0x4347_c000, 8)?;
//! let solver = EnumerativeSolver::default();
//! let config = AnalysisConfig::default();
//! let analysis = LeakAnalysis::new(&target, &solver, &config, flag, b"A".to_vec());
//!
//! let artifact = analysis.exploit(&FlagGroundTruth::new(&flag, b"s3cr3t!!".to_vec())?)?;
//! let input = artifact.build_input_for_offset(5)?;
//! assert_eq!(input, vec![5]);
//! assert_eq!(artifact.expected_output_position(5)?, 6);
//! # Ok::<(), leakscope::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`expr`] - Hash-consed symbolic expressions
//! - [`solver`] - The [`solver::Solver`] trait and its backends
//! - [`engine`] - The [`engine::ExecutionEngine`] trait the target is run through
//! - [`trace`] - Flag regions, traces, and the [`trace::TraceRunner`]
//! - [`leak`] - Leak location, classification, and the concrete scan
//! - [`exploit`] - Synthesis, validation, and the exploit artifact
//! - [`session`] - [`session::LeakAnalysis`], the pipeline driver
//! - [`sim`] - A small register machine implementing the engine trait
//! - [`config`] - Budgets and thresholds
//!
//! ## Error Handling
//!
//! All operations return [`Result<T, Error>`](Result). A target that does not leak
//! is reported as [`Error::NoLeak`], which is a result rather than a fault:
//!
//! ```rust,ignore
//! match analysis.exploit(&truth) {
//!     Ok(artifact) => println!("{}", artifact.export()?),
//!     Err(Error::NoLeak) => println!("no leak for this input"),
//!     Err(e) => eprintln!("analysis failed: {e}"),
//! }
//! ```
//!
//! ## Logging
//!
//! The crate emits records through the [`log`] facade: `debug` per stage, `info`
//! for findings, `warn` for retries and replay mismatches. Installing a logger is
//! left to the application.
#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit tests
#[cfg(test)]
pub(crate) mod test;

pub mod config;
pub mod context;
pub mod engine;
pub mod exploit;
pub mod expr;
pub mod leak;
pub mod prelude;
pub mod session;
pub mod sim;
pub mod solver;
pub mod trace;

/// `leakscope` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `leakscope` Error type and the pipeline stage it is attributed to.
pub use error::{Error, Stage};
