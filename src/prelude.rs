//! # leakscope Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the leakscope library. Import this module to get quick access to the essential
//! types for leak analysis.
//!
//! ```rust
//! use leakscope::prelude::*;
//!
//! let config = AnalysisConfig::fast();
//! let solver = EnumerativeSolver::from_limits(&config.solver);
//! assert_eq!(solver.name(), "enumerative");
//! ```

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all leakscope operations
pub use crate::Error;

/// The result type used throughout leakscope
pub use crate::Result;

/// The pipeline stage an error is attributed to
pub use crate::Stage;

// ================================================================================================
// Configuration
// ================================================================================================

/// Budgets and thresholds
pub use crate::config::{
    AnalysisConfig, ClassifierConfig, ExecutionLimits, ProbeConfig, SolverLimits,
    ValidationConfig,
};

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// Analysis session and batch driver
pub use crate::session::{analyze_batch, AnalysisJob, LeakAnalysis, LeakReport};

/// Explicit collaborator bundle passed between stages
pub use crate::context::AnalysisContext;

// ================================================================================================
// Collaborator Interfaces
// ================================================================================================

/// Execution engine interface
pub use crate::engine::{
    ChannelId, EngineByte, EngineFault, EngineTrace, EngineWrite, ExecutionEngine,
    ExecutionRequest, MemoryRegion,
};

/// Solver interface and the built-in backend
pub use crate::solver::{Constraint, EnumerativeSolver, Enumeration, Solver};

/// Z3-backed solver
#[cfg(feature = "z3")]
pub use crate::solver::Z3Solver;

// ================================================================================================
// Traces and Leaks
// ================================================================================================

/// Flag regions and execution traces
pub use crate::trace::{ExecutionTrace, FlagGroundTruth, FlagMode, FlagRegion, TraceRunner};

/// Leak location and classification
pub use crate::leak::{
    ByteDependency, InverseTransform, LeakClass, LeakClassifier, LeakDescriptor, LeakLocator,
    NaiveLeak,
};

// ================================================================================================
// Exploits
// ================================================================================================

/// Templates, validation and export
pub use crate::exploit::{
    ExploitArtifact, ExploitExport, ExploitSynthesizer, ExploitTemplate, Mismatch, Route,
    ValidationStatus, Validator,
};

// ================================================================================================
// Symbolic Expressions and the Reference Engine
// ================================================================================================

/// Expression storage
pub use crate::expr::{ExprArena, ExprId, ExprRef, SymbolicOp, Variable};

/// Register machine for building test targets
pub use crate::sim::{Program, ProgramAssembler, Reg, SimMachine};
