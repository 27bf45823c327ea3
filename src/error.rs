use strum::Display;
use thiserror::Error;

use crate::{exploit::Mismatch, leak::LeakDescriptor};

macro_rules! invalid_input {
    // Single string version
    ($msg:expr) => {
        crate::Error::InvalidInput {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::InvalidInput {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The pipeline stage an error originated from.
///
/// Every failure that leaves a stage carries its origin, so a caller driving many
/// sessions can tell an engine fault during tracing apart from one that happened
/// while replaying a synthesized input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Stage {
    /// Concrete or symbolic execution of the target.
    #[strum(serialize = "trace")]
    TraceRunner,
    /// Provenance extraction from a symbolic trace.
    #[strum(serialize = "locate")]
    LeakLocator,
    /// Leak classification.
    #[strum(serialize = "classify")]
    LeakClassifier,
    /// Constraint solving on behalf of any stage.
    #[strum(serialize = "solve")]
    Solver,
    /// Exploit template construction.
    #[strum(serialize = "synthesize")]
    ExploitSynthesizer,
    /// Replay of a template against the target.
    #[strum(serialize = "validate")]
    Validator,
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The taxonomy mirrors the analysis pipeline: budget exhaustion, the negative
/// `NoLeak` result, leaks that cannot be turned into an exploit, exploits that do
/// not reproduce, and faults of the target or the execution engine.
///
/// # Error Categories
///
/// ## Analysis Results
/// - [`Error::NoLeak`] - The target does not disclose flag data for this input
/// - [`Error::Unsynthesizable`] - A leak exists but cannot be reproduced on demand
/// - [`Error::ValidationFailed`] - A synthesized exploit did not reproduce
///
/// ## Budget and Execution
/// - [`Error::Timeout`] - Execution or solving exceeded its budget
/// - [`Error::ExecutionError`] - The target crashed or the engine broke its contract
///
/// ## API Misuse
/// - [`Error::InvalidInput`] - Invalid arguments such as an empty flag region
/// - [`Error::OffsetNotCovered`] - No route discloses the requested flag offset
/// - [`Error::NotExportable`] - Export of an unvalidated artifact was requested
///
/// # Examples
///
/// ```rust,ignore
/// use leakscope::Error;
///
/// match analysis.exploit(&ground_truth) {
///     Ok(artifact) => println!("leaks {} flag bytes", artifact.covered_offsets().len()),
///     Err(Error::NoLeak) => println!("target does not leak"),
///     Err(Error::Unsynthesizable { descriptor, reason }) => {
///         println!("leak at {} not exploitable: {}", descriptor.position, reason)
///     }
///     Err(e) => eprintln!("analysis failed: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// Execution or solving exceeded its step, time or query budget.
    ///
    /// Callers may retry once with the same parameters; partial results of the
    /// cancelled run are never reused.
    #[error("Budget exhausted during {stage}: {detail}")]
    Timeout {
        /// The stage whose budget was exhausted
        stage: Stage,
        /// Which budget was hit and by how much
        detail: String,
    },

    /// No output byte depends on the flag region.
    ///
    /// This is the expected negative outcome for a target that does not leak
    /// with the supplied input, not a fault.
    #[error("No output byte depends on the flag region")]
    NoLeak,

    /// A leak exists but no deterministic exploitation procedure could be built
    /// within the configured bounds.
    #[error("Leak at output position {} cannot be exploited: {reason}", .descriptor.position)]
    Unsynthesizable {
        /// The leak that was selected for synthesis
        descriptor: Box<LeakDescriptor>,
        /// Why synthesis gave up
        reason: String,
    },

    /// Synthesis produced a template whose reproducibility could not be confirmed,
    /// even after the retry with expanded bounds.
    #[error("Exploit for output position {} did not reproduce ({} mismatches)", .descriptor.position, .mismatches.len())]
    ValidationFailed {
        /// The leak the exploit was built for
        descriptor: Box<LeakDescriptor>,
        /// The sampled offsets that did not reproduce
        mismatches: Vec<Mismatch>,
    },

    /// The target crashed, or the execution engine faulted or broke its contract.
    #[error("Execution failed during {stage}: {message}")]
    ExecutionError {
        /// The stage that ran the target
        stage: Stage,
        /// Description of the fault
        message: String,
    },

    /// The solver backend reported a failure unrelated to budgets.
    #[error("Solver failure: {0}")]
    SolverError(String),

    /// The caller supplied invalid arguments.
    #[error("Invalid input - {file}:{line}: {message}")]
    InvalidInput {
        /// The message to be printed for the InvalidInput error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// The exploit has no route that discloses this flag offset.
    #[error("Flag offset {0} is not covered by the exploit")]
    OffsetNotCovered(u32),

    /// Only validated artifacts may be handed to a packager.
    #[error("Artifact is not validated and cannot be exported")]
    NotExportable,
}

impl Error {
    /// Returns `true` for the negative analysis result rather than a fault.
    #[must_use]
    pub fn is_no_leak(&self) -> bool {
        matches!(self, Error::NoLeak)
    }

    /// Returns the stage that produced the error, where one is recorded.
    #[must_use]
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Timeout { stage, .. } | Error::ExecutionError { stage, .. } => Some(*stage),
            Error::Unsynthesizable { .. } => Some(Stage::ExploitSynthesizer),
            Error::ValidationFailed { .. } => Some(Stage::Validator),
            Error::SolverError(_) => Some(Stage::Solver),
            Error::NoLeak => Some(Stage::LeakLocator),
            Error::InvalidInput { .. } | Error::OffsetNotCovered(_) | Error::NotExportable => None,
        }
    }
}
