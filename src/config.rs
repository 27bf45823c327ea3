//! Analysis configuration types.
//!
//! Every bound the pipeline enforces lives here, so that an automated caller can
//! trade thoroughness for speed without touching the stages themselves.
//!
//! # Overview
//!
//! - [`AnalysisConfig`] - Top-level configuration container
//! - [`ExecutionLimits`] - Step and wall-clock budget of one target execution
//! - [`SolverLimits`] - Candidate and assignment budgets for constraint solving
//! - [`ClassifierConfig`] - Thresholds of the leak classifier
//! - [`ProbeConfig`] - Budget of the input-probing search for additional routes
//! - [`ValidationConfig`] - Sampling and repetition policy of the validator
//!
//! # Configuration Presets
//!
//! - [`AnalysisConfig::fast()`] - Small budgets for triage of many targets
//! - [`AnalysisConfig::thorough()`] - Large budgets for a single stubborn target
//!
//! # Example
//!
//! ```rust
//! use leakscope::config::{AnalysisConfig, ExecutionLimits};
//!
//! // Use a preset
//! let config = AnalysisConfig::fast();
//!
//! // Or customize
//! let config = AnalysisConfig {
//!     limits: ExecutionLimits::new()
//!         .with_max_steps(1_000_000)
//!         .with_timeout_ms(10_000),
//!     ..Default::default()
//! }
//! .with_seed(7);
//! assert_eq!(config.seed, 7);
//! ```

use std::time::Duration;

/// Complete configuration of one leak analysis session.
///
/// # Default Configuration
///
/// | Setting | Default |
/// |---------|---------|
/// | `limits.max_steps` | 10 million |
/// | `limits.timeout_ms` | 60 seconds |
/// | `solver.max_candidates` | 16 |
/// | `solver.expanded_candidates` | 256 |
/// | `solver.max_assignments` | 65 536 (two free bytes) |
/// | `solver.expanded_assignments` | 16 777 216 (three free bytes) |
/// | `classifier.max_flag_bytes` | 2 |
/// | `classifier.min_confidence` | 0.3 |
/// | `probing.max_positions` | 64 |
/// | `probing.max_runs` | 4096 |
/// | `validation.samples` | 3 |
/// | `validation.repetitions` | 2 |
/// | `seed` | 0 |
#[derive(Clone, Debug, PartialEq)]
pub struct AnalysisConfig {
    /// Budget of every single target execution.
    pub limits: ExecutionLimits,

    /// Budgets of constraint solving.
    pub solver: SolverLimits,

    /// Classification thresholds.
    pub classifier: ClassifierConfig,

    /// Input-probing budget.
    pub probing: ProbeConfig,

    /// Validation policy.
    pub validation: ValidationConfig,

    /// Environment seed of the detection runs.
    ///
    /// Validation replays additionally use seeds derived from this one to expose
    /// output that depends on per-run randomness.
    pub seed: u64,
}

/// Execution budget of one target run.
///
/// The engine receives the limits and is expected to stop on its own; the trace
/// runner checks them again on the returned trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Maximum engine steps. Set to 0 for unlimited execution.
    pub max_steps: u64,

    /// Timeout in milliseconds. Set to 0 for no timeout.
    pub timeout_ms: u64,
}

/// Constraint-solving budgets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SolverLimits {
    /// Maximum candidate values enumerated for one flag byte during synthesis.
    ///
    /// Enumeration stops after one value beyond the bound. A bound of 0 or 1 cannot
    /// tell a unique value from a truncated one, so synthesis widens such results
    /// to `expanded_candidates`.
    pub max_candidates: usize,

    /// Candidate bound of widened enumerations and of the retry after a failed
    /// validation.
    pub expanded_candidates: usize,

    /// Maximum number of variable assignments one synthesis query may visit.
    pub max_assignments: u64,

    /// Assignment budget a synthesis query is retried with once it exceeds
    /// `max_assignments`. Also the budget of the retry after a failed validation.
    pub expanded_assignments: u64,
}

/// Leak classification thresholds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClassifierConfig {
    /// Leaks over more flag bytes than this are classified UNRESOLVED.
    pub max_flag_bytes: usize,

    /// Confidence lost per expression level beyond the first.
    pub depth_penalty: f64,

    /// Descriptors below this confidence are never selected for synthesis.
    pub min_confidence: f64,
}

/// Input-probing budget.
///
/// Probing varies one concrete input byte at a time to find the byte that selects
/// which flag offset the target discloses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Whether probing runs at all.
    pub enabled: bool,

    /// Maximum input positions tried when looking for the probe position.
    pub max_positions: usize,

    /// Maximum symbolic re-traces spent on probing overall.
    pub max_runs: usize,
}

/// Validation policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidationConfig {
    /// Minimum number of covered offsets replayed. First, midpoint and last are
    /// always among them.
    pub samples: usize,

    /// Replays per sampled offset, each under a distinct environment seed.
    pub repetitions: usize,

    /// Whether a failed validation triggers one retry from fresh traces.
    pub retry: bool,
}

impl Default for AnalysisConfig {
    /// Creates the default configuration.
    ///
    /// See the struct documentation for default values.
    fn default() -> Self {
        Self {
            limits: ExecutionLimits::default(),
            solver: SolverLimits::default(),
            classifier: ClassifierConfig::default(),
            probing: ProbeConfig::default(),
            validation: ValidationConfig::default(),
            seed: 0,
        }
    }
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_steps: 10_000_000,
            timeout_ms: 60_000, // 1 minute
        }
    }
}

impl Default for SolverLimits {
    fn default() -> Self {
        Self {
            max_candidates: 16,
            expanded_candidates: 256,
            max_assignments: 1 << 16,
            expanded_assignments: 1 << 24,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            max_flag_bytes: 2,
            depth_penalty: 0.05,
            min_confidence: 0.3,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_positions: 64,
            max_runs: 4096,
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            samples: 3,
            repetitions: 2,
            retry: true,
        }
    }
}

impl AnalysisConfig {
    /// Creates a configuration with small budgets for high-volume triage.
    ///
    /// # Settings
    ///
    /// - **Step limit**: 100 000, 5 second timeout
    /// - **Probing**: 16 positions, 1024 runs
    /// - **Validation**: 3 samples, one replay each
    #[must_use]
    pub fn fast() -> Self {
        Self {
            limits: ExecutionLimits {
                max_steps: 100_000,
                timeout_ms: 5_000,
            },
            probing: ProbeConfig {
                max_positions: 16,
                max_runs: 1024,
                ..Default::default()
            },
            validation: ValidationConfig {
                repetitions: 1,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Creates a configuration with large budgets for a single target.
    ///
    /// # Settings
    ///
    /// - **Step limit**: 50 million, 5 minute timeout
    /// - **Solver**: 64 candidates (4096 on retry), three free bytes per query (four
    ///   on retry)
    /// - **Classifier**: leaks over up to three flag bytes are synthesized
    /// - **Probing**: 512 positions, 65 536 runs
    /// - **Validation**: 8 samples, three replays each
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            limits: ExecutionLimits {
                max_steps: 50_000_000,
                timeout_ms: 300_000,
            },
            solver: SolverLimits {
                max_candidates: 64,
                expanded_candidates: 4096,
                max_assignments: 1 << 24,
                expanded_assignments: 1 << 32,
            },
            classifier: ClassifierConfig {
                max_flag_bytes: 3,
                ..Default::default()
            },
            probing: ProbeConfig {
                enabled: true,
                max_positions: 512,
                max_runs: 1 << 16,
            },
            validation: ValidationConfig {
                samples: 8,
                repetitions: 3,
                retry: true,
            },
            ..Default::default()
        }
    }

    /// Sets the execution limits.
    #[must_use]
    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the environment seed of the detection runs.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the candidate bound of the first synthesis attempt.
    #[must_use]
    pub fn with_max_candidates(mut self, max: usize) -> Self {
        self.solver.max_candidates = max;
        self
    }

    /// Sets the assignment budgets of first and widened synthesis queries.
    #[must_use]
    pub fn with_assignment_budgets(mut self, max: u64, expanded: u64) -> Self {
        self.solver.max_assignments = max;
        self.solver.expanded_assignments = expanded;
        self
    }

    /// Sets the minimum confidence of a descriptor selected for synthesis.
    #[must_use]
    pub fn with_min_confidence(mut self, confidence: f64) -> Self {
        self.classifier.min_confidence = confidence;
        self
    }

    /// Enables or disables input probing.
    #[must_use]
    pub fn with_probing(mut self, enabled: bool) -> Self {
        self.probing.enabled = enabled;
        self
    }

    /// Sets the validation policy.
    #[must_use]
    pub fn with_validation(mut self, validation: ValidationConfig) -> Self {
        self.validation = validation;
        self
    }
}

impl ExecutionLimits {
    /// Creates default execution limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum step count.
    ///
    /// # Arguments
    ///
    /// * `max` - Maximum engine steps (0 for unlimited)
    ///
    /// # Returns
    ///
    /// Returns `self` for method chaining.
    #[must_use]
    pub fn with_max_steps(mut self, max: u64) -> Self {
        self.max_steps = max;
        self
    }

    /// Sets the execution timeout in milliseconds.
    ///
    /// # Arguments
    ///
    /// * `ms` - Timeout in milliseconds (0 for no timeout)
    ///
    /// # Returns
    ///
    /// Returns `self` for method chaining.
    #[must_use]
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    /// The timeout as a [`Duration`], `None` when unlimited.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    /// Returns `true` if `steps` exceeds the step limit.
    #[must_use]
    pub fn steps_exceeded(&self, steps: u64) -> bool {
        self.max_steps > 0 && steps > self.max_steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AnalysisConfig::default();
        assert_eq!(config.limits.max_steps, 10_000_000);
        assert_eq!(config.solver.max_candidates, 16);
        assert_eq!(config.solver.max_assignments, 65_536);
        assert_eq!(config.solver.expanded_assignments, 1 << 24);
        assert_eq!(config.classifier.max_flag_bytes, 2);
        assert!(config.probing.enabled);
        assert_eq!(config.validation.samples, 3);
        assert!(config.validation.retry);
    }

    #[test]
    fn test_presets_scale_budgets() {
        let fast = AnalysisConfig::fast();
        let thorough = AnalysisConfig::thorough();
        assert!(fast.limits.max_steps < thorough.limits.max_steps);
        assert!(fast.probing.max_runs < thorough.probing.max_runs);
        assert!(thorough.solver.expanded_candidates > thorough.solver.max_candidates);
        assert!(thorough.solver.expanded_assignments > thorough.solver.max_assignments);
        assert_eq!(thorough.classifier.max_flag_bytes, 3);
    }

    #[test]
    fn test_limits() {
        let limits = ExecutionLimits::new().with_max_steps(10).with_timeout_ms(0);
        assert_eq!(limits.timeout(), None);
        assert!(!limits.steps_exceeded(10));
        assert!(limits.steps_exceeded(11));

        let unlimited = ExecutionLimits::new().with_max_steps(0);
        assert!(!unlimited.steps_exceeded(u64::MAX));
        assert_eq!(
            ExecutionLimits::default().timeout(),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_builders() {
        let config = AnalysisConfig::default()
            .with_max_candidates(4)
            .with_min_confidence(0.9)
            .with_probing(false)
            .with_assignment_budgets(256, 65_536);
        assert_eq!(config.solver.max_candidates, 4);
        assert_eq!(config.solver.max_assignments, 256);
        assert_eq!(config.solver.expanded_assignments, 65_536);
        assert!((config.classifier.min_confidence - 0.9).abs() < f64::EPSILON);
        assert!(!config.probing.enabled);
    }
}
