//! Execution statistics and limit checking.
//!
//! Engines count their steps in an [`ExecutionStats`] and consult
//! [`ExecutionStats::check_limits`] before every step; the trace runner applies the
//! same checks to the finished trace.

use std::{
    fmt,
    time::{Duration, Instant},
};

use crate::config::ExecutionLimits;

/// Tracks executed steps and elapsed wall-clock time of one run.
#[derive(Clone, Debug, Default)]
pub struct ExecutionStats {
    /// Number of steps executed.
    pub steps_executed: u64,

    /// Time when execution started.
    start_time: Option<Instant>,
}

impl ExecutionStats {
    /// Creates new execution statistics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the start of execution.
    pub fn start(&mut self) {
        self.start_time = Some(Instant::now());
    }

    /// Increments the step counter.
    pub fn increment_steps(&mut self) {
        self.steps_executed += 1;
    }

    /// Returns the elapsed time since execution started.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        self.start_time.map(|t| t.elapsed())
    }

    /// Checks if another step would exceed the step limit.
    #[must_use]
    pub fn step_limit_reached(&self, limits: &ExecutionLimits) -> bool {
        limits.max_steps > 0 && self.steps_executed >= limits.max_steps
    }

    /// Checks if the timeout has been exceeded.
    #[must_use]
    pub fn timeout_exceeded(&self, limits: &ExecutionLimits) -> bool {
        limits
            .timeout()
            .is_some_and(|timeout| self.elapsed().is_some_and(|e| e >= timeout))
    }

    /// Checks all limits and returns the first exceeded limit, if any.
    ///
    /// # Arguments
    ///
    /// * `limits` - The configured execution limits.
    ///
    /// # Returns
    ///
    /// The first limit that was exceeded, or `None` if all limits are within bounds.
    #[must_use]
    pub fn check_limits(&self, limits: &ExecutionLimits) -> Option<LimitExceeded> {
        if self.step_limit_reached(limits) {
            Some(LimitExceeded::Steps {
                executed: self.steps_executed,
                limit: limits.max_steps,
            })
        } else if self.timeout_exceeded(limits) {
            Some(LimitExceeded::Timeout {
                elapsed: self.elapsed().unwrap_or_default(),
                limit: Duration::from_millis(limits.timeout_ms),
            })
        } else {
            None
        }
    }
}

/// Indicates which limit was exceeded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimitExceeded {
    /// Step count limit was exceeded.
    Steps {
        /// Number of steps executed.
        executed: u64,
        /// Maximum allowed.
        limit: u64,
    },

    /// Execution timeout was exceeded.
    Timeout {
        /// Time elapsed.
        elapsed: Duration,
        /// Maximum allowed.
        limit: Duration,
    },
}

impl fmt::Display for LimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitExceeded::Steps { executed, limit } => {
                write!(f, "step limit exceeded: {executed} (limit: {limit})")
            }
            LimitExceeded::Timeout { elapsed, limit } => {
                write!(f, "timeout exceeded: {elapsed:?} (limit: {limit:?})")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_stats_new() {
        let stats = ExecutionStats::new();
        assert_eq!(stats.steps_executed, 0);
        assert!(stats.elapsed().is_none());
    }

    #[test]
    fn test_step_limit() {
        let limits = ExecutionLimits::new().with_max_steps(3);
        let mut stats = ExecutionStats::new();
        stats.start();
        for _ in 0..3 {
            assert!(stats.check_limits(&limits).is_none());
            stats.increment_steps();
        }
        assert_eq!(
            stats.check_limits(&limits),
            Some(LimitExceeded::Steps {
                executed: 3,
                limit: 3
            })
        );
    }

    #[test]
    fn test_unlimited() {
        let limits = ExecutionLimits::new().with_max_steps(0).with_timeout_ms(0);
        let mut stats = ExecutionStats::new();
        stats.start();
        stats.steps_executed = u64::MAX - 1;
        assert!(stats.check_limits(&limits).is_none());
    }

    #[test]
    fn test_limit_display() {
        let exceeded = LimitExceeded::Steps {
            executed: 5,
            limit: 4,
        };
        assert_eq!(exceeded.to_string(), "step limit exceeded: 5 (limit: 4)");
    }
}
