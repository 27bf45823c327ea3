//! Analysis context shared by the pipeline stages.
//!
//! The [`AnalysisContext`] bundles the collaborators every stage may need: the
//! execution engine standing in for the target, the constraint solver and the
//! configuration. Stages receive it explicitly; there is no process-wide state, so
//! any number of sessions can run side by side.

use crate::{
    config::AnalysisConfig,
    engine::ExecutionEngine,
    solver::Solver,
    trace::{FlagRegion, TraceRunner},
    Stage,
};

/// Borrowed handles to the engine, the solver and the configuration of one session.
#[derive(Clone, Copy)]
pub struct AnalysisContext<'a> {
    /// The target, behind its execution engine.
    pub engine: &'a dyn ExecutionEngine,
    /// The constraint solver.
    pub solver: &'a dyn Solver,
    /// Budgets and thresholds.
    pub config: &'a AnalysisConfig,
}

impl<'a> AnalysisContext<'a> {
    /// Creates a context.
    #[must_use]
    pub fn new(
        engine: &'a dyn ExecutionEngine,
        solver: &'a dyn Solver,
        config: &'a AnalysisConfig,
    ) -> Self {
        Self {
            engine,
            solver,
            config,
        }
    }

    /// A trace runner for `flag` with the configured limits and seed, attributing
    /// failures to `stage`.
    #[must_use]
    pub fn runner(&self, flag: FlagRegion, stage: Stage) -> TraceRunner<'a> {
        TraceRunner::new(self.engine, flag, self.config.limits)
            .with_seed(self.config.seed)
            .for_stage(stage)
    }
}

impl std::fmt::Debug for AnalysisContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisContext")
            .field("solver", &self.solver.name())
            .field("config", self.config)
            .finish_non_exhaustive()
    }
}
