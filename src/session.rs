//! The analysis session driving the pipeline.
//!
//! A [`LeakAnalysis`] wires the stages together for one target and one input:
//!
//! ```text
//! TraceRunner (concrete) -> TraceRunner (symbolic) -> LeakLocator -> LeakClassifier
//!     -> ExploitSynthesizer -> Validator
//! ```
//!
//! It owns the local recoveries of the pipeline. When validation fails, the session
//! starts over from fresh traces, synthesizes again with the expanded solver bounds,
//! and validates once more. When symbolic synthesis still yields nothing, verbatim
//! flag runs found by a concrete scan are validated as a last resort.
//!
//! # Examples
//!
//! ```rust
//! use leakscope::prelude::*;
//!
//! // A target that prints every byte of a four-byte flag, xored with 0x42
//! let mut asm = ProgramAssembler::new();
//! for offset in 0..4 {
//!     asm.imm(Reg(1), offset)
//!         .load(Reg(0), 0x4347_c000, Reg(1))
//!         .xor_imm(Reg(0), Reg(0), 0x42)
//!         .emit(ChannelId::STDOUT, Reg(0));
//! }
//! asm.halt();
//! let target = SimMachine::new(asm.finish()?, 0x4347_c000, b"ctf!".to_vec());
//!
//! let flag = FlagRegion::new(0x4347_c000, 4)?;
//! let truth = FlagGroundTruth::new(&flag, b"ctf!".to_vec())?;
//! let solver = EnumerativeSolver::default();
//! let config = AnalysisConfig::default();
//!
//! let analysis = LeakAnalysis::new(&target, &solver, &config, flag, b"AAAA".to_vec());
//! let artifact = analysis.exploit(&truth)?;
//! assert!(artifact.is_validated());
//! assert_eq!(artifact.covered_offsets(), vec![0, 1, 2, 3]);
//! # Ok::<(), leakscope::Error>(())
//! ```

use log::{debug, info, warn};
use rayon::prelude::*;

use crate::{
    config::AnalysisConfig,
    context::AnalysisContext,
    engine::ExecutionEngine,
    exploit::{verbatim_template, ExploitArtifact, ExploitSynthesizer, ExploitTemplate, Validator},
    leak::{ByteDependency, ConcreteScan, LeakClassifier, LeakDescriptor, LeakLocator, NaiveLeak},
    solver::Solver,
    trace::{ExecutionTrace, FlagGroundTruth, FlagMode, FlagRegion},
    Error, Result, Stage,
};

/// Everything one detection pass found.
#[derive(Debug, Clone)]
pub struct LeakReport {
    concrete: ExecutionTrace,
    symbolic: ExecutionTrace,
    dependencies: Vec<ByteDependency>,
    descriptors: Vec<LeakDescriptor>,
    min_confidence: f64,
}

impl LeakReport {
    /// The concrete run.
    #[must_use]
    pub fn concrete(&self) -> &ExecutionTrace {
        &self.concrete
    }

    /// The symbolic run.
    #[must_use]
    pub fn symbolic(&self) -> &ExecutionTrace {
        &self.symbolic
    }

    /// Every flag-dependent output byte, by (channel, position).
    #[must_use]
    pub fn dependencies(&self) -> &[ByteDependency] {
        &self.dependencies
    }

    /// Classified leaks in selection order.
    #[must_use]
    pub fn descriptors(&self) -> &[LeakDescriptor] {
        &self.descriptors
    }

    /// The leak selected for synthesis, if any is exploitable.
    #[must_use]
    pub fn best(&self) -> Option<&LeakDescriptor> {
        self.exploitable().next()
    }

    /// The exploitable leaks in selection order.
    pub fn exploitable(&self) -> impl Iterator<Item = &LeakDescriptor> {
        let min_confidence = self.min_confidence;
        self.descriptors
            .iter()
            .filter(move |descriptor| descriptor.is_exploitable(min_confidence))
    }
}

/// One target and input under analysis.
pub struct LeakAnalysis<'a> {
    context: AnalysisContext<'a>,
    flag: FlagRegion,
    input: Vec<u8>,
}

impl<'a> LeakAnalysis<'a> {
    /// Creates a session for `engine` run with `input`.
    #[must_use]
    pub fn new(
        engine: &'a dyn ExecutionEngine,
        solver: &'a dyn Solver,
        config: &'a AnalysisConfig,
        flag: FlagRegion,
        input: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            context: AnalysisContext::new(engine, solver, config),
            flag,
            input: input.into(),
        }
    }

    /// The session's collaborators.
    #[must_use]
    pub fn context(&self) -> &AnalysisContext<'a> {
        &self.context
    }

    /// The flag region under analysis.
    #[must_use]
    pub fn flag(&self) -> FlagRegion {
        self.flag
    }

    /// The base input.
    #[must_use]
    pub fn input(&self) -> &[u8] {
        &self.input
    }

    /// Traces the target in both modes, then locates and classifies its leaks.
    ///
    /// # Errors
    ///
    /// - [`Error::NoLeak`] if no output byte depends on the flag
    /// - [`Error::Timeout`] or [`Error::ExecutionError`] if a run fails
    /// - [`Error::ExecutionError`] if the runs disagree on the output layout
    pub fn detect(&self) -> Result<LeakReport> {
        let runner = self.context.runner(self.flag, Stage::TraceRunner);
        let concrete = runner.run(&self.input, FlagMode::Concrete)?;
        let symbolic = runner.run(&self.input, FlagMode::Symbolic)?;

        if concrete.layout() != symbolic.layout() {
            return Err(Error::ExecutionError {
                stage: Stage::TraceRunner,
                message: format!(
                    "concrete output {:?} and symbolic output {:?} differ in layout",
                    concrete.layout(),
                    symbolic.layout()
                ),
            });
        }

        let dependencies = LeakLocator::new().locate(&symbolic)?;
        let descriptors =
            LeakClassifier::new(self.context.config.classifier).classify_all(&dependencies);

        let report = LeakReport {
            concrete,
            symbolic,
            dependencies,
            descriptors,
            min_confidence: self.context.config.classifier.min_confidence,
        };
        match report.best() {
            Some(best) => info!("selected {best}"),
            None => info!("{} leaks, none exploitable", report.descriptors.len()),
        }
        Ok(report)
    }

    /// Synthesizes a template for the report's selected leak.
    ///
    /// # Errors
    ///
    /// [`Error::Unsynthesizable`] if no leak is exploitable (carrying the first
    /// descriptor) or the selected one cannot be reproduced.
    pub fn synthesize(&self, report: &LeakReport) -> Result<ExploitTemplate> {
        let limits = self.context.config.solver;
        self.synthesize_with(report, limits.max_candidates, limits.max_assignments)
    }

    /// Runs the full pipeline and validates against `truth`, retrying once with
    /// fresh traces and expanded bounds when validation fails.
    ///
    /// If the symbolic pipeline finds no leak, no reproducible leak, or no exploit
    /// that validates, the verbatim flag runs of [`LeakAnalysis::naive_scan`] are
    /// turned into a template and validated instead.
    ///
    /// # Errors
    ///
    /// - [`Error::NoLeak`] if the target does not leak for this input
    /// - [`Error::Unsynthesizable`] if no leak can be reproduced
    /// - [`Error::ValidationFailed`] if the exploit does not reproduce
    /// - [`Error::Timeout`] or [`Error::ExecutionError`] if a run fails
    pub fn exploit(&self, truth: &FlagGroundTruth) -> Result<ExploitArtifact> {
        let validator = Validator::new(self.context, self.flag);
        match self.symbolic_exploit(&validator, truth) {
            Err(
                err @ (Error::NoLeak
                | Error::Unsynthesizable { .. }
                | Error::ValidationFailed { .. }),
            ) => match self.verbatim_exploit(&validator, truth) {
                Ok(Some(artifact)) => Ok(artifact),
                Ok(None) => Err(err),
                Err(fallback) => {
                    debug!("verbatim fallback failed: {fallback}");
                    Err(err)
                }
            },
            result => result,
        }
    }

    fn symbolic_exploit(
        &self,
        validator: &Validator<'_>,
        truth: &FlagGroundTruth,
    ) -> Result<ExploitArtifact> {
        let report = self.detect()?;
        let template = self.synthesize(&report)?;
        let artifact = validator.validate(template, truth)?;
        if artifact.is_validated() {
            return Ok(artifact);
        }

        let mut failed = (report, artifact);
        if self.context.config.validation.retry {
            warn!(
                "exploit did not reproduce ({} mismatches), retrying with fresh traces",
                failed.1.mismatches().len()
            );
            let report = self.detect()?;
            let limits = self.context.config.solver;
            let template = self.synthesize_with(
                &report,
                limits.expanded_candidates,
                limits.expanded_assignments,
            )?;
            let artifact = validator.validate(template, truth)?;
            if artifact.is_validated() {
                return Ok(artifact);
            }
            failed = (report, artifact);
        }

        let (report, artifact) = failed;
        let descriptor = report
            .best()
            .cloned()
            .ok_or_else(|| invalid_input!("validated report has no selected leak"))?;
        Err(Error::ValidationFailed {
            descriptor: Box::new(descriptor),
            mismatches: artifact.mismatches().to_vec(),
        })
    }

    /// Validates a template built from verbatim flag runs, if there are any.
    fn verbatim_exploit(
        &self,
        validator: &Validator<'_>,
        truth: &FlagGroundTruth,
    ) -> Result<Option<ExploitArtifact>> {
        let runs = self.naive_scan(truth)?;
        let Some(template) = verbatim_template(&self.input, &runs) else {
            return Ok(None);
        };
        warn!(
            "symbolic synthesis yielded no exploit, validating {} verbatim runs",
            runs.len()
        );
        let artifact = validator.validate(template, truth)?;
        Ok(artifact.is_validated().then_some(artifact))
    }

    /// Searches the concrete output for verbatim flag runs, using two seeds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] or [`Error::ExecutionError`] if a run fails.
    pub fn naive_scan(&self, truth: &FlagGroundTruth) -> Result<Vec<NaiveLeak>> {
        let seed = self.context.config.seed;
        ConcreteScan::new(self.context.runner(self.flag, Stage::TraceRunner)).scan(
            &self.input,
            truth,
            &[seed, seed.wrapping_add(1)],
        )
    }

    fn synthesize_with(
        &self,
        report: &LeakReport,
        max_candidates: usize,
        max_assignments: u64,
    ) -> Result<ExploitTemplate> {
        let Some(best) = report.best() else {
            let first = report.descriptors.first().ok_or(Error::NoLeak)?;
            return Err(Error::Unsynthesizable {
                descriptor: Box::new(first.clone()),
                reason: format!(
                    "no exploitable leak among {} candidates",
                    report.descriptors.len()
                ),
            });
        };

        ExploitSynthesizer::new(
            self.context,
            self.flag,
            &self.input,
            &report.concrete,
            &report.dependencies,
            &report.descriptors,
        )
        .with_bounds(max_candidates, max_assignments)
        .synthesize(best)
    }
}

/// One independent target for [`analyze_batch`].
pub struct AnalysisJob<'a> {
    /// The target.
    pub engine: &'a dyn ExecutionEngine,
    /// Its flag region.
    pub flag: FlagRegion,
    /// The base input.
    pub input: Vec<u8>,
    /// The real flag content, for validation.
    pub truth: FlagGroundTruth,
}

/// Runs [`LeakAnalysis::exploit`] for every job in parallel.
///
/// Sessions share only the solver and the configuration, both read-only. Results
/// are returned in job order.
#[must_use]
pub fn analyze_batch(
    jobs: &[AnalysisJob<'_>],
    solver: &dyn Solver,
    config: &AnalysisConfig,
) -> Vec<Result<ExploitArtifact>> {
    jobs.par_iter()
        .map(|job| {
            LeakAnalysis::new(job.engine, solver, config, job.flag, job.input.clone())
                .exploit(&job.truth)
        })
        .collect()
}
