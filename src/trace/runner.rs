//! Running the target and checking the engine's side of the contract.

use std::time::Instant;

use log::debug;

use crate::{
    config::ExecutionLimits,
    engine::{EngineByte, EngineFault, EngineTrace, ExecutionEngine, ExecutionRequest},
    expr::ExprFlags,
    trace::{ExecutionTrace, FlagMode, FlagRegion},
    Error, Result, Stage,
};

/// Executes the target once per call, in concrete or symbolic flag mode.
///
/// The runner passes its limits to the engine and re-checks the returned trace: a
/// trace that reports more steps than allowed, or a run that took longer than the
/// timeout, is rejected even if the engine did not stop on its own. It also rejects
/// traces that break the engine contract, such as symbolic bytes in a concrete run or
/// flag variables outside the region.
///
/// # Example
///
/// ```rust,ignore
/// let runner = TraceRunner::new(&engine, flag, ExecutionLimits::default());
/// let concrete = runner.run(b"AAAAAAAA", FlagMode::Concrete)?;
/// let symbolic = runner.run(b"AAAAAAAA", FlagMode::Symbolic)?;
/// assert_eq!(concrete.layout(), symbolic.layout());
/// ```
#[derive(Clone, Copy)]
pub struct TraceRunner<'a> {
    engine: &'a dyn ExecutionEngine,
    flag: FlagRegion,
    limits: ExecutionLimits,
    seed: u64,
    stage: Stage,
}

impl<'a> TraceRunner<'a> {
    /// Creates a runner with seed 0 whose failures are attributed to tracing.
    #[must_use]
    pub fn new(engine: &'a dyn ExecutionEngine, flag: FlagRegion, limits: ExecutionLimits) -> Self {
        Self {
            engine,
            flag,
            limits,
            seed: 0,
            stage: Stage::TraceRunner,
        }
    }

    /// Sets the environment seed used by [`TraceRunner::run`].
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Attributes failures to `stage`, for runs made on behalf of a later stage.
    #[must_use]
    pub fn for_stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    /// The flag region this runner traces.
    #[must_use]
    pub fn flag(&self) -> FlagRegion {
        self.flag
    }

    /// Runs the target with the runner's seed.
    ///
    /// # Errors
    ///
    /// See [`TraceRunner::run_seeded`].
    pub fn run(&self, input: &[u8], mode: FlagMode) -> Result<ExecutionTrace> {
        self.run_seeded(input, mode, self.seed)
    }

    /// Runs the target with an explicit environment seed.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if the engine hit a limit, or the trace exceeds one
    /// - [`Error::ExecutionError`] if the target crashed or the engine broke its
    ///   contract
    pub fn run_seeded(&self, input: &[u8], mode: FlagMode, seed: u64) -> Result<ExecutionTrace> {
        let regions = match mode {
            FlagMode::Concrete => Vec::new(),
            FlagMode::Symbolic => vec![self.flag.memory()],
        };
        let request = ExecutionRequest {
            input,
            symbolic_regions: &regions,
            seed,
            limits: self.limits,
        };

        let started = Instant::now();
        let raw = self
            .engine
            .execute(&request)
            .map_err(|fault| self.fault_error(fault))?;
        let elapsed = started.elapsed();

        if let Some(timeout) = self.limits.timeout() {
            if elapsed > timeout {
                return Err(Error::Timeout {
                    stage: self.stage,
                    detail: format!("run took {elapsed:?} (limit: {timeout:?})"),
                });
            }
        }
        if self.limits.steps_exceeded(raw.steps) {
            return Err(Error::Timeout {
                stage: self.stage,
                detail: format!(
                    "trace reports {} steps (limit: {})",
                    raw.steps, self.limits.max_steps
                ),
            });
        }
        self.check_contract(&raw, mode)?;

        debug!(
            "{} run with {} input bytes, seed {}: {} steps, {} writes",
            mode,
            input.len(),
            seed,
            raw.steps,
            raw.writes.len()
        );
        Ok(ExecutionTrace::from_engine(mode, raw))
    }

    fn fault_error(&self, fault: EngineFault) -> Error {
        match fault {
            EngineFault::LimitExceeded(exceeded) => Error::Timeout {
                stage: self.stage,
                detail: exceeded.to_string(),
            },
            crash @ EngineFault::Crash { .. } => Error::ExecutionError {
                stage: self.stage,
                message: crash.to_string(),
            },
        }
    }

    fn contract_error(&self, message: String) -> Error {
        Error::ExecutionError {
            stage: self.stage,
            message: format!("engine contract violated: {message}"),
        }
    }

    fn check_contract(&self, raw: &EngineTrace, mode: FlagMode) -> Result<()> {
        for write in &raw.writes {
            for byte in &write.bytes {
                let EngineByte::Symbolic(id) = byte else {
                    continue;
                };
                if mode == FlagMode::Concrete {
                    return Err(self.contract_error(format!(
                        "symbolic byte on {} in a concrete run",
                        write.channel
                    )));
                }
                if !raw.arena.contains(*id) {
                    return Err(self.contract_error(format!("unknown expression {id}")));
                }
                if !raw.arena.flags(*id).contains(ExprFlags::FLAG) {
                    continue;
                }
                if let Some(outside) = raw
                    .arena
                    .flag_offsets(*id)
                    .into_iter()
                    .find(|offset| !self.flag.contains_offset(*offset))
                {
                    return Err(self.contract_error(format!(
                        "flag offset {} outside a region of {} bytes",
                        outside,
                        self.flag.len()
                    )));
                }
            }
        }
        Ok(())
    }
}
