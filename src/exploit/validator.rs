//! Replaying templates against the target.
//!
//! Validation needs ground truth: for each sampled offset the validator builds the
//! route's input, runs the target concretely, and checks two things: the output
//! byte matches what the route's expression predicts for the real flag, and the
//! route's recovery turns that output back into the real flag byte. Each sample is
//! replayed under several environment seeds, which is what exposes targets whose
//! output also depends on a per-run challenge.

use std::fmt;

use log::{debug, warn};

use crate::{
    context::AnalysisContext,
    exploit::{ExploitArtifact, ExploitTemplate, ValidationStatus},
    trace::{FlagGroundTruth, FlagMode, FlagRegion},
    Result, Stage,
};

/// One replay that did not reproduce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    /// The sampled flag offset.
    pub offset: u32,
    /// Environment seed of the replay.
    pub seed: u64,
    /// Output byte predicted from the ground truth.
    pub expected: Option<u8>,
    /// Output byte observed, `None` if the output was too short.
    pub observed: Option<u8>,
    /// Flag byte recovered from the observation.
    pub recovered: Option<u8>,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let byte = |value: Option<u8>| value.map_or_else(|| "--".to_string(), |v| format!("{v:02x}"));
        write!(
            f,
            "flag[{}] seed {}: expected {}, observed {}, recovered {}",
            self.offset,
            self.seed,
            byte(self.expected),
            byte(self.observed),
            byte(self.recovered)
        )
    }
}

/// Replays [`ExploitTemplate`] routes against the target.
pub struct Validator<'a> {
    context: AnalysisContext<'a>,
    flag: FlagRegion,
}

impl<'a> Validator<'a> {
    /// Creates a validator for the target behind `context`.
    #[must_use]
    pub fn new(context: AnalysisContext<'a>, flag: FlagRegion) -> Self {
        Self { context, flag }
    }

    /// Replays sampled routes of `template` and records the outcome.
    ///
    /// Mismatches are recorded in the returned artifact, not reported as errors.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Timeout`] or [`crate::Error::ExecutionError`] if a
    /// replay fails to run, and solver failures of solver-backed recoveries.
    pub fn validate(
        &self,
        template: ExploitTemplate,
        truth: &FlagGroundTruth,
    ) -> Result<ExploitArtifact> {
        let settings = self.context.config.validation;
        let runner = self.context.runner(self.flag, Stage::Validator);
        let samples = sample_offsets(&template.covered_offsets(), settings.samples);

        let mut mismatches = Vec::new();
        for offset in &samples {
            let route = template.route(*offset)?;
            let input = template.build_input_for_offset(*offset)?;
            let expected = route.expected_output(truth.bytes());

            for repetition in 0..settings.repetitions.max(1) {
                let seed = self.context.config.seed.wrapping_add(repetition as u64);
                let trace = runner.run_seeded(&input, FlagMode::Concrete, seed)?;
                let output = trace.channel_output(template.channel());
                let observed = output.get(route.position).copied();
                let recovered = route.recover(*offset, &output, self.context.solver)?;

                if observed.is_none() || observed != expected || recovered != truth.byte(*offset) {
                    mismatches.push(Mismatch {
                        offset: *offset,
                        seed,
                        expected,
                        observed,
                        recovered,
                    });
                }
            }
        }

        let status = if mismatches.is_empty() {
            debug!("validated flag offsets {samples:?}");
            ValidationStatus::Validated { samples }
        } else {
            for mismatch in &mismatches {
                warn!("replay mismatch: {mismatch}");
            }
            ValidationStatus::Unvalidated { mismatches }
        };
        Ok(ExploitArtifact::new(template, self.flag, status))
    }
}

/// Picks the offsets to replay: first, middle and last, then more spread evenly
/// until `samples` are chosen or every offset is.
#[must_use]
pub fn sample_offsets(covered: &[u32], samples: usize) -> Vec<u32> {
    let Some(last) = covered.len().checked_sub(1) else {
        return Vec::new();
    };

    let mut indices = vec![0, last / 2, last];
    let wanted = samples.min(covered.len());
    if wanted > 3 {
        indices.extend((0..wanted).map(|i| i * last / (wanted - 1)));
    }
    indices.sort_unstable();
    indices.dedup();

    let mut chosen = indices.len();
    let mut next = 0;
    while chosen < wanted && next < covered.len() {
        if !indices.contains(&next) {
            indices.push(next);
            chosen += 1;
        }
        next += 1;
    }
    indices.sort_unstable();

    indices.into_iter().map(|index| covered[index]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::ExecutionEngine,
        exploit::ExploitSynthesizer,
        leak::{LeakClassifier, LeakLocator},
        solver::EnumerativeSolver,
        test::{region_for, targets, test_config, truth_for, DEADBEEF},
        trace::TraceRunner,
    };

    #[test]
    fn test_sample_offsets() {
        assert!(sample_offsets(&[], 3).is_empty());
        assert_eq!(sample_offsets(&[7], 3), vec![7]);
        assert_eq!(sample_offsets(&[0, 1, 2, 3], 3), vec![0, 1, 3]);
        assert_eq!(sample_offsets(&[0, 1, 2, 3, 4, 5, 6, 7, 8], 5), vec![0, 2, 4, 6, 8]);
        assert_eq!(sample_offsets(&[4, 5], 8), vec![4, 5]);
    }

    // Helper function to synthesize and validate a target in one go
    fn validate(engine: &dyn ExecutionEngine, flag: &[u8]) -> ExploitArtifact {
        let config = test_config();
        let solver = EnumerativeSolver::default();
        let runner = TraceRunner::new(engine, region_for(flag), config.limits);
        let concrete = runner.run(b"", FlagMode::Concrete).unwrap();
        let symbolic = runner.run(b"", FlagMode::Symbolic).unwrap();
        let dependencies = LeakLocator::new().locate(&symbolic).unwrap();
        let descriptors = LeakClassifier::new(config.classifier).classify_all(&dependencies);

        let context = AnalysisContext::new(engine, &solver, &config);
        let template = ExploitSynthesizer::new(
            context,
            region_for(flag),
            b"",
            &concrete,
            &dependencies,
            &descriptors,
        )
        .synthesize(&descriptors[0])
        .unwrap();
        Validator::new(context, region_for(flag))
            .validate(template, &truth_for(flag))
            .unwrap()
    }

    #[test]
    fn test_verbatim_copy_validates() {
        let engine = targets::verbatim_copy(&DEADBEEF);
        let artifact = validate(&engine, &DEADBEEF);
        assert!(artifact.is_validated());
        assert_eq!(
            artifact.status(),
            &ValidationStatus::Validated {
                samples: vec![0, 1, 3]
            }
        );
    }

    #[test]
    fn test_hex_leak_validates() {
        let engine = targets::hex_leak(&DEADBEEF);
        let artifact = validate(&engine, &DEADBEEF);
        assert!(artifact.is_validated());
    }

    #[test]
    fn test_challenge_response_detected() {
        let engine = targets::challenge_response(&DEADBEEF);
        let artifact = validate(&engine, &DEADBEEF);
        assert!(!artifact.is_validated());
        assert!(artifact.mismatches().iter().all(|m| m.seed == 1));
        assert!(!artifact.mismatches().is_empty());
    }

    #[test]
    fn test_wrong_ground_truth_detected() {
        let engine = targets::verbatim_copy(&DEADBEEF);
        let config = test_config();
        let solver = EnumerativeSolver::default();
        let context = AnalysisContext::new(&engine, &solver, &config);
        let artifact = validate(&engine, &DEADBEEF);

        let wrong = truth_for(b"\xde\xad\xbe\x00");
        let replayed = Validator::new(context, region_for(&DEADBEEF))
            .validate(artifact.template().clone(), &wrong)
            .unwrap();
        let mismatches = replayed.mismatches();
        assert_eq!(mismatches.len(), 2);
        assert!(mismatches.iter().all(|m| m.offset == 3));
        assert_eq!(mismatches[0].expected, Some(0x00));
        assert_eq!(mismatches[0].observed, Some(0xef));
    }
}
