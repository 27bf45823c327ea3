//! Ground-truth search for verbatim flag runs in concrete output.
//!
//! This is the cheap check that does not need symbolic execution at all: when the
//! real flag is known, any stretch of output that spells out consecutive flag bytes
//! in both of two differently seeded runs is a leak. It only finds verbatim copies,
//! and it needs at least [`MIN_NAIVE_RUN`] bytes in a row to rule out coincidence.

use std::collections::{BTreeSet, HashMap};

use log::{debug, info};

use crate::{
    engine::ChannelId,
    trace::{FlagGroundTruth, FlagMode, TraceRunner},
    Result,
};

/// Shortest run of matching bytes reported by [`ConcreteScan`].
pub const MIN_NAIVE_RUN: usize = 4;

/// A verbatim copy of consecutive flag bytes in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NaiveLeak {
    /// The channel carrying the copy.
    pub channel: ChannelId,
    /// Output position of the first copied byte.
    pub position: usize,
    /// Flag offset of the first copied byte.
    pub flag_offset: u32,
    /// Number of copied bytes.
    pub len: usize,
}

/// Concrete-only leak detection against known flag content.
pub struct ConcreteScan<'a> {
    runner: TraceRunner<'a>,
}

type Match = (ChannelId, usize, u32);

impl<'a> ConcreteScan<'a> {
    /// Creates a scan that runs the target through `runner`.
    #[must_use]
    pub fn new(runner: TraceRunner<'a>) -> Self {
        Self { runner }
    }

    /// Runs the target concretely once per seed and reports the verbatim flag runs
    /// present in every run, ordered by channel, position, then flag offset.
    ///
    /// # Errors
    ///
    /// Propagates [`TraceRunner::run_seeded`] failures.
    pub fn scan(
        &self,
        input: &[u8],
        truth: &FlagGroundTruth,
        seeds: &[u64],
    ) -> Result<Vec<NaiveLeak>> {
        let mut by_value: HashMap<u8, Vec<u32>> = HashMap::new();
        for (offset, byte) in (0u32..).zip(truth.bytes()) {
            by_value.entry(*byte).or_default().push(offset);
        }

        let mut common: Option<BTreeSet<Match>> = None;
        for seed in seeds {
            let trace = self.runner.run_seeded(input, FlagMode::Concrete, *seed)?;
            let mut matches = BTreeSet::new();
            for channel in trace.channels() {
                for (position, byte) in trace.channel_output(channel).iter().enumerate() {
                    for offset in by_value.get(byte).into_iter().flatten() {
                        matches.insert((channel, position, *offset));
                    }
                }
            }
            common = Some(match common {
                Some(previous) => previous.intersection(&matches).copied().collect(),
                None => matches,
            });
        }

        let leaks = maximal_runs(&common.unwrap_or_default());
        if leaks.is_empty() {
            debug!("no verbatim flag run in {} concrete runs", seeds.len());
        } else {
            info!("{} verbatim flag runs in concrete output", leaks.len());
        }
        Ok(leaks)
    }
}

fn maximal_runs(matches: &BTreeSet<Match>) -> Vec<NaiveLeak> {
    let mut leaks = Vec::new();
    for &(channel, position, offset) in matches {
        let continues = position > 0
            && offset > 0
            && matches.contains(&(channel, position - 1, offset - 1));
        if continues {
            continue;
        }

        let mut len = 1;
        while u32::try_from(len)
            .ok()
            .and_then(|step| offset.checked_add(step))
            .is_some_and(|next| matches.contains(&(channel, position + len, next)))
        {
            len += 1;
        }

        if len >= MIN_NAIVE_RUN {
            leaks.push(NaiveLeak {
                channel,
                position,
                flag_offset: offset,
                len,
            });
        }
    }
    leaks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ExecutionLimits,
        test::{region_for, targets, truth_for, DEADBEEF, LONG_FLAG},
    };

    #[test]
    fn test_verbatim_run_found() {
        let engine = targets::verbatim_copy(LONG_FLAG);
        let runner = TraceRunner::new(&engine, region_for(LONG_FLAG), ExecutionLimits::default());
        let leaks = ConcreteScan::new(runner)
            .scan(b"", &truth_for(LONG_FLAG), &[0, 1])
            .unwrap();
        assert!(leaks.contains(&NaiveLeak {
            channel: ChannelId::STDOUT,
            position: 0,
            flag_offset: 0,
            len: 16,
        }));
    }

    #[test]
    fn test_transformed_output_not_found() {
        let engine = targets::xor_key(LONG_FLAG, 0x42);
        let runner = TraceRunner::new(&engine, region_for(LONG_FLAG), ExecutionLimits::default());
        let leaks = ConcreteScan::new(runner)
            .scan(b"", &truth_for(LONG_FLAG), &[0, 1])
            .unwrap();
        assert!(leaks.is_empty());
    }

    #[test]
    fn test_seed_dependent_output_dropped() {
        let engine = targets::challenge_response(&DEADBEEF);
        let runner = TraceRunner::new(&engine, region_for(&DEADBEEF), ExecutionLimits::default());
        let leaks = ConcreteScan::new(runner)
            .scan(b"", &truth_for(&DEADBEEF), &[0, 1])
            .unwrap();
        assert!(leaks.is_empty());
    }

    #[test]
    fn test_short_runs_ignored() {
        let mut matches = BTreeSet::new();
        for index in 0..3 {
            matches.insert((ChannelId::STDOUT, 10 + index, 5 + index as u32));
        }
        assert!(maximal_runs(&matches).is_empty());

        matches.insert((ChannelId::STDOUT, 13, 8));
        let runs = maximal_runs(&matches);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].position, 10);
        assert_eq!(runs[0].len, 4);
    }
}
