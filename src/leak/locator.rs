use log::{debug, info};

use crate::{
    expr::ExprFlags,
    leak::ByteDependency,
    trace::{ExecutionTrace, FlagMode},
    Error, Result,
};

/// Finds the output bytes of a symbolic trace that depend on the flag region.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeakLocator;

impl LeakLocator {
    /// Creates a locator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Returns every flag-dependent output byte, ordered by (channel, position).
    ///
    /// # Errors
    ///
    /// - [`Error::NoLeak`] if no output byte depends on the flag
    /// - [`Error::InvalidInput`] if `trace` is not a symbolic trace
    pub fn locate(&self, trace: &ExecutionTrace) -> Result<Vec<ByteDependency>> {
        if trace.mode() != FlagMode::Symbolic {
            return Err(invalid_input!("leaks can only be located in a symbolic trace"));
        }

        let dependencies = self.collect(trace);
        if dependencies.is_empty() {
            debug!("no output byte depends on the flag");
            return Err(Error::NoLeak);
        }

        info!(
            "{} output bytes depend on {} flag bytes",
            dependencies.len(),
            dependencies
                .iter()
                .flat_map(|dep| dep.flag_offsets.iter())
                .collect::<std::collections::BTreeSet<_>>()
                .len()
        );
        Ok(dependencies)
    }

    /// Like [`LeakLocator::locate`], but an empty result is not an error.
    #[must_use]
    pub fn collect(&self, trace: &ExecutionTrace) -> Vec<ByteDependency> {
        let arena = trace.arena();
        trace
            .symbolic_bytes()
            .into_iter()
            .filter(|byte| arena.flags(byte.expr).contains(ExprFlags::FLAG))
            .map(|byte| ByteDependency {
                channel: byte.channel,
                position: byte.position,
                step: byte.step,
                flag_offsets: arena.flag_offsets(byte.expr),
                expression: trace.expr(byte.expr),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ExecutionLimits,
        engine::ChannelId,
        test::{region_for, targets, DEADBEEF},
        trace::TraceRunner,
    };

    #[test]
    fn test_locate_verbatim() {
        let engine = targets::verbatim_copy(&DEADBEEF);
        let runner = TraceRunner::new(&engine, region_for(&DEADBEEF), ExecutionLimits::default());
        let trace = runner.run(b"AAAAAAAA", FlagMode::Symbolic).unwrap();

        let dependencies = LeakLocator::new().locate(&trace).unwrap();
        assert_eq!(dependencies.len(), 4);
        for (offset, dependency) in dependencies.iter().enumerate() {
            assert_eq!(dependency.channel, ChannelId::STDOUT);
            assert_eq!(dependency.position, offset);
            assert_eq!(dependency.single_flag_offset(), Some(offset as u32));
        }
    }

    #[test]
    fn test_no_leak() {
        let engine = targets::no_leak(&DEADBEEF);
        let runner = TraceRunner::new(&engine, region_for(&DEADBEEF), ExecutionLimits::default());
        let trace = runner.run(b"", FlagMode::Symbolic).unwrap();
        assert!(matches!(LeakLocator::new().locate(&trace), Err(Error::NoLeak)));
        assert!(LeakLocator::new().collect(&trace).is_empty());
    }

    #[test]
    fn test_multi_offset_kept_whole() {
        let engine = targets::pair_sum(&DEADBEEF);
        let runner = TraceRunner::new(&engine, region_for(&DEADBEEF), ExecutionLimits::default());
        let trace = runner.run(b"", FlagMode::Symbolic).unwrap();
        let dependencies = LeakLocator::new().locate(&trace).unwrap();
        assert_eq!(dependencies.len(), 1);
        assert_eq!(
            dependencies[0].flag_offsets.iter().copied().collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(dependencies[0].single_flag_offset(), None);
    }

    #[test]
    fn test_concrete_trace_rejected() {
        let engine = targets::verbatim_copy(&DEADBEEF);
        let runner = TraceRunner::new(&engine, region_for(&DEADBEEF), ExecutionLimits::default());
        let trace = runner.run(b"", FlagMode::Concrete).unwrap();
        assert!(matches!(
            LeakLocator::new().locate(&trace),
            Err(Error::InvalidInput { .. })
        ));
    }
}
