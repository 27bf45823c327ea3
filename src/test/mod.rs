//! Shared fixtures for unit tests.
//!
//! `targets` builds small [`SimMachine`](crate::sim::SimMachine) programs that model
//! the disclosure patterns the pipeline has to handle. All of them map their flag at
//! [`FLAG_BASE`].

pub mod targets;

use crate::{
    config::AnalysisConfig,
    trace::{FlagGroundTruth, FlagRegion},
};

/// Address of the flag page in every test target.
pub const FLAG_BASE: u64 = 0x4347_c000;

/// The four-byte flag used throughout the tests.
pub const DEADBEEF: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];

/// A sixteen-byte printable flag.
pub const LONG_FLAG: &[u8; 16] = b"flag{leaky_pipe}";

// Helper function to create the flag region of a flag
pub fn region_for(flag: &[u8]) -> FlagRegion {
    FlagRegion::new(FLAG_BASE, u32::try_from(flag.len()).unwrap()).unwrap()
}

// Helper function to bind ground truth to a flag
pub fn truth_for(flag: &[u8]) -> FlagGroundTruth {
    FlagGroundTruth::new(&region_for(flag), flag.to_vec()).unwrap()
}

// Helper function to create a configuration with small budgets
pub fn test_config() -> AnalysisConfig {
    AnalysisConfig::default().with_limits(
        crate::config::ExecutionLimits::new()
            .with_max_steps(100_000)
            .with_timeout_ms(10_000),
    )
}
