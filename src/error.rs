//! Failure classes the pipeline needs to tell apart.
//!
//! Most errors are plain `anyhow` chains. The variants here are raised where a
//! caller (or a test) must distinguish a capacity problem from a device
//! timeout, an interruption, or a failed final check.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("administrative privileges are required (run as root)")]
    NotRoot,

    #[error("missing required host tools: {}", .0.join(", "))]
    MissingTools(Vec<String>),

    #[error("layout needs {required} bytes but the destination holds only {available} bytes")]
    Capacity { required: u64, available: u64 },

    #[error("home partition would be {available} bytes, below the {floor} byte floor")]
    HomeBelowFloor { available: u64, floor: u64 },

    #[error("root content is {content} bytes but the root partition is only {partition} bytes")]
    RootContentTooLarge { content: u64, partition: u64 },

    #[error("invalid partition plan: {0}")]
    InvalidPlan(String),

    #[error("partition {number} of {} did not appear after {attempts} attempts", disk.display())]
    DeviceNodeTimeout {
        disk: PathBuf,
        number: u32,
        attempts: u32,
    },

    #[error("interrupted by signal")]
    Interrupted,

    #[error("final verification failed: {0}")]
    Verification(String),
}
