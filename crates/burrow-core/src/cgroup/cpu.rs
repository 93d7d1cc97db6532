//! CPU resource control via cgroups v2.
//!
//! Manages `cpu.weight`, converting classic `cpu.shares` values.

use std::path::Path;

use burrow_common::error::{BurrowError, Result};
use burrow_common::types::ResourceConfig;

use super::Subsystem;

/// Smallest accepted `cpu.shares` value.
pub const MIN_SHARES: u64 = 2;
/// Largest accepted `cpu.shares` value.
pub const MAX_SHARES: u64 = 262_144;

/// Writes the CPU weight of a group.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuSubsystem;

impl Subsystem for CpuSubsystem {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn set(&self, group: &Path, config: &ResourceConfig) -> Result<()> {
        match parse_cpu_share(&config.cpu_share)? {
            Some(shares) => set_cpu_weight(group, shares_to_weight(shares)),
            None => Ok(()),
        }
    }
}

/// Sets the CPU weight for a cgroup.
///
/// Weight is a value between 1 and 10000 that controls the relative
/// share of CPU time this cgroup receives under contention.
///
/// # Errors
///
/// Returns an error if writing to `cpu.weight` fails.
pub fn set_cpu_weight(cgroup_path: &Path, weight: u64) -> Result<()> {
    let file = cgroup_path.join("cpu.weight");
    std::fs::write(&file, weight.to_string()).map_err(|e| BurrowError::io(&file, e))?;
    tracing::debug!(weight, "CPU weight set");
    Ok(())
}

/// Parses a `cpu.shares` value. An empty string means unlimited.
///
/// # Errors
///
/// Returns an error if the value is not an integer in `2..=262144`.
pub fn parse_cpu_share(s: &str) -> Result<Option<u64>> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(None);
    }
    match s.parse::<u64>() {
        Ok(n) if (MIN_SHARES..=MAX_SHARES).contains(&n) => Ok(Some(n)),
        _ => Err(BurrowError::config(format!(
            "invalid cpu share {s:?}, expected an integer in {MIN_SHARES}..={MAX_SHARES}"
        ))),
    }
}

/// Maps `cpu.shares` (2..262144) linearly onto `cpu.weight` (1..10000).
#[must_use]
pub const fn shares_to_weight(shares: u64) -> u64 {
    1 + ((shares - MIN_SHARES) * 9999) / (MAX_SHARES - MIN_SHARES)
}
