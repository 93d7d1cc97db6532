//! Memory resource control via cgroups v2.
//!
//! Manages `memory.max` for a container group.

use std::path::Path;

use burrow_common::error::{BurrowError, Result};
use burrow_common::types::ResourceConfig;

use super::Subsystem;

/// Writes the memory ceiling of a group.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemorySubsystem;

impl Subsystem for MemorySubsystem {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn set(&self, group: &Path, config: &ResourceConfig) -> Result<()> {
        match parse_memory(&config.memory_limit)? {
            Some(bytes) => set_memory_max(group, bytes),
            None => Ok(()),
        }
    }
}

/// Sets the hard memory limit for a cgroup.
///
/// # Errors
///
/// Returns an error if writing to `memory.max` fails.
pub fn set_memory_max(cgroup_path: &Path, bytes: u64) -> Result<()> {
    let file = cgroup_path.join("memory.max");
    std::fs::write(&file, bytes.to_string()).map_err(|e| BurrowError::io(&file, e))?;
    tracing::debug!(bytes, "memory max set");
    Ok(())
}

/// Parses a memory size into bytes.
///
/// Accepts plain byte counts, docker-style single-letter binary suffixes
/// (`512k`, `100m`, `1g`), decimal suffixes (`KB`, `MB`, `GB`), and binary
/// suffixes (`KiB`, `MiB`, `GiB`). An empty string means unlimited.
///
/// # Errors
///
/// Returns an error if the value is not a number with a known suffix, or
/// overflows.
pub fn parse_memory(s: &str) -> Result<Option<u64>> {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    let s = s.trim();
    if s.is_empty() {
        return Ok(None);
    }

    let suffixes: [(&str, u64); 12] = [
        ("GiB", GIB),
        ("GB", 1_000_000_000),
        ("MiB", MIB),
        ("MB", 1_000_000),
        ("KiB", KIB),
        ("KB", 1000),
        ("g", GIB),
        ("G", GIB),
        ("m", MIB),
        ("M", MIB),
        ("k", KIB),
        ("K", KIB),
    ];
    let (num_str, multiplier) = suffixes
        .iter()
        .find_map(|(suffix, mult)| s.strip_suffix(suffix).map(|n| (n, *mult)))
        .unwrap_or((s, 1));

    let invalid = || BurrowError::config(format!("invalid memory limit: {s:?}"));
    let n = num_str.trim().parse::<u64>().map_err(|_| invalid())?;
    if n == 0 {
        return Err(invalid());
    }
    n.checked_mul(multiplier).map(Some).ok_or_else(invalid)
}
