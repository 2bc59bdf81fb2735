//! Process memory sampling.
//!
//! Resident set size comes from `/proc/self/statm` and total physical
//! memory from `/proc/meminfo`; platforms without procfs report zeros and a
//! 0.0 usage ratio, which downstream consumers treat as "no pressure".

/// Snapshot of process and system memory at one instant.
///
/// Ephemeral by design: overwritten each sampling tick, never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryStats {
    /// Resident set size of this process (bytes)
    pub physical_memory_used: u64,
    /// Total physical memory of the machine (bytes)
    pub total_physical: u64,
    /// `used / total`, clamped to `[0, 1]`
    pub usage_ratio: f64,
}

impl MemoryStats {
    /// Sample the current process.
    pub fn sample() -> Self {
        Self::from_parts(rss_bytes(), total_physical_bytes())
    }

    /// Build a snapshot from raw readings (synthetic values in tests).
    pub fn from_parts(physical_memory_used: u64, total_physical: u64) -> Self {
        let usage_ratio = if total_physical > 0 {
            (physical_memory_used as f64 / total_physical as f64).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            physical_memory_used,
            total_physical,
            usage_ratio,
        }
    }
}

/// Resident set size from `/proc/self/statm` (second field, in pages).
#[cfg(target_os = "linux")]
fn rss_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|s| {
            s.split_whitespace()
                .nth(1)
                .and_then(|pages| pages.parse::<u64>().ok())
        })
        .map(|pages| pages * 4096)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn rss_bytes() -> u64 {
    0
}

/// Total physical memory from `/proc/meminfo` (`MemTotal:` line, in kB).
#[cfg(target_os = "linux")]
fn total_physical_bytes() -> u64 {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|s| {
            s.lines()
                .find(|line| line.starts_with("MemTotal:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok())
        })
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn total_physical_bytes() -> u64 {
    0
}
