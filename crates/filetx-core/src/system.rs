//! Hardware probing used to size concurrency limits.

use sysinfo::System;

use crate::config::{MAX_CHUNK_WIDTH, MIN_CHUNK_WIDTH};

const GIB: u64 = 1024 * 1024 * 1024;

/// Total physical memory in bytes (0 if it cannot be determined).
pub fn total_memory_bytes() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.total_memory()
}

/// Number of logical CPUs.
pub fn cpu_count() -> usize {
    num_cpus::get().max(1)
}

/// Executor chunk width for a machine with `total_memory` bytes of RAM.
///
/// One concurrent item per GiB, clamped to 4..=16.
pub fn chunk_width_for_memory(total_memory: u64) -> usize {
    let gib = usize::try_from(total_memory / GIB).unwrap_or(usize::MAX);
    gib.clamp(MIN_CHUNK_WIDTH, MAX_CHUNK_WIDTH)
}

/// Worker pool size from CPU count and memory tier, capped at `cap`.
pub fn pool_size_for(cpus: usize, total_memory: u64, cap: usize) -> usize {
    let by_cpu = cpus.saturating_sub(1).max(1);
    let by_memory = match total_memory / GIB {
        0..=3 => 2,
        4..=7 => 3,
        8..=15 => 4,
        _ => 6,
    };
    by_cpu.min(by_memory).min(cap).max(1)
}
