use std::path::Path;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use walkdir::WalkDir;

/// Converts a gigabyte setting to the whole megabytes passed to `-Xms`/`-Xmx`.
pub fn heap_megabytes(gb: f32) -> u32 {
    (gb * 1024.0).round() as u32
}

/// Resident memory of a single process, if it is still alive.
pub fn process_memory_bytes(pid: u32) -> Option<u64> {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing().with_memory(),
    );
    sys.process(pid).map(|proc| proc.memory())
}

pub fn directory_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}
