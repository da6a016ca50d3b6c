//! Process memory accounting.
//!
//! Feeds the `server.memory_allocated` gauge and the hot-restart stats
//! reply. Reads `/proc/self/statm` on Linux; elsewhere (or on any read
//! error) reports zero rather than failing a stats flush.

/// Resident set size in bytes, best effort.
pub fn allocated_bytes() -> u64 {
    read_statm_resident().unwrap_or(0)
}

#[cfg(target_os = "linux")]
fn read_statm_resident() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(resident_pages * page_size as u64)
}

#[cfg(not(target_os = "linux"))]
fn read_statm_resident() -> Option<u64> {
    None
}
