use std::{fs, path::PathBuf, time::Duration};

use crate::ProcessMetrics;

/// A procfs-backed metrics querier.
///
/// Reads `/proc/<pid>/stat` for CPU time and `/proc/<pid>/statm` for resident memory. Both files
/// are re-read on every call, so consecutive readings always reflect the kernel's current view.
/// Once the process exits, reads begin returning `None`.
pub struct ProcfsQuerier {
    stat_path: PathBuf,
    statm_path: PathBuf,
    page_size: usize,
    ticks_per_second: u64,
}

impl ProcfsQuerier {
    /// Creates a querier for the process with the given PID.
    pub fn with_pid(pid: u32) -> Self {
        let proc_dir = PathBuf::from(format!("/proc/{}", pid));

        Self {
            stat_path: proc_dir.join("stat"),
            statm_path: proc_dir.join("statm"),
            page_size: page_size(),
            ticks_per_second: clock_ticks_per_second(),
        }
    }

    /// Creates a querier for the current process.
    pub fn current_process() -> Self {
        Self::with_pid(std::process::id())
    }
}

impl ProcessMetrics for ProcfsQuerier {
    fn cpu_time(&mut self) -> Option<Duration> {
        if self.ticks_per_second == 0 {
            return None;
        }

        let contents = fs::read(&self.stat_path).ok()?;
        let ticks = parse_stat_cpu_ticks(&contents)?;

        // Convert clock ticks to a duration without losing sub-second precision.
        let secs = ticks / self.ticks_per_second;
        let rem_nanos = (ticks % self.ticks_per_second) * 1_000_000_000 / self.ticks_per_second;
        Some(Duration::new(secs, rem_nanos as u32))
    }

    fn memory_usage(&mut self) -> Option<usize> {
        if self.page_size == 0 {
            return None;
        }

        let contents = fs::read(&self.statm_path).ok()?;
        let rss_pages = parse_statm_resident_pages(&contents)?;
        Some(rss_pages * self.page_size)
    }
}

/// Extracts `utime + stime` (fields 14 and 15) from the contents of `/proc/<pid>/stat`.
///
/// The second field of the file is the process's command name, wrapped in parentheses and
/// allowed to contain both spaces and parentheses itself, so field splitting can only start
/// after the *last* closing parenthesis.
fn parse_stat_cpu_ticks(contents: &[u8]) -> Option<u64> {
    let comm_end = contents.iter().rposition(|&b| b == b')')?;
    let mut fields = contents[comm_end + 1..]
        .split(|&b| b == b' ')
        .filter(|field| !field.is_empty());

    // The field after the command name is the process state (field 3), which puts utime at the
    // 12th field from there and stime immediately after it.
    let utime = parse_u64(fields.nth(11)?)?;
    let stime = parse_u64(fields.next()?)?;
    utime.checked_add(stime)
}

/// Extracts the resident set size, in pages, from the contents of `/proc/<pid>/statm`.
///
/// statm is a single line of space-delimited integer fields; resident pages is the second one.
fn parse_statm_resident_pages(contents: &[u8]) -> Option<usize> {
    let raw_rss_field = contents.split(|&b| b == b' ').nth(1)?;
    std::str::from_utf8(raw_rss_field).ok()?.parse::<usize>().ok()
}

fn parse_u64(raw: &[u8]) -> Option<u64> {
    std::str::from_utf8(raw).ok()?.parse::<u64>().ok()
}

fn page_size() -> usize {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        0
    } else {
        page_size as usize
    }
}

fn clock_ticks_per_second() -> u64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks <= 0 {
        0
    } else {
        ticks as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_cpu_ticks() {
        let line = b"1234 (worker) S 1 1234 1234 0 -1 4194560 1000 0 0 0 150 75 0 0 20 0 4 0 100 0 0";
        assert_eq!(parse_stat_cpu_ticks(line), Some(225));
    }

    #[test]
    fn stat_cpu_ticks_comm_with_spaces_and_parens() {
        // The command name is attacker-ish input as far as parsing is concerned: it can contain
        // spaces and even closing parentheses.
        let line = b"42 (tricky) name)) R 1 42 42 0 -1 4194560 0 0 0 0 7 3 0 0 20 0 1 0 50 0 0";
        assert_eq!(parse_stat_cpu_ticks(line), Some(10));
    }

    #[test]
    fn stat_cpu_ticks_truncated() {
        assert_eq!(parse_stat_cpu_ticks(b"1234 (worker) S 1"), None);
        assert_eq!(parse_stat_cpu_ticks(b""), None);
    }

    #[test]
    fn statm_resident_pages() {
        assert_eq!(parse_statm_resident_pages(b"2048 512 300 45 0 200 0\n"), Some(512));
        assert_eq!(parse_statm_resident_pages(b"2048"), None);
        assert_eq!(parse_statm_resident_pages(b"2048 abc 1"), None);
    }

    #[test]
    fn query_current_process() {
        let mut querier = ProcfsQuerier::current_process();
        assert!(querier.cpu_time().is_some());
        assert!(querier.memory_usage().is_some());
    }

    #[test]
    fn query_nonexistent_process() {
        // PID 0 has no /proc entry.
        let mut querier = ProcfsQuerier::with_pid(0);
        assert!(querier.cpu_time().is_none());
        assert!(querier.memory_usage().is_none());
    }
}
