use std::sync::OnceLock;

#[cfg(target_os = "linux")]
pub(crate) fn ticks_per_sec() -> u64 {
    static TICKS: OnceLock<u64> = OnceLock::new();
    *TICKS.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_CLK_TCK);
        if v <= 0 { 100 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn ticks_per_sec() -> u64 {
    100
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_PAGESIZE);
        if v <= 0 { 4096 } else { v as u64 }
    })
}

pub(crate) fn parse_stat_cpu_ticks(s: &str) -> Option<u64> {
    let end = s.rfind(')')?;
    let rest = s.get((end + 2)..)?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = parts.get(11)?.parse().ok()?;
    let stime: u64 = parts.get(12)?.parse().ok()?;
    Some(utime.saturating_add(stime))
}

pub(crate) fn parse_stat_state(s: &str) -> Option<char> {
    let end = s.rfind(')')?;
    s.get((end + 2)..)?.chars().next()
}

pub(crate) fn parse_status_threads(s: &str) -> Option<u32> {
    s.lines()
        .find_map(|l| l.strip_prefix("Threads:"))
        .and_then(|v| v.trim().parse().ok())
}

pub(crate) fn parse_meminfo_total_kb(s: &str) -> Option<u64> {
    s.lines()
        .find_map(|l| l.strip_prefix("MemTotal:"))
        .and_then(|v| v.trim().trim_end_matches("kB").trim().parse().ok())
}

pub(crate) fn cpu_percent(delta_ticks: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 {
        return 0.0;
    }
    let cpu = (delta_ticks as f64 / ticks_per_sec() as f64) / elapsed_secs * 100.0;
    if cpu.is_finite() { cpu.max(0.0) } else { 0.0 }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct RawSample {
    pub cpu_ticks: u64,
    pub rss_bytes: u64,
    pub threads: u32,
    pub open_files: u32,
    pub sockets: u32,
}

#[cfg(target_os = "linux")]
pub(crate) async fn read_sample(pid: u32) -> Option<RawSample> {
    let stat = tokio::fs::read_to_string(format!("/proc/{pid}/stat"))
        .await
        .ok()?;
    if parse_stat_state(&stat) == Some('Z') {
        return None;
    }
    let cpu_ticks = parse_stat_cpu_ticks(&stat)?;

    let rss_bytes = tokio::fs::read_to_string(format!("/proc/{pid}/statm"))
        .await
        .ok()
        .and_then(|s| s.split_whitespace().nth(1)?.parse::<u64>().ok())
        .map(|pages| pages.saturating_mul(page_size()))
        .unwrap_or(0);

    let threads = tokio::fs::read_to_string(format!("/proc/{pid}/status"))
        .await
        .ok()
        .and_then(|s| parse_status_threads(&s))
        .unwrap_or(0);

    let mut open_files = 0u32;
    let mut sockets = 0u32;
    if let Ok(mut rd) = tokio::fs::read_dir(format!("/proc/{pid}/fd")).await {
        while let Ok(Some(de)) = rd.next_entry().await {
            open_files = open_files.saturating_add(1);
            if let Ok(target) = tokio::fs::read_link(de.path()).await
                && target.to_string_lossy().starts_with("socket:")
            {
                sockets = sockets.saturating_add(1);
            }
        }
    }

    Some(RawSample {
        cpu_ticks,
        rss_bytes,
        threads,
        open_files,
        sockets,
    })
}

#[cfg(not(target_os = "linux"))]
pub(crate) async fn read_sample(_pid: u32) -> Option<RawSample> {
    None
}

#[cfg(target_os = "linux")]
pub(crate) fn total_memory_bytes() -> Option<u64> {
    static TOTAL: OnceLock<Option<u64>> = OnceLock::new();
    *TOTAL.get_or_init(|| {
        let s = std::fs::read_to_string("/proc/meminfo").ok()?;
        parse_meminfo_total_kb(&s).map(|kb| kb.saturating_mul(1024))
    })
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn total_memory_bytes() -> Option<u64> {
    None
}

pub(crate) fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if rc == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}
