use std::{path::Path, time::Duration};

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    env_string(name).and_then(|v| v.parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

pub(crate) fn env_u16(name: &str) -> Option<u16> {
    env_string(name).and_then(|v| v.parse::<u16>().ok())
}

pub(crate) fn env_bool(name: &str) -> Option<bool> {
    env_string(name).and_then(|v| match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    })
}

pub(crate) fn env_millis(name: &str, min: u64, max: u64, default: u64) -> Duration {
    Duration::from_millis(env_u64(name).map(|v| v.clamp(min, max)).unwrap_or(default))
}

/// Comma separated list; empty entries are dropped.
pub(crate) fn env_list(name: &str) -> Option<Vec<String>> {
    let raw = env_string(name)?;
    let out: Vec<String> = raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();
    if out.is_empty() { None } else { Some(out) }
}

/// Exponential backoff; `attempt` is 1-based.
pub(crate) fn compute_backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let pow = attempt.saturating_sub(1).min(30);
    let mult = 1u32.checked_shl(pow).unwrap_or(u32::MAX);
    base.saturating_mul(mult).min(max)
}

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

/// Filesystem capacity as `(total, free)` bytes for the volume holding `p`.
#[cfg(unix)]
pub(crate) fn disk_space(p: &Path) -> Option<(u64, u64)> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c = CString::new(p.as_os_str().as_bytes()).ok()?;
    let mut s: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c.as_ptr(), &mut s) };
    if rc != 0 {
        return None;
    }
    #[allow(clippy::unnecessary_cast)]
    let frsize = s.f_frsize as u64;
    #[allow(clippy::unnecessary_cast)]
    let total = (s.f_blocks as u64).saturating_mul(frsize);
    #[allow(clippy::unnecessary_cast)]
    let free = (s.f_bavail as u64).saturating_mul(frsize);
    Some((total, free))
}

#[cfg(not(unix))]
pub(crate) fn disk_space(_p: &Path) -> Option<(u64, u64)> {
    None
}

/// System memory as `(total, available)` bytes.
#[cfg(target_os = "linux")]
pub(crate) async fn read_meminfo() -> Option<(u64, u64)> {
    let s = tokio::fs::read_to_string("/proc/meminfo").await.ok()?;
    parse_meminfo(&s)
}

#[cfg(not(target_os = "linux"))]
pub(crate) async fn read_meminfo() -> Option<(u64, u64)> {
    None
}

pub(crate) fn parse_meminfo(s: &str) -> Option<(u64, u64)> {
    let mut total: Option<u64> = None;
    let mut available: Option<u64> = None;
    for line in s.lines() {
        let kib = |rest: &str| -> Option<u64> {
            rest.split_whitespace()
                .next()?
                .parse::<u64>()
                .ok()
                .map(|v| v.saturating_mul(1024))
        };
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = kib(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = kib(rest);
        }
    }
    Some((total?, available?))
}

pub(crate) fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    let pct = part as f64 / whole as f64 * 100.0;
    (pct * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(4);
        assert_eq!(compute_backoff(base, max, 1), Duration::from_millis(500));
        assert_eq!(compute_backoff(base, max, 2), Duration::from_millis(1000));
        assert_eq!(compute_backoff(base, max, 3), Duration::from_millis(2000));
        assert_eq!(compute_backoff(base, max, 10), max);
    }

    #[test]
    fn error_chain_skips_duplicates() {
        let err = anyhow::anyhow!("disk full").context("write slides.md");
        assert_eq!(format_error_chain(&err), "write slides.md: disk full");
    }

    #[test]
    fn truncate_utf8_respects_char_boundaries() {
        let s = "é".repeat(100);
        let out = truncate_utf8(&s, 40);
        assert!(out.len() <= 40);
        assert!(out.ends_with("…(truncated)"));
    }

    #[test]
    fn meminfo_is_parsed_in_bytes() {
        let raw = "MemTotal:       16384000 kB\nMemFree:  100 kB\nMemAvailable:    8192000 kB\n";
        let (total, avail) = parse_meminfo(raw).unwrap();
        assert_eq!(total, 16_384_000 * 1024);
        assert_eq!(avail, 8_192_000 * 1024);
        assert!(parse_meminfo("MemTotal: 1 kB\n").is_none());
    }

    #[test]
    fn percentage_handles_zero_and_rounds() {
        assert_eq!(percentage(1, 0), 0.0);
        assert_eq!(percentage(1, 3), 33.33);
    }
}
