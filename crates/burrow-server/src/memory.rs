//! Process memory figures for `GET /api/status`

use burrow_proto::MemoryUsage;

/// Current resident and virtual size; zeros where unsupported
pub fn memory_usage() -> MemoryUsage {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            return parse_proc_status(&status);
        }
    }

    MemoryUsage::default()
}

/// Pull `VmRSS` and `VmSize` (reported in kB) out of `/proc/<pid>/status`
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_status(status: &str) -> MemoryUsage {
    let mut usage = MemoryUsage::default();

    for line in status.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };

        let kib = value
            .trim()
            .trim_end_matches("kB")
            .trim()
            .parse::<u64>()
            .unwrap_or(0);

        match key {
            "VmRSS" => usage.rss = kib * 1024,
            "VmSize" => usage.virt = kib * 1024,
            _ => {}
        }
    }

    usage
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proc_status() {
        let status = "Name:\tburrow\nVmPeak:\t  20000 kB\nVmSize:\t  18000 kB\nVmRSS:\t    4096 kB\n";
        let usage = parse_proc_status(status);
        assert_eq!(usage.rss, 4096 * 1024);
        assert_eq!(usage.virt, 18000 * 1024);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_reads_own_process() {
        assert!(memory_usage().rss > 0);
    }
}
