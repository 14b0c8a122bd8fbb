//! Worker thread sizing for the tokio runtime.
//!
//! A balancer in a container limited to 2 CPUs on a 64-core host should not
//! spin up 64 workers. Sources, first match wins:
//!
//! 1. `BALANCER_CPU_LIMIT` (`"2"`, `"1500m"`)
//! 2. cgroup v2 `/sys/fs/cgroup/cpu.max`
//! 3. cgroup v1 `cpu.cfs_quota_us` / `cpu.cfs_period_us`
//! 4. host parallelism

use std::fmt;

const CPU_LIMIT_ENV: &str = "BALANCER_CPU_LIMIT";
const CGROUP_V2_MAX: &str = "/sys/fs/cgroup/cpu.max";
const CGROUP_V1_QUOTA: &str = "/sys/fs/cgroup/cpu/cpu.cfs_quota_us";
const CGROUP_V1_PERIOD: &str = "/sys/fs/cgroup/cpu/cpu.cfs_period_us";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuSource {
    Env,
    CgroupV2,
    CgroupV1,
    Host,
}

impl fmt::Display for CpuSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Env => CPU_LIMIT_ENV,
            Self::CgroupV2 => "cgroup v2",
            Self::CgroupV1 => "cgroup v1",
            Self::Host => "host cpu count",
        })
    }
}

/// Number of worker threads to start and where the number came from.
pub fn worker_threads() -> (usize, CpuSource) {
    let detected = std::env::var(CPU_LIMIT_ENV)
        .ok()
        .and_then(|v| parse_cpu_value(&v))
        .map(|n| (n, CpuSource::Env))
        .or_else(|| {
            std::fs::read_to_string(CGROUP_V2_MAX)
                .ok()
                .and_then(|c| parse_cgroup_v2_cpu(&c))
                .map(|n| (n, CpuSource::CgroupV2))
        })
        .or_else(|| {
            let quota = std::fs::read_to_string(CGROUP_V1_QUOTA).ok()?;
            let period = std::fs::read_to_string(CGROUP_V1_PERIOD).ok()?;
            parse_cgroup_v1_cpu(&quota, &period).map(|n| (n, CpuSource::CgroupV1))
        });

    match detected {
        Some((n, source)) => (n.max(1), source),
        None => (
            std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(1),
            CpuSource::Host,
        ),
    }
}

/// Whole cores from `"4"` or millicores from `"4000m"`. Fractions round up.
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    match value.strip_suffix('m') {
        Some(milli) => milli.parse::<usize>().ok().map(|m| m.div_ceil(1000)),
        None => value.parse::<usize>().ok(),
    }
}

/// `cpu.max` holds `"<quota> <period>"` or `"max <period>"`.
fn parse_cgroup_v2_cpu(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?;
    if quota == "max" {
        return None;
    }
    parse_cgroup_v1_cpu(quota, period)
}

fn parse_cgroup_v1_cpu(quota: &str, period: &str) -> Option<usize> {
    let quota: i64 = quota.trim().parse().ok()?;
    let period: i64 = period.trim().parse().ok()?;
    if quota > 0 && period > 0 {
        Some(((quota + period - 1) / period) as usize)
    } else {
        None
    }
}
