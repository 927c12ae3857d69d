use serde::Serialize;

/// Point-in-time resource usage for one supervised process, as sampled by the
/// platform probe collaborator.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProcessMetrics {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

/// Interface of the OS-specific metric collector. The collection itself
/// (`ps`/`wmic`/`tasklist` parsing) lives outside the supervision core; the
/// HTTP surface only forwards whatever the probe returns.
#[cfg_attr(test, mockall::automock)]
pub trait MetricsProbe: Send + Sync {
    /// Samples the process with the given OS pid; `None` when the probe has
    /// nothing for it.
    fn sample(&self, os_pid: u32) -> Option<ProcessMetrics>;
}

/// Probe used when no platform collector is wired in.
#[derive(Default)]
pub struct NoopMetricsProbe;

impl MetricsProbe for NoopMetricsProbe {
    fn sample(&self, _os_pid: u32) -> Option<ProcessMetrics> {
        None
    }
}

/// Platform identity reported by `/api/platform`.
#[derive(Clone, Debug, Serialize)]
pub struct PlatformInfo {
    pub os: String,
    pub family: String,
    pub hostname: String,
}

impl PlatformInfo {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            family: std::env::consts::FAMILY.to_string(),
            hostname: hostname(),
        }
    }
}

#[cfg(target_family = "unix")]
fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(not(target_family = "unix"))]
fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_probe_returns_nothing() {
        assert_eq!(NoopMetricsProbe.sample(1234), None);
    }

    #[test]
    fn platform_info_is_populated() {
        let info = PlatformInfo::current();
        assert!(!info.os.is_empty());
        assert!(!info.family.is_empty());
        assert!(!info.hostname.is_empty());
    }
}
