use serde::Serialize;

use crate::manager::ProcessSummary;
use crate::probe::{PlatformInfo, ProcessMetrics};
use crate::runner::ProcessStatus;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProcessCounts {
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
}

/// Body of `GET /health`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthSummary {
    pub status: HealthState,
    pub processes: ProcessCounts,
}

impl HealthSummary {
    /// Aggregation rule: an empty table is healthy, everything down is
    /// unhealthy, a partial fleet is degraded.
    pub fn aggregate(summaries: &[ProcessSummary]) -> Self {
        let total = summaries.len();
        let running = summaries
            .iter()
            .filter(|summary| summary.status.is_alive())
            .count();

        let status = if total == 0 || running == total {
            HealthState::Healthy
        } else if running == 0 {
            HealthState::Unhealthy
        } else {
            HealthState::Degraded
        };

        Self {
            status,
            processes: ProcessCounts {
                total,
                running,
                stopped: total - running,
            },
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }
}

/// Body of `GET /api/system/status`.
#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub status: HealthState,
    pub version: &'static str,
    pub platform: PlatformInfo,
    pub processes: Vec<ProcessSummary>,
}

impl SystemStatus {
    pub fn new(summaries: Vec<ProcessSummary>) -> Self {
        let health = HealthSummary::aggregate(&summaries);
        Self {
            status: health.status,
            version: env!("CARGO_PKG_VERSION"),
            platform: PlatformInfo::current(),
            processes: summaries,
        }
    }
}

/// Body of `GET /api/processes/:id`.
#[derive(Debug, Serialize)]
pub struct ProcessDetail {
    pub id: String,
    pub status: ProcessStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ProcessMetrics>,
}
