pub mod cancellation;
pub mod channel;

use std::time::Duration;

use crate::config::definition::ProcessId;
use crate::runner::ExitReason;

/// Lifecycle telemetry emitted by the manager. The agent logs every event;
/// external fan-out subscribes to the same consumer.
#[derive(Clone, Debug, PartialEq)]
pub enum ProcessEvent {
    Started {
        id: ProcessId,
    },
    Stopped {
        id: ProcessId,
    },
    Crashed {
        id: ProcessId,
        reason: ExitReason,
    },
    AutoRestartScheduled {
        id: ProcessId,
        delay: Duration,
    },
    AutoRestartExhausted {
        id: ProcessId,
    },
    RestartIntensityExceeded {
        id: ProcessId,
    },
}

impl ProcessEvent {
    pub fn id(&self) -> &ProcessId {
        match self {
            ProcessEvent::Started { id }
            | ProcessEvent::Stopped { id }
            | ProcessEvent::Crashed { id, .. }
            | ProcessEvent::AutoRestartScheduled { id, .. }
            | ProcessEvent::AutoRestartExhausted { id }
            | ProcessEvent::RestartIntensityExceeded { id } => id,
        }
    }
}
