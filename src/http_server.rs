pub mod config;
pub mod handlers;
pub mod runner;
pub mod server;
pub mod status;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::manager::ManagerHandle;
use crate::probe::MetricsProbe;
use crate::registry::Registry;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("could not bind the control API: {0}")]
    Bind(String),

    #[error("control API did not start within {0:?}")]
    StartupTimeout(Duration),

    #[error("control API startup channel closed unexpectedly")]
    StartupChannelClosed,

    #[error("control API server failed: {0}")]
    Server(String),
}

/// Everything a request handler needs; injected as `web::Data`.
pub struct AppState {
    pub manager: ManagerHandle,
    pub registry: Arc<Registry>,
    pub metrics_probe: Arc<dyn MetricsProbe>,
}
