use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::cli::Cli;
use crate::config::loader::{default_config_path, load_definitions};
use crate::context::Context;
use crate::event::channel::{pub_sub, EventConsumer};
use crate::event::ProcessEvent;
use crate::http_server::config::ServerConfig;
use crate::http_server::runner::Runner as HttpRunner;
use crate::http_server::ServerError;
use crate::manager::{Manager, ManagerError};
use crate::ports::OsPortChecker;
use crate::probe::NoopMetricsProbe;
use crate::registry::Registry;
use crate::remote::ConfigView;
use crate::supervisor::Supervisor;
use crate::utils::threads::spawn_named_thread;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("manager unavailable: {0}")]
    Manager(#[from] ManagerError),
}

/// Node-level settings resolved from CLI flags and environment variables.
#[derive(Clone, Debug)]
pub struct AgentSettings {
    pub config_file: PathBuf,
    pub server: ServerConfig,
}

impl AgentSettings {
    pub fn resolve(cli: &Cli) -> Self {
        Self {
            config_file: cli.config.clone().unwrap_or_else(default_config_path),
            server: ServerConfig::from_env(cli.port),
        }
    }

    pub fn config_view(&self) -> ConfigView {
        ConfigView {
            config_file: self.config_file.clone(),
            server: self.server.clone(),
        }
    }
}

/// One running node: the manager, its supervisor and registry, the telemetry
/// consumer, and the HTTP control surface.
pub struct Agent {
    settings: AgentSettings,
}

impl Agent {
    pub fn new(settings: AgentSettings) -> Self {
        Self { settings }
    }

    /// Runs until `shutdown_ctx` is cancelled, then winds everything down:
    /// the control API first, then every supervised process.
    pub fn run(self, shutdown_ctx: Context<bool>) -> Result<(), AgentError> {
        // an unreadable config is not fatal: the node comes up empty
        let definitions = match load_definitions(&self.settings.config_file) {
            Ok(definitions) => definitions,
            Err(err) => {
                error!(
                    config_file = %self.settings.config_file.display(),
                    "could not load process definitions, starting empty: {err}"
                );
                Vec::new()
            }
        };

        let (events_publisher, events_consumer) = pub_sub();
        let (down_publisher, down_consumer) = pub_sub();

        let supervisor = Arc::new(Supervisor::new(down_publisher, Arc::new(OsPortChecker)));
        let registry = Arc::new(Registry::new());

        let (manager, manager_thread) = Manager::spawn(
            definitions,
            supervisor,
            registry.clone(),
            events_publisher,
            down_consumer,
        );

        let telemetry_thread = spawn_event_logger(events_consumer);

        let http_server = HttpRunner::new(
            self.settings.server.clone(),
            manager.clone(),
            registry,
            Arc::new(NoopMetricsProbe),
        )
        .start()?;

        info!(
            config_file = %self.settings.config_file.display(),
            api = %self.settings.server,
            "agent ready"
        );

        shutdown_ctx.wait();
        info!("shutdown requested");

        http_server.stop();
        if let Err(err) = manager.shutdown() {
            warn!("manager shutdown failed: {err}");
        }
        let _ = manager_thread.join();
        let _ = telemetry_thread.join();

        Ok(())
    }
}

/// Logs every lifecycle event; external telemetry fan-out would subscribe the
/// same way. The thread ends when the manager is gone.
fn spawn_event_logger(events: EventConsumer<ProcessEvent>) -> JoinHandle<()> {
    spawn_named_thread("telemetry", move || {
        for event in events.as_ref().iter() {
            match &event {
                ProcessEvent::Started { id } => info!(process = %id, "event: process started"),
                ProcessEvent::Stopped { id } => info!(process = %id, "event: process stopped"),
                ProcessEvent::Crashed { id, reason } => {
                    warn!(process = %id, reason = %reason, "event: process crashed")
                }
                ProcessEvent::AutoRestartScheduled { id, delay } => {
                    info!(process = %id, delay_ms = delay.as_millis() as u64, "event: auto-restart scheduled")
                }
                ProcessEvent::AutoRestartExhausted { id } => {
                    warn!(process = %id, "event: auto-restart budget exhausted")
                }
                ProcessEvent::RestartIntensityExceeded { id } => {
                    warn!(process = %id, "event: restart intensity exceeded")
                }
            }
        }
    })
}
