use std::sync::Arc;
use std::time::Duration;

use actix_web::web::Data;
use tracing::{debug, error, info};

use super::config::ServerConfig;
use super::server::run_server;
use super::{AppState, ServerError};
use crate::manager::ManagerHandle;
use crate::probe::MetricsProbe;
use crate::registry::Registry;
use crate::utils::thread_context::{NotStartedThreadContext, StartedThreadContext};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Hosts the control API on its own OS thread with a dedicated tokio runtime,
/// so the supervision core stays free of async plumbing.
pub struct Runner {
    config: ServerConfig,
    state: AppState,
}

/// Owns the server thread; stopping (or dropping) shuts the server down
/// gracefully.
pub struct StartedHttpServer {
    thread_context: Option<StartedThreadContext>,
}

impl Runner {
    pub fn new(
        config: ServerConfig,
        manager: ManagerHandle,
        registry: Arc<Registry>,
        metrics_probe: Arc<dyn MetricsProbe>,
    ) -> Self {
        Self {
            config,
            state: AppState {
                manager,
                registry,
                metrics_probe,
            },
        }
    }

    /// Starts the server thread and waits for a successful bind before
    /// returning.
    pub fn start(self) -> Result<StartedHttpServer, ServerError> {
        let (startup_publisher, startup_consumer) = std::sync::mpsc::channel();

        let config = self.config;
        let state = Data::new(self.state);
        let callback = move |stop_consumer| {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    let _ = startup_publisher.send(Err(err.to_string()));
                    return;
                }
            };
            let _ = runtime
                .block_on(run_server(config, state, startup_publisher, stop_consumer))
                .inspect_err(|err| error!(error_msg = %err, "control API failed"));
        };

        let thread_context = NotStartedThreadContext::new("control-api", callback).start();

        let startup_result =
            startup_consumer
                .recv_timeout(STARTUP_TIMEOUT)
                .map_err(|err| match err {
                    std::sync::mpsc::RecvTimeoutError::Timeout => {
                        ServerError::StartupTimeout(STARTUP_TIMEOUT)
                    }
                    std::sync::mpsc::RecvTimeoutError::Disconnected => {
                        ServerError::StartupChannelClosed
                    }
                })?;
        startup_result.map_err(ServerError::Bind)?;

        Ok(StartedHttpServer {
            thread_context: Some(thread_context),
        })
    }
}

impl StartedHttpServer {
    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        let Some(thread_context) = self.thread_context.take() else {
            return;
        };
        info!("waiting for the control API to stop gracefully");
        let _ = thread_context
            .stop()
            .inspect(|_| debug!("control API thread stopped"))
            .inspect_err(|err| error!("error stopping control API: {err}"));
    }
}

impl Drop for StartedHttpServer {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

#[cfg(target_family = "unix")]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::channel::pub_sub;
    use crate::manager::Manager;
    use crate::ports::MockPortProbe;
    use crate::probe::NoopMetricsProbe;
    use crate::supervisor::Supervisor;
    use assert_matches::assert_matches;

    fn test_runner(port: u16) -> Runner {
        let (events_tx, _events_rx) = pub_sub();
        let (down_tx, down_rx) = pub_sub();
        let mut probe = MockPortProbe::new();
        probe.expect_ports_in_use().returning(|_| Vec::new());
        let supervisor = Arc::new(Supervisor::new(down_tx, Arc::new(probe)));
        let registry = Arc::new(Registry::new());
        let (manager, _thread) =
            Manager::spawn(Vec::new(), supervisor, registry.clone(), events_tx, down_rx);

        Runner::new(
            ServerConfig {
                host: "127.0.0.1".to_string(),
                port,
            },
            manager,
            registry,
            Arc::new(NoopMetricsProbe),
        )
    }

    #[test]
    fn server_starts_and_stops_gracefully() {
        let started = test_runner(0).start().expect("server should start");
        std::thread::sleep(Duration::from_millis(100));
        started.stop();
    }

    #[test]
    fn bind_conflict_is_reported_at_startup() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let result = test_runner(port).start();
        assert_matches!(result.err().unwrap(), ServerError::Bind(_));
    }
}
