use actix_web::web::{self, Data};
use actix_web::{App, HttpServer};
use tracing::info;

use super::config::{ServerConfig, DEFAULT_WORKERS};
use super::{handlers, AppState, ServerError};
use crate::event::cancellation::CancellationMessage;
use crate::event::channel::EventConsumer;

/// Route table of the control API.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(handlers::health))
        .route("/api/system/status", web::get().to(handlers::system_status))
        .route("/api/platform", web::get().to(handlers::platform))
        .route("/api/processes", web::get().to(handlers::list_processes))
        .route("/api/processes/{id}", web::get().to(handlers::process_detail))
        .route(
            "/api/processes/{id}/start",
            web::post().to(handlers::start_process),
        )
        .route(
            "/api/processes/{id}/stop",
            web::post().to(handlers::stop_process),
        )
        .route(
            "/api/processes/{id}/restart",
            web::post().to(handlers::restart_process),
        );
}

/// Binds and serves the control API until `stop_consumer` fires, then stops
/// it gracefully. Startup success or failure is reported once through
/// `startup_publisher`.
pub(super) async fn run_server(
    config: ServerConfig,
    state: Data<AppState>,
    startup_publisher: std::sync::mpsc::Sender<Result<(), String>>,
    stop_consumer: EventConsumer<CancellationMessage>,
) -> Result<(), ServerError> {
    info!("starting control API at http://{}", config);

    let server = match HttpServer::new(move || {
        App::new().app_data(state.clone()).configure(routes)
    })
    .bind((config.host.clone(), config.port))
    {
        Ok(server) => server,
        Err(err) => {
            let _ = startup_publisher.send(Err(err.to_string()));
            return Err(ServerError::Bind(err.to_string()));
        }
    };

    let server = server.workers(DEFAULT_WORKERS).run();
    let handle = server.handle();
    let server_task = tokio::task::spawn(server);

    let _ = startup_publisher.send(Ok(()));

    // park until the agent asks us to stop (or drops the publisher)
    let _ = tokio::task::spawn_blocking(move || {
        let _ = stop_consumer.as_ref().recv();
    })
    .await;

    info!("stopping control API");
    handle.stop(true).await;

    match server_task.await {
        Ok(result) => result.map_err(|err| ServerError::Server(err.to_string())),
        Err(err) => Err(ServerError::Server(err.to_string())),
    }
}
