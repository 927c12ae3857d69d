use actix_web::http::header::ContentType;
use actix_web::web::{Data, Path};
use actix_web::HttpResponse;
use serde_json::json;

use super::status::{HealthSummary, ProcessDetail, SystemStatus};
use super::AppState;
use crate::config::definition::ProcessId;
use crate::manager::ManagerError;
use crate::probe::PlatformInfo;

/// `GET /health`: aggregate node health, 200 when healthy, 503 otherwise.
pub(super) async fn health(state: Data<AppState>) -> HttpResponse {
    let manager = state.manager.clone();
    match actix_web::web::block(move || manager.list_processes()).await {
        Ok(Ok(summaries)) => {
            let summary = HealthSummary::aggregate(&summaries);
            let mut response = if summary.is_healthy() {
                HttpResponse::Ok()
            } else {
                HttpResponse::ServiceUnavailable()
            };
            response.content_type(ContentType::json()).json(summary)
        }
        Ok(Err(err)) => error_response(err),
        Err(_) => internal_error(),
    }
}

/// `GET /api/system/status`: full status plus platform info.
pub(super) async fn system_status(state: Data<AppState>) -> HttpResponse {
    let manager = state.manager.clone();
    match actix_web::web::block(move || manager.list_processes()).await {
        Ok(Ok(summaries)) => HttpResponse::Ok().json(SystemStatus::new(summaries)),
        Ok(Err(err)) => error_response(err),
        Err(_) => internal_error(),
    }
}

/// `GET /api/platform`: OS family and hostname.
pub(super) async fn platform() -> HttpResponse {
    HttpResponse::Ok().json(PlatformInfo::current())
}

/// `GET /api/processes`: the declared table wrapped under `processes`.
pub(super) async fn list_processes(state: Data<AppState>) -> HttpResponse {
    let manager = state.manager.clone();
    match actix_web::web::block(move || manager.list_processes()).await {
        Ok(Ok(summaries)) => HttpResponse::Ok().json(json!({ "processes": summaries })),
        Ok(Err(err)) => error_response(err),
        Err(_) => internal_error(),
    }
}

/// `GET /api/processes/{id}`: status plus metrics when the platform probe
/// has a sample for the live pid.
pub(super) async fn process_detail(state: Data<AppState>, path: Path<String>) -> HttpResponse {
    let Ok(id) = ProcessId::try_from(path.into_inner()) else {
        return not_found();
    };

    let manager = state.manager.clone();
    let lookup_id = id.clone();
    let status = match actix_web::web::block(move || manager.get_process_status(&lookup_id)).await
    {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => return error_response(err),
        Err(_) => return internal_error(),
    };

    let metrics = state
        .registry
        .lookup(&id)
        .and_then(|handle| handle.os_pid())
        .and_then(|pid| state.metrics_probe.sample(pid));

    HttpResponse::Ok().json(ProcessDetail {
        id: id.to_string(),
        status,
        metrics,
    })
}

/// `POST /api/processes/{id}/start`
pub(super) async fn start_process(state: Data<AppState>, path: Path<String>) -> HttpResponse {
    lifecycle_action(state, path, "started", |manager, id| {
        manager.start_process(id)
    })
    .await
}

/// `POST /api/processes/{id}/stop`
pub(super) async fn stop_process(state: Data<AppState>, path: Path<String>) -> HttpResponse {
    lifecycle_action(state, path, "stopped", |manager, id| {
        manager.stop_process(id)
    })
    .await
}

/// `POST /api/processes/{id}/restart`
pub(super) async fn restart_process(state: Data<AppState>, path: Path<String>) -> HttpResponse {
    lifecycle_action(state, path, "restarted", |manager, id| {
        manager.restart_process(id)
    })
    .await
}

async fn lifecycle_action<F>(
    state: Data<AppState>,
    path: Path<String>,
    verb: &'static str,
    action: F,
) -> HttpResponse
where
    F: FnOnce(&crate::manager::ManagerHandle, &ProcessId) -> Result<(), ManagerError>
        + Send
        + 'static,
{
    let Ok(id) = ProcessId::try_from(path.into_inner()) else {
        return not_found();
    };

    let manager = state.manager.clone();
    match actix_web::web::block(move || action(&manager, &id)).await {
        Ok(Ok(())) => HttpResponse::Ok().json(json!({ "status": verb })),
        Ok(Err(err)) => error_response(err),
        Err(_) => internal_error(),
    }
}

fn error_response(err: ManagerError) -> HttpResponse {
    match err {
        ManagerError::NotFound => not_found(),
        other => HttpResponse::InternalServerError().json(json!({ "error": other.to_string() })),
    }
}

fn not_found() -> HttpResponse {
    HttpResponse::NotFound().json(json!({ "error": "Process not found" }))
}

fn internal_error() -> HttpResponse {
    HttpResponse::InternalServerError().json(json!({ "error": "internal error" }))
}
