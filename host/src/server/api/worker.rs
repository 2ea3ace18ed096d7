//! Worker registration, heartbeats and the live-worker listing.

use axum::extract::State;
use axum::routing::post;
use axum::{Form, Router};
use chrono::NaiveDateTime;
use factorkeeper_lib::proto::{split_task_ids, DATETIME_FORMAT, WORKER_HEADER};
use factorkeeper_lib::version::MIN_WORKER_VERSION;
use factorkeeper_lib::ErrorKind;
use serde::Deserialize;
use utoipa::OpenApi;

use crate::server::api::{check_header, Envelope};
use crate::AppState;

#[derive(OpenApi)]
#[openapi(paths(register_worker, update_worker, list_workers))]
pub struct Docs;

#[must_use]
pub fn create_docs() -> utoipa::openapi::OpenApi {
    Docs::openapi()
}

pub fn create_router() -> Router<AppState> {
    Router::new().route(
        "/worker",
        post(register_worker).put(update_worker).get(list_workers),
    )
}

#[derive(Debug, Deserialize)]
struct RegisterForm {
    #[serde(rename = "HEADER")]
    header: Option<String>,
    host: Option<String>,
    port: Option<String>,
    cores: Option<String>,
    version: Option<String>,
}

#[utoipa::path(
    post,
    path = "/worker",
    tag = "Worker",
    responses((status = 200, description = "Registration outcome envelope", body = String))
)]
async fn register_worker(
    State(state): State<AppState>,
    Form(form): Form<RegisterForm>,
) -> Envelope {
    if let Err(resp) = check_header(form.header.as_deref(), WORKER_HEADER) {
        return resp;
    }

    let parsed = (|| {
        let host = form.host?;
        let port: u16 = form.port?.parse().ok()?;
        let cores: u32 = form.cores?.parse().ok()?;
        let version = form.version?;
        Some((host, port, cores, version))
    })();
    let Some((host, port, cores, version)) = parsed else {
        return Envelope::code(ErrorKind::ParameterMissingOrInvalid);
    };

    match state.registry.register_worker(&host, port, cores, &version) {
        Ok(()) => Envelope::success("registered"),
        Err(ErrorKind::WorkerVersionDeprecated) => Envelope::with_msg(
            ErrorKind::WorkerVersionDeprecated,
            MIN_WORKER_VERSION.to_string(),
        ),
        Err(err) => Envelope::code(err),
    }
}

#[derive(Debug, Deserialize)]
struct HeartbeatForm {
    #[serde(rename = "HEADER")]
    header: Option<String>,
    host: Option<String>,
    port: Option<String>,
    tasks: Option<String>,
    update_time: Option<String>,
}

#[utoipa::path(
    put,
    path = "/worker",
    tag = "Worker",
    responses((status = 200, description = "Heartbeat outcome envelope", body = String))
)]
async fn update_worker(
    State(state): State<AppState>,
    Form(form): Form<HeartbeatForm>,
) -> Envelope {
    if let Err(resp) = check_header(form.header.as_deref(), WORKER_HEADER) {
        return resp;
    }

    let parsed = (|| {
        let host = form.host?;
        let port: u16 = form.port?.parse().ok()?;
        let tasks = split_task_ids(&form.tasks.unwrap_or_default());
        let update_time =
            NaiveDateTime::parse_from_str(&form.update_time?, DATETIME_FORMAT).ok()?;
        Some((host, port, tasks, update_time))
    })();
    let Some((host, port, tasks, update_time)) = parsed else {
        return Envelope::code(ErrorKind::ParameterMissingOrInvalid);
    };

    match state.registry.update_worker(&host, port, tasks, update_time) {
        Ok(()) => Envelope::success("updated"),
        Err(err) => Envelope::code(err),
    }
}

#[utoipa::path(
    get,
    path = "/worker",
    tag = "Worker",
    responses((status = 200, description = "Live workers", body = String))
)]
async fn list_workers(State(state): State<AppState>) -> Envelope {
    let workers = state.registry.list_workers();
    if workers.is_empty() {
        return Envelope::success("No worker registered");
    }
    let listing = workers
        .iter()
        .map(|worker| format!("Worker Id: {}\n{}", worker.id, worker))
        .collect::<Vec<_>>()
        .join("\n----------------------------------------\n");
    Envelope::success(listing)
}
