//! Worker callbacks: result frames and group finish-acks.

use axum::extract::State;
use axum::routing::post;
use axum::{Form, Router};
use chrono::NaiveDate;
use factorkeeper_lib::proto::{CALLBACK_HEADER, DATE_FORMAT};
use factorkeeper_lib::{ErrorKind, ResultFrame};
use factorkeeper_scheduler::{FinishCounts, TaskCallback};
use serde::Deserialize;
use utoipa::OpenApi;

use crate::server::api::{check_header, Envelope};
use crate::AppState;

#[derive(OpenApi)]
#[openapi(paths(factor_frame_callback, tick_frame_callback, finish_callback))]
pub struct Docs;

#[must_use]
pub fn create_docs() -> utoipa::openapi::OpenApi {
    Docs::openapi()
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route(
            "/worker/call_back/update_factor/update",
            post(factor_frame_callback),
        )
        .route(
            "/worker/call_back/update_tick_data/update",
            post(tick_frame_callback),
        )
        .route("/worker/call_back/finish", post(finish_callback))
}

#[derive(Debug, Deserialize)]
struct FactorFrameForm {
    #[serde(rename = "HEADER")]
    header: Option<String>,
    factor: Option<String>,
    version: Option<String>,
    stock_code: Option<String>,
    date: Option<String>,
    data_frame: Option<String>,
    task_id: Option<String>,
}

#[utoipa::path(post, path = "/worker/call_back/update_factor/update", tag = "Worker",
    responses((status = 200, description = "Ingestion outcome envelope", body = String)))]
async fn factor_frame_callback(
    State(state): State<AppState>,
    Form(form): Form<FactorFrameForm>,
) -> Envelope {
    if let Err(resp) = check_header(form.header.as_deref(), CALLBACK_HEADER) {
        return resp;
    }

    let parsed = (|| {
        Some(TaskCallback::FactorFrame {
            task_id: form.task_id?,
            factor: form.factor?,
            version: form.version?,
            stock_code: form.stock_code?,
            day: NaiveDate::parse_from_str(&form.date?, DATE_FORMAT).ok()?,
            frame: ResultFrame::from_json(&form.data_frame?).ok()?,
        })
    })();
    let Some(callback) = parsed else {
        return Envelope::code(ErrorKind::ParameterMissingOrInvalid);
    };

    match state.manager.callback_task(callback).await {
        Ok(()) => Envelope::success("frame committed"),
        Err(err) => Envelope::code(err),
    }
}

#[derive(Debug, Deserialize)]
struct TickFrameForm {
    #[serde(rename = "HEADER")]
    header: Option<String>,
    stock_code: Option<String>,
    date: Option<String>,
    data_frame: Option<String>,
    task_id: Option<String>,
}

#[utoipa::path(post, path = "/worker/call_back/update_tick_data/update", tag = "Worker",
    responses((status = 200, description = "Ingestion outcome envelope", body = String)))]
async fn tick_frame_callback(
    State(state): State<AppState>,
    Form(form): Form<TickFrameForm>,
) -> Envelope {
    if let Err(resp) = check_header(form.header.as_deref(), CALLBACK_HEADER) {
        return resp;
    }

    let parsed = (|| {
        Some(TaskCallback::TickFrame {
            task_id: form.task_id?,
            stock_code: form.stock_code?,
            day: NaiveDate::parse_from_str(&form.date?, DATE_FORMAT).ok()?,
            frame: ResultFrame::from_json(&form.data_frame?).ok()?,
        })
    })();
    let Some(callback) = parsed else {
        return Envelope::code(ErrorKind::ParameterMissingOrInvalid);
    };

    match state.manager.callback_task(callback).await {
        Ok(()) => Envelope::success("frame committed"),
        Err(err) => Envelope::code(err),
    }
}

#[derive(Debug, Deserialize)]
struct FinishForm {
    #[serde(rename = "HEADER")]
    header: Option<String>,
    task_id: Option<String>,
    finished: Option<String>,
    aborted: Option<String>,
    total: Option<String>,
}

#[utoipa::path(post, path = "/worker/call_back/finish", tag = "Worker",
    responses((status = 200, description = "Finish-ack outcome envelope", body = String)))]
async fn finish_callback(
    State(state): State<AppState>,
    Form(form): Form<FinishForm>,
) -> Envelope {
    if let Err(resp) = check_header(form.header.as_deref(), CALLBACK_HEADER) {
        return resp;
    }

    let Some(task_id) = form.task_id.filter(|id| !id.is_empty()) else {
        return Envelope::code(ErrorKind::ParameterMissingOrInvalid);
    };
    let counts = FinishCounts {
        total: form.total.and_then(|raw| raw.parse().ok()),
        finished: form.finished.and_then(|raw| raw.parse().ok()),
        aborted: form.aborted.and_then(|raw| raw.parse().ok()),
    };

    match state.manager.finish_task(&task_id, counts).await {
        Ok(()) => Envelope::success("task finished"),
        Err(err) => Envelope::code(err),
    }
}
