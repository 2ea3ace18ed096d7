//! Task listing, finished-task history and the administrative stop.

use axum::extract::State;
use axum::routing::{get, post};
use axum::Router;
use factorkeeper_metadb::FinishedTaskInfo;
use utoipa::OpenApi;

use crate::server::api::Envelope;
use crate::AppState;

/// How many recent finished root tasks the listing shows.
const FINISHED_TASK_LIMIT: i64 = 5;

#[derive(OpenApi)]
#[openapi(paths(list_tasks, list_finished_tasks, stop_all))]
pub struct Docs;

#[must_use]
pub fn create_docs() -> utoipa::openapi::OpenApi {
    Docs::openapi()
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/task", get(list_tasks))
        .route("/finished_task", get(list_finished_tasks))
        .route("/manager/stop_all", post(stop_all))
}

#[utoipa::path(
    get,
    path = "/task",
    tag = "Task",
    responses((status = 200, description = "Live root tasks", body = String))
)]
async fn list_tasks(State(state): State<AppState>) -> Envelope {
    let tasks = state.manager.list_tasks();
    if tasks.is_empty() {
        return Envelope::success("No task committed");
    }
    let listing = tasks
        .iter()
        .map(|task| task.to_string())
        .collect::<Vec<_>>()
        .join("\n****************************************\n");
    Envelope::success(listing)
}

#[utoipa::path(
    get,
    path = "/finished_task",
    tag = "Task",
    responses((status = 200, description = "Recently finished root tasks", body = String))
)]
async fn list_finished_tasks(State(state): State<AppState>) -> Envelope {
    match state.manager.recent_finished_tasks(FINISHED_TASK_LIMIT).await {
        Ok(tasks) if tasks.is_empty() => Envelope::success("No task finished"),
        Ok(tasks) => {
            let listing = tasks
                .iter()
                .map(render_finished)
                .collect::<Vec<_>>()
                .join("\n****************************************\n");
            Envelope::success(listing)
        }
        Err(err) => Envelope::code(err),
    }
}

fn render_finished(task: &FinishedTaskInfo) -> String {
    let record = &task.record;
    let mut out = format!(
        "Task Id: {}\nTask Type: {}\nCommit Time: {}\nFinish Time: {}\nFinal Status: {}\n\
         Total Tasks: {}\nFinished Tasks: {}\nAborted Tasks: {}\nLast Responsible Worker: {}\n\
         Dependencies: [",
        record.task_id,
        record.task_type,
        record.commit_time,
        record.finish_time,
        record.final_status,
        opt(record.total_sub_tasks),
        opt(record.finished),
        opt(record.aborted),
        record.worker_id.as_deref().unwrap_or("-"),
    );
    for dep in &task.dependencies {
        for line in render_finished(dep).lines() {
            out.push_str("\n    ");
            out.push_str(line);
        }
    }
    out.push_str("\n]");
    out
}

fn opt(value: Option<i32>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

#[utoipa::path(
    post,
    path = "/manager/stop_all",
    tag = "Task",
    responses((status = 200, description = "Stop outcome envelope", body = String))
)]
async fn stop_all(State(state): State<AppState>) -> Envelope {
    match state.manager.stop_all().await {
        Ok(()) => Envelope::success("all tasks stopped"),
        Err(err) => Envelope::code(err),
    }
}
