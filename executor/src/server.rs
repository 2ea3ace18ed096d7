//! The executor's command surface, driven by the coordinator.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Form, Router};
use factorkeeper_lib::proto::{self, COMMAND_HEADER};
use factorkeeper_lib::{ErrorKind, FkResult};
use factorkeeper_pool::UnitKind;
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::ExecutorState;

struct Envelope {
    code: ErrorKind,
    msg: String,
}

impl Envelope {
    fn success(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorKind::Success,
            msg: msg.into(),
        }
    }

    fn code(code: ErrorKind) -> Self {
        Self {
            code,
            msg: code.to_string(),
        }
    }

    fn of(result: FkResult<String>) -> Self {
        match result {
            Ok(msg) => Self::success(msg),
            Err(code) => Self::code(code),
        }
    }
}

impl IntoResponse for Envelope {
    fn into_response(self) -> Response {
        (StatusCode::OK, proto::make_response(self.code, &self.msg)).into_response()
    }
}

fn check_command_header(header: Option<&str>) -> Result<(), Envelope> {
    match header {
        Some(header) if header == COMMAND_HEADER => Ok(()),
        other => Err(Envelope {
            code: ErrorKind::UnrecognizedHeader,
            msg: format!("unrecognized header '{}'", other.unwrap_or("")),
        }),
    }
}

pub fn create_router() -> Router<ExecutorState> {
    Router::new()
        .route("/update_factor", post(update_factor))
        .route("/update_tick_data", post(update_tick_data))
        .route("/update_factor/status", post(task_status))
        .route("/update_tick_data/status", post(task_status))
        .route("/update_factor/stop", post(stop_task))
        .route("/update_tick_data/stop", post(stop_task))
        .route("/stop_all", post(stop_all))
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(state: ExecutorState) -> anyhow::Result<()> {
    let address = format!("0.0.0.0:{}", state.opts.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!("executor listening on http://{address}");
    let router = create_router().with_state(state);
    axum::serve(listener, router).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct UpdateFactorForm {
    #[serde(rename = "HEADER")]
    header: Option<String>,
    factor: Option<String>,
    version: Option<String>,
    stock_code: Option<String>,
    task_id: Option<String>,
}

async fn update_factor(
    State(state): State<ExecutorState>,
    Form(form): Form<UpdateFactorForm>,
) -> Envelope {
    if let Err(resp) = check_command_header(form.header.as_deref()) {
        return resp;
    }
    let (Some(factor), Some(version), Some(stock_code), Some(task_id)) =
        (form.factor, form.version, form.stock_code, form.task_id)
    else {
        return Envelope::code(ErrorKind::ParameterMissingOrInvalid);
    };

    Envelope::of(
        state
            .planner
            .update_factor(&factor, &version, &stock_code, &task_id)
            .await
            .map(|days| format!("{days} days of factors updating...")),
    )
}

#[derive(Debug, Deserialize)]
struct UpdateTickForm {
    #[serde(rename = "HEADER")]
    header: Option<String>,
    stock_code: Option<String>,
    task_id: Option<String>,
}

async fn update_tick_data(
    State(state): State<ExecutorState>,
    Form(form): Form<UpdateTickForm>,
) -> Envelope {
    if let Err(resp) = check_command_header(form.header.as_deref()) {
        return resp;
    }
    let (Some(stock_code), Some(task_id)) = (form.stock_code, form.task_id) else {
        return Envelope::code(ErrorKind::ParameterMissingOrInvalid);
    };

    Envelope::of(
        state
            .planner
            .update_tick(&stock_code, &task_id)
            .await
            .map(|days| format!("{days} days of tick data updating...")),
    )
}

#[derive(Debug, Deserialize)]
struct TaskIdForm {
    #[serde(rename = "HEADER")]
    header: Option<String>,
    task_id: Option<String>,
}

async fn task_status(
    State(state): State<ExecutorState>,
    Form(form): Form<TaskIdForm>,
) -> Envelope {
    if let Err(resp) = check_command_header(form.header.as_deref()) {
        return resp;
    }
    let Some(task_id) = form.task_id else {
        return Envelope::code(ErrorKind::ParameterMissingOrInvalid);
    };

    Envelope::of(
        state
            .pool
            .query_group_progress(&task_id)
            .await
            .map(|progress| {
                format!(
                    "total tasks:{} total finished:{} finished ratio:{}%\n\
                     finished tasks:{} aborted tasks:{}",
                    progress.total,
                    progress.finished + progress.aborted,
                    (progress.finish_ratio * 100.0) as u32,
                    progress.finished,
                    progress.aborted,
                )
            }),
    )
}

async fn stop_task(State(state): State<ExecutorState>, Form(form): Form<TaskIdForm>) -> Envelope {
    if let Err(resp) = check_command_header(form.header.as_deref()) {
        return resp;
    }
    let Some(task_id) = form.task_id else {
        return Envelope::code(ErrorKind::ParameterMissingOrInvalid);
    };

    Envelope::of(
        state
            .pool
            .stop_task_group(&task_id)
            .await
            .map(|()| "task group stopped".to_string()),
    )
}

async fn stop_all(State(state): State<ExecutorState>) -> Envelope {
    let result = async {
        state.pool.stop_task_groups(UnitKind::UpdateFactor).await?;
        state.pool.stop_task_groups(UnitKind::UpdateTick).await?;
        Ok("all task groups stopped".to_string())
    }
    .await;
    Envelope::of(result)
}
