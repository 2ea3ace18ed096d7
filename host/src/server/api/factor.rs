//! Factor, version and linkage routes, plus factor result reads.

use std::collections::{BTreeSet, HashMap};

use axum::extract::{Multipart, Path, State};
use axum::routing::{get, post};
use axum::{Form, Router};
use chrono::NaiveDate;
use factorkeeper_lib::proto::DATE_FORMAT;
use factorkeeper_lib::{ErrorKind, FkResult};
use factorkeeper_scheduler::TaskPayload;
use serde::Deserialize;
use utoipa::OpenApi;

use crate::server::api::Envelope;
use crate::AppState;

#[derive(OpenApi)]
#[openapi(paths(
    create_factor,
    list_factors,
    create_group_factor,
    create_group_version,
    create_version,
    list_versions,
    create_linkage,
    create_latest_linkage,
    trigger_update,
    trigger_latest_update,
    linkage_status,
    list_linked_stocks,
    list_latest_linked_stocks,
    load_day_frame,
    load_latest_day_frame,
    list_updated_dates,
    list_latest_updated_dates,
    update_status,
    latest_update_status,
    load_multi_factors,
    load_multi_factors_by_range,
))]
pub struct Docs;

#[must_use]
pub fn create_docs() -> utoipa::openapi::OpenApi {
    Docs::openapi()
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/factor", post(create_factor).get(list_factors))
        .route("/group_factor", post(create_group_factor))
        .route("/group_factor/version", post(create_group_version))
        .route(
            "/factor/load_multi_factors",
            post(load_multi_factors),
        )
        .route(
            "/factor/load_multi_factors_by_range",
            post(load_multi_factors_by_range),
        )
        .route(
            "/factor/:factor/version",
            post(create_version).get(list_versions),
        )
        .route(
            "/factor/:factor/version/:version/stock",
            get(list_linked_stocks),
        )
        .route("/factor/:factor/stock", get(list_latest_linked_stocks))
        .route(
            "/factor/:factor/version/:version/stock/:stock_code",
            post(create_linkage)
                .put(trigger_update)
                .get(linkage_status),
        )
        .route(
            "/factor/:factor/stock/:stock_code",
            post(create_latest_linkage).put(trigger_latest_update),
        )
        .route(
            "/factor/:factor/version/:version/stock/:stock_code/date/:date",
            get(load_day_frame),
        )
        .route(
            "/factor/:factor/stock/:stock_code/date/:date",
            get(load_latest_day_frame),
        )
        .route(
            "/factor/:factor/version/:version/stock/:stock_code/date",
            get(list_updated_dates),
        )
        .route(
            "/factor/:factor/stock/:stock_code/date",
            get(list_latest_updated_dates),
        )
        .route(
            "/factor/:factor/version/:version/stock/:stock_code/update_status",
            get(update_status),
        )
        .route(
            "/factor/:factor/stock/:stock_code/update_status",
            get(latest_update_status),
        )
}

/// Collect every multipart field into memory; `code` is the archive, the
/// rest are text.
async fn read_multipart(mut multipart: Multipart) -> FkResult<HashMap<String, Vec<u8>>> {
    let mut fields = HashMap::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ErrorKind::ParameterMissingOrInvalid)?
    {
        let name = field.name().unwrap_or_default().to_string();
        let data = field
            .bytes()
            .await
            .map_err(|_| ErrorKind::ParameterMissingOrInvalid)?;
        fields.insert(name, data.to_vec());
    }
    Ok(fields)
}

fn text_field(fields: &HashMap<String, Vec<u8>>, key: &str) -> FkResult<String> {
    fields
        .get(key)
        .and_then(|raw| String::from_utf8(raw.clone()).ok())
        .ok_or(ErrorKind::ParameterMissingOrInvalid)
}

fn code_field(fields: &HashMap<String, Vec<u8>>) -> FkResult<Vec<u8>> {
    fields
        .get("code")
        .cloned()
        .ok_or(ErrorKind::ParameterMissingOrInvalid)
}

fn parse_day(raw: &str) -> FkResult<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT).map_err(|_| ErrorKind::ParameterMissingOrInvalid)
}

fn parse_factor_map(raw: &str) -> FkResult<Vec<(String, Option<String>)>> {
    let map: HashMap<String, Option<String>> =
        serde_json::from_str(raw).map_err(|_| ErrorKind::ParameterMissingOrInvalid)?;
    Ok(map.into_iter().collect())
}

async fn version_or_latest(
    state: &AppState,
    factor: &str,
    version: Option<String>,
) -> FkResult<String> {
    match version {
        Some(version) => Ok(version),
        None => state.store.get_latest_version(factor).await,
    }
}

#[utoipa::path(post, path = "/factor", tag = "Factor",
    responses((status = 200, description = "Creation outcome envelope", body = String)))]
async fn create_factor(State(state): State<AppState>, multipart: Multipart) -> Envelope {
    let result = async {
        let fields = read_multipart(multipart).await?;
        let factor = text_field(&fields, "factor")?;
        let code = code_field(&fields)?;
        state.store.register_factor(&factor, &code).await?;
        Ok("factor created".to_string())
    }
    .await;
    Envelope::of(result)
}

#[utoipa::path(get, path = "/factor", tag = "Factor",
    responses((status = 200, description = "Factor listing", body = String)))]
async fn list_factors(State(state): State<AppState>) -> Envelope {
    Envelope::of(
        state
            .store
            .list_factors()
            .await
            .map(|factors| format!("{factors:?}")),
    )
}

#[utoipa::path(post, path = "/group_factor", tag = "Factor",
    responses((status = 200, description = "Creation outcome envelope", body = String)))]
async fn create_group_factor(State(state): State<AppState>, multipart: Multipart) -> Envelope {
    let result = async {
        let fields = read_multipart(multipart).await?;
        let members: Vec<String> = serde_json::from_str(&text_field(&fields, "factors")?)
            .map_err(|_| ErrorKind::ParameterMissingOrInvalid)?;
        let code = code_field(&fields)?;
        let group = state.store.register_group_factor(&members, &code).await?;
        Ok(format!("group factor '{group}' created"))
    }
    .await;
    Envelope::of(result)
}

#[utoipa::path(post, path = "/group_factor/version", tag = "Factor",
    responses((status = 200, description = "Creation outcome envelope", body = String)))]
async fn create_group_version(State(state): State<AppState>, multipart: Multipart) -> Envelope {
    let result = async {
        let fields = read_multipart(multipart).await?;
        let members: Vec<String> = serde_json::from_str(&text_field(&fields, "factors")?)
            .map_err(|_| ErrorKind::ParameterMissingOrInvalid)?;
        let version = text_field(&fields, "version")?;
        let code = code_field(&fields)?;
        state
            .store
            .create_group_version_for_members(&members, &version, &code)
            .await?;
        Ok("group version created".to_string())
    }
    .await;
    Envelope::of(result)
}

#[utoipa::path(post, path = "/factor/{factor}/version", tag = "Factor",
    params(("factor" = String, Path, description = "Factor name")),
    responses((status = 200, description = "Creation outcome envelope", body = String)))]
async fn create_version(
    State(state): State<AppState>,
    Path(factor): Path<String>,
    multipart: Multipart,
) -> Envelope {
    let result = async {
        let fields = read_multipart(multipart).await?;
        let version = text_field(&fields, "version")?;
        let code = code_field(&fields)?;
        state.store.create_version(&factor, &version, &code).await?;
        Ok("version created".to_string())
    }
    .await;
    Envelope::of(result)
}

#[utoipa::path(get, path = "/factor/{factor}/version", tag = "Factor",
    params(("factor" = String, Path, description = "Factor name")),
    responses((status = 200, description = "Version listing", body = String)))]
async fn list_versions(State(state): State<AppState>, Path(factor): Path<String>) -> Envelope {
    Envelope::of(
        state
            .store
            .list_versions(&factor)
            .await
            .map(|versions| format!("{versions:?}")),
    )
}

#[utoipa::path(post, path = "/factor/{factor}/version/{version}/stock/{stock_code}", tag = "Factor",
    params(
        ("factor" = String, Path, description = "Factor name"),
        ("version" = String, Path, description = "Version label"),
        ("stock_code" = String, Path, description = "Stock code"),
    ),
    responses((status = 200, description = "Creation outcome envelope", body = String)))]
async fn create_linkage(
    State(state): State<AppState>,
    Path((factor, version, stock_code)): Path<(String, String, String)>,
) -> Envelope {
    Envelope::of(
        state
            .store
            .create_linkage(&factor, &version, &stock_code)
            .await
            .map(|_| "linkage created".to_string()),
    )
}

#[utoipa::path(post, path = "/factor/{factor}/stock/{stock_code}", tag = "Factor",
    params(
        ("factor" = String, Path, description = "Factor name"),
        ("stock_code" = String, Path, description = "Stock code"),
    ),
    responses((status = 200, description = "Creation outcome envelope", body = String)))]
async fn create_latest_linkage(
    State(state): State<AppState>,
    Path((factor, stock_code)): Path<(String, String)>,
) -> Envelope {
    let result = async {
        let version = version_or_latest(&state, &factor, None).await?;
        state
            .store
            .create_linkage(&factor, &version, &stock_code)
            .await?;
        Ok("linkage created".to_string())
    }
    .await;
    Envelope::of(result)
}

async fn trigger_update_inner(
    state: &AppState,
    factor: String,
    version: Option<String>,
    stock_code: String,
) -> FkResult<String> {
    let version = version_or_latest(state, &factor, version).await?;
    state
        .manager
        .new_task(TaskPayload::UpdateFactor {
            factor,
            version,
            stock_code,
        })
        .await
}

#[utoipa::path(put, path = "/factor/{factor}/version/{version}/stock/{stock_code}", tag = "Factor",
    params(
        ("factor" = String, Path, description = "Factor name"),
        ("version" = String, Path, description = "Version label"),
        ("stock_code" = String, Path, description = "Stock code"),
    ),
    responses((status = 200, description = "Update trigger envelope", body = String)))]
async fn trigger_update(
    State(state): State<AppState>,
    Path((factor, version, stock_code)): Path<(String, String, String)>,
) -> Envelope {
    Envelope::of(trigger_update_inner(&state, factor, Some(version), stock_code).await)
}

#[utoipa::path(put, path = "/factor/{factor}/stock/{stock_code}", tag = "Factor",
    params(
        ("factor" = String, Path, description = "Factor name"),
        ("stock_code" = String, Path, description = "Stock code"),
    ),
    responses((status = 200, description = "Update trigger envelope", body = String)))]
async fn trigger_latest_update(
    State(state): State<AppState>,
    Path((factor, stock_code)): Path<(String, String)>,
) -> Envelope {
    Envelope::of(trigger_update_inner(&state, factor, None, stock_code).await)
}

#[utoipa::path(get, path = "/factor/{factor}/version/{version}/stock/{stock_code}", tag = "Factor",
    params(
        ("factor" = String, Path, description = "Factor name"),
        ("version" = String, Path, description = "Version label"),
        ("stock_code" = String, Path, description = "Stock code"),
    ),
    responses((status = 200, description = "Linkage status", body = String)))]
async fn linkage_status(
    State(state): State<AppState>,
    Path((factor, version, stock_code)): Path<(String, String, String)>,
) -> Envelope {
    let result = async {
        let updated = state
            .store
            .list_updated_dates(&factor, &version, &stock_code)
            .await?;
        let available = state.store.available_tick_dates(&stock_code).await?;

        let done: BTreeSet<NaiveDate> = updated.iter().copied().collect();
        let pending: Vec<String> = available
            .iter()
            .filter(|day| !done.contains(day))
            .map(|day| day.format(DATE_FORMAT).to_string())
            .collect();
        let updated: Vec<String> = updated
            .iter()
            .map(|day| day.format(DATE_FORMAT).to_string())
            .collect();

        Ok(format!(
            "Updated Dates:\n{updated:?}\n\nTo Update Dates:\n{pending:?}"
        ))
    }
    .await;
    Envelope::of(result)
}

#[utoipa::path(get, path = "/factor/{factor}/version/{version}/stock", tag = "Factor",
    params(
        ("factor" = String, Path, description = "Factor name"),
        ("version" = String, Path, description = "Version label"),
    ),
    responses((status = 200, description = "Linked stocks", body = String)))]
async fn list_linked_stocks(
    State(state): State<AppState>,
    Path((factor, version)): Path<(String, String)>,
) -> Envelope {
    Envelope::of(
        state
            .store
            .list_linked_stocks(&factor, &version)
            .await
            .map(|stocks| format!("{stocks:?}")),
    )
}

#[utoipa::path(get, path = "/factor/{factor}/stock", tag = "Factor",
    params(("factor" = String, Path, description = "Factor name")),
    responses((status = 200, description = "Linked stocks", body = String)))]
async fn list_latest_linked_stocks(
    State(state): State<AppState>,
    Path(factor): Path<String>,
) -> Envelope {
    let result = async {
        let version = version_or_latest(&state, &factor, None).await?;
        let stocks = state.store.list_linked_stocks(&factor, &version).await?;
        Ok(format!("{stocks:?}"))
    }
    .await;
    Envelope::of(result)
}

async fn load_day_frame_inner(
    state: &AppState,
    factor: String,
    version: Option<String>,
    stock_code: String,
    date: String,
) -> FkResult<String> {
    let version = version_or_latest(state, &factor, version).await?;
    let day = parse_day(&date)?;
    let frame = state
        .store
        .load_factor_result(&factor, &version, &stock_code, day)
        .await?;
    frame.to_json()
}

#[utoipa::path(get, path = "/factor/{factor}/version/{version}/stock/{stock_code}/date/{date}", tag = "Factor",
    params(
        ("factor" = String, Path, description = "Factor name"),
        ("version" = String, Path, description = "Version label"),
        ("stock_code" = String, Path, description = "Stock code"),
        ("date" = String, Path, description = "Trading day, YYYY-MM-DD"),
    ),
    responses((status = 200, description = "One day of factor results as JSON rows", body = String)))]
async fn load_day_frame(
    State(state): State<AppState>,
    Path((factor, version, stock_code, date)): Path<(String, String, String, String)>,
) -> Envelope {
    Envelope::of(load_day_frame_inner(&state, factor, Some(version), stock_code, date).await)
}

#[utoipa::path(get, path = "/factor/{factor}/stock/{stock_code}/date/{date}", tag = "Factor",
    params(
        ("factor" = String, Path, description = "Factor name"),
        ("stock_code" = String, Path, description = "Stock code"),
        ("date" = String, Path, description = "Trading day, YYYY-MM-DD"),
    ),
    responses((status = 200, description = "One day of factor results as JSON rows", body = String)))]
async fn load_latest_day_frame(
    State(state): State<AppState>,
    Path((factor, stock_code, date)): Path<(String, String, String)>,
) -> Envelope {
    Envelope::of(load_day_frame_inner(&state, factor, None, stock_code, date).await)
}

async fn updated_dates_inner(
    state: &AppState,
    factor: String,
    version: Option<String>,
    stock_code: String,
) -> FkResult<String> {
    let version = version_or_latest(state, &factor, version).await?;
    let dates: Vec<String> = state
        .store
        .list_updated_dates(&factor, &version, &stock_code)
        .await?
        .iter()
        .map(|day| day.format(DATE_FORMAT).to_string())
        .collect();
    Ok(format!("{dates:?}"))
}

#[utoipa::path(get, path = "/factor/{factor}/version/{version}/stock/{stock_code}/date", tag = "Factor",
    params(
        ("factor" = String, Path, description = "Factor name"),
        ("version" = String, Path, description = "Version label"),
        ("stock_code" = String, Path, description = "Stock code"),
    ),
    responses((status = 200, description = "Updated dates", body = String)))]
async fn list_updated_dates(
    State(state): State<AppState>,
    Path((factor, version, stock_code)): Path<(String, String, String)>,
) -> Envelope {
    Envelope::of(updated_dates_inner(&state, factor, Some(version), stock_code).await)
}

#[utoipa::path(get, path = "/factor/{factor}/stock/{stock_code}/date", tag = "Factor",
    params(
        ("factor" = String, Path, description = "Factor name"),
        ("stock_code" = String, Path, description = "Stock code"),
    ),
    responses((status = 200, description = "Updated dates", body = String)))]
async fn list_latest_updated_dates(
    State(state): State<AppState>,
    Path((factor, stock_code)): Path<(String, String)>,
) -> Envelope {
    Envelope::of(updated_dates_inner(&state, factor, None, stock_code).await)
}

async fn update_status_inner(
    state: &AppState,
    factor: String,
    version: Option<String>,
    stock_code: String,
) -> FkResult<String> {
    let version = version_or_latest(state, &factor, version).await?;
    let status = state
        .manager
        .query_task(TaskPayload::UpdateFactor {
            factor,
            version,
            stock_code,
        })
        .await?;
    Ok(status.to_string())
}

#[utoipa::path(get, path = "/factor/{factor}/version/{version}/stock/{stock_code}/update_status", tag = "Factor",
    params(
        ("factor" = String, Path, description = "Factor name"),
        ("version" = String, Path, description = "Version label"),
        ("stock_code" = String, Path, description = "Stock code"),
    ),
    responses((status = 200, description = "Update task status", body = String)))]
async fn update_status(
    State(state): State<AppState>,
    Path((factor, version, stock_code)): Path<(String, String, String)>,
) -> Envelope {
    Envelope::of(update_status_inner(&state, factor, Some(version), stock_code).await)
}

#[utoipa::path(get, path = "/factor/{factor}/stock/{stock_code}/update_status", tag = "Factor",
    params(
        ("factor" = String, Path, description = "Factor name"),
        ("stock_code" = String, Path, description = "Stock code"),
    ),
    responses((status = 200, description = "Update task status", body = String)))]
async fn latest_update_status(
    State(state): State<AppState>,
    Path((factor, stock_code)): Path<(String, String)>,
) -> Envelope {
    Envelope::of(update_status_inner(&state, factor, None, stock_code).await)
}

#[derive(Debug, Deserialize)]
struct MultiFactorForm {
    factors: Option<String>,
    stock_code: Option<String>,
    fetch_date: Option<String>,
}

#[utoipa::path(post, path = "/factor/load_multi_factors", tag = "Factor",
    responses((status = 200, description = "Joined multi-factor frame", body = String)))]
async fn load_multi_factors(
    State(state): State<AppState>,
    Form(form): Form<MultiFactorForm>,
) -> Envelope {
    let result = async {
        let factors =
            parse_factor_map(form.factors.as_deref().ok_or(ErrorKind::ParameterMissingOrInvalid)?)?;
        let stock_code = form
            .stock_code
            .ok_or(ErrorKind::ParameterMissingOrInvalid)?;
        let day = parse_day(
            form.fetch_date
                .as_deref()
                .ok_or(ErrorKind::ParameterMissingOrInvalid)?,
        )?;
        let frame = state
            .store
            .load_multi_factors(&factors, &stock_code, day)
            .await?;
        frame.to_json()
    }
    .await;
    Envelope::of(result)
}

#[derive(Debug, Deserialize)]
struct MultiFactorRangeForm {
    factors: Option<String>,
    stock_code: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
}

#[utoipa::path(post, path = "/factor/load_multi_factors_by_range", tag = "Factor",
    responses((status = 200, description = "Joined multi-factor frame", body = String)))]
async fn load_multi_factors_by_range(
    State(state): State<AppState>,
    Form(form): Form<MultiFactorRangeForm>,
) -> Envelope {
    let result = async {
        let factors =
            parse_factor_map(form.factors.as_deref().ok_or(ErrorKind::ParameterMissingOrInvalid)?)?;
        let stock_code = form
            .stock_code
            .ok_or(ErrorKind::ParameterMissingOrInvalid)?;
        let start = parse_day(
            form.start_date
                .as_deref()
                .ok_or(ErrorKind::ParameterMissingOrInvalid)?,
        )?;
        let end = parse_day(
            form.end_date
                .as_deref()
                .ok_or(ErrorKind::ParameterMissingOrInvalid)?,
        )?;
        let frame = state
            .store
            .load_multi_factors_by_range(&factors, &stock_code, start, end)
            .await?;
        frame.to_json()
    }
    .await;
    Envelope::of(result)
}
