//! Stock status and stock view creation.

use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Form, Router};
use factorkeeper_lib::proto::DATE_FORMAT;
use factorkeeper_lib::ErrorKind;
use serde::Deserialize;
use utoipa::OpenApi;

use crate::server::api::Envelope;
use crate::AppState;

#[derive(OpenApi)]
#[openapi(paths(stock_status, create_stock_view))]
pub struct Docs;

#[must_use]
pub fn create_docs() -> utoipa::openapi::OpenApi {
    Docs::openapi()
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/stock/:stock_code", get(stock_status))
        .route("/stock_view", post(create_stock_view))
}

#[utoipa::path(get, path = "/stock/{stock_code}", tag = "Stock",
    params(("stock_code" = String, Path, description = "Stock code")),
    responses((status = 200, description = "Ingested vs. pending dates", body = String)))]
async fn stock_status(
    State(state): State<AppState>,
    Path(stock_code): Path<String>,
) -> Envelope {
    let result = async {
        let (updated, pending) = state.store.stock_status(&stock_code).await?;
        let updated: Vec<String> = updated
            .iter()
            .map(|day| day.format(DATE_FORMAT).to_string())
            .collect();
        let pending: Vec<String> = pending
            .iter()
            .map(|day| day.format(DATE_FORMAT).to_string())
            .collect();
        Ok(format!(
            "Stock Code: {stock_code}\nUpdated Dates: {updated:?}\nTo Update Dates: {pending:?}"
        ))
    }
    .await;
    Envelope::of(result)
}

#[derive(Debug, Deserialize)]
struct StockViewForm {
    stock_view_name: Option<String>,
    stock_view_relation: Option<String>,
}

#[utoipa::path(post, path = "/stock_view", tag = "Stock",
    responses((status = 200, description = "Creation outcome envelope", body = String)))]
async fn create_stock_view(
    State(state): State<AppState>,
    Form(form): Form<StockViewForm>,
) -> Envelope {
    let Some(view_name) = form.stock_view_name else {
        return Envelope::code(ErrorKind::ParameterMissingOrInvalid);
    };
    let relation: BTreeMap<String, Vec<String>> = match form
        .stock_view_relation
        .as_deref()
        .map(serde_json::from_str)
    {
        Some(Ok(relation)) => relation,
        _ => return Envelope::code(ErrorKind::ParameterMissingOrInvalid),
    };

    match state.store.create_stock_view(&view_name, &relation).await {
        Ok(()) => Envelope::success(format!("stock view '{view_name}' created")),
        Err(ErrorKind::InvalidStockViewName) => Envelope::with_msg(
            ErrorKind::InvalidStockViewName,
            "stock view name must match [a-zA-Z_\\-.0-9]+ and end with '.VIEW'",
        ),
        Err(err) => Envelope::code(err),
    }
}
