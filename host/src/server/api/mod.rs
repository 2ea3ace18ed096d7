//! Route assembly and the response envelope shared by every endpoint.

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use factorkeeper_lib::{proto, ErrorKind, FkResult};
use tower::ServiceBuilder;
use tower_http::cors::{self, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::AppState;

pub mod callback;
pub mod factor;
pub mod stock;
pub mod task;
pub mod worker;

/// Request bodies are capped here; a full-day frame in JSON rows plus
/// form encoding overhead stays well under this.
const MAX_BODY_SIZE: usize = 64 << 20;

/// Every endpoint answers 200 with the text envelope
/// `"<RET_HDR><code> <msg>"`; the code carries the outcome.
pub struct Envelope {
    code: ErrorKind,
    msg: String,
}

impl Envelope {
    pub fn success(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorKind::Success,
            msg: msg.into(),
        }
    }

    pub fn code(code: ErrorKind) -> Self {
        Self {
            code,
            msg: code.to_string(),
        }
    }

    pub fn with_msg(code: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
        }
    }

    pub fn of(result: FkResult<String>) -> Self {
        match result {
            Ok(msg) => Self::success(msg),
            Err(code) => Self::code(code),
        }
    }
}

impl From<ErrorKind> for Envelope {
    fn from(code: ErrorKind) -> Self {
        Self::code(code)
    }
}

impl IntoResponse for Envelope {
    fn into_response(self) -> Response {
        (StatusCode::OK, proto::make_response(self.code, &self.msg)).into_response()
    }
}

/// Gate for the `HEADER` form field on worker, command and callback
/// routes.
pub fn check_header(got: Option<&str>, expected: &str) -> Result<(), Envelope> {
    match got {
        Some(header) if header == expected => Ok(()),
        other => Err(Envelope::with_msg(
            ErrorKind::UnrecognizedHeader,
            format!("unrecognized header '{}'", other.unwrap_or("")),
        )),
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "FactorKeeper Coordinator API",
        version = "0.2",
        description = "Control surface of the factorkeeper coordinator node",
    ),
    tags(
        (name = "Factor", description = "Factor, version and linkage management"),
        (name = "Stock", description = "Tick data and stock views"),
        (name = "Task", description = "Task listing and administration"),
        (name = "Worker", description = "Worker registration, heartbeats and callbacks"),
    )
)]
pub struct Docs;

#[must_use]
pub fn create_docs() -> utoipa::openapi::OpenApi {
    [
        worker::create_docs(),
        task::create_docs(),
        factor::create_docs(),
        stock::create_docs(),
        callback::create_docs(),
    ]
    .into_iter()
    .fold(Docs::openapi(), |mut doc, sub_doc| {
        doc.merge(sub_doc);
        doc
    })
}

pub fn create_router() -> Router<AppState> {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([header::ORIGIN, header::ACCEPT, header::CONTENT_TYPE])
        .allow_origin(cors::Any);

    let middleware = ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::overriding(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        ))
        // axum's own 2 MB default would trip on full-day frames
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(cors);

    Router::new()
        .merge(worker::create_router())
        .merge(task::create_router())
        .merge(factor::create_router())
        .merge(stock::create_router())
        .merge(callback::create_router())
        .layer(middleware)
        .layer(TraceLayer::new_for_http())
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", create_docs()))
        .fallback(|uri: Uri| async move {
            (StatusCode::NOT_FOUND, format!("No handler found for {uri}"))
        })
}
