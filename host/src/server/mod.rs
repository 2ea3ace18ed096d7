pub mod api;

use anyhow::Context;
use tracing::info;

use crate::AppState;

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let address = state.opts.address.clone();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("bind {address}"))?;
    info!("coordinator listening on http://{address}");

    let router = api::create_router().with_state(state);
    axum::serve(listener, router).await.context("server exited")
}
