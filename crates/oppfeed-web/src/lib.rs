//! Minimal HTTP surface: liveness ping and a read-only opportunity listing.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use oppfeed_core::StoredOpportunity;
use oppfeed_store::RecordStore;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "oppfeed-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Default, Deserialize)]
struct OpportunityFilter {
    posted: Option<bool>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping_handler))
        .route("/opportunities", get(opportunities_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn ping_handler() -> Json<serde_json::Value> {
    Json(json!({ "message": "Bot is running" }))
}

/// Newest first. `?posted=true|false` narrows by posted flag.
async fn opportunities_handler(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<OpportunityFilter>,
) -> Response {
    match state.store.list_all().await {
        Ok(rows) => {
            let rows: Vec<StoredOpportunity> = match filter.posted {
                Some(posted) => rows.into_iter().filter(|r| r.posted == posted).collect(),
                None => rows,
            };
            Json(rows).into_response()
        }
        Err(err) => server_error(err.into()),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}
