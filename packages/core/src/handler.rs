//! HTTP surface.
//!
//! `GET /` answers with one named, decimal-string fee per configured target.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::error::AppError;
use crate::gasprice::{FeeEstimates, GasPriceError};

#[derive(Clone)]
pub struct AppState {
    pub estimator: Arc<dyn FeeEstimates>,
    pub names: Arc<[String]>,
    pub request_timeout: Duration,
    /// Cancelled on server shutdown; every request waits on a child token.
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(gas_prices))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn gas_prices(State(state): State<AppState>) -> Result<Json<BTreeMap<String, String>>, AppError> {
    let cancel = state.shutdown.child_token();
    let prices = tokio::time::timeout(state.request_timeout, state.estimator.fee_levels(&cancel))
        .await
        .unwrap_or(Err(GasPriceError::Cancelled))
        .map_err(|err| {
            warn!(error = %err, "could not get gas price");
            AppError::from(err)
        })?;

    let levels = state
        .names
        .iter()
        .zip(prices)
        .map(|(name, price)| (name.clone(), price.to_string()))
        .collect();
    Ok(Json(levels))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
