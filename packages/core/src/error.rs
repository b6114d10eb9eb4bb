use std::fmt;
use std::error::Error;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::gasprice::GasPriceError;

/// Unified application error.
///
/// Startup (config, provider, server) and request handling fail through
/// this type so every failure is reported the same way.
#[derive(Debug)]
pub enum AppError {
    Config(String),
    Estimate(GasPriceError),
    Server(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(msg) => write!(f, "Config error: {}", msg),
            AppError::Estimate(err) => write!(f, "Estimate error: {}", err),
            AppError::Server(msg) => write!(f, "Server error: {}", msg),
        }
    }
}

impl Error for AppError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AppError::Estimate(err) => Some(err),
            _ => None,
        }
    }
}

impl From<GasPriceError> for AppError {
    fn from(err: GasPriceError) -> Self {
        match err {
            GasPriceError::InvalidConfiguration(msg) => AppError::Config(msg),
            other => AppError::Estimate(other),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Estimate(GasPriceError::NoSample) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Estimate(GasPriceError::Upstream(_)) => StatusCode::BAD_GATEWAY,
            AppError::Estimate(GasPriceError::Cancelled) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Estimate(GasPriceError::InvalidConfiguration(_))
            | AppError::Estimate(GasPriceError::FetchFailed(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({ "error": self.to_string() }));

        (status, body).into_response()
    }
}
