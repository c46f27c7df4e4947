//! Request/response types and the JSON protocol-error conventions.
//!
//! Business-logic failures travel as HTTP 200 with `{ok: false, error}`;
//! 4xx is reserved for protocol errors: unparsable JSON, missing fields,
//! unknown slots, unknown endpoints.

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::supervisor::slot::SlotStatus;

/// Protocol-level error: carries an HTTP status and the uniform error body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn unknown_slot(name: &str) -> Self {
        Self::bad_request(format!("unknown slot {name:?}"))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: "not found".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "ok": false, "error": self.message }));
        (self.status, body).into_response()
    }
}

/// `axum::Json` with the rejection reshaped into our 400 convention.
#[derive(Debug)]
pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError::bad_request(rejection.body_text())),
        }
    }
}

/// Business failure body; always served with HTTP 200.
pub fn fail(error: impl std::fmt::Display) -> Json<serde_json::Value> {
    Json(json!({ "ok": false, "error": error.to_string() }))
}

#[derive(Debug, Serialize)]
pub struct DevicesResponse {
    pub ok: bool,
    pub slots: Vec<SlotStatus>,
    pub host_ip: String,
    pub hostname: String,
}

#[derive(Debug, Serialize)]
pub struct InfoResponse {
    pub ok: bool,
    pub slots: usize,
    pub present: usize,
    pub running: usize,
    pub flapping: usize,
    pub host_ip: String,
    pub hostname: String,
    pub uptime: u64,
}

#[derive(Debug, Serialize)]
pub struct DiscoverDevice {
    pub url: String,
    pub port: u16,
    pub tty: Option<String>,
    pub label: Option<String>,
    pub slot_key: String,
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub slot_key: String,
    #[serde(default)]
    pub devnode: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StopRequest {
    pub slot_key: String,
}

/// Reference to a slot by label or key.
#[derive(Debug, Deserialize)]
pub struct SlotRef {
    pub slot: String,
}

#[derive(Debug, Deserialize)]
pub struct MonitorRequest {
    pub slot: String,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct HumanRequest {
    pub message: String,
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub since: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub timeout: Option<f64>,
}
