//! HTTP-facing wrapper around [`bridge_core::error::BridgeError`]: renders
//! the OpenAI `{error: {message, type, code}}` envelope at the status the
//! error carries (spec §7).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bridge_core::error::BridgeError;

pub struct ApiError(pub BridgeError);

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = self.0.to_openai_envelope();
        tracing::warn!(status = status.as_u16(), error = %self.0, "request failed");
        (status, Json(body)).into_response()
    }
}
