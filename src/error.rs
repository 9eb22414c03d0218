//! 统一的 API 错误类型与转换。

use axum::Json;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use crate::store::StoreError;

/// 面向客户端的错误；内部细节只写日志，不进入响应体。
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound,
    Conflict(String),
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "status": "error", "message": msg })),
            )
                .into_response(),
            ApiError::Unauthorized => {
                let mut headers = HeaderMap::new();
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static(r#"Basic realm="Restricted""#),
                );
                (StatusCode::UNAUTHORIZED, headers, "unauthorized").into_response()
            }
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found").into_response(),
            ApiError::Conflict(msg) => (
                StatusCode::CONFLICT,
                Json(json!({ "status": "error", "message": msg })),
            )
                .into_response(),
            ApiError::Internal => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => ApiError::NotFound,
            StoreError::Misconfigured(source) => {
                error!(
                    error = %source,
                    "unexpected object store redirect, the configured bucket is probably not in the configured region"
                );
                ApiError::Internal
            }
            other => {
                error!(error = %other, "unexpected object store error");
                ApiError::Internal
            }
        }
    }
}
