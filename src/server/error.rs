// API 错误响应：统一渲染为 `{ "message": ... }`

use crate::provider::{error_to_response, ProviderError};
use crate::relay::RelayRejection;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

impl From<RelayRejection> for ApiError {
    fn from(rejection: RelayRejection) -> Self {
        let status =
            StatusCode::from_u16(rejection.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, rejection.message)
    }
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        match error_to_response(&err) {
            Some((status, message)) => Self::new(
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                message,
            ),
            None => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_mapping() {
        let auth: ApiError = ProviderError::Auth {
            message: "x".to_string(),
        }
        .into();
        assert_eq!(auth.status, StatusCode::UNAUTHORIZED);

        let upstream: ApiError = ProviderError::Api {
            status: Some(503),
            message: "down".to_string(),
        }
        .into();
        assert_eq!(upstream.status, StatusCode::BAD_GATEWAY);
        assert_eq!(upstream.message, "down");

        let network: ApiError = ProviderError::Network("reset".to_string()).into();
        assert_eq!(network.status, StatusCode::INTERNAL_SERVER_ERROR);
        // 内部错误细节不返回给调用方
        assert!(!network.message.contains("reset"));
    }
}
