// 中继API处理器

use super::provider_token;
use crate::provider::FileRef;
use crate::relay::session::short_token;
use crate::server::{ApiError, ApiResult, AppState};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{info, warn};

/// Provider 访问令牌请求头
pub const AUTH_TOKEN_HEADER: &str = "uppy-auth-token";

#[derive(Debug, Serialize, Deserialize)]
pub struct StartRelayResponse {
    pub token: String,
}

/// POST /api/v1/:provider/get/:id
/// 开始中继，立即返回 token；后续结果只通过 WebSocket 推送
pub async fn start_relay(
    State(state): State<AppState>,
    Path((provider_name, id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Json<StartRelayResponse>> {
    let provider = state
        .providers
        .get(&provider_name)
        .ok_or_else(|| ApiError::not_found(format!("unknown provider: {}", provider_name)))?;

    let file = FileRef {
        id,
        token: provider_token(&headers),
        query,
    };

    match state.service.start(provider, file, &body).await {
        Ok(token) => {
            info!("[{}] 开始中继: provider={}", short_token(&token), provider_name);
            Ok(Json(StartRelayResponse { token }))
        }
        Err(rejection) => {
            warn!("拒绝中继请求: provider={}, {}", provider_name, rejection);
            Err(rejection.into())
        }
    }
}
