// 远端来源API处理器：列目录、登出

use super::provider_token;
use crate::provider::{DirectoryListing, ListRequest, LogoutAck, Provider};
use crate::server::{ApiError, ApiResult, AppState};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

fn lookup(state: &AppState, name: &str) -> ApiResult<Arc<dyn Provider>> {
    state
        .providers
        .get(name)
        .ok_or_else(|| ApiError::not_found(format!("unknown provider: {}", name)))
}

async fn list(
    state: &AppState,
    provider_name: &str,
    directory: Option<String>,
    query: HashMap<String, String>,
    headers: &HeaderMap,
) -> ApiResult<Json<DirectoryListing>> {
    let provider = lookup(state, provider_name)?;
    let request = ListRequest {
        directory,
        token: provider_token(headers),
        query,
    };
    match state.service.list(provider.as_ref(), &request).await {
        Ok(listing) => Ok(Json(listing)),
        Err(e) => {
            error!("列目录失败: provider={}, error={}", provider_name, e);
            Err(e.into())
        }
    }
}

/// GET /api/v1/:provider/list/
pub async fn list_root(
    State(state): State<AppState>,
    Path(provider_name): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<Json<DirectoryListing>> {
    list(&state, &provider_name, None, query, &headers).await
}

/// GET /api/v1/:provider/list/*id
pub async fn list_directory(
    State(state): State<AppState>,
    Path((provider_name, id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<Json<DirectoryListing>> {
    list(&state, &provider_name, Some(id), query, &headers).await
}

/// POST /api/v1/:provider/logout
pub async fn logout(
    State(state): State<AppState>,
    Path(provider_name): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<LogoutAck>> {
    let provider = lookup(&state, &provider_name)?;
    let token = provider_token(&headers);
    let ack = provider.logout(token.as_deref()).await?;
    Ok(Json(ack))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::server::api_routes;
    use crate::test_util::spawn_server;
    use axum::Router;
    use serde_json::Value;

    async fn server() -> String {
        let mut config = AppConfig::default();
        config.relay.list_retry_delays_secs = vec![];
        let state = AppState::new(config).unwrap();
        spawn_server(Router::new().nest("/api/v1", api_routes(state))).await
    }

    #[tokio::test]
    async fn test_list_unsupported_for_url_provider() {
        let base = server().await;
        let resp = reqwest::get(format!("{}/api/v1/url/list/some/dir", base))
            .await
            .unwrap();
        // Api 400 -> 424
        assert_eq!(resp.status(), 424);
        let body: Value = resp.json().await.unwrap();
        assert!(body["message"].is_string());

        let resp = reqwest::get(format!("{}/api/v1/missing/list/", base))
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_logout() {
        let base = server().await;
        let resp = reqwest::Client::new()
            .post(format!("{}/api/v1/url/logout", base))
            .header(super::super::AUTH_TOKEN_HEADER, "abc")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["revoked"], true);
    }
}
