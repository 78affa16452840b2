// API处理器模块

pub mod provider;
pub mod relay;

pub use provider::{list_directory, list_root, logout};
pub use relay::{start_relay, StartRelayResponse, AUTH_TOKEN_HEADER};

use axum::http::HeaderMap;

/// 请求头中的 Provider 访问令牌
pub(crate) fn provider_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTH_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
