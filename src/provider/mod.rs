//! 远端来源（Provider）接口
//!
//! 中继核心只依赖 size / download / list / logout 四个操作

mod cache;
mod guard;
mod url;

pub use cache::CachedProvider;
pub use guard::{is_public_ip, public_redirect_policy, PublicOnlyResolver};
pub use url::UrlProvider;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// 下载字节流
pub type ByteStream = BoxStream<'static, Result<Bytes, ProviderError>>;

/// Provider 错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// 远端接口错误（可重试）
    #[error("{message}")]
    Api { status: Option<u16>, message: String },
    /// 凭证被拒绝（不重试）
    #[error("{message}")]
    Auth { message: String },
    /// 网络错误
    #[error("network error: {0}")]
    Network(String),
    /// 请求被本地策略拒绝（不重试）
    #[error("{message}")]
    Rejected { message: String },
}

impl ProviderError {
    pub fn is_auth(&self) -> bool {
        matches!(self, ProviderError::Auth { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Api { .. } | ProviderError::Network(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Api { status, .. } => *status,
            ProviderError::Auth { .. } => Some(401),
            ProviderError::Rejected { .. } => Some(400),
            ProviderError::Network(_) => None,
        }
    }

    /// 从 reqwest 错误转换，消息中不保留 URL（可能带有访问令牌）
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        ProviderError::Network(err.without_url().to_string())
    }
}

/// 把 Provider 错误映射为 HTTP 状态码和消息
///
/// 网络错误返回 None，由调用方按内部错误处理
pub fn error_to_response(err: &ProviderError) -> Option<(u16, String)> {
    match err {
        ProviderError::Auth { .. } => Some((401, "HTTP 401: invalid access token detected".to_string())),
        ProviderError::Api { status, message } => {
            let code = match status {
                Some(s) if *s >= 500 => 502,
                _ => 424,
            };
            Some((code, message.clone()))
        }
        ProviderError::Rejected { message } => Some((400, message.clone())),
        ProviderError::Network(_) => None,
    }
}

/// 文件引用
#[derive(Debug, Clone, Default)]
pub struct FileRef {
    pub id: String,
    /// 访问令牌
    pub token: Option<String>,
    pub query: HashMap<String, String>,
}

/// 列目录请求
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub directory: Option<String>,
    pub token: Option<String>,
    pub query: HashMap<String, String>,
}

/// 目录列表（分页）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryListing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub items: Vec<ListItem>,
    #[serde(default)]
    pub next_page_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListItem {
    pub id: String,
    pub name: String,
    pub is_folder: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    pub request_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// 登出确认
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogoutAck {
    pub revoked: bool,
}

/// 远端来源
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider 名称（路由中的 `{provider}`）
    fn name(&self) -> &str;

    /// 文件大小，未知时返回 None
    async fn size(&self, file: &FileRef) -> Result<Option<u64>, ProviderError>;

    async fn download(&self, file: &FileRef) -> Result<ByteStream, ProviderError>;

    async fn list(&self, request: &ListRequest) -> Result<DirectoryListing, ProviderError>;

    async fn logout(&self, token: Option<&str>) -> Result<LogoutAck, ProviderError>;
}

/// Provider 注册表
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}
