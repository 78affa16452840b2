//! 中继错误分类
//!
//! | 类型 | 是否重试 |
//! |------|----------|
//! | ValidationError | 否，同步返回 400 |
//! | ProviderAuthError | 否，立即终止重试 |
//! | ProviderApiError | 是 |
//! | TransportError | 是 |
//! | ByteCountMismatchError | 是，即使目标返回 2xx |

use super::buffer::RelayBufferError;
use crate::events::{ResponseInfo, SerializedError};
use crate::provider::ProviderError;
use serde_json::{json, Map};

#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    /// 会话配置无效
    #[error("{0}")]
    Validation(String),

    /// 远端来源错误
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// 上传过程中的网络/协议错误
    #[error("{message}")]
    Transport {
        message: String,
        status: Option<u16>,
        response: Option<Box<ResponseInfo>>,
    },

    /// 目标接收的字节数与声明大小不一致
    #[error("upload sent {uploaded} bytes but {expected} bytes were expected")]
    ByteCountMismatch {
        uploaded: u64,
        expected: u64,
        response: Option<Box<ResponseInfo>>,
    },

    /// 会话已取消
    #[error("upload cancelled")]
    Cancelled,
}

impl RelayError {
    pub fn transport(message: impl Into<String>) -> Self {
        RelayError::Transport {
            message: message.into(),
            status: None,
            response: None,
        }
    }

    /// 从 reqwest 错误转换，去掉 URL 以及请求/响应对象
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        RelayError::Transport {
            message: err.without_url().to_string(),
            status,
            response: None,
        }
    }

    /// 目标返回错误状态码
    pub fn http_status(status: u16, response: ResponseInfo) -> Self {
        RelayError::Transport {
            message: format!("upload destination responded with HTTP {}", status),
            status: Some(status),
            response: Some(Box::new(response)),
        }
    }

    /// 是否允许重试
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::Validation(_) | RelayError::Cancelled => false,
            RelayError::Provider(e) => e.is_retryable(),
            RelayError::Transport { .. } | RelayError::ByteCountMismatch { .. } => true,
        }
    }

    /// 线上错误名
    pub fn name(&self) -> &'static str {
        match self {
            RelayError::Validation(_) => "ValidationError",
            RelayError::Provider(ProviderError::Auth { .. }) => "ProviderAuthError",
            RelayError::Provider(_) => "ProviderApiError",
            RelayError::Transport { .. } => "TransportError",
            RelayError::ByteCountMismatch { .. } => "ByteCountMismatchError",
            RelayError::Cancelled => "CancelledError",
        }
    }

    /// 附带的目标响应（已去除 set-cookie）
    pub fn response(&self) -> Option<&ResponseInfo> {
        match self {
            RelayError::Transport { response, .. } | RelayError::ByteCountMismatch { response, .. } => {
                response.as_deref()
            }
            _ => None,
        }
    }

    /// 序列化为 `{name, message, ...}`，不含调用栈和请求/响应对象
    pub fn to_serialized(&self) -> SerializedError {
        let mut details = Map::new();
        match self {
            RelayError::Provider(ProviderError::Auth { .. }) => {
                details.insert("isAuthError".to_string(), json!(true));
            }
            RelayError::Provider(ProviderError::Api { status: Some(s), .. })
            | RelayError::Transport { status: Some(s), .. } => {
                details.insert("statusCode".to_string(), json!(s));
            }
            RelayError::ByteCountMismatch {
                uploaded, expected, ..
            } => {
                details.insert("bytesUploaded".to_string(), json!(uploaded));
                details.insert("bytesExpected".to_string(), json!(expected));
            }
            _ => {}
        }

        SerializedError {
            name: self.name().to_string(),
            message: self.to_string(),
            details,
        }
    }
}

impl From<RelayBufferError> for RelayError {
    fn from(err: RelayBufferError) -> Self {
        RelayError::transport(err.to_string())
    }
}
