//! 中继事件类型定义
//!
//! 线上格式固定为 `{action, payload}`，客户端按 action 分发

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 中继会话事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "lowercase")]
pub enum RelayEvent {
    /// 已进入租户队列
    Queued(QueuedPayload),
    /// 进度更新
    Progress(ProgressPayload),
    /// 上传完成
    Success(SuccessPayload),
    /// 最终失败
    Error(ErrorPayload),
    /// 本次尝试失败，将重试
    Retry(ErrorPayload),
}

impl RelayEvent {
    /// 线上 action 名称
    pub fn action(&self) -> &'static str {
        match self {
            RelayEvent::Queued(_) => "queued",
            RelayEvent::Progress(_) => "progress",
            RelayEvent::Success(_) => "success",
            RelayEvent::Error(_) => "error",
            RelayEvent::Retry(_) => "retry",
        }
    }

    /// 是否为终态事件
    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayEvent::Success(_) | RelayEvent::Error(_))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// queued 事件的空载荷（序列化为 `{}`）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueuedPayload {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    /// 百分比，保留两位小数
    pub progress: String,
    pub bytes_uploaded: u64,
    pub bytes_total: u64,
}

impl ProgressPayload {
    pub fn new(bytes_uploaded: u64, bytes_total: u64) -> Self {
        Self {
            progress: format!("{:.2}", percentage(bytes_uploaded, bytes_total)),
            bytes_uploaded,
            bytes_total,
        }
    }
}

/// 计算百分比，total 为 0 时返回 0
pub fn percentage(bytes_uploaded: u64, bytes_total: u64) -> f64 {
    if bytes_total == 0 {
        return 0.0;
    }
    (bytes_uploaded as f64 / bytes_total as f64) * 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessPayload {
    pub complete: bool,
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: SerializedError,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseInfo>,
}

/// 序列化后的错误：name + message + 附加字段，不含调用栈
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    pub name: String,
    pub message: String,
    #[serde(flatten)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

/// 目标服务器的响应摘要
///
/// headers 中不会出现 set-cookie
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseInfo {
    pub response_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// 事件总线上传递的消息
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    /// 会话事件（发布在 token 主题上）
    Event(RelayEvent),
    /// 无载荷信号（connection / pause / resume / cancel）
    Signal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_progress_wire_shape() {
        let event = RelayEvent::Progress(ProgressPayload::new(9, 18));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "action": "progress",
                "payload": {"progress": "50.00", "bytesUploaded": 9, "bytesTotal": 18}
            })
        );
    }

    #[test]
    fn test_queued_payload_is_empty_object() {
        let value = serde_json::to_value(RelayEvent::Queued(QueuedPayload::default())).unwrap();
        assert_eq!(value, json!({"action": "queued", "payload": {}}));
    }

    #[test]
    fn test_retry_error_flattens_details() {
        let mut details = serde_json::Map::new();
        details.insert("statusCode".to_string(), json!(500));
        let event = RelayEvent::Retry(ErrorPayload {
            error: SerializedError {
                name: "TransportError".to_string(),
                message: "upload failed".to_string(),
                details,
            },
            response: None,
        });

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["action"], "retry");
        assert_eq!(value["payload"]["error"]["name"], "TransportError");
        assert_eq!(value["payload"]["error"]["statusCode"], 500);
        assert!(value["payload"].get("response").is_none());
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_success_round_trip() {
        let json = r#"{"action":"success","payload":{"complete":true,"url":null,"response":{"responseText":"ok","status":200,"headers":{}}}}"#;
        let event: RelayEvent = serde_json::from_str(json).unwrap();
        match &event {
            RelayEvent::Success(p) => {
                assert!(p.complete);
                assert_eq!(p.response.as_ref().unwrap().status, Some(200));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(event.is_terminal());
    }

    #[test]
    fn test_percentage_zero_total() {
        assert_eq!(percentage(10, 0), 0.0);
        assert_eq!(ProgressPayload::new(0, 0).progress, "0.00");
    }
}
