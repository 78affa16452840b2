//! WebSocket 消息类型定义
//!
//! 服务端推送的消息即 [`RelayEvent`](crate::events::RelayEvent) 的 JSON

use crate::events::topics;
use serde::{Deserialize, Serialize};

/// 客户端发送给服务端的控制指令
///
/// 格式：`{"action": "pause" | "resume" | "cancel", "payload": {...}}`，payload 被忽略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientAction {
    Pause,
    Resume,
    Cancel,
}

impl ClientAction {
    /// 指令对应的总线主题
    pub fn topic(&self, token: &str) -> String {
        match self {
            ClientAction::Pause => topics::pause(token),
            ClientAction::Resume => topics::resume(token),
            ClientAction::Cancel => topics::cancel(token),
        }
    }
}
