//! WebSocket 模块
//!
//! 每个连接绑定一个会话 token：推送会话事件，接收暂停/恢复/取消指令

mod handler;
mod message;

pub use handler::handle_websocket;
pub use message::ClientAction;
