// Stream Relay
// 把远端来源的文件流式中继到上传目标（tus / 对象存储 / HTTP）

// 配置管理模块
pub mod config;

// 中继事件与事件总线
pub mod events;

// 日志
pub mod logging;

// 远端来源
pub mod provider;

// 中继核心
pub mod relay;

// Web服务器模块
pub mod server;

// 会话状态存储
pub mod store;

#[cfg(test)]
mod test_util;

// 导出常用类型
pub use config::AppConfig;
pub use events::{EventBus, LocalEventBus, RelayEvent};
pub use provider::{Provider, ProviderError, ProviderRegistry};
pub use relay::{RelayError, RelayService, SessionState, TransferSession};
pub use server::AppState;
pub use store::StateStore;
