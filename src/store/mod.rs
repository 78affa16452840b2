//! 会话状态存储
//!
//! 保存每个会话最近一次事件，供客户端断线重连时回放。
//! 存储是尽力而为的：写入失败只记日志，不影响中继本身。

mod memory;
mod sqlite;

pub use memory::MemoryStateStore;
pub use sqlite::SqliteStateStore;

use crate::config::{StateStoreBackend, StateStoreConfig};
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// 存储键前缀
pub const STORAGE_PREFIX: &str = "relay";

/// 会话状态的存储键
pub fn state_key(token: &str) -> String {
    format!("{}:{}", STORAGE_PREFIX, token)
}

/// 键值状态存储接口
pub trait StateStore: Send + Sync {
    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<String>>;
}

/// 按配置打开状态存储，`none` 返回 None
pub fn open_state_store(config: &StateStoreConfig) -> Result<Option<Arc<dyn StateStore>>> {
    let store: Arc<dyn StateStore> = match config.backend {
        StateStoreBackend::None => {
            info!("未配置状态存储，断线重连回放不可用");
            return Ok(None);
        }
        StateStoreBackend::Memory => {
            info!("使用内存状态存储");
            Arc::new(MemoryStateStore::new())
        }
        StateStoreBackend::Sqlite => {
            info!("使用 SQLite 状态存储: {}", config.path);
            Arc::new(SqliteStateStore::new(Path::new(&config.path))?)
        }
    };
    Ok(Some(store))
}
