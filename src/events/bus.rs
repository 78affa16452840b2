//! 事件总线
//!
//! 按字符串主题发布/订阅。主题约定：
//! - `<token>`：会话事件
//! - `connection:<token>`：客户端已连接
//! - `pause:<token>` / `resume:<token>` / `cancel:<token>`：客户端控制信号

use super::types::BusMessage;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// 订阅回调
pub type Handler = Arc<dyn Fn(&BusMessage) + Send + Sync>;

/// 订阅 ID，用于单独退订
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// 事件总线接口
pub trait EventBus: Send + Sync {
    fn publish(&self, topic: &str, message: BusMessage);

    fn subscribe(&self, topic: &str, handler: Handler) -> SubscriptionId;

    /// 订阅一次，第一次投递后自动退订
    fn subscribe_once(&self, topic: &str, handler: Handler) -> SubscriptionId;

    fn unsubscribe(&self, topic: &str, id: SubscriptionId);

    fn unsubscribe_all(&self, topic: &str);
}

/// 主题名
pub mod topics {
    pub fn events(token: &str) -> String {
        token.to_string()
    }

    pub fn connection(token: &str) -> String {
        format!("connection:{}", token)
    }

    pub fn pause(token: &str) -> String {
        format!("pause:{}", token)
    }

    pub fn resume(token: &str) -> String {
        format!("resume:{}", token)
    }

    pub fn cancel(token: &str) -> String {
        format!("cancel:{}", token)
    }
}

struct Subscriber {
    id: SubscriptionId,
    once: bool,
    handler: Handler,
}

/// 进程内事件总线
///
/// 回调在释放分片锁之后执行，回调内部可以再次订阅或退订
#[derive(Default)]
pub struct LocalEventBus {
    topics: DashMap<String, Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 主题当前订阅者数量
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|subs| subs.len()).unwrap_or(0)
    }

    fn add(&self, topic: &str, handler: Handler, once: bool) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, once, handler });
        id
    }
}

impl EventBus for LocalEventBus {
    fn publish(&self, topic: &str, message: BusMessage) {
        let handlers: Vec<Handler> = match self.topics.get_mut(topic) {
            Some(mut subs) => {
                let handlers = subs.iter().map(|s| s.handler.clone()).collect();
                subs.retain(|s| !s.once);
                handlers
            }
            None => return,
        };
        self.topics.remove_if(topic, |_, subs| subs.is_empty());

        debug!("发布事件: topic={}, 订阅者={}", topic, handlers.len());
        for handler in handlers {
            handler(&message);
        }
    }

    fn subscribe(&self, topic: &str, handler: Handler) -> SubscriptionId {
        self.add(topic, handler, false)
    }

    fn subscribe_once(&self, topic: &str, handler: Handler) -> SubscriptionId {
        self.add(topic, handler, true)
    }

    fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        if let Some(mut subs) = self.topics.get_mut(topic) {
            subs.retain(|s| s.id != id);
        }
        self.topics.remove_if(topic, |_, subs| subs.is_empty());
    }

    fn unsubscribe_all(&self, topic: &str) {
        self.topics.remove(topic);
    }
}
