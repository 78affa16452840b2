//! 按 key 分组的工作队列
//!
//! 每个 key 维护一个 FIFO 任务列表和最多 `worker_count` 个工作循环：
//! 入队后补足工作循环，工作循环依次取出队头任务执行，队列为空时退出。
//! 同一个 key 的任务数量不限，但同时执行的不超过上限

use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

type Action = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Default)]
struct TenantState {
    actions: VecDeque<Action>,
    /// 正在运行的工作循环 ID
    workers: Vec<u64>,
}

struct QueueInner {
    worker_count: usize,
    next_worker_id: AtomicU64,
    tenants: Mutex<HashMap<String, TenantState>>,
}

#[derive(Clone)]
pub struct TenantWorkQueue {
    inner: Arc<QueueInner>,
}

impl TenantWorkQueue {
    pub fn new(worker_count: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                worker_count: worker_count.max(1),
                next_worker_id: AtomicU64::new(0),
                tenants: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.inner.worker_count
    }

    /// 追加任务，并在工作循环不足时补足
    pub fn enqueue<F>(&self, key: &str, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let spawn_ids: Vec<u64> = {
            let mut tenants = self.inner.tenants.lock();
            let tenant = tenants.entry(key.to_string()).or_default();
            tenant.actions.push_back(Box::pin(action));

            let missing = self
                .inner
                .worker_count
                .saturating_sub(tenant.workers.len())
                .min(tenant.actions.len());
            let ids: Vec<u64> = (0..missing)
                .map(|_| self.inner.next_worker_id.fetch_add(1, Ordering::Relaxed))
                .collect();
            tenant.workers.extend(&ids);
            debug!(
                "任务入队: key={}, 排队={}, 工作循环={}",
                key,
                tenant.actions.len(),
                tenant.workers.len()
            );
            ids
        };

        for id in spawn_ids {
            let inner = self.inner.clone();
            let key = key.to_string();
            tokio::spawn(async move { worker_loop(inner, key, id).await });
        }
    }

    /// 尚未开始的任务数
    pub fn pending(&self, key: &str) -> usize {
        self.inner
            .tenants
            .lock()
            .get(key)
            .map(|t| t.actions.len())
            .unwrap_or(0)
    }

    pub fn active_workers(&self, key: &str) -> usize {
        self.inner
            .tenants
            .lock()
            .get(key)
            .map(|t| t.workers.len())
            .unwrap_or(0)
    }
}

async fn worker_loop(inner: Arc<QueueInner>, key: String, id: u64) {
    loop {
        // 出队与退出登记在同一把锁内完成，避免入队方看到将要退出的工作循环
        let action = {
            let mut tenants = inner.tenants.lock();
            let Some(tenant) = tenants.get_mut(&key) else {
                return;
            };
            match tenant.actions.pop_front() {
                Some(action) => action,
                None => {
                    tenant.workers.retain(|w| *w != id);
                    if tenant.workers.is_empty() {
                        tenants.remove(&key);
                    }
                    debug!("工作循环退出: key={}, id={}", key, id);
                    return;
                }
            }
        };

        if AssertUnwindSafe(action).catch_unwind().await.is_err() {
            error!("队列任务 panic: key={}", key);
        }
    }
}
