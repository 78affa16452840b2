//! 中继缓冲区
//!
//! 下载端（生产者）推入数据块，上传协议（消费者）按自己的节奏拉取。
//! push/pull 握手就是背压机制：
//! - 有挂起的 pull 时，push 直接把数据交给消费者，不进入队列
//! - 没有挂起的 pull 时，push 追加到队列
//! - 生产者在队列被取空之前不会再去拉取远端数据（见 [`RelayBuffer::drained`]）

use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};

/// 中继缓冲区错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayBufferError {
    /// 缓冲区被中止（取消、下载失败等）
    #[error("relay buffer aborted: {0}")]
    Aborted(String),
    /// 已有一个未完成的 pull
    #[error("a pull is already pending")]
    PullInProgress,
    /// 流结束信号已经交付过
    #[error("end of stream already delivered")]
    Exhausted,
    /// 生产者已经结束，不能再推入
    #[error("producer already finished")]
    ProducerFinished,
}

/// 生产者推入的内容
#[derive(Debug, Clone)]
pub enum Chunk {
    Data(Bytes),
    End,
}

type PullResult = Result<Option<Bytes>, RelayBufferError>;

/// 一次 pull 的结果
#[derive(Debug)]
pub enum Pull {
    /// 队列中已有数据
    Data(Bytes),
    /// 流结束（只会出现一次）
    End,
    /// 暂无数据，等待下一次 push 完成本次 pull
    Pending(PendingPull),
}

/// 挂起中的 pull，由下一次 push 完成
#[derive(Debug)]
pub struct PendingPull {
    rx: oneshot::Receiver<PullResult>,
}

impl PendingPull {
    /// 等待匹配的 push
    ///
    /// 返回 `Ok(None)` 表示流结束
    pub async fn wait(self) -> PullResult {
        self.rx
            .await
            .unwrap_or_else(|_| Err(RelayBufferError::Aborted("buffer dropped".to_string())))
    }
}

/// 挂起 pull 的登记信息
#[derive(Debug)]
struct Waiter {
    max_bytes: usize,
    tx: oneshot::Sender<PullResult>,
}

#[derive(Debug, Default)]
struct Inner {
    /// 待消费的数据块（保持推入顺序）
    chunks: VecDeque<Bytes>,
    /// 生产者是否已结束
    finished: bool,
    /// 流结束信号是否已交付
    eof_delivered: bool,
    /// 挂起的 pull
    waiter: Option<Waiter>,
    /// 中止原因
    aborted: Option<String>,
}

/// 中继缓冲区
#[derive(Debug, Default)]
pub struct RelayBuffer {
    inner: Mutex<Inner>,
    /// 队列被取空 / 缓冲区被中止时唤醒生产者
    drained: Notify,
    /// 累计推入的字节数
    bytes_written: AtomicU64,
}

impl RelayBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 推入数据块或流结束信号
    pub fn push(&self, chunk: Chunk) -> Result<(), RelayBufferError> {
        let mut inner = self.inner.lock();
        if let Some(reason) = &inner.aborted {
            return Err(RelayBufferError::Aborted(reason.clone()));
        }
        if inner.finished {
            return Err(RelayBufferError::ProducerFinished);
        }

        match chunk {
            Chunk::Data(mut data) => {
                if data.is_empty() {
                    return Ok(());
                }
                self.bytes_written
                    .fetch_add(data.len() as u64, Ordering::SeqCst);

                match inner.waiter.take() {
                    Some(waiter) => {
                        // 挂起的 pull 存在时队列必为空，直接交付
                        let head = if data.len() > waiter.max_bytes {
                            data.split_to(waiter.max_bytes)
                        } else {
                            std::mem::take(&mut data)
                        };
                        if let Err(Ok(Some(head))) = waiter.tx.send(Ok(Some(head))) {
                            // 消费者已放弃这次 pull，退回队列
                            inner.chunks.push_back(head);
                        }
                        if !data.is_empty() {
                            inner.chunks.push_back(data);
                        }
                    }
                    None => inner.chunks.push_back(data),
                }
            }
            Chunk::End => {
                inner.finished = true;
                if let Some(waiter) = inner.waiter.take() {
                    if waiter.tx.send(Ok(None)).is_ok() {
                        inner.eof_delivered = true;
                    }
                }
            }
        }

        Ok(())
    }

    /// 拉取至多 `max_bytes` 字节
    pub fn try_pull(&self, max_bytes: usize) -> Result<Pull, RelayBufferError> {
        let max_bytes = max_bytes.max(1);
        let mut inner = self.inner.lock();
        if let Some(reason) = &inner.aborted {
            return Err(RelayBufferError::Aborted(reason.clone()));
        }

        if let Some(waiter) = &inner.waiter {
            if !waiter.tx.is_closed() {
                return Err(RelayBufferError::PullInProgress);
            }
            inner.waiter = None;
        }

        if let Some(mut front) = inner.chunks.pop_front() {
            let data = if front.len() > max_bytes {
                let head = front.split_to(max_bytes);
                inner.chunks.push_front(front);
                head
            } else {
                front
            };
            let now_empty = inner.chunks.is_empty();
            drop(inner);
            if now_empty {
                self.drained.notify_waiters();
            }
            return Ok(Pull::Data(data));
        }

        if inner.finished {
            if inner.eof_delivered {
                return Err(RelayBufferError::Exhausted);
            }
            inner.eof_delivered = true;
            return Ok(Pull::End);
        }

        let (tx, rx) = oneshot::channel();
        inner.waiter = Some(Waiter { max_bytes, tx });
        drop(inner);
        self.drained.notify_waiters();
        Ok(Pull::Pending(PendingPull { rx }))
    }

    /// 异步拉取，`Ok(None)` 表示流结束
    pub async fn pull(&self, max_bytes: usize) -> Result<Option<Bytes>, RelayBufferError> {
        match self.try_pull(max_bytes)? {
            Pull::Data(data) => Ok(Some(data)),
            Pull::End => Ok(None),
            Pull::Pending(pending) => pending.wait().await,
        }
    }

    /// 等待队列被消费者取空
    ///
    /// 生产者每推入一块后调用，取空之前不再拉取远端数据
    pub async fn drained(&self) -> Result<(), RelayBufferError> {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.inner.lock();
                if let Some(reason) = &inner.aborted {
                    return Err(RelayBufferError::Aborted(reason.clone()));
                }
                if inner.chunks.is_empty() {
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// 中止缓冲区，唤醒双方并丢弃未消费的数据
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut inner = self.inner.lock();
        if inner.aborted.is_some() {
            return;
        }
        inner.aborted = Some(reason.clone());
        inner.chunks.clear();
        if let Some(waiter) = inner.waiter.take() {
            let _ = waiter.tx.send(Err(RelayBufferError::Aborted(reason)));
        }
        drop(inner);
        self.drained.notify_waiters();
    }

    /// 已通过缓冲区的字节数
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::SeqCst)
    }

    /// 生产者是否已结束
    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().aborted.is_some()
    }

    /// 转换为字节流，用作 HTTP 请求体
    pub fn into_stream(
        self: Arc<Self>,
        max_bytes: usize,
    ) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
        futures::stream::unfold(Some(self), move |state| async move {
            let buffer = state?;
            match buffer.pull(max_bytes).await {
                Ok(Some(data)) => Some((Ok(data), Some(buffer))),
                Ok(None) => None,
                Err(e) => Some((Err(io::Error::new(io::ErrorKind::Other, e)), None)),
            }
        })
    }
}
