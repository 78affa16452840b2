//! 固定间隔重试
//!
//! 给定 k 个延迟，最多执行 k+1 次尝试；最后一次尝试会被标记出来，
//! 调用方可以据此决定把错误上报给用户而不是静默丢弃

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// 一次尝试的序号信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 从 0 开始
    pub index: usize,
    /// 是否为最后一次尝试
    pub is_last: bool,
}

type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

pub struct RetryOrchestrator<E> {
    delays: Vec<Duration>,
    predicate: RetryPredicate<E>,
}

impl<E> Clone for RetryOrchestrator<E> {
    fn clone(&self) -> Self {
        Self {
            delays: self.delays.clone(),
            predicate: self.predicate.clone(),
        }
    }
}

impl<E: std::fmt::Display> RetryOrchestrator<E> {
    /// 默认所有错误都可重试
    pub fn new(delays: Vec<Duration>) -> Self {
        Self {
            delays,
            predicate: Arc::new(|_| true),
        }
    }

    pub fn with_predicate(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Arc::new(predicate);
        self
    }

    /// 总尝试次数
    pub fn attempts(&self) -> usize {
        self.delays.len() + 1
    }

    /// 这次失败之后是否还会重试
    pub fn will_retry(&self, attempt: Attempt, err: &E) -> bool {
        !attempt.is_last && (self.predicate)(err)
    }

    /// 执行直到成功、遇到不可重试的错误或用完延迟列表
    pub async fn run<T, F, Fut>(&self, mut action: F) -> Result<T, E>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let total = self.attempts();
        let mut index = 0;
        loop {
            let attempt = Attempt {
                index,
                is_last: index + 1 == total,
            };
            match action(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !self.will_retry(attempt, &err) {
                        if !attempt.is_last {
                            debug!("错误不可重试，放弃剩余 {} 次尝试: {}", total - index - 1, err);
                        }
                        return Err(err);
                    }
                    let delay = self.delays[index];
                    warn!(
                        "第 {}/{} 次尝试失败，{:?} 后重试: {}",
                        index + 1,
                        total,
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                    index += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn delays() -> Vec<Duration> {
        vec![Duration::from_secs(5), Duration::from_secs(10)]
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_failure_runs_all_attempts() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let started = tokio::time::Instant::now();

        let result: Result<(), String> = RetryOrchestrator::new(delays())
            .run(|attempt| {
                let seen = seen.clone();
                async move {
                    seen.lock().push(attempt);
                    Err(format!("attempt {} failed", attempt.index))
                }
            })
            .await;

        assert_eq!(result.unwrap_err(), "attempt 2 failed");
        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(!seen[0].is_last);
        assert!(!seen[1].is_last);
        assert!(seen[2].is_last);
        // 固定延迟，无抖动
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(15) && elapsed < Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_success_runs_once() {
        let calls = Arc::new(Mutex::new(0));
        let value = RetryOrchestrator::<String>::new(delays())
            .run(|_| {
                let calls = calls.clone();
                async move {
                    *calls.lock() += 1;
                    Ok::<_, String>(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(*calls.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_failure() {
        let value = RetryOrchestrator::new(delays())
            .run(|attempt| async move {
                if attempt.index < 1 {
                    Err("flaky".to_string())
                } else {
                    Ok(attempt.index)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_short_circuits() {
        let calls = Arc::new(Mutex::new(0));
        let result: Result<(), String> = RetryOrchestrator::new(delays())
            .with_predicate(|err: &String| !err.starts_with("auth"))
            .run(|_| {
                let calls = calls.clone();
                async move {
                    *calls.lock() += 1;
                    Err("auth rejected".to_string())
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn test_no_delays_means_single_last_attempt() {
        let retry = RetryOrchestrator::<String>::new(Vec::new());
        assert_eq!(retry.attempts(), 1);
        let only = Attempt {
            index: 0,
            is_last: true,
        };
        assert!(!retry.will_retry(only, &"boom".to_string()));
    }
}
