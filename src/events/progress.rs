//! 进度事件去重
//!
//! 只有整数百分比上升时才放行，避免快速传输时的事件风暴

use std::sync::atomic::{AtomicI64, Ordering};

/// 尚未放行过任何进度
const NOTHING_EMITTED: i64 = -1;

/// 进度闸门
///
/// 线程安全，使用 CAS 保证并发调用下同一整数百分比只放行一次
#[derive(Debug)]
pub struct ProgressGate {
    /// 上次放行的整数百分比
    last_emitted: AtomicI64,
}

impl ProgressGate {
    pub fn new() -> Self {
        Self {
            last_emitted: AtomicI64::new(NOTHING_EMITTED),
        }
    }

    /// 检查是否应该发布
    ///
    /// 第一次调用总是放行（包括 0%），之后百分比向下取整后大于上次放行值时返回 true 并记录
    pub fn should_emit(&self, percent: f64) -> bool {
        if !percent.is_finite() {
            return false;
        }
        let floored = (percent.floor() as i64).max(0);
        self.last_emitted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                (floored > last).then_some(floored)
            })
            .is_ok()
    }

    /// 上次放行的百分比
    pub fn last_emitted(&self) -> Option<i64> {
        match self.last_emitted.load(Ordering::SeqCst) {
            NOTHING_EMITTED => None,
            last => Some(last),
        }
    }
}

impl Default for ProgressGate {
    fn default() -> Self {
        Self::new()
    }
}
