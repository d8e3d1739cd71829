//! 条件变量

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::mutex::MutexGuard;
use crate::error::Timed;
use crate::runtime::atomics::AtomicCounter;
use crate::runtime::stats::RuntimeStats;

/// 带统计的条件变量，配合 [`super::Mutex`] 的守卫使用
pub struct Condvar {
    inner: parking_lot::Condvar,
    wait_count: AtomicCounter,
    signal_count: AtomicCounter,
    stats: Arc<RuntimeStats>,
}

impl Condvar {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Condvar::new(),
            wait_count: AtomicCounter::new(0),
            signal_count: AtomicCounter::new(0),
            stats: Arc::new(RuntimeStats::new()),
        }
    }

    pub fn with_stats(mut self, stats: Arc<RuntimeStats>) -> Self {
        self.stats = stats;
        self
    }

    /// 释放锁并等待，被唤醒后重新持有锁
    ///
    /// 可能虚假唤醒，调用方应在循环中检查条件
    pub fn wait<T>(&self, guard: &mut MutexGuard<'_, T>) {
        self.record_wait();
        self.inner.wait(guard);
    }

    /// 限时等待
    pub fn wait_timeout<T>(&self, guard: &mut MutexGuard<'_, T>, timeout: Duration) -> Timed<()> {
        self.wait_until(guard, Instant::now() + timeout)
    }

    /// 等待到绝对截止时间
    pub fn wait_until<T>(&self, guard: &mut MutexGuard<'_, T>, deadline: Instant) -> Timed<()> {
        self.record_wait();
        if self.inner.wait_until(guard, deadline).timed_out() {
            Timed::TimedOut
        } else {
            Timed::Ready(())
        }
    }

    /// 等待直到条件成立或超时，截止时间只计算一次
    pub fn wait_while_timeout<T, F>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Duration,
        mut condition: F,
    ) -> Timed<()>
    where
        F: FnMut(&mut T) -> bool,
    {
        let deadline = Instant::now() + timeout;
        while condition(&mut **guard) {
            if self.wait_until(guard, deadline).is_timed_out() {
                return if condition(&mut **guard) {
                    Timed::TimedOut
                } else {
                    Timed::Ready(())
                };
            }
        }
        Timed::Ready(())
    }

    /// 唤醒一个等待者，返回是否真的唤醒了线程
    pub fn signal(&self) -> bool {
        self.record_signal();
        self.inner.notify_one()
    }

    /// 唤醒所有等待者，返回唤醒的线程数
    pub fn broadcast(&self) -> usize {
        self.record_signal();
        self.inner.notify_all()
    }

    pub fn wait_count(&self) -> u64 {
        self.wait_count.load()
    }

    pub fn signal_count(&self) -> u64 {
        self.signal_count.load()
    }

    #[inline]
    fn record_wait(&self) {
        self.wait_count.increment();
        self.stats.condvar_waits.increment();
    }

    #[inline]
    fn record_signal(&self) {
        self.signal_count.increment();
        self.stats.condvar_signals.increment();
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Condvar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condvar")
            .field("wait_count", &self.wait_count())
            .field("signal_count", &self.signal_count())
            .finish()
    }
}
