//! 互斥锁
//!
//! 在 parking_lot::Mutex 之上记录加锁次数和争用次数

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Timed;
use crate::runtime::atomics::AtomicCounter;
use crate::runtime::stats::RuntimeStats;

pub type MutexGuard<'a, T> = parking_lot::MutexGuard<'a, T>;

/// 带统计的互斥锁
pub struct Mutex<T> {
    name: String,
    inner: parking_lot::Mutex<T>,
    lock_count: AtomicCounter,
    contention_count: AtomicCounter,
    stats: Arc<RuntimeStats>,
}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self::named("mutex", value)
    }

    pub fn named(name: impl Into<String>, value: T) -> Self {
        Self {
            name: name.into(),
            inner: parking_lot::Mutex::new(value),
            lock_count: AtomicCounter::new(0),
            contention_count: AtomicCounter::new(0),
            stats: Arc::new(RuntimeStats::new()),
        }
    }

    /// 把统计汇总到运行时
    pub fn with_stats(mut self, stats: Arc<RuntimeStats>) -> Self {
        self.stats = stats;
        self
    }

    /// 加锁（阻塞）
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let guard = match self.inner.try_lock() {
            Some(guard) => guard,
            None => {
                self.record_contention();
                self.inner.lock()
            }
        };
        self.record_lock();
        guard
    }

    /// 尝试加锁（非阻塞）
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let guard = self.inner.try_lock()?;
        self.record_lock();
        Some(guard)
    }

    /// 限时加锁，截止时间在进入时计算一次
    pub fn lock_timeout(&self, timeout: Duration) -> Timed<MutexGuard<'_, T>> {
        let deadline = Instant::now() + timeout;
        if let Some(guard) = self.try_lock() {
            return Timed::Ready(guard);
        }
        self.record_contention();
        match self.inner.try_lock_until(deadline) {
            Some(guard) => {
                self.record_lock();
                Timed::Ready(guard)
            }
            None => Timed::TimedOut,
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock_count(&self) -> u64 {
        self.lock_count.load()
    }

    pub fn contention_count(&self) -> u64 {
        self.contention_count.load()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }

    #[inline]
    fn record_lock(&self) {
        self.lock_count.increment();
        self.stats.mutex_locks.increment();
    }

    #[inline]
    fn record_contention(&self) {
        self.contention_count.increment();
        self.stats.mutex_contentions.increment();
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> std::fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("name", &self.name)
            .field("locked", &self.is_locked())
            .field("lock_count", &self.lock_count())
            .field("contention_count", &self.contention_count())
            .finish()
    }
}
