//! 读写锁
//!
//! 允许多个读者并发，或一个独占写者。
//!
//! 没有写者优先：读者只会被正在持有锁的写者挡住，不会被排队中的写者挡住，
//! 所以持续不断的读者可能让写者一直拿不到锁（写者饥饿）。
//! `parking_lot::RwLock` 让排队的写者挡住新读者，语义不同，因此这里用状态锁加两个条件变量自己实现

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::runtime::atomics::AtomicCounter;
use crate::runtime::stats::RuntimeStats;

#[derive(Debug, Default)]
struct LockState {
    /// 当前读者数
    readers: usize,
    /// 是否有写者持有锁
    writer: bool,
    /// 排队中的写者数（仅用于观测）
    waiting_writers: usize,
}

/// 带统计的读写锁
pub struct RwLock<T> {
    state: Mutex<LockState>,
    /// 写者释放时唤醒读者
    readers_cv: Condvar,
    /// 锁完全空闲时唤醒写者
    writers_cv: Condvar,
    data: UnsafeCell<T>,
    read_count: AtomicCounter,
    write_count: AtomicCounter,
    contention_count: AtomicCounter,
    stats: Arc<RuntimeStats>,
}

unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            readers_cv: Condvar::new(),
            writers_cv: Condvar::new(),
            data: UnsafeCell::new(value),
            read_count: AtomicCounter::new(0),
            write_count: AtomicCounter::new(0),
            contention_count: AtomicCounter::new(0),
            stats: Arc::new(RuntimeStats::new()),
        }
    }

    pub fn with_stats(mut self, stats: Arc<RuntimeStats>) -> Self {
        self.stats = stats;
        self
    }

    /// 获取读锁（阻塞）
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let mut state = self.state.lock();
        if state.writer {
            self.record_contention();
            while state.writer {
                self.readers_cv.wait(&mut state);
            }
        }
        state.readers += 1;
        drop(state);
        self.record_read();
        RwLockReadGuard { lock: self }
    }

    /// 尝试获取读锁
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        let mut state = self.state.lock();
        if state.writer {
            return None;
        }
        state.readers += 1;
        drop(state);
        self.record_read();
        Some(RwLockReadGuard { lock: self })
    }

    /// 获取写锁（阻塞）
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        let mut state = self.state.lock();
        if state.writer || state.readers > 0 {
            self.record_contention();
            state.waiting_writers += 1;
            while state.writer || state.readers > 0 {
                self.writers_cv.wait(&mut state);
            }
            state.waiting_writers -= 1;
        }
        state.writer = true;
        drop(state);
        self.record_write();
        RwLockWriteGuard { lock: self }
    }

    /// 尝试获取写锁
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        let mut state = self.state.lock();
        if state.writer || state.readers > 0 {
            return None;
        }
        state.writer = true;
        drop(state);
        self.record_write();
        Some(RwLockWriteGuard { lock: self })
    }

    /// 当前持有读锁的读者数
    pub fn reader_count(&self) -> usize {
        self.state.lock().readers
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer
    }

    pub fn waiting_writers(&self) -> usize {
        self.state.lock().waiting_writers
    }

    pub fn read_count(&self) -> u64 {
        self.read_count.load()
    }

    pub fn write_count(&self) -> u64 {
        self.write_count.load()
    }

    pub fn contention_count(&self) -> u64 {
        self.contention_count.load()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    fn release_read(&self) {
        let mut state = self.state.lock();
        state.readers -= 1;
        if state.readers == 0 {
            self.writers_cv.notify_one();
        }
    }

    fn release_write(&self) {
        let mut state = self.state.lock();
        state.writer = false;
        self.readers_cv.notify_all();
        self.writers_cv.notify_one();
    }

    #[inline]
    fn record_read(&self) {
        self.read_count.increment();
        self.stats.rwlock_reads.increment();
    }

    #[inline]
    fn record_write(&self) {
        self.write_count.increment();
        self.stats.rwlock_writes.increment();
    }

    #[inline]
    fn record_contention(&self) {
        self.contention_count.increment();
        self.stats.rwlock_contentions.increment();
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> std::fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RwLock")
            .field("readers", &state.readers)
            .field("writer", &state.writer)
            .field("read_count", &self.read_count())
            .field("write_count", &self.write_count())
            .finish()
    }
}

/// 读锁守卫
pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // 持有读锁期间没有写者
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// 写锁守卫
pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // 写锁独占
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}
