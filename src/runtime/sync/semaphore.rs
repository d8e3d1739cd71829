//! 计数信号量
//!
//! 许可数始终满足 `0 <= permits <= max_permits`

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, RuntimeError};
use crate::runtime::atomics::AtomicCounter;
use crate::runtime::stats::RuntimeStats;

#[derive(Debug)]
struct SemState {
    permits: usize,
    destroyed: bool,
}

/// 计数信号量
pub struct Semaphore {
    state: Mutex<SemState>,
    cond: Condvar,
    max_permits: usize,
    acquire_count: AtomicCounter,
    release_count: AtomicCounter,
    stats: Arc<RuntimeStats>,
}

impl Semaphore {
    /// 创建信号量
    ///
    /// `max_permits` 为 0 或初始许可超过上限时返回 `InvalidArgument`
    pub fn new(permits: usize, max_permits: usize) -> Result<Self> {
        if max_permits == 0 {
            return Err(RuntimeError::invalid("semaphore max_permits must be positive"));
        }
        if permits > max_permits {
            return Err(RuntimeError::invalid(format!(
                "initial permits {} exceed max_permits {}",
                permits, max_permits
            )));
        }
        Ok(Self {
            state: Mutex::new(SemState {
                permits,
                destroyed: false,
            }),
            cond: Condvar::new(),
            max_permits,
            acquire_count: AtomicCounter::new(0),
            release_count: AtomicCounter::new(0),
            stats: Arc::new(RuntimeStats::new()),
        })
    }

    pub fn with_stats(mut self, stats: Arc<RuntimeStats>) -> Self {
        self.stats = stats;
        self
    }

    /// 获取一个许可（阻塞）
    pub fn acquire(&self) -> Result<()> {
        let mut state = self.state.lock();
        while state.permits == 0 && !state.destroyed {
            self.cond.wait(&mut state);
        }
        if state.destroyed {
            return Err(RuntimeError::Shutdown("semaphore"));
        }
        state.permits -= 1;
        drop(state);
        self.record_acquire();
        Ok(())
    }

    /// 尝试获取许可（非阻塞）
    pub fn try_acquire(&self) -> Result<bool> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(RuntimeError::Shutdown("semaphore"));
        }
        if state.permits == 0 {
            return Ok(false);
        }
        state.permits -= 1;
        drop(state);
        self.record_acquire();
        Ok(true)
    }

    /// 限时获取许可
    ///
    /// 超时返回 `Ok(false)`，不是错误
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.permits == 0 && !state.destroyed {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if state.destroyed {
            return Err(RuntimeError::Shutdown("semaphore"));
        }
        if state.permits == 0 {
            return Ok(false);
        }
        state.permits -= 1;
        drop(state);
        self.record_acquire();
        Ok(true)
    }

    /// 归还一个许可
    ///
    /// 许可已满时返回 `CapacityExceeded`，许可数保持不变
    pub fn release(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(RuntimeError::Shutdown("semaphore"));
        }
        if state.permits >= self.max_permits {
            return Err(RuntimeError::CapacityExceeded {
                what: "semaphore",
                limit: self.max_permits,
            });
        }
        state.permits += 1;
        self.cond.notify_one();
        drop(state);
        self.release_count.increment();
        self.stats.semaphore_releases.increment();
        Ok(())
    }

    /// 当前可用许可数
    pub fn available_permits(&self) -> usize {
        self.state.lock().permits
    }

    #[inline]
    pub fn max_permits(&self) -> usize {
        self.max_permits
    }

    pub fn acquire_count(&self) -> u64 {
        self.acquire_count.load()
    }

    pub fn release_count(&self) -> u64 {
        self.release_count.load()
    }

    /// 销毁信号量：唤醒所有等待者，之后的操作都返回 `Shutdown`
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        if !state.destroyed {
            state.destroyed = true;
            self.cond.notify_all();
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    #[inline]
    fn record_acquire(&self) {
        self.acquire_count.increment();
        self.stats.semaphore_acquires.increment();
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("permits", &self.available_permits())
            .field("max_permits", &self.max_permits)
            .field("acquire_count", &self.acquire_count())
            .field("release_count", &self.release_count())
            .finish()
    }
}
