//! GC 安全点协作接口
//!
//! 运行时只调用垃圾回收器的两个入口：线程登记和线程注销

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::ThreadId;

use crate::error::Result;

/// 垃圾回收器的线程安全点协作方
pub trait SafepointCollaborator: Send + Sync {
    /// 线程开始参与安全点，在任何 GC 可见操作之前调用
    fn register_thread(&self, thread: ThreadId) -> Result<()>;

    /// 线程退出安全点，在最后一次 GC 可见操作之后调用
    fn unregister_thread(&self, thread: ThreadId);
}

/// 不做任何事的协作方（无 GC 环境或测试）
#[derive(Debug, Default)]
pub struct NoopSafepoint;

impl SafepointCollaborator for NoopSafepoint {
    fn register_thread(&self, _thread: ThreadId) -> Result<()> {
        Ok(())
    }

    fn unregister_thread(&self, _thread: ThreadId) {}
}

/// 只记录调用次数的协作方
#[derive(Debug, Default)]
pub struct CountingSafepoint {
    registered: AtomicU64,
    unregistered: AtomicU64,
}

impl CountingSafepoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered(&self) -> u64 {
        self.registered.load(Ordering::Acquire)
    }

    pub fn unregistered(&self) -> u64 {
        self.unregistered.load(Ordering::Acquire)
    }

    /// 当前仍在安全点中的线程数
    pub fn active(&self) -> u64 {
        self.registered().saturating_sub(self.unregistered())
    }
}

impl SafepointCollaborator for CountingSafepoint {
    fn register_thread(&self, _thread: ThreadId) -> Result<()> {
        self.registered.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn unregister_thread(&self, _thread: ThreadId) {
        self.unregistered.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_safepoint() {
        let sp = CountingSafepoint::new();
        let id = std::thread::current().id();
        sp.register_thread(id).unwrap();
        sp.register_thread(id).unwrap();
        sp.unregister_thread(id);
        assert_eq!(sp.registered(), 2);
        assert_eq!(sp.active(), 1);
    }
}
