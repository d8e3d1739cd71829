//! 线程登记桥
//!
//! 把物理线程（运行时自己创建的或外部线程）登记到 GC 安全点机制。
//! 登记信息保存在线程本地，按运行时上下文 ID 区分，
//! 因此同一进程里的多个运行时实例互不干扰

use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use dashmap::DashMap;

use super::safepoint::SafepointCollaborator;
use super::stats::RuntimeStats;
use crate::error::{Result, RuntimeError};

/// 线程本地登记信息（不跨线程共享）
#[derive(Debug)]
struct Registration {
    registered_at: Instant,
    /// 本线程登记的 GC 根地址
    gc_roots: Vec<usize>,
}

thread_local! {
    /// 上下文 ID -> 登记信息
    static REGISTRATIONS: RefCell<HashMap<u64, Registration>> = RefCell::new(HashMap::new());
}

/// 全局可见的已登记线程记录
#[derive(Debug, Clone)]
pub struct ThreadRecord {
    pub name: Option<String>,
    pub registered_at: Instant,
}

/// 线程登记桥
pub struct ThreadBridge {
    context_id: u64,
    safepoint: Arc<dyn SafepointCollaborator>,
    threads: DashMap<ThreadId, ThreadRecord>,
    stats: Arc<RuntimeStats>,
}

impl ThreadBridge {
    pub fn new(
        context_id: u64,
        safepoint: Arc<dyn SafepointCollaborator>,
        stats: Arc<RuntimeStats>,
    ) -> Self {
        Self {
            context_id,
            safepoint,
            threads: DashMap::new(),
            stats,
        }
    }

    /// 登记当前线程
    ///
    /// 幂等：已登记时直接返回 `Ok(false)`，安全点协作方只会被调用一次
    pub fn register_thread(&self) -> Result<bool> {
        if self.is_registered() {
            return Ok(false);
        }

        let current = thread::current();
        self.safepoint.register_thread(current.id())?;

        let now = Instant::now();
        REGISTRATIONS.with(|regs| {
            regs.borrow_mut().insert(
                self.context_id,
                Registration {
                    registered_at: now,
                    gc_roots: Vec::new(),
                },
            );
        });
        self.threads.insert(
            current.id(),
            ThreadRecord {
                name: current.name().map(str::to_string),
                registered_at: now,
            },
        );

        self.stats.threads_registered.increment();
        self.stats.threads_active.increment();
        tracing::debug!(context = self.context_id, thread = ?current.id(), "thread registered");
        Ok(true)
    }

    /// 注销当前线程
    ///
    /// 返回该线程之前是否已登记
    pub fn unregister_thread(&self) -> bool {
        // 线程退出时本地存储可能已销毁
        let removed = REGISTRATIONS
            .try_with(|regs| regs.borrow_mut().remove(&self.context_id))
            .ok()
            .flatten();

        let Some(reg) = removed else {
            return false;
        };

        let id = thread::current().id();
        self.safepoint.unregister_thread(id);
        self.threads.remove(&id);
        self.stats.threads_active.decrement();
        tracing::debug!(
            context = self.context_id,
            thread = ?id,
            lifetime_ms = reg.registered_at.elapsed().as_millis() as u64,
            leaked_roots = reg.gc_roots.len(),
            "thread unregistered"
        );
        true
    }

    /// 当前线程是否已登记
    pub fn is_registered(&self) -> bool {
        REGISTRATIONS
            .try_with(|regs| regs.borrow().contains_key(&self.context_id))
            .unwrap_or(false)
    }

    /// 要求当前线程已登记
    ///
    /// 未登记属于编程错误：记录错误日志并返回 `ThreadNotRegistered`
    pub fn ensure_registered(&self, operation: &str) -> Result<()> {
        if self.is_registered() {
            return Ok(());
        }
        let current = thread::current();
        let desc = match current.name() {
            Some(name) => format!("'{}' ({:?})", name, current.id()),
            None => format!("{:?}", current.id()),
        };
        tracing::error!(context = self.context_id, thread = %desc, operation, "thread not registered");
        Err(RuntimeError::ThreadNotRegistered(desc))
    }

    /// 已登记的线程数
    pub fn registered_thread_count(&self) -> usize {
        self.threads.len()
    }

    /// 已登记线程的快照
    pub fn registered_threads(&self) -> Vec<(ThreadId, ThreadRecord)> {
        self.threads
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// 为当前线程登记一个 GC 根
    pub fn register_gc_root(&self, addr: usize) -> Result<()> {
        self.ensure_registered("register_gc_root")?;
        if addr == 0 {
            return Err(RuntimeError::invalid("gc root address is null"));
        }
        REGISTRATIONS.with(|regs| {
            if let Some(reg) = regs.borrow_mut().get_mut(&self.context_id) {
                reg.gc_roots.push(addr);
            }
        });
        self.stats.gc_roots_registered.increment();
        Ok(())
    }

    /// 注销当前线程的一个 GC 根，返回是否找到
    pub fn unregister_gc_root(&self, addr: usize) -> Result<bool> {
        self.ensure_registered("unregister_gc_root")?;
        let found = REGISTRATIONS.with(|regs| {
            let mut regs = regs.borrow_mut();
            let Some(reg) = regs.get_mut(&self.context_id) else {
                return false;
            };
            match reg.gc_roots.iter().rposition(|&a| a == addr) {
                Some(pos) => {
                    reg.gc_roots.swap_remove(pos);
                    true
                }
                None => false,
            }
        });
        Ok(found)
    }

    /// 当前线程登记的 GC 根数量
    pub fn gc_root_count(&self) -> usize {
        REGISTRATIONS.with(|regs| {
            regs.borrow()
                .get(&self.context_id)
                .map_or(0, |reg| reg.gc_roots.len())
        })
    }

    /// 作用域登记
    ///
    /// 只有真正执行了登记的守卫才会在析构时注销，嵌套守卫不会提前注销外层的登记
    pub fn guard(self: &Arc<Self>) -> Result<ThreadGuard> {
        let owns = self.register_thread()?;
        Ok(ThreadGuard {
            bridge: Arc::clone(self),
            owns,
            _not_send: PhantomData,
        })
    }

    /// 创建一个自动登记的 OS 线程
    ///
    /// 新线程先登记，再执行 `body`，最后注销（panic 展开时同样注销）
    pub fn create_thread<F, R>(
        self: &Arc<Self>,
        name: String,
        stack_size: usize,
        body: F,
    ) -> Result<JoinHandle<Result<R>>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let bridge = Arc::clone(self);
        let mut builder = thread::Builder::new().name(name);
        if stack_size > 0 {
            builder = builder.stack_size(stack_size);
        }
        let handle = builder.spawn(move || {
            let _guard = bridge.guard()?;
            Ok(body())
        })?;
        Ok(handle)
    }
}

impl std::fmt::Debug for ThreadBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadBridge")
            .field("context_id", &self.context_id)
            .field("registered_threads", &self.registered_thread_count())
            .finish()
    }
}

/// 线程登记守卫
///
/// 只能在创建它的线程上析构
pub struct ThreadGuard {
    bridge: Arc<ThreadBridge>,
    owns: bool,
    _not_send: PhantomData<*const ()>,
}

impl ThreadGuard {
    /// 是否由本守卫执行了登记
    pub fn owns_registration(&self) -> bool {
        self.owns
    }
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        if self.owns {
            self.bridge.unregister_thread();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::safepoint::CountingSafepoint;

    fn bridge_with(id: u64) -> (Arc<ThreadBridge>, Arc<CountingSafepoint>) {
        let sp = Arc::new(CountingSafepoint::new());
        let bridge = Arc::new(ThreadBridge::new(
            id,
            sp.clone(),
            Arc::new(RuntimeStats::new()),
        ));
        (bridge, sp)
    }

    #[test]
    fn test_register_is_idempotent() {
        let (bridge, sp) = bridge_with(9001);
        assert!(!bridge.is_registered());
        assert!(bridge.register_thread().unwrap());
        assert!(!bridge.register_thread().unwrap());
        assert_eq!(sp.registered(), 1);
        assert_eq!(bridge.registered_thread_count(), 1);

        assert!(bridge.unregister_thread());
        assert!(!bridge.unregister_thread());
        assert_eq!(sp.unregistered(), 1);
        assert_eq!(bridge.registered_thread_count(), 0);
    }

    #[test]
    fn test_contexts_are_isolated() {
        let (a, _) = bridge_with(9002);
        let (b, _) = bridge_with(9003);
        a.register_thread().unwrap();
        assert!(a.is_registered());
        assert!(!b.is_registered());
        a.unregister_thread();
    }

    #[test]
    fn test_ensure_registered_reports_error() {
        let (bridge, _) = bridge_with(9004);
        let err = bridge.ensure_registered("test").unwrap_err();
        assert!(matches!(err, RuntimeError::ThreadNotRegistered(_)));
    }

    #[test]
    fn test_nested_guards() {
        let (bridge, sp) = bridge_with(9005);
        {
            let outer = bridge.guard().unwrap();
            assert!(outer.owns_registration());
            {
                let inner = bridge.guard().unwrap();
                assert!(!inner.owns_registration());
            }
            assert!(bridge.is_registered());
        }
        assert!(!bridge.is_registered());
        assert_eq!(sp.registered(), 1);
        assert_eq!(sp.unregistered(), 1);
    }

    #[test]
    fn test_gc_roots_require_registration() {
        let (bridge, _) = bridge_with(9006);
        assert!(bridge.register_gc_root(0x1000).is_err());

        let _guard = bridge.guard().unwrap();
        bridge.register_gc_root(0x1000).unwrap();
        bridge.register_gc_root(0x2000).unwrap();
        assert_eq!(bridge.gc_root_count(), 2);
        assert!(bridge.unregister_gc_root(0x1000).unwrap());
        assert!(!bridge.unregister_gc_root(0x1000).unwrap());
        assert_eq!(bridge.gc_root_count(), 1);
        assert!(bridge.register_gc_root(0).is_err());
    }

    #[test]
    fn test_create_thread_registers_and_unregisters() {
        let (bridge, sp) = bridge_with(9007);
        let inner = Arc::clone(&bridge);
        let handle = bridge
            .create_thread("bridge-test".to_string(), 0, move || inner.is_registered())
            .unwrap();
        assert!(handle.join().unwrap().unwrap());
        assert_eq!(sp.registered(), 1);
        assert_eq!(sp.unregistered(), 1);
        assert_eq!(bridge.registered_thread_count(), 0);
    }

    #[test]
    fn test_create_thread_unregisters_on_panic() {
        let (bridge, sp) = bridge_with(9008);
        let handle = bridge
            .create_thread("bridge-panic".to_string(), 0, || -> () { panic!("boom") })
            .unwrap();
        assert!(handle.join().is_err());
        assert_eq!(sp.active(), 0);
    }
}
