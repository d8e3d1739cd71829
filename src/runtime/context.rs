//! 运行时上下文
//!
//! 线程登记桥、任务注册表、回调队列、统计和生命周期日志都挂在上下文上。
//! 没有全局单例：每个上下文相互独立，原语通过工厂方法创建时接入上下文的统计

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::atomics::LockFreeStack;
use super::callback::CallbackQueue;
use super::channel::Channel;
use super::pool::WorkerPool;
use super::safepoint::{NoopSafepoint, SafepointCollaborator};
use super::stats::{RuntimeStats, StatsSnapshot};
use super::sync::{Barrier, Condvar, Mutex, RwLock, Semaphore};
use super::task::{self, LifecycleEvent, SpawnOptions, TaskContext, TaskHandle, TaskInfo, TaskRegistry, TaskState};
use super::thread::ThreadBridge;
use super::TaskId;
use crate::config::{
    DEFAULT_LIFECYCLE_LOG_CAPACITY, DEFAULT_MAX_CALLBACKS, DEFAULT_MAX_TASKS,
    DEFAULT_POOL_QUEUE_CAPACITY, DEFAULT_STACK_SIZE, RUNTIME_NAME, VERSION,
};
use crate::error::{Result, RuntimeError};
use crate::value::{NativeTaskFn, Tagged, Value};

/// 上下文 ID 生成器
static CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// 运行时配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// 最大并存任务数
    pub max_tasks: usize,
    /// 回调队列容量
    pub max_callbacks: usize,
    /// 任务线程默认栈大小
    pub default_stack_size: usize,
    /// 工作池默认线程数（默认为 CPU 核心数）
    pub default_pool_size: usize,
    /// 工作池任务队列容量
    pub pool_queue_capacity: usize,
    /// 生命周期日志容量
    pub lifecycle_log_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_tasks: DEFAULT_MAX_TASKS,
            max_callbacks: DEFAULT_MAX_CALLBACKS,
            default_stack_size: DEFAULT_STACK_SIZE,
            default_pool_size: super::num_processors(),
            pool_queue_capacity: DEFAULT_POOL_QUEUE_CAPACITY,
            lifecycle_log_capacity: DEFAULT_LIFECYCLE_LOG_CAPACITY,
        }
    }
}

impl RuntimeConfig {
    pub fn with_max_tasks(mut self, n: usize) -> Self {
        self.max_tasks = n;
        self
    }

    pub fn with_max_callbacks(mut self, n: usize) -> Self {
        self.max_callbacks = n;
        self
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.default_stack_size = bytes;
        self
    }

    pub fn with_pool_size(mut self, workers: usize) -> Self {
        self.default_pool_size = workers;
        self
    }

    pub fn with_pool_queue_capacity(mut self, n: usize) -> Self {
        self.pool_queue_capacity = n;
        self
    }

    pub fn with_lifecycle_log_capacity(mut self, n: usize) -> Self {
        self.lifecycle_log_capacity = n;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_tasks == 0 {
            return Err(RuntimeError::invalid("max_tasks must be positive"));
        }
        if self.max_callbacks == 0 {
            return Err(RuntimeError::invalid("max_callbacks must be positive"));
        }
        if self.pool_queue_capacity == 0 {
            return Err(RuntimeError::invalid("pool_queue_capacity must be positive"));
        }
        if self.default_pool_size == 0 {
            return Err(RuntimeError::invalid("default_pool_size must be positive"));
        }
        Ok(())
    }
}

/// 运行时上下文
pub struct RuntimeContext {
    id: u64,
    config: RuntimeConfig,
    initialized: AtomicBool,
    stats: Arc<RuntimeStats>,
    bridge: Arc<ThreadBridge>,
    tasks: Arc<TaskRegistry>,
    callbacks: CallbackQueue,
    /// 任务结束事件，新事件在栈顶
    lifecycle: LockFreeStack<LifecycleEvent>,
    /// 已占用的日志槽位，先占位再入栈
    lifecycle_slots: AtomicUsize,
}

impl RuntimeContext {
    /// 创建上下文，安全点协作方为空实现
    pub fn new(config: RuntimeConfig) -> Result<Arc<Self>> {
        Self::with_safepoint(config, Arc::new(NoopSafepoint))
    }

    /// 创建上下文并接入宿主的安全点协作方
    pub fn with_safepoint(
        config: RuntimeConfig,
        safepoint: Arc<dyn SafepointCollaborator>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let id = CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let stats = Arc::new(RuntimeStats::new());
        let bridge = Arc::new(ThreadBridge::new(id, safepoint, Arc::clone(&stats)));
        let callbacks = CallbackQueue::new(config.max_callbacks, Arc::clone(&bridge), Arc::clone(&stats))?;

        tracing::info!(
            context = id,
            runtime = RUNTIME_NAME,
            version = VERSION,
            max_tasks = config.max_tasks,
            max_callbacks = config.max_callbacks,
            "runtime context initialized"
        );

        Ok(Arc::new(Self {
            id,
            tasks: Arc::new(TaskRegistry::new(config.max_tasks)),
            config,
            initialized: AtomicBool::new(true),
            stats,
            bridge,
            callbacks,
            lifecycle: LockFreeStack::new(),
            lifecycle_slots: AtomicUsize::new(0),
        }))
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// 已关闭时返回 `NotInitialized`
    pub fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(RuntimeError::NotInitialized("runtime context has been shut down"))
        }
    }

    /// 关闭上下文
    ///
    /// 幂等。之后创建任务和工作池返回 `NotInitialized`，入队回调返回 `Shutdown`；
    /// 已在运行的任务不受影响
    pub fn shutdown(&self) {
        if self
            .initialized
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.callbacks.shutdown();
        tracing::info!(
            context = self.id,
            active_tasks = self.tasks.active_count(),
            pending_callbacks = self.callbacks.len(),
            "runtime context shut down"
        );
    }

    pub fn bridge(&self) -> &Arc<ThreadBridge> {
        &self.bridge
    }

    pub fn task_registry(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    pub fn callbacks(&self) -> &CallbackQueue {
        &self.callbacks
    }

    // ========== 统计 ==========

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn stats_handle(&self) -> &Arc<RuntimeStats> {
        &self.stats
    }

    /// 计数清零，仪表（活动线程数、队列深度）保留
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// 可读的状态报告
    pub fn dump_state(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== {} v{} (context {}) ===", RUNTIME_NAME, VERSION, self.id);
        let _ = writeln!(out, "initialized: {}", self.is_initialized());
        let _ = writeln!(out, "config: {:?}", self.config);
        let _ = writeln!(
            out,
            "tasks: {} active, {} tracked",
            self.tasks.active_count(),
            self.tasks.len()
        );
        let _ = writeln!(
            out,
            "threads: {} registered",
            self.bridge.registered_thread_count()
        );
        let _ = writeln!(
            out,
            "callbacks: {} pending / {}",
            self.callbacks.len(),
            self.callbacks.capacity()
        );
        let _ = write!(out, "{}", self.stats.snapshot());
        out
    }

    // ========== 生命周期日志 ==========

    /// 记录任务结束事件，超出容量时只计数
    pub(crate) fn record_lifecycle(&self, event: LifecycleEvent) {
        let cap = self.config.lifecycle_log_capacity;
        let reserved = self
            .lifecycle_slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < cap).then_some(n + 1));
        if reserved.is_err() {
            self.stats.lifecycle_events_dropped.increment();
            return;
        }
        self.lifecycle.push(event);
    }

    /// 取出所有事件，按发生顺序排列
    pub fn drain_lifecycle_events(&self) -> Vec<LifecycleEvent> {
        let mut events = Vec::with_capacity(self.lifecycle.len());
        while let Some(event) = self.lifecycle.pop() {
            self.lifecycle_slots.fetch_sub(1, Ordering::AcqRel);
            events.push(event);
        }
        events.reverse();
        events
    }

    // ========== 任务 ==========

    /// 在新线程上启动任务
    pub fn spawn<T, F>(self: &Arc<Self>, options: SpawnOptions, f: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&TaskContext) -> Result<T> + Send + 'static,
    {
        task::spawn(self, options, f)
    }

    /// 启动原生任务函数
    pub fn spawn_native(
        self: &Arc<Self>,
        function: Option<NativeTaskFn>,
        arg: Tagged<Value>,
        options: SpawnOptions,
    ) -> Result<TaskHandle<Tagged<Value>>> {
        task::spawn_native(self, function, arg, options)
    }

    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.state(id)
    }

    pub fn task_info(&self, id: TaskId) -> Option<TaskInfo> {
        self.tasks.info(id)
    }

    pub fn active_task_count(&self) -> usize {
        self.tasks.active_count()
    }

    /// 请求取消任务，任务不存在或已结束时返回 false
    pub fn cancel_task(&self, id: TaskId) -> bool {
        self.tasks.request_cancel(id)
    }

    // ========== 原语工厂 ==========

    pub fn mutex<T>(&self, name: impl Into<String>, value: T) -> Mutex<T> {
        Mutex::named(name, value).with_stats(Arc::clone(&self.stats))
    }

    pub fn condvar(&self) -> Condvar {
        Condvar::new().with_stats(Arc::clone(&self.stats))
    }

    pub fn rwlock<T>(&self, value: T) -> RwLock<T> {
        RwLock::new(value).with_stats(Arc::clone(&self.stats))
    }

    pub fn semaphore(&self, permits: usize, max_permits: usize) -> Result<Semaphore> {
        Ok(Semaphore::new(permits, max_permits)?.with_stats(Arc::clone(&self.stats)))
    }

    pub fn barrier(&self, parties: usize) -> Result<Barrier> {
        Ok(Barrier::new(parties)?.with_stats(Arc::clone(&self.stats)))
    }

    /// 创建通道，容量为 0 时为无缓冲通道
    pub fn channel<T>(&self, capacity: usize) -> Channel<T> {
        self.stats.channels_created.increment();
        Channel::new(capacity).with_stats(Arc::clone(&self.stats))
    }

    pub fn named_channel<T>(&self, name: impl Into<String>, capacity: usize) -> Channel<T> {
        self.stats.channels_created.increment();
        Channel::named(name, capacity).with_stats(Arc::clone(&self.stats))
    }

    /// 创建工作池
    pub fn worker_pool(
        self: &Arc<Self>,
        name: impl Into<String>,
        workers: usize,
        queue_capacity: usize,
    ) -> Result<WorkerPool> {
        WorkerPool::new(self, name, workers, queue_capacity)
    }

    /// 按配置的默认线程数和队列容量创建工作池
    pub fn default_worker_pool(self: &Arc<Self>, name: impl Into<String>) -> Result<WorkerPool> {
        WorkerPool::new(
            self,
            name,
            self.config.default_pool_size,
            self.config.pool_queue_capacity,
        )
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("id", &self.id)
            .field("initialized", &self.is_initialized())
            .field("active_tasks", &self.tasks.active_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::safepoint::CountingSafepoint;
    use std::time::Duration;

    #[test]
    fn test_config_validation() {
        assert!(RuntimeContext::new(RuntimeConfig::default().with_max_callbacks(0)).is_err());
        assert!(RuntimeContext::new(RuntimeConfig::default().with_pool_queue_capacity(0)).is_err());
        assert!(RuntimeContext::new(RuntimeConfig::default().with_max_tasks(0)).is_err());
        assert!(RuntimeContext::new(RuntimeConfig::default()).is_ok());
    }

    #[test]
    fn test_contexts_are_independent() {
        let a = RuntimeContext::new(RuntimeConfig::default()).unwrap();
        let b = RuntimeContext::new(RuntimeConfig::default()).unwrap();
        assert_ne!(a.id(), b.id());

        let _guard = a.bridge().guard().unwrap();
        assert!(a.bridge().is_registered());
        assert!(!b.bridge().is_registered());

        a.channel::<i32>(1);
        assert_eq!(a.stats().channels_created, 1);
        assert_eq!(b.stats().channels_created, 0);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let ctx = RuntimeContext::new(RuntimeConfig::default()).unwrap();
        ctx.shutdown();
        ctx.shutdown();
        assert!(!ctx.is_initialized());

        let err = ctx.spawn(SpawnOptions::new(), |_| Ok(())).unwrap_err();
        assert!(matches!(err, RuntimeError::NotInitialized(_)));
        assert!(ctx.worker_pool("late", 1, 1).is_err());
        assert!(matches!(
            ctx.callbacks().enqueue_callback(Default::default(), || Ok(())),
            Err(RuntimeError::Shutdown(_))
        ));
    }

    #[test]
    fn test_factories_feed_context_stats() {
        let ctx = RuntimeContext::new(RuntimeConfig::default()).unwrap();
        let m = ctx.mutex("m", 0);
        *m.lock() += 1;
        let sem = ctx.semaphore(1, 1).unwrap();
        sem.acquire().unwrap();
        sem.release().unwrap();
        let rw = ctx.rwlock(5);
        assert_eq!(*rw.read(), 5);
        let ch = ctx.named_channel("jobs", 2);
        ch.send(1).unwrap();
        assert_eq!(ch.receive(), Some(1));

        let stats = ctx.stats();
        assert_eq!(stats.mutex_locks, 1);
        assert_eq!(stats.semaphore_acquires, 1);
        assert_eq!(stats.semaphore_releases, 1);
        assert_eq!(stats.rwlock_reads, 1);
        assert_eq!(stats.channel_sends, 1);
        assert_eq!(stats.channel_receives, 1);

        ctx.reset_stats();
        assert_eq!(ctx.stats().mutex_locks, 0);
    }

    #[test]
    fn test_lifecycle_log_bounded() {
        let ctx = RuntimeContext::new(RuntimeConfig::default().with_lifecycle_log_capacity(2)).unwrap();
        for _ in 0..3 {
            ctx.spawn(SpawnOptions::new(), |_| Ok(()))
                .unwrap()
                .await_result()
                .unwrap();
        }
        assert_eq!(ctx.stats().lifecycle_events_dropped, 1);
        let events = ctx.drain_lifecycle_events();
        assert_eq!(events.len(), 2);
        assert!(events[0].task_id < events[1].task_id);
        assert!(ctx.drain_lifecycle_events().is_empty());
    }

    #[test]
    fn test_lifecycle_log_bound_holds_under_contention() {
        let ctx = RuntimeContext::new(RuntimeConfig::default().with_lifecycle_log_capacity(5)).unwrap();
        let recorders: Vec<_> = (0..8)
            .map(|t| {
                let ctx = Arc::clone(&ctx);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        ctx.record_lifecycle(LifecycleEvent {
                            task_id: t * 100 + i,
                            name: None,
                            state: TaskState::Completed,
                            run_time: None,
                            at: std::time::Instant::now(),
                        });
                    }
                })
            })
            .collect();
        for r in recorders {
            r.join().unwrap();
        }

        assert_eq!(ctx.drain_lifecycle_events().len(), 5);
        assert_eq!(ctx.stats().lifecycle_events_dropped, 395);
        // 取走后槽位归还
        ctx.spawn(SpawnOptions::new(), |_| Ok(())).unwrap().await_result().unwrap();
        assert_eq!(ctx.drain_lifecycle_events().len(), 1);
    }

    #[test]
    fn test_custom_safepoint_sees_task_threads() {
        let safepoint = Arc::new(CountingSafepoint::new());
        let ctx = RuntimeContext::with_safepoint(RuntimeConfig::default(), safepoint.clone()).unwrap();
        ctx.spawn(SpawnOptions::new(), |_| Ok(()))
            .unwrap()
            .await_result()
            .unwrap();
        // 线程在结果发布之后才注销
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while safepoint.active() != 0 && std::time::Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert_eq!(safepoint.registered(), 1);
        assert_eq!(safepoint.unregistered(), 1);
    }

    #[test]
    fn test_dump_state_mentions_config() {
        let ctx = RuntimeContext::new(RuntimeConfig::default().with_max_tasks(3)).unwrap();
        let dump = ctx.dump_state();
        assert!(dump.contains("max_tasks: 3"));
        assert!(dump.contains("initialized: true"));
    }
}
