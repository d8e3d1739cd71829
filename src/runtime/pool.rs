//! 工作池
//!
//! 固定数量的常驻工作线程从共享任务队列（一个 Channel）取任务执行。
//! 关闭时先关闭队列，工作线程把队列中剩余的任务执行完再退出，不会丢任务

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use super::atomics::{AtomicCounter, AtomicSize};
use super::channel::Channel;
use super::context::RuntimeContext;
use super::stats::RuntimeStats;
use super::task::{self, SpawnOptions, TaskContext, TaskHandle, TaskState};
use crate::config::WORKER_THREAD_PREFIX;
use crate::error::{Result, RuntimeError};
use crate::value::{NativeTaskFn, Tagged, Value};

/// 队列中的任务，返回任务终态
type Job = Box<dyn FnOnce() -> TaskState + Send + 'static>;

/// 工作线程共享的池状态
struct PoolShared {
    name: String,
    queue: Channel<Job>,
    /// 正在执行任务的工作线程数
    busy: AtomicSize,
    submitted: AtomicCounter,
    completed: AtomicCounter,
    failed: AtomicCounter,
}

/// 工作池统计
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub name: String,
    pub workers: usize,
    pub busy: usize,
    pub queued: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    /// 已提交但还没结束的任务数
    pub pending: u64,
}

/// 工作池
pub struct WorkerPool {
    ctx: Arc<RuntimeContext>,
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<Result<()>>>>,
    size: usize,
    running: AtomicBool,
}

impl WorkerPool {
    /// 创建并启动工作池
    ///
    /// `queue_capacity` 为 0 时任务队列是无缓冲的，提交会等到某个工作线程接手
    pub fn new(
        ctx: &Arc<RuntimeContext>,
        name: impl Into<String>,
        workers: usize,
        queue_capacity: usize,
    ) -> Result<Self> {
        ctx.ensure_initialized()?;
        if workers == 0 {
            return Err(RuntimeError::invalid("worker pool needs at least one worker"));
        }

        let name = name.into();
        let shared = Arc::new(PoolShared {
            name: name.clone(),
            queue: Channel::named(format!("{}-queue", name), queue_capacity)
                .with_stats(Arc::clone(ctx.stats_handle())),
            busy: AtomicSize::new(0),
            submitted: AtomicCounter::new(0),
            completed: AtomicCounter::new(0),
            failed: AtomicCounter::new(0),
        });
        ctx.stats_handle().channels_created.increment();

        let pool = Self {
            ctx: Arc::clone(ctx),
            shared,
            workers: Mutex::new(Vec::with_capacity(workers)),
            size: workers,
            running: AtomicBool::new(true),
        };

        for i in 0..workers {
            let shared = Arc::clone(&pool.shared);
            let stats = Arc::clone(ctx.stats_handle());
            let spawned = ctx.bridge().create_thread(
                format!("{}-{}-{}", WORKER_THREAD_PREFIX, name, i),
                ctx.config().default_stack_size,
                move || worker_loop(i, shared, stats),
            );
            match spawned {
                Ok(handle) => pool.workers.lock().push(handle),
                Err(e) => {
                    // 已启动的工作线程随 pool 析构一起关闭
                    tracing::error!(pool = %name, worker = i, error = %e, "failed to start worker");
                    return Err(e);
                }
            }
        }

        tracing::info!(pool = %name, workers, queue_capacity, "worker pool started");
        Ok(pool)
    }

    /// 提交任务，返回可等待的任务句柄
    pub fn submit<T, F>(&self, f: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&TaskContext) -> Result<T> + Send + 'static,
    {
        self.submit_with(SpawnOptions::new(), f)
    }

    /// 带选项提交（只有 name 和 priority_hint 生效）
    pub fn submit_with<T, F>(&self, options: SpawnOptions, f: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&TaskContext) -> Result<T> + Send + 'static,
    {
        if !self.is_running() {
            return Err(RuntimeError::Shutdown("worker pool"));
        }

        let (handle, runner) = task::new_task(&self.ctx, &options)?;
        let job: Job = Box::new(move || runner.run(f));

        // 队列关闭时任务被丢弃，任务以错误结束
        self.shared
            .queue
            .send(job)
            .map_err(|_| RuntimeError::Shutdown("worker pool"))?;

        self.shared.submitted.increment();
        self.ctx.stats_handle().pool_jobs_submitted.increment();
        tracing::trace!(pool = %self.shared.name, task_id = handle.id(), "job submitted");
        Ok(handle)
    }

    /// 提交原生任务函数
    pub fn submit_native(
        &self,
        function: Option<NativeTaskFn>,
        arg: Tagged<Value>,
    ) -> Result<TaskHandle<Tagged<Value>>> {
        let function = function.ok_or_else(|| RuntimeError::invalid("task function is null"))?;
        self.submit(move |_task: &TaskContext| function(arg).into_result())
    }

    /// 关闭工作池
    ///
    /// 不再接受新任务；队列中已有的任务仍会执行。`wait` 为 true 时等待所有工作线程退出
    pub fn shutdown(&self, wait: bool) {
        if self.running.swap(false, Ordering::AcqRel) {
            self.shared.queue.close();
            tracing::info!(pool = %self.shared.name, "worker pool shutting down");
        }
        if wait {
            self.join_workers();
        }
    }

    fn join_workers(&self) {
        let current = thread::current().id();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            // 在工作线程自己身上关闭时不能 join 自己
            if handle.thread().id() == current {
                continue;
            }
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(pool = %self.shared.name, error = %e, "worker exited with error"),
                Err(_) => tracing::error!(pool = %self.shared.name, "worker panicked"),
            }
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// 工作线程数
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// 当前负载：排队中加正在执行的任务数
    pub fn load(&self) -> usize {
        self.shared.queue.len() + self.shared.busy.load()
    }

    pub fn stats(&self) -> PoolStats {
        let submitted = self.shared.submitted.load();
        let completed = self.shared.completed.load();
        let failed = self.shared.failed.load();
        PoolStats {
            name: self.shared.name.clone(),
            workers: self.size,
            busy: self.shared.busy.load(),
            queued: self.shared.queue.len(),
            submitted,
            completed,
            failed,
            pending: submitted.saturating_sub(completed + failed),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown(true);
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.name)
            .field("size", &self.size)
            .field("running", &self.is_running())
            .field("load", &self.load())
            .finish()
    }
}

/// 工作线程主循环：取任务、执行、记录，直到队列关闭且取空
fn worker_loop(index: usize, shared: Arc<PoolShared>, stats: Arc<RuntimeStats>) {
    tracing::debug!(pool = %shared.name, worker = index, "worker started");

    for job in shared.queue.iter() {
        shared.busy.increment();
        let state = job();
        shared.busy.decrement();

        if state == TaskState::Completed {
            shared.completed.increment();
        } else {
            shared.failed.increment();
        }
        stats.pool_jobs_completed.increment();
    }

    tracing::debug!(pool = %shared.name, worker = index, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::context::RuntimeConfig;
    use crate::value::{BridgeResult, Ownership};
    use std::time::Duration;

    fn ctx() -> Arc<RuntimeContext> {
        RuntimeContext::new(RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn test_zero_workers_rejected() {
        let ctx = ctx();
        assert!(WorkerPool::new(&ctx, "empty", 0, 4).is_err());
    }

    #[test]
    fn test_submit_and_await() {
        let ctx = ctx();
        let pool = WorkerPool::new(&ctx, "math", 2, 8).unwrap();
        let handles: Vec<_> = (0..10)
            .map(|i| pool.submit(move |_| Ok(i * i)).unwrap())
            .collect();
        let results: Vec<i32> = handles.into_iter().map(|h| h.await_result().unwrap()).collect();
        assert_eq!(results, (0..10).map(|i| i * i).collect::<Vec<_>>());

        pool.shutdown(true);
        let stats = pool.stats();
        assert_eq!(stats.submitted, 10);
        assert_eq!(stats.completed, 10);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn test_worker_threads_are_registered() {
        let ctx = ctx();
        let pool = WorkerPool::new(&ctx, "reg", 1, 1).unwrap();
        let bridge = Arc::clone(ctx.bridge());
        let h = pool.submit(move |_| Ok(bridge.is_registered())).unwrap();
        assert!(h.await_result().unwrap());
    }

    #[test]
    fn test_failures_and_panics_counted() {
        let ctx = ctx();
        let pool = WorkerPool::new(&ctx, "bad", 1, 4).unwrap();
        let a = pool.submit(|_| -> Result<()> { Err(RuntimeError::invalid("nope")) }).unwrap();
        let b = pool.submit(|_| -> Result<()> { panic!("worker boom") }).unwrap();
        let c = pool.submit(|_| Ok(1)).unwrap();

        assert!(a.await_result().is_err());
        assert!(matches!(b.await_result(), Err(RuntimeError::TaskPanicked(_))));
        // 工作线程没有因为 panic 退出
        assert_eq!(c.await_result().unwrap(), 1);

        pool.shutdown(true);
        assert_eq!(pool.stats().failed, 2);
        assert_eq!(pool.stats().completed, 1);
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let ctx = ctx();
        let pool = WorkerPool::new(&ctx, "drain", 1, 16).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                pool.submit(move |_| {
                    std::thread::sleep(Duration::from_millis(2));
                    Ok(i)
                })
                .unwrap()
            })
            .collect();
        pool.shutdown(true);
        assert!(!pool.is_running());
        assert!(matches!(pool.submit(|_| Ok(0)), Err(RuntimeError::Shutdown(_))));
        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(h.await_result().unwrap(), i);
        }
    }

    #[test]
    fn test_load_reflects_queue() {
        let ctx = ctx();
        let pool = WorkerPool::new(&ctx, "load", 1, 8).unwrap();
        let gate = Arc::new(std::sync::Barrier::new(2));
        let g = Arc::clone(&gate);
        let blocker = pool
            .submit(move |_| {
                g.wait();
                Ok(())
            })
            .unwrap();
        let queued: Vec<_> = (0..3).map(|_| pool.submit(|_| Ok(())).unwrap()).collect();

        while pool.stats().busy == 0 {
            std::thread::yield_now();
        }
        assert_eq!(pool.load(), 4);
        gate.wait();
        blocker.await_result().unwrap();
        for h in queued {
            h.await_result().unwrap();
        }
    }

    fn echo(arg: Tagged<Value>) -> BridgeResult {
        BridgeResult::Ok(arg)
    }

    #[test]
    fn test_submit_native() {
        let ctx = ctx();
        let pool = WorkerPool::new(&ctx, "native", 1, 1).unwrap();
        let out = pool
            .submit_native(Some(echo), Tagged::new(Value::from("x"), Ownership::None))
            .unwrap()
            .await_result()
            .unwrap();
        assert_eq!(out.ownership, Ownership::None);
        assert!(pool.submit_native(None, Tagged::owned(Value::Unit)).is_err());
    }
}
