//! 任务管理
//!
//! 任务状态机：`Created -> Running -> {Completed | Failed | Cancelled}`，终态不可再变。
//!
//! 每个任务由一个专属 OS 线程执行（1 任务 : 1 线程），线程通过线程登记桥创建，
//! 自动登记和注销。工作池复用同一套完成逻辑，只是执行者换成了常驻工作线程。
//! 任务体内的 panic 在任务边界被捕获，转换为 `Failed` 状态。
//! 取消是协作式的：只设置标志位，由任务体自行轮询

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use super::context::RuntimeContext;
use super::stats::RuntimeStats;
use super::TaskId;
use crate::config::{RUNTIME_NAME, TASK_THREAD_PREFIX};
use crate::error::{panic_message, ErrorCode, Result, RuntimeError, Timed};
use crate::value::{NativeTaskFn, Tagged, Value};

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskState {
    /// 已创建，尚未开始执行
    Created = 0,
    /// 正在执行
    Running = 1,
    /// 正常完成
    Completed = 2,
    /// 返回错误或 panic
    Failed = 3,
    /// 被取消
    Cancelled = 4,
}

impl From<u8> for TaskState {
    fn from(v: u8) -> Self {
        match v {
            0 => TaskState::Created,
            1 => TaskState::Running,
            2 => TaskState::Completed,
            3 => TaskState::Failed,
            4 => TaskState::Cancelled,
            _ => TaskState::Failed,
        }
    }
}

impl TaskState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// 任务创建选项
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// 线程栈大小，0 表示使用运行时默认值
    pub stack_size: usize,
    /// 分离任务：句柄不需要被等待
    pub detached: bool,
    /// 优先级提示（仅供参考，不影响调度）
    pub priority_hint: i32,
    pub name: Option<String>,
}

impl SpawnOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }

    pub fn priority_hint(mut self, hint: i32) -> Self {
        self.priority_hint = hint;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Timestamps {
    started: Option<Instant>,
    finished: Option<Instant>,
}

/// 任务记录（注册表和句柄共享）
pub(crate) struct TaskRecord {
    id: TaskId,
    name: Option<String>,
    priority_hint: i32,
    state: AtomicU8,
    cancel_requested: AtomicBool,
    /// 句柄是否还存在，决定终态时由谁把记录移出注册表
    handle_alive: AtomicBool,
    detached: AtomicBool,
    created_at: Instant,
    times: Mutex<Timestamps>,
}

impl TaskRecord {
    fn new(id: TaskId, options: &SpawnOptions) -> Self {
        Self {
            id,
            name: options.name.clone(),
            priority_hint: options.priority_hint,
            state: AtomicU8::new(TaskState::Created as u8),
            cancel_requested: AtomicBool::new(false),
            handle_alive: AtomicBool::new(true),
            detached: AtomicBool::new(options.detached),
            created_at: Instant::now(),
            times: Mutex::new(Timestamps::default()),
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> TaskState {
        TaskState::from(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// 设置取消标志，返回是否是第一次设置
    fn request_cancel(&self) -> bool {
        !self.cancel_requested.swap(true, Ordering::AcqRel)
    }

    fn mark_running(&self) {
        self.times.lock().started = Some(Instant::now());
        self.state.store(TaskState::Running as u8, Ordering::SeqCst);
    }

    fn mark_terminal(&self, state: TaskState) {
        self.times.lock().finished = Some(Instant::now());
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn info(&self) -> TaskInfo {
        let times = *self.times.lock();
        TaskInfo {
            id: self.id,
            name: self.name.clone(),
            state: self.state(),
            priority_hint: self.priority_hint,
            detached: self.detached.load(Ordering::Acquire),
            cancel_requested: self.is_cancel_requested(),
            created_at: self.created_at,
            started_at: times.started,
            finished_at: times.finished,
        }
    }
}

/// 任务信息快照
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: Option<String>,
    pub state: TaskState,
    pub priority_hint: i32,
    pub detached: bool,
    pub cancel_requested: bool,
    pub created_at: Instant,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

impl TaskInfo {
    /// 实际执行时长（未开始或未结束时为 None）
    pub fn run_time(&self) -> Option<Duration> {
        Some(self.finished_at?.saturating_duration_since(self.started_at?))
    }

    /// 从创建到结束（或到现在）的时长
    pub fn age(&self) -> Duration {
        self.finished_at
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.created_at)
    }
}

/// 生命周期事件（任务进入终态时记录）
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub task_id: TaskId,
    pub name: Option<String>,
    pub state: TaskState,
    pub run_time: Option<Duration>,
    pub at: Instant,
}

/// 任务注册表
///
/// 记录在任务结束且句柄释放（或分离）后移除
pub struct TaskRegistry {
    tasks: DashMap<TaskId, Arc<TaskRecord>>,
    next_id: AtomicU64,
    /// 尚未结束的任务数
    live: AtomicUsize,
    max_tasks: usize,
}

impl TaskRegistry {
    pub(crate) fn new(max_tasks: usize) -> Self {
        Self {
            tasks: DashMap::new(),
            next_id: AtomicU64::new(1),
            live: AtomicUsize::new(0),
            max_tasks,
        }
    }

    /// 占用一个任务名额，已满返回 `CapacityExceeded`
    fn reserve(&self) -> Result<()> {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_tasks).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| RuntimeError::CapacityExceeded {
                what: "task",
                limit: self.max_tasks,
            })
    }

    fn release(&self) {
        let _ = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }

    fn insert(&self, options: &SpawnOptions) -> Arc<TaskRecord> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(TaskRecord::new(id, options));
        self.tasks.insert(id, Arc::clone(&record));
        record
    }

    fn remove(&self, id: TaskId) {
        self.tasks.remove(&id);
    }

    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.get(&id).map(|r| r.state())
    }

    pub fn info(&self, id: TaskId) -> Option<TaskInfo> {
        self.tasks.get(&id).map(|r| r.info())
    }

    /// 对注册表中的任务发出取消请求，任务不存在或已结束时返回 false
    pub fn request_cancel(&self, id: TaskId) -> bool {
        match self.tasks.get(&id) {
            Some(r) if !r.state().is_terminal() => {
                r.request_cancel();
                true
            }
            _ => false,
        }
    }

    /// 尚未结束的任务数
    pub fn active_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// 注册表中的记录数（含已结束但句柄仍在的任务）
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    #[inline]
    pub fn max_tasks(&self) -> usize {
        self.max_tasks
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("records", &self.len())
            .field("active", &self.active_count())
            .field("max_tasks", &self.max_tasks)
            .finish()
    }
}

enum Slot<T> {
    Pending,
    Done(Result<T>),
    Taken,
}

/// 任务与句柄共享的完成槽
struct TaskInner<T> {
    record: Arc<TaskRecord>,
    slot: Mutex<Slot<T>>,
    done: Condvar,
}

/// 任务体可见的上下文
pub struct TaskContext {
    record: Arc<TaskRecord>,
}

impl TaskContext {
    #[inline]
    pub fn id(&self) -> TaskId {
        self.record.id
    }

    pub fn name(&self) -> Option<&str> {
        self.record.name.as_deref()
    }

    /// 是否已收到取消请求（任务体应定期检查）
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.record.is_cancel_requested()
    }

    /// 收到取消请求时返回 `Err(Cancelled)`，方便用 `?` 提前退出
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(RuntimeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// 任务执行方
///
/// 未执行就被丢弃时（例如工作池关闭）以错误结束任务，等待者不会永远阻塞
pub(crate) struct TaskRunner<T> {
    inner: Option<Arc<TaskInner<T>>>,
    ctx: Arc<RuntimeContext>,
}

impl<T> TaskRunner<T> {
    /// 执行任务体并写入结果，返回任务终态
    pub(crate) fn run<F>(mut self, f: F) -> TaskState
    where
        F: FnOnce(&TaskContext) -> Result<T>,
    {
        let Some(inner) = self.inner.take() else {
            return TaskState::Failed;
        };

        let result = if inner.record.is_cancel_requested() {
            // 开始前已被取消，任务体不执行
            Err(RuntimeError::Cancelled)
        } else {
            inner.record.mark_running();
            let task_ctx = TaskContext {
                record: Arc::clone(&inner.record),
            };
            match panic::catch_unwind(AssertUnwindSafe(|| f(&task_ctx))) {
                Ok(result) => result,
                Err(payload) => {
                    let msg = panic_message(payload.as_ref());
                    tracing::warn!(task_id = inner.record.id, panic = %msg, "task panicked");
                    Err(RuntimeError::TaskPanicked(msg))
                }
            }
        };

        complete(&self.ctx, &inner, result)
    }
}

impl<T> Drop for TaskRunner<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            tracing::debug!(task_id = inner.record.id, "task dropped before running");
            complete(
                &self.ctx,
                &inner,
                Err(RuntimeError::Task {
                    code: ErrorCode::TaskSpawnFailed,
                    message: "task was dropped before it ran".to_string(),
                    origin: RUNTIME_NAME.to_string(),
                }),
            );
        }
    }
}

/// 写入结果、推进终态、记录生命周期
fn complete<T>(ctx: &RuntimeContext, inner: &TaskInner<T>, result: Result<T>) -> TaskState {
    let record = &inner.record;
    let state = match &result {
        Ok(_) => TaskState::Completed,
        Err(RuntimeError::Cancelled) => TaskState::Cancelled,
        Err(_) => TaskState::Failed,
    };

    // 统计和日志先于结果发布，等待方返回时都已可见
    record.mark_terminal(state);

    let stats = ctx.stats_handle();
    match state {
        TaskState::Completed => stats.tasks_completed.increment(),
        TaskState::Cancelled => stats.tasks_cancelled.increment(),
        _ => stats.tasks_failed.increment(),
    };

    let registry = ctx.task_registry();
    registry.release();

    let info = record.info();
    let run_time = info.run_time();
    tracing::debug!(
        task_id = record.id,
        state = ?state,
        run_time_us = run_time.map(|d| d.as_micros() as u64),
        "task finished"
    );
    ctx.record_lifecycle(LifecycleEvent {
        task_id: record.id,
        name: info.name,
        state,
        run_time,
        at: Instant::now(),
    });

    {
        let mut slot = inner.slot.lock();
        *slot = Slot::Done(result);
        inner.done.notify_all();
    }

    if !record.handle_alive.load(Ordering::SeqCst) {
        registry.remove(record.id);
    }
    state
}

/// 任务句柄
///
/// 只能移动，不能复制；消费型等待（`await_result`）只能调用一次
pub struct TaskHandle<T> {
    inner: Arc<TaskInner<T>>,
    registry: Arc<TaskRegistry>,
    stats: Arc<RuntimeStats>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl<T> TaskHandle<T> {
    #[inline]
    pub fn id(&self) -> TaskId {
        self.inner.record.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.record.name.as_deref()
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        self.inner.record.state()
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// 请求取消（协作式），返回是否是第一次请求
    pub fn request_cancel(&self) -> bool {
        let first = self.inner.record.request_cancel();
        if first {
            tracing::debug!(task_id = self.id(), "task cancel requested");
        }
        first
    }

    #[inline]
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.record.is_cancel_requested()
    }

    pub fn info(&self) -> TaskInfo {
        self.inner.record.info()
    }

    /// 阻塞直到任务结束，取走结果
    pub fn await_result(mut self) -> Result<T> {
        let result = {
            let mut slot = self.inner.slot.lock();
            while matches!(*slot, Slot::Pending) {
                self.inner.done.wait(&mut slot);
            }
            take_result(&mut slot)
        };
        self.join_thread();
        result
    }

    /// 限时等待
    ///
    /// 超时返回 `Timed::TimedOut`，句柄保持可用；返回 `Ready` 时结果已被取走
    pub fn await_timeout(&mut self, timeout: Duration) -> Timed<Result<T>> {
        let deadline = Instant::now() + timeout;
        let result = {
            let mut slot = self.inner.slot.lock();
            while matches!(*slot, Slot::Pending) {
                if self.inner.done.wait_until(&mut slot, deadline).timed_out() {
                    break;
                }
            }
            if matches!(*slot, Slot::Pending) {
                self.stats.tasks_timeout.increment();
                return Timed::TimedOut;
            }
            take_result(&mut slot)
        };
        self.join_thread();
        Timed::Ready(result)
    }

    /// 分离任务：不再等待，任务结束后记录自动清理
    pub fn detach(mut self) {
        self.inner.record.detached.store(true, Ordering::Release);
        // 丢弃 JoinHandle 即分离 OS 线程
        self.thread.take();
        tracing::trace!(task_id = self.id(), "task detached");
    }

    fn join_thread(&mut self) {
        if let Some(thread) = self.thread.take() {
            if let Ok(Err(e)) = thread.join() {
                tracing::warn!(task_id = self.id(), error = %e, "task thread exited with error");
            }
        }
    }
}

fn take_result<T>(slot: &mut Slot<T>) -> Result<T> {
    match std::mem::replace(slot, Slot::Taken) {
        Slot::Done(result) => result,
        Slot::Taken => Err(RuntimeError::invalid("task result was already consumed")),
        Slot::Pending => Err(RuntimeError::invalid("task has not finished")),
    }
}

impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        let record = &self.inner.record;
        record.handle_alive.store(false, Ordering::SeqCst);
        if record.state().is_terminal() {
            self.registry.remove(record.id);
        }
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// 创建任务记录，返回句柄和执行方
pub(crate) fn new_task<T>(
    ctx: &Arc<RuntimeContext>,
    options: &SpawnOptions,
) -> Result<(TaskHandle<T>, TaskRunner<T>)> {
    ctx.ensure_initialized()?;
    let registry = ctx.task_registry();
    registry.reserve()?;

    let record = registry.insert(options);
    let inner = Arc::new(TaskInner {
        record,
        slot: Mutex::new(Slot::Pending),
        done: Condvar::new(),
    });
    ctx.stats_handle().tasks_spawned.increment();

    let handle = TaskHandle {
        inner: Arc::clone(&inner),
        registry: Arc::clone(registry),
        stats: Arc::clone(ctx.stats_handle()),
        thread: None,
    };
    let runner = TaskRunner {
        inner: Some(inner),
        ctx: Arc::clone(ctx),
    };
    Ok((handle, runner))
}

/// 在专属线程上执行任务
pub(crate) fn spawn<T, F>(
    ctx: &Arc<RuntimeContext>,
    options: SpawnOptions,
    f: F,
) -> Result<TaskHandle<T>>
where
    T: Send + 'static,
    F: FnOnce(&TaskContext) -> Result<T> + Send + 'static,
{
    let (mut handle, runner) = new_task(ctx, &options)?;
    let thread_name = match &options.name {
        Some(name) => format!("{}-{}-{}", TASK_THREAD_PREFIX, handle.id(), name),
        None => format!("{}-{}", TASK_THREAD_PREFIX, handle.id()),
    };
    let stack_size = if options.stack_size == 0 {
        ctx.config().default_stack_size
    } else {
        options.stack_size
    };

    // 创建失败时闭包被丢弃，执行方以错误结束任务
    let thread = ctx
        .bridge()
        .create_thread(thread_name, stack_size, move || {
            runner.run(f);
        })?;

    tracing::debug!(
        task_id = handle.id(),
        detached = options.detached,
        priority_hint = options.priority_hint,
        "task spawned"
    );

    if !options.detached {
        handle.thread = Some(thread);
    }
    Ok(handle)
}

/// 执行外部提供的原生任务函数
///
/// 参数和结果的所有权标记原样传递
pub(crate) fn spawn_native(
    ctx: &Arc<RuntimeContext>,
    function: Option<NativeTaskFn>,
    arg: Tagged<Value>,
    options: SpawnOptions,
) -> Result<TaskHandle<Tagged<Value>>> {
    let function = function.ok_or_else(|| RuntimeError::invalid("task function is null"))?;
    spawn(ctx, options, move |_task: &TaskContext| function(arg).into_result())
}
