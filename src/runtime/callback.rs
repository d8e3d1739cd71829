//! 回调队列
//!
//! 外部线程不能直接调用 GC 托管的代码，只能把回调放进这个队列；
//! 由已登记的运行时线程取出并在自己身上执行。
//!
//! 出队顺序：优先级高的先执行，同优先级按入队顺序。
//! 单个回调失败（返回错误或 panic）只记录，不会中断本轮处理

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::atomics::AtomicCounter;
use super::stats::RuntimeStats;
use super::thread::ThreadBridge;
use crate::error::{panic_message, Result, RuntimeError, Timed};
use crate::value::{NativeCallbackFn, Tagged, Value};

/// 回调优先级，数值越大越先执行
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Priority(pub u32);

impl Priority {
    pub const LOW: Priority = Priority(0);
    pub const NORMAL: Priority = Priority(50);
    pub const HIGH: Priority = Priority(100);
}

type CallbackFn = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

struct Entry {
    priority: Priority,
    seq: u64,
    enqueued_at: Instant,
    callback: CallbackFn,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    /// 大顶堆：优先级高的在前，同优先级序号小的在前
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    shutdown: bool,
}

/// 一轮处理的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// 执行了的回调数（含失败的）
    pub processed: usize,
    pub failed: usize,
}

/// 回调队列统计
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackStats {
    pub enqueued: u64,
    pub processed: u64,
    pub failed: u64,
    /// clear 丢弃的数量
    pub dropped: u64,
    pub pending: usize,
    pub capacity: usize,
    /// 最早入队的待处理回调已等待的时长
    pub oldest_age: Option<Duration>,
}

/// 回调队列
pub struct CallbackQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
    bridge: Arc<ThreadBridge>,
    enqueued: AtomicCounter,
    processed: AtomicCounter,
    failed: AtomicCounter,
    dropped: AtomicCounter,
    stats: Arc<RuntimeStats>,
}

impl CallbackQueue {
    pub fn new(capacity: usize, bridge: Arc<ThreadBridge>, stats: Arc<RuntimeStats>) -> Result<Self> {
        if capacity == 0 {
            return Err(RuntimeError::invalid("callback queue capacity must be positive"));
        }
        Ok(Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::with_capacity(capacity.min(1024)),
                next_seq: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
            capacity,
            bridge,
            enqueued: AtomicCounter::new(0),
            processed: AtomicCounter::new(0),
            failed: AtomicCounter::new(0),
            dropped: AtomicCounter::new(0),
            stats,
        })
    }

    /// 入队一个回调（任意线程可调用，不需要登记）
    ///
    /// 返回入队序号；队列满返回 `QueueFull`，已关闭返回 `Shutdown`
    pub fn enqueue_callback<F>(&self, priority: Priority, callback: F) -> Result<u64>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(RuntimeError::Shutdown("callback queue"));
        }
        if state.heap.len() >= self.capacity {
            tracing::warn!(capacity = self.capacity, "callback queue full");
            return Err(RuntimeError::QueueFull {
                capacity: self.capacity,
            });
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Entry {
            priority,
            seq,
            enqueued_at: Instant::now(),
            callback: Box::new(callback),
        });
        self.stats.callback_queue_depth.store(state.heap.len());
        self.available.notify_one();
        drop(state);

        self.enqueued.increment();
        self.stats.callbacks_enqueued.increment();
        Ok(seq)
    }

    /// 入队外部提供的原生回调，载荷的所有权标记原样传给回调
    pub fn enqueue_native(
        &self,
        callback: Option<NativeCallbackFn>,
        payload: Tagged<Value>,
        priority: Priority,
    ) -> Result<u64> {
        let callback = callback.ok_or_else(|| RuntimeError::invalid("callback function is null"))?;
        self.enqueue_callback(priority, move || callback(payload).into_result().map(|_| ()))
    }

    /// 在当前（已登记的）线程上执行最多 `max` 个回调
    pub fn process_callbacks(&self, max: usize) -> Result<DrainReport> {
        self.bridge.ensure_registered("process_callbacks")?;

        let mut report = DrainReport::default();
        while report.processed < max {
            let entry = {
                let mut state = self.state.lock();
                let entry = state.heap.pop();
                self.stats.callback_queue_depth.store(state.heap.len());
                entry
            };
            let Some(entry) = entry else {
                break;
            };

            // 执行时不持有队列锁，回调可以再入队
            let outcome = panic::catch_unwind(AssertUnwindSafe(entry.callback));
            report.processed += 1;
            self.processed.increment();
            self.stats.callbacks_processed.increment();

            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(payload) => Some(format!("panic: {}", panic_message(payload.as_ref()))),
            };
            if let Some(reason) = failure {
                report.failed += 1;
                self.failed.increment();
                self.stats.callbacks_failed.increment();
                tracing::warn!(seq = entry.seq, priority = entry.priority.0, error = %reason, "callback failed");
            }
        }
        Ok(report)
    }

    /// 执行队列中当前所有回调
    pub fn process_all(&self) -> Result<DrainReport> {
        self.process_callbacks(usize::MAX)
    }

    /// 等待队列非空
    ///
    /// 返回当时的队列长度；队列已关闭时立即返回
    pub fn wait_for_callbacks(&self, timeout: Duration) -> Timed<usize> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.heap.is_empty() && !state.shutdown {
            if self.available.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if state.heap.is_empty() && !state.shutdown {
            Timed::TimedOut
        } else {
            Timed::Ready(state.heap.len())
        }
    }

    /// 丢弃所有待处理回调，返回丢弃数
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let n = state.heap.len();
        state.heap.clear();
        self.stats.callback_queue_depth.store(0);
        drop(state);

        self.dropped.add(n as u64);
        self.stats.callbacks_dropped.add(n as u64);
        if n > 0 {
            tracing::debug!(dropped = n, "callback queue cleared");
        }
        n
    }

    /// 关闭队列：拒绝新回调，唤醒等待者；已入队的仍可处理
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if !state.shutdown {
            state.shutdown = true;
            self.available.notify_all();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CallbackStats {
        let state = self.state.lock();
        let oldest_age = state
            .heap
            .iter()
            .map(|e| e.enqueued_at)
            .min()
            .map(|t| t.elapsed());
        CallbackStats {
            enqueued: self.enqueued.load(),
            processed: self.processed.load(),
            failed: self.failed.load(),
            dropped: self.dropped.load(),
            pending: state.heap.len(),
            capacity: self.capacity,
            oldest_age,
        }
    }
}

impl std::fmt::Debug for CallbackQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::runtime::safepoint::NoopSafepoint;
    use crate::value::{BridgeResult, Ownership};
    use std::thread;

    fn queue(capacity: usize) -> (CallbackQueue, Arc<ThreadBridge>) {
        let stats = Arc::new(RuntimeStats::new());
        let bridge = Arc::new(ThreadBridge::new(7001, Arc::new(NoopSafepoint), stats.clone()));
        (CallbackQueue::new(capacity, Arc::clone(&bridge), stats).unwrap(), bridge)
    }

    #[test]
    fn test_priority_then_fifo() {
        let (q, bridge) = queue(16);
        let order = Arc::new(Mutex::new(Vec::new()));
        for (name, prio) in [("low-1", Priority::LOW), ("high", Priority::HIGH), ("low-2", Priority::LOW)] {
            let order = Arc::clone(&order);
            q.enqueue_callback(prio, move || {
                order.lock().push(name);
                Ok(())
            })
            .unwrap();
        }

        let _guard = bridge.guard().unwrap();
        let report = q.process_all().unwrap();
        assert_eq!(report, DrainReport { processed: 3, failed: 0 });
        assert_eq!(*order.lock(), vec!["high", "low-1", "low-2"]);
    }

    #[test]
    fn test_requires_registered_thread() {
        let (q, _bridge) = queue(4);
        q.enqueue_callback(Priority::NORMAL, || Ok(())).unwrap();
        assert!(matches!(
            q.process_all(),
            Err(RuntimeError::ThreadNotRegistered(_))
        ));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_capacity_bound() {
        let (q, _bridge) = queue(2);
        q.enqueue_callback(Priority::LOW, || Ok(())).unwrap();
        q.enqueue_callback(Priority::LOW, || Ok(())).unwrap();
        assert!(q.is_full());
        let err = q.enqueue_callback(Priority::HIGH, || Ok(())).unwrap_err();
        assert!(matches!(err, RuntimeError::QueueFull { capacity: 2 }));
    }

    #[test]
    fn test_failures_do_not_stop_drain() {
        let (q, bridge) = queue(8);
        q.enqueue_callback(Priority::HIGH, || Err(RuntimeError::invalid("bad"))).unwrap();
        q.enqueue_callback(Priority::NORMAL, || panic!("callback boom")).unwrap();
        q.enqueue_callback(Priority::LOW, || Ok(())).unwrap();

        let _guard = bridge.guard().unwrap();
        let report = q.process_all().unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(report.failed, 2);
        assert_eq!(q.stats().failed, 2);
    }

    #[test]
    fn test_process_respects_max() {
        let (q, bridge) = queue(8);
        for _ in 0..5 {
            q.enqueue_callback(Priority::NORMAL, || Ok(())).unwrap();
        }
        let _guard = bridge.guard().unwrap();
        assert_eq!(q.process_callbacks(2).unwrap().processed, 2);
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_clear_and_stats() {
        let (q, _bridge) = queue(8);
        q.enqueue_callback(Priority::NORMAL, || Ok(())).unwrap();
        q.enqueue_callback(Priority::NORMAL, || Ok(())).unwrap();
        thread::sleep(Duration::from_millis(5));
        let stats = q.stats();
        assert_eq!(stats.pending, 2);
        assert!(stats.oldest_age.unwrap() >= Duration::from_millis(5));

        assert_eq!(q.clear(), 2);
        let stats = q.stats();
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.pending, 0);
        assert!(stats.oldest_age.is_none());
    }

    #[test]
    fn test_wait_for_callbacks_from_foreign_thread() {
        let (q, _bridge) = queue(8);
        let q = Arc::new(q);
        assert!(q.wait_for_callbacks(Duration::from_millis(5)).is_timed_out());

        let q2 = Arc::clone(&q);
        let foreign = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            q2.enqueue_callback(Priority::NORMAL, || Ok(())).unwrap();
        });
        assert_eq!(q.wait_for_callbacks(Duration::from_secs(5)), Timed::Ready(1));
        foreign.join().unwrap();
    }

    #[test]
    fn test_shutdown_rejects_new_callbacks() {
        let (q, _bridge) = queue(4);
        q.shutdown();
        assert!(matches!(
            q.enqueue_callback(Priority::LOW, || Ok(())),
            Err(RuntimeError::Shutdown(_))
        ));
        assert_eq!(q.wait_for_callbacks(Duration::from_secs(5)), Timed::Ready(0));
    }

    fn failing(payload: Tagged<Value>) -> BridgeResult {
        if payload.ownership == Ownership::Borrowed {
            BridgeResult::err(ErrorCode::TaskFailed, "borrowed payload")
        } else {
            BridgeResult::ok(Value::Unit, Ownership::None)
        }
    }

    #[test]
    fn test_native_callbacks() {
        let (q, bridge) = queue(4);
        assert!(q.enqueue_native(None, Tagged::owned(Value::Unit), Priority::LOW).is_err());
        q.enqueue_native(Some(failing), Tagged::owned(Value::Int(1)), Priority::LOW).unwrap();
        q.enqueue_native(Some(failing), Tagged::borrowed(Value::Int(2)), Priority::LOW).unwrap();

        let _guard = bridge.guard().unwrap();
        let report = q.process_all().unwrap();
        assert_eq!(report, DrainReport { processed: 2, failed: 1 });
    }
}
