//! Channel 实现
//!
//! 有界环形缓冲 Channel（容量 0 为无缓冲的交会模式）。
//! 缓冲区、关闭标志和等待计数都由同一把锁保护，
//! 配合两个条件变量：有空间（not_full）和有数据（not_empty）。
//!
//! 无缓冲模式下发送者把带序号的值放入缓冲区，等待接收者取走；
//! 关闭或超时时还没被取走的值按序号找回，退还给发送者

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::atomics::AtomicCounter;
use super::stats::RuntimeStats;
use crate::error::{RuntimeError, Timed};

/// Channel ID 计数器
static CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// 发送失败：Channel 已关闭，值原样退还
pub struct SendError<T>(pub T);

impl<T> SendError<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SendError(..)")
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("sending on a closed channel")
    }
}

impl<T> std::error::Error for SendError<T> {}

impl<T> From<SendError<T>> for RuntimeError {
    fn from(_: SendError<T>) -> Self {
        RuntimeError::ChannelClosed
    }
}

/// 非阻塞发送失败
pub enum TrySendError<T> {
    /// 缓冲区已满（无缓冲时：没有等待中的接收者）
    Full(T),
    Closed(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(v) | TrySendError::Closed(v) => v,
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, TrySendError::Closed(_))
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("Full(..)"),
            TrySendError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

/// 限时发送的结果（超时不是错误）
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome<T> {
    Sent,
    /// 截止时间已到，值退还
    TimedOut(T),
}

/// 非阻塞接收的内部结果
pub(crate) enum RecvPoll<T> {
    Value(T),
    Empty,
    Closed,
}

/// select 等待信号
///
/// 阻塞的 select 把同一个信号挂到所有相关 Channel 上，任一 Channel 状态变化都会触发它
pub(crate) struct SelectSignal {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl SelectSignal {
    pub(crate) fn new() -> Self {
        Self {
            fired: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn notify(&self) {
        let mut fired = self.fired.lock();
        *fired = true;
        self.cond.notify_one();
    }

    /// 等待信号触发，返回 false 表示到达截止时间
    pub(crate) fn wait(&self, deadline: Option<Instant>) -> bool {
        let mut fired = self.fired.lock();
        while !*fired {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut fired, deadline).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut fired),
            }
        }
        std::mem::replace(&mut *fired, false)
    }
}

struct ChanState<T> {
    /// (序号, 值)
    buffer: VecDeque<(u64, T)>,
    next_seq: u64,
    closed: bool,
    waiting_senders: usize,
    waiting_receivers: usize,
    watchers: Vec<Arc<SelectSignal>>,
}

impl<T> ChanState<T> {
    fn notify_watchers(&self) {
        for signal in &self.watchers {
            signal.notify();
        }
    }

    fn position_of(&self, seq: u64) -> Option<usize> {
        self.buffer.iter().position(|(s, _)| *s == seq)
    }
}

/// Channel 统计信息
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    pub id: u64,
    pub name: Option<String>,
    pub capacity: usize,
    pub len: usize,
    pub closed: bool,
    pub waiting_senders: usize,
    pub waiting_receivers: usize,
    pub send_count: u64,
    pub receive_count: u64,
    /// 缓冲区占用率（百分比，无缓冲时为 0）
    pub utilization: f64,
}

/// Channel
///
/// 支持带缓冲和无缓冲两种模式，通常放在 `Arc` 里跨线程共享
pub struct Channel<T> {
    id: u64,
    name: Option<String>,
    /// 缓冲区容量（0 表示无缓冲）
    capacity: usize,
    state: Mutex<ChanState<T>>,
    /// 有空间（无缓冲时：有值被取走）
    not_full: Condvar,
    /// 有数据
    not_empty: Condvar,
    send_count: AtomicCounter,
    receive_count: AtomicCounter,
    stats: Arc<RuntimeStats>,
}

impl<T> Channel<T> {
    /// 创建 Channel，容量 0 为无缓冲
    pub fn new(capacity: usize) -> Self {
        Self {
            id: CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            name: None,
            capacity,
            state: Mutex::new(ChanState {
                buffer: VecDeque::with_capacity(capacity),
                next_seq: 0,
                closed: false,
                waiting_senders: 0,
                waiting_receivers: 0,
                watchers: Vec::new(),
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            send_count: AtomicCounter::new(0),
            receive_count: AtomicCounter::new(0),
            stats: Arc::new(RuntimeStats::new()),
        }
    }

    /// 创建无缓冲 Channel
    pub fn rendezvous() -> Self {
        Self::new(0)
    }

    pub fn named(name: impl Into<String>, capacity: usize) -> Self {
        let mut ch = Self::new(capacity);
        ch.name = Some(name.into());
        ch
    }

    pub fn with_stats(mut self, stats: Arc<RuntimeStats>) -> Self {
        self.stats = stats;
        self
    }

    /// 获取 Channel ID
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// 获取容量
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn is_rendezvous(&self) -> bool {
        self.capacity == 0
    }

    /// 缓冲区中的值数量（无缓冲时恒为 0）
    pub fn len(&self) -> usize {
        if self.is_rendezvous() {
            0
        } else {
            self.state.lock().buffer.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 此刻发送是否会阻塞
    pub fn is_full(&self) -> bool {
        let state = self.state.lock();
        if self.is_rendezvous() {
            state.waiting_receivers <= state.buffer.len()
        } else {
            state.buffer.len() >= self.capacity
        }
    }

    /// 检查是否已关闭
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn waiting_senders(&self) -> usize {
        self.state.lock().waiting_senders
    }

    pub fn waiting_receivers(&self) -> usize {
        self.state.lock().waiting_receivers
    }

    pub fn send_count(&self) -> u64 {
        self.send_count.load()
    }

    pub fn receive_count(&self) -> u64 {
        self.receive_count.load()
    }

    /// 发送值（阻塞）
    ///
    /// Channel 已关闭时返回 `SendError`，值原样退还
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        match self.send_until(value, None) {
            Ok(SendOutcome::Sent) => Ok(()),
            // 没有截止时间就不会超时
            Ok(SendOutcome::TimedOut(value)) => Err(SendError(value)),
            Err(e) => Err(e),
        }
    }

    /// 限时发送，截止时间在进入时计算一次
    pub fn send_timeout(&self, value: T, timeout: Duration) -> Result<SendOutcome<T>, SendError<T>> {
        self.send_until(value, Some(Instant::now() + timeout))
    }

    fn send_until(&self, value: T, deadline: Option<Instant>) -> Result<SendOutcome<T>, SendError<T>> {
        let mut state = self.state.lock();
        if self.is_rendezvous() {
            return self.offer_and_wait(state, value, deadline);
        }

        loop {
            if state.closed {
                return Err(SendError(value));
            }
            if state.buffer.len() < self.capacity {
                self.push(&mut state, value);
                return Ok(SendOutcome::Sent);
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                return Ok(SendOutcome::TimedOut(value));
            }

            state.waiting_senders += 1;
            match deadline {
                Some(deadline) => {
                    self.not_full.wait_until(&mut state, deadline);
                }
                None => self.not_full.wait(&mut state),
            }
            state.waiting_senders -= 1;
        }
    }

    /// 无缓冲发送：放入带序号的值，等待接收者取走
    fn offer_and_wait(
        &self,
        mut state: parking_lot::MutexGuard<'_, ChanState<T>>,
        value: T,
        deadline: Option<Instant>,
    ) -> Result<SendOutcome<T>, SendError<T>> {
        if state.closed {
            return Err(SendError(value));
        }

        let seq = self.enqueue(&mut state, value);
        state.waiting_senders += 1;

        let mut timed_out = false;
        while state.position_of(seq).is_some() && !state.closed && !timed_out {
            match deadline {
                Some(deadline) => {
                    timed_out = self.not_full.wait_until(&mut state, deadline).timed_out();
                }
                None => self.not_full.wait(&mut state),
            }
        }
        state.waiting_senders -= 1;

        // 没被取走：找回自己的值；被取走时发送计数已在 pop 里记下
        let Some(pos) = state.position_of(seq) else {
            return Ok(SendOutcome::Sent);
        };
        match state.buffer.remove(pos) {
            Some((_, value)) if state.closed => Err(SendError(value)),
            Some((_, value)) => Ok(SendOutcome::TimedOut(value)),
            None => Ok(SendOutcome::Sent),
        }
    }

    /// 尝试发送（非阻塞）
    ///
    /// 无缓冲时只有在有接收者阻塞等待时才能成功
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TrySendError::Closed(value));
        }

        if self.is_rendezvous() {
            // 每个等待中的接收者最多对应一个待取的值
            if state.waiting_receivers <= state.buffer.len() {
                return Err(TrySendError::Full(value));
            }
            self.enqueue(&mut state, value);
            return Ok(());
        }

        if state.buffer.len() < self.capacity {
            self.push(&mut state, value);
            Ok(())
        } else {
            Err(TrySendError::Full(value))
        }
    }

    fn push(&self, state: &mut ChanState<T>, value: T) {
        self.enqueue(state, value);
        self.record_send();
    }

    fn enqueue(&self, state: &mut ChanState<T>, value: T) -> u64 {
        let seq = state.next_seq;
        state.next_seq = seq.wrapping_add(1);
        state.buffer.push_back((seq, value));
        self.not_empty.notify_one();
        state.notify_watchers();
        seq
    }

    /// 接收值（阻塞）
    ///
    /// 返回 Some(value) 表示接收成功，None 表示 Channel 已关闭且为空
    pub fn receive(&self) -> Option<T> {
        match self.receive_until(None) {
            Timed::Ready(v) => v,
            Timed::TimedOut => None,
        }
    }

    /// 限时接收
    pub fn receive_timeout(&self, timeout: Duration) -> Timed<Option<T>> {
        self.receive_until(Some(Instant::now() + timeout))
    }

    fn receive_until(&self, deadline: Option<Instant>) -> Timed<Option<T>> {
        let mut state = self.state.lock();
        loop {
            if let Some(value) = self.pop(&mut state) {
                return Timed::Ready(Some(value));
            }
            if state.closed {
                return Timed::Ready(None);
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                return Timed::TimedOut;
            }

            state.waiting_receivers += 1;
            // 无缓冲的 select 发送方在等接收者出现
            state.notify_watchers();
            match deadline {
                Some(deadline) => {
                    self.not_empty.wait_until(&mut state, deadline);
                }
                None => self.not_empty.wait(&mut state),
            }
            state.waiting_receivers -= 1;
        }
    }

    /// 尝试接收（非阻塞）
    pub fn try_receive(&self) -> Option<T> {
        match self.poll_receive() {
            RecvPoll::Value(v) => Some(v),
            RecvPoll::Empty | RecvPoll::Closed => None,
        }
    }

    pub(crate) fn poll_receive(&self) -> RecvPoll<T> {
        let mut state = self.state.lock();
        match self.pop(&mut state) {
            Some(v) => RecvPoll::Value(v),
            None if state.closed => RecvPoll::Closed,
            None => RecvPoll::Empty,
        }
    }

    fn pop(&self, state: &mut ChanState<T>) -> Option<T> {
        let (_, value) = state.buffer.pop_front()?;
        if self.is_rendezvous() {
            // 无缓冲的值在交接时才算发送成功，和接收计数在同一把锁下更新
            self.record_send();
            // 发送者各自等待自己的序号，需要全部唤醒
            self.not_full.notify_all();
        } else {
            self.not_full.notify_one();
        }
        state.notify_watchers();
        self.receive_count.increment();
        self.stats.channel_receives.increment();
        Some(value)
    }

    /// 关闭 Channel
    ///
    /// 幂等，重复关闭不是错误；返回值表示本次调用是否真的关闭了它
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;

        // 唤醒所有等待者
        self.not_full.notify_all();
        self.not_empty.notify_all();
        state.notify_watchers();
        tracing::trace!(channel = self.id, name = ?self.name, "channel closed");
        true
    }

    /// 阻塞迭代，直到 Channel 关闭且取空
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { channel: self }
    }

    pub fn info(&self) -> ChannelInfo {
        let state = self.state.lock();
        let len = if self.is_rendezvous() { 0 } else { state.buffer.len() };
        let utilization = if self.capacity == 0 {
            0.0
        } else {
            len as f64 * 100.0 / self.capacity as f64
        };
        ChannelInfo {
            id: self.id,
            name: self.name.clone(),
            capacity: self.capacity,
            len,
            closed: state.closed,
            waiting_senders: state.waiting_senders,
            waiting_receivers: state.waiting_receivers,
            send_count: self.send_count(),
            receive_count: self.receive_count(),
            utilization,
        }
    }

    pub(crate) fn watch(&self, signal: &Arc<SelectSignal>) {
        self.state.lock().watchers.push(Arc::clone(signal));
    }

    pub(crate) fn unwatch(&self, signal: &Arc<SelectSignal>) {
        self.state
            .lock()
            .watchers
            .retain(|s| !Arc::ptr_eq(s, signal));
    }

    #[inline]
    fn record_send(&self) {
        self.send_count.increment();
        self.stats.channel_sends.increment();
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// 阻塞迭代器
pub struct Iter<'a, T> {
    channel: &'a Channel<T>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.channel.receive()
    }
}

impl<'a, T> IntoIterator for &'a Channel<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}
