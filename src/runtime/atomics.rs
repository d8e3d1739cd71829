//! 原子操作与无锁栈
//!
//! 统计计数器使用 Relaxed，同步点使用 Acquire/Release。
//! 无锁栈基于 CAS 重试循环，节点回收交给 epoch 机制，
//! 弹出的元素按值移出，调用方独占

use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use crossbeam::epoch::{self, Atomic, Owned};
use crossbeam_utils::{Backoff, CachePadded};

/// 64 位原子计数器
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    pub const fn new(v: u64) -> Self {
        Self(AtomicU64::new(v))
    }

    /// 自增，返回旧值
    #[inline]
    pub fn increment_explicit(&self, order: Ordering) -> u64 {
        self.0.fetch_add(1, order)
    }

    /// 自减，返回旧值
    #[inline]
    pub fn decrement_explicit(&self, order: Ordering) -> u64 {
        self.0.fetch_sub(1, order)
    }

    #[inline]
    pub fn add_explicit(&self, n: u64, order: Ordering) -> u64 {
        self.0.fetch_add(n, order)
    }

    #[inline]
    pub fn load_explicit(&self, order: Ordering) -> u64 {
        self.0.load(order)
    }

    #[inline]
    pub fn store_explicit(&self, v: u64, order: Ordering) {
        self.0.store(v, order)
    }

    /// 纯计数，Relaxed
    #[inline]
    pub fn increment(&self) -> u64 {
        self.increment_explicit(Ordering::Relaxed)
    }

    #[inline]
    pub fn decrement(&self) -> u64 {
        self.decrement_explicit(Ordering::Relaxed)
    }

    #[inline]
    pub fn add(&self, n: u64) -> u64 {
        self.add_explicit(n, Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self) -> u64 {
        self.load_explicit(Ordering::Acquire)
    }

    #[inline]
    pub fn store(&self, v: u64) {
        self.store_explicit(v, Ordering::Release)
    }
}

/// 原子尺寸计数
#[derive(Debug, Default)]
pub struct AtomicSize(AtomicUsize);

impl AtomicSize {
    pub const fn new(v: usize) -> Self {
        Self(AtomicUsize::new(v))
    }

    #[inline]
    pub fn increment(&self) -> usize {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// 自减，已为 0 时保持不变
    #[inline]
    pub fn decrement(&self) -> usize {
        self.0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)))
            .unwrap_or(0)
    }

    #[inline]
    pub fn load(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn store(&self, v: usize) {
        self.0.store(v, Ordering::Release)
    }
}

/// 指针 CAS
///
/// 成功时返回旧指针，失败时返回当前实际值
#[inline]
pub fn compare_and_swap_explicit<T>(
    target: &AtomicPtr<T>,
    expected: *mut T,
    desired: *mut T,
    success: Ordering,
    failure: Ordering,
) -> Result<*mut T, *mut T> {
    target.compare_exchange(expected, desired, success, failure)
}

/// 指针 CAS（AcqRel / Acquire）
#[inline]
pub fn compare_and_swap<T>(
    target: &AtomicPtr<T>,
    expected: *mut T,
    desired: *mut T,
) -> Result<*mut T, *mut T> {
    compare_and_swap_explicit(target, expected, desired, Ordering::AcqRel, Ordering::Acquire)
}

/// 栈节点
struct Node<T> {
    data: ManuallyDrop<T>,
    next: Atomic<Node<T>>,
}

/// 无锁栈（Treiber 栈）
pub struct LockFreeStack<T> {
    /// 栈顶
    head: CachePadded<Atomic<Node<T>>>,
    /// 当前元素数
    len: CachePadded<AtomicUsize>,
    push_count: AtomicCounter,
    pop_count: AtomicCounter,
}

impl<T> LockFreeStack<T> {
    pub fn new() -> Self {
        Self {
            head: CachePadded::new(Atomic::null()),
            len: CachePadded::new(AtomicUsize::new(0)),
            push_count: AtomicCounter::new(0),
            pop_count: AtomicCounter::new(0),
        }
    }

    /// 压栈
    pub fn push(&self, value: T) {
        let mut node = Owned::new(Node {
            data: ManuallyDrop::new(value),
            next: Atomic::null(),
        });
        let guard = epoch::pin();
        let backoff = Backoff::new();

        loop {
            let head = self.head.load(Ordering::Acquire, &guard);
            node.next.store(head, Ordering::Relaxed);

            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Acquire, &guard)
            {
                Ok(_) => break,
                Err(e) => {
                    // 竞争失败，取回节点重试
                    node = e.new;
                    backoff.spin();
                }
            }
        }

        self.len.fetch_add(1, Ordering::Relaxed);
        self.push_count.increment();
    }

    /// 弹栈
    pub fn pop(&self) -> Option<T> {
        let guard = epoch::pin();
        let backoff = Backoff::new();

        loop {
            let head = self.head.load(Ordering::Acquire, &guard);
            let node = unsafe { head.as_ref() }?;
            let next = node.next.load(Ordering::Acquire, &guard);

            if self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire, &guard)
                .is_ok()
            {
                self.len.fetch_sub(1, Ordering::Relaxed);
                self.pop_count.increment();
                // 节点已从栈上摘下，数据只会被这里读出一次
                unsafe {
                    let value = ManuallyDrop::into_inner(ptr::read(&node.data));
                    guard.defer_destroy(head);
                    return Some(value);
                }
            }

            backoff.spin();
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        self.head.load(Ordering::Acquire, &guard).is_null()
    }

    /// 累计压栈次数
    pub fn push_count(&self) -> u64 {
        self.push_count.load()
    }

    /// 累计弹栈次数
    pub fn pop_count(&self) -> u64 {
        self.pop_count.load()
    }
}

impl<T> Default for LockFreeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LockFreeStack<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

unsafe impl<T: Send> Send for LockFreeStack<T> {}
unsafe impl<T: Send> Sync for LockFreeStack<T> {}

impl<T> std::fmt::Debug for LockFreeStack<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockFreeStack")
            .field("len", &self.len())
            .field("push_count", &self.push_count())
            .field("pop_count", &self.pop_count())
            .finish()
    }
}
