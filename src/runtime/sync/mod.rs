//! 同步原语
//!
//! 互斥锁、条件变量、读写锁、计数信号量和可重用屏障。
//! 底层全部基于 parking_lot，统计计数走原子操作，不占用原语自身的锁

pub mod barrier;
pub mod condvar;
pub mod mutex;
pub mod rwlock;
pub mod semaphore;

pub use barrier::{Barrier, BarrierWaitResult};
pub use condvar::Condvar;
pub use mutex::{Mutex, MutexGuard};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use semaphore::Semaphore;
