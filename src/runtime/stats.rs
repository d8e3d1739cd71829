//! 运行时统计
//!
//! 各组件在热路径上只做 Relaxed 原子自增；快照逐个读取计数器，不加锁，
//! 因此不会阻塞生产者（快照各字段之间不保证是同一时刻的值）

use std::fmt;

use super::atomics::{AtomicCounter, AtomicSize};

macro_rules! runtime_stats {
    (
        counters { $($(#[$cdoc:meta])* $counter:ident,)* }
        gauges { $($(#[$gdoc:meta])* $gauge:ident,)* }
    ) => {
        /// 运行时共享的统计计数器
        #[derive(Debug, Default)]
        pub struct RuntimeStats {
            $($(#[$cdoc])* pub $counter: AtomicCounter,)*
            $($(#[$gdoc])* pub $gauge: AtomicSize,)*
        }

        /// 统计快照（只读）
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct StatsSnapshot {
            $($(#[$cdoc])* pub $counter: u64,)*
            $($(#[$gdoc])* pub $gauge: usize,)*
        }

        impl RuntimeStats {
            pub fn new() -> Self {
                Self::default()
            }

            /// 读取快照
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($counter: self.$counter.load(),)*
                    $($gauge: self.$gauge.load(),)*
                }
            }

            /// 清零累计计数器，瞬时量（当前线程数、队列深度）保持不变
            pub fn reset(&self) {
                $(self.$counter.store(0);)*
            }
        }

        impl fmt::Display for StatsSnapshot {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                $(writeln!(f, "{:<26} {}", stringify!($counter), self.$counter)?;)*
                $(writeln!(f, "{:<26} {}", stringify!($gauge), self.$gauge)?;)*
                Ok(())
            }
        }
    };
}

runtime_stats! {
    counters {
        tasks_spawned,
        tasks_completed,
        tasks_failed,
        tasks_cancelled,
        /// await_timeout 超时次数
        tasks_timeout,
        callbacks_enqueued,
        callbacks_processed,
        callbacks_dropped,
        callbacks_failed,
        /// 累计线程登记次数
        threads_registered,
        gc_roots_registered,
        mutex_locks,
        mutex_contentions,
        condvar_waits,
        condvar_signals,
        rwlock_reads,
        rwlock_writes,
        rwlock_contentions,
        semaphore_acquires,
        semaphore_releases,
        barrier_waits,
        channels_created,
        channel_sends,
        channel_receives,
        pool_jobs_submitted,
        pool_jobs_completed,
        /// 生命周期日志已满而丢弃的事件数
        lifecycle_events_dropped,
    }
    gauges {
        /// 当前已登记的线程数
        threads_active,
        callback_queue_depth,
    }
}
