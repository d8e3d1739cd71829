//! 并发运行时模块
//!
//! 把轻量任务映射到操作系统线程上执行，并提供线程间通信和同步
//!
//! 核心组件：
//! - Context: 运行时上下文，持有线程登记桥、任务注册表、回调队列和统计
//! - Task: 在专属线程或工作池上执行的任务，通过句柄等待结果
//! - Channel: 有界 / 无缓冲通道，配合 select 多路等待
//! - Pool: 常驻工作线程池、负载均衡器和扇出 / 扇入 / 流水线模式
//! - Callback: 外部线程回到运行时的回调队列

pub mod atomics;
pub mod balancer;
pub mod callback;
pub mod channel;
pub mod context;
pub mod patterns;
pub mod pool;
pub mod safepoint;
pub mod select;
pub mod stats;
pub mod sync;
pub mod task;
pub mod thread;

pub use atomics::{compare_and_swap, AtomicCounter, AtomicSize, LockFreeStack};
pub use balancer::{LoadBalancer, Strategy};
pub use callback::{CallbackQueue, CallbackStats, DrainReport, Priority};
pub use channel::{Channel, ChannelInfo, SendError, SendOutcome, TrySendError};
pub use context::{RuntimeConfig, RuntimeContext};
pub use patterns::{fan_in, fan_out, Fan, FanIn, FanOut, Multiplexer, Pipeline};
pub use pool::{PoolStats, WorkerPool};
pub use safepoint::{CountingSafepoint, NoopSafepoint, SafepointCollaborator};
pub use select::{select, select_timeout, try_select, SelectCase, Selected};
pub use stats::{RuntimeStats, StatsSnapshot};
pub use sync::{Barrier, BarrierWaitResult, Condvar, Mutex, RwLock, Semaphore};
pub use task::{LifecycleEvent, SpawnOptions, TaskContext, TaskHandle, TaskInfo, TaskState};
pub use thread::{ThreadBridge, ThreadGuard};

/// 任务 ID 类型
pub type TaskId = u64;

/// 获取当前 CPU 核心数
pub fn num_processors() -> usize {
    num_cpus::get()
}
