//! 配置常量模块
//!
//! 运行时的默认限制和调优参数都在这里定义，便于后期修改

use std::time::Duration;

/// 运行时名称
pub const RUNTIME_NAME: &str = "Q concurrency";

/// 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 最大并存任务数
pub const DEFAULT_MAX_TASKS: usize = 10_000;

/// 回调队列容量
pub const DEFAULT_MAX_CALLBACKS: usize = 1024;

/// 任务线程默认栈大小（2MB）
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

/// 工作池任务队列默认容量
pub const DEFAULT_POOL_QUEUE_CAPACITY: usize = 256;

/// 生命周期日志保留的最大事件数
pub const DEFAULT_LIFECYCLE_LOG_CAPACITY: usize = 1024;

/// 任务线程名前缀
pub const TASK_THREAD_PREFIX: &str = "q-task";

/// 工作线程名前缀
pub const WORKER_THREAD_PREFIX: &str = "q-worker";

/// 多路复用器检查停止标志的间隔
pub const MULTIPLEXER_POLL_INTERVAL: Duration = Duration::from_millis(10);
