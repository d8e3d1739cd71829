//! 运行时错误定义
//!
//! 并发运行时所有可失败操作共用的错误类型，以及与外部（FFI）调用方约定的数值错误码

use std::fmt;
use std::io;

/// 数值错误码
///
/// 数值在 FFI 边界上是稳定的，按子系统分段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    None = 0x0000,
    InitFailed = 0x0001,
    SystemError = 0x0002,

    // 任务（0x1000 段）
    TaskSpawnFailed = 0x1001,
    TaskFailed = 0x1002,
    Timeout = 0x1003,
    InvalidArgument = 0x1004,
    Cancelled = 0x1005,
    TaskPanicked = 0x1006,

    // 同步（0x2000 段）
    ThreadNotRegistered = 0x2001,
    LockFailure = 0x2002,
    CapacityExceeded = 0x2003,
    Shutdown = 0x2004,

    // 通道（0x3000 段）
    QueueFull = 0x3001,
    ChannelClosed = 0x3002,

    // 模式（0x4000 段）
    AllocationFailure = 0x4001,
}

impl ErrorCode {
    /// 错误码数值
    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(0x{:04x})", self, self.as_u32())
    }
}

/// 运行时错误
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// 参数无效（空函数、非法容量等）
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("allocation failed: {0}")]
    AllocationFailure(String),

    /// 底层锁原语初始化或加锁失败
    #[error("lock failure: {0}")]
    LockFailure(String),

    #[error("channel is closed")]
    ChannelClosed,

    /// 超出上限（信号量许可、任务数等）
    #[error("{what} capacity exceeded (limit {limit})")]
    CapacityExceeded { what: &'static str, limit: usize },

    #[error("callback queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// 在初始化之前或关闭之后使用运行时
    #[error("runtime not initialized: {0}")]
    NotInitialized(&'static str),

    /// 当前线程未在 GC 安全点登记
    #[error("thread {0} is not registered with the runtime")]
    ThreadNotRegistered(String),

    #[error("failed to create thread: {0}")]
    ThreadCreationFailure(#[from] io::Error),

    #[error("task panicked: {0}")]
    TaskPanicked(String),

    #[error("task was cancelled")]
    Cancelled,

    /// 原语已销毁或运行时正在关闭
    #[error("{0} has been shut down")]
    Shutdown(&'static str),

    /// 原生任务或回调返回的错误
    ///
    /// `origin` 记录产生错误的一方，跨 FFI 往返时原样保留
    #[error("task failed [{code}]: {message}")]
    Task {
        code: ErrorCode,
        message: String,
        origin: String,
    },
}

impl RuntimeError {
    /// 对应的数值错误码
    pub fn code(&self) -> ErrorCode {
        match self {
            RuntimeError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            RuntimeError::AllocationFailure(_) => ErrorCode::AllocationFailure,
            RuntimeError::LockFailure(_) => ErrorCode::LockFailure,
            RuntimeError::ChannelClosed => ErrorCode::ChannelClosed,
            RuntimeError::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            RuntimeError::QueueFull { .. } => ErrorCode::QueueFull,
            RuntimeError::NotInitialized(_) => ErrorCode::InitFailed,
            RuntimeError::ThreadNotRegistered(_) => ErrorCode::ThreadNotRegistered,
            RuntimeError::ThreadCreationFailure(_) => ErrorCode::TaskSpawnFailed,
            RuntimeError::TaskPanicked(_) => ErrorCode::TaskPanicked,
            RuntimeError::Cancelled => ErrorCode::Cancelled,
            RuntimeError::Shutdown(_) => ErrorCode::Shutdown,
            RuntimeError::Task { code, .. } => *code,
        }
    }

    /// 构造参数错误
    pub fn invalid(msg: impl Into<String>) -> Self {
        RuntimeError::InvalidArgument(msg.into())
    }
}

/// 运行时结果类型
pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;

/// 带超时操作的结果
///
/// 超时是正常结果而不是错误，因此与 `RuntimeError` 分开表示
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timed<T> {
    /// 在截止时间前完成
    Ready(T),
    /// 截止时间已到
    TimedOut,
}

impl<T> Timed<T> {
    #[inline]
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Timed::TimedOut)
    }

    /// 转换为 Option，超时为 None
    #[inline]
    pub fn ready(self) -> Option<T> {
        match self {
            Timed::Ready(v) => Some(v),
            Timed::TimedOut => None,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Timed<U> {
        match self {
            Timed::Ready(v) => Timed::Ready(f(v)),
            Timed::TimedOut => Timed::TimedOut,
        }
    }
}

/// 捕获的 panic 载荷转为字符串
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
