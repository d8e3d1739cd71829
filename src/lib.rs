//! Q 语言并发运行时
//!
//! 任务、通道与 select、同步原语、工作池，以及让外部线程安全回到运行时的回调队列。
//!
//! ```no_run
//! use qlang_concurrency::{RuntimeConfig, RuntimeContext, SpawnOptions};
//!
//! let ctx = RuntimeContext::new(RuntimeConfig::default())?;
//! let handle = ctx.spawn(SpawnOptions::new(), |_| Ok(6 * 7))?;
//! assert_eq!(handle.await_result()?, 42);
//! # Ok::<(), qlang_concurrency::RuntimeError>(())
//! ```

pub mod config;
pub mod error;
pub mod runtime;
pub mod value;

pub use error::{ErrorCode, Result, RuntimeError, Timed};
pub use runtime::{
    Channel, LoadBalancer, Priority, RuntimeConfig, RuntimeContext, SpawnOptions, Strategy,
    TaskHandle, TaskState, WorkerPool,
};
pub use value::{BridgeResult, Ownership, Tagged, Value};
