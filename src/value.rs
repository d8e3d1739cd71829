//! FFI 边界上的值
//!
//! 跨越 FFI 边界的任务参数、任务结果和回调载荷都携带所有权转移标记，
//! 运行时只负责原样传递，从不根据载荷内容推断

use std::fmt;

use crate::error::{ErrorCode, RuntimeError};

/// 所有权转移标记
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Ownership {
    /// 完全转移，接收方负责释放
    #[default]
    Full,
    /// 不转移，调用方仍负责释放
    None,
    /// 借用，仅在调用期间有效
    Borrowed,
}

/// 运行时可见的不透明值
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// 外部对象的地址，运行时不解引用
    Handle(usize),
}

impl Value {
    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "()"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Handle(addr) => write!(f, "<handle 0x{:x}>", addr),
        }
    }
}

/// 附带所有权标记的值
#[derive(Debug, Clone, PartialEq)]
pub struct Tagged<T = Value> {
    pub value: T,
    pub ownership: Ownership,
}

impl<T> Tagged<T> {
    pub fn new(value: T, ownership: Ownership) -> Self {
        Self { value, ownership }
    }

    /// 完全转移所有权
    pub fn owned(value: T) -> Self {
        Self::new(value, Ownership::Full)
    }

    pub fn borrowed(value: T) -> Self {
        Self::new(value, Ownership::Borrowed)
    }

    /// 替换值，保留原标记
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Tagged<U> {
        Tagged {
            value: f(self.value),
            ownership: self.ownership,
        }
    }
}

/// FFI 边界上的结果
///
/// 调用方必须先检查变体再取值
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeResult {
    Ok(Tagged<Value>),
    Err {
        code: ErrorCode,
        message: String,
        source: String,
    },
}

impl BridgeResult {
    /// 成功结果
    pub fn ok(value: Value, ownership: Ownership) -> Self {
        BridgeResult::Ok(Tagged::new(value, ownership))
    }

    /// 失败结果
    pub fn err(code: ErrorCode, message: impl Into<String>) -> Self {
        BridgeResult::Err {
            code,
            message: message.into(),
            source: crate::config::RUNTIME_NAME.to_string(),
        }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, BridgeResult::Ok(_))
    }

    #[inline]
    pub fn is_err(&self) -> bool {
        !self.is_ok()
    }

    /// 转换为 Rust 结果
    pub fn into_result(self) -> Result<Tagged<Value>, RuntimeError> {
        match self {
            BridgeResult::Ok(v) => Ok(v),
            BridgeResult::Err {
                code,
                message,
                source,
            } => Err(RuntimeError::Task {
                code,
                message,
                origin: source,
            }),
        }
    }
}

impl From<Result<Tagged<Value>, RuntimeError>> for BridgeResult {
    fn from(result: Result<Tagged<Value>, RuntimeError>) -> Self {
        match result {
            Ok(v) => BridgeResult::Ok(v),
            Err(RuntimeError::Task {
                code,
                message,
                origin,
            }) => BridgeResult::Err {
                code,
                message,
                source: origin,
            },
            Err(e) => BridgeResult::err(e.code(), e.to_string()),
        }
    }
}

/// 原生任务函数（外部代码提供的函数指针）
pub type NativeTaskFn = fn(Tagged<Value>) -> BridgeResult;

/// 原生回调函数
pub type NativeCallbackFn = fn(Tagged<Value>) -> BridgeResult;
