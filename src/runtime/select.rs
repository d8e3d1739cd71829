//! 多路选择
//!
//! 在多个 Channel 操作中等待第一个就绪的那个。
//!
//! 多个分支同时就绪时固定选择下标最小的分支。
//! 阻塞等待时同一个信号挂到所有相关 Channel 上，先挂信号再检查状态，不会丢失唤醒。
//!
//! 无缓冲 Channel 上的 select 接收分支不算作等待中的接收者，
//! 所以两个 select 分别在同一个无缓冲 Channel 的两端时不会配对

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::channel::{Channel, RecvPoll, SelectSignal, TrySendError};
use crate::error::{Result, RuntimeError, Timed};

/// select 分支
pub enum SelectCase<'a, T> {
    /// 接收
    Recv(&'a Channel<T>),
    /// 发送；值被发出后变为 None
    Send(&'a Channel<T>, Option<T>),
}

impl<'a, T> SelectCase<'a, T> {
    pub fn recv(channel: &'a Channel<T>) -> Self {
        SelectCase::Recv(channel)
    }

    pub fn send(channel: &'a Channel<T>, value: T) -> Self {
        SelectCase::Send(channel, Some(value))
    }

    fn channel(&self) -> &'a Channel<T> {
        match self {
            SelectCase::Recv(ch) | SelectCase::Send(ch, _) => *ch,
        }
    }

    /// 取回未发出的值
    pub fn take_value(&mut self) -> Option<T> {
        match self {
            SelectCase::Send(_, value) => value.take(),
            SelectCase::Recv(_) => None,
        }
    }
}

/// select 的结果，`index` 是分支在输入中的下标
#[derive(Debug, PartialEq, Eq)]
pub enum Selected<T> {
    Received { index: usize, value: T },
    Sent { index: usize },
    /// 分支所在 Channel 已关闭（接收分支：已关闭且取空；发送分支：值留在分支里）
    Closed { index: usize },
}

impl<T> Selected<T> {
    pub fn index(&self) -> usize {
        match self {
            Selected::Received { index, .. }
            | Selected::Sent { index }
            | Selected::Closed { index } => *index,
        }
    }
}

fn validate<T>(cases: &[SelectCase<'_, T>]) -> Result<()> {
    if cases.is_empty() {
        return Err(RuntimeError::invalid("select needs at least one case"));
    }
    for (i, case) in cases.iter().enumerate() {
        if let SelectCase::Send(_, None) = case {
            return Err(RuntimeError::invalid(format!(
                "select send case {} has no value",
                i
            )));
        }
    }
    Ok(())
}

/// 按下标顺序检查一轮
fn poll_cases<T>(cases: &mut [SelectCase<'_, T>]) -> Option<Selected<T>> {
    for (index, case) in cases.iter_mut().enumerate() {
        match case {
            SelectCase::Recv(ch) => match ch.poll_receive() {
                RecvPoll::Value(value) => return Some(Selected::Received { index, value }),
                RecvPoll::Closed => return Some(Selected::Closed { index }),
                RecvPoll::Empty => {}
            },
            SelectCase::Send(ch, slot) => {
                let Some(value) = slot.take() else {
                    continue;
                };
                match ch.try_send(value) {
                    Ok(()) => return Some(Selected::Sent { index }),
                    Err(TrySendError::Closed(value)) => {
                        *slot = Some(value);
                        return Some(Selected::Closed { index });
                    }
                    Err(TrySendError::Full(value)) => *slot = Some(value),
                }
            }
        }
    }
    None
}

/// 非阻塞 select，没有分支就绪时返回 `Ok(None)`
pub fn try_select<T>(cases: &mut [SelectCase<'_, T>]) -> Result<Option<Selected<T>>> {
    validate(cases)?;
    Ok(poll_cases(cases))
}

/// 阻塞 select，直到某个分支就绪
pub fn select<T>(cases: &mut [SelectCase<'_, T>]) -> Result<Selected<T>> {
    match select_until(cases, None)? {
        Timed::Ready(selected) => Ok(selected),
        Timed::TimedOut => Err(RuntimeError::invalid("select without deadline timed out")),
    }
}

/// 限时 select
pub fn select_timeout<T>(
    cases: &mut [SelectCase<'_, T>],
    timeout: Duration,
) -> Result<Timed<Selected<T>>> {
    select_until(cases, Some(Instant::now() + timeout))
}

fn select_until<T>(
    cases: &mut [SelectCase<'_, T>],
    deadline: Option<Instant>,
) -> Result<Timed<Selected<T>>> {
    validate(cases)?;

    // 快速路径
    if let Some(selected) = poll_cases(cases) {
        return Ok(Timed::Ready(selected));
    }

    let signal = Arc::new(SelectSignal::new());
    let mut watched: Vec<&Channel<T>> = Vec::with_capacity(cases.len());
    for case in cases.iter() {
        let ch = case.channel();
        if !watched.iter().any(|w| std::ptr::eq(*w, ch)) {
            ch.watch(&signal);
            watched.push(ch);
        }
    }

    let outcome = loop {
        if let Some(selected) = poll_cases(cases) {
            break Timed::Ready(selected);
        }
        if !signal.wait(deadline) {
            // 截止时间到，最后再检查一轮
            break match poll_cases(cases) {
                Some(selected) => Timed::Ready(selected),
                None => Timed::TimedOut,
            };
        }
    };

    for ch in watched {
        ch.unwatch(&signal);
    }
    Ok(outcome)
}
