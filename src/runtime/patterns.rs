//! 流式并发模式
//!
//! 扇出、扇入、流水线和多路复用器，全部建立在 Channel 和任务之上。
//! 唯一的终止信号是输入 Channel 关闭：每个阶段把输入取空后退出，
//! 最后一个退出的任务关闭输出 Channel，下游据此结束

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::channel::Channel;
use super::context::RuntimeContext;
use super::select::{select_timeout, SelectCase, Selected};
use super::task::{SpawnOptions, TaskHandle};
use crate::config::MULTIPLEXER_POLL_INTERVAL;
use crate::error::{Result, RuntimeError, Timed};

/// 阶段任务退出时的收尾
///
/// 在 panic 展开时同样执行，保证下游不会永远阻塞
struct StageExit<I, O> {
    input: Arc<Channel<I>>,
    output: Arc<Channel<O>>,
    /// 共享同一输出的剩余任务数
    remaining: Arc<AtomicUsize>,
}

impl<I, O> Drop for StageExit<I, O> {
    fn drop(&mut self) {
        // 输入可能还没关闭（下游提前关闭或本阶段出错），关闭它让上游停止
        self.input.close();
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.output.close();
        }
    }
}

/// 一组写同一个输出 Channel 的任务
pub struct Fan<O> {
    output: Arc<Channel<O>>,
    handles: Vec<TaskHandle<usize>>,
}

/// 扇出的结果
pub type FanOut<O> = Fan<O>;
/// 扇入的结果
pub type FanIn<O> = Fan<O>;

impl<O> Fan<O> {
    /// 共享输出 Channel，所有任务退出后关闭
    pub fn output(&self) -> &Arc<Channel<O>> {
        &self.output
    }

    /// 任务数
    pub fn width(&self) -> usize {
        self.handles.len()
    }

    /// 等待所有任务结束，返回处理的元素总数
    ///
    /// 有任务失败时仍会等完其余任务，再返回第一个错误
    pub fn join(self) -> Result<usize> {
        let mut total = 0;
        let mut first_err = None;
        for handle in self.handles {
            match handle.await_result() {
                Ok(n) => total += n,
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }
}

impl<O> std::fmt::Debug for Fan<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fan")
            .field("output", &self.output.id())
            .field("width", &self.handles.len())
            .finish()
    }
}

/// 扇出：`workers` 个任务并发读取同一个输入 Channel，结果写入共享输出 Channel
///
/// 输出顺序不保证与输入一致
pub fn fan_out<I, O, F>(
    ctx: &Arc<RuntimeContext>,
    input: Arc<Channel<I>>,
    workers: usize,
    output_capacity: usize,
    f: F,
) -> Result<FanOut<O>>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> O + Send + Sync + 'static,
{
    if workers == 0 {
        return Err(RuntimeError::invalid("fan_out needs at least one worker"));
    }

    let output = Arc::new(ctx.channel(output_capacity));
    let remaining = Arc::new(AtomicUsize::new(workers));
    let f = Arc::new(f);
    let mut handles = Vec::with_capacity(workers);

    for i in 0..workers {
        let exit = StageExit {
            input: Arc::clone(&input),
            output: Arc::clone(&output),
            remaining: Arc::clone(&remaining),
        };
        let f = Arc::clone(&f);
        let spawned = ctx.spawn(SpawnOptions::new().name(format!("fan-out-{}", i)), move |_| {
            let exit = exit;
            let mut count = 0;
            for item in exit.input.iter() {
                if exit.output.send(f(item)).is_err() {
                    break;
                }
                count += 1;
            }
            Ok(count)
        });
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                // 失败的那个任务的收尾已随闭包丢弃执行，剩下的还没创建
                for _ in (i + 1)..workers {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        output.close();
                    }
                }
                return Err(e);
            }
        }
    }

    tracing::debug!(workers, output = output.id(), "fan-out started");
    Ok(Fan { output, handles })
}

/// 扇入：把多个输入 Channel 的值合并到一个输出 Channel
///
/// 所有输入都关闭并取空后关闭输出；单个输入内部保持 FIFO
pub fn fan_in<T>(
    ctx: &Arc<RuntimeContext>,
    inputs: Vec<Arc<Channel<T>>>,
    output_capacity: usize,
) -> Result<FanIn<T>>
where
    T: Send + 'static,
{
    if inputs.is_empty() {
        return Err(RuntimeError::invalid("fan_in needs at least one input"));
    }

    let width = inputs.len();
    let output = Arc::new(ctx.channel(output_capacity));
    let remaining = Arc::new(AtomicUsize::new(width));
    let mut handles = Vec::with_capacity(width);

    for (i, input) in inputs.into_iter().enumerate() {
        let exit = StageExit {
            input,
            output: Arc::clone(&output),
            remaining: Arc::clone(&remaining),
        };
        let spawned = ctx.spawn(SpawnOptions::new().name(format!("fan-in-{}", i)), move |_| {
            let exit = exit;
            let mut count = 0;
            for item in exit.input.iter() {
                if exit.output.send(item).is_err() {
                    break;
                }
                count += 1;
            }
            Ok(count)
        });
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                for _ in (i + 1)..width {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        output.close();
                    }
                }
                return Err(e);
            }
        }
    }

    tracing::debug!(inputs = width, output = output.id(), "fan-in started");
    Ok(Fan { output, handles })
}

/// 流水线
///
/// 每个阶段一个任务，阶段的输出 Channel 就是下一阶段的输入 Channel
pub struct Pipeline<T> {
    ctx: Arc<RuntimeContext>,
    current: Arc<Channel<T>>,
    handles: Vec<TaskHandle<usize>>,
}

impl<T: Send + 'static> Pipeline<T> {
    pub fn new(ctx: &Arc<RuntimeContext>, input: Arc<Channel<T>>) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            current: input,
            handles: Vec::new(),
        }
    }

    /// 追加一个阶段
    pub fn stage<U, F>(self, capacity: usize, f: F) -> Result<Pipeline<U>>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        let mut f = f;
        self.filter_stage(capacity, move |item| Some(f(item)))
    }

    /// 追加一个可以丢弃元素的阶段（返回 None 的元素不会传给下游）
    pub fn filter_stage<U, F>(self, capacity: usize, mut f: F) -> Result<Pipeline<U>>
    where
        U: Send + 'static,
        F: FnMut(T) -> Option<U> + Send + 'static,
    {
        let Pipeline {
            ctx,
            current,
            mut handles,
        } = self;

        let output = Arc::new(ctx.channel(capacity));
        let exit = StageExit {
            input: current,
            output: Arc::clone(&output),
            remaining: Arc::new(AtomicUsize::new(1)),
        };
        let index = handles.len();
        let handle = ctx.spawn(
            SpawnOptions::new().name(format!("pipeline-{}", index)),
            move |_| {
                let exit = exit;
                let mut count = 0;
                for item in exit.input.iter() {
                    count += 1;
                    if let Some(out) = f(item) {
                        if exit.output.send(out).is_err() {
                            break;
                        }
                    }
                }
                Ok(count)
            },
        )?;
        handles.push(handle);

        Ok(Pipeline {
            ctx,
            current: output,
            handles,
        })
    }

    /// 阶段数
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// 结束构建，返回最后一个阶段的输出
    pub fn output(self) -> Fan<T> {
        Fan {
            output: self.current,
            handles: self.handles,
        }
    }
}

/// 多路复用器
///
/// 用 select 从多个输入 Channel 取值交给同一个处理函数，
/// 直到所有输入关闭或调用 `stop`
pub struct Multiplexer {
    stop: Arc<AtomicBool>,
    handle: TaskHandle<usize>,
}

impl Multiplexer {
    /// 启动多路复用任务，处理函数收到 (输入下标, 值)
    pub fn start<T, F>(
        ctx: &Arc<RuntimeContext>,
        inputs: Vec<Arc<Channel<T>>>,
        mut processor: F,
    ) -> Result<Self>
    where
        T: Send + 'static,
        F: FnMut(usize, T) + Send + 'static,
    {
        if inputs.is_empty() {
            return Err(RuntimeError::invalid("multiplexer needs at least one input"));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = ctx.spawn(SpawnOptions::new().name("multiplexer"), move |task| {
            // 仍然打开的输入的原始下标
            let mut open: Vec<usize> = (0..inputs.len()).collect();
            let mut processed = 0;

            while !open.is_empty() {
                if stop_flag.load(Ordering::Acquire) || task.is_cancelled() {
                    break;
                }
                let mut cases: Vec<SelectCase<'_, T>> =
                    open.iter().map(|&i| SelectCase::recv(&*inputs[i])).collect();
                match select_timeout(&mut cases, MULTIPLEXER_POLL_INTERVAL)? {
                    Timed::Ready(Selected::Received { index, value }) => {
                        processor(open[index], value);
                        processed += 1;
                    }
                    Timed::Ready(Selected::Closed { index }) => {
                        open.remove(index);
                    }
                    Timed::Ready(Selected::Sent { .. }) | Timed::TimedOut => {}
                }
            }
            Ok(processed)
        })?;

        Ok(Self { stop, handle })
    }

    /// 请求停止（下一次轮询时生效）
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// 等待结束，返回处理的值数量
    pub fn join(self) -> Result<usize> {
        self.handle.await_result()
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("task", &self.handle.id())
            .field("stopped", &self.stop.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::context::RuntimeConfig;
    use parking_lot::Mutex;
    use std::thread;
    use std::time::Duration;

    fn ctx() -> Arc<RuntimeContext> {
        RuntimeContext::new(RuntimeConfig::default()).unwrap()
    }

    fn feed(ch: &Arc<Channel<i32>>, items: std::ops::Range<i32>) -> thread::JoinHandle<()> {
        let ch = Arc::clone(ch);
        thread::spawn(move || {
            for i in items {
                ch.send(i).unwrap();
            }
            ch.close();
        })
    }

    #[test]
    fn test_fan_out_processes_every_item() {
        let ctx = ctx();
        let input = Arc::new(ctx.channel(8));
        let producer = feed(&input, 0..500);

        let fan = fan_out(&ctx, Arc::clone(&input), 4, 8, |x: i32| x * 2).unwrap();
        assert_eq!(fan.width(), 4);
        let mut got: Vec<i32> = fan.output().iter().collect();
        got.sort_unstable();
        producer.join().unwrap();

        assert_eq!(got, (0..500).map(|x| x * 2).collect::<Vec<_>>());
        assert_eq!(fan.join().unwrap(), 500);
    }

    #[test]
    fn test_fan_out_survives_worker_panic() {
        let ctx = ctx();
        let input = Arc::new(ctx.channel(4));
        let fan = fan_out(&ctx, Arc::clone(&input), 2, 4, |x: i32| {
            if x == 3 {
                panic!("bad item");
            }
            x
        })
        .unwrap();
        for i in 0..10 {
            if input.send(i).is_err() {
                break;
            }
        }
        input.close();
        // 输出最终会关闭，不会永远阻塞
        let _drained: Vec<i32> = fan.output().iter().collect();
        assert!(matches!(fan.join(), Err(RuntimeError::TaskPanicked(_))));
    }

    #[test]
    fn test_fan_in_merges_and_closes() {
        let ctx = ctx();
        let a = Arc::new(ctx.channel(2));
        let b = Arc::new(ctx.channel(2));
        let pa = feed(&a, 0..50);
        let pb = feed(&b, 100..150);

        let merged = fan_in(&ctx, vec![Arc::clone(&a), Arc::clone(&b)], 4).unwrap();
        let got: Vec<i32> = merged.output().iter().collect();
        pa.join().unwrap();
        pb.join().unwrap();

        assert_eq!(got.len(), 100);
        // 单个输入内部保持顺序
        let from_a: Vec<i32> = got.iter().copied().filter(|x| *x < 100).collect();
        assert_eq!(from_a, (0..50).collect::<Vec<_>>());
        assert_eq!(merged.join().unwrap(), 100);
    }

    #[test]
    fn test_pipeline_stages_in_order() {
        let ctx = ctx();
        let input = Arc::new(ctx.channel(4));
        let producer = feed(&input, 1..11);

        let out = Pipeline::new(&ctx, Arc::clone(&input))
            .stage(4, |x: i32| x * 10)
            .unwrap()
            .filter_stage(4, |x: i32| (x % 20 == 0).then(|| x.to_string()))
            .unwrap()
            .output();
        let got: Vec<String> = out.output().iter().collect();
        producer.join().unwrap();

        assert_eq!(got, vec!["20", "40", "60", "80", "100"]);
        // 两个阶段各处理了 10 个和 10 个元素
        assert_eq!(out.join().unwrap(), 20);
    }

    #[test]
    fn test_multiplexer_until_all_closed() {
        let ctx = ctx();
        let a = Arc::new(ctx.channel(4));
        let b = Arc::new(ctx.channel(4));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mux = Multiplexer::start(&ctx, vec![Arc::clone(&a), Arc::clone(&b)], move |i, v: i32| {
            sink.lock().push((i, v));
        })
        .unwrap();

        a.send(1).unwrap();
        b.send(2).unwrap();
        a.close();
        b.close();

        assert_eq!(mux.join().unwrap(), 2);
        let mut seen = seen.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn test_multiplexer_stop() {
        let ctx = ctx();
        let a: Arc<Channel<i32>> = Arc::new(ctx.channel(1));
        let mux = Multiplexer::start(&ctx, vec![a], |_, _| {}).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(!mux.is_finished());
        mux.stop();
        assert_eq!(mux.join().unwrap(), 0);
    }
}
