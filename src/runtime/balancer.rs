//! 负载均衡器
//!
//! 按策略把任务分派到多个工作池

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use super::pool::WorkerPool;
use super::task::{TaskContext, TaskHandle};
use crate::error::{Result, RuntimeError};

/// 分派策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// 按提交顺序轮流
    RoundRobin,
    /// 当前负载（排队 + 执行中）最小的池，相同时取下标最小的
    LeastLoaded,
    /// 均匀随机
    Random,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Strategy::RoundRobin => "round-robin",
            Strategy::LeastLoaded => "least-loaded",
            Strategy::Random => "random",
        };
        f.write_str(s)
    }
}

/// 负载均衡器
pub struct LoadBalancer {
    pools: Vec<Arc<WorkerPool>>,
    strategy: Strategy,
    /// 轮询游标
    cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(pools: Vec<Arc<WorkerPool>>, strategy: Strategy) -> Result<Self> {
        if pools.is_empty() {
            return Err(RuntimeError::invalid("load balancer needs at least one pool"));
        }
        tracing::debug!(pools = pools.len(), %strategy, "load balancer created");
        Ok(Self {
            pools,
            strategy,
            cursor: AtomicUsize::new(0),
        })
    }

    /// 按策略选出下一个池的下标
    pub fn select_index(&self) -> usize {
        let n = self.pools.len();
        match self.strategy {
            Strategy::RoundRobin => self.cursor.fetch_add(1, Ordering::Relaxed) % n,
            Strategy::LeastLoaded => self
                .pools
                .iter()
                .enumerate()
                .min_by_key(|(i, pool)| (pool.load(), *i))
                .map_or(0, |(i, _)| i),
            Strategy::Random => rand::thread_rng().gen_range(0..n),
        }
    }

    /// 按策略选出下一个池
    pub fn select_pool(&self) -> &Arc<WorkerPool> {
        &self.pools[self.select_index()]
    }

    /// 提交到选中的池
    pub fn submit<T, F>(&self, f: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&TaskContext) -> Result<T> + Send + 'static,
    {
        let index = self.select_index();
        let pool = &self.pools[index];
        tracing::trace!(pool = pool.name(), index, strategy = %self.strategy, "dispatching job");
        pool.submit(f)
    }

    pub fn pools(&self) -> &[Arc<WorkerPool>] {
        &self.pools
    }

    #[inline]
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// 关闭所有池
    pub fn shutdown(&self, wait: bool) {
        for pool in &self.pools {
            pool.shutdown(wait);
        }
    }
}

impl fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("pools", &self.pools.len())
            .field("strategy", &self.strategy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::context::{RuntimeConfig, RuntimeContext};
    use std::thread;

    fn pools(ctx: &Arc<RuntimeContext>, n: usize) -> Vec<Arc<WorkerPool>> {
        (0..n)
            .map(|i| Arc::new(WorkerPool::new(ctx, format!("p{}", i), 1, 8).unwrap()))
            .collect()
    }

    #[test]
    fn test_empty_rejected() {
        assert!(LoadBalancer::new(Vec::new(), Strategy::Random).is_err());
    }

    #[test]
    fn test_round_robin_order() {
        let ctx = RuntimeContext::new(RuntimeConfig::default()).unwrap();
        let lb = LoadBalancer::new(pools(&ctx, 3), Strategy::RoundRobin).unwrap();
        let picks: Vec<usize> = (0..6).map(|_| lb.select_index()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_least_loaded_prefers_idle_pool() {
        let ctx = RuntimeContext::new(RuntimeConfig::default()).unwrap();
        let lb = LoadBalancer::new(pools(&ctx, 2), Strategy::LeastLoaded).unwrap();
        assert_eq!(lb.select_index(), 0);

        let gate = Arc::new(std::sync::Barrier::new(2));
        let g = Arc::clone(&gate);
        let busy = lb.pools()[0]
            .submit(move |_| {
                g.wait();
                Ok(())
            })
            .unwrap();
        while lb.pools()[0].load() == 0 {
            thread::yield_now();
        }
        assert_eq!(lb.select_index(), 1);
        gate.wait();
        busy.await_result().unwrap();
    }

    #[test]
    fn test_random_in_range() {
        let ctx = RuntimeContext::new(RuntimeConfig::default()).unwrap();
        let lb = LoadBalancer::new(pools(&ctx, 3), Strategy::Random).unwrap();
        for _ in 0..100 {
            assert!(lb.select_index() < 3);
        }
        let h = lb.submit(|_| Ok("done")).unwrap();
        assert_eq!(h.await_result().unwrap(), "done");
    }
}
