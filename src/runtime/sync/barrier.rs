//! 可重用屏障
//!
//! 按代（generation）计数：第 N 个到达者推进代数并唤醒本代所有等待者。
//! 等待者只看自己那一代的代数是否已推进，所以紧接着再次调用 `wait`
//! 的线程进入的是新一代，不会错过唤醒

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, RuntimeError};
use crate::runtime::stats::RuntimeStats;

#[derive(Debug)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    broken: bool,
}

/// `wait` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierWaitResult {
    /// 每一代恰好一个领导者（最后到达者）
    pub is_leader: bool,
    /// 本次等待所属的代
    pub generation: u64,
}

/// 可重用屏障
pub struct Barrier {
    parties: usize,
    state: Mutex<BarrierState>,
    cond: Condvar,
    stats: Arc<RuntimeStats>,
}

impl Barrier {
    pub fn new(parties: usize) -> Result<Self> {
        if parties == 0 {
            return Err(RuntimeError::invalid("barrier needs at least one party"));
        }
        Ok(Self {
            parties,
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
                broken: false,
            }),
            cond: Condvar::new(),
            stats: Arc::new(RuntimeStats::new()),
        })
    }

    pub fn with_stats(mut self, stats: Arc<RuntimeStats>) -> Self {
        self.stats = stats;
        self
    }

    /// 等待本代所有参与者到达
    pub fn wait(&self) -> Result<BarrierWaitResult> {
        self.stats.barrier_waits.increment();
        let mut state = self.state.lock();
        if state.broken {
            return Err(RuntimeError::Shutdown("barrier"));
        }

        let generation = state.generation;
        state.arrived += 1;

        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation = generation.wrapping_add(1);
            self.cond.notify_all();
            return Ok(BarrierWaitResult {
                is_leader: true,
                generation,
            });
        }

        while state.generation == generation && !state.broken {
            self.cond.wait(&mut state);
        }

        if state.generation == generation {
            // 屏障在本代完成前被销毁
            return Err(RuntimeError::Shutdown("barrier"));
        }

        Ok(BarrierWaitResult {
            is_leader: false,
            generation,
        })
    }

    #[inline]
    pub fn parties(&self) -> usize {
        self.parties
    }

    /// 本代已到达的数量
    pub fn waiting_count(&self) -> usize {
        self.state.lock().arrived
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn is_broken(&self) -> bool {
        self.state.lock().broken
    }

    /// 销毁屏障：当前等待者和之后的调用者都得到 `Shutdown`
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        state.broken = true;
        state.arrived = 0;
        self.cond.notify_all();
    }
}

impl std::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Barrier")
            .field("parties", &self.parties)
            .field("arrived", &state.arrived)
            .field("generation", &state.generation)
            .field("broken", &state.broken)
            .finish()
    }
}
