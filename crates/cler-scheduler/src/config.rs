use std::time::Duration;

/// Which execution strategy drives a flow graph's blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    /// One worker thread per block.
    ThreadPerBlock,
    /// A fixed set of workers, blocks assigned round-robin at start.
    FixedThreadPool,
    /// `FixedThreadPool` plus periodic load-based block migration.
    AdaptiveLoadBalancing,
    /// One thread, blocks stepped cooperatively in build order.
    SingleThreaded,
}

/// Plain configuration data for running a flow graph. No config-file
/// format is read; values are set directly or via one of the preset
/// constructors below.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowGraphConfig {
    pub scheduler: SchedulerKind,
    /// Worker count for pool-based policies. `0` means "auto": use
    /// `std::thread::available_parallelism()`.
    pub num_workers: usize,
    pub adaptive_sleep: bool,
    pub adaptive_sleep_multiplier: f64,
    pub adaptive_sleep_fail_threshold: u32,
    pub adaptive_sleep_max: Duration,
    /// Minimum successful `procedure` calls a pool worker accumulates
    /// before it checks the stop flag and yields.
    pub min_work_threshold: u32,
    /// Iterations between load-rebalance decisions (`AdaptiveLoadBalancing` only).
    pub load_balancing_interval: u32,
    /// Worker load imbalance, in `[0, 1]`, that triggers a migration.
    pub load_balancing_threshold: f64,
    /// Elide defensive checks on the hot path when blocks are trusted.
    pub reduce_error_checks: bool,
}

/// Base sleep quantum before multiplier escalation kicks in. Not
/// spec-mandated as a named knob; chosen small enough that even the
/// first escalated sleep is well under a scheduling quantum.
const BASE_SLEEP: Duration = Duration::from_micros(1);

impl FlowGraphConfig {
    /// Every knob at its most conservative default: one thread per
    /// block, adaptive sleep off, no migration.
    pub fn new(scheduler: SchedulerKind) -> Self {
        Self {
            scheduler,
            num_workers: 0,
            adaptive_sleep: false,
            adaptive_sleep_multiplier: 1.5,
            adaptive_sleep_fail_threshold: 10,
            adaptive_sleep_max: Duration::from_millis(10),
            min_work_threshold: 16,
            load_balancing_interval: 256,
            load_balancing_threshold: 0.25,
            reduce_error_checks: false,
        }
    }

    pub(crate) fn base_sleep(&self) -> Duration {
        BASE_SLEEP
    }

    /// One thread per block, generous worker-count-independent
    /// defaults, adaptive sleep on. Matches the preset used throughout
    /// `desktop_examples/flowgraph.cpp`-style desktop pipelines.
    pub fn desktop_performance() -> Self {
        Self { adaptive_sleep: true, ..Self::new(SchedulerKind::ThreadPerBlock) }
    }

    /// A small fixed pool sized for memory-constrained targets, tight
    /// sleep bounds so a starved block doesn't hog a worker for long.
    pub fn embedded_optimized() -> Self {
        Self {
            num_workers: 2,
            adaptive_sleep: true,
            adaptive_sleep_max: Duration::from_micros(500),
            min_work_threshold: 4,
            reduce_error_checks: true,
            ..Self::new(SchedulerKind::FixedThreadPool)
        }
    }

    /// Thread-per-block with adaptive sleep, tuned for sparse streams
    /// (see S7: a slow source shouldn't burn a full core spinning).
    pub fn thread_per_block_adaptive() -> Self {
        Self {
            adaptive_sleep: true,
            adaptive_sleep_fail_threshold: 4,
            adaptive_sleep_max: Duration::from_millis(5),
            ..Self::new(SchedulerKind::ThreadPerBlock)
        }
    }

    /// Fixed pool with periodic rebalancing enabled.
    pub fn adaptive_load_balancing() -> Self {
        Self {
            adaptive_sleep: true,
            load_balancing_interval: 128,
            load_balancing_threshold: 0.2,
            ..Self::new(SchedulerKind::AdaptiveLoadBalancing)
        }
    }

    /// Resolves `num_workers == 0` ("auto") to the hardware's reported
    /// parallelism, falling back to `1` if that can't be determined.
    pub fn resolved_workers(&self) -> usize {
        if self.num_workers > 0 {
            self.num_workers
        } else {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        }
    }
}
