//! Scheduler policies that drive a built [`cler_graph::FlowGraph`]:
//! thread-per-block, a fixed worker pool, the same pool with periodic
//! load-based migration, and a cooperative single-threaded loop. The
//! policy is chosen at runtime via [`FlowGraphConfig`] rather than baked
//! into a graph's type.

mod config;
mod policies;

pub use config::{FlowGraphConfig, SchedulerKind};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cler_block::BlockStats;
use cler_graph::FlowGraph;

/// A flow graph that has been handed to a scheduler. Not restartable:
/// once `stop()` has run to completion there is no way to resume it.
pub struct RunningFlowGraph {
    stop_flag: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    stats: Vec<Arc<Mutex<BlockStats>>>,
}

impl RunningFlowGraph {
    /// Requests graceful shutdown and joins every worker. Idempotent:
    /// calling it again after workers have already joined is a no-op.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }

    /// True once every worker has exited, whether because `stop()` was
    /// called or every block terminated on its own.
    pub fn is_stopped(&self) -> bool {
        self.workers.is_empty() || self.workers.iter().all(|h| h.is_finished())
    }

    fn all_blocks_terminated(&self) -> bool {
        self.stats.iter().all(|s| s.lock().unwrap().terminated)
    }

    /// A snapshot of every block's statistics, in build order.
    pub fn stats(&self) -> Vec<BlockStats> {
        self.stats.iter().map(|s| s.lock().unwrap().clone()).collect()
    }
}

impl Drop for RunningFlowGraph {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.stop();
        }
    }
}

/// Starts a flow graph under the given configuration. Returns
/// immediately; the blocks run on background threads until `stop()` is
/// called, a block returns `TermFlowgraph`, or every block terminates.
pub fn run(graph: FlowGraph, config: FlowGraphConfig) -> RunningFlowGraph {
    let entries = graph.into_entries();
    let stats = entries.iter().map(|e| e.stats.clone()).collect();
    let stop_flag = Arc::new(AtomicBool::new(false));

    let workers = match config.scheduler {
        SchedulerKind::ThreadPerBlock => policies::spawn_thread_per_block(entries, config, stop_flag.clone()),
        SchedulerKind::FixedThreadPool => policies::spawn_fixed_pool(entries, config, stop_flag.clone()),
        SchedulerKind::AdaptiveLoadBalancing => policies::spawn_adaptive(entries, config, stop_flag.clone()),
        SchedulerKind::SingleThreaded => policies::spawn_single_threaded(entries, config, stop_flag.clone()),
    };

    RunningFlowGraph { stop_flag, workers, stats }
}

/// Starts a flow graph and blocks until `duration` elapses or every
/// block terminates on its own, whichever is first, then stops and
/// returns final statistics.
pub fn run_for(graph: FlowGraph, config: FlowGraphConfig, duration: Duration) -> Vec<BlockStats> {
    let mut running = run(graph, config);
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if running.is_stopped() || running.all_blocks_terminated() {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    running.stop();
    running.stats()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cler_block::{Block, Empty, Error};
    use cler_graph::runner;
    use std::sync::atomic::AtomicUsize;

    struct CountingSource {
        name: String,
        produced: Arc<AtomicUsize>,
        limit: usize,
    }

    impl Block for CountingSource {
        type Outputs = ();

        fn name(&self) -> &str {
            &self.name
        }

        fn procedure(&mut self, _outputs: &()) -> cler_block::Result<Empty> {
            let n = self.produced.fetch_add(1, Ordering::Relaxed);
            if n >= self.limit {
                return Err(Error::TermEofReached);
            }
            Ok(Empty)
        }
    }

    #[test]
    fn thread_per_block_runs_to_completion() {
        let produced = Arc::new(AtomicUsize::new(0));
        let block = CountingSource { name: "source".into(), produced: produced.clone(), limit: 50 };
        let graph = FlowGraph::new(vec![runner(block, ())]);
        let stats = run_for(graph, FlowGraphConfig::desktop_performance(), Duration::from_secs(2));
        assert_eq!(stats.len(), 1);
        assert!(stats[0].terminated);
        assert!(produced.load(Ordering::Relaxed) >= 50);
    }

    #[test]
    fn fixed_pool_runs_multiple_blocks() {
        let produced_a = Arc::new(AtomicUsize::new(0));
        let produced_b = Arc::new(AtomicUsize::new(0));
        let a = CountingSource { name: "a".into(), produced: produced_a.clone(), limit: 20 };
        let b = CountingSource { name: "b".into(), produced: produced_b.clone(), limit: 20 };
        let graph = FlowGraph::new(vec![runner(a, ()), runner(b, ())]);
        let mut cfg = FlowGraphConfig::embedded_optimized();
        cfg.num_workers = 1;
        let stats = run_for(graph, cfg, Duration::from_secs(2));
        assert_eq!(stats.len(), 2);
        assert!(stats.iter().all(|s| s.terminated));
    }

    #[test]
    fn stop_joins_all_workers() {
        struct Spinner {
            produced: Arc<AtomicUsize>,
        }
        impl Block for Spinner {
            type Outputs = ();
            fn name(&self) -> &str {
                "spinner"
            }
            fn procedure(&mut self, _outputs: &()) -> cler_block::Result<Empty> {
                self.produced.fetch_add(1, Ordering::Relaxed);
                Ok(Empty)
            }
        }
        let produced = Arc::new(AtomicUsize::new(0));
        let graph = FlowGraph::new(vec![runner(Spinner { produced: produced.clone() }, ())]);
        let mut running = run(graph, FlowGraphConfig::desktop_performance());
        std::thread::sleep(Duration::from_millis(20));
        running.stop();
        assert!(running.is_stopped());
        let after_stop = produced.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(produced.load(Ordering::Relaxed), after_stop);
    }

    #[test]
    fn single_threaded_runs_cooperatively() {
        let produced = Arc::new(AtomicUsize::new(0));
        let block = CountingSource { name: "solo".into(), produced: produced.clone(), limit: 10 };
        let graph = FlowGraph::new(vec![runner(block, ())]);
        let stats = run_for(graph, FlowGraphConfig::new(SchedulerKind::SingleThreaded), Duration::from_secs(2));
        assert!(stats[0].terminated);
    }
}
