//! Scheduler invariants exercised over varying block counts via
//! `proptest` rather than a single fixed topology: stopping is a hard
//! boundary, `run_for` respects its deadline, and per-block stats only
//! ever grow while running.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cler_block::{Block, Empty, Error};
use cler_graph::{runner, FlowGraph};
use cler_scheduler::{run, run_for, FlowGraphConfig};
use proptest::prelude::*;

struct BusyBlock {
    calls: Arc<AtomicUsize>,
}

impl Block for BusyBlock {
    type Outputs = ();

    fn name(&self) -> &str {
        "busy"
    }

    fn procedure(&mut self, _outputs: &()) -> cler_block::Result<Empty> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(Empty)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// After `stop()` returns, no further `procedure` call begins.
    #[test]
    fn p7_stop_is_a_hard_boundary(block_count in 1usize..5) {
        let counters: Vec<_> = (0..block_count).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let runners = counters
            .iter()
            .map(|c| runner(BusyBlock { calls: c.clone() }, ()))
            .collect();
        let graph = FlowGraph::new(runners);
        let mut running = run(graph, FlowGraphConfig::desktop_performance());
        std::thread::sleep(Duration::from_millis(10));
        running.stop();
        let after_stop: Vec<_> = counters.iter().map(|c| c.load(Ordering::Relaxed)).collect();
        std::thread::sleep(Duration::from_millis(20));
        let settled: Vec<_> = counters.iter().map(|c| c.load(Ordering::Relaxed)).collect();
        prop_assert_eq!(after_stop, settled);
    }

    /// `run_for(d)` returns within `d + ε`.
    #[test]
    fn p8_run_for_respects_its_deadline(block_count in 1usize..4, millis in 5u64..40) {
        let counters: Vec<_> = (0..block_count).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let runners = counters
            .iter()
            .map(|c| runner(BusyBlock { calls: c.clone() }, ()))
            .collect();
        let graph = FlowGraph::new(runners);
        let duration = Duration::from_millis(millis);
        let start = Instant::now();
        let _stats = run_for(graph, FlowGraphConfig::desktop_performance(), duration);
        let elapsed = start.elapsed();
        // generous epsilon: join overhead plus one scheduler tick, never
        // open-ended since every worker is a tight Ok-returning loop.
        prop_assert!(elapsed < duration + Duration::from_secs(2));
    }
}

/// `successful + failed` is monotonically non-decreasing while running.
#[test]
fn p9_stats_counts_grow_monotonically() {
    struct Flaky {
        calls: Arc<AtomicUsize>,
    }
    impl Block for Flaky {
        type Outputs = ();
        fn name(&self) -> &str {
            "flaky"
        }
        fn procedure(&mut self, _outputs: &()) -> cler_block::Result<Empty> {
            let n = self.calls.fetch_add(1, Ordering::Relaxed);
            if n % 3 == 0 {
                Err(Error::NotEnoughSamples)
            } else {
                Ok(Empty)
            }
        }
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let graph = FlowGraph::new(vec![runner(Flaky { calls: calls.clone() }, ())]);
    let mut running = run(graph, FlowGraphConfig::desktop_performance());

    let mut previous = 0u64;
    for _ in 0..5 {
        std::thread::sleep(Duration::from_millis(5));
        let stats = running.stats();
        let total = stats[0].successful_procedures + stats[0].failed_procedures;
        assert!(total >= previous);
        previous = total;
    }
    running.stop();
}
