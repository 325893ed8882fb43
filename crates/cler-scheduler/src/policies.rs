//! Worker loops for the four scheduler policies. Each policy spawns
//! plain `std::thread`s and drives its assigned `GraphEntry`s until the
//! shared stop flag is observed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_utils::CachePadded;

use cler_block::Error;
use cler_graph::GraphEntry;

use crate::config::FlowGraphConfig;

fn sleep_or_yield(config: &FlowGraphConfig, consecutive_failures: u32) {
    if config.adaptive_sleep && consecutive_failures >= config.adaptive_sleep_fail_threshold {
        let escalations = (consecutive_failures - config.adaptive_sleep_fail_threshold) as i32;
        let micros = config.base_sleep().as_micros() as f64 * config.adaptive_sleep_multiplier.powi(escalations);
        let capped = micros.min(config.adaptive_sleep_max.as_micros() as f64).max(0.0);
        thread::sleep(std::time::Duration::from_micros(capped as u64));
    } else {
        thread::yield_now();
    }
}

/// Steps one entry, recording timing into its stats and returning
/// whether this entry just requested a full flow-graph shutdown.
fn step_entry(entry: &mut GraphEntry, config: &FlowGraphConfig, consecutive_failures: &mut u32) -> bool {
    let start = Instant::now();
    let result = entry.runner.step();
    let elapsed = start.elapsed();
    entry.stats.lock().unwrap().record_procedure(elapsed, &result);
    match &result {
        Ok(_) => {
            *consecutive_failures = 0;
            false
        }
        Err(e) if e.is_terminal() => matches!(e, Error::TermFlowgraph),
        Err(_) => {
            *consecutive_failures += 1;
            let dead_start = Instant::now();
            sleep_or_yield(config, *consecutive_failures);
            entry.stats.lock().unwrap().record_dead_time(dead_start.elapsed());
            false
        }
    }
}

/// One worker thread bound to exactly one block (`ThreadPerBlock`).
pub(crate) fn spawn_thread_per_block(
    entries: Vec<GraphEntry>,
    config: FlowGraphConfig,
    stop_flag: Arc<AtomicBool>,
) -> Vec<JoinHandle<()>> {
    entries
        .into_iter()
        .map(|mut entry| {
            let config = config.clone();
            let stop_flag = stop_flag.clone();
            thread::spawn(move || {
                let mut consecutive_failures = 0u32;
                loop {
                    if stop_flag.load(Ordering::Acquire) {
                        break;
                    }
                    if entry.stats.lock().unwrap().terminated {
                        break;
                    }
                    if step_entry(&mut entry, &config, &mut consecutive_failures) {
                        stop_flag.store(true, Ordering::Release);
                        break;
                    }
                }
            })
        })
        .collect()
}

fn round_robin_buckets(entries: Vec<GraphEntry>, num_workers: usize) -> Vec<Vec<GraphEntry>> {
    let mut buckets: Vec<Vec<GraphEntry>> = (0..num_workers).map(|_| Vec::new()).collect();
    for (i, entry) in entries.into_iter().enumerate() {
        buckets[i % num_workers].push(entry);
    }
    buckets
}

/// A fixed set of workers sharing all blocks, assigned round-robin at
/// start (`FixedThreadPool`).
pub(crate) fn spawn_fixed_pool(
    entries: Vec<GraphEntry>,
    config: FlowGraphConfig,
    stop_flag: Arc<AtomicBool>,
) -> Vec<JoinHandle<()>> {
    let num_workers = config.resolved_workers().max(1);
    round_robin_buckets(entries, num_workers)
        .into_iter()
        .map(|bucket| {
            let config = config.clone();
            let stop_flag = stop_flag.clone();
            thread::spawn(move || worker_pool_loop(bucket, config, stop_flag))
        })
        .collect()
}

fn worker_pool_loop(mut assigned: Vec<GraphEntry>, config: FlowGraphConfig, stop_flag: Arc<AtomicBool>) {
    let mut consecutive_failures = 0u32;
    let mut successes_this_budget = 0u32;
    while !stop_flag.load(Ordering::Acquire) {
        if assigned.iter().all(|e| e.stats.lock().unwrap().terminated) {
            break;
        }
        for entry in assigned.iter_mut() {
            if stop_flag.load(Ordering::Acquire) {
                return;
            }
            if entry.stats.lock().unwrap().terminated {
                continue;
            }
            if step_entry(entry, &config, &mut consecutive_failures) {
                stop_flag.store(true, Ordering::Release);
                return;
            }
            if consecutive_failures == 0 {
                successes_this_budget += 1;
            }
            if successes_this_budget >= config.min_work_threshold {
                successes_this_budget = 0;
                thread::yield_now();
            }
        }
    }
}

struct MigrationOrder {
    from: usize,
    to: usize,
}

fn worker_utilization(assigned: &[GraphEntry]) -> f64 {
    let mut runtime = 0.0;
    let mut dead = 0.0;
    for entry in assigned {
        let stats = entry.stats.lock().unwrap();
        runtime += stats.total_runtime.as_secs_f64();
        dead += stats.dead_time.as_secs_f64();
    }
    let total = runtime + dead;
    if total <= 0.0 {
        0.0
    } else {
        runtime / total
    }
}

fn rebalance(loads: &[CachePadded<Mutex<f64>>], orders: &Mutex<Vec<MigrationOrder>>, threshold: f64) {
    let snapshot: Vec<f64> = loads.iter().map(|l| *l.lock().unwrap()).collect();
    let max = snapshot.iter().cloned().fold(f64::MIN, f64::max);
    let min = snapshot.iter().cloned().fold(f64::MAX, f64::min);
    if max <= 0.0 || !max.is_finite() {
        return;
    }
    if (max - min) / max > threshold {
        let from = snapshot.iter().position(|&v| v == max).unwrap();
        let to = snapshot.iter().position(|&v| v == min).unwrap();
        if from != to {
            tracing::debug!(from, to, max, min, "requesting block migration");
            orders.lock().unwrap().push(MigrationOrder { from, to });
        }
    }
}

/// `FixedThreadPool` plus periodic reassignment (`AdaptiveLoadBalancing`).
/// Worker 0 additionally acts as the rebalancing coordinator: every
/// `load_balancing_interval` passes it reads every worker's published
/// utilization and, if imbalanced, posts a migration order. Orders are
/// consumed by the losing worker at its next pass boundary (never
/// mid-`procedure`), matching the "migrate only at a procedure
/// boundary" invariant.
pub(crate) fn spawn_adaptive(
    entries: Vec<GraphEntry>,
    config: FlowGraphConfig,
    stop_flag: Arc<AtomicBool>,
) -> Vec<JoinHandle<()>> {
    let num_workers = config.resolved_workers().max(1);
    let buckets = round_robin_buckets(entries, num_workers);

    let worker_loads: Arc<Vec<CachePadded<Mutex<f64>>>> =
        Arc::new((0..num_workers).map(|_| CachePadded::new(Mutex::new(0.0))).collect());
    let migration_orders: Arc<Mutex<Vec<MigrationOrder>>> = Arc::new(Mutex::new(Vec::new()));
    let (senders, receivers): (Vec<Sender<GraphEntry>>, Vec<Receiver<GraphEntry>>) =
        (0..num_workers).map(|_| mpsc::channel()).unzip();
    let senders = Arc::new(senders);

    buckets
        .into_iter()
        .zip(receivers)
        .enumerate()
        .map(|(id, (bucket, inbox))| {
            let config = config.clone();
            let stop_flag = stop_flag.clone();
            let worker_loads = worker_loads.clone();
            let migration_orders = migration_orders.clone();
            let senders = senders.clone();
            thread::spawn(move || {
                worker_adaptive_loop(id, bucket, inbox, senders, worker_loads, migration_orders, config, stop_flag)
            })
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn worker_adaptive_loop(
    id: usize,
    mut assigned: Vec<GraphEntry>,
    inbox: Receiver<GraphEntry>,
    senders: Arc<Vec<Sender<GraphEntry>>>,
    worker_loads: Arc<Vec<CachePadded<Mutex<f64>>>>,
    migration_orders: Arc<Mutex<Vec<MigrationOrder>>>,
    config: FlowGraphConfig,
    stop_flag: Arc<AtomicBool>,
) {
    let mut consecutive_failures = 0u32;
    let mut successes_this_budget = 0u32;
    let mut passes = 0u32;

    while !stop_flag.load(Ordering::Acquire) {
        while let Ok(migrated) = inbox.try_recv() {
            assigned.push(migrated);
        }

        {
            let mut orders = migration_orders.lock().unwrap();
            if let Some(pos) = orders.iter().position(|o| o.from == id) {
                let order = orders.remove(pos);
                drop(orders);
                if let Some(entry) = assigned.pop() {
                    let _ = senders[order.to].send(entry);
                }
            }
        }

        if assigned.is_empty() {
            thread::yield_now();
            continue;
        }
        if assigned.iter().all(|e| e.stats.lock().unwrap().terminated) {
            break;
        }

        for entry in assigned.iter_mut() {
            if stop_flag.load(Ordering::Acquire) {
                return;
            }
            if entry.stats.lock().unwrap().terminated {
                continue;
            }
            if step_entry(entry, &config, &mut consecutive_failures) {
                stop_flag.store(true, Ordering::Release);
                return;
            }
            if consecutive_failures == 0 {
                successes_this_budget += 1;
            }
            if successes_this_budget >= config.min_work_threshold {
                successes_this_budget = 0;
                thread::yield_now();
            }
        }

        passes += 1;
        if passes % config.load_balancing_interval.max(1) == 0 {
            *worker_loads[id].lock().unwrap() = worker_utilization(&assigned);
            if id == 0 {
                rebalance(&worker_loads, &migration_orders, config.load_balancing_threshold);
            }
        }
    }
}

/// All blocks stepped cooperatively on one worker thread, in build
/// order (`SingleThreaded`).
pub(crate) fn spawn_single_threaded(
    entries: Vec<GraphEntry>,
    config: FlowGraphConfig,
    stop_flag: Arc<AtomicBool>,
) -> Vec<JoinHandle<()>> {
    vec![thread::spawn(move || worker_pool_loop(entries, config, stop_flag))]
}
