//! The flow graph: binds each block to the fixed tuple of output
//! channels its `procedure` writes to, and owns the per-block
//! statistics array. Scheduling policy lives one layer up (`cler-
//! scheduler`); this crate only knows how to step a block and report
//! on it, not how to pace or parallelize those steps.

use std::sync::{Arc, Mutex};

use cler_block::{Block, BlockStats, Empty};

/// Object-safe handle to a bound block, erasing its concrete `Block`
/// type and `Outputs` tuple so a `FlowGraph` can hold a heterogeneous
/// collection of runners. Analogous to the original's `BlockRunner`,
/// reshaped from a variadic-template binding into a boxed trait object
/// per the fixed-arity-via-associated-type redesign.
pub trait BlockRunner: Send {
    /// The block's stable name, as passed at construction.
    fn name(&self) -> &str;

    /// Calls the bound block's `procedure` against its bound outputs.
    fn step(&mut self) -> cler_block::Result<Empty>;
}

/// Binds a concrete `Block` to its output tuple. This is the thing a
/// `Box<dyn BlockRunner>` actually stores; users construct it via
/// [`runner`] rather than naming the type.
struct BoundRunner<B: Block> {
    block: B,
    outputs: B::Outputs,
}

impl<B> BlockRunner for BoundRunner<B>
where
    B: Block + Send,
    B::Outputs: Send,
{
    fn name(&self) -> &str {
        self.block.name()
    }

    fn step(&mut self) -> cler_block::Result<Empty> {
        self.block.procedure(&self.outputs)
    }
}

/// Builds a [`BlockRunner`] from a block and the output-channel tuple
/// the scheduler should pass to its `procedure` each call. For a sink
/// block with no outputs, pass `()`.
///
/// ```ignore
/// let r = cler_graph::runner(adder_block, (gain_in_channel,));
/// ```
pub fn runner<B>(block: B, outputs: B::Outputs) -> Box<dyn BlockRunner>
where
    B: Block + Send + 'static,
    B::Outputs: Send + 'static,
{
    Box::new(BoundRunner { block, outputs })
}

/// One entry in a built flow graph: a runner and the statistics record
/// the scheduler keeps for it. The stats handle is shared so callers
/// can read `FlowGraph::stats()` while the graph is running.
pub struct GraphEntry {
    pub runner: Box<dyn BlockRunner>,
    pub stats: Arc<Mutex<BlockStats>>,
}

/// An ordered collection of bound blocks plus their statistics. Built
/// once; the scheduler (a separate crate) consumes `entries()` to drive
/// execution and `stats()` to report on it. Not resizable, rewireable,
/// or restartable once handed to a scheduler — matching the original's
/// "not restartable after a hard stop" lifecycle.
pub struct FlowGraph {
    entries: Vec<GraphEntry>,
}

impl FlowGraph {
    /// Builds a flow graph from an ordered list of runners, in the
    /// order blocks should be considered for thread/worker assignment.
    pub fn new(runners: Vec<Box<dyn BlockRunner>>) -> Self {
        let entries = runners
            .into_iter()
            .map(|runner| {
                let stats = Arc::new(Mutex::new(BlockStats::new(runner.name())));
                GraphEntry { runner, stats }
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consumes the graph, handing its entries to a scheduler. Once
    /// called there is no way to get the runners back through
    /// `FlowGraph` itself; the scheduler owns their lifetime from here.
    pub fn into_entries(self) -> Vec<GraphEntry> {
        self.entries
    }

    /// A snapshot of every block's statistics, in build order.
    pub fn stats(&self) -> Vec<BlockStats> {
        self.entries.iter().map(|e| e.stats.lock().unwrap().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cler_block::Error;

    struct Source {
        name: String,
        remaining: u32,
    }

    impl Block for Source {
        type Outputs = ();

        fn name(&self) -> &str {
            &self.name
        }

        fn procedure(&mut self, _outputs: &()) -> cler_block::Result<Empty> {
            if self.remaining == 0 {
                return Err(Error::TermEofReached);
            }
            self.remaining -= 1;
            Ok(Empty)
        }
    }

    #[test]
    fn graph_reports_entries_in_build_order() {
        let a = runner(Source { name: "a".into(), remaining: 3 }, ());
        let b = runner(Source { name: "b".into(), remaining: 5 }, ());
        let graph = FlowGraph::new(vec![a, b]);
        assert_eq!(graph.len(), 2);
        let stats = graph.stats();
        assert_eq!(stats[0].name, "a");
        assert_eq!(stats[1].name, "b");
    }

    #[test]
    fn stepping_a_runner_updates_its_own_block() {
        let r = runner(Source { name: "only".into(), remaining: 1 }, ());
        let mut entries = FlowGraph::new(vec![r]).into_entries();
        assert!(entries[0].runner.step().is_ok());
        assert!(entries[0].runner.step().is_err());
    }

    #[test]
    fn empty_graph_has_no_entries() {
        let graph = FlowGraph::new(vec![]);
        assert!(graph.is_empty());
        assert!(graph.stats().is_empty());
    }
}
