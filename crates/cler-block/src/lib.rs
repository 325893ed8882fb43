//! The block execution contract: the `Block` trait every dataflow node
//! implements, the recoverable/terminal error taxonomy `procedure()`
//! reports through, and the per-block runtime statistics the scheduler
//! accumulates.

use std::time::Duration;

/// The success value returned by `procedure()`. Carries no data; it only
/// exists so `Result<Empty, Error>` reads the same way at every call site,
/// mirroring the original's `cler::Empty`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Empty;

/// The closed error taxonomy a block's `procedure()` can report.
/// `is_terminal()` distinguishes the three kinds that should stop the
/// flow graph from the five that the scheduler treats as transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("not enough samples available on an input channel")]
    NotEnoughSamples,
    #[error("not enough space available on an output channel")]
    NotEnoughSpace,
    #[error("not enough space or samples to make progress")]
    NotEnoughSpaceOrSamples,
    #[error("procedure reported a recoverable error")]
    ProcedureError,
    #[error("bad data encountered")]
    BadData,
    #[error("end of stream reached")]
    TermEofReached,
    #[error("unrecoverable procedure error")]
    TermProcedureError,
    #[error("flow graph termination requested")]
    TermFlowgraph,
}

impl Error {
    /// True for the three `Term*` variants that should stop the flow
    /// graph rather than be retried by the scheduler.
    pub fn is_terminal(self) -> bool {
        matches!(self, Error::TermEofReached | Error::TermProcedureError | Error::TermFlowgraph)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A dataflow node. Implementors own their input channels as state but
/// never their outputs: the graph binds each runner to a fixed tuple of
/// output-channel handles (`Outputs`, e.g. `(Arc<Channel<f32>>,)`) and
/// passes a reference to that same tuple into every `procedure` call, so
/// a block can never reach an output channel outside the ones the graph
/// wired up for it. `Outputs` is `()` for sink blocks with no downstream.
pub trait Block {
    type Outputs;

    /// Human-readable name used in logging and `BlockStats`.
    fn name(&self) -> &str;

    /// Advances the block by one scheduling quantum against the given
    /// output channels. Implementations should do a bounded amount of
    /// work per call (the original caps this at small fixed chunks) so
    /// the scheduler can interleave work across blocks fairly.
    fn procedure(&mut self, outputs: &Self::Outputs) -> Result<Empty>;
}

/// Adapts a bare `FnMut(&O) -> Result<Empty>` closure into a [`Block`],
/// for blocks simple enough not to need a named struct.
pub struct ClosureBlock<O, F> {
    name: String,
    f: F,
    _outputs: std::marker::PhantomData<fn(&O)>,
}

impl<O, F: FnMut(&O) -> Result<Empty>> ClosureBlock<O, F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f, _outputs: std::marker::PhantomData }
    }
}

impl<O, F: FnMut(&O) -> Result<Empty>> Block for ClosureBlock<O, F> {
    type Outputs = O;

    fn name(&self) -> &str {
        &self.name
    }

    fn procedure(&mut self, outputs: &O) -> Result<Empty> {
        (self.f)(outputs)
    }
}

/// Per-block runtime counters, accumulated by whichever scheduler policy
/// is driving this block's `procedure()` calls.
#[derive(Debug, Clone)]
pub struct BlockStats {
    pub name: String,
    pub successful_procedures: u64,
    pub failed_procedures: u64,
    pub total_runtime: Duration,
    pub dead_time: Duration,
    pub terminated: bool,
}

impl BlockStats {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            successful_procedures: 0,
            failed_procedures: 0,
            total_runtime: Duration::ZERO,
            dead_time: Duration::ZERO,
            terminated: false,
        }
    }

    /// Fraction of wall-clock time this block spent actually running
    /// `procedure()`, in `[0.0, 1.0]`. `0.0` if the block hasn't run long
    /// enough to measure.
    pub fn cpu_utilization(&self) -> f64 {
        let total = (self.total_runtime + self.dead_time).as_secs_f64();
        if total <= 0.0 {
            0.0
        } else {
            self.total_runtime.as_secs_f64() / total
        }
    }

    pub fn record_procedure(&mut self, elapsed: Duration, result: &Result<Empty>) {
        self.total_runtime += elapsed;
        match result {
            Ok(_) => self.successful_procedures += 1,
            Err(e) if e.is_terminal() => {
                self.failed_procedures += 1;
                self.terminated = true;
            }
            Err(_) => self.failed_procedures += 1,
        }
    }

    pub fn record_dead_time(&mut self, elapsed: Duration) {
        self.dead_time += elapsed;
    }
}
