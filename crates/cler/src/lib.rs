//! `cler`: a streaming dataflow runtime for real-time signal processing.
//! A directed graph of blocks exchanges typed samples over lock-free
//! SPSC channels, driven by one of four pluggable scheduler policies.
//!
//! This crate is a thin facade over the workspace's component crates
//! (`cler-platform`, `cler-vmem`, `cler-channel`, `cler-block`,
//! `cler-graph`, `cler-scheduler`, `cler-utils`); it adds nothing of its
//! own beyond [`prelude`], the `use cler::prelude::*` surface most block
//! authors and scheduler drivers actually want.

pub use cler_block::{Block, BlockStats, ClosureBlock, Empty};
pub use cler_channel::{Channel, ChannelError, DbfSpan, DbfSpanMut};
pub use cler_graph::{runner, BlockRunner, FlowGraph};
pub use cler_platform::{page_size, spin_wait, supports_doubly_mapped_buffers, CACHE_LINE_SIZE};
pub use cler_scheduler::{run, run_for, FlowGraphConfig, RunningFlowGraph, SchedulerKind};
pub use cler_utils::{ceil_pow2, error_to_string, floor_pow2, is_power_of_two};
pub use cler_vmem::{DoublyMappedAllocation, VmemError};

/// Everything a block author or scheduler driver needs in scope.
///
/// ```
/// use cler::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        run, run_for, Block, BlockRunner, BlockStats, Channel, ChannelError, ClosureBlock, DbfSpan,
        DbfSpanMut, Empty, FlowGraph, FlowGraphConfig, RunningFlowGraph, SchedulerKind,
    };
    pub use cler_block::Error as BlockError;
    pub use cler_graph::runner;
}
