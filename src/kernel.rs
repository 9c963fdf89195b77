//! Per-kernel accumulation state
//!
//! Redundancy traces accumulate per `(cpu_thread, kernel_id)` shard. A shard
//! is only ever mutated by the CPU thread named in its key, so the inner
//! maps need no locking; creation and flushing go through the concurrent
//! outer map owned by the analyzer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::instruction::AccessKind;

/// Global thread coordinates of one GPU thread
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ThreadId {
    /// Flattened block index
    pub flat_block_id: u32,
    /// Flattened thread index within the grid
    pub flat_thread_id: u32,
}

/// Per-pc value histograms: `(memory_op_id, kind)` → pc → value → count
pub type SpatialTrace = BTreeMap<(u64, AccessKind), BTreeMap<u64, BTreeMap<u64, u64>>>;

/// Last access seen per thread and address: thread → address → (pc, value)
pub type TemporalTrace = BTreeMap<ThreadId, BTreeMap<u64, (u64, u64)>>;

/// Redundant access pairs: source pc → sink pc → (value, kind) → count
pub type PcPairs = BTreeMap<u64, BTreeMap<u64, BTreeMap<(u64, AccessKind), u64>>>;

/// Accumulated analysis state of one kernel invocation.
///
/// Owned exclusively by one CPU-thread shard; dropped when that thread
/// flushes.
#[derive(Debug, Default)]
pub struct KernelState {
    /// Kernel invocation identifier
    pub kernel_id: u64,
    /// Binary the kernel was launched from
    pub cubin_id: u32,
    /// Function index of the kernel entry, resolved from the first record
    pub function_index: u32,
    /// Runtime address of the kernel entry function
    pub function_addr: u64,

    /// Value histograms of loads
    pub read_spatial: SpatialTrace,
    /// Value histograms of stores
    pub write_spatial: SpatialTrace,

    /// Last access seen per thread and address, paired against by loads
    pub read_temporal: TemporalTrace,
    /// Pairs whose newer access is a load
    pub read_pairs: PcPairs,

    /// Last access seen per thread and address, paired against by stores
    pub write_temporal: TemporalTrace,
    /// Pairs whose newer access is a store
    pub write_pairs: PcPairs,
}

impl KernelState {
    /// Create state for one kernel invocation
    pub fn new(kernel_id: u64, cubin_id: u32) -> Self {
        Self {
            kernel_id,
            cubin_id,
            ..Default::default()
        }
    }

    /// Drop every temporal entry of `thread_id` from both access directions.
    /// Called on block exit: per-thread state is scoped to a block.
    pub fn clear_thread(&mut self, thread_id: &ThreadId) {
        self.read_temporal.remove(thread_id);
        self.write_temporal.remove(thread_id);
    }
}

/// Kernel states owned by one CPU thread, in kernel-id order
pub type ThreadKernels = BTreeMap<u64, KernelState>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_ordering() {
        let a = ThreadId { flat_block_id: 0, flat_thread_id: 5 };
        let b = ThreadId { flat_block_id: 1, flat_thread_id: 0 };
        let c = ThreadId { flat_block_id: 1, flat_thread_id: 3 };
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_clear_thread() {
        let mut state = KernelState::new(1, 2);
        let thread = ThreadId { flat_block_id: 0, flat_thread_id: 0 };
        state.read_temporal.entry(thread).or_default().insert(0x100, (0x10, 42));
        state.write_temporal.entry(thread).or_default().insert(0x100, (0x20, 42));

        state.clear_thread(&thread);
        assert!(state.read_temporal.is_empty());
        assert!(state.write_temporal.is_empty());
    }
}
