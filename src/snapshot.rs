//! Time-indexed memory allocation snapshots
//!
//! Every allocation lifecycle event produces a copy-on-write snapshot of the
//! whole allocation map, keyed by the monotonic `host_op_id` of the event.
//! Lookups answer "which allocation owned address A at time T" by reading
//! the newest snapshot at or before T.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{AnalyzerError, Result};

/// A device memory range, half-open: `start <= a < end`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    /// First address of the range
    pub start: u64,
    /// One past the last address of the range
    pub end: u64,
}

impl MemoryRange {
    /// Create a range from its bounds
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Whether `addr` falls inside the range
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }
}

/// A registered device allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Address range the allocation covers
    pub range: MemoryRange,
    /// Monotonic handle tying the allocation to its registration time
    pub memory_op_id: u64,
    /// Stable logical identifier, may repeat for recycled buffers
    pub memory_id: u64,
}

/// One immutable view of the allocation map, keyed by range start
pub type Snapshot = BTreeMap<u64, Allocation>;

/// Copy-on-write store of allocation snapshots keyed by `host_op_id`.
///
/// Writers mutate under a short exclusive section; readers pin an `Arc` to
/// the snapshot effective at their time of interest and then read without
/// any lock.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<BTreeMap<u64, Arc<Snapshot>>>,
}

/// Find the allocation owning `addr` inside one snapshot
pub fn lookup_allocation(snapshot: &Snapshot, addr: u64) -> Option<&Allocation> {
    let (_, allocation) = snapshot.range(..=addr).next_back()?;
    allocation.range.contains(addr).then_some(allocation)
}

impl MemorySnapshotStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an allocation at time `host_op_id`.
    ///
    /// The effective snapshot is copied, the new allocation inserted with
    /// `memory_op_id = host_op_id`, and the result published under
    /// `host_op_id`. A range starting at an already-registered start address
    /// is a duplicate.
    pub fn register(&self, range: MemoryRange, host_op_id: u64, memory_id: u64) -> Result<()> {
        tracing::debug!(
            start = range.start,
            end = range.end,
            host_op_id,
            memory_id,
            "registering memory"
        );

        let allocation = Allocation {
            range,
            memory_op_id: host_op_id,
            memory_id,
        };

        let mut snapshots = self.snapshots.write();
        let mut snapshot = if snapshots.is_empty() {
            Snapshot::new()
        } else {
            let (_, effective) = snapshots.range(..=host_op_id).next_back().ok_or_else(|| {
                AnalyzerError::NotExistEntry(format!("no snapshot at or before {}", host_op_id))
            })?;
            if effective.contains_key(&range.start) {
                return Err(AnalyzerError::DuplicateEntry(format!(
                    "range at {:#x}",
                    range.start
                )));
            }
            Snapshot::clone(effective)
        };
        snapshot.insert(range.start, allocation);
        snapshots.insert(host_op_id, Arc::new(snapshot));
        Ok(())
    }

    /// Remove an allocation at time `host_op_id`, publishing a new snapshot
    /// without it. The allocation is matched by its start address.
    pub fn unregister(&self, range: MemoryRange, host_op_id: u64) -> Result<()> {
        tracing::debug!(start = range.start, host_op_id, "unregistering memory");

        let mut snapshots = self.snapshots.write();
        let (_, effective) = snapshots.range(..=host_op_id).next_back().ok_or_else(|| {
            AnalyzerError::NotExistEntry(format!("no snapshot at or before {}", host_op_id))
        })?;
        if !effective.contains_key(&range.start) {
            return Err(AnalyzerError::NotExistEntry(format!(
                "range at {:#x}",
                range.start
            )));
        }
        let mut snapshot = Snapshot::clone(effective);
        snapshot.remove(&range.start);
        snapshots.insert(host_op_id, Arc::new(snapshot));
        Ok(())
    }

    /// Pin the snapshot effective at `host_op_id`
    pub fn pin(&self, host_op_id: u64) -> Option<Arc<Snapshot>> {
        let snapshots = self.snapshots.read();
        snapshots
            .range(..=host_op_id)
            .next_back()
            .map(|(_, snapshot)| Arc::clone(snapshot))
    }

    /// Find the allocation owning `addr` at time `host_op_id`
    pub fn lookup(&self, addr: u64, host_op_id: u64) -> Option<Allocation> {
        let snapshot = self.pin(host_op_id)?;
        lookup_allocation(&snapshot, addr).copied()
    }

    /// Drop snapshots older than `up_to`, keeping the newest of them so
    /// lookups at later times still resolve.
    pub fn garbage_collect(&self, up_to: u64) {
        let mut snapshots = self.snapshots.write();
        let stale: Vec<u64> = snapshots.range(..up_to).map(|(&id, _)| id).collect();
        let Some(&keep) = stale.last() else {
            return;
        };
        for id in stale {
            if id != keep {
                snapshots.remove(&id);
            }
        }
        tracing::debug!(up_to, keep, "collected memory snapshots");
    }

    #[cfg(test)]
    fn snapshot_count(&self) -> usize {
        self.snapshots.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains() {
        let range = MemoryRange::new(0x1000, 0x2000);
        assert!(range.contains(0x1000));
        assert!(range.contains(0x1fff));
        assert!(!range.contains(0x2000));
        assert!(!range.contains(0xfff));
    }

    #[test]
    fn test_register_and_lookup() {
        let store = MemorySnapshotStore::new();
        store
            .register(MemoryRange::new(0x10000, 0x20000), 100, 3)
            .unwrap();

        let allocation = store.lookup(0x10100, 100).unwrap();
        assert_eq!(allocation.memory_op_id, 100);
        assert_eq!(allocation.memory_id, 3);
        assert!(store.lookup(0x20000, 100).is_none());
        assert!(store.lookup(0x10100, 99).is_none());
    }

    // Scenario: R1 at 10, R2 at 20; T=15 sees only R1, T=25 both.
    #[test]
    fn test_snapshot_versioning() {
        let store = MemorySnapshotStore::new();
        store.register(MemoryRange::new(0x1000, 0x2000), 10, 1).unwrap();
        store.register(MemoryRange::new(0x8000, 0x9000), 20, 2).unwrap();

        assert!(store.lookup(0x1800, 15).is_some());
        assert!(store.lookup(0x8800, 15).is_none());
        assert!(store.lookup(0x1800, 25).is_some());
        assert!(store.lookup(0x8800, 25).is_some());
    }

    #[test]
    fn test_duplicate_range() {
        let store = MemorySnapshotStore::new();
        store.register(MemoryRange::new(0x1000, 0x2000), 10, 1).unwrap();
        assert!(matches!(
            store.register(MemoryRange::new(0x1000, 0x3000), 20, 2),
            Err(AnalyzerError::DuplicateEntry(_))
        ));
    }

    #[test]
    fn test_register_before_base_snapshot() {
        let store = MemorySnapshotStore::new();
        store.register(MemoryRange::new(0x1000, 0x2000), 10, 1).unwrap();
        // All existing snapshots are newer than the requested time
        assert!(matches!(
            store.register(MemoryRange::new(0x8000, 0x9000), 5, 2),
            Err(AnalyzerError::NotExistEntry(_))
        ));
    }

    #[test]
    fn test_unregister() {
        let store = MemorySnapshotStore::new();
        let range = MemoryRange::new(0x1000, 0x2000);
        store.register(range, 10, 1).unwrap();
        store.unregister(range, 20).unwrap();

        // The allocation is gone from 20 on but still visible at 15
        assert!(store.lookup(0x1800, 25).is_none());
        assert!(store.lookup(0x1800, 15).is_some());

        assert!(matches!(
            store.unregister(MemoryRange::new(0x7000, 0x8000), 30),
            Err(AnalyzerError::NotExistEntry(_))
        ));
    }

    #[test]
    fn test_garbage_collect_keeps_newest_stale() {
        let store = MemorySnapshotStore::new();
        store.register(MemoryRange::new(0x1000, 0x2000), 10, 1).unwrap();
        store.register(MemoryRange::new(0x3000, 0x4000), 20, 2).unwrap();
        store.register(MemoryRange::new(0x5000, 0x6000), 30, 3).unwrap();

        store.garbage_collect(30);
        assert_eq!(store.snapshot_count(), 2);

        // The snapshot at 20 survived as the newest stale one, so lookups
        // between 20 and 30 still resolve both early allocations.
        assert!(store.lookup(0x1800, 25).is_some());
        assert!(store.lookup(0x3800, 25).is_some());
        assert!(store.lookup(0x5800, 35).is_some());
    }

    #[test]
    fn test_garbage_collect_empty() {
        let store = MemorySnapshotStore::new();
        store.garbage_collect(100);
        assert_eq!(store.snapshot_count(), 0);
    }

    #[test]
    fn test_pinned_snapshot_survives_mutation() {
        let store = MemorySnapshotStore::new();
        store.register(MemoryRange::new(0x1000, 0x2000), 10, 1).unwrap();
        let pinned = store.pin(10).unwrap();

        store.unregister(MemoryRange::new(0x1000, 0x2000), 20).unwrap();
        assert!(lookup_allocation(&pinned, 0x1800).is_some());
    }
}
