//! Redundancy detectors and reducers
//!
//! Spatial redundancy: one PC keeps producing or fetching the same value
//! across many addresses of one allocation. Temporal redundancy: one thread
//! re-accesses an address and sees the value it already saw there. The
//! observers feed per-kernel traces during analysis; the reducers collapse
//! them into top-K views at flush time.

use serde::{Deserialize, Serialize};

use crate::instruction::AccessKind;
use crate::kernel::{PcPairs, SpatialTrace, TemporalTrace, ThreadId};

/// Analysis families the analyzer can run
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum AnalysisKind {
    /// Same value at one PC across distinct addresses
    SpatialRedundancy,
    /// Same value re-accessed at one address by one thread
    TemporalRedundancy,
}

/// Whether a view aggregates loads or stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessType {
    /// Load side
    Read,
    /// Store side
    Write,
}

/// The earlier endpoint of a temporal pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePc {
    /// Function owning the earlier access
    pub function_index: u32,
    /// PC offset of the earlier access within that function
    pub pc_offset: u64,
}

/// One entry of a top-K redundancy view.
///
/// Reducers emit views whose `pc_offset` (and `source_pc.pc_offset`) hold
/// raw runtime PCs; the flush path rewrites them into
/// `(function_index, pc_offset)` form via the binary's symbol table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordView {
    /// Function owning the access
    pub function_index: u32,
    /// PC offset of the access within that function
    pub pc_offset: u64,
    /// Earlier endpoint, present on temporal views only
    pub source_pc: Option<SourcePc>,
    /// Owning allocation handle; 0 on temporal views
    pub memory_op_id: u64,
    /// Access kind of the redundant unit
    pub access_kind: AccessKind,
    /// The redundant value's canonical bit pattern
    pub value: u64,
    /// Redundant access count
    pub count: u64,
    /// All accesses at this PC (spatial views; 0 on temporal views)
    pub total: u64,
}

/// Reduced analysis output handed to the record callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordData {
    /// Which analysis produced the views
    pub analysis: AnalysisKind,
    /// Which access direction the views aggregate
    pub access_type: AccessType,
    /// Top-K views, most redundant first
    pub views: Vec<RecordView>,
}

impl RecordData {
    /// Number of emitted views
    pub fn num_views(&self) -> usize {
        self.views.len()
    }
}

/// Count one access value at one PC into the spatial trace
pub fn observe_spatial(
    pc: u64,
    value: u64,
    memory_op_id: u64,
    kind: AccessKind,
    trace: &mut SpatialTrace,
) {
    *trace
        .entry((memory_op_id, kind))
        .or_default()
        .entry(pc)
        .or_default()
        .entry(value)
        .or_default() += 1;
}

/// Refresh a thread's last-seen access without recording a pair
pub fn refresh_temporal(
    pc: u64,
    thread_id: ThreadId,
    addr: u64,
    value: u64,
    temporal: &mut TemporalTrace,
) {
    temporal.entry(thread_id).or_default().insert(addr, (pc, value));
}

/// Update a thread's last-seen access and record a redundant pair when the
/// value repeats at the same address.
pub fn observe_temporal(
    pc: u64,
    thread_id: ThreadId,
    addr: u64,
    value: u64,
    kind: AccessKind,
    temporal: &mut TemporalTrace,
    pairs: &mut PcPairs,
) {
    let last = temporal.entry(thread_id).or_default().insert(addr, (pc, value));
    if let Some((prev_pc, prev_value)) = last {
        if prev_value == value {
            *pairs
                .entry(prev_pc)
                .or_default()
                .entry(pc)
                .or_default()
                .entry((value, kind))
                .or_default() += 1;
        }
    }
}

fn sort_views(views: &mut Vec<RecordView>, limit: usize) {
    views.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then(a.pc_offset.cmp(&b.pc_offset))
            .then_with(|| {
                let a_src = a.source_pc.map(|s| s.pc_offset);
                let b_src = b.source_pc.map(|s| s.pc_offset);
                a_src.cmp(&b_src)
            })
            .then(a.value.cmp(&b.value))
    });
    views.truncate(limit);
}

/// Reduce a spatial trace into its top views.
///
/// Per PC the redundancy score is the dominant value's count (ties favor
/// the smallest value). `mem_views`, when non-zero, caps each
/// `(memory_op_id, kind)` group before the global `pc_views` cut.
pub fn reduce_spatial(trace: &SpatialTrace, pc_views: usize, mem_views: usize) -> Vec<RecordView> {
    let mut views = Vec::new();

    for (&(memory_op_id, kind), pcs) in trace {
        let mut group = Vec::new();
        for (&pc, values) in pcs {
            let total: u64 = values.values().sum();
            let mut dominant_value = 0u64;
            let mut dominant_count = 0u64;
            for (&value, &count) in values {
                if count > dominant_count {
                    dominant_value = value;
                    dominant_count = count;
                }
            }
            group.push(RecordView {
                function_index: 0,
                pc_offset: pc,
                source_pc: None,
                memory_op_id,
                access_kind: kind,
                value: dominant_value,
                count: dominant_count,
                total,
            });
        }
        if mem_views != 0 {
            sort_views(&mut group, mem_views);
        }
        views.append(&mut group);
    }

    sort_views(&mut views, pc_views);
    views
}

/// Reduce temporal pairs into their top views, surfacing both endpoints
pub fn reduce_temporal(pairs: &PcPairs, pc_views: usize) -> Vec<RecordView> {
    let mut views = Vec::new();

    for (&from_pc, sinks) in pairs {
        for (&to_pc, values) in sinks {
            for (&(value, kind), &count) in values {
                views.push(RecordView {
                    function_index: 0,
                    pc_offset: to_pc,
                    source_pc: Some(SourcePc {
                        function_index: 0,
                        pc_offset: from_pc,
                    }),
                    memory_op_id: 0,
                    access_kind: kind,
                    value,
                    count,
                    total: 0,
                });
            }
        }
    }

    sort_views(&mut views, pc_views);
    views
}
