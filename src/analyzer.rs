//! Analyzer handle: registration, lifecycle, and the trace pipeline
//!
//! All state hangs off an [`Analyzer`] created at startup and shared across
//! the producer threads of the instrumentation layer. Each `analyze` call
//! decodes one trace buffer: every record is resolved against the owning
//! binary's symbols, classified through the instruction graph, mapped to an
//! allocation via the memory snapshots, canonicalized, and accumulated into
//! the calling thread's kernel state shard.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::binary::{transform_pc, Binary, BinaryRegistry};
use crate::canonical::{canonicalize, ApproxLevel, Precision};
use crate::error::{AnalyzerError, Result};
use crate::instruction::{load_data_type, store_data_type, AccessKind, DataType, Symbol};
use crate::kernel::{KernelState, ThreadId, ThreadKernels};
use crate::redundancy::{
    observe_spatial, observe_temporal, reduce_spatial, reduce_temporal, refresh_temporal,
    AccessType, AnalysisKind, RecordData, RecordView,
};
use crate::snapshot::{lookup_allocation, MemoryRange, MemorySnapshotStore, Snapshot};
use crate::trace::{flags, memory_id, TraceBuffer, TraceRecord, MAX_VALUE_BYTES, WARP_SIZE};

/// Sink for raw trace buffers, invoked after each successful analysis
pub type LogCallback = dyn Fn(u64, &TraceBuffer) + Send + Sync;

/// Sink for reduced views, invoked per kernel and analysis during flush
pub type RecordCallback = dyn Fn(u32, u64, &RecordData) + Send + Sync;

#[derive(Default)]
struct Callbacks {
    log: Option<Box<LogCallback>>,
    record: Option<Box<RecordCallback>>,
    pc_views_limit: u32,
    mem_views_limit: u32,
}

/// Thread-safe entry point of the redundancy analysis
#[derive(Default)]
pub struct Analyzer {
    binaries: BinaryRegistry,
    snapshots: MemorySnapshotStore,
    kernels: DashMap<u32, ThreadKernels>,
    enabled: RwLock<BTreeSet<AnalysisKind>>,
    precision: RwLock<Precision>,
    callbacks: RwLock<Callbacks>,
    /// Earliest host op analyzed per CPU thread since its last `begin`;
    /// 0 means none yet
    min_host_op_id: DashMap<u32, u64>,
    output_dir: RwLock<Option<PathBuf>>,
}

impl Analyzer {
    /// Create an analyzer with no analyses enabled and full precision
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the directory reporting front-ends should write into
    pub fn set_output(&self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        tracing::info!(path = %path.display(), "analysis output directory set");
        *self.output_dir.write() = Some(path);
    }

    /// The configured output directory, if any
    pub fn output(&self) -> Option<PathBuf> {
        self.output_dir.read().clone()
    }

    /// Select the approximation level for value canonicalization.
    /// Levels outside the enumerated set leave the precision unchanged.
    pub fn set_precision(&self, level: u32) -> Result<()> {
        let level = ApproxLevel::from_raw(level)?;
        *self.precision.write() = Precision::from_level(level);
        Ok(())
    }

    /// Enable an analysis; effective on the next `analyze`
    pub fn enable(&self, kind: AnalysisKind) {
        tracing::debug!(?kind, "analysis enabled");
        self.enabled.write().insert(kind);
    }

    /// Disable an analysis; effective on the next `analyze`
    pub fn disable(&self, kind: AnalysisKind) {
        tracing::debug!(?kind, "analysis disabled");
        self.enabled.write().remove(&kind);
    }

    /// Register a binary and parse its companion instruction listing
    pub fn register_binary(&self, cubin_id: u32, symbol_pcs: &[u64], path: &Path) -> Result<()> {
        self.binaries.register(cubin_id, symbol_pcs, path)
    }

    /// Record a binary for lazy registration on first use
    pub fn register_binary_cache(
        &self,
        cubin_id: u32,
        symbol_pcs: &[u64],
        path: &Path,
    ) -> Result<()> {
        self.binaries.register_cache(cubin_id, symbol_pcs, path)
    }

    /// Drop a registered binary
    pub fn unregister_binary(&self, cubin_id: u32) -> Result<()> {
        self.binaries.unregister(cubin_id)
    }

    /// Register a device allocation at time `host_op_id`
    pub fn register_memory(
        &self,
        start: u64,
        end: u64,
        host_op_id: u64,
        memory_id: u64,
    ) -> Result<()> {
        self.snapshots
            .register(MemoryRange::new(start, end), host_op_id, memory_id)
    }

    /// Remove a device allocation at time `host_op_id`
    pub fn unregister_memory(&self, start: u64, end: u64, host_op_id: u64) -> Result<()> {
        self.snapshots
            .unregister(MemoryRange::new(start, end), host_op_id)
    }

    /// Register the raw trace buffer sink
    pub fn set_log_callback(&self, callback: impl Fn(u64, &TraceBuffer) + Send + Sync + 'static) {
        self.callbacks.write().log = Some(Box::new(callback));
    }

    /// Register the reduced view sink along with its view limits.
    ///
    /// `pc_views` caps every reducer's global top-K; a non-zero `mem_views`
    /// additionally caps each allocation's contribution to spatial views.
    pub fn set_record_callback(
        &self,
        callback: impl Fn(u32, u64, &RecordData) + Send + Sync + 'static,
        pc_views: u32,
        mem_views: u32,
    ) {
        let mut callbacks = self.callbacks.write();
        callbacks.record = Some(Box::new(callback));
        callbacks.pc_views_limit = pc_views;
        callbacks.mem_views_limit = mem_views;
    }

    /// Reset the earliest-host-op watermark of `cpu_thread`
    pub fn begin(&self, cpu_thread: u32) {
        self.min_host_op_id.insert(cpu_thread, 0);
    }

    /// Collect memory snapshots no analysis on `cpu_thread` can reference
    /// anymore
    pub fn end(&self, cpu_thread: u32) -> Result<()> {
        let min_seen = self
            .min_host_op_id
            .get(&cpu_thread)
            .map(|entry| *entry.value())
            .unwrap_or(0);
        if min_seen != 0 {
            self.snapshots.garbage_collect(min_seen);
        }
        Ok(())
    }

    /// Analyze one trace buffer produced for `(cubin_id, kernel_id)` at time
    /// `host_op_id` by the producer thread `cpu_thread`.
    ///
    /// Fails with `NotExistEntry` only when the binary is unresolvable; any
    /// per-record or per-lane miss is skipped silently. Returns
    /// `NotRegisteredCallback` when no log sink is installed — the results
    /// are accumulated regardless.
    pub fn analyze(
        &self,
        cpu_thread: u32,
        cubin_id: u32,
        kernel_id: u64,
        host_op_id: u64,
        buffer: &TraceBuffer,
    ) -> Result<()> {
        tracing::debug!(cpu_thread, cubin_id, kernel_id, host_op_id, "analyzing trace buffer");

        let binary = self.binaries.resolve(cubin_id)?;
        let snapshot = self.snapshots.pin(host_op_id);
        let enabled = self.enabled.read().clone();
        let precision = *self.precision.read();

        {
            let mut thread_kernels = self.kernels.entry(cpu_thread).or_default();
            let kernel = thread_kernels
                .entry(kernel_id)
                .or_insert_with(|| KernelState::new(kernel_id, cubin_id));
            kernel.cubin_id = cubin_id;
            analyze_trace(kernel, &binary, snapshot.as_deref(), &enabled, precision, buffer);
        }

        self.min_host_op_id
            .entry(cpu_thread)
            .and_modify(|min| {
                if *min == 0 {
                    *min = host_op_id;
                } else {
                    *min = (*min).min(host_op_id);
                }
            })
            .or_insert(host_op_id);

        let callbacks = self.callbacks.read();
        match &callbacks.log {
            Some(log) => {
                log(kernel_id, buffer);
                Ok(())
            }
            None => Err(AnalyzerError::NotRegisteredCallback),
        }
    }

    /// Reduce and emit every kernel state owned by `cpu_thread`, then drop
    /// those states.
    ///
    /// For each kernel and enabled analysis, the read and the write side are
    /// reduced separately, PCs are rewritten to `(function_index,
    /// pc_offset)` form, and the record callback receives the result.
    pub fn flush(&self, cpu_thread: u32) -> Result<()> {
        tracing::debug!(cpu_thread, "flushing kernel states");

        let callbacks = self.callbacks.read();
        let Some(record) = &callbacks.record else {
            return Err(AnalyzerError::NotRegisteredCallback);
        };
        let pc_views = callbacks.pc_views_limit as usize;
        let mem_views = callbacks.mem_views_limit as usize;

        let Some((_, thread_kernels)) = self.kernels.remove(&cpu_thread) else {
            return Ok(());
        };
        let enabled = self.enabled.read().clone();

        for (kernel_id, kernel) in thread_kernels {
            let binary = self.binaries.resolve(kernel.cubin_id).ok();
            let symbols = binary.as_ref().map(|b| b.symbols.as_slice());

            for analysis in &enabled {
                let sides: [(AccessType, Vec<RecordView>); 2] = match analysis {
                    AnalysisKind::SpatialRedundancy => [
                        (
                            AccessType::Read,
                            reduce_spatial(&kernel.read_spatial, pc_views, mem_views),
                        ),
                        (
                            AccessType::Write,
                            reduce_spatial(&kernel.write_spatial, pc_views, mem_views),
                        ),
                    ],
                    AnalysisKind::TemporalRedundancy => [
                        (AccessType::Read, reduce_temporal(&kernel.read_pairs, pc_views)),
                        (
                            AccessType::Write,
                            reduce_temporal(&kernel.write_pairs, pc_views),
                        ),
                    ],
                };

                for (access_type, mut views) in sides {
                    translate_views(&mut views, symbols);
                    let data = RecordData {
                        analysis: *analysis,
                        access_type,
                        views,
                    };
                    record(kernel.cubin_id, kernel_id, &data);
                }
            }
        }

        Ok(())
    }
}

/// Rewrite raw runtime PCs into `(function_index, pc_offset)` form.
/// Views whose PC does not resolve keep the raw value.
fn translate_views(views: &mut [RecordView], symbols: Option<&[Symbol]>) {
    let Some(symbols) = symbols else {
        return;
    };
    for view in views {
        if let Ok((function_index, _, pc_offset)) = transform_pc(symbols, view.pc_offset) {
            view.function_index = function_index;
            view.pc_offset = pc_offset;
        }
        if let Some(source) = view.source_pc.as_mut() {
            if let Ok((function_index, _, pc_offset)) = transform_pc(symbols, source.pc_offset) {
                source.function_index = function_index;
                source.pc_offset = pc_offset;
            }
        }
    }
}

/// Access kind assumed when the instruction graph gives no answer.
///
/// The unit width multiplies the already-bit-valued vector width by 8 again
/// before clamping to the warp width, matching the instrumentation layer's
/// historical formula; accesses under four bytes therefore split into zero
/// units and contribute nothing.
fn fallback_access_kind(size: u32) -> AccessKind {
    let vec_size = size * 8;
    let unit_size = (WARP_SIZE as u32).min(vec_size * 8);
    AccessKind::new(DataType::Float, vec_size, unit_size)
}

/// Global thread id of `lane` within the record's warp
fn warp_thread_id(record: &TraceRecord, lane: usize) -> ThreadId {
    let warp = WARP_SIZE as u32;
    ThreadId {
        flat_block_id: record.flat_block_id,
        flat_thread_id: record.flat_thread_id / warp * warp + lane as u32,
    }
}

fn analyze_trace(
    kernel: &mut KernelState,
    binary: &Binary,
    snapshot: Option<&Snapshot>,
    enabled: &BTreeSet<AnalysisKind>,
    precision: Precision,
    buffer: &TraceBuffer,
) {
    let spatial = enabled.contains(&AnalysisKind::SpatialRedundancy);
    let temporal = enabled.contains(&AnalysisKind::TemporalRedundancy);

    for record in buffer.valid_records() {
        if record.size == 0 {
            // No lane accessed anything
            continue;
        }
        if record.flags & flags::BLOCK_ENTER != 0 {
            continue;
        }
        if record.flags & flags::BLOCK_EXIT != 0 {
            // Per-thread temporal state is scoped to the block
            for lane in 0..WARP_SIZE {
                if record.active & (1 << lane) != 0 {
                    kernel.clear_thread(&warp_thread_id(record, lane));
                }
            }
            continue;
        }

        let resolved = transform_pc(&binary.symbols, record.pc).ok();
        if kernel.function_addr == 0 {
            if let Some((function_index, _, pc_offset)) = resolved {
                kernel.function_index = function_index;
                kernel.function_addr = record.pc - pc_offset;
            }
        }

        let mut access_kind = AccessKind::default();
        if !binary.graph.is_empty() {
            if let Some((_, cubin_offset, _)) = resolved {
                if let Some(inst) = binary.graph.node(cubin_offset as u32) {
                    access_kind = match inst.access_kind {
                        Some(kind) if !kind.is_unknown() => kind,
                        _ if record.flags & flags::READ != 0 => {
                            load_data_type(inst.pc, &binary.graph)
                        }
                        _ if record.flags & flags::WRITE != 0 => {
                            store_data_type(inst.pc, &binary.graph)
                        }
                        _ => AccessKind::default(),
                    };
                }
            }
        }
        if access_kind.is_unknown() {
            access_kind = fallback_access_kind(record.size);
        }
        if access_kind.unit_size == 0 {
            continue;
        }

        let num_units = (access_kind.vec_size / access_kind.unit_size) as usize;
        let unit_bytes = (access_kind.unit_size / 8) as usize;
        // Each unit is observed as a scalar of the unit width
        let unit_kind = AccessKind::new(
            access_kind.data_type,
            access_kind.unit_size,
            access_kind.unit_size,
        );
        let read = record.flags & flags::READ != 0;

        for lane in 0..WARP_SIZE {
            if record.active & (1 << lane) == 0 {
                continue;
            }
            let thread_id = warp_thread_id(record, lane);
            let addr = record.address[lane];

            let mut memory_op_id = snapshot
                .and_then(|s| lookup_allocation(s, addr))
                .map(|allocation| allocation.memory_op_id)
                .unwrap_or(0);
            if memory_op_id == 0 {
                if record.flags & flags::LOCAL != 0 {
                    memory_op_id = memory_id::LOCAL;
                } else if record.flags & flags::SHARED != 0 {
                    memory_op_id = memory_id::SHARED;
                } else {
                    // Unknown allocation
                    continue;
                }
            }

            for unit in 0..num_units {
                let offset = unit * unit_bytes;
                if offset + unit_bytes > MAX_VALUE_BYTES {
                    break;
                }
                let mut raw = [0u8; 8];
                raw[..unit_bytes]
                    .copy_from_slice(&record.value[lane][offset..offset + unit_bytes]);
                let value = canonicalize(
                    u64::from_le_bytes(raw),
                    &unit_kind,
                    precision.f32_digits,
                    precision.f64_digits,
                );

                if spatial {
                    let trace = if read {
                        &mut kernel.read_spatial
                    } else {
                        &mut kernel.write_spatial
                    };
                    observe_spatial(record.pc, value, memory_op_id, unit_kind, trace);
                }
                if temporal {
                    // A repeated value pairs on the side of the newer access,
                    // whichever direction last touched the address; both
                    // last-access traces mirror every access.
                    let (sink_trace, mirror_trace, pairs) = if read {
                        (
                            &mut kernel.read_temporal,
                            &mut kernel.write_temporal,
                            &mut kernel.read_pairs,
                        )
                    } else {
                        (
                            &mut kernel.write_temporal,
                            &mut kernel.read_temporal,
                            &mut kernel.write_pairs,
                        )
                    };
                    observe_temporal(record.pc, thread_id, addr, value, unit_kind, sink_trace, pairs);
                    refresh_temporal(record.pc, thread_id, addr, value, mirror_trace);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_access_kind() {
        // 4-byte access: 32-bit vector, unit clamped to the warp width
        let kind = fallback_access_kind(4);
        assert_eq!(kind.data_type, DataType::Float);
        assert_eq!(kind.vec_size, 32);
        assert_eq!(kind.unit_size, 32);

        // 16-byte access still splits into four 32-bit units
        let kind = fallback_access_kind(16);
        assert_eq!(kind.vec_size, 128);
        assert_eq!(kind.unit_size, 32);

        // Sub-word accesses produce zero units
        let kind = fallback_access_kind(1);
        assert_eq!(kind.vec_size / kind.unit_size, 0);
    }

    #[test]
    fn test_warp_thread_id() {
        let mut record = TraceRecord::default();
        record.flat_block_id = 3;
        record.flat_thread_id = 70; // lane 0 of the warp covering 64..96
        let id = warp_thread_id(&record, 5);
        assert_eq!(id.flat_block_id, 3);
        assert_eq!(id.flat_thread_id, 69);
    }

    #[test]
    fn test_set_precision_rejects_unknown_level() {
        let analyzer = Analyzer::new();
        assert!(analyzer.set_precision(2).is_ok());
        assert!(matches!(
            analyzer.set_precision(42),
            Err(AnalyzerError::NoSuchApprox(42))
        ));
    }

    #[test]
    fn test_end_without_analysis_is_noop() {
        let analyzer = Analyzer::new();
        analyzer.begin(0);
        analyzer.end(0).unwrap();
    }
}
