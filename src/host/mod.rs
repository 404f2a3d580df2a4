//! Interfaces consumed from the surrounding profiler.
//!
//! The blame-shift core does not unwind call stacks, store calling-context
//! trees, aggregate metrics or write trace files; it drives collaborators
//! that do. Everything here is a seam: the embedder supplies the
//! implementations, tests supply recording mocks.

use std::sync::Arc;

use crate::ffi;

/// Reference to a calling-context-tree node owned by the collaborator.
///
/// Borrowed, never dereferenced here; the collaborator guarantees the node
/// outlives every event that mentions it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CctNode(pub u64);

/// Opaque register context captured at an interception point, handed back
/// to the call-path sampler for unwinding.
#[derive(Clone, Copy, Debug)]
pub struct RegContext(pub usize);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MetricId(pub u32);

/// Metric value representation, fixed at registration time.
///
/// Integer and real metrics are deliberately distinct kinds: the idle
/// buckets are exact microsecond counts, while idle-cause and overlap are
/// fractional shares of a sample split across kernels.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MetricKind {
    Int,
    Real,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum MetricValue {
    Int(u64),
    Real(f64),
}

/// Handle to one stream's trace side-channel.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ChannelId(pub u32);

/// One record in a stream's trace timeline.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum TraceEntry {
    /// The stream has nothing running.
    Idle,
    /// A kernel attributed to this launch-site node is running.
    Kernel(CctNode),
}

pub trait CallpathSampler: Send + Sync {
    /// Unwinds `ctx` and returns the calling-context node for the current
    /// call site, skipping `skip_inner` innermost frames.
    fn sample_callpath(
        &self,
        ctx: RegContext,
        metric: MetricId,
        initial_increment: u64,
        skip_inner: u32,
        is_sync: bool,
    ) -> CctNode;

    /// Copies an unwound call path into a stream's side-channel tree and
    /// returns the stream-side node.
    fn duplicate_to_stream(&self, channel: ChannelId, ctx: RegContext, node: CctNode) -> CctNode;
}

pub trait MetricSink: Send + Sync {
    fn define(&self, name: &str, kind: MetricKind) -> MetricId;

    /// Adds `value` to `metric` at `node`. Called from signal context;
    /// must not block.
    fn add(&self, metric: MetricId, node: CctNode, value: MetricValue);
}

pub trait TraceSink: Send + Sync {
    fn is_active(&self) -> bool;

    fn open(&self, device: u32, stream: u32) -> ChannelId;

    fn append(&self, channel: ChannelId, device: u32, stream: u32, entry: TraceEntry, time_us: u64);

    fn close(&self, channel: ChannelId, device: u32, stream: u32);
}

/// Microsecond wall clock, the same epoch the trace files use.
pub trait Clock: Send + Sync {
    fn now_us(&self) -> u64;
}

/// [`Clock`] backed by `gettimeofday`.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        match ffi::gettimeofday_us() {
            Ok(us) => us,
            Err(e) => panic!("gettimeofday failed: {e}"),
        }
    }
}

/// The collaborator bundle a [`Profiler`][crate::Profiler] drives.
pub struct Hooks {
    pub sampler: Arc<dyn CallpathSampler>,
    pub metrics: Arc<dyn MetricSink>,
    pub trace: Arc<dyn TraceSink>,
    pub clock: Arc<dyn Clock>,
}

/// The metrics this core registers, by name visible in profiler output.
pub(crate) struct MetricIds {
    /// Microseconds a CPU thread blocked waiting for the GPU.
    pub cpu_idle: MetricId,
    /// Microseconds the GPU was idle, blamed on the CPU site that failed
    /// to keep it busy.
    pub gpu_idle: MetricId,
    /// Fractional CPU-idle time blamed on the kernels that kept the GPU
    /// busy while the CPU waited.
    pub cpu_idle_cause: MetricId,
    /// Concurrent execution, at the CPU sample site.
    pub cpu_overlap: MetricId,
    /// Concurrent execution, at the kernel launch site.
    pub gpu_overlap: MetricId,
    /// Absolute kernel runtime.
    pub gpu_activity: MetricId,
    pub h_to_d_bytes: MetricId,
    pub d_to_h_bytes: MetricId,
}

impl MetricIds {
    pub fn register(sink: &dyn MetricSink) -> Self {
        Self {
            cpu_idle: sink.define("CPU_IDLE", MetricKind::Int),
            gpu_idle: sink.define("GPU_IDLE_CAUSE", MetricKind::Int),
            cpu_idle_cause: sink.define("CPU_IDLE_CAUSE", MetricKind::Real),
            cpu_overlap: sink.define("OVERLAPPED_CPU", MetricKind::Real),
            gpu_overlap: sink.define("OVERLAPPED_GPU", MetricKind::Real),
            gpu_activity: sink.define("GPU_ACTIVITY_TIME", MetricKind::Int),
            h_to_d_bytes: sink.define("H_TO_D_BYTES", MetricKind::Int),
            d_to_h_bytes: sink.define("D_TO_H_BYTES", MetricKind::Int),
        }
    }
}
