//! Blame-shift core for a sampling CPU/GPU co-profiler.
//!
//! A host thread that blocks in a GPU synchronization call is not simply
//! "idle": something kept it waiting, and something will sit idle after.
//! This crate maintains per-stream timelines of asynchronous GPU work,
//! reconciles them against timer samples and synchronization windows, and
//! redistributes every observed tick to one of four kinds of blame:
//! CPU idleness (waiting for kernels), GPU idleness (starved by the CPU),
//! CPU/GPU overlap, and per-kernel idle cause: the fraction of a wait
//! each concurrently running kernel is responsible for.
//!
//! The crate is a library of *shims*: the embedder intercepts the driver
//! API (launch, memcpy, stream and synchronization calls), routes each one
//! through the matching [`Profiler`] method with the real call as a
//! closure, and forwards timer interrupts to
//! [`Profiler::timer_sample`]. Call-path unwinding, metric storage and
//! trace emission stay with the embedder, behind the traits in [`host`];
//! the driver's timestamp-event primitives sit behind [`driver::Driver`].
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
//!
//! use gpu_blame_shift::config::Opts;
//! use gpu_blame_shift::driver::{Driver, DriverError, EventHandle, EventStatus, StreamHandle};
//! use gpu_blame_shift::host::{
//!     CallpathSampler, CctNode, ChannelId, Hooks, MetricId, MetricKind, MetricSink, MetricValue,
//!     RegContext, SystemClock, TraceEntry, TraceSink,
//! };
//! use gpu_blame_shift::Profiler;
//!
//! # struct NullDriver(AtomicU64);
//! # impl Driver for NullDriver {
//! #     fn create_event(&self) -> Result<EventHandle, DriverError> {
//! #         Ok(EventHandle(1 + self.0.fetch_add(1, Ordering::Relaxed)))
//! #     }
//! #     fn destroy_event(&self, _: EventHandle) -> Result<(), DriverError> {
//! #         Ok(())
//! #     }
//! #     fn record_event(&self, _: EventHandle, _: StreamHandle) -> Result<(), DriverError> {
//! #         Ok(())
//! #     }
//! #     fn query_event(&self, _: EventHandle) -> Result<EventStatus, DriverError> {
//! #         Ok(EventStatus::NotReady)
//! #     }
//! #     fn elapsed_ms(&self, _: EventHandle, _: EventHandle) -> Result<f32, DriverError> {
//! #         Ok(0.0)
//! #     }
//! # }
//! # struct NullHost(AtomicU32);
//! # impl CallpathSampler for NullHost {
//! #     fn sample_callpath(&self, ctx: RegContext, _: MetricId, _: u64, _: u32, _: bool) -> CctNode {
//! #         CctNode(ctx.0 as u64)
//! #     }
//! #     fn duplicate_to_stream(&self, _: ChannelId, _: RegContext, node: CctNode) -> CctNode {
//! #         node
//! #     }
//! # }
//! # impl MetricSink for NullHost {
//! #     fn define(&self, _: &str, _: MetricKind) -> MetricId {
//! #         MetricId(self.0.fetch_add(1, Ordering::Relaxed))
//! #     }
//! #     fn add(&self, _: MetricId, _: CctNode, _: MetricValue) {}
//! # }
//! # impl TraceSink for NullHost {
//! #     fn is_active(&self) -> bool {
//! #         false
//! #     }
//! #     fn open(&self, _: u32, stream: u32) -> ChannelId {
//! #         ChannelId(stream)
//! #     }
//! #     fn append(&self, _: ChannelId, _: u32, _: u32, _: TraceEntry, _: u64) {}
//! #     fn close(&self, _: ChannelId, _: u32, _: u32) {}
//! # }
//! # let host = Arc::new(NullHost(AtomicU32::new(0)));
//! let hooks = Hooks {
//!     sampler: host.clone(),
//!     metrics: host.clone(),
//!     trace: host.clone(),
//!     clock: Arc::new(SystemClock),
//! };
//! let driver = Arc::new(NullDriver(AtomicU64::new(0)));
//! let profiler = Profiler::new(driver, hooks, Opts::default());
//! profiler.thread_init();
//!
//! // Each intercepted API call brackets the real one.
//! let stream = StreamHandle(0x1000);
//! profiler.stream_create(stream, || 0 /* real stream-create */);
//! profiler.configure_call(stream, || 0);
//! profiler.kernel_launch(RegContext(0), || 0 /* real launch */);
//! let status = profiler.sync_device(RegContext(0), || 0 /* real synchronize */);
//! assert_eq!(status, 0);
//!
//! profiler.thread_fini();
//! ```

mod blame;
pub mod config;
pub mod driver;
mod ffi;
pub mod host;
pub mod ipc;
mod lock;
mod shim;
mod timeline;

#[cfg(test)]
pub(crate) mod testkit;

pub use config::Opts;
pub use shim::Profiler;
