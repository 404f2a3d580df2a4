//! Scriptable collaborators for exercising the core without a device.
//!
//! The mock driver hands out monotonically numbered event handles and lets
//! tests script completion: an event is not ready until `complete` gives
//! it a CPU-epoch microsecond position. The recording sinks capture every
//! metric credit and trace record verbatim. The stub sampler maps a
//! register context straight to a CCT node (`ctx.0` becomes the node), and
//! stream duplication offsets the node by [`STREAM_DUP_OFFSET`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::driver::{Driver, DriverError, EventHandle, EventStatus, StreamHandle};
use crate::host::{
    CallpathSampler, CctNode, ChannelId, Clock, Hooks, MetricId, MetricKind, MetricSink,
    MetricValue, RegContext, TraceEntry, TraceSink,
};

pub const STREAM_DUP_OFFSET: u64 = 100_000;

#[derive(Default)]
struct MockEvent {
    time_us: Option<u64>,
    recorded_on: Option<StreamHandle>,
    destroyed: bool,
}

#[derive(Default)]
struct MockDriverState {
    next_handle: u64,
    events: HashMap<u64, MockEvent>,
    created: u64,
    queries: u64,
}

/// Driver whose events complete exactly when the test says so.
#[derive(Default)]
pub struct MockDriver {
    state: Mutex<MockDriverState>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockDriverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `event` complete at the given CPU-epoch microsecond position.
    pub fn complete(&self, event: EventHandle, time_us: u64) {
        let mut state = self.state();
        let ev = state.events.entry(event.0).or_default();
        ev.time_us = Some(time_us);
    }

    /// The `n`-th created event handle, 1-based in creation order.
    pub fn nth_event(&self, n: u64) -> EventHandle {
        EventHandle(n)
    }

    pub fn created_events(&self) -> u64 {
        self.state().created
    }

    /// Readiness queries issued so far.
    pub fn query_count(&self) -> u64 {
        self.state().queries
    }

    pub fn recorded_stream(&self, event: EventHandle) -> Option<StreamHandle> {
        self.state().events.get(&event.0).and_then(|ev| ev.recorded_on)
    }

    pub fn destroyed(&self, event: EventHandle) -> bool {
        self.state()
            .events
            .get(&event.0)
            .map(|ev| ev.destroyed)
            .unwrap_or(false)
    }
}

impl Driver for MockDriver {
    fn create_event(&self) -> Result<EventHandle, DriverError> {
        let mut state = self.state();
        state.next_handle += 1;
        state.created += 1;
        let handle = state.next_handle;
        state.events.entry(handle).or_default();
        Ok(EventHandle(handle))
    }

    fn destroy_event(&self, event: EventHandle) -> Result<(), DriverError> {
        let mut state = self.state();
        let ev = state.events.entry(event.0).or_default();
        assert!(!ev.destroyed, "event {event:?} destroyed twice");
        ev.destroyed = true;
        Ok(())
    }

    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> Result<(), DriverError> {
        let mut state = self.state();
        let ev = state.events.entry(event.0).or_default();
        ev.recorded_on = Some(stream);
        Ok(())
    }

    fn query_event(&self, event: EventHandle) -> Result<EventStatus, DriverError> {
        let mut state = self.state();
        state.queries += 1;
        let ready = state
            .events
            .get(&event.0)
            .map(|ev| ev.time_us.is_some())
            .unwrap_or(false);
        Ok(if ready {
            EventStatus::Ready
        } else {
            EventStatus::NotReady
        })
    }

    fn elapsed_ms(&self, start: EventHandle, end: EventHandle) -> Result<f32, DriverError> {
        let state = self.state();
        let at = |h: EventHandle| {
            state
                .events
                .get(&h.0)
                .and_then(|ev| ev.time_us)
                .ok_or(DriverError {
                    op: "elapsed_ms",
                    status: -1,
                })
        };
        let start_us = at(start)?;
        let end_us = at(end)?;
        Ok((end_us as f64 - start_us as f64) as f32 / 1000.0)
    }
}

/// Metric sink that remembers every definition and credit.
#[derive(Default)]
pub struct RecordingMetrics {
    pub defined: Mutex<Vec<(String, MetricKind)>>,
    pub entries: Mutex<Vec<(MetricId, CctNode, MetricValue)>>,
}

impl RecordingMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sum_int(&self, metric: MetricId, node: CctNode) -> u64 {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(m, n, _)| *m == metric && *n == node)
            .map(|(_, _, v)| match v {
                MetricValue::Int(i) => *i,
                MetricValue::Real(_) => panic!("real credit on integer metric {metric:?}"),
            })
            .sum()
    }

    pub fn sum_real(&self, metric: MetricId, node: CctNode) -> f64 {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(m, n, _)| *m == metric && *n == node)
            .map(|(_, _, v)| match v {
                MetricValue::Real(r) => *r,
                MetricValue::Int(_) => panic!("integer credit on real metric {metric:?}"),
            })
            .sum()
    }

    pub fn credits(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl MetricSink for RecordingMetrics {
    fn define(&self, name: &str, kind: MetricKind) -> MetricId {
        let mut defined = self.defined.lock().unwrap_or_else(PoisonError::into_inner);
        defined.push((name.to_owned(), kind));
        MetricId(defined.len() as u32 - 1)
    }

    fn add(&self, metric: MetricId, node: CctNode, value: MetricValue) {
        let kind = self.defined.lock().unwrap_or_else(PoisonError::into_inner)[metric.0 as usize].1;
        match (kind, value) {
            (MetricKind::Int, MetricValue::Int(_)) | (MetricKind::Real, MetricValue::Real(_)) => {}
            _ => panic!("metric {metric:?} credited with the wrong value kind"),
        }
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((metric, node, value));
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct TraceRecord {
    pub channel: ChannelId,
    pub device: u32,
    pub stream: u32,
    pub entry: TraceEntry,
    pub time_us: u64,
}

#[derive(Default)]
pub struct RecordingTrace {
    inactive: AtomicBool,
    next_channel: AtomicU64,
    pub records: Mutex<Vec<TraceRecord>>,
    pub closed: Mutex<Vec<(ChannelId, u32)>>,
}

impl RecordingTrace {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_active(&self, active: bool) {
        self.inactive.store(!active, Ordering::Relaxed);
    }

    pub fn records_for(&self, stream: u32) -> Vec<TraceRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.stream == stream)
            .copied()
            .collect()
    }
}

impl TraceSink for RecordingTrace {
    fn is_active(&self) -> bool {
        !self.inactive.load(Ordering::Relaxed)
    }

    fn open(&self, _device: u32, _stream: u32) -> ChannelId {
        ChannelId(self.next_channel.fetch_add(1, Ordering::Relaxed) as u32)
    }

    fn append(&self, channel: ChannelId, device: u32, stream: u32, entry: TraceEntry, time_us: u64) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(TraceRecord {
                channel,
                device,
                stream,
                entry,
                time_us,
            });
    }

    fn close(&self, channel: ChannelId, _device: u32, stream: u32) {
        self.closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((channel, stream));
    }
}

/// Maps a register context directly to a CCT node.
pub struct StubSampler;

impl CallpathSampler for StubSampler {
    fn sample_callpath(
        &self,
        ctx: RegContext,
        _metric: MetricId,
        _initial_increment: u64,
        _skip_inner: u32,
        _is_sync: bool,
    ) -> CctNode {
        CctNode(ctx.0 as u64)
    }

    fn duplicate_to_stream(&self, _channel: ChannelId, _ctx: RegContext, node: CctNode) -> CctNode {
        CctNode(node.0 + STREAM_DUP_OFFSET)
    }
}

#[derive(Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(now_us: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(now_us)))
    }

    pub fn set(&self, now_us: u64) {
        self.0.store(now_us, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// One bundle of everything a profiler test needs.
pub struct Rig {
    pub driver: Arc<MockDriver>,
    pub metrics: Arc<RecordingMetrics>,
    pub trace: Arc<RecordingTrace>,
    pub clock: Arc<ManualClock>,
}

impl Rig {
    pub fn new(now_us: u64) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            driver: MockDriver::new(),
            metrics: RecordingMetrics::new(),
            trace: RecordingTrace::new(),
            clock: ManualClock::new(now_us),
        }
    }

    pub fn hooks(&self) -> Hooks {
        Hooks {
            sampler: Arc::new(StubSampler),
            metrics: self.metrics.clone(),
            trace: self.trace.clone(),
            clock: self.clock.clone(),
        }
    }
}
