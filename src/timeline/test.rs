use std::sync::Arc;

use super::registry::{InsertError, StreamRegistry, FIRST_STREAM_ID, MAX_STREAMS};
use super::{DeviceTimeline, ReapCtx, WorldStart};
use crate::driver::{Driver, EventHandle, StreamHandle};
use crate::host::{CctNode, MetricIds, TraceEntry, TraceSink};
use crate::ipc::Arbiter;
use crate::testkit::{MockDriver, RecordingMetrics, RecordingTrace, STREAM_DUP_OFFSET};

const T0: u64 = 1_000_000;

struct Fixture {
    driver: Arc<MockDriver>,
    metrics: Arc<RecordingMetrics>,
    trace: Arc<RecordingTrace>,
    ids: MetricIds,
    arbiter: Arbiter,
}

impl Fixture {
    fn new() -> Self {
        let metrics = RecordingMetrics::new();
        let ids = MetricIds::register(&*metrics);
        Self {
            driver: MockDriver::new(),
            metrics,
            trace: RecordingTrace::new(),
            ids,
            arbiter: Arbiter::new(),
        }
    }

    fn reap_ctx(&self, threads_at_sync: u64) -> ReapCtx<'_> {
        ReapCtx {
            driver: &*self.driver,
            metrics: &*self.metrics,
            trace: &*self.trace,
            ids: &self.ids,
            arbiter: &self.arbiter,
            shared_blaming: false,
            device: 0,
            threads_at_sync,
        }
    }

    /// Installs a world anchor whose driver event completed at `epoch_us`.
    fn anchor(&self, tl: &mut DeviceTimeline, epoch_us: u64) {
        let event = self.driver.create_event().unwrap();
        self.driver.complete(event, epoch_us);
        tl.world = Some(WorldStart { event, epoch_us });
    }

    fn launch(&self, tl: &mut DeviceTimeline, stream_id: u32, launcher: u64) -> (EventHandle, EventHandle) {
        let idx = tl
            .append_launch(
                &*self.driver,
                stream_id,
                CctNode(launcher),
                CctNode(launcher + STREAM_DUP_OFFSET),
            )
            .unwrap();
        let rec = tl.events.get(idx);
        (rec.start_event, rec.end_event)
    }
}

#[test]
fn test_unfinished_list_matches_nonempty_queues() {
    let fx = Fixture::new();
    let mut tl = DeviceTimeline::new();
    fx.anchor(&mut tl, T0);

    assert_eq!(tl.unfinished_list_len(), 0);
    fx.launch(&mut tl, FIRST_STREAM_ID, 1);
    fx.launch(&mut tl, FIRST_STREAM_ID, 2);
    fx.launch(&mut tl, FIRST_STREAM_ID + 1, 3);
    assert_eq!(tl.in_flight_len(FIRST_STREAM_ID), 2);
    assert_eq!(tl.in_flight_len(FIRST_STREAM_ID + 1), 1);
    assert_eq!(tl.unfinished_list_len(), 2);

    let streams_with_work = (0..MAX_STREAMS as u32)
        .filter(|s| tl.in_flight_len(FIRST_STREAM_ID + s) > 0)
        .count();
    assert_eq!(tl.unfinished_list_len(), streams_with_work);
}

#[test]
fn test_reap_stops_at_first_unready_event() {
    let fx = Fixture::new();
    let mut tl = DeviceTimeline::new();
    fx.anchor(&mut tl, T0);

    let (s1, e1) = fx.launch(&mut tl, FIRST_STREAM_ID, 1);
    let (_s2, _e2) = fx.launch(&mut tl, FIRST_STREAM_ID, 2);
    let (s3, e3) = fx.launch(&mut tl, FIRST_STREAM_ID, 3);
    fx.driver.complete(s1, T0 + 10);
    fx.driver.complete(e1, T0 + 20);
    // The second launch never completes; the third does, but the reaper
    // must not look past the first unready end event.
    fx.driver.complete(s3, T0 + 30);
    fx.driver.complete(e3, T0 + 40);

    let unfinished = tl.reap_finished(&fx.reap_ctx(0)).unwrap();
    assert_eq!(unfinished, 1);
    assert_eq!(tl.in_flight_len(FIRST_STREAM_ID), 2);
    assert_eq!(tl.unfinished_list_len(), 1);
}

#[test]
fn test_reap_frees_events_without_waiters() {
    let fx = Fixture::new();
    let mut tl = DeviceTimeline::new();
    fx.anchor(&mut tl, T0);

    let (start, end) = fx.launch(&mut tl, FIRST_STREAM_ID, 7);
    fx.driver.complete(start, T0 + 100);
    fx.driver.complete(end, T0 + 400);

    let unfinished = tl.reap_finished(&fx.reap_ctx(0)).unwrap();
    assert_eq!(unfinished, 0);
    assert_eq!(tl.in_flight_len(FIRST_STREAM_ID), 0);
    assert_eq!(tl.unfinished_list_len(), 0);
    assert_eq!(tl.retired_len(), 0);
    assert_eq!(tl.events.free_len(), 1);
    assert_eq!(fx.metrics.sum_int(fx.ids.gpu_activity, CctNode(7)), 300);
}

#[test]
fn test_reap_defers_events_with_waiters() {
    let fx = Fixture::new();
    let mut tl = DeviceTimeline::new();
    fx.anchor(&mut tl, T0);

    let (start, end) = fx.launch(&mut tl, FIRST_STREAM_ID, 7);
    fx.driver.complete(start, T0 + 100);
    fx.driver.complete(end, T0 + 400);

    tl.reap_finished(&fx.reap_ctx(2)).unwrap();
    assert_eq!(tl.retired_len(), 1);
    let retired = tl.events.get(tl.retired.tail());
    assert_eq!(retired.ref_count, 2);
    assert_eq!(retired.start_time_us, T0 + 100);
    assert_eq!(retired.end_time_us, T0 + 400);
    assert!(retired.ref_count > 0);
}

#[test]
fn test_reap_emits_trace_bracket() {
    let fx = Fixture::new();
    let mut tl = DeviceTimeline::new();
    fx.anchor(&mut tl, T0);
    let channel = fx.trace.open(0, FIRST_STREAM_ID);
    tl.streams[0].channel = Some(channel);

    let (start, end) = fx.launch(&mut tl, FIRST_STREAM_ID, 7);
    fx.driver.complete(start, T0 + 100);
    fx.driver.complete(end, T0 + 400);
    tl.reap_finished(&fx.reap_ctx(0)).unwrap();

    let records = fx.trace.records_for(FIRST_STREAM_ID);
    let kernel = TraceEntry::Kernel(CctNode(7 + STREAM_DUP_OFFSET));
    let got: Vec<(TraceEntry, u64)> = records.iter().map(|r| (r.entry, r.time_us)).collect();
    assert_eq!(
        got,
        vec![
            (TraceEntry::Idle, T0 + 99),
            (kernel, T0 + 100),
            (kernel, T0 + 400),
            (TraceEntry::Idle, T0 + 401),
        ]
    );
}

#[test]
fn test_reap_skips_trace_when_inactive() {
    let fx = Fixture::new();
    fx.trace.set_active(false);
    let mut tl = DeviceTimeline::new();
    fx.anchor(&mut tl, T0);
    let channel = fx.trace.open(0, FIRST_STREAM_ID);
    tl.streams[0].channel = Some(channel);

    let (start, end) = fx.launch(&mut tl, FIRST_STREAM_ID, 7);
    fx.driver.complete(start, T0 + 100);
    fx.driver.complete(end, T0 + 400);
    tl.reap_finished(&fx.reap_ctx(0)).unwrap();
    assert!(fx.trace.records_for(FIRST_STREAM_ID).is_empty());
}

#[test]
fn test_timestamp_conversion_is_exact_at_microsecond_offsets() {
    let fx = Fixture::new();
    let mut tl = DeviceTimeline::new();
    fx.anchor(&mut tl, T0);
    let world = tl.world.as_ref().unwrap();
    for offset in [1, 99, 100, 350, 12_345, 999_999] {
        let event = fx.driver.create_event().unwrap();
        fx.driver.complete(event, T0 + offset);
        assert_eq!(world.timestamp(&*fx.driver, event).unwrap(), T0 + offset);
    }
}

#[test]
fn test_pool_reuses_records_and_driver_events() {
    let fx = Fixture::new();
    let mut tl = DeviceTimeline::new();
    fx.anchor(&mut tl, T0);

    let (start, end) = fx.launch(&mut tl, FIRST_STREAM_ID, 1);
    let created = fx.driver.created_events();
    fx.driver.complete(start, T0 + 1);
    fx.driver.complete(end, T0 + 2);
    tl.reap_finished(&fx.reap_ctx(0)).unwrap();
    assert_eq!(tl.events.free_len(), 1);

    // The next launch reuses both the record and its driver events.
    let (start2, end2) = fx.launch(&mut tl, FIRST_STREAM_ID, 2);
    assert_eq!(start2, start);
    assert_eq!(end2, end);
    assert_eq!(fx.driver.created_events(), created);
    assert_eq!(tl.events.free_len(), 0);
}

#[test]
fn test_registry_assigns_dense_ids_from_reserved_base() {
    let mut registry = StreamRegistry::new();
    assert_eq!(registry.insert(StreamHandle(0)), Ok(FIRST_STREAM_ID));
    assert_eq!(registry.insert(StreamHandle(0xbeef)), Ok(FIRST_STREAM_ID + 1));
    assert_eq!(registry.lookup(StreamHandle(0)), Some(FIRST_STREAM_ID));
    assert_eq!(registry.lookup(StreamHandle(0xbeef)), Some(FIRST_STREAM_ID + 1));
    assert_eq!(registry.lookup(StreamHandle(0xdead)), None);
}

#[test]
fn test_registry_rejects_reinsertion() {
    let mut registry = StreamRegistry::new();
    registry.insert(StreamHandle(42)).unwrap();
    assert_eq!(registry.insert(StreamHandle(42)), Err(InsertError::Duplicate));
}

#[test]
fn test_registry_exhaustion() {
    let mut registry = StreamRegistry::new();
    for handle in 0..MAX_STREAMS as u64 {
        registry.insert(StreamHandle(handle)).unwrap();
    }
    assert_eq!(
        registry.insert(StreamHandle(u64::MAX)),
        Err(InsertError::Exhausted)
    );
}

#[test]
fn test_registry_remove_keeps_id_reserved() {
    let mut registry = StreamRegistry::new();
    for handle in 1..=10u64 {
        registry.insert(StreamHandle(handle)).unwrap();
    }
    assert_eq!(registry.remove(StreamHandle(5)), Some(FIRST_STREAM_ID + 4));
    assert_eq!(registry.lookup(StreamHandle(5)), None);
    for handle in (1..=10u64).filter(|&h| h != 5) {
        assert!(registry.lookup(StreamHandle(handle)).is_some());
    }
    // The freed handle maps to a fresh id, never the reserved one.
    assert_eq!(registry.insert(StreamHandle(5)), Ok(FIRST_STREAM_ID + 10));
}

#[test]
fn test_registry_post_order_visits_every_id_once() {
    let mut registry = StreamRegistry::new();
    for handle in [9u64, 3, 14, 1, 7, 20, 11] {
        registry.insert(StreamHandle(handle)).unwrap();
    }
    // Lookups reshape the splay tree; the walk must still see everything.
    registry.lookup(StreamHandle(14));
    registry.lookup(StreamHandle(1));
    let mut seen = Vec::new();
    registry.post_order(|id| seen.push(id));
    seen.sort_unstable();
    let expected: Vec<u32> = (0..7).map(|n| FIRST_STREAM_ID + n).collect();
    assert_eq!(seen, expected);
}

#[test]
fn test_retired_tail_push_keeps_ring_closed() {
    let fx = Fixture::new();
    let mut tl = DeviceTimeline::new();
    let sentinel = tl.retired.sentinel();
    assert!(tl.retired.is_empty());

    let a = tl
        .events
        .acquire(&*fx.driver, FIRST_STREAM_ID, CctNode(1), CctNode(1))
        .unwrap();
    let b = tl
        .events
        .acquire(&*fx.driver, FIRST_STREAM_ID, CctNode(2), CctNode(2))
        .unwrap();
    tl.events.get_mut(a).ref_count = 1;
    tl.events.get_mut(b).ref_count = 1;
    tl.retired.push(&mut tl.events, a);
    tl.retired.push(&mut tl.events, b);

    assert_eq!(tl.events.get(sentinel).next, a);
    assert_eq!(tl.events.get(a).next, b);
    assert_eq!(tl.events.get(b).next, sentinel);
    assert_eq!(tl.retired.tail(), b);
    assert_eq!(tl.retired_len(), 2);
}
