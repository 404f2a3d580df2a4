//! Per-device event timelines.
//!
//! Everything a device's bookkeeping needs under the GPU lock lives in one
//! [`DeviceTimeline`]: the slab pools, the per-stream in-flight queues,
//! the global unfinished-streams list, the retired tail and the
//! world-start anchor. All links between records are pool indices.

pub(crate) mod pool;
pub(crate) mod registry;
pub(crate) mod retired;

#[cfg(test)]
mod test;

use pool::{EventPool, Idx, MarkPool, NIL};
use registry::{FIRST_STREAM_ID, MAX_STREAMS};
use retired::RetiredTail;

use crate::driver::{Driver, DriverError, EventHandle, EventStatus};
use crate::host::{ChannelId, MetricIds, MetricSink, MetricValue, TraceEntry, TraceSink};
use crate::ipc::Arbiter;

/// The `(driver event, CPU microseconds)` pair recorded once, on the
/// default stream, when the first stream is observed. Driver-relative
/// elapsed times are converted to CPU-epoch microseconds against it.
#[derive(Clone, Copy)]
pub(crate) struct WorldStart {
    pub event: EventHandle,
    pub epoch_us: u64,
}

impl WorldStart {
    /// CPU-epoch microseconds at which `event` completed.
    pub fn timestamp(&self, driver: &dyn Driver, event: EventHandle) -> Result<u64, DriverError> {
        let elapsed_ms = driver.elapsed_ms(self.event, event)?;
        Ok(self.epoch_us + (elapsed_ms as f64 * 1000.0).round() as u64)
    }
}

/// One dense stream slot. Slots are never freed; a destroyed stream keeps
/// its slot (and ID) for the rest of the run.
pub(crate) struct StreamSlot {
    /// Ordered in-flight queue, oldest first.
    pub in_flight_head: Idx,
    pub in_flight_tail: Idx,
    /// Link in the unfinished-streams list, valid while on it. A slot is
    /// on that list iff `in_flight_head != NIL`.
    pub next_unfinished: u32,
    /// Trace side-channel, open while the stream is live.
    pub channel: Option<ChannelId>,
}

impl StreamSlot {
    fn new() -> Self {
        Self {
            in_flight_head: NIL,
            in_flight_tail: NIL,
            next_unfinished: NIL,
            channel: None,
        }
    }
}

/// Everything the reaper and the blame engine need besides the timeline
/// itself, borrowed from the profiler for the duration of one locked pass.
pub(crate) struct ReapCtx<'a> {
    pub driver: &'a dyn Driver,
    pub metrics: &'a dyn MetricSink,
    pub trace: &'a dyn TraceSink,
    pub ids: &'a MetricIds,
    pub arbiter: &'a Arbiter,
    pub shared_blaming: bool,
    pub device: u32,
    /// Threads currently between their sync prologue and epilogue; decides
    /// whether a finished event is freed or deferred for blame.
    pub threads_at_sync: u64,
}

pub(crate) struct DeviceTimeline {
    pub events: EventPool,
    pub marks: MarkPool,
    pub streams: Vec<StreamSlot>,
    /// Head of the list of streams with at least one in-flight event,
    /// as slot indices.
    pub unfinished_head: u32,
    pub retired: RetiredTail,
    pub world: Option<WorldStart>,
    /// Reap cache for the sampler: when the last reap is recent relative
    /// to the sample period, its result is reused instead of re-querying
    /// the driver.
    pub last_reap_us: u64,
    pub last_unfinished: u32,
}

impl DeviceTimeline {
    pub fn new() -> Self {
        let mut events = EventPool::new();
        let retired = RetiredTail::new(&mut events);
        let mut streams = Vec::with_capacity(MAX_STREAMS);
        streams.resize_with(MAX_STREAMS, StreamSlot::new);
        Self {
            events,
            marks: MarkPool::new(),
            streams,
            unfinished_head: NIL,
            retired,
            world: None,
            last_reap_us: 0,
            last_unfinished: 0,
        }
    }

    pub fn slot_index(stream_id: u32) -> usize {
        debug_assert!(stream_id >= FIRST_STREAM_ID);
        (stream_id - FIRST_STREAM_ID) as usize
    }

    /// Allocates an event record for a launch and appends it to the
    /// stream's in-flight queue, putting the stream on the unfinished list
    /// if this is its first in-flight event. The caller records the start
    /// and end driver events around the real call.
    pub fn append_launch(
        &mut self,
        driver: &dyn Driver,
        stream_id: u32,
        launcher: crate::host::CctNode,
        stream_launcher: crate::host::CctNode,
    ) -> Result<Idx, DriverError> {
        let event = self
            .events
            .acquire(driver, stream_id, launcher, stream_launcher)?;
        let slot_idx = Self::slot_index(stream_id);
        let slot = &mut self.streams[slot_idx];
        if slot.in_flight_head == NIL {
            slot.in_flight_head = event;
            slot.in_flight_tail = event;
            slot.next_unfinished = self.unfinished_head;
            self.unfinished_head = slot_idx as u32;
        } else {
            let tail = slot.in_flight_tail;
            self.events.get_mut(tail).next = event;
            slot.in_flight_tail = event;
        }
        Ok(event)
    }

    /// Retires every completed in-flight event and returns the number of
    /// streams still holding work.
    ///
    /// Per stream the walk stops at the first not-ready event: events on a
    /// stream complete in submission order, so nothing later can be ready.
    /// A retired event is either deferred on the retired tail (when
    /// threads are blocked in a sync and will want to blame it) or goes
    /// straight back to the pool.
    pub fn reap_finished(&mut self, cx: &ReapCtx) -> Result<u32, DriverError> {
        let world = match self.world {
            Some(world) => world,
            None => return Ok(0),
        };
        let trace_active = cx.trace.is_active();
        let mut unfinished = 0u32;
        let mut prev_stream = NIL;
        let mut cur_stream = self.unfinished_head;
        while cur_stream != NIL {
            let next_stream = self.streams[cur_stream as usize].next_unfinished;
            let stream_id = FIRST_STREAM_ID + cur_stream;
            let channel = self.streams[cur_stream as usize].channel;
            let mut event = self.streams[cur_stream as usize].in_flight_head;
            while event != NIL {
                let end_event = self.events.get(event).end_event;
                if cx.driver.query_event(end_event)? == EventStatus::NotReady {
                    break;
                }
                if cx.shared_blaming {
                    cx.arbiter.kernel_retired();
                }
                let (start_event, launcher, stream_launcher) = {
                    let rec = self.events.get(event);
                    (rec.start_event, rec.launcher, rec.stream_launcher)
                };
                let start_us = world.timestamp(cx.driver, start_event)?;
                let end_us = world.timestamp(cx.driver, end_event)?;
                if trace_active {
                    if let Some(channel) = channel {
                        let kernel = TraceEntry::Kernel(stream_launcher);
                        let dev = cx.device;
                        cx.trace
                            .append(channel, dev, stream_id, TraceEntry::Idle, start_us - 1);
                        cx.trace.append(channel, dev, stream_id, kernel, start_us);
                        cx.trace.append(channel, dev, stream_id, kernel, end_us);
                        cx.trace
                            .append(channel, dev, stream_id, TraceEntry::Idle, end_us + 1);
                    }
                }
                cx.metrics.add(
                    cx.ids.gpu_activity,
                    launcher,
                    MetricValue::Int(end_us - start_us),
                );
                let next_event = self.events.get(event).next;
                if cx.threads_at_sync > 0 {
                    let rec = self.events.get_mut(event);
                    rec.ref_count = cx.threads_at_sync as u32;
                    rec.start_time_us = start_us;
                    rec.end_time_us = end_us;
                    self.retired.push(&mut self.events, event);
                } else {
                    self.events.release(event);
                }
                event = next_event;
            }
            self.streams[cur_stream as usize].in_flight_head = event;
            if event == NIL {
                self.streams[cur_stream as usize].in_flight_tail = NIL;
                if prev_stream == NIL {
                    self.unfinished_head = next_stream;
                } else {
                    self.streams[prev_stream as usize].next_unfinished = next_stream;
                }
            } else {
                unfinished += 1;
                prev_stream = cur_stream;
            }
            cur_stream = next_stream;
        }
        self.last_unfinished = unfinished;
        Ok(unfinished)
    }

    #[cfg(test)]
    pub fn unfinished_list_len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.unfinished_head;
        while cur != NIL {
            n += 1;
            cur = self.streams[cur as usize].next_unfinished;
        }
        n
    }

    #[cfg(test)]
    pub fn in_flight_len(&self, stream_id: u32) -> usize {
        let mut n = 0;
        let mut cur = self.streams[Self::slot_index(stream_id)].in_flight_head;
        while cur != NIL {
            n += 1;
            cur = self.events.get(cur).next;
        }
        n
    }

    #[cfg(test)]
    pub fn retired_len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.events.get(self.retired.sentinel()).next;
        while cur != self.retired.sentinel() {
            n += 1;
            cur = self.events.get(cur).next;
        }
        n
    }
}
