//! The shared-blame engine.
//!
//! When a blocking call returns, the events that completed during the wait
//! sit on the retired tail. This pass walks them from the waiter's
//! snapshot cursor, keeps the ones that overlap the wait window on masked
//! streams, lays their start/end instants out on a sorted circular list,
//! and sweeps that list once: each interval of the window is charged in
//! equal fractions to every kernel active during it. The sweep also yields
//! the latest kernel end observed, which the epilogue uses to split the
//! wait into CPU-idle and GPU-idle.

use super::StreamMask;
use crate::host::{MetricIds, MetricSink, MetricValue};
use crate::timeline::pool::{Idx, MarkKind, MarkPool, NIL};
use crate::timeline::DeviceTimeline;

/// Walks the retired tail from `cursor`, credits idle-cause, and returns
/// the latest kernel end time within the window (0 when no kernel was
/// active). Drops this walker's refcount holds as it goes and unlinks
/// records nobody else needs.
pub(crate) fn attribute_shared_blame(
    tl: &mut DeviceTimeline,
    metrics: &dyn MetricSink,
    ids: &MetricIds,
    cursor: Idx,
    window_start_us: u64,
    mask: StreamMask,
) -> u64 {
    let sentinel = tl.retired.sentinel();

    // Undo the hold the prologue took on the snapshot cursor.
    if cursor != sentinel {
        tl.events.get_mut(cursor).ref_count -= 1;
    }

    // Head of the sorted circular list of kernel marks; NIL while empty.
    let mut begin: Idx = NIL;

    let mut prev = cursor;
    let mut cur = tl.events.get(cursor).next;
    while cur != sentinel {
        // Records already drained by every walker just need unlinking.
        if tl.events.get(cur).ref_count == 0 {
            let next = tl.events.get(cur).next;
            tl.events.get_mut(prev).next = next;
            tl.events.release(cur);
            cur = next;
            continue;
        }
        tl.events.get_mut(cur).ref_count -= 1;

        let (ev_start, ev_end, ev_stream, ev_launcher) = {
            let rec = tl.events.get(cur);
            (
                rec.start_time_us,
                rec.end_time_us,
                rec.stream_id,
                rec.launcher,
            )
        };
        let in_window = ev_end > window_start_us && mask.contains(ev_stream);
        let clamped_start = ev_start.max(window_start_us);
        if in_window && clamped_start != ev_end {
            let start_mark = tl.marks.acquire();
            {
                let mark = tl.marks.get_mut(start_mark);
                mark.time_us = clamped_start;
                mark.kind = MarkKind::Start;
                mark.stream_id = ev_stream;
                mark.launcher = ev_launcher;
                mark.start = NIL;
            }
            let end_mark = tl.marks.acquire();
            {
                let mark = tl.marks.get_mut(end_mark);
                mark.time_us = ev_end;
                mark.kind = MarkKind::End;
                mark.stream_id = ev_stream;
                mark.start = start_mark;
            }
            if begin == NIL {
                let marks = &mut tl.marks;
                marks.get_mut(start_mark).next = end_mark;
                marks.get_mut(start_mark).prev = end_mark;
                marks.get_mut(end_mark).next = start_mark;
                marks.get_mut(end_mark).prev = start_mark;
                begin = start_mark;
            } else {
                begin = insert_sorted(&mut tl.marks, begin, end_mark);
                begin = insert_sorted(&mut tl.marks, begin, start_mark);
            }
        }

        let next = tl.events.get(cur).next;
        if tl.events.get(cur).ref_count == 0 {
            tl.events.get_mut(prev).next = next;
            tl.events.release(cur);
        } else {
            prev = cur;
        }
        cur = next;
    }
    tl.retired.set_tail(prev);

    sweep(tl, metrics, ids, begin, window_start_us)
}

/// Inserts `node` into the sorted ring, scanning backward from the last
/// mark and placing it right after the first strictly-smaller time, so an
/// equal-time mark lands ahead of the existing run. Returns the (possibly
/// new) head.
fn insert_sorted(marks: &mut MarkPool, begin: Idx, node: Idx) -> Idx {
    let time = marks.get(node).time_us;
    let last = marks.get(begin).prev;
    let mut cur = last;
    let mut at_front = true;
    loop {
        if time > marks.get(cur).time_us {
            at_front = false;
            break;
        }
        cur = marks.get(cur).prev;
        if cur == last {
            break;
        }
    }
    let next = marks.get(cur).next;
    marks.get_mut(node).next = next;
    marks.get_mut(node).prev = cur;
    marks.get_mut(next).prev = node;
    marks.get_mut(cur).next = node;
    if at_front {
        node
    } else {
        begin
    }
}

/// One pass over the sorted ring: splits every interval with active
/// kernels among them, retiring mark pairs as their END goes by.
fn sweep(
    tl: &mut DeviceTimeline,
    metrics: &dyn MetricSink,
    ids: &MetricIds,
    mut begin: Idx,
    window_start_us: u64,
) -> u64 {
    let mut last_kernel_end_us = 0u64;
    if begin == NIL {
        return last_kernel_end_us;
    }

    // Dummy tail so the walk has a stop node that is never processed.
    let dummy = {
        let dummy = tl.marks.acquire();
        let last = tl.marks.get(begin).prev;
        let marks = &mut tl.marks;
        marks.get_mut(dummy).kind = MarkKind::End;
        marks.get_mut(dummy).time_us = 0;
        marks.get_mut(dummy).start = NIL;
        marks.get_mut(dummy).next = begin;
        marks.get_mut(dummy).prev = last;
        marks.get_mut(last).next = dummy;
        marks.get_mut(begin).prev = dummy;
        dummy
    };

    let mut num_active = 0u32;
    let mut last_time = window_start_us;
    let mut cur = begin;
    loop {
        let time = tl.marks.get(cur).time_us;
        debug_assert!(time >= last_time);

        if num_active > 0 && time > last_time {
            let share = (time - last_time) as f64 / num_active as f64;
            // Every mark still linked before `cur` is an open START.
            let stop = tl.marks.get(begin).prev;
            let mut blame = tl.marks.get(cur).prev;
            loop {
                debug_assert_eq!(tl.marks.get(blame).kind, MarkKind::Start);
                metrics.add(
                    ids.cpu_idle_cause,
                    tl.marks.get(blame).launcher,
                    MetricValue::Real(share),
                );
                blame = tl.marks.get(blame).prev;
                if blame == stop {
                    break;
                }
            }
        }
        last_time = time;

        match tl.marks.get(cur).kind {
            MarkKind::Start => {
                num_active += 1;
                cur = tl.marks.get(cur).next;
            }
            MarkKind::End => {
                last_kernel_end_us = time;
                let start = tl.marks.get(cur).start;
                unlink(&mut tl.marks, start);
                if start == begin {
                    begin = tl.marks.get(start).next;
                }
                tl.marks.release(start);
                let next = tl.marks.get(cur).next;
                unlink(&mut tl.marks, cur);
                if cur == begin {
                    begin = next;
                }
                tl.marks.release(cur);
                num_active -= 1;
                cur = next;
            }
        }
        if cur == tl.marks.get(begin).prev {
            break;
        }
    }
    tl.marks.release(dummy);
    debug_assert_eq!(tl.marks.in_use(), 0);
    last_kernel_end_us
}

fn unlink(marks: &mut MarkPool, node: Idx) {
    let prev = marks.get(node).prev;
    let next = marks.get(node).next;
    marks.get_mut(prev).next = next;
    marks.get_mut(next).prev = prev;
}
