//! Sample classification for the timer handler.
//!
//! Runs in signal context under the GPU lock, so it only issues
//! non-blocking driver queries, and skips even those when a recent reap
//! already answered the only question that matters here: is anything
//! still running?

use crate::driver::DriverError;
use crate::host::{CctNode, MetricValue};
use crate::timeline::pool::NIL;
use crate::timeline::{DeviceTimeline, ReapCtx};

/// Credits one timer tick of `delta_us` to overlap, GPU-idle, or nobody.
pub(crate) fn classify_sample(
    tl: &mut DeviceTimeline,
    cx: &ReapCtx,
    node: CctNode,
    cur_time_us: u64,
    delta_us: u64,
) -> Result<(), DriverError> {
    // Reuse the cached reap when it is younger than half a sample period;
    // staleness is then bounded well under one tick.
    let unfinished = if cur_time_us.saturating_sub(tl.last_reap_us) < delta_us / 2 {
        tl.last_unfinished
    } else {
        let unfinished = tl.reap_finished(cx)?;
        tl.last_reap_us = cur_time_us;
        unfinished
    };

    if unfinished > 0 {
        // Both processors are busy. The tick is overlap on the CPU side,
        // and an equal share of overlap for each stream's oldest running
        // kernel on the GPU side.
        cx.metrics
            .add(cx.ids.cpu_overlap, node, MetricValue::Real(delta_us as f64));
        let share = delta_us as f64 / unfinished as f64;
        let mut stream = tl.unfinished_head;
        while stream != NIL {
            let slot = &tl.streams[stream as usize];
            let oldest = slot.in_flight_head;
            if oldest != NIL {
                cx.metrics.add(
                    cx.ids.gpu_overlap,
                    tl.events.get(oldest).launcher,
                    MetricValue::Real(share),
                );
            }
            stream = slot.next_unfinished;
        }
    } else if !cx.shared_blaming || !cx.arbiter.busy_elsewhere() {
        // Nothing of ours is running. Unless another process is keeping
        // the device busy, this site failed to feed the GPU.
        cx.metrics
            .add(cx.ids.gpu_idle, node, MetricValue::Int(delta_us));
    }
    Ok(())
}
