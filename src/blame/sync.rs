//! The two halves of a blocking-call bracket.
//!
//! Every intercepted synchronization runs `enter_sync`, the real driver
//! call, then `leave_sync`, with the GPU lock taken around each half but
//! never across the real call. The prologue's retired-tail snapshot pins
//! the exact set of events this thread may blame: everything that retires
//! after the snapshot and before the epilogue walk.

use std::sync::atomic::{AtomicU64, Ordering};

use super::{engine, StreamMask};
use crate::driver::DriverError;
use crate::host::Clock;
use crate::timeline::pool::Idx;
use crate::timeline::{DeviceTimeline, ReapCtx};

/// A thread's open sync window: where its wait started and which retired
/// events predate it.
pub(crate) struct SyncWindow {
    pub cursor: Idx,
    pub start_us: u64,
}

/// Prologue half: drain what already finished (so the snapshot only pins
/// events completing during the wait), stamp the start, pin the cursor,
/// and announce this thread to the retirement path.
pub(crate) fn enter_sync(
    tl: &mut DeviceTimeline,
    cx: &ReapCtx,
    clock: &dyn Clock,
    threads_at_sync: &AtomicU64,
) -> Result<SyncWindow, DriverError> {
    tl.reap_finished(cx)?;
    let start_us = clock.now_us();
    let cursor = tl.retired.tail();
    if cursor != tl.retired.sentinel() {
        // Keep the cursor record alive until this thread's epilogue walk.
        tl.events.get_mut(cursor).ref_count += 1;
    }
    threads_at_sync.fetch_add(1, Ordering::Relaxed);
    Ok(SyncWindow { cursor, start_us })
}

/// Epilogue half: retire what completed during the wait, then redistribute
/// the window across the kernels seen active on masked streams. Returns
/// the latest kernel end observed (0 when none was).
pub(crate) fn leave_sync(
    tl: &mut DeviceTimeline,
    cx: &ReapCtx,
    window: &SyncWindow,
    mask: StreamMask,
    threads_at_sync: &AtomicU64,
) -> Result<u64, DriverError> {
    tl.reap_finished(cx)?;
    let last_kernel_end_us = engine::attribute_shared_blame(
        tl,
        cx.metrics,
        cx.ids,
        window.cursor,
        window.start_us,
        mask,
    );
    threads_at_sync.fetch_sub(1, Ordering::Relaxed);
    Ok(last_kernel_end_us)
}

/// Splits a finished wait into `(cpu_idle, gpu_idle)` microseconds.
///
/// No kernel observed means the host blocked on nothing: the whole window
/// is GPU idleness. Otherwise the CPU was legitimately waiting until the
/// last kernel end (clamped into the window), and anything after that is
/// GPU idleness on the blocking site's account.
pub(crate) fn idle_buckets(start_us: u64, end_us: u64, last_kernel_end_us: u64) -> (u64, u64) {
    if last_kernel_end_us == 0 {
        (0, end_us.saturating_sub(start_us))
    } else {
        let last = last_kernel_end_us.min(end_us);
        (last.saturating_sub(start_us), end_us.saturating_sub(last))
    }
}
