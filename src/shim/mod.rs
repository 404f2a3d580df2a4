//! The interception surface.
//!
//! Each intercepted driver-API entry point is a method on [`Profiler`]
//! that brackets the *real* call, supplied by the embedder as a closure,
//! with the bookkeeping the blame-shift core needs. The closure's return
//! value (normally the driver's status code) is handed back untouched.
//!
//! Before touching the device state, every shim raises the thread-local
//! at-sync flag so a timer signal landing on this thread backs off
//! instead of re-entering the driver or spinning on a lock its own thread
//! holds. The flag is a scoped guard: it restores on unwind, so a panic
//! inside a real call cannot leave the thread unsampled forever.


use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::blame::{sampler, sync, StreamMask};
use crate::config::Opts;
use crate::driver::{CopyKind, Driver, DriverError, StreamHandle};
use crate::host::{CctNode, Hooks, MetricIds, MetricValue, RegContext};
use crate::ipc::Arbiter;
use crate::lock::Spinlock;
use crate::timeline::registry::{InsertError, StreamRegistry};
use crate::timeline::{DeviceTimeline, ReapCtx, WorldStart};

thread_local! {
    /// This thread is inside an intercepted driver call; the timer handler
    /// must not sample it.
    static AT_SYNC: Cell<bool> = const { Cell::new(false) };

    /// Stream stashed by the most recent `configure_call`, consumed by the
    /// following `kernel_launch`.
    static ACTIVE_STREAM: Cell<StreamHandle> = const { Cell::new(StreamHandle::DEFAULT) };
}

/// Scoped hold on the at-sync flag; nests.
struct SyncFlagGuard {
    prev: bool,
}

impl SyncFlagGuard {
    fn enter() -> Self {
        let prev = AT_SYNC.with(|flag| flag.replace(true));
        Self { prev }
    }
}

impl Drop for SyncFlagGuard {
    fn drop(&mut self) {
        let prev = self.prev;
        AT_SYNC.with(|flag| flag.set(prev));
    }
}

/// A driver bookkeeping primitive failed. There is no way to keep blame
/// attribution consistent past a lost timestamp event, and silently
/// misattributing is worse than dying.
fn fatal(e: DriverError) -> ! {
    log::error!("unrecoverable driver error in blame bookkeeping: {e}");
    std::process::abort();
}

/// The blame-shift core for one device.
///
/// One instance per process, created at profiler startup and installed
/// behind whatever handle the interception layer resolves its symbols
/// through. All shims are `&self`; internal state is behind the GPU
/// spinlock (bookkeeping) and a small mutex (the stream registry).
pub struct Profiler {
    driver: Arc<dyn Driver>,
    hooks: Hooks,
    opts: Opts,
    ids: MetricIds,
    timeline: Spinlock<DeviceTimeline>,
    registry: Mutex<StreamRegistry>,
    arbiter: Arbiter,
    /// Threads currently between sync prologue and epilogue.
    threads_at_sync: AtomicU64,
    live_threads: AtomicU64,
}

impl Profiler {
    /// Registers the blame metrics with the sink and returns an idle core;
    /// all device state is initialized lazily by the first shim.
    pub fn new(driver: Arc<dyn Driver>, hooks: Hooks, opts: Opts) -> Self {
        let ids = MetricIds::register(&*hooks.metrics);
        Self {
            driver,
            hooks,
            opts,
            ids,
            timeline: Spinlock::new(DeviceTimeline::new()),
            registry: Mutex::new(StreamRegistry::new()),
            arbiter: Arbiter::new(),
            threads_at_sync: AtomicU64::new(0),
            live_threads: AtomicU64::new(0),
        }
    }

    fn reap_ctx(&self) -> ReapCtx<'_> {
        ReapCtx {
            driver: &*self.driver,
            metrics: &*self.hooks.metrics,
            trace: &*self.hooks.trace,
            ids: &self.ids,
            arbiter: &self.arbiter,
            shared_blaming: self.opts.shared_blaming,
            device: self.opts.device,
            threads_at_sync: self.threads_at_sync.load(Ordering::Relaxed),
        }
    }

    /// Dense ID for `handle`, registering the stream on first sight. The
    /// lazy path covers the driver's implicit default stream, which no
    /// stream-create call ever announces.
    fn stream_id_of(&self, handle: StreamHandle) -> u32 {
        let _flag = SyncFlagGuard::enter();
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = registry.lookup(handle) {
            return id;
        }
        let id = match registry.insert(handle) {
            Ok(id) => id,
            Err(InsertError::Exhausted) => {
                log::error!("out of stream slots registering handle {:#x}", handle.0);
                std::process::abort();
            }
            // The lookup above ran under the same lock hold.
            Err(InsertError::Duplicate) => unreachable!("handle mapped while registry was locked"),
        };
        drop(registry);
        self.init_stream(id);
        id
    }

    /// First-sight stream setup: trace channel, and on the very first
    /// stream of the process the world-start anchor and the shared-blame
    /// block.
    fn init_stream(&self, id: u32) {
        log::debug!("stream registered as id {id}");
        let channel = self.hooks.trace.open(self.opts.device, id);
        let mut tl = self.timeline.lock();
        self.ensure_world(&mut tl);
        tl.streams[DeviceTimeline::slot_index(id)].channel = Some(channel);
    }

    fn ensure_world(&self, tl: &mut DeviceTimeline) {
        if tl.world.is_some() {
            return;
        }
        // No need to wait for the anchor event: only events recorded after
        // it are ever queried, and they complete after it does.
        let event = self.driver.create_event().unwrap_or_else(|e| fatal(e));
        let epoch_us = self.hooks.clock.now_us();
        self.driver
            .record_event(event, StreamHandle::DEFAULT)
            .unwrap_or_else(|e| fatal(e));
        tl.world = Some(WorldStart { event, epoch_us });
        log::debug!("world-start anchor at {epoch_us} us");
        if self.opts.shared_blaming {
            self.arbiter.open(self.opts.device);
        }
    }

    /// Stream-create shim: run the real call, then register the new
    /// handle.
    pub fn stream_create<T>(&self, handle: StreamHandle, real: impl FnOnce() -> T) -> T {
        let ret = {
            let _flag = SyncFlagGuard::enter();
            real()
        };
        self.stream_id_of(handle);
        ret
    }

    /// Stream-destroy shim: drain whatever finished, close the stream's
    /// trace channel, run the real call, unlink the handle. The dense ID
    /// stays reserved for the rest of the run.
    pub fn stream_destroy<T>(&self, handle: StreamHandle, real: impl FnOnce() -> T) -> T {
        let _flag = SyncFlagGuard::enter();
        let cx = self.reap_ctx();
        {
            let mut tl = self.timeline.lock();
            tl.reap_finished(&cx).unwrap_or_else(|e| fatal(e));
        }
        let id = {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry.lookup(handle)
        };
        if let Some(id) = id {
            let channel = {
                let mut tl = self.timeline.lock();
                tl.streams[DeviceTimeline::slot_index(id)].channel.take()
            };
            if let Some(channel) = channel {
                self.hooks.trace.close(channel, self.opts.device, id);
            }
        }
        let ret = real();
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.remove(handle);
        log::debug!("stream {:#x} destroyed", handle.0);
        ret
    }

    /// Launch-configuration shim: stashes the stream the next launch will
    /// target, creating the default stream's slot on its first use.
    pub fn configure_call<T>(&self, stream: StreamHandle, real: impl FnOnce() -> T) -> T {
        let ret = {
            let _flag = SyncFlagGuard::enter();
            real()
        };
        ACTIVE_STREAM.with(|active| active.set(stream));
        self.stream_id_of(stream);
        ret
    }

    /// Kernel-launch shim targeting the stream stashed by
    /// [`configure_call`][Self::configure_call].
    pub fn kernel_launch<T>(&self, ctx: RegContext, real: impl FnOnce() -> T) -> T {
        let stream = ACTIVE_STREAM.with(|active| active.get());
        self.launch_on(stream, ctx, self.opts.launch_skip_inner, None, real)
    }

    /// Kernel-launch shim for API flavors that carry the stream in their
    /// argument list.
    pub fn kernel_launch_on<T>(
        &self,
        stream: StreamHandle,
        ctx: RegContext,
        real: impl FnOnce() -> T,
    ) -> T {
        self.launch_on(stream, ctx, self.opts.launch_skip_inner, None, real)
    }

    /// Asynchronous-memcpy shim: launch bracketing plus a transfer-volume
    /// credit at the copy site.
    pub fn memcpy_async<T>(
        &self,
        stream: StreamHandle,
        bytes: u64,
        kind: CopyKind,
        ctx: RegContext,
        real: impl FnOnce() -> T,
    ) -> T {
        self.launch_on(stream, ctx, 0, Some((bytes, kind)), real)
    }

    fn launch_on<T>(
        &self,
        stream: StreamHandle,
        ctx: RegContext,
        skip_inner: u32,
        copy: Option<(u64, CopyKind)>,
        real: impl FnOnce() -> T,
    ) -> T {
        let stream_id = self.stream_id_of(stream);
        // The lock is held across the real call so no other GPU work gets
        // reordered between the event records that bracket it.
        let mut tl = self.timeline.lock();
        let _flag = SyncFlagGuard::enter();
        let launcher =
            self.hooks
                .sampler
                .sample_callpath(ctx, self.ids.cpu_idle, 0, skip_inner, true);
        let channel = tl.streams[DeviceTimeline::slot_index(stream_id)].channel;
        let stream_launcher = match channel {
            Some(channel) => self
                .hooks
                .sampler
                .duplicate_to_stream(channel, ctx, launcher),
            None => launcher,
        };
        let event = tl
            .append_launch(&*self.driver, stream_id, launcher, stream_launcher)
            .unwrap_or_else(|e| fatal(e));
        let (start_event, end_event) = {
            let rec = tl.events.get(event);
            (rec.start_event, rec.end_event)
        };
        self.driver
            .record_event(start_event, stream)
            .unwrap_or_else(|e| fatal(e));
        if self.opts.shared_blaming {
            self.arbiter.kernel_launched();
        }
        let ret = real();
        self.driver
            .record_event(end_event, stream)
            .unwrap_or_else(|e| fatal(e));
        if let Some((bytes, kind)) = copy {
            let metric = match kind {
                CopyKind::HostToDevice => self.ids.h_to_d_bytes,
                CopyKind::DeviceToHost => self.ids.d_to_h_bytes,
            };
            self.hooks.metrics.add(metric, launcher, MetricValue::Int(bytes));
        }
        ret
    }

    /// Device-wide synchronization shim.
    pub fn sync_device<T>(&self, ctx: RegContext, real: impl FnOnce() -> T) -> T {
        self.sync_shim(ctx, None, |_| StreamMask::ALL, real)
    }

    /// Event-synchronization shim. The event may sit on any stream, so the
    /// wait is accounted against all of them.
    pub fn sync_event<T>(&self, ctx: RegContext, real: impl FnOnce() -> T) -> T {
        self.sync_shim(ctx, None, |_| StreamMask::ALL, real)
    }

    /// Stream-scoped synchronization shim.
    pub fn sync_stream<T>(
        &self,
        stream: StreamHandle,
        ctx: RegContext,
        real: impl FnOnce() -> T,
    ) -> T {
        self.sync_shim(ctx, None, move |p| p.mask_of(stream), real)
    }

    /// Stream-wait-event shim; blocks the calling thread like a
    /// stream-scoped sync and is blamed the same way.
    pub fn stream_wait_event<T>(
        &self,
        stream: StreamHandle,
        ctx: RegContext,
        real: impl FnOnce() -> T,
    ) -> T {
        self.sync_shim(ctx, None, move |p| p.mask_of(stream), real)
    }

    /// Synchronous-memcpy shim. No event bracketing: the copy blocks the
    /// host, so the sync window itself is what the user blames, plus the
    /// transfer-volume credit.
    pub fn memcpy_sync<T>(
        &self,
        bytes: u64,
        kind: CopyKind,
        ctx: RegContext,
        real: impl FnOnce() -> T,
    ) -> T {
        self.sync_shim(ctx, Some((bytes, kind)), |_| StreamMask::ALL, real)
    }

    /// Passthrough for intercepted calls that need reentrancy suppression
    /// but no accounting (allocator entry points, raw event APIs).
    pub fn with_sync_flag<T>(&self, real: impl FnOnce() -> T) -> T {
        let _flag = SyncFlagGuard::enter();
        real()
    }

    fn mask_of(&self, stream: StreamHandle) -> StreamMask {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        match registry.lookup(stream) {
            Some(id) => StreamMask::only(id),
            None => StreamMask::NONE,
        }
    }

    fn sync_shim<T>(
        &self,
        ctx: RegContext,
        copy: Option<(u64, CopyKind)>,
        mask_of: impl FnOnce(&Self) -> StreamMask,
        real: impl FnOnce() -> T,
    ) -> T {
        let launcher = self
            .hooks
            .sampler
            .sample_callpath(ctx, self.ids.cpu_idle, 0, 0, true);
        let _flag = SyncFlagGuard::enter();
        let window = {
            let cx = self.reap_ctx();
            let mut tl = self.timeline.lock();
            sync::enter_sync(&mut tl, &cx, &*self.hooks.clock, &self.threads_at_sync)
                .unwrap_or_else(|e| fatal(e))
        };
        let ret = real();
        // Resolved after the real call: a stream created concurrently with
        // the wait is mapped by now.
        let mask = mask_of(self);
        let last_kernel_end_us = {
            let cx = self.reap_ctx();
            let mut tl = self.timeline.lock();
            sync::leave_sync(&mut tl, &cx, &window, mask, &self.threads_at_sync)
                .unwrap_or_else(|e| fatal(e))
        };
        let end_us = self.hooks.clock.now_us();
        let (cpu_idle, gpu_idle) = sync::idle_buckets(window.start_us, end_us, last_kernel_end_us);
        self.hooks
            .metrics
            .add(self.ids.cpu_idle, launcher, MetricValue::Int(cpu_idle));
        self.hooks
            .metrics
            .add(self.ids.gpu_idle, launcher, MetricValue::Int(gpu_idle));
        if let Some((bytes, kind)) = copy {
            let metric = match kind {
                CopyKind::HostToDevice => self.ids.h_to_d_bytes,
                CopyKind::DeviceToHost => self.ids.d_to_h_bytes,
            };
            self.hooks.metrics.add(metric, launcher, MetricValue::Int(bytes));
        }
        ret
    }

    /// Timer-handler entry point, called from signal context with the
    /// unwound CPU node and the wall-clock increment.
    ///
    /// Never blocks: bails out if this thread is inside an intercepted
    /// call, and only tries the GPU lock. A missed sample is the
    /// collaborator's dropped-sample counter's problem, not ours.
    pub fn timer_sample(&self, node: CctNode, cur_time_us: u64, delta_us: u64) {
        if AT_SYNC.with(|flag| flag.get()) {
            return;
        }
        let cx = self.reap_ctx();
        let Some(mut tl) = self.timeline.try_lock() else {
            return;
        };
        sampler::classify_sample(&mut tl, &cx, node, cur_time_us, delta_us)
            .unwrap_or_else(|e| fatal(e));
    }

    pub fn thread_init(&self) {
        self.live_threads.fetch_add(1, Ordering::Relaxed);
    }

    /// Last thread out drains the device and finalizes every stream's
    /// trace channel.
    pub fn thread_fini(&self) {
        if self.live_threads.fetch_sub(1, Ordering::Relaxed) != 1 {
            return;
        }
        let _flag = SyncFlagGuard::enter();
        let cx = self.reap_ctx();
        {
            let mut tl = self.timeline.lock();
            tl.reap_finished(&cx).unwrap_or_else(|e| fatal(e));
        }
        self.close_all();
    }

    /// Finalizes every live stream's trace channel, in post order over the
    /// registry.
    pub fn close_all(&self) {
        let ids = {
            let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            let mut ids = Vec::new();
            registry.post_order(|id| ids.push(id));
            ids
        };
        let mut channels = Vec::with_capacity(ids.len());
        {
            let mut tl = self.timeline.lock();
            for &id in &ids {
                if let Some(channel) = tl.streams[DeviceTimeline::slot_index(id)].channel.take() {
                    channels.push((channel, id));
                }
            }
        }
        for (channel, id) in channels {
            self.hooks.trace.close(channel, self.opts.device, id);
        }
    }

    /// Context-destroy shim: drain, close every stream, destroy all driver
    /// events (the anchor and the pooled pairs) and reset, so a later
    /// first shim re-anchors from scratch.
    pub fn teardown<T>(&self, real: impl FnOnce() -> T) -> T {
        let _flag = SyncFlagGuard::enter();
        let cx = self.reap_ctx();
        {
            let mut tl = self.timeline.lock();
            tl.reap_finished(&cx).unwrap_or_else(|e| fatal(e));
        }
        self.close_all();
        {
            let mut tl = self.timeline.lock();
            if let Some(world) = tl.world.take() {
                self.driver
                    .destroy_event(world.event)
                    .unwrap_or_else(|e| fatal(e));
            }
            tl.events
                .destroy_driver_events(&*self.driver)
                .unwrap_or_else(|e| fatal(e));
            *tl = DeviceTimeline::new();
        }
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        log::debug!("device context torn down");
        real()
    }
}
