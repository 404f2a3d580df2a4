use thiserror::Error;

/// Opaque driver stream handle, as passed to the intercepted API.
///
/// The core never interprets the value beyond equality and ordering; the
/// null handle names the driver's implicit default stream.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct StreamHandle(pub u64);

impl StreamHandle {
    /// The driver's implicit default stream.
    pub const DEFAULT: StreamHandle = StreamHandle(0);
}

/// Opaque driver timestamp-event handle.
///
/// Handles are created by [`Driver::create_event`] and are never null.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct EventHandle(pub u64);

impl EventHandle {
    /// Placeholder for records that never held a driver event.
    pub(crate) const NULL: EventHandle = EventHandle(0);
}

/// Completion state of a recorded event, from a non-blocking query.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EventStatus {
    Ready,
    NotReady,
}

/// Direction of an intercepted memory copy.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CopyKind {
    HostToDevice,
    DeviceToHost,
}

/// A driver primitive failed.
///
/// The core treats any such failure during event bookkeeping as fatal:
/// with a missing or unreadable timestamp event there is no way to keep
/// blame attribution consistent, and silently misattributing is worse
/// than aborting. Status codes from the intercepted call itself are not
/// wrapped in this type; they pass through to the application unchanged.
#[derive(Error, Clone, Copy, Debug)]
#[error("gpu driver call {op} failed with status {status}")]
pub struct DriverError {
    pub op: &'static str,
    pub status: i32,
}

/// The minimum driver surface the blame-shift core needs.
///
/// The intercepted top-level API (launch, memcpy, synchronize, ...) is
/// *not* part of this trait: shims bracket a caller-supplied closure that
/// performs the real call through whatever binding the embedder resolved,
/// so driver status codes reach the application untouched. This trait only
/// covers the timestamp-event primitives the core issues on its own.
///
/// `query_event` must be the driver's non-blocking readiness check; the
/// reaper calls it with the device bookkeeping lock held.
pub trait Driver: Send + Sync {
    fn create_event(&self) -> Result<EventHandle, DriverError>;

    fn destroy_event(&self, event: EventHandle) -> Result<(), DriverError>;

    /// Enqueues `event` on `stream`; the driver timestamps it when the
    /// stream's preceding work completes.
    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> Result<(), DriverError>;

    fn query_event(&self, event: EventHandle) -> Result<EventStatus, DriverError>;

    /// Elapsed time between two completed events in milliseconds, at the
    /// driver's timer resolution (typically around half a microsecond).
    fn elapsed_ms(&self, start: EventHandle, end: EventHandle) -> Result<f32, DriverError>;
}
