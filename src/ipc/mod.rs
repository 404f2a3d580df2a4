//! Cross-process GPU-idle arbiter.
//!
//! Independent processes sharing one device must not each declare the GPU
//! idle while another keeps it busy. A fixed-size shared-memory block per
//! device holds a signed count of unretired launches, bumped on every
//! launch and dropped on retirement, machine-wide. No messages are passed;
//! the whole protocol is atomic adds on one word.


use std::ffi::CString;
use std::io::Result;
use std::mem::size_of;
use std::ptr::{addr_of_mut, null_mut};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::OnceLock;

use crate::ffi;

/// Shared-memory object name is this prefix followed by the device ordinal.
pub const SHM_PREFIX: &str = "/gpu_blame_";

/// The per-device shared block. Fresh objects are zero-filled by
/// `ftruncate`, which is exactly the initial state every field wants.
#[repr(C)]
struct IpcBlock {
    device: u32,
    _pad: u32,
    /// Unretired launches across all processes on this device. Signed so
    /// a racing decrement-before-increment shows up as a transient
    /// negative rather than a huge unsigned count.
    outstanding: i64,
    /// Reserved for future cross-process coordination; never taken.
    _lock: u32,
}

struct Shared(*mut IpcBlock);

// The mapping is shared between processes and lives for the lifetime of
// this one; all access goes through atomics on single words.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    fn outstanding(&self) -> &AtomicI64 {
        unsafe { AtomicI64::from_ptr(addr_of_mut!((*self.0).outstanding)) }
    }
}

/// Lazily opened handle to the device's [`IpcBlock`].
///
/// `open` runs once, at world-anchor setup. If the shared-memory object
/// cannot be created the arbiter stays empty and every query degrades to
/// per-process blaming. The mapping is never unmapped; process exit
/// releases it.
pub(crate) struct Arbiter {
    block: OnceLock<Option<Shared>>,
}

impl Arbiter {
    pub fn new() -> Self {
        Self {
            block: OnceLock::new(),
        }
    }

    pub fn open(&self, device: u32) {
        self.block.get_or_init(|| match map_block(device) {
            Ok(shared) => {
                log::debug!("shared blame block mapped for device {device}");
                Some(shared)
            }
            Err(e) => {
                log::warn!("cannot map shared blame block for device {device}: {e}; falling back to per-process blaming");
                None
            }
        });
    }

    fn get(&self) -> Option<&Shared> {
        self.block.get().and_then(Option::as_ref)
    }

    pub fn kernel_launched(&self) {
        if let Some(b) = self.get() {
            b.outstanding().fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn kernel_retired(&self) {
        if let Some(b) = self.get() {
            b.outstanding().fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Whether some process on the machine still has unretired work on
    /// this device. A single atomic load, usable from signal context.
    ///
    /// `false` when the block never opened: with no shared view of the
    /// device the core is blind to other processes and reports idleness
    /// from its own perspective.
    pub fn busy_elsewhere(&self) -> bool {
        match self.get() {
            Some(b) => b.outstanding().load(Ordering::SeqCst) > 0,
            None => false,
        }
    }

    #[cfg(test)]
    pub fn outstanding(&self) -> Option<i64> {
        self.get().map(|b| b.outstanding().load(Ordering::SeqCst))
    }

    /// Arbiter over a process-local block, for exercising the shared
    /// branch without touching `/dev/shm`.
    #[cfg(test)]
    pub fn with_local(outstanding: i64) -> Self {
        let block = Box::leak(Box::new(IpcBlock {
            device: 0,
            _pad: 0,
            outstanding,
            _lock: 0,
        }));
        let cell = OnceLock::new();
        let _ = cell.set(Some(Shared(block)));
        Self { block: cell }
    }
}

fn map_block(device: u32) -> Result<Shared> {
    let name = CString::new(format!("{SHM_PREFIX}{device}")).map_err(std::io::Error::other)?;
    let file = ffi::shm_open(
        &name,
        libc::O_RDWR | libc::O_CREAT,
        0o666,
    )?;
    ffi::ftruncate(&file, size_of::<IpcBlock>() as u64)?;
    let ptr = unsafe {
        ffi::mmap::<IpcBlock>(
            null_mut(),
            size_of::<IpcBlock>(),
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            &file,
            0,
        )
    }?;
    // Racing processes all stamp the same ordinal; the block itself is
    // zero-filled by the first ftruncate.
    unsafe { AtomicU32::from_ptr(addr_of_mut!((*ptr).device)) }.store(device, Ordering::SeqCst);
    Ok(Shared(ptr))
}
