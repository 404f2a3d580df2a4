use std::ffi::CStr;
use std::fs::File;
use std::io::{Error, Result};
use std::os::fd::{AsRawFd, FromRawFd};

pub fn shm_open(name: &CStr, oflag: i32, mode: u32) -> Result<File> {
    let fd = unsafe { libc::shm_open(name.as_ptr(), oflag, mode as libc::mode_t) };
    if fd != -1 {
        Ok(unsafe { File::from_raw_fd(fd) })
    } else {
        Err(Error::last_os_error())
    }
}

pub fn ftruncate(file: &File, len: u64) -> Result<()> {
    let result = unsafe { libc::ftruncate(file.as_raw_fd(), len as libc::off_t) };
    if result != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub unsafe fn mmap<T>(
    ptr: *mut (),
    len: usize,
    prot: i32,
    flags: i32,
    file: &File,
    offset: i64,
) -> Result<*mut T> {
    let ptr = libc::mmap(ptr as _, len, prot, flags, file.as_raw_fd(), offset);
    if ptr != libc::MAP_FAILED {
        Ok(ptr as _)
    } else {
        Err(Error::last_os_error())
    }
}

pub fn gettimeofday_us() -> Result<u64> {
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    let result = unsafe { libc::gettimeofday(&mut tv, std::ptr::null_mut()) };
    if result != -1 {
        Ok(tv.tv_usec as u64 + tv.tv_sec as u64 * 1_000_000)
    } else {
        Err(Error::last_os_error())
    }
}
