//! Thin typed wrapper over jemalloc's `mallctl` namespace.
//!
//! Reads and writes operate on fixed-size scalar values; the raw status code
//! of every failed call is preserved in the returned [`AllocatorError`].

use std::ffi::CString;
use std::mem::{self, MaybeUninit};
use std::ptr;

use libc::{c_void, size_t};
use tikv_jemalloc_sys::mallctl;

use crate::error::AllocatorError;

/// Read a fixed-size value.
pub(crate) fn read<T: Copy>(name: &str) -> Result<T, AllocatorError> {
    let cname = cstring(name)?;
    let mut value = MaybeUninit::<T>::uninit();
    let mut len: size_t = mem::size_of::<T>();
    let code = unsafe {
        mallctl(
            cname.as_ptr(),
            value.as_mut_ptr() as *mut c_void,
            &mut len,
            ptr::null_mut(),
            0,
        )
    };
    if code != 0 {
        return Err(AllocatorError::from_code(code));
    }
    Ok(unsafe { value.assume_init() })
}

/// Write a fixed-size value.
pub(crate) fn write<T: Copy>(name: &str, value: T) -> Result<(), AllocatorError> {
    let cname = cstring(name)?;
    let mut value = value;
    let code = unsafe {
        mallctl(
            cname.as_ptr(),
            ptr::null_mut(),
            ptr::null_mut(),
            &mut value as *mut T as *mut c_void,
            mem::size_of::<T>(),
        )
    };
    if code != 0 {
        return Err(AllocatorError::from_code(code));
    }
    Ok(())
}

/// Invoke a name that takes no input and produces no output (a command).
pub(crate) fn exec(name: &str) -> Result<(), AllocatorError> {
    let cname = cstring(name)?;
    let code = unsafe {
        mallctl(
            cname.as_ptr(),
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null_mut(),
            0,
        )
    };
    if code != 0 {
        return Err(AllocatorError::from_code(code));
    }
    Ok(())
}

/// Flush jemalloc's cached statistics so subsequent reads are current.
pub(crate) fn advance_epoch() {
    let _ = write::<u64>("epoch", 1);
}

fn cstring(name: &str) -> Result<CString, AllocatorError> {
    CString::new(name).map_err(|_| AllocatorError::invalid("mallctl name contains NUL"))
}
