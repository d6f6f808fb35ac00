use std::io;

use thiserror::Error;

/// A native allocator or profiling control call failed.
///
/// `code` is the raw status returned by the allocator, `message` the
/// platform's string rendering of it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("allocator error {code}: {message}")]
pub struct AllocatorError {
    pub code: i32,
    pub message: String,
}

impl AllocatorError {
    pub(crate) fn from_code(code: i32) -> Self {
        AllocatorError {
            code,
            message: io::Error::from_raw_os_error(code).to_string(),
        }
    }

    pub(crate) fn invalid(message: &str) -> Self {
        AllocatorError {
            code: libc::EINVAL,
            message: message.to_string(),
        }
    }
}
