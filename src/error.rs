//! Error taxonomy for the capture core.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Errors surfaced by the capture core.
///
/// Every variant is fatal to the session except `CaptureTimeout`, which a
/// caller may choose to absorb and keep waiting (see `TimeoutPolicy`).
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The device node does not exist or cannot be opened.
    #[error("cannot open {path}: {source}")]
    DeviceNotFound {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The node opened, but it is not a streaming capture device.
    #[error("{path} is not usable for capture: missing {missing}")]
    NotACaptureDevice { path: String, missing: &'static str },

    /// The format-set call itself failed.
    #[error("device rejected format request: {source}")]
    DeviceRejectedFormat {
        #[source]
        source: io::Error,
    },

    /// The driver granted fewer buffers than streaming needs.
    #[error("insufficient buffer memory: requested {requested}, granted {granted}")]
    InsufficientBuffers { requested: u32, granted: u32 },

    /// Mapping buffer `index` into the address space failed.
    #[error("mapping buffer {index} failed: {source}")]
    MappingFailed {
        index: u32,
        #[source]
        source: io::Error,
    },

    /// No frame became ready within the wait timeout.
    #[error("no frame ready within {timeout:?}")]
    CaptureTimeout { timeout: Duration },

    /// Any other kernel call failed.
    #[error("{operation} failed with errno {code}")]
    KernelCallFailed { operation: &'static str, code: i32 },

    /// The streaming protocol was violated. Always a bug in the caller.
    #[error("invalid state for {operation}: {detail}")]
    InvalidState {
        operation: &'static str,
        detail: String,
    },
}

impl CaptureError {
    pub(crate) fn kernel(operation: &'static str, err: &io::Error) -> Self {
        CaptureError::KernelCallFailed {
            operation,
            code: err.raw_os_error().unwrap_or(-1),
        }
    }

    pub(crate) fn invalid_state(operation: &'static str, detail: impl Into<String>) -> Self {
        CaptureError::InvalidState {
            operation,
            detail: detail.into(),
        }
    }

    /// True when the session can keep going after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CaptureError::CaptureTimeout { .. })
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_are_recoverable() {
        let timeout = CaptureError::CaptureTimeout {
            timeout: Duration::from_secs(2),
        };
        assert!(timeout.is_recoverable());

        // EIO
        let kernel = CaptureError::kernel("VIDIOC_DQBUF", &io::Error::from_raw_os_error(5));
        assert!(!kernel.is_recoverable());
        assert_eq!(kernel.exit_code(), 1);
        assert_eq!(kernel.to_string(), "VIDIOC_DQBUF failed with errno 5");
    }

    #[test]
    fn kernel_error_without_errno_reports_minus_one() {
        let err = CaptureError::kernel("mmap", &io::Error::new(io::ErrorKind::Other, "boom"));
        match err {
            CaptureError::KernelCallFailed { operation, code } => {
                assert_eq!(operation, "mmap");
                assert_eq!(code, -1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
