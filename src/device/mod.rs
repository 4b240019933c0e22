//! Device handle and kernel backends.
//!
//! `VideoBackend` has one method per kernel call the capture engine makes.
//! Two backends exist:
//! - `V4l2Backend`: a real device node through the `v4l` crate (Linux, `device-v4l2` feature)
//! - `StubBackend`: synthetic in-process device for `stub://` paths and tests
//!
//! `SystemBackend` picks one from the device path.

use std::io;
use std::ptr::NonNull;
use std::time::Duration;

use crate::error::{CaptureError, Result};
use crate::format::{CaptureFormat, FormatRequest};

#[cfg(target_os = "linux")]
#[cfg_attr(not(feature = "device-v4l2"), allow(dead_code))]
mod poll;
pub mod stub;
#[cfg(all(target_os = "linux", feature = "device-v4l2"))]
pub mod v4l2;

pub use stub::{StubBackend, StubConfig, StubLedger};
#[cfg(all(target_os = "linux", feature = "device-v4l2"))]
pub use v4l2::V4l2Backend;

/// Device identity and capability bits from the capability query.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub capabilities: u32,
}

impl Capabilities {
    pub const VIDEO_CAPTURE: u32 = 0x0000_0001;
    pub const STREAMING: u32 = 0x0400_0000;
    /// `device_caps` is filled in and describes this node alone.
    pub const DEVICE_CAPS: u32 = 0x8000_0000;

    /// Capability bits of the opened node: `device_caps` when the driver
    /// reports them, else the whole-device bits.
    pub fn node_bits(capabilities: u32, device_caps: u32) -> u32 {
        if capabilities & Self::DEVICE_CAPS != 0 {
            device_caps
        } else {
            capabilities
        }
    }

    pub fn can_capture(&self) -> bool {
        self.capabilities & Self::VIDEO_CAPTURE != 0
    }

    pub fn can_stream(&self) -> bool {
        self.capabilities & Self::STREAMING != 0
    }
}

/// Kernel-assigned size and mapping offset of one buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferLayout {
    pub length: u32,
    pub offset: u32,
}

/// A filled buffer handed back by the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: u32,
    pub sequence: u32,
    pub timestamp: Duration,
}

/// Outcome of a readiness wait that was not interrupted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
}

/// Kernel calls made by the capture engine.
///
/// Implementations report failures as `io::Error` carrying the OS error
/// code; the engine maps them onto `CaptureError`. A wait interrupted by a
/// signal must come back as `io::ErrorKind::Interrupted`.
pub trait VideoBackend {
    fn open(&mut self, path: &str) -> io::Result<()>;
    fn query_capabilities(&mut self) -> io::Result<Capabilities>;
    fn set_format(&mut self, request: &FormatRequest) -> io::Result<CaptureFormat>;
    /// Returns the number of buffers the driver granted. A count of zero frees them.
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;
    fn query_buffer(&mut self, index: u32) -> io::Result<BufferLayout>;
    /// Map buffer `index` read/write, shared with the kernel.
    fn map(&mut self, index: u32, layout: &BufferLayout) -> io::Result<NonNull<u8>>;
    /// Unmap a region previously returned by `map`.
    ///
    /// # Safety
    ///
    /// `base` and `length` must describe a live mapping from `map` on this
    /// backend, and no reference into it may outlive this call.
    unsafe fn unmap(&mut self, base: NonNull<u8>, length: usize) -> io::Result<()>;
    fn queue(&mut self, index: u32) -> io::Result<()>;
    fn dequeue(&mut self) -> io::Result<DequeuedBuffer>;
    fn stream_on(&mut self) -> io::Result<()>;
    fn stream_off(&mut self) -> io::Result<()>;
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<Readiness>;
    fn close(&mut self) -> io::Result<()>;
}

/// Owns the open descriptor (through its backend) for one device node.
///
/// The descriptor is closed exactly once: by `close`, or on drop if `close`
/// was never called.
pub struct DeviceHandle<B: VideoBackend> {
    backend: B,
    path: String,
    capabilities: Capabilities,
    open: bool,
}

impl<B: VideoBackend> DeviceHandle<B> {
    /// Open `path` non-blocking and check it is a streaming capture device.
    pub fn open_with(mut backend: B, path: &str) -> Result<Self> {
        backend.open(path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                CaptureError::DeviceNotFound {
                    path: path.to_string(),
                    source,
                }
            }
            _ => CaptureError::kernel("open", &source),
        })?;

        // From here on, an early return drops the handle, which closes it.
        let mut handle = Self {
            backend,
            path: path.to_string(),
            capabilities: Capabilities::default(),
            open: true,
        };
        handle.capabilities = handle.check_capabilities()?;

        log::info!(
            "DeviceHandle: opened {} ({}, driver {}, bus {})",
            handle.path,
            handle.capabilities.card,
            handle.capabilities.driver,
            handle.capabilities.bus_info
        );
        Ok(handle)
    }

    fn check_capabilities(&mut self) -> Result<Capabilities> {
        let caps = match self.backend.query_capabilities() {
            Ok(caps) => caps,
            Err(err) if err.raw_os_error() == Some(EINVAL) => {
                return Err(self.not_capture("V4L2 interface"));
            }
            Err(err) => return Err(CaptureError::kernel("VIDIOC_QUERYCAP", &err)),
        };
        if !caps.can_capture() {
            return Err(self.not_capture("video capture"));
        }
        if !caps.can_stream() {
            return Err(self.not_capture("streaming I/O"));
        }
        Ok(caps)
    }

    fn not_capture(&self, missing: &'static str) -> CaptureError {
        CaptureError::NotACaptureDevice {
            path: self.path.clone(),
            missing,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub(crate) fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Release the descriptor. Closing an already-closed handle is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.backend
            .close()
            .map_err(|err| CaptureError::kernel("close", &err))?;
        log::info!("DeviceHandle: closed {}", self.path);
        Ok(())
    }
}

impl<B: VideoBackend> Drop for DeviceHandle<B> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!("DeviceHandle: {}", err);
        }
    }
}

const EINVAL: i32 = 22;

/// Backend chosen from the device path: `stub://...` is synthetic, anything
/// else is a real V4L2 node.
pub enum SystemBackend {
    Stub(StubBackend),
    #[cfg(all(target_os = "linux", feature = "device-v4l2"))]
    V4l2(V4l2Backend),
}

impl SystemBackend {
    pub fn for_path(path: &str) -> Self {
        if path.starts_with(stub::STUB_SCHEME) {
            return SystemBackend::Stub(StubBackend::new(StubConfig::default()));
        }
        #[cfg(all(target_os = "linux", feature = "device-v4l2"))]
        {
            SystemBackend::V4l2(V4l2Backend::new())
        }
        #[cfg(not(all(target_os = "linux", feature = "device-v4l2")))]
        {
            log::warn!("SystemBackend: V4L2 support not built, no device at {path}");
            SystemBackend::Stub(StubBackend::new(StubConfig {
                present: false,
                ..StubConfig::default()
            }))
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $b:ident => $call:expr) => {
        match $self {
            SystemBackend::Stub($b) => $call,
            #[cfg(all(target_os = "linux", feature = "device-v4l2"))]
            SystemBackend::V4l2($b) => $call,
        }
    };
}

impl VideoBackend for SystemBackend {
    fn open(&mut self, path: &str) -> io::Result<()> {
        dispatch!(self, b => b.open(path))
    }

    fn query_capabilities(&mut self) -> io::Result<Capabilities> {
        dispatch!(self, b => b.query_capabilities())
    }

    fn set_format(&mut self, request: &FormatRequest) -> io::Result<CaptureFormat> {
        dispatch!(self, b => b.set_format(request))
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        dispatch!(self, b => b.request_buffers(count))
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<BufferLayout> {
        dispatch!(self, b => b.query_buffer(index))
    }

    fn map(&mut self, index: u32, layout: &BufferLayout) -> io::Result<NonNull<u8>> {
        dispatch!(self, b => b.map(index, layout))
    }

    unsafe fn unmap(&mut self, base: NonNull<u8>, length: usize) -> io::Result<()> {
        dispatch!(self, b => b.unmap(base, length))
    }

    fn queue(&mut self, index: u32) -> io::Result<()> {
        dispatch!(self, b => b.queue(index))
    }

    fn dequeue(&mut self) -> io::Result<DequeuedBuffer> {
        dispatch!(self, b => b.dequeue())
    }

    fn stream_on(&mut self) -> io::Result<()> {
        dispatch!(self, b => b.stream_on())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        dispatch!(self, b => b.stream_off())
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<Readiness> {
        dispatch!(self, b => b.wait_readable(timeout))
    }

    fn close(&mut self) -> io::Result<()> {
        dispatch!(self, b => b.close())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_is_idempotent() -> Result<()> {
        let backend = StubBackend::new(StubConfig::default());
        let ledger = backend.ledger();
        let mut handle = DeviceHandle::open_with(backend, "stub://cam")?;
        handle.close()?;
        handle.close()?;
        drop(handle);
        assert_eq!(ledger.opens(), 1);
        assert_eq!(ledger.closes(), 1);
        Ok(())
    }

    #[test]
    fn missing_streaming_bit_is_rejected_and_closed() {
        let backend = StubBackend::new(StubConfig {
            capabilities: Capabilities::VIDEO_CAPTURE,
            ..StubConfig::default()
        });
        let ledger = backend.ledger();
        let err = DeviceHandle::open_with(backend, "stub://cam").err();
        assert!(matches!(
            err,
            Some(CaptureError::NotACaptureDevice {
                missing: "streaming I/O",
                ..
            })
        ));
        assert_eq!(ledger.closes(), 1);
    }

    #[test]
    fn node_bits_prefer_device_caps() {
        // UVC metadata node: the device captures, this node does not.
        let whole =
            Capabilities::VIDEO_CAPTURE | Capabilities::STREAMING | Capabilities::DEVICE_CAPS;
        let node = 0x0080_0000 | Capabilities::STREAMING;
        let caps = Capabilities {
            capabilities: Capabilities::node_bits(whole, node),
            ..Capabilities::default()
        };
        assert!(!caps.can_capture());
        assert!(caps.can_stream());

        let legacy = Capabilities::VIDEO_CAPTURE | Capabilities::STREAMING;
        assert_eq!(Capabilities::node_bits(legacy, 0), legacy);
    }

    #[test]
    fn stub_paths_select_the_stub_backend() {
        assert!(matches!(
            SystemBackend::for_path("stub://front"),
            SystemBackend::Stub(_)
        ));
    }
}
